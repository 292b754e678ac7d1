//! Configuration loading and representation.
//!
//! Everything is read from environment variables once at process start.
//! Parsing goes through a lookup function so it can be exercised without
//! touching the real process environment.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::retry::CallPolicy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} is required: {reason}")]
    Missing { var: String, reason: String },

    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
}

/// Which mirror adapter to wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorKind {
    /// No mirror configured: sync actions fail with a configuration error.
    Unconfigured,
    /// Process-local mirror, for development.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorConfig {
    pub kind: MirrorKind,
    /// Identity of the mirror target, used for the single-flight lease.
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoint {
    pub name: String,
    pub url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvidersConfig {
    pub primary: Option<ProviderEndpoint>,
    pub fallback: Option<ProviderEndpoint>,
    pub primary_request_limit: u64,
    pub rate_limit_cooldown: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobsConfig {
    /// One unit is admitted per interval.
    pub admission_interval: Duration,
    /// UTC hour of the daily news collection run; `None` disables it.
    pub daily_run_hour: Option<u32>,
    /// Whether cancelled jobs are resumed at startup like crashed ones.
    pub resume_cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// `None` selects in-memory stores.
    pub database_url: Option<String>,
    pub mirror: MirrorConfig,
    pub jobs: JobsConfig,
    pub calls: CallPolicy,
    /// Periodic reconcile; `None` means manual only.
    pub reconcile_interval: Option<Duration>,
    pub providers: ProvidersConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| {
            lookup(var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let bind_addr = parse_or(&get, "ROTV_BIND_ADDR", "0.0.0.0:8080".parse().ok())?;
        let bind_addr = bind_addr.ok_or_else(|| ConfigError::Missing {
            var: "ROTV_BIND_ADDR".into(),
            reason: "no bind address".into(),
        })?;

        let mirror_kind = match get("ROTV_MIRROR").as_deref() {
            None => MirrorKind::Unconfigured,
            Some("memory") => MirrorKind::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "ROTV_MIRROR".into(),
                    value: other.into(),
                    reason: "expected `memory`".into(),
                });
            }
        };
        let mirror = MirrorConfig {
            kind: mirror_kind,
            target: get("ROTV_MIRROR_TARGET").unwrap_or_else(|| "destinations-sheet".into()),
        };

        let admission_ms: u64 = parse_or(&get, "ROTV_JOB_ADMISSION_MS", Some(1000))?.unwrap_or(1000);
        let daily_run_hour = match get("ROTV_DAILY_RUN_HOUR").as_deref() {
            Some("off") => None,
            Some(raw) => {
                let hour: u32 = parse_value("ROTV_DAILY_RUN_HOUR", raw)?;
                if hour > 23 {
                    return Err(ConfigError::Invalid {
                        var: "ROTV_DAILY_RUN_HOUR".into(),
                        value: raw.into(),
                        reason: "hour must be 0-23".into(),
                    });
                }
                Some(hour)
            }
            None => Some(6),
        };
        let jobs = JobsConfig {
            admission_interval: Duration::from_millis(admission_ms),
            daily_run_hour,
            resume_cancelled: parse_or(&get, "ROTV_RESUME_CANCELLED", Some(false))?.unwrap_or(false),
        };

        let timeout_secs: u64 = parse_or(&get, "ROTV_CALL_TIMEOUT_SECS", Some(30))?.unwrap_or(30);
        let retries: u32 = parse_or(&get, "ROTV_CALL_RETRIES", Some(1))?.unwrap_or(1);
        let calls = CallPolicy::new(Duration::from_secs(timeout_secs), retries);

        let reconcile_interval = parse_or::<u64, _>(&get, "ROTV_RECONCILE_INTERVAL_SECS", None)?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let providers = ProvidersConfig {
            primary: provider_endpoint(&get, "ROTV_PRIMARY_PROVIDER")?,
            fallback: provider_endpoint(&get, "ROTV_FALLBACK_PROVIDER")?,
            primary_request_limit: parse_or(&get, "ROTV_PRIMARY_REQUEST_LIMIT", Some(0))?.unwrap_or(0),
            rate_limit_cooldown: Duration::from_secs(
                parse_or(&get, "ROTV_RATE_LIMIT_COOLDOWN_SECS", Some(60))?.unwrap_or(60),
            ),
        };

        Ok(Self {
            bind_addr,
            database_url: get("DATABASE_URL"),
            mirror,
            jobs,
            calls,
            reconcile_interval,
            providers,
        })
    }
}

fn provider_endpoint<G>(get: &G, var: &str) -> Result<Option<ProviderEndpoint>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(name) = get(var) else {
        return Ok(None);
    };
    let prefix = format!("ROTV_PROVIDER_{}", name.to_ascii_uppercase().replace('-', "_"));
    let url_var = format!("{prefix}_URL");
    let url = get(&url_var).ok_or_else(|| ConfigError::Missing {
        var: url_var.clone(),
        reason: format!("{var}={name} needs an endpoint"),
    })?;

    Ok(Some(ProviderEndpoint {
        name,
        url,
        api_key: get(&format!("{prefix}_API_KEY")),
    }))
}

fn parse_or<T, G>(get: &G, var: &str, default: Option<T>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(raw) => parse_value(var, &raw).map(Some),
        None => Ok(default),
    }
}

fn parse_value<T>(var: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
        var: var.into(),
        value: raw.into(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_without_any_variables() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.bind_addr.port(), 8080);
        assert_eq!(cfg.database_url, None);
        assert_eq!(cfg.mirror.kind, MirrorKind::Unconfigured);
        assert_eq!(cfg.mirror.target, "destinations-sheet");
        assert_eq!(cfg.jobs.admission_interval, Duration::from_secs(1));
        assert_eq!(cfg.jobs.daily_run_hour, Some(6));
        assert!(!cfg.jobs.resume_cancelled);
        assert_eq!(cfg.calls.timeout, Duration::from_secs(30));
        assert_eq!(cfg.calls.retries, 1);
        assert_eq!(cfg.reconcile_interval, None);
        assert_eq!(cfg.providers.primary, None);
    }

    #[test]
    fn provider_endpoints_are_resolved_by_name() {
        let cfg = config(&[
            ("ROTV_PRIMARY_PROVIDER", "perplexity"),
            ("ROTV_PROVIDER_PERPLEXITY_URL", "http://localhost:9000/search"),
            ("ROTV_PROVIDER_PERPLEXITY_API_KEY", "secret"),
            ("ROTV_PRIMARY_REQUEST_LIMIT", "50"),
        ])
        .unwrap();

        let primary = cfg.providers.primary.unwrap();
        assert_eq!(primary.name, "perplexity");
        assert_eq!(primary.api_key.as_deref(), Some("secret"));
        assert_eq!(cfg.providers.primary_request_limit, 50);
    }

    #[test]
    fn provider_without_url_is_rejected() {
        let err = config(&[("ROTV_FALLBACK_PROVIDER", "gemini")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { var, .. } if var == "ROTV_PROVIDER_GEMINI_URL"));
    }

    #[test]
    fn daily_trigger_can_be_disabled_or_bounded() {
        assert_eq!(
            config(&[("ROTV_DAILY_RUN_HOUR", "off")]).unwrap().jobs.daily_run_hour,
            None
        );
        assert!(config(&[("ROTV_DAILY_RUN_HOUR", "24")]).is_err());
    }

    #[test]
    fn invalid_numbers_name_the_variable() {
        let err = config(&[("ROTV_JOB_ADMISSION_MS", "fast")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var, .. } if var == "ROTV_JOB_ADMISSION_MS"));
    }

    #[test]
    fn zero_reconcile_interval_disables_worker() {
        let cfg = config(&[("ROTV_RECONCILE_INTERVAL_SECS", "0"), ("ROTV_MIRROR", "memory")]).unwrap();
        assert_eq!(cfg.reconcile_interval, None);
        assert_eq!(cfg.mirror.kind, MirrorKind::Memory);
    }
}
