//! HTTP API: admin surface over the sync and job core.

pub mod app;
