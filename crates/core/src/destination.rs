//! Destination entity (a point of interest in the catalogue).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::DestinationId;

/// WGS84 position of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    latitude: f64,
    longitude: f64,
}

impl Coordinates {
    /// Validate and build a coordinate pair.
    pub fn new(latitude: f64, longitude: f64) -> DomainResult<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(DomainError::coordinates(format!("latitude {latitude}")));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(DomainError::coordinates(format!("longitude {longitude}")));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Both halves must be present or both absent.
    pub fn from_optional(latitude: Option<f64>, longitude: Option<f64>) -> DomainResult<Option<Self>> {
        match (latitude, longitude) {
            (Some(lat), Some(lng)) => Self::new(lat, lng).map(Some),
            (None, None) => Ok(None),
            _ => Err(DomainError::coordinates(
                "latitude and longitude must be provided together",
            )),
        }
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

/// A destination as stored locally.
///
/// `synced` is local bookkeeping only: it is cleared by every local edit and
/// set once the edit has reached the external mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub id: DestinationId,
    pub name: String,
    pub coordinates: Option<Coordinates>,
    pub category: Option<String>,
    pub description: Option<String>,
    pub website: Option<String>,
    /// Foreign file identifier of the destination's image on the mirror side.
    pub image_file_id: Option<String>,
    pub synced: bool,
    pub updated_at: DateTime<Utc>,
}

impl Destination {
    /// Create a new, unsynced destination.
    pub fn new(name: impl Into<String>) -> DomainResult<Self> {
        let name = normalize_name(name.into())?;
        Ok(Self {
            id: DestinationId::new(),
            name,
            coordinates: None,
            category: None,
            description: None,
            website: None,
            image_file_id: None,
            synced: false,
            updated_at: Utc::now(),
        })
    }

    pub fn with_id(mut self, id: DestinationId) -> Self {
        self.id = id;
        self
    }

    pub fn with_coordinates(mut self, coordinates: Coordinates) -> Self {
        self.coordinates = Some(coordinates);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_website(mut self, website: impl Into<String>) -> Self {
        self.website = Some(website.into());
        self
    }

    pub fn with_image_file_id(mut self, file_id: impl Into<String>) -> Self {
        self.image_file_id = Some(file_id.into());
        self
    }

    /// Rename the destination. Returns the previous name.
    pub fn rename(&mut self, name: impl Into<String>) -> DomainResult<String> {
        let name = normalize_name(name.into())?;
        let previous = std::mem::replace(&mut self.name, name);
        self.touch();
        Ok(previous)
    }

    /// Record a local edit: the destination now differs from the mirror.
    pub fn touch(&mut self) {
        self.synced = false;
        self.updated_at = Utc::now();
    }

    pub fn mark_synced(&mut self) {
        self.synced = true;
    }
}

fn normalize_name(name: String) -> DomainResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(DomainError::validation("destination name must not be blank"));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn blank_names_are_rejected() {
        assert!(matches!(
            Destination::new("   "),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn names_are_trimmed() {
        let d = Destination::new("  Brandywine Falls ").unwrap();
        assert_eq!(d.name, "Brandywine Falls");
        assert!(!d.synced);
    }

    #[test]
    fn rename_returns_previous_name_and_clears_synced() {
        let mut d = Destination::new("Beaver Marsh").unwrap();
        d.mark_synced();
        let previous = d.rename("Beaver Marsh Boardwalk").unwrap();
        assert_eq!(previous, "Beaver Marsh");
        assert_eq!(d.name, "Beaver Marsh Boardwalk");
        assert!(!d.synced);
    }

    #[test]
    fn half_coordinates_are_rejected() {
        assert!(Coordinates::from_optional(Some(41.2), None).is_err());
        assert_eq!(Coordinates::from_optional(None, None).unwrap(), None);
    }

    proptest! {
        /// Property: any in-range pair is accepted and preserved exactly.
        #[test]
        fn in_range_coordinates_are_accepted(lat in -90.0f64..=90.0, lng in -180.0f64..=180.0) {
            let c = Coordinates::new(lat, lng).unwrap();
            prop_assert_eq!(c.latitude(), lat);
            prop_assert_eq!(c.longitude(), lng);
        }

        /// Property: latitudes beyond the poles are always rejected.
        #[test]
        fn out_of_range_latitude_is_rejected(lat in 90.0001f64..1.0e6, lng in -180.0f64..=180.0) {
            prop_assert!(Coordinates::new(lat, lng).is_err());
            prop_assert!(Coordinates::new(-lat, lng).is_err());
        }
    }
}
