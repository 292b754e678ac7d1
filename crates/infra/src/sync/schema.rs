//! Mirror collection layouts and row conversions.
//!
//! Column 0 of every collection is the natural key the mirror looks rows up by.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rotv_core::{Coordinates, Destination, DestinationId, DomainError, EnrichmentRecord};

pub const DESTINATIONS_COLLECTION: &str = "Destinations";
pub const ENRICHMENT_COLLECTION: &str = "Enrichment";

pub const DESTINATION_HEADERS: [&str; 9] = [
    "Name",
    "ID",
    "Latitude",
    "Longitude",
    "Category",
    "Description",
    "Website",
    "Image File ID",
    "Updated At",
];

pub const ENRICHMENT_HEADERS: [&str; 6] = [
    "Destination ID",
    "Destination",
    "Provider",
    "Results Found",
    "Sources",
    "Collected At",
];

pub fn headers(columns: &[&str]) -> Vec<String> {
    columns.iter().map(|c| c.to_string()).collect()
}

/// A mirror row that could not be imported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowError {
    /// 1-based position among the data rows (header excluded).
    pub row: usize,
    pub key: Option<String>,
    pub error: String,
}

/// Destination as laid out on the mirror. `synced` is local-only and absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationRow {
    pub id: DestinationId,
    pub name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub category: Option<String>,
    pub description: Option<String>,
    pub website: Option<String>,
    pub image_file_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DestinationRow {
    pub fn from_destination(d: &Destination) -> Self {
        Self {
            id: d.id,
            name: d.name.clone(),
            latitude: d.coordinates.map(|c| c.latitude()),
            longitude: d.coordinates.map(|c| c.longitude()),
            category: d.category.clone(),
            description: d.description.clone(),
            website: d.website.clone(),
            image_file_id: d.image_file_id.clone(),
            updated_at: d.updated_at,
        }
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("destination name must not be blank"));
        }
        Coordinates::from_optional(self.latitude, self.longitude).map(|_| ())
    }

    pub fn to_cells(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.id.to_string(),
            self.latitude.map(|v| v.to_string()).unwrap_or_default(),
            self.longitude.map(|v| v.to_string()).unwrap_or_default(),
            self.category.clone().unwrap_or_default(),
            self.description.clone().unwrap_or_default(),
            self.website.clone().unwrap_or_default(),
            self.image_file_id.clone().unwrap_or_default(),
            self.updated_at.to_rfc3339(),
        ]
    }
}

fn cell(cells: &[String], index: usize) -> Option<&str> {
    cells.get(index).map(|c| c.trim()).filter(|c| !c.is_empty())
}

fn coordinate(cells: &[String], index: usize, label: &str) -> Result<Option<f64>, DomainError> {
    cell(cells, index)
        .map(|raw| {
            raw.parse::<f64>()
                .map_err(|_| DomainError::coordinates(format!("{label} {raw:?} is not a number")))
        })
        .transpose()
}

/// Rebuild a local destination from a mirror row.
///
/// The `ID` column is reused when it parses; otherwise a fresh id is minted.
/// The result is marked synced since it mirrors the remote state.
pub fn destination_from_cells(cells: &[String]) -> Result<Destination, DomainError> {
    let name = cell(cells, 0).unwrap_or_default();
    let mut destination = Destination::new(name)?;

    if let Some(id) = cell(cells, 1).and_then(|raw| raw.parse::<DestinationId>().ok()) {
        destination = destination.with_id(id);
    }

    let latitude = coordinate(cells, 2, "latitude")?;
    let longitude = coordinate(cells, 3, "longitude")?;
    destination.coordinates = Coordinates::from_optional(latitude, longitude)?;

    destination.category = cell(cells, 4).map(str::to_string);
    destination.description = cell(cells, 5).map(str::to_string);
    destination.website = cell(cells, 6).map(str::to_string);
    destination.image_file_id = cell(cells, 7).map(str::to_string);
    if let Some(updated_at) = cell(cells, 8).and_then(|raw| DateTime::parse_from_rfc3339(raw).ok()) {
        destination.updated_at = updated_at.with_timezone(&Utc);
    }
    destination.mark_synced();

    Ok(destination)
}

/// Enrichment result as laid out on the mirror, keyed by destination id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRow {
    pub destination_id: DestinationId,
    pub destination_name: String,
    pub provider: String,
    pub results_found: u32,
    pub sources: Vec<String>,
    pub collected_at: DateTime<Utc>,
}

impl EnrichmentRow {
    pub fn from_record(record: &EnrichmentRecord, destination_name: &str) -> Self {
        Self {
            destination_id: record.destination_id,
            destination_name: destination_name.to_string(),
            provider: record.provider.clone(),
            results_found: record.results_found,
            sources: record.sources.clone(),
            collected_at: record.collected_at,
        }
    }

    pub fn to_cells(&self) -> Vec<String> {
        vec![
            self.destination_id.to_string(),
            self.destination_name.clone(),
            self.provider.clone(),
            self.results_found.to_string(),
            self.sources.join("\n"),
            self.collected_at.to_rfc3339(),
        ]
    }
}
