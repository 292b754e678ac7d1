//! `rotv-core`: domain building blocks for the destination catalogue.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the destination entity, and enrichment records produced by the
//! news collection job.

pub mod destination;
pub mod enrichment;
pub mod error;
pub mod id;

pub use destination::{Coordinates, Destination};
pub use enrichment::EnrichmentRecord;
pub use error::{DomainError, DomainResult};
pub use id::DestinationId;
