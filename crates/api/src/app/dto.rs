//! Request/response DTOs.

use serde::{Deserialize, Serialize};

use rotv_core::DestinationId;

#[derive(Debug, Default, Deserialize)]
pub struct SubmitJobRequest {
    /// Absent means every local destination.
    pub unit_ids: Option<Vec<DestinationId>>,
    pub job_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

impl ListQuery {
    pub const DEFAULT_LIMIT: usize = 20;
    pub const MAX_LIMIT: usize = 200;

    pub fn limit(&self) -> usize {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }
}

#[derive(Debug, Serialize)]
pub struct DiscardResponse {
    pub operation_id: String,
    pub discarded: bool,
}
