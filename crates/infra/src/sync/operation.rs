//! Pending mirror operations and their typed payloads.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use thiserror::Error;
use uuid::Uuid;

use rotv_core::{Destination, EnrichmentRecord};

use super::schema::{DestinationRow, EnrichmentRow};

/// Unique operation identifier (UUIDv7, so ids sort by creation time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for OperationKind {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(PayloadError::Malformed(format!("unknown operation kind {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Destination,
    Enrichment,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Destination => "destination",
            Self::Enrichment => "enrichment",
        }
    }
}

impl FromStr for EntityType {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "destination" => Ok(Self::Destination),
            "enrichment" => Ok(Self::Enrichment),
            other => Err(PayloadError::Malformed(format!("unknown entity type {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("payload has no mirror key")]
    MissingKey,

    #[error("{0} operation carries no row")]
    MissingRow(&'static str),

    #[error("invalid row: {0}")]
    InvalidRow(String),
}

/// A validated, typed mirror row.
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorRecord {
    Destination(DestinationRow),
    Enrichment(EnrichmentRow),
}

impl MirrorRecord {
    pub fn to_cells(&self) -> Vec<String> {
        match self {
            Self::Destination(row) => row.to_cells(),
            Self::Enrichment(row) => row.to_cells(),
        }
    }
}

/// Payload of a pending operation after validation.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedOperation {
    /// Natural key of the mirror row the operation targets.
    pub key: String,
    /// `None` for deletes.
    pub row: Option<MirrorRecord>,
}

/// An operation before it has been given an id and enqueue time.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub kind: OperationKind,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub payload: JsonValue,
}

impl OperationRequest {
    /// Snapshot a destination edit.
    ///
    /// `previous_name` is the key the mirror row is currently stored under
    /// when the edit renamed the destination.
    pub fn destination(
        kind: OperationKind,
        destination: &Destination,
        previous_name: Option<&str>,
    ) -> Self {
        let key = previous_name.unwrap_or(&destination.name);
        let row = match kind {
            OperationKind::Delete => JsonValue::Null,
            _ => json!(DestinationRow::from_destination(destination)),
        };
        Self {
            kind,
            entity_type: EntityType::Destination,
            entity_id: *destination.id.as_uuid(),
            payload: json!({ "key": key, "row": row }),
        }
    }

    /// Snapshot an enrichment result for the mirror's enrichment collection.
    pub fn enrichment(record: &EnrichmentRecord, destination_name: &str) -> Self {
        let row = EnrichmentRow::from_record(record, destination_name);
        Self {
            kind: OperationKind::Update,
            entity_type: EntityType::Enrichment,
            entity_id: *record.destination_id.as_uuid(),
            payload: json!({ "key": record.destination_id.to_string(), "row": row }),
        }
    }
}

/// A queued mutation. Never mutated after enqueue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub payload: JsonValue,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingOperation {
    pub fn from_request(request: OperationRequest) -> Self {
        Self {
            id: OperationId::new(),
            kind: request.kind,
            entity_type: request.entity_type,
            entity_id: request.entity_id,
            payload: request.payload,
            enqueued_at: Utc::now(),
        }
    }

    /// Validate the stored payload against the operation's entity type.
    pub fn decode(&self) -> Result<DecodedOperation, PayloadError> {
        let obj = self
            .payload
            .as_object()
            .ok_or_else(|| PayloadError::Malformed("payload is not an object".into()))?;

        let key = obj
            .get("key")
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(PayloadError::MissingKey)?
            .to_string();

        if self.kind == OperationKind::Delete {
            return Ok(DecodedOperation { key, row: None });
        }

        let raw = match obj.get("row") {
            Some(JsonValue::Null) | None => return Err(PayloadError::MissingRow(self.kind.as_str())),
            Some(raw) => raw.clone(),
        };

        let row = match self.entity_type {
            EntityType::Destination => {
                let row: DestinationRow = serde_json::from_value(raw)
                    .map_err(|e| PayloadError::InvalidRow(e.to_string()))?;
                row.validate().map_err(|e| PayloadError::InvalidRow(e.to_string()))?;
                MirrorRecord::Destination(row)
            }
            EntityType::Enrichment => {
                let row: EnrichmentRow = serde_json::from_value(raw)
                    .map_err(|e| PayloadError::InvalidRow(e.to_string()))?;
                MirrorRecord::Enrichment(row)
            }
        };

        Ok(DecodedOperation { key, row: Some(row) })
    }
}

/// A stored operation whose columns no longer describe a valid operation.
/// It stays queued until an operator discards it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadableOperation {
    pub id: OperationId,
    /// Present when the entity column itself was readable.
    pub entity_id: Option<Uuid>,
    pub reason: String,
}

/// One row of the queue as read back from storage.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEntry {
    Ready(PendingOperation),
    Unreadable(UnreadableOperation),
}

impl From<PendingOperation> for QueueEntry {
    fn from(op: PendingOperation) -> Self {
        Self::Ready(op)
    }
}

impl From<UnreadableOperation> for QueueEntry {
    fn from(op: UnreadableOperation) -> Self {
        Self::Unreadable(op)
    }
}

impl QueueEntry {
    pub fn id(&self) -> OperationId {
        match self {
            Self::Ready(op) => op.id,
            Self::Unreadable(op) => op.id,
        }
    }

    pub fn entity_id(&self) -> Option<Uuid> {
        match self {
            Self::Ready(op) => Some(op.entity_id),
            Self::Unreadable(op) => op.entity_id,
        }
    }

    pub fn into_ready(self) -> Option<PendingOperation> {
        match self {
            Self::Ready(op) => Some(op),
            Self::Unreadable(_) => None,
        }
    }
}

/// Raw column values of a queued operation.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredOperation {
    pub id: OperationId,
    pub kind: String,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub payload: JsonValue,
    pub enqueued_at: DateTime<Utc>,
}

impl StoredOperation {
    /// Parse the tag columns. A bad tag makes only this entry unreadable.
    pub fn into_entry(self) -> QueueEntry {
        let tags = self
            .kind
            .parse::<OperationKind>()
            .and_then(|kind| Ok((kind, self.entity_type.parse::<EntityType>()?)));
        match tags {
            Ok((kind, entity_type)) => QueueEntry::Ready(PendingOperation {
                id: self.id,
                kind,
                entity_type,
                entity_id: self.entity_id,
                payload: self.payload,
                enqueued_at: self.enqueued_at,
            }),
            Err(err) => QueueEntry::Unreadable(UnreadableOperation {
                id: self.id,
                entity_id: Some(self.entity_id),
                reason: err.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rotv_core::Coordinates;

    fn destination() -> Destination {
        Destination::new("Brandywine Falls")
            .unwrap()
            .with_coordinates(Coordinates::new(41.2768, -81.539).unwrap())
    }

    #[test]
    fn update_after_rename_targets_previous_key() {
        let d = destination();
        let op = PendingOperation::from_request(OperationRequest::destination(
            OperationKind::Update,
            &d,
            Some("Brandywine Falls Trail"),
        ));

        let decoded = op.decode().unwrap();
        assert_eq!(decoded.key, "Brandywine Falls Trail");
        match decoded.row {
            Some(MirrorRecord::Destination(row)) => assert_eq!(row.name, "Brandywine Falls"),
            other => panic!("unexpected row: {other:?}"),
        }
    }

    #[test]
    fn delete_carries_only_the_key() {
        let op = PendingOperation::from_request(OperationRequest::destination(
            OperationKind::Delete,
            &destination(),
            None,
        ));
        assert_eq!(op.payload["row"], JsonValue::Null);
        assert_eq!(op.decode().unwrap().row, None);
    }

    #[test]
    fn malformed_payloads_fail_at_decode() {
        let mut op = PendingOperation::from_request(OperationRequest::destination(
            OperationKind::Insert,
            &destination(),
            None,
        ));

        op.payload = json!("not an object");
        assert!(matches!(op.decode(), Err(PayloadError::Malformed(_))));

        op.payload = json!({ "key": "  ", "row": {} });
        assert_eq!(op.decode(), Err(PayloadError::MissingKey));

        op.payload = json!({ "key": "x", "row": null });
        assert_eq!(op.decode(), Err(PayloadError::MissingRow("insert")));

        op.payload = json!({ "key": "x", "row": { "name": 12 } });
        assert!(matches!(op.decode(), Err(PayloadError::InvalidRow(_))));
    }

    #[test]
    fn kinds_round_trip_through_storage_names() {
        for kind in [OperationKind::Insert, OperationKind::Update, OperationKind::Delete] {
            assert_eq!(kind.as_str().parse::<OperationKind>().unwrap(), kind);
        }
        assert!("upsert".parse::<OperationKind>().is_err());
    }
    #[test]
    fn unknown_stored_tags_make_only_that_entry_unreadable() {
        let op = PendingOperation::from_request(OperationRequest::destination(
            OperationKind::Insert,
            &destination(),
            None,
        ));
        let stored = StoredOperation {
            id: op.id,
            kind: op.kind.as_str().to_string(),
            entity_type: op.entity_type.as_str().to_string(),
            entity_id: op.entity_id,
            payload: op.payload.clone(),
            enqueued_at: op.enqueued_at,
        };
        assert_eq!(stored.clone().into_entry(), QueueEntry::Ready(op.clone()));

        let bad_kind = StoredOperation {
            kind: "upsert".into(),
            ..stored.clone()
        };
        match bad_kind.into_entry() {
            QueueEntry::Unreadable(entry) => {
                assert_eq!(entry.id, op.id);
                assert_eq!(entry.entity_id, Some(op.entity_id));
                assert!(entry.reason.contains("upsert"), "{}", entry.reason);
            }
            other => panic!("expected unreadable entry, got {other:?}"),
        }

        let bad_type = StoredOperation {
            entity_type: "trail".into(),
            ..stored
        };
        assert!(bad_type.into_entry().into_ready().is_none());
    }
}
