//! Wire types for the sync protocol.
//!
//! Change payloads are a tagged union with one variant per entity type,
//! validated at the deserialization boundary: `RawChange` is what peers
//! send, `ChangeRecord` is what the engine works with. A `RawChange` that
//! fails validation becomes a per-record error, never a batch failure.

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::models::{AudioFile, Note, NoteAttachment, NoteTag, Tag};
use crate::validation::validate_id_hex;

/// Protocol version sent in handshakes. Any value is currently accepted,
/// but the field itself is required.
pub const PROTOCOL_VERSION: &str = "1.0";

/// What a change record does to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl std::str::FromStr for Operation {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(SyncError::validation(
                "operation",
                format!("unknown operation: {}", other),
            )),
        }
    }
}

/// Typed per-entity change payload. The `entity_type`/`data` encoding keeps
/// the JSON shape peers exchanged before the payloads were typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity_type", content = "data", rename_all = "snake_case")]
pub enum EntityChange {
    Note(Note),
    Tag(Tag),
    NoteTag(NoteTag),
    AudioFile(AudioFile),
    NoteAttachment(NoteAttachment),
}

impl EntityChange {
    pub fn entity_type(&self) -> &'static str {
        match self {
            EntityChange::Note(_) => "note",
            EntityChange::Tag(_) => "tag",
            EntityChange::NoteTag(_) => "note_tag",
            EntityChange::AudioFile(_) => "audio_file",
            EntityChange::NoteAttachment(_) => "note_attachment",
        }
    }
}

/// A validated change record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Hex entity id; for note_tags the composite "note_id:tag_id"
    pub entity_id: String,
    pub operation: Operation,
    #[serde(flatten)]
    pub entity: EntityChange,
    /// Effective timestamp of the mutation (Unix seconds)
    pub timestamp: i64,
    /// Device that originated the change
    pub device_id: String,
    pub device_name: Option<String>,
}

impl ChangeRecord {
    /// Short id prefix for log lines
    pub fn short_id(&self) -> &str {
        let len = crate::validation::UUID_SHORT_LEN.min(self.entity_id.len());
        &self.entity_id[..len]
    }
}

/// A change record as received from a peer, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawChange {
    pub entity_type: String,
    pub entity_id: String,
    pub operation: String,
    pub data: serde_json::Value,
    pub timestamp: i64,
    pub device_id: String,
    #[serde(default)]
    pub device_name: Option<String>,
}

impl RawChange {
    /// Validate the record into a typed `ChangeRecord`.
    ///
    /// Rejects unknown entity types and operations, malformed ids, and
    /// payloads missing required fields.
    pub fn validate(&self) -> SyncResult<ChangeRecord> {
        let operation: Operation = self.operation.parse()?;
        validate_id_hex(&self.device_id, "device_id")?;

        let entity = match self.entity_type.as_str() {
            "note" => EntityChange::Note(serde_json::from_value(self.data.clone())?),
            "tag" => EntityChange::Tag(serde_json::from_value(self.data.clone())?),
            "note_tag" => EntityChange::NoteTag(serde_json::from_value(self.data.clone())?),
            "audio_file" => EntityChange::AudioFile(serde_json::from_value(self.data.clone())?),
            "note_attachment" => {
                EntityChange::NoteAttachment(serde_json::from_value(self.data.clone())?)
            }
            other => {
                return Err(SyncError::validation(
                    "entity_type",
                    format!("unknown entity type: {}", other),
                ))
            }
        };

        // The envelope id must agree with the payload
        let payload_id = match &entity {
            EntityChange::Note(n) => n.id_hex(),
            EntityChange::Tag(t) => t.id_hex(),
            EntityChange::NoteTag(nt) => nt.entity_id(),
            EntityChange::AudioFile(af) => af.id_hex(),
            EntityChange::NoteAttachment(na) => na.id_hex(),
        };
        let envelope_id = self.entity_id.replace('-', "").to_lowercase();
        if envelope_id != payload_id {
            return Err(SyncError::validation(
                "entity_id",
                format!("envelope id {} does not match payload", self.entity_id),
            ));
        }

        Ok(ChangeRecord {
            entity_id: payload_id,
            operation,
            entity,
            timestamp: self.timestamp,
            device_id: self.device_id.to_lowercase(),
            device_name: self.device_name.clone(),
        })
    }
}

// Endpoint request/response bodies

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub device_id: String,
    pub device_name: String,
    pub protocol_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub device_id: String,
    pub device_name: String,
    pub protocol_version: String,
    /// This side's cursor for the requesting peer, if any
    pub last_sync_timestamp: Option<i64>,
    pub server_timestamp: i64,
    /// Whether this side has audio storage configured
    pub supports_audio: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub changes: Vec<ChangeRecord>,
    pub from_timestamp: Option<i64>,
    pub to_timestamp: Option<i64>,
    pub device_id: String,
    pub device_name: String,
    pub is_complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyRequest {
    pub device_id: String,
    pub device_name: String,
    pub changes: Vec<RawChange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyResponse {
    pub applied: i64,
    pub conflicts: i64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub device_id: String,
    pub device_name: String,
    pub protocol_version: String,
    pub supports_audio: bool,
}

/// Complete dataset snapshot for initial sync. Includes tombstoned rows so
/// a new peer learns about deletions too; note_tags are active rows only
/// (removals never synchronize).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullDataset {
    pub notes: Vec<Note>,
    pub tags: Vec<Tag>,
    pub note_tags: Vec<NoteTag>,
    pub audio_files: Vec<AudioFile>,
    pub note_attachments: Vec<NoteAttachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullSyncResponse {
    #[serde(flatten)]
    pub dataset: FullDataset,
    pub device_id: String,
    pub device_name: String,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Note;
    use uuid::Uuid;

    fn sample_raw_note(op: &str) -> RawChange {
        let note = Note::new("hello".to_string());
        RawChange {
            entity_type: "note".to_string(),
            entity_id: note.id_hex(),
            operation: op.to_string(),
            data: serde_json::to_value(&note).unwrap(),
            timestamp: note.created_at,
            device_id: Uuid::now_v7().simple().to_string(),
            device_name: Some("Test Device".to_string()),
        }
    }

    #[test]
    fn test_validate_note_create() {
        let raw = sample_raw_note("create");
        let record = raw.validate().unwrap();
        assert_eq!(record.operation, Operation::Create);
        assert!(matches!(record.entity, EntityChange::Note(_)));
    }

    #[test]
    fn test_validate_rejects_unknown_entity_type() {
        let mut raw = sample_raw_note("create");
        raw.entity_type = "spreadsheet".to_string();
        let err = raw.validate().unwrap_err();
        assert!(err.to_string().contains("unknown entity type"));
    }

    #[test]
    fn test_validate_rejects_unknown_operation() {
        let raw = sample_raw_note("upsert");
        assert!(raw.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_mismatched_envelope_id() {
        let mut raw = sample_raw_note("create");
        raw.entity_id = Uuid::now_v7().simple().to_string();
        assert!(raw.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_malformed_payload() {
        let mut raw = sample_raw_note("create");
        raw.data = serde_json::json!({"content": "missing id"});
        assert!(raw.validate().is_err());
    }

    #[test]
    fn test_change_record_wire_shape_matches_raw() {
        let raw = sample_raw_note("update");
        let record = raw.validate().unwrap();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["entity_type"], "note");
        assert_eq!(json["operation"], "update");
        assert!(json["data"].is_object());
        // And it round-trips through the raw form
        let reparsed: RawChange = serde_json::from_value(json).unwrap();
        assert_eq!(reparsed.validate().unwrap(), record);
    }
}
