//! Data models for Recall.
//!
//! Core entities: Note, Tag, NoteTag, AudioFile, NoteAttachment.
//! Ids are UUID7, stored as 16 bytes in SQLite and serialized as 32-char
//! simple hex strings on the wire. Timestamps are Unix seconds, accurate
//! to the second; `deleted_at` is a tombstone, never a physical delete.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::validation::{hex_uuid, hex_uuid_opt};

/// Attachment kind currently synchronized. Kept as a string column so
/// future kinds do not need a schema migration.
pub const ATTACHMENT_TYPE_AUDIO: &str = "audio";

/// A note: text content plus creation/modification/deletion metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    #[serde(with = "hex_uuid")]
    pub id: Uuid,
    pub created_at: i64,
    pub content: String,
    /// None until the first local mutation; strictly increases afterwards
    pub modified_at: Option<i64>,
    /// Tombstone; set instead of deleting the row
    pub deleted_at: Option<i64>,
}

impl Note {
    pub fn new(content: String) -> Self {
        Self {
            id: Uuid::now_v7(),
            created_at: Utc::now().timestamp(),
            content,
            modified_at: None,
            deleted_at: None,
        }
    }

    pub fn id_hex(&self) -> String {
        self.id.simple().to_string()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A tag in the hierarchical tag tree. `parent_id == None` means root.
///
/// The ancestor chain is guaranteed acyclic by an explicit parent walk at
/// insert time (see `Store::create_tag`), not by the type system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(with = "hex_uuid")]
    pub id: Uuid,
    pub name: String,
    #[serde(default, with = "hex_uuid_opt")]
    pub parent_id: Option<Uuid>,
    pub created_at: i64,
    pub modified_at: Option<i64>,
}

impl Tag {
    pub fn new(name: String, parent_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name,
            parent_id,
            created_at: Utc::now().timestamp(),
            modified_at: None,
        }
    }

    pub fn id_hex(&self) -> String {
        self.id.simple().to_string()
    }
}

/// A note-to-tag association. Create-only on the wire: local removals are
/// tombstoned in the store but never enter the change stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteTag {
    #[serde(with = "hex_uuid")]
    pub note_id: Uuid,
    #[serde(with = "hex_uuid")]
    pub tag_id: Uuid,
    pub created_at: i64,
}

impl NoteTag {
    pub fn new(note_id: Uuid, tag_id: Uuid) -> Self {
        Self {
            note_id,
            tag_id,
            created_at: Utc::now().timestamp(),
        }
    }

    /// Composite wire id, "note_id:tag_id"
    pub fn entity_id(&self) -> String {
        format!(
            "{}:{}",
            self.note_id.simple(),
            self.tag_id.simple()
        )
    }
}

/// Audio file metadata. The bytes themselves live in the audio storage
/// directory and move over the binary transfer endpoints, never inside
/// the JSON change stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFile {
    #[serde(with = "hex_uuid")]
    pub id: Uuid,
    pub filename: String,
    pub imported_at: i64,
    pub file_created_at: Option<i64>,
    pub duration_seconds: Option<f64>,
    pub summary: Option<String>,
    pub modified_at: Option<i64>,
    pub deleted_at: Option<i64>,
}

impl AudioFile {
    pub fn new(filename: String) -> Self {
        Self {
            id: Uuid::now_v7(),
            filename,
            imported_at: Utc::now().timestamp(),
            file_created_at: None,
            duration_seconds: None,
            summary: None,
            modified_at: None,
            deleted_at: None,
        }
    }

    pub fn id_hex(&self) -> String {
        self.id.simple().to_string()
    }

    /// Lowercased filename extension, "bin" if there is none
    pub fn extension(&self) -> String {
        match self.filename.rsplit_once('.') {
            Some((_, ext)) if !ext.is_empty() => ext.to_lowercase(),
            _ => "bin".to_string(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Links a note to an attachment (currently always an AudioFile).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteAttachment {
    #[serde(with = "hex_uuid")]
    pub id: Uuid,
    #[serde(with = "hex_uuid")]
    pub note_id: Uuid,
    #[serde(with = "hex_uuid")]
    pub attachment_id: Uuid,
    pub attachment_type: String,
    pub created_at: i64,
    pub modified_at: Option<i64>,
    pub deleted_at: Option<i64>,
}

impl NoteAttachment {
    pub fn new(note_id: Uuid, attachment_id: Uuid) -> Self {
        Self {
            id: Uuid::now_v7(),
            note_id,
            attachment_id,
            attachment_type: ATTACHMENT_TYPE_AUDIO.to_string(),
            created_at: Utc::now().timestamp(),
            modified_at: None,
            deleted_at: None,
        }
    }

    pub fn id_hex(&self) -> String {
        self.id.simple().to_string()
    }
}

/// One scalar sync cursor per (local device, peer) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSyncState {
    pub peer_id: Uuid,
    pub peer_name: Option<String>,
    pub last_sync_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_creation() {
        let note = Note::new("Test content".to_string());
        assert!(!note.id.is_nil());
        assert_eq!(note.content, "Test content");
        assert!(note.modified_at.is_none());
        assert!(!note.is_deleted());
    }

    #[test]
    fn test_tag_with_parent() {
        let parent = Tag::new("Work".to_string(), None);
        let child = Tag::new("Projects".to_string(), Some(parent.id));
        assert_eq!(child.parent_id, Some(parent.id));
    }

    #[test]
    fn test_note_tag_entity_id() {
        let note = Note::new("n".to_string());
        let tag = Tag::new("t".to_string(), None);
        let nt = NoteTag::new(note.id, tag.id);
        let id = nt.entity_id();
        let parts: Vec<&str> = id.split(':').collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], note.id.simple().to_string());
        assert_eq!(parts[1], tag.id.simple().to_string());
    }

    #[test]
    fn test_audio_file_extension() {
        let mut af = AudioFile::new("memo.MP3".to_string());
        assert_eq!(af.extension(), "mp3");
        af.filename = "noextension".to_string();
        assert_eq!(af.extension(), "bin");
    }

    #[test]
    fn test_note_serializes_hex_id() {
        let note = Note::new("x".to_string());
        let json = serde_json::to_value(&note).unwrap();
        let id = json["id"].as_str().unwrap();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
