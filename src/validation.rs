//! Input validation for Recall.
//!
//! Validators for ids, names, and content lengths. All validators return
//! `SyncError::Validation` on failure. Wire timestamps are plain Unix
//! seconds (i64) and need no format validation.

use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

// Limits
pub const MAX_TAG_NAME_LENGTH: usize = 100;
pub const MAX_NOTE_CONTENT_LENGTH: usize = 100_000; // 100KB of text
pub const MAX_FILENAME_LENGTH: usize = 255;
pub const MAX_TAG_DEPTH: usize = 50;
pub const UUID_BYTES_LENGTH: usize = 16;

/// Length of the shortened id prefix used in log lines
pub const UUID_SHORT_LEN: usize = 8;

/// Check that a string is a 32-character lowercase-or-uppercase hex UUID.
pub fn validate_id_hex(value: &str, field_name: &str) -> SyncResult<Uuid> {
    if value.len() != 32 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(SyncError::validation(
            field_name,
            "must be 32 hex characters",
        ));
    }
    Uuid::parse_str(value).map_err(|e| SyncError::validation(field_name, e.to_string()))
}

/// Convert 16 UUID bytes (as stored in SQLite) to a simple hex string.
pub fn uuid_bytes_to_hex(bytes: &[u8]) -> SyncResult<String> {
    if bytes.len() != UUID_BYTES_LENGTH {
        return Err(SyncError::validation(
            "uuid",
            format!("expected {} bytes, got {}", UUID_BYTES_LENGTH, bytes.len()),
        ));
    }
    let uuid = Uuid::from_slice(bytes)?;
    Ok(uuid.simple().to_string())
}

/// Convert stored UUID bytes back to a `Uuid`.
pub fn uuid_from_bytes(bytes: &[u8]) -> SyncResult<Uuid> {
    Uuid::from_slice(bytes).map_err(SyncError::from)
}

/// Validate a tag name (non-empty, bounded length).
pub fn validate_tag_name(name: &str) -> SyncResult<()> {
    if name.trim().is_empty() {
        return Err(SyncError::validation("name", "tag name cannot be empty"));
    }
    if name.len() > MAX_TAG_NAME_LENGTH {
        return Err(SyncError::validation(
            "name",
            format!("tag name exceeds {} characters", MAX_TAG_NAME_LENGTH),
        ));
    }
    Ok(())
}

/// Validate note content length.
pub fn validate_note_content(content: &str) -> SyncResult<()> {
    if content.len() > MAX_NOTE_CONTENT_LENGTH {
        return Err(SyncError::validation(
            "content",
            format!("note content exceeds {} bytes", MAX_NOTE_CONTENT_LENGTH),
        ));
    }
    Ok(())
}

/// Validate a filename (non-empty, bounded, no path separators).
pub fn validate_filename(filename: &str) -> SyncResult<()> {
    if filename.is_empty() {
        return Err(SyncError::validation("filename", "cannot be empty"));
    }
    if filename.len() > MAX_FILENAME_LENGTH {
        return Err(SyncError::validation(
            "filename",
            format!("exceeds {} characters", MAX_FILENAME_LENGTH),
        ));
    }
    if filename.contains('/') || filename.contains('\\') {
        return Err(SyncError::validation(
            "filename",
            "must not contain path separators",
        ));
    }
    Ok(())
}

/// Serde helpers: UUIDs cross the wire as 32-char simple hex strings.
pub mod hex_uuid {
    use serde::{Deserialize, Deserializer, Serializer};
    use uuid::Uuid;

    pub fn serialize<S: Serializer>(id: &Uuid, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&id.simple().to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Uuid, D::Error> {
        let s = String::deserialize(deserializer)?;
        Uuid::parse_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Same as [`hex_uuid`] for optional ids.
pub mod hex_uuid_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use uuid::Uuid;

    pub fn serialize<S: Serializer>(id: &Option<Uuid>, serializer: S) -> Result<S::Ok, S::Error> {
        match id {
            Some(id) => serializer.serialize_some(&id.simple().to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Uuid>, D::Error> {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            Some(s) => Uuid::parse_str(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_id_hex_accepts_simple_uuid() {
        let id = Uuid::now_v7().simple().to_string();
        assert!(validate_id_hex(&id, "device_id").is_ok());
    }

    #[test]
    fn test_validate_id_hex_rejects_short() {
        assert!(validate_id_hex("abc123", "device_id").is_err());
    }

    #[test]
    fn test_validate_id_hex_rejects_non_hex() {
        let bad = "zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz";
        assert!(validate_id_hex(bad, "device_id").is_err());
    }

    #[test]
    fn test_uuid_bytes_roundtrip() {
        let id = Uuid::now_v7();
        let hex = uuid_bytes_to_hex(id.as_bytes()).unwrap();
        assert_eq!(hex, id.simple().to_string());
    }

    #[test]
    fn test_uuid_bytes_wrong_length() {
        assert!(uuid_bytes_to_hex(&[0u8; 5]).is_err());
    }

    #[test]
    fn test_validate_tag_name_empty() {
        assert!(validate_tag_name("  ").is_err());
        assert!(validate_tag_name("work").is_ok());
    }

    #[test]
    fn test_validate_filename_rejects_paths() {
        assert!(validate_filename("../etc/passwd").is_err());
        assert!(validate_filename("memo.ogg").is_ok());
    }
}
