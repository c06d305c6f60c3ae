//! Conflict records and resolution.
//!
//! The apply engine never blocks on a conflict: it picks a provisional
//! winner, records both sides here, and replay continues. Resolution is a
//! separate, user-driven step.
//!
//! Three kinds are tracked:
//! - note content: concurrent edits to the same note
//! - note delete: a deletion racing an edit (the edit wins provisionally)
//! - tag rename: concurrent renames of the same tag

use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::store::{uuid_from_blob, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictType {
    NoteContent,
    NoteDelete,
    TagRename,
}

/// How the user wants a conflict settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionChoice {
    /// Keep this device's version (for delete conflicts: keep the note)
    Local,
    /// Keep the peer's version (for delete conflicts: delete the note)
    Remote,
    /// Keep both: merged content as currently edited, or "a | b" for names
    Both,
}

impl ResolutionChoice {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(ResolutionChoice::Local),
            "remote" => Some(ResolutionChoice::Remote),
            "both" => Some(ResolutionChoice::Both),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionChoice::Local => "local",
            ResolutionChoice::Remote => "remote",
            ResolutionChoice::Both => "both",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NoteContentConflict {
    pub id: Uuid,
    pub note_id: Uuid,
    pub local_content: String,
    pub local_modified_at: i64,
    pub remote_content: String,
    pub remote_modified_at: i64,
    pub remote_device_id: Option<Uuid>,
    pub remote_device_name: Option<String>,
    /// Whether the three-way merge applied without markers
    pub merged_clean: bool,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NoteDeleteConflict {
    pub id: Uuid,
    pub note_id: Uuid,
    pub surviving_content: String,
    pub surviving_modified_at: i64,
    pub deleted_at: i64,
    pub remote_device_id: Option<Uuid>,
    pub remote_device_name: Option<String>,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagRenameConflict {
    pub id: Uuid,
    pub tag_id: Uuid,
    pub local_name: String,
    pub local_modified_at: i64,
    pub remote_name: String,
    pub remote_modified_at: i64,
    pub remote_device_id: Option<Uuid>,
    pub remote_device_name: Option<String>,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

pub struct ConflictManager<'a> {
    store: &'a Store,
}

impl<'a> ConflictManager<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    // Recording

    pub fn record_note_content(
        &self,
        note_id: &Uuid,
        local_content: &str,
        local_modified_at: i64,
        remote_content: &str,
        remote_modified_at: i64,
        remote_device_id: Option<&Uuid>,
        remote_device_name: Option<&str>,
        merged_clean: bool,
    ) -> SyncResult<Uuid> {
        let id = Uuid::now_v7();
        self.store.conn().execute(
            "INSERT INTO conflicts_note_content
             (id, note_id, local_content, local_modified_at, remote_content,
              remote_modified_at, remote_device_id, remote_device_name,
              merged_clean, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                id.as_bytes().to_vec(),
                note_id.as_bytes().to_vec(),
                local_content,
                local_modified_at,
                remote_content,
                remote_modified_at,
                remote_device_id.map(|d| d.as_bytes().to_vec()),
                remote_device_name,
                merged_clean as i64,
                Store::now()
            ],
        )?;
        Ok(id)
    }

    pub fn record_note_delete(
        &self,
        note_id: &Uuid,
        surviving_content: &str,
        surviving_modified_at: i64,
        deleted_at: i64,
        remote_device_id: Option<&Uuid>,
        remote_device_name: Option<&str>,
    ) -> SyncResult<Uuid> {
        let id = Uuid::now_v7();
        self.store.conn().execute(
            "INSERT INTO conflicts_note_delete
             (id, note_id, surviving_content, surviving_modified_at, deleted_at,
              remote_device_id, remote_device_name, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                id.as_bytes().to_vec(),
                note_id.as_bytes().to_vec(),
                surviving_content,
                surviving_modified_at,
                deleted_at,
                remote_device_id.map(|d| d.as_bytes().to_vec()),
                remote_device_name,
                Store::now()
            ],
        )?;
        Ok(id)
    }

    pub fn record_tag_rename(
        &self,
        tag_id: &Uuid,
        local_name: &str,
        local_modified_at: i64,
        remote_name: &str,
        remote_modified_at: i64,
        remote_device_id: Option<&Uuid>,
        remote_device_name: Option<&str>,
    ) -> SyncResult<Uuid> {
        let id = Uuid::now_v7();
        self.store.conn().execute(
            "INSERT INTO conflicts_tag_rename
             (id, tag_id, local_name, local_modified_at, remote_name,
              remote_modified_at, remote_device_id, remote_device_name, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                id.as_bytes().to_vec(),
                tag_id.as_bytes().to_vec(),
                local_name,
                local_modified_at,
                remote_name,
                remote_modified_at,
                remote_device_id.map(|d| d.as_bytes().to_vec()),
                remote_device_name,
                Store::now()
            ],
        )?;
        Ok(id)
    }

    // Duplicate suppression: replaying the same remote change must not
    // pile up identical conflict rows.

    pub fn has_matching_note_content(
        &self,
        note_id: &Uuid,
        remote_content: &str,
        remote_modified_at: i64,
    ) -> SyncResult<bool> {
        let found: Option<i64> = self
            .store
            .conn()
            .query_row(
                "SELECT 1 FROM conflicts_note_content
                 WHERE note_id = ? AND remote_content = ? AND remote_modified_at = ?
                   AND resolved_at IS NULL",
                params![note_id.as_bytes().to_vec(), remote_content, remote_modified_at],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn has_matching_note_delete(&self, note_id: &Uuid, deleted_at: i64) -> SyncResult<bool> {
        let found: Option<i64> = self
            .store
            .conn()
            .query_row(
                "SELECT 1 FROM conflicts_note_delete
                 WHERE note_id = ? AND deleted_at = ? AND resolved_at IS NULL",
                params![note_id.as_bytes().to_vec(), deleted_at],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn has_matching_tag_rename(
        &self,
        tag_id: &Uuid,
        remote_name: &str,
        remote_modified_at: i64,
    ) -> SyncResult<bool> {
        let found: Option<i64> = self
            .store
            .conn()
            .query_row(
                "SELECT 1 FROM conflicts_tag_rename
                 WHERE tag_id = ? AND remote_name = ? AND remote_modified_at = ?
                   AND resolved_at IS NULL",
                params![tag_id.as_bytes().to_vec(), remote_name, remote_modified_at],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // Listing

    pub fn unresolved_counts(&self) -> SyncResult<(i64, i64, i64)> {
        let count = |table: &str| -> SyncResult<i64> {
            Ok(self.store.conn().query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE resolved_at IS NULL", table),
                [],
                |r| r.get(0),
            )?)
        };
        Ok((
            count("conflicts_note_content")?,
            count("conflicts_note_delete")?,
            count("conflicts_tag_rename")?,
        ))
    }

    pub fn note_content_conflicts(&self, include_resolved: bool) -> SyncResult<Vec<NoteContentConflict>> {
        let sql = format!(
            "SELECT id, note_id, local_content, local_modified_at, remote_content,
                    remote_modified_at, remote_device_id, remote_device_name,
                    merged_clean, created_at, resolved_at
             FROM conflicts_note_content {} ORDER BY created_at",
            if include_resolved { "" } else { "WHERE resolved_at IS NULL" }
        );
        let mut stmt = self.store.conn().prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let id: Vec<u8> = row.get(0)?;
            let note_id: Vec<u8> = row.get(1)?;
            let device: Option<Vec<u8>> = row.get(6)?;
            Ok(NoteContentConflict {
                id: uuid_from_blob(&id)?,
                note_id: uuid_from_blob(&note_id)?,
                local_content: row.get(2)?,
                local_modified_at: row.get(3)?,
                remote_content: row.get(4)?,
                remote_modified_at: row.get(5)?,
                remote_device_id: match device {
                    Some(b) => Some(uuid_from_blob(&b)?),
                    None => None,
                },
                remote_device_name: row.get(7)?,
                merged_clean: row.get::<_, i64>(8)? != 0,
                created_at: row.get(9)?,
                resolved_at: row.get(10)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn note_delete_conflicts(&self, include_resolved: bool) -> SyncResult<Vec<NoteDeleteConflict>> {
        let sql = format!(
            "SELECT id, note_id, surviving_content, surviving_modified_at, deleted_at,
                    remote_device_id, remote_device_name, created_at, resolved_at
             FROM conflicts_note_delete {} ORDER BY created_at",
            if include_resolved { "" } else { "WHERE resolved_at IS NULL" }
        );
        let mut stmt = self.store.conn().prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let id: Vec<u8> = row.get(0)?;
            let note_id: Vec<u8> = row.get(1)?;
            let device: Option<Vec<u8>> = row.get(5)?;
            Ok(NoteDeleteConflict {
                id: uuid_from_blob(&id)?,
                note_id: uuid_from_blob(&note_id)?,
                surviving_content: row.get(2)?,
                surviving_modified_at: row.get(3)?,
                deleted_at: row.get(4)?,
                remote_device_id: match device {
                    Some(b) => Some(uuid_from_blob(&b)?),
                    None => None,
                },
                remote_device_name: row.get(6)?,
                created_at: row.get(7)?,
                resolved_at: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn tag_rename_conflicts(&self, include_resolved: bool) -> SyncResult<Vec<TagRenameConflict>> {
        let sql = format!(
            "SELECT id, tag_id, local_name, local_modified_at, remote_name,
                    remote_modified_at, remote_device_id, remote_device_name,
                    created_at, resolved_at
             FROM conflicts_tag_rename {} ORDER BY created_at",
            if include_resolved { "" } else { "WHERE resolved_at IS NULL" }
        );
        let mut stmt = self.store.conn().prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let id: Vec<u8> = row.get(0)?;
            let tag_id: Vec<u8> = row.get(1)?;
            let device: Option<Vec<u8>> = row.get(6)?;
            Ok(TagRenameConflict {
                id: uuid_from_blob(&id)?,
                tag_id: uuid_from_blob(&tag_id)?,
                local_name: row.get(2)?,
                local_modified_at: row.get(3)?,
                remote_name: row.get(4)?,
                remote_modified_at: row.get(5)?,
                remote_device_id: match device {
                    Some(b) => Some(uuid_from_blob(&b)?),
                    None => None,
                },
                remote_device_name: row.get(7)?,
                created_at: row.get(8)?,
                resolved_at: row.get(9)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // Resolution

    pub fn resolve_note_content(&self, conflict_id: &Uuid, choice: ResolutionChoice) -> SyncResult<()> {
        let conflict = self
            .note_content_conflicts(true)?
            .into_iter()
            .find(|c| c.id == *conflict_id)
            .ok_or_else(|| SyncError::NotFound(format!("conflict {}", conflict_id.simple())))?;
        if conflict.resolved_at.is_some() {
            return Err(SyncError::sync("conflict already resolved"));
        }
        match choice {
            ResolutionChoice::Local => {
                self.store.update_note(&conflict.note_id, &conflict.local_content)?;
            }
            ResolutionChoice::Remote => {
                self.store.update_note(&conflict.note_id, &conflict.remote_content)?;
            }
            // Both: the note already holds the merged text (possibly with
            // markers the user has since edited); leave it alone.
            ResolutionChoice::Both => {}
        }
        self.mark_resolved("conflicts_note_content", conflict_id)?;
        Ok(())
    }

    pub fn resolve_note_delete(&self, conflict_id: &Uuid, choice: ResolutionChoice) -> SyncResult<()> {
        let conflict = self
            .note_delete_conflicts(true)?
            .into_iter()
            .find(|c| c.id == *conflict_id)
            .ok_or_else(|| SyncError::NotFound(format!("conflict {}", conflict_id.simple())))?;
        if conflict.resolved_at.is_some() {
            return Err(SyncError::sync("conflict already resolved"));
        }
        match choice {
            // The edit survived provisionally; Local keeps it that way
            ResolutionChoice::Local | ResolutionChoice::Both => {}
            ResolutionChoice::Remote => {
                self.store.delete_note(&conflict.note_id)?;
            }
        }
        self.mark_resolved("conflicts_note_delete", conflict_id)?;
        Ok(())
    }

    pub fn resolve_tag_rename(&self, conflict_id: &Uuid, choice: ResolutionChoice) -> SyncResult<()> {
        let conflict = self
            .tag_rename_conflicts(true)?
            .into_iter()
            .find(|c| c.id == *conflict_id)
            .ok_or_else(|| SyncError::NotFound(format!("conflict {}", conflict_id.simple())))?;
        if conflict.resolved_at.is_some() {
            return Err(SyncError::sync("conflict already resolved"));
        }
        let name = match choice {
            ResolutionChoice::Local => conflict.local_name.clone(),
            ResolutionChoice::Remote => conflict.remote_name.clone(),
            ResolutionChoice::Both => combined_name(&conflict.local_name, &conflict.remote_name),
        };
        self.store.rename_tag(&conflict.tag_id, &name)?;
        self.mark_resolved("conflicts_tag_rename", conflict_id)?;
        Ok(())
    }

    /// Resolve by conflict id prefix, searching all three tables. Errors
    /// when the prefix is ambiguous or matches nothing.
    pub fn resolve_by_prefix(&self, prefix: &str, choice: ResolutionChoice) -> SyncResult<ConflictType> {
        let prefix = prefix.replace('-', "").to_lowercase();
        let mut matches: Vec<(ConflictType, Uuid)> = Vec::new();
        for c in self.note_content_conflicts(false)? {
            if c.id.simple().to_string().starts_with(&prefix) {
                matches.push((ConflictType::NoteContent, c.id));
            }
        }
        for c in self.note_delete_conflicts(false)? {
            if c.id.simple().to_string().starts_with(&prefix) {
                matches.push((ConflictType::NoteDelete, c.id));
            }
        }
        for c in self.tag_rename_conflicts(false)? {
            if c.id.simple().to_string().starts_with(&prefix) {
                matches.push((ConflictType::TagRename, c.id));
            }
        }
        match matches.as_slice() {
            [] => Err(SyncError::NotFound(format!("no conflict matching '{}'", prefix))),
            [(kind, id)] => {
                match kind {
                    ConflictType::NoteContent => self.resolve_note_content(id, choice)?,
                    ConflictType::NoteDelete => self.resolve_note_delete(id, choice)?,
                    ConflictType::TagRename => self.resolve_tag_rename(id, choice)?,
                }
                Ok(*kind)
            }
            _ => Err(SyncError::validation(
                "conflict_id",
                format!("prefix '{}' is ambiguous", prefix),
            )),
        }
    }

    fn mark_resolved(&self, table: &str, conflict_id: &Uuid) -> SyncResult<()> {
        self.store.conn().execute(
            &format!("UPDATE {} SET resolved_at = ? WHERE id = ?", table),
            params![Store::now(), conflict_id.as_bytes().to_vec()],
        )?;
        Ok(())
    }
}

/// Combined name used when both renames should survive.
pub fn combined_name(local: &str, remote: &str) -> String {
    format!("{} | {}", local, remote)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn test_record_and_list_note_content_conflict() {
        let store = store();
        let note = store.create_note("local").unwrap();
        let manager = ConflictManager::new(&store);
        manager
            .record_note_content(&note.id, "local", 100, "remote", 200, None, None, false)
            .unwrap();

        let conflicts = manager.note_content_conflicts(false).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].remote_content, "remote");
        assert!(!conflicts[0].merged_clean);
        assert_eq!(manager.unresolved_counts().unwrap(), (1, 0, 0));
    }

    #[test]
    fn test_duplicate_detection() {
        let store = store();
        let note = store.create_note("local").unwrap();
        let manager = ConflictManager::new(&store);
        manager
            .record_note_content(&note.id, "local", 100, "remote", 200, None, None, false)
            .unwrap();
        assert!(manager.has_matching_note_content(&note.id, "remote", 200).unwrap());
        assert!(!manager.has_matching_note_content(&note.id, "remote", 201).unwrap());
        assert!(!manager.has_matching_note_content(&note.id, "other", 200).unwrap());
    }

    #[test]
    fn test_resolve_note_content_keep_remote() {
        let store = store();
        let note = store.create_note("merged <<<").unwrap();
        let manager = ConflictManager::new(&store);
        let id = manager
            .record_note_content(&note.id, "local", 100, "remote", 200, None, None, false)
            .unwrap();

        manager.resolve_note_content(&id, ResolutionChoice::Remote).unwrap();
        assert_eq!(store.get_note(&note.id).unwrap().unwrap().content, "remote");
        assert_eq!(manager.unresolved_counts().unwrap(), (0, 0, 0));

        // Double resolution is an error
        assert!(manager.resolve_note_content(&id, ResolutionChoice::Local).is_err());
    }

    #[test]
    fn test_resolve_note_delete_honors_remote() {
        let store = store();
        let note = store.create_note("survives for now").unwrap();
        let manager = ConflictManager::new(&store);
        let id = manager
            .record_note_delete(&note.id, "survives for now", 100, 200, None, None)
            .unwrap();

        manager.resolve_note_delete(&id, ResolutionChoice::Remote).unwrap();
        assert!(store.get_note(&note.id).unwrap().unwrap().is_deleted());
    }

    #[test]
    fn test_resolve_tag_rename_both() {
        let store = store();
        let tag = store.create_tag("work", None).unwrap();
        let manager = ConflictManager::new(&store);
        let id = manager
            .record_tag_rename(&tag.id, "work", 100, "job", 200, None, None)
            .unwrap();

        manager.resolve_tag_rename(&id, ResolutionChoice::Both).unwrap();
        assert_eq!(store.get_tag(&tag.id).unwrap().unwrap().name, "work | job");
    }

    #[test]
    fn test_resolve_by_prefix() {
        let store = store();
        let tag = store.create_tag("work", None).unwrap();
        let manager = ConflictManager::new(&store);
        let id = manager
            .record_tag_rename(&tag.id, "work", 100, "job", 200, None, None)
            .unwrap();

        let prefix = &id.simple().to_string()[..8];
        let kind = manager.resolve_by_prefix(prefix, ResolutionChoice::Local).unwrap();
        assert_eq!(kind, ConflictType::TagRename);
        assert_eq!(store.get_tag(&tag.id).unwrap().unwrap().name, "work");

        assert!(manager.resolve_by_prefix(prefix, ResolutionChoice::Local).is_err());
    }
}
