//! SQLite persistence for Recall.
//!
//! Ids are UUID7 stored as 16-byte BLOBs. All timestamps are Unix seconds
//! (INTEGER) for timezone safety. Rows are never physically deleted while
//! they can still matter for sync: notes, audio files and attachments get
//! a `deleted_at` tombstone, note_tags keep a local-only tombstone, tags
//! are the one entity without one.
//!
//! `sync_received_at` records when a row last arrived *from* a peer, so
//! that change extraction forwards third-party changes to peers that have
//! not seen them yet.

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::models::{AudioFile, Note, NoteAttachment, NoteTag, PeerSyncState, Tag};
use crate::protocol::{ChangeRecord, EntityChange, FullDataset, Operation};
use crate::validation::{validate_note_content, validate_tag_name, MAX_TAG_DEPTH};

/// A page of extracted changes plus pagination state.
#[derive(Debug, Clone)]
pub struct ChangePage {
    pub changes: Vec<ChangeRecord>,
    /// Highest effective timestamp among the returned changes
    pub latest_timestamp: Option<i64>,
    /// False when the limit cut the page short
    pub is_complete: bool,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open<P: AsRef<Path>>(db_path: P) -> SyncResult<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let mut store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> SyncResult<Self> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Raw connection access for modules that keep their own SQL
    /// (conflict persistence lives in `conflicts`).
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    fn init_schema(&mut self) -> SyncResult<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS notes (
                id BLOB PRIMARY KEY,
                created_at INTEGER NOT NULL,
                content TEXT NOT NULL,
                modified_at INTEGER,
                deleted_at INTEGER,
                sync_received_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS tags (
                id BLOB PRIMARY KEY,
                name TEXT NOT NULL,
                parent_id BLOB,
                created_at INTEGER NOT NULL,
                modified_at INTEGER,
                sync_received_at INTEGER,
                FOREIGN KEY (parent_id) REFERENCES tags (id) ON DELETE CASCADE
            );

            -- Junction table. deleted_at is a local-only tombstone:
            -- removals never enter the change stream.
            CREATE TABLE IF NOT EXISTS note_tags (
                note_id BLOB NOT NULL,
                tag_id BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                deleted_at INTEGER,
                sync_received_at INTEGER,
                FOREIGN KEY (note_id) REFERENCES notes (id) ON DELETE CASCADE,
                FOREIGN KEY (tag_id) REFERENCES tags (id) ON DELETE CASCADE,
                PRIMARY KEY (note_id, tag_id)
            );

            CREATE TABLE IF NOT EXISTS audio_files (
                id BLOB PRIMARY KEY,
                filename TEXT NOT NULL,
                imported_at INTEGER NOT NULL,
                file_created_at INTEGER,
                duration_seconds REAL,
                summary TEXT,
                modified_at INTEGER,
                deleted_at INTEGER,
                sync_received_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS note_attachments (
                id BLOB PRIMARY KEY,
                note_id BLOB NOT NULL,
                attachment_id BLOB NOT NULL,
                attachment_type TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                modified_at INTEGER,
                deleted_at INTEGER,
                sync_received_at INTEGER,
                FOREIGN KEY (note_id) REFERENCES notes (id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS sync_peers (
                peer_id BLOB PRIMARY KEY,
                peer_name TEXT,
                last_sync_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS conflicts_note_content (
                id BLOB PRIMARY KEY,
                note_id BLOB NOT NULL,
                local_content TEXT NOT NULL,
                local_modified_at INTEGER NOT NULL,
                remote_content TEXT NOT NULL,
                remote_modified_at INTEGER NOT NULL,
                remote_device_id BLOB,
                remote_device_name TEXT,
                merged_clean INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                resolved_at INTEGER,
                FOREIGN KEY (note_id) REFERENCES notes(id)
            );

            CREATE TABLE IF NOT EXISTS conflicts_note_delete (
                id BLOB PRIMARY KEY,
                note_id BLOB NOT NULL,
                surviving_content TEXT NOT NULL,
                surviving_modified_at INTEGER NOT NULL,
                deleted_at INTEGER NOT NULL,
                remote_device_id BLOB,
                remote_device_name TEXT,
                created_at INTEGER NOT NULL,
                resolved_at INTEGER,
                FOREIGN KEY (note_id) REFERENCES notes(id)
            );

            CREATE TABLE IF NOT EXISTS conflicts_tag_rename (
                id BLOB PRIMARY KEY,
                tag_id BLOB NOT NULL,
                local_name TEXT NOT NULL,
                local_modified_at INTEGER NOT NULL,
                remote_name TEXT NOT NULL,
                remote_modified_at INTEGER NOT NULL,
                remote_device_id BLOB,
                remote_device_name TEXT,
                created_at INTEGER NOT NULL,
                resolved_at INTEGER,
                FOREIGN KEY (tag_id) REFERENCES tags(id) ON DELETE CASCADE
            );
            "#,
        )?;
        Ok(())
    }

    pub fn now() -> i64 {
        Utc::now().timestamp()
    }

    /// Next modification timestamp: wall clock, but always strictly after
    /// the previous effective timestamp so second-granularity edits stay
    /// ordered.
    fn next_modified(prev: i64) -> i64 {
        Self::now().max(prev + 1)
    }

    // Notes

    pub fn create_note(&self, content: &str) -> SyncResult<Note> {
        validate_note_content(content)?;
        let note = Note::new(content.to_string());
        self.conn.execute(
            "INSERT INTO notes (id, created_at, content) VALUES (?, ?, ?)",
            params![note.id.as_bytes().to_vec(), note.created_at, note.content],
        )?;
        Ok(note)
    }

    pub fn get_note(&self, note_id: &Uuid) -> SyncResult<Option<Note>> {
        let result = self
            .conn
            .query_row(
                "SELECT id, created_at, content, modified_at, deleted_at FROM notes WHERE id = ?",
                params![note_id.as_bytes().to_vec()],
                note_from_row,
            )
            .optional()?;
        Ok(result)
    }

    pub fn update_note(&self, note_id: &Uuid, content: &str) -> SyncResult<bool> {
        validate_note_content(content)?;
        let existing = match self.get_note(note_id)? {
            Some(note) if !note.is_deleted() => note,
            _ => return Ok(false),
        };
        let ts = Self::next_modified(existing.modified_at.unwrap_or(existing.created_at));
        self.conn.execute(
            "UPDATE notes SET content = ?, modified_at = ? WHERE id = ?",
            params![content, ts, note_id.as_bytes().to_vec()],
        )?;
        Ok(true)
    }

    /// Tombstone a note. The row survives so the deletion synchronizes.
    pub fn delete_note(&self, note_id: &Uuid) -> SyncResult<bool> {
        let existing = match self.get_note(note_id)? {
            Some(note) if !note.is_deleted() => note,
            _ => return Ok(false),
        };
        let ts = Self::next_modified(existing.modified_at.unwrap_or(existing.created_at));
        self.conn.execute(
            "UPDATE notes SET deleted_at = ?, modified_at = ? WHERE id = ?",
            params![ts, ts, note_id.as_bytes().to_vec()],
        )?;
        Ok(true)
    }

    pub fn list_notes(&self) -> SyncResult<Vec<Note>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, created_at, content, modified_at, deleted_at
             FROM notes WHERE deleted_at IS NULL ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], note_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // Tags

    pub fn create_tag(&self, name: &str, parent_id: Option<&Uuid>) -> SyncResult<Tag> {
        validate_tag_name(name)?;
        if let Some(parent) = parent_id {
            self.check_tag_depth(parent)?;
        }
        let tag = Tag::new(name.to_string(), parent_id.copied());
        self.conn.execute(
            "INSERT INTO tags (id, name, parent_id, created_at) VALUES (?, ?, ?, ?)",
            params![
                tag.id.as_bytes().to_vec(),
                tag.name,
                tag.parent_id.map(|p| p.as_bytes().to_vec()),
                tag.created_at
            ],
        )?;
        Ok(tag)
    }

    pub fn get_tag(&self, tag_id: &Uuid) -> SyncResult<Option<Tag>> {
        let result = self
            .conn
            .query_row(
                "SELECT id, name, parent_id, created_at, modified_at FROM tags WHERE id = ?",
                params![tag_id.as_bytes().to_vec()],
                tag_from_row,
            )
            .optional()?;
        Ok(result)
    }

    pub fn rename_tag(&self, tag_id: &Uuid, new_name: &str) -> SyncResult<bool> {
        validate_tag_name(new_name)?;
        let existing = match self.get_tag(tag_id)? {
            Some(tag) => tag,
            None => return Ok(false),
        };
        let ts = Self::next_modified(existing.modified_at.unwrap_or(existing.created_at));
        self.conn.execute(
            "UPDATE tags SET name = ?, modified_at = ? WHERE id = ?",
            params![new_name, ts, tag_id.as_bytes().to_vec()],
        )?;
        Ok(true)
    }

    pub fn reparent_tag(&self, tag_id: &Uuid, new_parent: Option<&Uuid>) -> SyncResult<bool> {
        let existing = match self.get_tag(tag_id)? {
            Some(tag) => tag,
            None => return Ok(false),
        };
        if let Some(parent) = new_parent {
            if self.would_create_cycle(tag_id, parent)? {
                return Err(SyncError::validation(
                    "parent_id",
                    "reparenting would create a tag cycle",
                ));
            }
            self.check_tag_depth(parent)?;
        }
        let ts = Self::next_modified(existing.modified_at.unwrap_or(existing.created_at));
        self.conn.execute(
            "UPDATE tags SET parent_id = ?, modified_at = ? WHERE id = ?",
            params![
                new_parent.map(|p| p.as_bytes().to_vec()),
                ts,
                tag_id.as_bytes().to_vec()
            ],
        )?;
        Ok(true)
    }

    /// Remove a tag locally. Tags carry no tombstone and deletions never
    /// synchronize, so this is a hard delete; note_tags cascade.
    pub fn delete_tag(&self, tag_id: &Uuid) -> SyncResult<bool> {
        let affected = self.conn.execute(
            "DELETE FROM tags WHERE id = ?",
            params![tag_id.as_bytes().to_vec()],
        )?;
        Ok(affected > 0)
    }

    pub fn list_tags(&self) -> SyncResult<Vec<Tag>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, parent_id, created_at, modified_at FROM tags ORDER BY name",
        )?;
        let rows = stmt.query_map([], tag_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Walk the parent chain from `tag_id`, measuring depth and detecting
    /// cycles in data that predates the insert-time check.
    pub fn tag_depth(&self, tag_id: &Uuid) -> SyncResult<usize> {
        let mut depth = 0usize;
        let mut current = Some(*tag_id);
        let mut seen: Vec<Uuid> = Vec::new();
        while let Some(id) = current {
            if seen.contains(&id) {
                return Err(SyncError::validation("parent_id", "tag cycle detected"));
            }
            if depth > MAX_TAG_DEPTH {
                return Err(SyncError::validation(
                    "parent_id",
                    format!("tag depth exceeds {}", MAX_TAG_DEPTH),
                ));
            }
            seen.push(id);
            current = match self.get_tag(&id)? {
                Some(tag) => tag.parent_id,
                None => None,
            };
            depth += 1;
        }
        Ok(depth)
    }

    fn check_tag_depth(&self, parent_id: &Uuid) -> SyncResult<()> {
        if self.get_tag(parent_id)?.is_none() {
            return Err(SyncError::NotFound(format!(
                "parent tag {}",
                parent_id.simple()
            )));
        }
        self.tag_depth(parent_id)?;
        Ok(())
    }

    fn would_create_cycle(&self, tag_id: &Uuid, new_parent: &Uuid) -> SyncResult<bool> {
        let mut current = Some(*new_parent);
        let mut steps = 0usize;
        while let Some(id) = current {
            if id == *tag_id {
                return Ok(true);
            }
            steps += 1;
            if steps > MAX_TAG_DEPTH {
                break;
            }
            current = match self.get_tag(&id)? {
                Some(tag) => tag.parent_id,
                None => None,
            };
        }
        Ok(false)
    }

    // Note-tag associations

    pub fn add_tag_to_note(&self, note_id: &Uuid, tag_id: &Uuid) -> SyncResult<bool> {
        let note_bytes = note_id.as_bytes().to_vec();
        let tag_bytes = tag_id.as_bytes().to_vec();
        let existing: Option<Option<i64>> = self
            .conn
            .query_row(
                "SELECT deleted_at FROM note_tags WHERE note_id = ? AND tag_id = ?",
                params![&note_bytes, &tag_bytes],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(None) => Ok(false), // already active
            Some(Some(_)) => {
                // Re-adding resurrects the row with a fresh created_at so
                // the association synchronizes again.
                self.conn.execute(
                    "UPDATE note_tags SET deleted_at = NULL, created_at = ?
                     WHERE note_id = ? AND tag_id = ?",
                    params![Self::now(), note_bytes, tag_bytes],
                )?;
                Ok(true)
            }
            None => {
                let nt = NoteTag::new(*note_id, *tag_id);
                self.conn.execute(
                    "INSERT INTO note_tags (note_id, tag_id, created_at) VALUES (?, ?, ?)",
                    params![note_bytes, tag_bytes, nt.created_at],
                )?;
                Ok(true)
            }
        }
    }

    /// Tombstone the association locally. Removals are deliberately kept
    /// out of the change stream: a remote device that still has the tag
    /// keeps it.
    pub fn remove_tag_from_note(&self, note_id: &Uuid, tag_id: &Uuid) -> SyncResult<bool> {
        let affected = self.conn.execute(
            "UPDATE note_tags SET deleted_at = ?
             WHERE note_id = ? AND tag_id = ? AND deleted_at IS NULL",
            params![
                Self::now(),
                note_id.as_bytes().to_vec(),
                tag_id.as_bytes().to_vec()
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn get_tags_for_note(&self, note_id: &Uuid) -> SyncResult<Vec<Tag>> {
        let mut stmt = self.conn.prepare(
            "SELECT t.id, t.name, t.parent_id, t.created_at, t.modified_at
             FROM tags t
             JOIN note_tags nt ON nt.tag_id = t.id
             WHERE nt.note_id = ? AND nt.deleted_at IS NULL
             ORDER BY t.name",
        )?;
        let rows = stmt.query_map(params![note_id.as_bytes().to_vec()], tag_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn get_note_tag(&self, note_id: &Uuid, tag_id: &Uuid) -> SyncResult<Option<(NoteTag, bool)>> {
        let result = self
            .conn
            .query_row(
                "SELECT note_id, tag_id, created_at, deleted_at
                 FROM note_tags WHERE note_id = ? AND tag_id = ?",
                params![note_id.as_bytes().to_vec(), tag_id.as_bytes().to_vec()],
                |row| {
                    let note_id: Vec<u8> = row.get(0)?;
                    let tag_id: Vec<u8> = row.get(1)?;
                    let created_at: i64 = row.get(2)?;
                    let deleted_at: Option<i64> = row.get(3)?;
                    Ok((note_id, tag_id, created_at, deleted_at))
                },
            )
            .optional()?;
        match result {
            Some((note_bytes, tag_bytes, created_at, deleted_at)) => Ok(Some((
                NoteTag {
                    note_id: uuid_from_blob(&note_bytes)?,
                    tag_id: uuid_from_blob(&tag_bytes)?,
                    created_at,
                },
                deleted_at.is_some(),
            ))),
            None => Ok(None),
        }
    }

    // Audio files and attachments

    pub fn create_audio_file(&self, audio: &AudioFile) -> SyncResult<()> {
        self.conn.execute(
            "INSERT INTO audio_files (id, filename, imported_at, file_created_at,
                                      duration_seconds, summary, modified_at, deleted_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                audio.id.as_bytes().to_vec(),
                audio.filename,
                audio.imported_at,
                audio.file_created_at,
                audio.duration_seconds,
                audio.summary,
                audio.modified_at,
                audio.deleted_at
            ],
        )?;
        Ok(())
    }

    pub fn get_audio_file(&self, audio_id: &Uuid) -> SyncResult<Option<AudioFile>> {
        let result = self
            .conn
            .query_row(
                "SELECT id, filename, imported_at, file_created_at, duration_seconds,
                        summary, modified_at, deleted_at
                 FROM audio_files WHERE id = ?",
                params![audio_id.as_bytes().to_vec()],
                audio_from_row,
            )
            .optional()?;
        Ok(result)
    }

    pub fn list_audio_files(&self) -> SyncResult<Vec<AudioFile>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, filename, imported_at, file_created_at, duration_seconds,
                    summary, modified_at, deleted_at
             FROM audio_files WHERE deleted_at IS NULL ORDER BY imported_at",
        )?;
        let rows = stmt.query_map([], audio_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn update_audio_summary(&self, audio_id: &Uuid, summary: &str) -> SyncResult<bool> {
        let existing = match self.get_audio_file(audio_id)? {
            Some(af) if !af.is_deleted() => af,
            _ => return Ok(false),
        };
        let ts = Self::next_modified(existing.modified_at.unwrap_or(existing.imported_at));
        self.conn.execute(
            "UPDATE audio_files SET summary = ?, modified_at = ? WHERE id = ?",
            params![summary, ts, audio_id.as_bytes().to_vec()],
        )?;
        Ok(true)
    }

    pub fn delete_audio_file(&self, audio_id: &Uuid) -> SyncResult<bool> {
        let existing = match self.get_audio_file(audio_id)? {
            Some(af) if !af.is_deleted() => af,
            _ => return Ok(false),
        };
        let ts = Self::next_modified(existing.modified_at.unwrap_or(existing.imported_at));
        self.conn.execute(
            "UPDATE audio_files SET deleted_at = ?, modified_at = ? WHERE id = ?",
            params![ts, ts, audio_id.as_bytes().to_vec()],
        )?;
        Ok(true)
    }

    pub fn attach_audio_to_note(&self, note_id: &Uuid, audio_id: &Uuid) -> SyncResult<NoteAttachment> {
        let attachment = NoteAttachment::new(*note_id, *audio_id);
        self.conn.execute(
            "INSERT INTO note_attachments (id, note_id, attachment_id, attachment_type, created_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                attachment.id.as_bytes().to_vec(),
                attachment.note_id.as_bytes().to_vec(),
                attachment.attachment_id.as_bytes().to_vec(),
                attachment.attachment_type,
                attachment.created_at
            ],
        )?;
        Ok(attachment)
    }

    pub fn get_note_attachment(&self, attachment_row_id: &Uuid) -> SyncResult<Option<NoteAttachment>> {
        let result = self
            .conn
            .query_row(
                "SELECT id, note_id, attachment_id, attachment_type, created_at,
                        modified_at, deleted_at
                 FROM note_attachments WHERE id = ?",
                params![attachment_row_id.as_bytes().to_vec()],
                attachment_from_row,
            )
            .optional()?;
        Ok(result)
    }

    pub fn get_attachments_for_note(&self, note_id: &Uuid) -> SyncResult<Vec<NoteAttachment>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, note_id, attachment_id, attachment_type, created_at,
                    modified_at, deleted_at
             FROM note_attachments
             WHERE note_id = ? AND deleted_at IS NULL ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![note_id.as_bytes().to_vec()], attachment_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // Sync upserts. These write remote state verbatim (conflict handling
    // happens in the apply engine before we get here) and stamp
    // sync_received_at so the change can be forwarded to other peers.

    pub fn apply_remote_note(&self, note: &Note, received_at: i64) -> SyncResult<()> {
        let id_bytes = note.id.as_bytes().to_vec();
        let exists: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM notes WHERE id = ?", params![&id_bytes], |r| {
                r.get(0)
            })
            .optional()?;
        if exists.is_some() {
            self.conn.execute(
                "UPDATE notes SET content = ?, modified_at = ?, deleted_at = ?, sync_received_at = ?
                 WHERE id = ?",
                params![note.content, note.modified_at, note.deleted_at, received_at, id_bytes],
            )?;
        } else {
            self.conn.execute(
                "INSERT INTO notes (id, created_at, content, modified_at, deleted_at, sync_received_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    id_bytes,
                    note.created_at,
                    note.content,
                    note.modified_at,
                    note.deleted_at,
                    received_at
                ],
            )?;
        }
        Ok(())
    }

    pub fn apply_remote_tag(&self, tag: &Tag, received_at: i64) -> SyncResult<()> {
        let id_bytes = tag.id.as_bytes().to_vec();
        let parent_bytes = tag.parent_id.map(|p| p.as_bytes().to_vec());
        let exists: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM tags WHERE id = ?", params![&id_bytes], |r| {
                r.get(0)
            })
            .optional()?;
        if exists.is_some() {
            self.conn.execute(
                "UPDATE tags SET name = ?, parent_id = ?, modified_at = ?, sync_received_at = ?
                 WHERE id = ?",
                params![tag.name, parent_bytes, tag.modified_at, received_at, id_bytes],
            )?;
        } else {
            self.conn.execute(
                "INSERT INTO tags (id, name, parent_id, created_at, modified_at, sync_received_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    id_bytes,
                    tag.name,
                    parent_bytes,
                    tag.created_at,
                    tag.modified_at,
                    received_at
                ],
            )?;
        }
        Ok(())
    }

    /// Apply a remote note-tag creation. A local tombstone wins: remote
    /// creation of an association we removed does not resurrect it unless
    /// the remote creation is newer than our removal.
    pub fn apply_remote_note_tag(&self, nt: &NoteTag, received_at: i64) -> SyncResult<bool> {
        match self.get_note_tag(&nt.note_id, &nt.tag_id)? {
            Some((_, false)) => Ok(false), // already active
            Some((existing, true)) => {
                if nt.created_at > existing.created_at {
                    self.conn.execute(
                        "UPDATE note_tags SET deleted_at = NULL, created_at = ?, sync_received_at = ?
                         WHERE note_id = ? AND tag_id = ?",
                        params![
                            nt.created_at,
                            received_at,
                            nt.note_id.as_bytes().to_vec(),
                            nt.tag_id.as_bytes().to_vec()
                        ],
                    )?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            None => {
                self.conn.execute(
                    "INSERT INTO note_tags (note_id, tag_id, created_at, sync_received_at)
                     VALUES (?, ?, ?, ?)",
                    params![
                        nt.note_id.as_bytes().to_vec(),
                        nt.tag_id.as_bytes().to_vec(),
                        nt.created_at,
                        received_at
                    ],
                )?;
                Ok(true)
            }
        }
    }

    pub fn apply_remote_audio_file(&self, audio: &AudioFile, received_at: i64) -> SyncResult<()> {
        let id_bytes = audio.id.as_bytes().to_vec();
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM audio_files WHERE id = ?",
                params![&id_bytes],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_some() {
            self.conn.execute(
                "UPDATE audio_files SET filename = ?, file_created_at = ?, duration_seconds = ?,
                        summary = ?, modified_at = ?, deleted_at = ?, sync_received_at = ?
                 WHERE id = ?",
                params![
                    audio.filename,
                    audio.file_created_at,
                    audio.duration_seconds,
                    audio.summary,
                    audio.modified_at,
                    audio.deleted_at,
                    received_at,
                    id_bytes
                ],
            )?;
        } else {
            self.conn.execute(
                "INSERT INTO audio_files (id, filename, imported_at, file_created_at,
                        duration_seconds, summary, modified_at, deleted_at, sync_received_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    id_bytes,
                    audio.filename,
                    audio.imported_at,
                    audio.file_created_at,
                    audio.duration_seconds,
                    audio.summary,
                    audio.modified_at,
                    audio.deleted_at,
                    received_at
                ],
            )?;
        }
        Ok(())
    }

    pub fn apply_remote_note_attachment(
        &self,
        attachment: &NoteAttachment,
        received_at: i64,
    ) -> SyncResult<()> {
        let id_bytes = attachment.id.as_bytes().to_vec();
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM note_attachments WHERE id = ?",
                params![&id_bytes],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_some() {
            self.conn.execute(
                "UPDATE note_attachments SET attachment_type = ?, modified_at = ?, deleted_at = ?,
                        sync_received_at = ?
                 WHERE id = ?",
                params![
                    attachment.attachment_type,
                    attachment.modified_at,
                    attachment.deleted_at,
                    received_at,
                    id_bytes
                ],
            )?;
        } else {
            self.conn.execute(
                "INSERT INTO note_attachments (id, note_id, attachment_id, attachment_type,
                        created_at, modified_at, deleted_at, sync_received_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    id_bytes,
                    attachment.note_id.as_bytes().to_vec(),
                    attachment.attachment_id.as_bytes().to_vec(),
                    attachment.attachment_type,
                    attachment.created_at,
                    attachment.modified_at,
                    attachment.deleted_at,
                    received_at
                ],
            )?;
        }
        Ok(())
    }

    // Peer cursors

    pub fn get_peer_last_sync(&self, peer_id: &Uuid) -> SyncResult<Option<i64>> {
        let result: Option<Option<i64>> = self
            .conn
            .query_row(
                "SELECT last_sync_at FROM sync_peers WHERE peer_id = ?",
                params![peer_id.as_bytes().to_vec()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(result.flatten())
    }

    pub fn set_peer_sync_time(
        &self,
        peer_id: &Uuid,
        peer_name: Option<&str>,
        timestamp: i64,
    ) -> SyncResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO sync_peers (peer_id, peer_name, last_sync_at)
            VALUES (?, ?, ?)
            ON CONFLICT(peer_id) DO UPDATE SET
                peer_name = COALESCE(excluded.peer_name, peer_name),
                last_sync_at = excluded.last_sync_at
            "#,
            params![peer_id.as_bytes().to_vec(), peer_name, timestamp],
        )?;
        Ok(())
    }

    pub fn list_peer_states(&self) -> SyncResult<Vec<PeerSyncState>> {
        let mut stmt = self
            .conn
            .prepare("SELECT peer_id, peer_name, last_sync_at FROM sync_peers")?;
        let rows = stmt.query_map([], |row| {
            let peer_bytes: Vec<u8> = row.get(0)?;
            let peer_name: Option<String> = row.get(1)?;
            let last_sync_at: Option<i64> = row.get(2)?;
            Ok((peer_bytes, peer_name, last_sync_at))
        })?;
        let mut states = Vec::new();
        for row in rows {
            let (peer_bytes, peer_name, last_sync_at) = row?;
            states.push(PeerSyncState {
                peer_id: uuid_from_blob(&peer_bytes)?,
                peer_name,
                last_sync_at,
            });
        }
        Ok(states)
    }

    /// Forget all cursors, forcing the next sync with every peer to start
    /// from scratch.
    pub fn reset_sync_cursors(&self) -> SyncResult<()> {
        self.conn
            .execute("UPDATE sync_peers SET last_sync_at = NULL", [])?;
        Ok(())
    }

    // Change extraction

    /// Collect all changes with an effective timestamp at or after `since`
    /// (inclusive so second-granularity ties are never dropped), stamped
    /// with this device's identity.
    ///
    /// `sync_received_at` participates in the cut so changes received from
    /// one peer are forwarded to others. Note-tag rows only surface while
    /// active: removals stay local.
    pub fn changes_since(
        &self,
        since: Option<i64>,
        limit: i64,
        device_id: &str,
        device_name: Option<&str>,
    ) -> SyncResult<ChangePage> {
        // Negative LIMIT means unlimited to SQLite; treat it as zero
        let limit = limit.max(0);
        let mut changes: Vec<ChangeRecord> = Vec::new();
        let mut truncated = false;

        let push = |changes: &mut Vec<ChangeRecord>,
                    operation: Operation,
                    entity: EntityChange,
                    timestamp: i64| {
            let entity_id = match &entity {
                EntityChange::Note(n) => n.id_hex(),
                EntityChange::Tag(t) => t.id_hex(),
                EntityChange::NoteTag(nt) => nt.entity_id(),
                EntityChange::AudioFile(af) => af.id_hex(),
                EntityChange::NoteAttachment(na) => na.id_hex(),
            };
            changes.push(ChangeRecord {
                entity_id,
                operation,
                entity,
                timestamp,
                device_id: device_id.to_string(),
                device_name: device_name.map(|s| s.to_string()),
            });
        };

        // Notes
        {
            let (rows, cut) = self.changed_notes(since, limit.saturating_add(1))?;
            truncated |= cut;
            for note in rows {
                let timestamp = note.modified_at.unwrap_or(note.created_at);
                let operation = operation_for(note.modified_at, note.deleted_at);
                push(&mut changes, operation, EntityChange::Note(note), timestamp);
            }
        }

        // Tags (no tombstone: create and update only)
        {
            let (rows, cut) = self.changed_tags(since, limit.saturating_add(1))?;
            truncated |= cut;
            for tag in rows {
                let timestamp = tag.modified_at.unwrap_or(tag.created_at);
                let operation = operation_for(tag.modified_at, None);
                push(&mut changes, operation, EntityChange::Tag(tag), timestamp);
            }
        }

        // Audio files
        {
            let (rows, cut) = self.changed_audio_files(since, limit.saturating_add(1))?;
            truncated |= cut;
            for audio in rows {
                let timestamp = audio.modified_at.unwrap_or(audio.imported_at);
                let operation = operation_for(audio.modified_at, audio.deleted_at);
                push(
                    &mut changes,
                    operation,
                    EntityChange::AudioFile(audio),
                    timestamp,
                );
            }
        }

        // Note-tag associations (active rows only, always creates)
        {
            let (rows, cut) = self.changed_note_tags(since, limit.saturating_add(1))?;
            truncated |= cut;
            for nt in rows {
                let timestamp = nt.created_at;
                push(
                    &mut changes,
                    Operation::Create,
                    EntityChange::NoteTag(nt),
                    timestamp,
                );
            }
        }

        // Attachments
        {
            let (rows, cut) = self.changed_attachments(since, limit.saturating_add(1))?;
            truncated |= cut;
            for attachment in rows {
                let timestamp = attachment.modified_at.unwrap_or(attachment.created_at);
                let operation = operation_for(attachment.modified_at, attachment.deleted_at);
                push(
                    &mut changes,
                    operation,
                    EntityChange::NoteAttachment(attachment),
                    timestamp,
                );
            }
        }

        // Pages cut along the global timestamp order, so a caller can
        // resume with since = latest_timestamp and miss nothing (ties at
        // the boundary are re-sent and deduplicated on apply)
        changes.sort_by_key(|c| c.timestamp);
        let is_complete = !truncated && changes.len() as i64 <= limit;
        changes.truncate(limit as usize);
        let latest_timestamp = changes.iter().map(|c| c.timestamp).max();
        Ok(ChangePage {
            changes,
            latest_timestamp,
            is_complete,
        })
    }

    fn changed_notes(&self, since: Option<i64>, limit: i64) -> SyncResult<(Vec<Note>, bool)> {
        let rows = if let Some(ts) = since {
            let mut stmt = self.conn.prepare(
                "SELECT id, created_at, content, modified_at, deleted_at
                 FROM notes
                 WHERE sync_received_at >= ? OR modified_at >= ? OR created_at >= ?
                 ORDER BY COALESCE(modified_at, created_at)
                 LIMIT ?",
            )?;
            let rows = stmt.query_map(params![ts, ts, ts, limit], note_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            let mut stmt = self.conn.prepare(
                "SELECT id, created_at, content, modified_at, deleted_at
                 FROM notes
                 ORDER BY COALESCE(modified_at, created_at)
                 LIMIT ?",
            )?;
            let rows = stmt.query_map(params![limit], note_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let cut = rows.len() as i64 >= limit;
        Ok((rows, cut))
    }

    fn changed_tags(&self, since: Option<i64>, limit: i64) -> SyncResult<(Vec<Tag>, bool)> {
        let rows = if let Some(ts) = since {
            let mut stmt = self.conn.prepare(
                "SELECT id, name, parent_id, created_at, modified_at
                 FROM tags
                 WHERE sync_received_at >= ? OR modified_at >= ? OR created_at >= ?
                 ORDER BY COALESCE(modified_at, created_at)
                 LIMIT ?",
            )?;
            let rows = stmt.query_map(params![ts, ts, ts, limit], tag_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            let mut stmt = self.conn.prepare(
                "SELECT id, name, parent_id, created_at, modified_at
                 FROM tags
                 ORDER BY COALESCE(modified_at, created_at)
                 LIMIT ?",
            )?;
            let rows = stmt.query_map(params![limit], tag_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let cut = rows.len() as i64 >= limit;
        Ok((rows, cut))
    }

    fn changed_audio_files(
        &self,
        since: Option<i64>,
        limit: i64,
    ) -> SyncResult<(Vec<AudioFile>, bool)> {
        let rows = if let Some(ts) = since {
            let mut stmt = self.conn.prepare(
                "SELECT id, filename, imported_at, file_created_at, duration_seconds,
                        summary, modified_at, deleted_at
                 FROM audio_files
                 WHERE sync_received_at >= ? OR modified_at >= ? OR imported_at >= ?
                 ORDER BY COALESCE(modified_at, imported_at)
                 LIMIT ?",
            )?;
            let rows = stmt.query_map(params![ts, ts, ts, limit], audio_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            let mut stmt = self.conn.prepare(
                "SELECT id, filename, imported_at, file_created_at, duration_seconds,
                        summary, modified_at, deleted_at
                 FROM audio_files
                 ORDER BY COALESCE(modified_at, imported_at)
                 LIMIT ?",
            )?;
            let rows = stmt.query_map(params![limit], audio_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let cut = rows.len() as i64 >= limit;
        Ok((rows, cut))
    }

    fn changed_note_tags(&self, since: Option<i64>, limit: i64) -> SyncResult<(Vec<NoteTag>, bool)> {
        let map_row = |row: &rusqlite::Row<'_>| {
            let note_bytes: Vec<u8> = row.get(0)?;
            let tag_bytes: Vec<u8> = row.get(1)?;
            let created_at: i64 = row.get(2)?;
            Ok((note_bytes, tag_bytes, created_at))
        };
        let raw = if let Some(ts) = since {
            let mut stmt = self.conn.prepare(
                "SELECT note_id, tag_id, created_at
                 FROM note_tags
                 WHERE deleted_at IS NULL AND (sync_received_at >= ? OR created_at >= ?)
                 ORDER BY created_at
                 LIMIT ?",
            )?;
            let rows = stmt.query_map(params![ts, ts, limit], map_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            let mut stmt = self.conn.prepare(
                "SELECT note_id, tag_id, created_at
                 FROM note_tags
                 WHERE deleted_at IS NULL
                 ORDER BY created_at
                 LIMIT ?",
            )?;
            let rows = stmt.query_map(params![limit], map_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let cut = raw.len() as i64 >= limit;
        let mut out = Vec::with_capacity(raw.len());
        for (note_bytes, tag_bytes, created_at) in raw {
            out.push(NoteTag {
                note_id: uuid_from_blob(&note_bytes)?,
                tag_id: uuid_from_blob(&tag_bytes)?,
                created_at,
            });
        }
        Ok((out, cut))
    }

    fn changed_attachments(
        &self,
        since: Option<i64>,
        limit: i64,
    ) -> SyncResult<(Vec<NoteAttachment>, bool)> {
        let rows = if let Some(ts) = since {
            let mut stmt = self.conn.prepare(
                "SELECT id, note_id, attachment_id, attachment_type, created_at,
                        modified_at, deleted_at
                 FROM note_attachments
                 WHERE sync_received_at >= ? OR modified_at >= ? OR created_at >= ?
                 ORDER BY COALESCE(modified_at, created_at)
                 LIMIT ?",
            )?;
            let rows = stmt.query_map(params![ts, ts, ts, limit], attachment_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            let mut stmt = self.conn.prepare(
                "SELECT id, note_id, attachment_id, attachment_type, created_at,
                        modified_at, deleted_at
                 FROM note_attachments
                 ORDER BY COALESCE(modified_at, created_at)
                 LIMIT ?",
            )?;
            let rows = stmt.query_map(params![limit], attachment_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let cut = rows.len() as i64 >= limit;
        Ok((rows, cut))
    }

    /// Complete snapshot for a peer's initial sync. Tombstoned rows are
    /// included so the peer learns about deletions; note_tags are active
    /// rows only.
    pub fn full_dataset(&self) -> SyncResult<FullDataset> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, created_at, content, modified_at, deleted_at FROM notes")?;
        let notes = stmt
            .query_map([], note_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = self
            .conn
            .prepare("SELECT id, name, parent_id, created_at, modified_at FROM tags")?;
        let tags = stmt
            .query_map([], tag_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let (note_tags, _) = self.changed_note_tags(None, i64::MAX)?;

        let mut stmt = self.conn.prepare(
            "SELECT id, filename, imported_at, file_created_at, duration_seconds,
                    summary, modified_at, deleted_at FROM audio_files",
        )?;
        let audio_files = stmt
            .query_map([], audio_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT id, note_id, attachment_id, attachment_type, created_at,
                    modified_at, deleted_at FROM note_attachments",
        )?;
        let note_attachments = stmt
            .query_map([], attachment_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(FullDataset {
            notes,
            tags,
            note_tags,
            audio_files,
            note_attachments,
        })
    }

    /// Entity counts for diagnostics
    pub fn entity_counts(&self) -> SyncResult<HashMap<String, i64>> {
        let mut counts = HashMap::new();
        for table in ["notes", "tags", "note_tags", "audio_files", "note_attachments"] {
            let count: i64 = self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))?;
            counts.insert(table.to_string(), count);
        }
        Ok(counts)
    }
}

fn operation_for(modified_at: Option<i64>, deleted_at: Option<i64>) -> Operation {
    if deleted_at.is_some() {
        Operation::Delete
    } else if modified_at.is_some() {
        Operation::Update
    } else {
        Operation::Create
    }
}

pub(crate) fn uuid_from_blob(bytes: &[u8]) -> rusqlite::Result<Uuid> {
    Uuid::from_slice(bytes).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            bytes.len(),
            rusqlite::types::Type::Blob,
            Box::new(e),
        )
    })
}

fn note_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Note> {
    let id_bytes: Vec<u8> = row.get(0)?;
    Ok(Note {
        id: uuid_from_blob(&id_bytes)?,
        created_at: row.get(1)?,
        content: row.get(2)?,
        modified_at: row.get(3)?,
        deleted_at: row.get(4)?,
    })
}

fn tag_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tag> {
    let id_bytes: Vec<u8> = row.get(0)?;
    let parent_bytes: Option<Vec<u8>> = row.get(2)?;
    let parent_id = match parent_bytes {
        Some(b) => Some(uuid_from_blob(&b)?),
        None => None,
    };
    Ok(Tag {
        id: uuid_from_blob(&id_bytes)?,
        name: row.get(1)?,
        parent_id,
        created_at: row.get(3)?,
        modified_at: row.get(4)?,
    })
}

fn audio_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AudioFile> {
    let id_bytes: Vec<u8> = row.get(0)?;
    Ok(AudioFile {
        id: uuid_from_blob(&id_bytes)?,
        filename: row.get(1)?,
        imported_at: row.get(2)?,
        file_created_at: row.get(3)?,
        duration_seconds: row.get(4)?,
        summary: row.get(5)?,
        modified_at: row.get(6)?,
        deleted_at: row.get(7)?,
    })
}

fn attachment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NoteAttachment> {
    let id_bytes: Vec<u8> = row.get(0)?;
    let note_bytes: Vec<u8> = row.get(1)?;
    let attachment_bytes: Vec<u8> = row.get(2)?;
    Ok(NoteAttachment {
        id: uuid_from_blob(&id_bytes)?,
        note_id: uuid_from_blob(&note_bytes)?,
        attachment_id: uuid_from_blob(&attachment_bytes)?,
        attachment_type: row.get(3)?,
        created_at: row.get(4)?,
        modified_at: row.get(5)?,
        deleted_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn test_note_crud_roundtrip() {
        let store = store();
        let note = store.create_note("hello").unwrap();
        let fetched = store.get_note(&note.id).unwrap().unwrap();
        assert_eq!(fetched.content, "hello");
        assert!(fetched.modified_at.is_none());

        assert!(store.update_note(&note.id, "edited").unwrap());
        let fetched = store.get_note(&note.id).unwrap().unwrap();
        assert_eq!(fetched.content, "edited");
        assert!(fetched.modified_at.is_some());

        assert!(store.delete_note(&note.id).unwrap());
        let fetched = store.get_note(&note.id).unwrap().unwrap();
        assert!(fetched.is_deleted());
        // Tombstoned notes reject further edits
        assert!(!store.update_note(&note.id, "again").unwrap());
        assert!(store.list_notes().unwrap().is_empty());
    }

    #[test]
    fn test_modified_at_strictly_increases() {
        let store = store();
        let note = store.create_note("v1").unwrap();
        store.update_note(&note.id, "v2").unwrap();
        let first = store.get_note(&note.id).unwrap().unwrap().modified_at.unwrap();
        store.update_note(&note.id, "v3").unwrap();
        let second = store.get_note(&note.id).unwrap().unwrap().modified_at.unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_tag_cycle_rejected_on_reparent() {
        let store = store();
        let a = store.create_tag("a", None).unwrap();
        let b = store.create_tag("b", Some(&a.id)).unwrap();
        let err = store.reparent_tag(&a.id, Some(&b.id)).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_note_tag_removal_stays_local() {
        let store = store();
        let note = store.create_note("n").unwrap();
        let tag = store.create_tag("t", None).unwrap();
        assert!(store.add_tag_to_note(&note.id, &tag.id).unwrap());
        assert_eq!(store.get_tags_for_note(&note.id).unwrap().len(), 1);

        assert!(store.remove_tag_from_note(&note.id, &tag.id).unwrap());
        assert!(store.get_tags_for_note(&note.id).unwrap().is_empty());

        // The removal never surfaces in the change stream
        let page = store.changes_since(None, 100, "d", None).unwrap();
        assert!(!page
            .changes
            .iter()
            .any(|c| matches!(c.entity, EntityChange::NoteTag(_))));
    }

    #[test]
    fn test_changes_since_inclusive_cut() {
        let store = store();
        let note = store.create_note("boundary").unwrap();
        let page = store
            .changes_since(Some(note.created_at), 100, "d", None)
            .unwrap();
        assert_eq!(page.changes.len(), 1);
        // Strictly-after cut misses it
        let page = store
            .changes_since(Some(note.created_at + 1), 100, "d", None)
            .unwrap();
        assert!(page.changes.is_empty());
    }

    #[test]
    fn test_changes_since_pagination() {
        let store = store();
        for i in 0..5 {
            store.create_note(&format!("note {}", i)).unwrap();
        }
        let page = store.changes_since(None, 3, "d", None).unwrap();
        assert_eq!(page.changes.len(), 3);
        assert!(!page.is_complete);

        let page = store.changes_since(None, 100, "d", None).unwrap();
        assert_eq!(page.changes.len(), 5);
        assert!(page.is_complete);
    }

    #[test]
    fn test_changes_since_extreme_limits() {
        let store = store();
        store.create_note("only one").unwrap();

        let page = store.changes_since(None, i64::MAX, "d", None).unwrap();
        assert_eq!(page.changes.len(), 1);
        assert!(page.is_complete);

        let page = store.changes_since(None, 0, "d", None).unwrap();
        assert!(page.changes.is_empty());
        assert!(!page.is_complete);

        let page = store.changes_since(None, -7, "d", None).unwrap();
        assert!(page.changes.is_empty());
    }

    #[test]
    fn test_changes_since_forwards_received_rows() {
        let store = store();
        let mut note = Note::new("from another device".to_string());
        note.created_at = 1000;
        store.apply_remote_note(&note, 5000).unwrap();

        // Cut at 2000 misses created_at but catches sync_received_at
        let page = store.changes_since(Some(2000), 100, "d", None).unwrap();
        assert_eq!(page.changes.len(), 1);
        assert_eq!(page.changes[0].entity_id, note.id_hex());
    }

    #[test]
    fn test_remote_note_tag_respects_newer_local_removal() {
        let store = store();
        let note = store.create_note("n").unwrap();
        let tag = store.create_tag("t", None).unwrap();
        store.add_tag_to_note(&note.id, &tag.id).unwrap();
        store.remove_tag_from_note(&note.id, &tag.id).unwrap();

        // Remote association older than our removal does not resurrect
        let mut nt = NoteTag::new(note.id, tag.id);
        nt.created_at = 0;
        assert!(!store.apply_remote_note_tag(&nt, Store::now()).unwrap());
        assert!(store.get_tags_for_note(&note.id).unwrap().is_empty());

        // A strictly newer remote association does
        nt.created_at = Store::now() + 10;
        assert!(store.apply_remote_note_tag(&nt, Store::now()).unwrap());
        assert_eq!(store.get_tags_for_note(&note.id).unwrap().len(), 1);
    }

    #[test]
    fn test_peer_cursor_roundtrip() {
        let store = store();
        let peer = Uuid::now_v7();
        assert!(store.get_peer_last_sync(&peer).unwrap().is_none());
        store.set_peer_sync_time(&peer, Some("Laptop"), 1234).unwrap();
        assert_eq!(store.get_peer_last_sync(&peer).unwrap(), Some(1234));

        store.reset_sync_cursors().unwrap();
        assert!(store.get_peer_last_sync(&peer).unwrap().is_none());
        let states = store.list_peer_states().unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].peer_name.as_deref(), Some("Laptop"));
    }

    #[test]
    fn test_full_dataset_includes_tombstones() {
        let store = store();
        let note = store.create_note("kept").unwrap();
        let dead = store.create_note("gone").unwrap();
        store.delete_note(&dead.id).unwrap();

        let dataset = store.full_dataset().unwrap();
        assert_eq!(dataset.notes.len(), 2);
        assert!(dataset
            .notes
            .iter()
            .any(|n| n.id == dead.id && n.is_deleted()));
        assert!(dataset.notes.iter().any(|n| n.id == note.id));
    }
}
