//! Dependency-ordered replay of remote change batches.
//!
//! The engine applies one validated batch against the local store. Records
//! are isolated: a failing record becomes an entry in the batch report and
//! replay continues. The engine reads the peer cursor to classify which
//! side of an entity changed since the last exchange but never advances
//! it; cursor updates belong to the caller, and only after a fully clean
//! round. There is no timestamp pre-filter: replayed records are absorbed
//! by the per-type rules, and a record older than the cursor can still be
//! new here (created in the cursor second, or forwarded from a third
//! device).

use std::collections::HashMap;

use uuid::Uuid;

use crate::conflicts::{combined_name, ConflictManager};
use crate::error::SyncResult;
use crate::merge::merge_content;
use crate::models::{AudioFile, Note, NoteAttachment, NoteTag, Tag};
use crate::protocol::{ChangeRecord, EntityChange, Operation};
use crate::store::Store;

/// Identity of the local device for one sync session.
///
/// Passed explicitly wherever it is needed; there is deliberately no
/// process-global device id, so embedders can run several stores side by
/// side.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub device_id: Uuid,
    pub device_name: String,
}

impl SyncContext {
    pub fn new(device_id: Uuid, device_name: impl Into<String>) -> Self {
        Self {
            device_id,
            device_name: device_name.into(),
        }
    }

    pub fn device_id_hex(&self) -> String {
        self.device_id.simple().to_string()
    }
}

/// Per-record apply result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Conflict,
    /// Stale, duplicate, or intentionally ignored
    Skipped,
}

/// Batch-level report. Errors are per-record strings; the batch itself
/// only fails on infrastructure errors (e.g. the database going away).
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub applied: i64,
    pub conflicts: i64,
    pub errors: Vec<String>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Sort a batch into dependency order: notes, tags and audio files before
/// the rows that reference them, parent tags before child tags (measured
/// within the batch), ties broken by timestamp. The sort is stable, so
/// records the comparator cannot distinguish keep their wire order.
pub fn sort_for_replay(changes: &mut [ChangeRecord]) {
    let mut tag_parents: HashMap<Uuid, Option<Uuid>> = HashMap::new();
    for change in changes.iter() {
        if let EntityChange::Tag(tag) = &change.entity {
            tag_parents.insert(tag.id, tag.parent_id);
        }
    }
    let batch_depth = |id: &Uuid| -> usize {
        let mut depth = 0usize;
        let mut current = *id;
        // Bounded walk; a cyclic batch must not hang the sort
        while depth <= tag_parents.len() {
            match tag_parents.get(&current) {
                Some(Some(parent)) => {
                    depth += 1;
                    current = *parent;
                }
                _ => break,
            }
        }
        depth
    };

    changes.sort_by_key(|change| {
        let (class, depth) = match &change.entity {
            EntityChange::Note(_) | EntityChange::AudioFile(_) => (0u8, 0usize),
            EntityChange::Tag(tag) => (0u8, batch_depth(&tag.id)),
            EntityChange::NoteTag(_) | EntityChange::NoteAttachment(_) => (1u8, 0usize),
        };
        (class, depth, change.timestamp)
    });
}

pub struct ApplyEngine<'a> {
    store: &'a Store,
    ctx: &'a SyncContext,
}

impl<'a> ApplyEngine<'a> {
    pub fn new(store: &'a Store, ctx: &'a SyncContext) -> Self {
        Self { store, ctx }
    }

    /// Replay a batch from `peer_id`. The batch is sorted into dependency
    /// order first; each record is applied in isolation.
    pub fn apply_batch(
        &self,
        mut changes: Vec<ChangeRecord>,
        peer_id: &Uuid,
    ) -> SyncResult<ApplyReport> {
        let received_at = Store::now();
        let last_sync_at = self.store.get_peer_last_sync(peer_id)?;
        tracing::trace!(
            peer = %peer_id.simple(),
            cursor = ?last_sync_at,
            records = changes.len(),
            "applying batch"
        );
        sort_for_replay(&mut changes);

        let mut report = ApplyReport::default();
        for change in &changes {
            let result = match &change.entity {
                EntityChange::Note(note) => self.apply_note(change, note, last_sync_at, received_at),
                EntityChange::Tag(tag) => self.apply_tag(change, tag, last_sync_at, received_at),
                EntityChange::NoteTag(nt) => self.apply_note_tag(change, nt, received_at),
                EntityChange::AudioFile(audio) => self.apply_audio_file(change, audio, received_at),
                EntityChange::NoteAttachment(attachment) => {
                    self.apply_note_attachment(change, attachment, received_at)
                }
            };

            match result {
                Ok(ApplyOutcome::Applied) => {
                    tracing::trace!(
                        entity = change.entity.entity_type(),
                        id = change.short_id(),
                        op = change.operation.as_str(),
                        "applied"
                    );
                    report.applied += 1;
                }
                Ok(ApplyOutcome::Conflict) => {
                    tracing::debug!(
                        entity = change.entity.entity_type(),
                        id = change.short_id(),
                        op = change.operation.as_str(),
                        "conflict"
                    );
                    report.conflicts += 1;
                }
                Ok(ApplyOutcome::Skipped) => {
                    tracing::trace!(
                        entity = change.entity.entity_type(),
                        id = change.short_id(),
                        "skipped"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        entity = change.entity.entity_type(),
                        id = change.short_id(),
                        error = %e,
                        "record failed"
                    );
                    report.errors.push(format!(
                        "{} {}: {}",
                        change.entity.entity_type(),
                        change.entity_id,
                        e
                    ));
                }
            }
        }
        Ok(report)
    }

    fn apply_note(
        &self,
        change: &ChangeRecord,
        remote: &Note,
        last_sync_at: Option<i64>,
        received_at: i64,
    ) -> SyncResult<ApplyOutcome> {
        let conflicts = ConflictManager::new(self.store);
        let remote_device = Uuid::parse_str(&change.device_id).ok();
        let existing = self.store.get_note(&remote.id)?;

        match change.operation {
            Operation::Create => match existing {
                Some(local) if local.is_deleted() && !remote.is_deleted() => {
                    if local.content == remote.content {
                        // The peer never edited; the local delete stands
                        return Ok(ApplyOutcome::Skipped);
                    }
                    // We deleted, the peer kept editing. The edit survives
                    // provisionally.
                    let local_deleted_at = local.deleted_at.unwrap_or(0);
                    if conflicts.has_matching_note_delete(&remote.id, local_deleted_at)? {
                        return Ok(ApplyOutcome::Skipped);
                    }
                    conflicts.record_note_delete(
                        &remote.id,
                        &remote.content,
                        remote.modified_at.unwrap_or(remote.created_at),
                        local_deleted_at,
                        remote_device.as_ref(),
                        change.device_name.as_deref(),
                    )?;
                    self.store.apply_remote_note(remote, received_at)?;
                    Ok(ApplyOutcome::Conflict)
                }
                Some(_) => Ok(ApplyOutcome::Skipped),
                None => {
                    self.store.apply_remote_note(remote, received_at)?;
                    Ok(ApplyOutcome::Applied)
                }
            },
            Operation::Update | Operation::Delete => {
                let local = match existing {
                    Some(local) => local,
                    None => {
                        self.store.apply_remote_note(remote, received_at)?;
                        return Ok(ApplyOutcome::Applied);
                    }
                };

                // Identical rows are replays or echoes of our own push
                if local.is_deleted() == remote.is_deleted() && local.content == remote.content {
                    return Ok(ApplyOutcome::Skipped);
                }

                let local_time = local.modified_at.or(local.deleted_at);
                let local_changed = match last_sync_at {
                    Some(last) => local_time.map_or(false, |lt| lt > last),
                    // No sync history with this peer: divergent content is
                    // the only signal we have
                    None => {
                        if !local.content.is_empty() && local.content != remote.content {
                            true
                        } else {
                            match (local_time, change.timestamp) {
                                (Some(lt), it) => lt >= it,
                                (None, _) => false,
                            }
                        }
                    }
                };
                // Strict >: a record stamped in the cursor second is a
                // replay of something already exchanged, not a new edit
                let remote_changed = last_sync_at.map_or(true, |last| change.timestamp > last);

                if !local_changed {
                    self.store.apply_remote_note(remote, received_at)?;
                    return Ok(ApplyOutcome::Applied);
                }
                if !remote_changed {
                    // Replayed old record against a fresh local edit: the
                    // local version wins and goes out on the next push
                    return Ok(ApplyOutcome::Skipped);
                }

                match (local.is_deleted(), remote.is_deleted()) {
                    (true, false) => {
                        if local.content == remote.content {
                            // The peer never edited; the local delete stands
                            return Ok(ApplyOutcome::Skipped);
                        }
                        // Local delete vs remote edit: resurrect with the
                        // remote content, record the racing delete
                        let local_deleted_at = local.deleted_at.unwrap_or(0);
                        if conflicts.has_matching_note_delete(&remote.id, local_deleted_at)? {
                            return Ok(ApplyOutcome::Skipped);
                        }
                        conflicts.record_note_delete(
                            &remote.id,
                            &remote.content,
                            remote.modified_at.unwrap_or(remote.created_at),
                            local_deleted_at,
                            remote_device.as_ref(),
                            change.device_name.as_deref(),
                        )?;
                        self.store.apply_remote_note(remote, received_at)?;
                        Ok(ApplyOutcome::Conflict)
                    }
                    (false, true) => {
                        // Local edit vs remote delete: the edit survives,
                        // the note is not touched
                        let remote_deleted_at = remote.deleted_at.unwrap_or(0);
                        if conflicts.has_matching_note_delete(&remote.id, remote_deleted_at)? {
                            return Ok(ApplyOutcome::Skipped);
                        }
                        conflicts.record_note_delete(
                            &remote.id,
                            &local.content,
                            local.modified_at.unwrap_or(local.created_at),
                            remote_deleted_at,
                            remote_device.as_ref(),
                            change.device_name.as_deref(),
                        )?;
                        Ok(ApplyOutcome::Conflict)
                    }
                    (false, false) => {
                        let remote_modified = remote.modified_at.unwrap_or(remote.created_at);
                        if conflicts.has_matching_note_content(
                            &remote.id,
                            &remote.content,
                            remote_modified,
                        )? {
                            return Ok(ApplyOutcome::Skipped);
                        }
                        // No common-ancestor text is tracked, so the merge
                        // degrades to one conflict region holding both
                        // versions. Nothing is lost either way.
                        let merge = merge_content(None, &local.content, &remote.content);
                        conflicts.record_note_content(
                            &remote.id,
                            &local.content,
                            local.modified_at.unwrap_or(local.created_at),
                            &remote.content,
                            remote_modified,
                            remote_device.as_ref(),
                            change.device_name.as_deref(),
                            merge.is_clean(),
                        )?;
                        let merged_ts = received_at
                            .max(local_time.unwrap_or(0) + 1)
                            .max(remote_modified + 1);
                        let merged = Note {
                            id: remote.id,
                            created_at: local.created_at,
                            content: merge.content,
                            modified_at: Some(merged_ts),
                            deleted_at: None,
                        };
                        self.store.apply_remote_note(&merged, received_at)?;
                        Ok(ApplyOutcome::Conflict)
                    }
                    (true, true) => {
                        // Both sides deleted; keep the remote tombstone
                        self.store.apply_remote_note(remote, received_at)?;
                        Ok(ApplyOutcome::Applied)
                    }
                }
            }
        }
    }

    fn apply_tag(
        &self,
        change: &ChangeRecord,
        remote: &Tag,
        last_sync_at: Option<i64>,
        received_at: i64,
    ) -> SyncResult<ApplyOutcome> {
        let conflicts = ConflictManager::new(self.store);
        let remote_device = Uuid::parse_str(&change.device_id).ok();
        let existing = self.store.get_tag(&remote.id)?;

        match change.operation {
            Operation::Create => match existing {
                Some(_) => Ok(ApplyOutcome::Skipped),
                None => {
                    self.store.apply_remote_tag(remote, received_at)?;
                    Ok(ApplyOutcome::Applied)
                }
            },
            Operation::Update => {
                let local = match existing {
                    Some(local) => local,
                    None => {
                        self.store.apply_remote_tag(remote, received_at)?;
                        return Ok(ApplyOutcome::Applied);
                    }
                };

                if local.name == remote.name && local.parent_id == remote.parent_id {
                    return Ok(ApplyOutcome::Skipped);
                }

                let local_changed = match last_sync_at {
                    Some(last) => local.modified_at.map_or(false, |lt| lt > last),
                    None => match (local.modified_at, remote.modified_at) {
                        (Some(lt), Some(it)) => lt >= it,
                        (Some(_), None) => true,
                        (None, _) => false,
                    },
                };
                let remote_changed = last_sync_at.map_or(true, |last| change.timestamp > last);

                if !local_changed {
                    self.store.apply_remote_tag(remote, received_at)?;
                    return Ok(ApplyOutcome::Applied);
                }
                if !remote_changed {
                    return Ok(ApplyOutcome::Skipped);
                }

                let remote_modified = remote.modified_at.unwrap_or(remote.created_at);
                let mut final_tag = remote.clone();
                let mut conflicted = false;

                if local.name != remote.name {
                    if conflicts.has_matching_tag_rename(&remote.id, &remote.name, remote_modified)? {
                        return Ok(ApplyOutcome::Skipped);
                    }
                    conflicts.record_tag_rename(
                        &remote.id,
                        &local.name,
                        local.modified_at.unwrap_or(local.created_at),
                        &remote.name,
                        remote_modified,
                        remote_device.as_ref(),
                        change.device_name.as_deref(),
                    )?;
                    // Both renames survive until the user picks one
                    final_tag.name = combined_name(&local.name, &remote.name);
                    conflicted = true;
                }

                if local.parent_id != remote.parent_id {
                    // Concurrent reparent: keep the local parent. Unlike a
                    // rename there is no combined form to fall back on.
                    final_tag.parent_id = local.parent_id;
                }

                if conflicted {
                    final_tag.modified_at = Some(
                        received_at
                            .max(local.modified_at.unwrap_or(0) + 1)
                            .max(remote_modified + 1),
                    );
                }
                self.store.apply_remote_tag(&final_tag, received_at)?;
                if conflicted {
                    Ok(ApplyOutcome::Conflict)
                } else {
                    Ok(ApplyOutcome::Applied)
                }
            }
            // Tags carry no tombstone and deletions never synchronize
            Operation::Delete => Ok(ApplyOutcome::Skipped),
        }
    }

    fn apply_note_tag(
        &self,
        change: &ChangeRecord,
        nt: &NoteTag,
        received_at: i64,
    ) -> SyncResult<ApplyOutcome> {
        match change.operation {
            Operation::Create | Operation::Update => {
                if self.store.apply_remote_note_tag(nt, received_at)? {
                    Ok(ApplyOutcome::Applied)
                } else {
                    Ok(ApplyOutcome::Skipped)
                }
            }
            // Removals are local-only on every device
            Operation::Delete => Ok(ApplyOutcome::Skipped),
        }
    }

    fn apply_audio_file(
        &self,
        change: &ChangeRecord,
        remote: &AudioFile,
        received_at: i64,
    ) -> SyncResult<ApplyOutcome> {
        let existing = self.store.get_audio_file(&remote.id)?;
        match change.operation {
            Operation::Create if existing.is_some() => Ok(ApplyOutcome::Skipped),
            _ => {
                if existing.as_ref() == Some(remote) {
                    return Ok(ApplyOutcome::Skipped);
                }
                // Metadata is last-writer-wins; the bytes move separately
                // over the binary transfer endpoints
                self.store.apply_remote_audio_file(remote, received_at)?;
                Ok(ApplyOutcome::Applied)
            }
        }
    }

    fn apply_note_attachment(
        &self,
        change: &ChangeRecord,
        remote: &NoteAttachment,
        received_at: i64,
    ) -> SyncResult<ApplyOutcome> {
        let existing = self.store.get_note_attachment(&remote.id)?;
        match change.operation {
            Operation::Create if existing.is_some() => Ok(ApplyOutcome::Skipped),
            _ => {
                if existing.as_ref() == Some(remote) {
                    return Ok(ApplyOutcome::Skipped);
                }
                self.store.apply_remote_note_attachment(remote, received_at)?;
                Ok(ApplyOutcome::Applied)
            }
        }
    }

    /// Local device identity stamped on outgoing batches.
    pub fn context(&self) -> &SyncContext {
        self.ctx
    }
}
