//! Recall core - the synchronization engine for a local-first note store.
//!
//! Multiple independent devices keep a shared set of notes, tags, and
//! audio attachments mutually consistent over HTTP, with no central
//! server. This library provides:
//! - Data models and the SQLite entity store
//! - Change extraction with timestamp-ordered pagination
//! - Dependency-ordered replay with per-record error isolation
//! - Conflict detection and three-way text merge
//! - Binary audio transfer alongside the JSON change stream
//! - TOFU certificate pinning between peers
//! - The sync orchestrator (client) and HTTP endpoints (server)
//!
//! # Feature Flags
//!
//! - `server`: Include the HTTP server components (axum). Clients that
//!   only pull and push can disable this.

pub mod apply;
pub mod client;
pub mod config;
pub mod conflicts;
pub mod error;
pub mod merge;
pub mod models;
pub mod protocol;
#[cfg(feature = "server")]
pub mod server;
pub mod storage;
pub mod store;
pub mod trust;
pub mod validation;

// Re-export commonly used types
pub use apply::{ApplyEngine, ApplyReport, SyncContext};
pub use client::{SyncClient, SyncSummary};
pub use config::Config;
pub use error::{SyncError, SyncResult};
pub use merge::{merge_content, MergeOutcome};
pub use models::{AudioFile, Note, NoteAttachment, NoteTag, Tag};
pub use store::Store;
