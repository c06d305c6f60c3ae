//! HTTP sync server.
//!
//! Serves the peer-facing endpoints: handshake, change extraction, change
//! apply, full dataset for initial sync, and binary audio transfer. One
//! instance serves every peer; per-peer state is only the sync cursor in
//! the store.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::apply::{ApplyEngine, SyncContext};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{
    ApplyRequest, ApplyResponse, ChangesResponse, FullSyncResponse, HandshakeRequest,
    HandshakeResponse, StatusResponse, PROTOCOL_VERSION,
};
use crate::storage::AudioStorage;
use crate::store::Store;
use crate::validation::{validate_id_hex, UUID_SHORT_LEN};

/// Default page size for change extraction.
const DEFAULT_CHANGES_LIMIT: i64 = 1000;
/// Hard cap; a peer cannot request unbounded pages.
const MAX_CHANGES_LIMIT: i64 = 10_000;

static SHUTDOWN_TX: OnceLock<Mutex<Option<oneshot::Sender<()>>>> = OnceLock::new();

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Mutex<Store>>,
    pub ctx: SyncContext,
    /// None disables the binary audio endpoints
    pub audio: Option<AudioStorage>,
}

impl AppState {
    pub fn new(store: Arc<Mutex<Store>>, ctx: SyncContext, audio: Option<AudioStorage>) -> Self {
        Self { store, ctx, audio }
    }
}

#[derive(Debug, Deserialize)]
struct ChangesQuery {
    since: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn internal_error(e: impl std::fmt::Display) -> axum::response::Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

// Route handlers

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        status: "ok".to_string(),
        device_id: state.ctx.device_id_hex(),
        device_name: state.ctx.device_name.clone(),
        protocol_version: PROTOCOL_VERSION.to_string(),
        supports_audio: state.audio.is_some(),
    })
}

async fn handshake(
    State(state): State<AppState>,
    Json(request): Json<HandshakeRequest>,
) -> impl IntoResponse {
    tracing::debug!(
        "Handshake from device_id={}... device_name={}",
        &request.device_id[..UUID_SHORT_LEN.min(request.device_id.len())],
        request.device_name
    );

    let peer_id = match validate_id_hex(&request.device_id, "device_id") {
        Ok(id) => id,
        Err(_) => {
            tracing::warn!("Invalid device_id format: {}", request.device_id);
            return error_response(StatusCode::BAD_REQUEST, "Invalid device_id format");
        }
    };

    let last_sync = {
        let store = match state.store.lock() {
            Ok(store) => store,
            Err(_) => return internal_error("store lock poisoned"),
        };
        match store.get_peer_last_sync(&peer_id) {
            Ok(ts) => ts,
            Err(e) => return internal_error(e),
        }
    };
    tracing::debug!("Last sync with this peer: {:?}", last_sync);

    Json(HandshakeResponse {
        device_id: state.ctx.device_id_hex(),
        device_name: state.ctx.device_name.clone(),
        protocol_version: PROTOCOL_VERSION.to_string(),
        last_sync_timestamp: last_sync,
        server_timestamp: Store::now(),
        supports_audio: state.audio.is_some(),
    })
    .into_response()
}

async fn get_changes(
    State(state): State<AppState>,
    Query(query): Query<ChangesQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_CHANGES_LIMIT)
        .clamp(1, MAX_CHANGES_LIMIT);
    tracing::debug!("GET /sync/changes since={:?} limit={}", query.since, limit);

    let page = {
        let store = match state.store.lock() {
            Ok(store) => store,
            Err(_) => return internal_error("store lock poisoned"),
        };
        match store.changes_since(
            query.since,
            limit,
            &state.ctx.device_id_hex(),
            Some(&state.ctx.device_name),
        ) {
            Ok(page) => page,
            Err(e) => {
                tracing::error!("Failed to get changes: {}", e);
                return internal_error(e);
            }
        }
    };

    tracing::debug!(
        "Returning {} changes, to_timestamp={:?}, is_complete={}",
        page.changes.len(),
        page.latest_timestamp,
        page.is_complete
    );
    for change in &page.changes {
        tracing::trace!(
            "  {} {} {}",
            change.entity.entity_type(),
            change.short_id(),
            change.operation.as_str()
        );
    }

    Json(ChangesResponse {
        changes: page.changes,
        from_timestamp: query.since,
        to_timestamp: page.latest_timestamp,
        device_id: state.ctx.device_id_hex(),
        device_name: state.ctx.device_name.clone(),
        is_complete: page.is_complete,
    })
    .into_response()
}

async fn apply_changes(
    State(state): State<AppState>,
    Json(request): Json<ApplyRequest>,
) -> impl IntoResponse {
    tracing::debug!(
        "POST /sync/apply from device_id={}... ({} changes)",
        &request.device_id[..UUID_SHORT_LEN.min(request.device_id.len())],
        request.changes.len()
    );

    let peer_id = match validate_id_hex(&request.device_id, "device_id") {
        Ok(id) => id,
        Err(_) => {
            tracing::warn!("Invalid device_id format: {}", request.device_id);
            return error_response(StatusCode::BAD_REQUEST, "Invalid device_id format");
        }
    };

    // Per-record validation; malformed records become errors without
    // sinking the rest of the batch
    let total = request.changes.len();
    let mut changes = Vec::with_capacity(total);
    let mut validation_errors = Vec::new();
    for raw in &request.changes {
        match raw.validate() {
            Ok(record) => changes.push(record),
            Err(e) => {
                let len = UUID_SHORT_LEN.min(raw.entity_id.len());
                validation_errors.push(format!(
                    "{} {}: {}",
                    raw.entity_type,
                    &raw.entity_id[..len],
                    e
                ));
            }
        }
    }

    let batch_high = changes.iter().map(|c| c.timestamp).max();
    let mut report = {
        let store = match state.store.lock() {
            Ok(store) => store,
            Err(_) => return internal_error("store lock poisoned"),
        };
        let engine = ApplyEngine::new(&store, &state.ctx);
        let report = match engine.apply_batch(changes, &peer_id) {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("Failed to apply changes: {}", e);
                return internal_error(e);
            }
        };

        // The cursor only moves when the whole batch landed, and only to
        // the batch's own high-water mark; a partial batch must be replayed
        if report.is_clean() && validation_errors.is_empty() {
            if let Some(high) = batch_high {
                if let Err(e) =
                    store.set_peer_sync_time(&peer_id, Some(&request.device_name), high)
                {
                    tracing::warn!("Failed to advance peer cursor: {}", e);
                }
            }
        }
        report
    };
    report.errors.splice(0..0, validation_errors);

    tracing::debug!(
        "Applied {} changes, {} conflicts, {} errors",
        report.applied,
        report.conflicts,
        report.errors.len()
    );
    for err in &report.errors {
        tracing::warn!("  Error: {}", err);
    }

    let all_failed = !report.errors.is_empty()
        && report.applied == 0
        && report.conflicts == 0
        && report.errors.len() >= total;
    let status = if report.errors.is_empty() {
        StatusCode::OK
    } else if all_failed {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::MULTI_STATUS
    };

    (
        status,
        Json(ApplyResponse {
            applied: report.applied,
            conflicts: report.conflicts,
            errors: report.errors,
        }),
    )
        .into_response()
}

async fn get_full_sync(State(state): State<AppState>) -> impl IntoResponse {
    tracing::debug!("GET /sync/full (initial sync request)");

    let dataset = {
        let store = match state.store.lock() {
            Ok(store) => store,
            Err(_) => return internal_error("store lock poisoned"),
        };
        match store.full_dataset() {
            Ok(d) => d,
            Err(e) => {
                tracing::error!("Failed to get full dataset: {}", e);
                return internal_error(e);
            }
        }
    };

    tracing::debug!(
        "Full sync: {} notes, {} tags, {} note_tags, {} audio files",
        dataset.notes.len(),
        dataset.tags.len(),
        dataset.note_tags.len(),
        dataset.audio_files.len()
    );

    Json(FullSyncResponse {
        dataset,
        device_id: state.ctx.device_id_hex(),
        device_name: state.ctx.device_name.clone(),
        timestamp: Store::now(),
    })
    .into_response()
}

async fn download_audio_file(
    State(state): State<AppState>,
    Path(audio_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    tracing::debug!(
        "GET /sync/audio/{}/file",
        &audio_id[..UUID_SHORT_LEN.min(audio_id.len())]
    );

    let audio_id = Uuid::parse_str(&audio_id)
        .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid audio ID".to_string()))?;

    let storage = state
        .audio
        .as_ref()
        .ok_or_else(|| (StatusCode::NOT_FOUND, "audio storage not configured".to_string()))?;

    let audio = {
        let store = state
            .store
            .lock()
            .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, "store lock poisoned".to_string()))?;
        store
            .get_audio_file(&audio_id)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
            .ok_or_else(|| {
                (
                    StatusCode::NOT_FOUND,
                    format!("Audio record not found: {}", audio_id.simple()),
                )
            })?
    };

    let contents = storage.read(&audio).map_err(|e| match e {
        SyncError::NotFound(_) => (
            StatusCode::NOT_FOUND,
            format!("Audio file not found: {}", audio_id.simple()),
        ),
        other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    })?;

    Ok((StatusCode::OK, contents))
}

async fn upload_audio_file(
    State(state): State<AppState>,
    Path(audio_id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    tracing::debug!(
        "POST /sync/audio/{}/file ({} bytes)",
        &audio_id[..UUID_SHORT_LEN.min(audio_id.len())],
        body.len()
    );

    let audio_id = Uuid::parse_str(&audio_id)
        .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid audio ID".to_string()))?;

    let storage = state
        .audio
        .as_ref()
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "audio storage not configured".to_string()))?;

    // Bytes only land next to their metadata record
    let audio = {
        let store = state
            .store
            .lock()
            .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, "store lock poisoned".to_string()))?;
        store
            .get_audio_file(&audio_id)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
            .ok_or_else(|| {
                (
                    StatusCode::NOT_FOUND,
                    format!("Audio record not found: {}", audio_id.simple()),
                )
            })?
    };

    storage
        .write(&audio, &body)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok((StatusCode::OK, "OK"))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/sync/handshake", post(handshake))
        .route("/sync/changes", get(get_changes))
        .route("/sync/apply", post(apply_changes))
        .route("/sync/full", get(get_full_sync))
        .route("/sync/status", get(status))
        .route(
            "/sync/audio/:audio_id/file",
            get(download_audio_file).post(upload_audio_file),
        )
        .with_state(state)
}

/// Start the sync server and block until shutdown.
pub async fn start_server(state: AppState, port: u16) -> SyncResult<()> {
    let router = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let (tx, rx) = oneshot::channel::<()>();
    SHUTDOWN_TX.get_or_init(|| Mutex::new(Some(tx)));

    tracing::info!("Starting sync server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| SyncError::network(e.to_string()))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            rx.await.ok();
        })
        .await
        .map_err(|e| SyncError::network(e.to_string()))?;

    Ok(())
}

/// Signal a running server to shut down.
pub fn stop_server() {
    if let Some(mutex) = SHUTDOWN_TX.get() {
        if let Ok(mut guard) = mutex.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AudioFile;
    use crate::protocol::RawChange;
    use serde_json::Value;

    fn test_state(audio_dir: Option<&std::path::Path>) -> AppState {
        let store = Store::open_in_memory().unwrap();
        let ctx = SyncContext::new(Uuid::now_v7(), "Server Device");
        let audio = audio_dir.map(|dir| AudioStorage::new(dir).unwrap());
        AppState::new(Arc::new(Mutex::new(store)), ctx, audio)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn raw_note_change(device_id: &str) -> RawChange {
        let note = crate::models::Note::new("pushed from peer".to_string());
        RawChange {
            entity_type: "note".to_string(),
            entity_id: note.id_hex(),
            operation: "create".to_string(),
            data: serde_json::to_value(&note).unwrap(),
            timestamp: note.created_at,
            device_id: device_id.to_string(),
            device_name: Some("Peer Device".to_string()),
        }
    }

    #[tokio::test]
    async fn test_status_reports_identity() {
        let state = test_state(None);
        let expected_id = state.ctx.device_id_hex();

        let response = status(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["device_id"], expected_id);
        assert_eq!(json["supports_audio"], false);
    }

    #[tokio::test]
    async fn test_handshake_rejects_malformed_device_id() {
        let state = test_state(None);
        let request = HandshakeRequest {
            device_id: "not-a-uuid".to_string(),
            device_name: "Peer".to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        };
        let response = handshake(State(state), Json(request)).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_handshake_returns_cursor() {
        let state = test_state(None);
        let peer = Uuid::now_v7();
        {
            let store = state.store.lock().unwrap();
            store.set_peer_sync_time(&peer, Some("Peer"), 1234).unwrap();
        }
        let request = HandshakeRequest {
            device_id: peer.simple().to_string(),
            device_name: "Peer".to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        };
        let response = handshake(State(state), Json(request)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["last_sync_timestamp"], 1234);
        assert!(json["server_timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_get_changes_pages() {
        let state = test_state(None);
        {
            let store = state.store.lock().unwrap();
            for i in 0..3 {
                store.create_note(&format!("note {}", i)).unwrap();
            }
        }

        let query = ChangesQuery {
            since: None,
            limit: Some(2),
        };
        let response = get_changes(State(state.clone()), Query(query))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["changes"].as_array().unwrap().len(), 2);
        assert_eq!(json["is_complete"], false);

        let query = ChangesQuery {
            since: None,
            limit: None,
        };
        let response = get_changes(State(state), Query(query)).await.into_response();
        let json = body_json(response).await;
        assert_eq!(json["changes"].as_array().unwrap().len(), 3);
        assert_eq!(json["is_complete"], true);
    }

    #[tokio::test]
    async fn test_apply_clean_batch_advances_cursor() {
        let state = test_state(None);
        let peer = Uuid::now_v7();
        let request = ApplyRequest {
            device_id: peer.simple().to_string(),
            device_name: "Peer".to_string(),
            changes: vec![raw_note_change(&peer.simple().to_string())],
        };

        let response = apply_changes(State(state.clone()), Json(request))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["applied"], 1);
        assert_eq!(json["errors"].as_array().unwrap().len(), 0);

        let store = state.store.lock().unwrap();
        assert!(store.get_peer_last_sync(&peer).unwrap().is_some());
        assert_eq!(store.list_notes().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_apply_partial_batch_holds_cursor() {
        let state = test_state(None);
        let peer = Uuid::now_v7();
        let good = raw_note_change(&peer.simple().to_string());
        let mut bad = raw_note_change(&peer.simple().to_string());
        bad.entity_type = "spreadsheet".to_string();

        let request = ApplyRequest {
            device_id: peer.simple().to_string(),
            device_name: "Peer".to_string(),
            changes: vec![good, bad],
        };
        let response = apply_changes(State(state.clone()), Json(request))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::MULTI_STATUS);
        let json = body_json(response).await;
        assert_eq!(json["applied"], 1);
        assert_eq!(json["errors"].as_array().unwrap().len(), 1);

        // Cursor must not move past a batch with errors
        let store = state.store.lock().unwrap();
        assert!(store.get_peer_last_sync(&peer).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_all_invalid_is_unprocessable() {
        let state = test_state(None);
        let peer = Uuid::now_v7();
        let mut bad = raw_note_change(&peer.simple().to_string());
        bad.operation = "upsert".to_string();

        let request = ApplyRequest {
            device_id: peer.simple().to_string(),
            device_name: "Peer".to_string(),
            changes: vec![bad],
        };
        let response = apply_changes(State(state), Json(request)).await.into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_full_sync_includes_tombstones() {
        let state = test_state(None);
        {
            let store = state.store.lock().unwrap();
            let note = store.create_note("kept").unwrap();
            let gone = store.create_note("gone").unwrap();
            store.delete_note(&gone.id).unwrap();
            let _ = note;
        }

        let response = get_full_sync(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let notes = json["notes"].as_array().unwrap();
        assert_eq!(notes.len(), 2);
        assert!(notes.iter().any(|n| !n["deleted_at"].is_null()));
    }

    #[tokio::test]
    async fn test_audio_endpoints_without_storage() {
        let state = test_state(None);
        let id = Uuid::now_v7().simple().to_string();

        let result = download_audio_file(State(state.clone()), Path(id.clone())).await;
        assert_eq!(result.err().unwrap().0, StatusCode::NOT_FOUND);

        let result =
            upload_audio_file(State(state), Path(id), Bytes::from_static(b"OggS")).await;
        assert_eq!(result.err().unwrap().0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_audio_upload_then_download() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(Some(dir.path()));
        let audio = AudioFile::new("memo.ogg".to_string());
        {
            let store = state.store.lock().unwrap();
            store.create_audio_file(&audio).unwrap();
        }
        let id = audio.id_hex();

        // Upload for a missing record is a 404
        let other = Uuid::now_v7().simple().to_string();
        let result = upload_audio_file(
            State(state.clone()),
            Path(other),
            Bytes::from_static(b"x"),
        )
        .await;
        assert_eq!(result.err().unwrap().0, StatusCode::NOT_FOUND);

        let result = upload_audio_file(
            State(state.clone()),
            Path(id.clone()),
            Bytes::from_static(b"OggS data"),
        )
        .await;
        assert!(result.is_ok());

        let response = download_audio_file(State(state), Path(id))
            .await
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"OggS data");
    }

    #[tokio::test]
    async fn test_invalid_audio_id_is_bad_request() {
        let state = test_state(None);
        let result = download_audio_file(State(state), Path("zzz".to_string())).await;
        assert_eq!(result.err().unwrap().0, StatusCode::BAD_REQUEST);
    }
}
