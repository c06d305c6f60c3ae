//! Sync client and orchestrator.
//!
//! The outbound half of the peer protocol: handshake, paged pull, push,
//! initial full sync, and binary audio reconciliation, aggregated into a
//! per-peer summary. A single scalar cursor per peer gates both
//! directions, and it only advances after a direction completes with
//! zero errors, so a failed sync never loses its place.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::apply::{ApplyEngine, SyncContext};
use crate::config::{Config, PeerConfig};
use crate::error::{SyncError, SyncResult};
use crate::models::AudioFile;
use crate::protocol::{
    ApplyResponse, ChangeRecord, ChangesResponse, EntityChange, FullDataset, FullSyncResponse,
    HandshakeRequest, HandshakeResponse, Operation, StatusResponse, PROTOCOL_VERSION,
};
use crate::storage::AudioStorage;
use crate::store::Store;
use crate::trust::{client_tls_config, PinnedCertVerifier};

/// Page size used when pulling changes.
const PULL_PAGE_LIMIT: i64 = 1000;
/// Page size used when extracting local changes for push.
const PUSH_PAGE_LIMIT: i64 = 1000;
/// Clock skew between peers worth warning about (seconds).
const CLOCK_SKEW_WARN_SECS: i64 = 30;

/// Outcome of a sync operation with one peer.
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub success: bool,
    pub pulled: i64,
    pub pushed: i64,
    pub conflicts: i64,
    pub errors: Vec<String>,
}

impl SyncSummary {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            errors: vec![error.into()],
            ..Default::default()
        }
    }
}

/// Reachability probe result for one peer.
#[derive(Debug, Clone, Default)]
pub struct PeerStatus {
    pub reachable: bool,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub supports_audio: bool,
    pub error: Option<String>,
}

/// Push body; wire-compatible with the server's apply request.
#[derive(Serialize)]
struct PushRequest<'a> {
    device_id: String,
    device_name: String,
    changes: &'a [ChangeRecord],
}

pub struct SyncClient {
    store: Arc<Mutex<Store>>,
    config: Arc<Mutex<Config>>,
    ctx: SyncContext,
    audio: Option<AudioStorage>,
    /// One lock per peer so concurrent callers cannot interleave sync
    /// sessions against the same peer; different peers sync in parallel.
    peer_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SyncClient {
    pub fn new(
        store: Arc<Mutex<Store>>,
        config: Arc<Mutex<Config>>,
        audio: Option<AudioStorage>,
    ) -> SyncResult<Self> {
        let ctx = {
            let cfg = config.lock().unwrap();
            cfg.sync_context()?
        };
        Ok(Self {
            store,
            config,
            ctx,
            audio,
            peer_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Bidirectional sync with one peer: handshake, pull (or initial full
    /// sync when no cursor exists), audio reconciliation, push.
    pub async fn sync_with_peer(&self, peer_id: &str) -> SyncSummary {
        let peer = match self.peer(peer_id) {
            Some(p) => p,
            None => return SyncSummary::failure(format!("Unknown peer: {}", peer_id)),
        };
        let lock = self.peer_lock(peer_id);
        let _guard = lock.lock().await;

        let peer_uuid = match Uuid::parse_str(&peer.peer_id) {
            Ok(u) => u,
            Err(_) => return SyncSummary::failure(format!("Invalid peer id: {}", peer.peer_id)),
        };
        let (client, verifier) = match self.build_peer_client(&peer) {
            Ok(pair) => pair,
            Err(e) => return SyncSummary::failure(e.to_string()),
        };

        let handshake = match self.handshake(&client, &peer.peer_url).await {
            Ok(h) => h,
            Err(e) => return SyncSummary::failure(format!("Handshake failed: {}", e)),
        };
        self.pin_observed(&peer, &verifier);
        self.warn_on_clock_skew(&peer, handshake.server_timestamp);

        let mut summary = SyncSummary::success();

        let cursor = {
            let store = self.store.lock().unwrap();
            match store.get_peer_last_sync(&peer_uuid) {
                Ok(c) => c,
                Err(e) => return SyncSummary::failure(e.to_string()),
            }
        };

        // Pull. A peer we have never synced with gets the full snapshot
        // instead of an incremental page walk.
        let pull = if cursor.is_none() {
            self.initial_pull(&client, &peer, &peer_uuid).await
        } else {
            self.pull(&client, &peer, &peer_uuid, cursor).await
        };
        match pull {
            Ok((pulled, conflicts, errors)) => {
                summary.pulled = pulled;
                summary.conflicts += conflicts;
                summary.errors.extend(errors);
            }
            Err(e) => summary.errors.push(format!("Pull failed: {}", e)),
        }

        // Fetch bytes for any audio record whose file is absent locally,
        // metadata changed or not
        if handshake.supports_audio {
            if let Some(storage) = &self.audio {
                let (downloaded, errors) = self
                    .download_missing_audio(&client, &peer.peer_url, storage)
                    .await;
                if downloaded > 0 {
                    tracing::info!(peer = %peer.peer_name, downloaded, "fetched audio files");
                }
                summary.errors.extend(errors);
            }
        }

        match self
            .push(&client, &peer, &peer_uuid, handshake.supports_audio)
            .await
        {
            Ok((pushed, conflicts, errors)) => {
                summary.pushed = pushed;
                summary.conflicts += conflicts;
                summary.errors.extend(errors);
            }
            Err(e) => summary.errors.push(format!("Push failed: {}", e)),
        }

        summary.success = summary.errors.is_empty();
        summary
    }

    /// Pull changes from a peer without pushing anything back.
    pub async fn pull_from_peer(&self, peer_id: &str) -> SyncSummary {
        let peer = match self.peer(peer_id) {
            Some(p) => p,
            None => return SyncSummary::failure(format!("Unknown peer: {}", peer_id)),
        };
        let lock = self.peer_lock(peer_id);
        let _guard = lock.lock().await;

        let peer_uuid = match Uuid::parse_str(&peer.peer_id) {
            Ok(u) => u,
            Err(_) => return SyncSummary::failure(format!("Invalid peer id: {}", peer.peer_id)),
        };
        let (client, verifier) = match self.build_peer_client(&peer) {
            Ok(pair) => pair,
            Err(e) => return SyncSummary::failure(e.to_string()),
        };
        if let Err(e) = self.handshake(&client, &peer.peer_url).await {
            return SyncSummary::failure(format!("Handshake failed: {}", e));
        }
        self.pin_observed(&peer, &verifier);

        let cursor = {
            let store = self.store.lock().unwrap();
            match store.get_peer_last_sync(&peer_uuid) {
                Ok(c) => c,
                Err(e) => return SyncSummary::failure(e.to_string()),
            }
        };

        let mut summary = SyncSummary::success();
        let pull = if cursor.is_none() {
            self.initial_pull(&client, &peer, &peer_uuid).await
        } else {
            self.pull(&client, &peer, &peer_uuid, cursor).await
        };
        match pull {
            Ok((pulled, conflicts, errors)) => {
                summary.pulled = pulled;
                summary.conflicts = conflicts;
                summary.errors.extend(errors);
            }
            Err(e) => {
                summary.errors.push(e.to_string());
            }
        }
        summary.success = summary.errors.is_empty();
        summary
    }

    /// Push local changes to a peer without pulling.
    pub async fn push_to_peer(&self, peer_id: &str) -> SyncSummary {
        let peer = match self.peer(peer_id) {
            Some(p) => p,
            None => return SyncSummary::failure(format!("Unknown peer: {}", peer_id)),
        };
        let lock = self.peer_lock(peer_id);
        let _guard = lock.lock().await;

        let peer_uuid = match Uuid::parse_str(&peer.peer_id) {
            Ok(u) => u,
            Err(_) => return SyncSummary::failure(format!("Invalid peer id: {}", peer.peer_id)),
        };
        let (client, verifier) = match self.build_peer_client(&peer) {
            Ok(pair) => pair,
            Err(e) => return SyncSummary::failure(e.to_string()),
        };
        let handshake = match self.handshake(&client, &peer.peer_url).await {
            Ok(h) => h,
            Err(e) => return SyncSummary::failure(format!("Handshake failed: {}", e)),
        };
        self.pin_observed(&peer, &verifier);

        let mut summary = SyncSummary::success();
        match self
            .push(&client, &peer, &peer_uuid, handshake.supports_audio)
            .await
        {
            Ok((pushed, conflicts, errors)) => {
                summary.pushed = pushed;
                summary.conflicts = conflicts;
                summary.errors.extend(errors);
            }
            Err(e) => {
                summary.errors.push(e.to_string());
            }
        }
        summary.success = summary.errors.is_empty();
        summary
    }

    /// Probe whether a peer is reachable and who it claims to be.
    pub async fn check_peer_status(&self, peer_id: &str) -> PeerStatus {
        let peer = match self.peer(peer_id) {
            Some(p) => p,
            None => {
                return PeerStatus {
                    error: Some("Unknown peer".to_string()),
                    ..Default::default()
                }
            }
        };
        let (client, verifier) = match self.build_peer_client(&peer) {
            Ok(pair) => pair,
            Err(e) => {
                return PeerStatus {
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };

        let response = match client
            .get(format!("{}/sync/status", peer.peer_url))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return PeerStatus {
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };
        if !response.status().is_success() {
            return PeerStatus {
                error: Some(format!("HTTP {}", response.status())),
                ..Default::default()
            };
        }
        match response.json::<StatusResponse>().await {
            Ok(data) => {
                self.pin_observed(&peer, &verifier);
                PeerStatus {
                    reachable: true,
                    device_id: Some(data.device_id),
                    device_name: Some(data.device_name),
                    supports_audio: data.supports_audio,
                    error: None,
                }
            }
            Err(e) => PeerStatus {
                error: Some(e.to_string()),
                ..Default::default()
            },
        }
    }

    /// Sync with every configured peer, sequentially.
    pub async fn sync_all_peers(&self) -> HashMap<String, SyncSummary> {
        let peer_ids: Vec<String> = {
            let cfg = self.config.lock().unwrap();
            cfg.peers().iter().map(|p| p.peer_id.clone()).collect()
        };

        let mut results = HashMap::new();
        for peer_id in peer_ids {
            let result = self.sync_with_peer(&peer_id).await;
            results.insert(peer_id, result);
        }
        results
    }

    // Internal methods

    fn peer(&self, peer_id: &str) -> Option<PeerConfig> {
        let cfg = self.config.lock().unwrap();
        cfg.get_peer(peer_id).cloned()
    }

    fn peer_lock(&self, peer_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.peer_locks.lock().unwrap();
        locks
            .entry(peer_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Build an HTTP client whose TLS verification is the peer's pinned
    /// fingerprint (or accept-and-record on first contact).
    fn build_peer_client(&self, peer: &PeerConfig) -> SyncResult<(Client, Arc<PinnedCertVerifier>)> {
        let verifier = Arc::new(PinnedCertVerifier::new(
            peer.certificate_fingerprint.clone(),
        ));
        let tls = client_tls_config(verifier.clone())?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .use_preconfigured_tls(tls)
            .build()
            .map_err(|e| SyncError::network(e.to_string()))?;
        Ok((client, verifier))
    }

    /// Persist the observed fingerprint for a peer with no pin yet.
    fn pin_observed(&self, peer: &PeerConfig, verifier: &PinnedCertVerifier) {
        if peer.certificate_fingerprint.is_some() {
            return;
        }
        if let Some(fingerprint) = verifier.observed_fingerprint() {
            let mut cfg = self.config.lock().unwrap();
            match cfg.update_peer_certificate(&peer.peer_id, &fingerprint) {
                Ok(true) => {
                    tracing::info!(
                        peer = %peer.peer_name,
                        %fingerprint,
                        "pinned peer certificate on first contact"
                    );
                }
                Ok(false) => {}
                Err(e) => tracing::warn!("Failed to pin peer certificate: {}", e),
            }
        }
    }

    fn warn_on_clock_skew(&self, peer: &PeerConfig, server_timestamp: i64) {
        let skew = (server_timestamp - Store::now()).abs();
        if skew > CLOCK_SKEW_WARN_SECS {
            tracing::warn!(
                peer = %peer.peer_name,
                skew_secs = skew,
                "large clock skew with peer; sync cursors may lag"
            );
        }
    }

    async fn handshake(&self, client: &Client, peer_url: &str) -> SyncResult<HandshakeResponse> {
        let request = HandshakeRequest {
            device_id: self.ctx.device_id_hex(),
            device_name: self.ctx.device_name.clone(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        };

        let response = client
            .post(format!("{}/sync/handshake", peer_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| SyncError::network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SyncError::sync(format!(
                "Handshake failed with status {}",
                response.status()
            )));
        }

        response
            .json::<HandshakeResponse>()
            .await
            .map_err(|e| SyncError::protocol(format!("Failed to parse handshake response: {}", e)))
    }

    /// Incremental pull: walk pages from the local cursor, apply each, and
    /// advance the cursor to the final high-water mark only when every
    /// page applied without errors.
    async fn pull(
        &self,
        client: &Client,
        peer: &PeerConfig,
        peer_uuid: &Uuid,
        mut since: Option<i64>,
    ) -> SyncResult<(i64, i64, Vec<String>)> {
        let mut pulled = 0i64;
        let mut conflicts = 0i64;
        let mut errors: Vec<String> = Vec::new();
        let mut high = since;

        loop {
            let url = match since {
                Some(ts) => format!(
                    "{}/sync/changes?since={}&limit={}",
                    peer.peer_url, ts, PULL_PAGE_LIMIT
                ),
                None => format!("{}/sync/changes?limit={}", peer.peer_url, PULL_PAGE_LIMIT),
            };
            let response = client
                .get(&url)
                .send()
                .await
                .map_err(|e| SyncError::network(e.to_string()))?;
            if !response.status().is_success() {
                return Err(SyncError::sync(format!(
                    "Pull failed with status {}",
                    response.status()
                )));
            }
            let batch: ChangesResponse = response
                .json()
                .await
                .map_err(|e| SyncError::protocol(format!("Failed to parse changes: {}", e)))?;
            tracing::debug!(
                peer = %peer.peer_name,
                records = batch.changes.len(),
                is_complete = batch.is_complete,
                "pulled page"
            );

            let report = {
                let store = self.store.lock().unwrap();
                let engine = ApplyEngine::new(&store, &self.ctx);
                engine.apply_batch(batch.changes, peer_uuid)?
            };
            pulled += report.applied;
            conflicts += report.conflicts;
            errors.extend(report.errors);

            if let Some(ts) = batch.to_timestamp {
                high = Some(high.map_or(ts, |h| h.max(ts)));
            }
            if batch.is_complete {
                break;
            }
            // Pages cut along the timestamp order; resuming at the last
            // timestamp re-fetches boundary ties, which apply idempotently
            match batch.to_timestamp {
                Some(ts) if Some(ts) != since => since = Some(ts),
                _ => {
                    errors.push("pull page made no progress".to_string());
                    break;
                }
            }
        }

        if errors.is_empty() {
            if let Some(ts) = high {
                let store = self.store.lock().unwrap();
                store.set_peer_sync_time(peer_uuid, Some(&peer.peer_name), ts)?;
            }
        }
        Ok((pulled, conflicts, errors))
    }

    /// First sync with a peer: fetch the complete snapshot and replay it
    /// through the apply engine, so overlapping local data goes through
    /// the same conflict rules as an incremental pull.
    async fn initial_pull(
        &self,
        client: &Client,
        peer: &PeerConfig,
        peer_uuid: &Uuid,
    ) -> SyncResult<(i64, i64, Vec<String>)> {
        tracing::info!(peer = %peer.peer_name, "no cursor for peer, running initial sync");

        let response = client
            .get(format!("{}/sync/full", peer.peer_url))
            .send()
            .await
            .map_err(|e| SyncError::network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SyncError::sync(format!(
                "Full sync failed with status {}",
                response.status()
            )));
        }
        let full: FullSyncResponse = response
            .json()
            .await
            .map_err(|e| SyncError::protocol(format!("Failed to parse full dataset: {}", e)))?;

        let changes = dataset_to_changes(
            &full.dataset,
            &full.device_id,
            Some(full.device_name.as_str()),
        );
        let high = changes.iter().map(|c| c.timestamp).max();
        tracing::debug!(
            peer = %peer.peer_name,
            records = changes.len(),
            "applying full dataset"
        );

        let report = {
            let store = self.store.lock().unwrap();
            let engine = ApplyEngine::new(&store, &self.ctx);
            engine.apply_batch(changes, peer_uuid)?
        };

        if report.is_clean() {
            if let Some(ts) = high {
                let store = self.store.lock().unwrap();
                store.set_peer_sync_time(peer_uuid, Some(&peer.peer_name), ts)?;
            }
        }
        Ok((report.applied, report.conflicts, report.errors))
    }

    /// Push local changes since the peer cursor, page by page, uploading
    /// audio bytes next to their metadata records.
    async fn push(
        &self,
        client: &Client,
        peer: &PeerConfig,
        peer_uuid: &Uuid,
        peer_supports_audio: bool,
    ) -> SyncResult<(i64, i64, Vec<String>)> {
        let mut since = {
            let store = self.store.lock().unwrap();
            store.get_peer_last_sync(peer_uuid)?
        };
        let mut pushed = 0i64;
        let mut conflicts = 0i64;
        let mut errors: Vec<String> = Vec::new();
        let mut high = since;

        loop {
            let page = {
                let store = self.store.lock().unwrap();
                store.changes_since(
                    since,
                    PUSH_PAGE_LIMIT,
                    &self.ctx.device_id_hex(),
                    Some(&self.ctx.device_name),
                )?
            };
            if page.changes.is_empty() {
                break;
            }
            tracing::debug!(
                peer = %peer.peer_name,
                records = page.changes.len(),
                is_complete = page.is_complete,
                "pushing page"
            );

            let audio_in_page: Vec<AudioFile> = page
                .changes
                .iter()
                .filter_map(|c| match &c.entity {
                    EntityChange::AudioFile(audio)
                        if c.operation != Operation::Delete && !audio.is_deleted() =>
                    {
                        Some(audio.clone())
                    }
                    _ => None,
                })
                .collect();

            let request = PushRequest {
                device_id: self.ctx.device_id_hex(),
                device_name: self.ctx.device_name.clone(),
                changes: &page.changes,
            };
            let response = client
                .post(format!("{}/sync/apply", peer.peer_url))
                .json(&request)
                .send()
                .await
                .map_err(|e| SyncError::network(e.to_string()))?;

            let status = response.status();
            // 207 and 422 still carry a per-record report worth surfacing
            if !(status.is_success()
                || status == StatusCode::MULTI_STATUS
                || status == StatusCode::UNPROCESSABLE_ENTITY)
            {
                return Err(SyncError::sync(format!(
                    "Push failed with status {}",
                    status
                )));
            }
            let result: ApplyResponse = response
                .json()
                .await
                .map_err(|e| SyncError::protocol(format!("Failed to parse apply response: {}", e)))?;
            pushed += result.applied;
            conflicts += result.conflicts;
            errors.extend(result.errors);

            if peer_supports_audio {
                if let Some(storage) = &self.audio {
                    for audio in &audio_in_page {
                        if !storage.exists(audio) {
                            continue;
                        }
                        if let Err(e) = self
                            .upload_audio(client, &peer.peer_url, storage, audio)
                            .await
                        {
                            errors.push(format!("audio {}: {}", audio.id.simple(), e));
                        }
                    }
                }
            }

            if let Some(ts) = page.latest_timestamp {
                high = Some(high.map_or(ts, |h| h.max(ts)));
            }
            if page.is_complete {
                break;
            }
            match page.latest_timestamp {
                Some(ts) if Some(ts) != since => since = Some(ts),
                _ => {
                    errors.push("push page made no progress".to_string());
                    break;
                }
            }
        }

        if errors.is_empty() {
            if let Some(ts) = high {
                let store = self.store.lock().unwrap();
                store.set_peer_sync_time(peer_uuid, Some(&peer.peer_name), ts)?;
            }
        }
        Ok((pushed, conflicts, errors))
    }

    /// Fetch bytes for every audio record missing its file locally.
    /// Presence, not metadata freshness, gates the fetch; already-present
    /// files are never re-downloaded.
    async fn download_missing_audio(
        &self,
        client: &Client,
        peer_url: &str,
        storage: &AudioStorage,
    ) -> (i64, Vec<String>) {
        let audio_files = {
            let store = self.store.lock().unwrap();
            match store.list_audio_files() {
                Ok(files) => files,
                Err(e) => return (0, vec![format!("audio listing failed: {}", e)]),
            }
        };

        let mut downloaded = 0i64;
        let mut errors = Vec::new();
        for audio in audio_files.iter().filter(|a| !a.is_deleted()) {
            if storage.exists(audio) {
                continue;
            }
            match self.download_audio(client, peer_url, storage, audio).await {
                Ok(true) => downloaded += 1,
                // The peer does not have the bytes either
                Ok(false) => {}
                Err(e) => errors.push(format!("audio {}: {}", audio.id.simple(), e)),
            }
        }
        (downloaded, errors)
    }

    async fn download_audio(
        &self,
        client: &Client,
        peer_url: &str,
        storage: &AudioStorage,
        audio: &AudioFile,
    ) -> SyncResult<bool> {
        let url = format!("{}/sync/audio/{}/file", peer_url, audio.id.simple());
        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| SyncError::network(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(SyncError::sync(format!(
                "Download failed with status {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SyncError::network(e.to_string()))?;
        storage.write(audio, &bytes)?;
        tracing::debug!(id = %audio.id.simple(), bytes = bytes.len(), "downloaded audio file");
        Ok(true)
    }

    async fn upload_audio(
        &self,
        client: &Client,
        peer_url: &str,
        storage: &AudioStorage,
        audio: &AudioFile,
    ) -> SyncResult<()> {
        let bytes = storage.read(audio)?;
        let url = format!("{}/sync/audio/{}/file", peer_url, audio.id.simple());
        let response = client
            .post(&url)
            .body(bytes)
            .send()
            .await
            .map_err(|e| SyncError::network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SyncError::sync(format!(
                "Upload failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Turn a full dataset snapshot into change records the apply engine can
/// replay: tombstones become deletes, modified rows become updates.
pub fn dataset_to_changes(
    dataset: &FullDataset,
    device_id: &str,
    device_name: Option<&str>,
) -> Vec<ChangeRecord> {
    let mut changes: Vec<ChangeRecord> = Vec::new();
    let mut push = |entity: EntityChange, operation: Operation, timestamp: i64| {
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

    for note in &dataset.notes {
        let timestamp = note.modified_at.unwrap_or(note.created_at);
        let operation = if note.deleted_at.is_some() {
            Operation::Delete
        } else if note.modified_at.is_some() {
            Operation::Update
        } else {
            Operation::Create
        };
        push(EntityChange::Note(note.clone()), operation, timestamp);
    }
    for tag in &dataset.tags {
        let timestamp = tag.modified_at.unwrap_or(tag.created_at);
        let operation = if tag.modified_at.is_some() {
            Operation::Update
        } else {
            Operation::Create
        };
        push(EntityChange::Tag(tag.clone()), operation, timestamp);
    }
    for audio in &dataset.audio_files {
        let timestamp = audio.modified_at.unwrap_or(audio.imported_at);
        let operation = if audio.deleted_at.is_some() {
            Operation::Delete
        } else if audio.modified_at.is_some() {
            Operation::Update
        } else {
            Operation::Create
        };
        push(EntityChange::AudioFile(audio.clone()), operation, timestamp);
    }
    for nt in &dataset.note_tags {
        push(
            EntityChange::NoteTag(nt.clone()),
            Operation::Create,
            nt.created_at,
        );
    }
    for attachment in &dataset.note_attachments {
        let timestamp = attachment.modified_at.unwrap_or(attachment.created_at);
        let operation = if attachment.deleted_at.is_some() {
            Operation::Delete
        } else if attachment.modified_at.is_some() {
            Operation::Update
        } else {
            Operation::Create
        };
        push(
            EntityChange::NoteAttachment(attachment.clone()),
            operation,
            timestamp,
        );
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Note, NoteTag, Tag};

    #[test]
    fn test_summary_helpers() {
        assert!(SyncSummary::success().success);
        let failure = SyncSummary::failure("boom");
        assert!(!failure.success);
        assert_eq!(failure.errors, vec!["boom".to_string()]);
    }

    #[test]
    fn test_dataset_to_changes_maps_operations() {
        let mut note = Note::new("alive".to_string());
        let mut dead = Note::new("dead".to_string());
        dead.deleted_at = Some(dead.created_at + 5);
        dead.modified_at = Some(dead.created_at + 5);
        note.modified_at = Some(note.created_at + 3);

        let tag = Tag::new("inbox".to_string(), None);
        let nt = NoteTag::new(note.id, tag.id);

        let dataset = FullDataset {
            notes: vec![note.clone(), dead.clone()],
            tags: vec![tag.clone()],
            note_tags: vec![nt.clone()],
            audio_files: vec![],
            note_attachments: vec![],
        };
        let changes = dataset_to_changes(&dataset, "abc123", Some("Peer"));
        assert_eq!(changes.len(), 4);

        let by_id = |id: &str| changes.iter().find(|c| c.entity_id == id).unwrap();
        assert_eq!(by_id(&note.id_hex()).operation, Operation::Update);
        assert_eq!(
            by_id(&note.id_hex()).timestamp,
            note.modified_at.unwrap()
        );
        assert_eq!(by_id(&dead.id_hex()).operation, Operation::Delete);
        assert_eq!(by_id(&tag.id_hex()).operation, Operation::Create);
        assert_eq!(by_id(&nt.entity_id()).operation, Operation::Create);
        assert!(changes.iter().all(|c| c.device_id == "abc123"));
    }

    #[tokio::test]
    async fn test_unknown_peer_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        let config = Arc::new(Mutex::new(
            Config::new(Some(dir.path().to_path_buf())).unwrap(),
        ));
        let client = SyncClient::new(store, config, None).unwrap();

        let summary = client.sync_with_peer("nope").await;
        assert!(!summary.success);
        assert!(summary.errors[0].contains("Unknown peer"));

        let status = client.check_peer_status("nope").await;
        assert!(!status.reachable);
    }

    #[test]
    fn test_peer_locks_are_scoped_per_peer() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        let config = Arc::new(Mutex::new(
            Config::new(Some(dir.path().to_path_buf())).unwrap(),
        ));
        let client = SyncClient::new(store, config, None).unwrap();

        let a1 = client.peer_lock("peer-a");
        let a2 = client.peer_lock("peer-a");
        let b = client.peer_lock("peer-b");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
    }
}

#[cfg(all(test, feature = "server"))]
mod http_tests {
    use super::*;
    use crate::server::{create_router, AppState};
    use std::net::SocketAddr;

    async fn spawn_server(state: AppState) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = create_router(state);
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn client_for(
        addr: SocketAddr,
        server_id: &Uuid,
        audio_dir: Option<&std::path::Path>,
    ) -> (SyncClient, Arc<Mutex<Store>>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        let mut config = Config::new(Some(dir.path().to_path_buf())).unwrap();
        config
            .add_peer(
                &server_id.simple().to_string(),
                "Test Server",
                &format!("http://{}", addr),
                None,
            )
            .unwrap();
        let audio = audio_dir.map(|d| AudioStorage::new(d).unwrap());
        let client = SyncClient::new(store.clone(), Arc::new(Mutex::new(config)), audio).unwrap();
        (client, store, dir)
    }

    #[tokio::test]
    async fn test_bidirectional_sync_over_http() {
        let server_store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        let server_id = Uuid::now_v7();
        let server_note = {
            let store = server_store.lock().unwrap();
            store.create_note("from the server").unwrap()
        };
        let state = AppState::new(
            server_store.clone(),
            SyncContext::new(server_id, "Server"),
            None,
        );
        let addr = spawn_server(state).await;

        let (client, client_store, _config_dir) = client_for(addr, &server_id, None);
        let client_note = {
            let store = client_store.lock().unwrap();
            store.create_note("from the client").unwrap()
        };

        let peer_id = server_id.simple().to_string();
        let summary = client.sync_with_peer(&peer_id).await;
        assert!(summary.success, "sync errors: {:?}", summary.errors);
        assert!(summary.pulled >= 1);
        assert!(summary.pushed >= 1);

        // Both sides now hold both notes
        {
            let store = client_store.lock().unwrap();
            assert!(store.get_note(&server_note.id).unwrap().is_some());
        }
        {
            let store = server_store.lock().unwrap();
            assert!(store.get_note(&client_note.id).unwrap().is_some());
        }

        // A second sync moves nothing
        let again = client.sync_with_peer(&peer_id).await;
        assert!(again.success, "sync errors: {:?}", again.errors);
        assert_eq!(again.pulled, 0);
        assert_eq!(again.pushed, 0);
    }

    #[tokio::test]
    async fn test_audio_bytes_reconcile_over_http() {
        let server_dir = tempfile::tempdir().unwrap();
        let client_dir = tempfile::tempdir().unwrap();

        let server_store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        let server_id = Uuid::now_v7();
        let server_storage = AudioStorage::new(server_dir.path()).unwrap();
        let audio = AudioFile::new("memo.ogg".to_string());
        {
            let store = server_store.lock().unwrap();
            store.create_audio_file(&audio).unwrap();
        }
        server_storage.write(&audio, b"OggS bytes").unwrap();

        let state = AppState::new(
            server_store.clone(),
            SyncContext::new(server_id, "Server"),
            Some(server_storage),
        );
        let addr = spawn_server(state).await;

        let (client, client_store, _config_dir) = client_for(addr, &server_id, Some(client_dir.path()));
        let summary = client.sync_with_peer(&server_id.simple().to_string()).await;
        assert!(summary.success, "sync errors: {:?}", summary.errors);

        // Metadata arrived through the change stream, bytes through the
        // binary endpoint
        {
            let store = client_store.lock().unwrap();
            assert!(store.get_audio_file(&audio.id).unwrap().is_some());
        }
        let client_storage = AudioStorage::new(client_dir.path()).unwrap();
        assert_eq!(client_storage.read(&audio).unwrap(), b"OggS bytes");
    }

    #[tokio::test]
    async fn test_failed_sync_leaves_cursor_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        let mut config = Config::new(Some(dir.path().to_path_buf())).unwrap();
        let peer_uuid = Uuid::now_v7();
        // Nothing listens on this port
        config
            .add_peer(
                &peer_uuid.simple().to_string(),
                "Ghost",
                "http://127.0.0.1:1",
                None,
            )
            .unwrap();
        let client =
            SyncClient::new(store.clone(), Arc::new(Mutex::new(config)), None).unwrap();

        let summary = client.sync_with_peer(&peer_uuid.simple().to_string()).await;
        assert!(!summary.success);

        let store = store.lock().unwrap();
        assert!(store.get_peer_last_sync(&peer_uuid).unwrap().is_none());
    }
}
