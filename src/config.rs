//! Configuration management for Recall.
//!
//! Configuration lives in a JSON file under the config directory:
//! - device_id: UUID7 identifying this device (generated on first run)
//! - device_name: human-readable device name
//! - sync: peer list, server port, enabled flag
//! - audiofile_directory: where audio bytes are stored
//!
//! Peer certificate fingerprints are pinned here, not in the database, so
//! wiping the database does not silently re-open the trust decision.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::apply::SyncContext;
use crate::error::{SyncError, SyncResult};

/// A configured sync peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub peer_id: String,
    pub peer_name: String,
    pub peer_url: String,
    /// TOFU pin; None until the first successful connection
    pub certificate_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

fn default_server_port() -> u16 {
    8384
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_port: default_server_port(),
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigData {
    /// Path to the database file
    #[serde(default)]
    pub database_file: String,
    /// Device ID (UUID7 hex)
    #[serde(default = "generate_device_id")]
    pub device_id: String,
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default)]
    pub sync: SyncConfig,
    /// Fingerprint of this device's own server certificate
    pub server_certificate_fingerprint: Option<String>,
    /// Directory for storing audio files; binary sync is disabled without it
    pub audiofile_directory: Option<String>,
}

fn generate_device_id() -> String {
    Uuid::now_v7().simple().to_string()
}

fn default_device_name() -> String {
    match hostname::get() {
        Ok(name) => format!("Recall on {}", name.to_string_lossy()),
        Err(_) => "Recall Device".to_string(),
    }
}

impl Default for ConfigData {
    fn default() -> Self {
        Self {
            database_file: String::new(),
            device_id: generate_device_id(),
            device_name: default_device_name(),
            sync: SyncConfig::default(),
            server_certificate_fingerprint: None,
            audiofile_directory: None,
        }
    }
}

pub struct Config {
    config_dir: PathBuf,
    config_file: PathBuf,
    data: ConfigData,
}

impl Config {
    pub fn new(config_dir: Option<PathBuf>) -> SyncResult<Self> {
        let config_dir = match config_dir {
            Some(dir) => dir,
            None => dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("recall"),
        };

        fs::create_dir_all(&config_dir)?;
        let config_file = config_dir.join("config.json");

        let data = if config_file.exists() {
            let content = fs::read_to_string(&config_file)?;
            serde_json::from_str(&content).unwrap_or_else(|_| {
                let mut default = ConfigData::default();
                default.database_file =
                    config_dir.join("recall.db").to_string_lossy().to_string();
                default
            })
        } else {
            let mut default = ConfigData::default();
            default.database_file = config_dir.join("recall.db").to_string_lossy().to_string();
            default
        };

        let config = Self {
            config_dir,
            config_file,
            data,
        };
        if !config.config_file.exists() {
            config.save()?;
        }
        Ok(config)
    }

    pub fn save(&self) -> SyncResult<()> {
        let content = serde_json::to_string_pretty(&self.data)?;
        fs::write(&self.config_file, content)?;
        Ok(())
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn database_file(&self) -> &str {
        &self.data.database_file
    }

    pub fn device_id(&self) -> SyncResult<Uuid> {
        Uuid::parse_str(&self.data.device_id)
            .map_err(|e| SyncError::Config(format!("invalid device_id in config: {}", e)))
    }

    pub fn device_id_hex(&self) -> &str {
        &self.data.device_id
    }

    pub fn device_name(&self) -> &str {
        &self.data.device_name
    }

    pub fn set_device_name(&mut self, name: &str) -> SyncResult<()> {
        self.data.device_name = name.to_string();
        self.save()
    }

    /// Local identity as passed through the sync stack.
    pub fn sync_context(&self) -> SyncResult<SyncContext> {
        Ok(SyncContext::new(self.device_id()?, self.device_name()))
    }

    pub fn is_sync_enabled(&self) -> bool {
        self.data.sync.enabled
    }

    pub fn set_sync_enabled(&mut self, enabled: bool) -> SyncResult<()> {
        self.data.sync.enabled = enabled;
        self.save()
    }

    pub fn sync_server_port(&self) -> u16 {
        self.data.sync.server_port
    }

    pub fn set_sync_server_port(&mut self, port: u16) -> SyncResult<()> {
        self.data.sync.server_port = port;
        self.save()
    }

    pub fn peers(&self) -> &[PeerConfig] {
        &self.data.sync.peers
    }

    pub fn add_peer(
        &mut self,
        peer_id: &str,
        peer_name: &str,
        peer_url: &str,
        certificate_fingerprint: Option<String>,
    ) -> SyncResult<()> {
        if self.data.sync.peers.iter().any(|p| p.peer_id == peer_id) {
            return Err(SyncError::Config(format!(
                "peer {} already configured",
                peer_id
            )));
        }
        self.data.sync.peers.push(PeerConfig {
            peer_id: peer_id.to_string(),
            peer_name: peer_name.to_string(),
            peer_url: peer_url.trim_end_matches('/').to_string(),
            certificate_fingerprint,
        });
        self.save()
    }

    pub fn remove_peer(&mut self, peer_id: &str) -> SyncResult<bool> {
        let before = self.data.sync.peers.len();
        self.data.sync.peers.retain(|p| p.peer_id != peer_id);
        let removed = self.data.sync.peers.len() < before;
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    pub fn get_peer(&self, peer_id: &str) -> Option<&PeerConfig> {
        self.data.sync.peers.iter().find(|p| p.peer_id == peer_id)
    }

    /// Pin (or re-pin) a peer's certificate fingerprint.
    pub fn update_peer_certificate(&mut self, peer_id: &str, fingerprint: &str) -> SyncResult<bool> {
        let found = self
            .data
            .sync
            .peers
            .iter_mut()
            .find(|p| p.peer_id == peer_id);
        match found {
            Some(peer) => {
                peer.certificate_fingerprint = Some(fingerprint.to_string());
                self.save()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn server_certificate_fingerprint(&self) -> Option<&str> {
        self.data.server_certificate_fingerprint.as_deref()
    }

    pub fn set_server_certificate_fingerprint(&mut self, fingerprint: &str) -> SyncResult<()> {
        self.data.server_certificate_fingerprint = Some(fingerprint.to_string());
        self.save()
    }

    pub fn certs_dir(&self) -> SyncResult<PathBuf> {
        let dir = self.config_dir.join("certs");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn audiofile_directory(&self) -> Option<&str> {
        self.data.audiofile_directory.as_deref()
    }

    pub fn set_audiofile_directory(&mut self, path: &str) -> SyncResult<()> {
        self.data.audiofile_directory = Some(path.to_string());
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_config_generates_identity() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(config.device_id_hex().len(), 32);
        assert!(config.device_id().is_ok());
        assert!(!config.device_name().is_empty());
        assert!(dir.path().join("config.json").exists());
    }

    #[test]
    fn test_identity_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let config = Config::new(Some(dir.path().to_path_buf())).unwrap();
            config.device_id_hex().to_string()
        };
        let config = Config::new(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(config.device_id_hex(), id);
    }

    #[test]
    fn test_peer_management() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(Some(dir.path().to_path_buf())).unwrap();
        let peer_id = Uuid::now_v7().simple().to_string();

        config
            .add_peer(&peer_id, "Laptop", "https://laptop.local:8384/", None)
            .unwrap();
        // Trailing slash is normalized away
        assert_eq!(
            config.get_peer(&peer_id).unwrap().peer_url,
            "https://laptop.local:8384"
        );
        assert!(config.add_peer(&peer_id, "Laptop", "x", None).is_err());

        assert!(config
            .update_peer_certificate(&peer_id, "SHA256:aa:bb")
            .unwrap());
        assert_eq!(
            config
                .get_peer(&peer_id)
                .unwrap()
                .certificate_fingerprint
                .as_deref(),
            Some("SHA256:aa:bb")
        );

        assert!(config.remove_peer(&peer_id).unwrap());
        assert!(!config.remove_peer(&peer_id).unwrap());
    }
}
