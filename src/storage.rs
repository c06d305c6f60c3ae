//! Local storage for audio file bytes.
//!
//! The sync protocol moves audio metadata through the JSON change stream
//! and the bytes through dedicated binary endpoints. This module owns the
//! bytes: one file per audio record under a configured directory, named
//! `<id>.<extension>` so the store needs no extra bookkeeping table.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{SyncError, SyncResult};
use crate::models::AudioFile;

#[derive(Debug, Clone)]
pub struct AudioStorage {
    root: PathBuf,
}

impl AudioStorage {
    /// Open (creating if needed) the storage directory.
    pub fn new(root: impl Into<PathBuf>) -> SyncResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonical on-disk location for an audio record's bytes.
    pub fn path_for(&self, audio: &AudioFile) -> PathBuf {
        self.root
            .join(format!("{}.{}", audio.id.simple(), audio.extension()))
    }

    pub fn exists(&self, audio: &AudioFile) -> bool {
        self.path_for(audio).is_file()
    }

    pub fn read(&self, audio: &AudioFile) -> SyncResult<Vec<u8>> {
        let path = self.path_for(audio);
        if !path.is_file() {
            return Err(SyncError::NotFound(format!(
                "audio bytes for {}",
                audio.id.simple()
            )));
        }
        Ok(fs::read(path)?)
    }

    /// Write bytes for an audio record. Writes to a temp name first and
    /// renames, so a crashed transfer never leaves a half-written file
    /// that `exists` would treat as complete.
    pub fn write(&self, audio: &AudioFile, bytes: &[u8]) -> SyncResult<PathBuf> {
        let path = self.path_for(audio);
        let tmp = path.with_extension("part");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(path)
    }

    /// Copy an existing file into storage under the record's canonical name.
    pub fn import(&self, audio: &AudioFile, source: &Path) -> SyncResult<PathBuf> {
        if !source.is_file() {
            return Err(SyncError::NotFound(format!(
                "source file {}",
                source.display()
            )));
        }
        let path = self.path_for(audio);
        fs::copy(source, &path)?;
        Ok(path)
    }

    pub fn remove(&self, audio: &AudioFile) -> SyncResult<bool> {
        let path = self.path_for(audio);
        if path.is_file() {
            fs::remove_file(path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn size(&self, audio: &AudioFile) -> SyncResult<u64> {
        Ok(fs::metadata(self.path_for(audio))?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AudioFile;

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = AudioStorage::new(dir.path()).unwrap();
        let audio = AudioFile::new("memo.ogg".to_string());

        assert!(!storage.exists(&audio));
        storage.write(&audio, b"OggS...").unwrap();
        assert!(storage.exists(&audio));
        assert_eq!(storage.read(&audio).unwrap(), b"OggS...");
        assert_eq!(storage.size(&audio).unwrap(), 7);

        let path = storage.path_for(&audio);
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            format!("{}.ogg", audio.id.simple())
        );
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = AudioStorage::new(dir.path()).unwrap();
        let audio = AudioFile::new("gone.mp3".to_string());
        let err = storage.read(&audio).unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[test]
    fn test_import_copies_source() {
        let dir = tempfile::tempdir().unwrap();
        let storage = AudioStorage::new(dir.path().join("store")).unwrap();
        let source = dir.path().join("recording.wav");
        std::fs::write(&source, b"RIFF").unwrap();

        let audio = AudioFile::new("recording.wav".to_string());
        storage.import(&audio, &source).unwrap();
        assert!(storage.exists(&audio));
        assert!(source.is_file()); // import copies, never moves

        assert!(storage.remove(&audio).unwrap());
        assert!(!storage.remove(&audio).unwrap());
    }
}
