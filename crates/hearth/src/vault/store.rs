//! Encrypted record store
//!
//! Records are JSON values stored one per file at
//! `<root>/<collection>/<id>.rec`, each file holding a single envelope.
//! Files written before encryption was enabled hold plain JSON and are
//! read transparently.

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::codec::EncryptionCodec;
use crate::error::{HearthError, Result};

const EXTENSION: &str = "rec";

/// Counts produced by [`RecordStore::scan`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VaultScan {
    pub encrypted: usize,
    pub legacy: usize,
    /// Envelopes that do not authenticate under the current key
    pub unreadable: Vec<String>,
}

/// Clones share the same per-record write locks
#[derive(Debug, Clone)]
pub struct RecordStore {
    root: PathBuf,
    codec: EncryptionCodec,
    locks: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl RecordStore {
    pub fn new(root: impl Into<PathBuf>, codec: EncryptionCodec) -> Self {
        Self {
            root: root.into(),
            codec,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn codec(&self) -> &EncryptionCodec {
        &self.codec
    }

    fn record_path(&self, collection: &str, id: &str) -> Result<PathBuf> {
        validate_record_name(collection)?;
        validate_record_name(id)?;
        Ok(self
            .root
            .join(collection)
            .join(format!("{id}.{EXTENSION}")))
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(path.to_path_buf()).or_default().value())
    }

    /// Encrypt and write a record, replacing any previous version
    pub async fn put<T: Serialize + ?Sized>(&self, collection: &str, id: &str, value: &T) -> Result<()> {
        let path = self.record_path(collection, id)?;
        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;

        self.write_record(&path, value).await?;
        tracing::debug!(collection, id, "Stored record");
        Ok(())
    }

    /// Read, modify and write back a record while holding its write lock
    ///
    /// `f` receives `None` when the record does not exist yet. Concurrent
    /// updates of the same record are applied one after another.
    pub async fn update<T, F>(&self, collection: &str, id: &str, f: F) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> T,
    {
        let path = self.record_path(collection, id)?;
        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;

        let current = self.read_record(&path).await?;
        let next = f(current);
        self.write_record(&path, &next).await?;
        tracing::debug!(collection, id, "Updated record");
        Ok(())
    }

    async fn write_record<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<()> {
        let envelope = self.codec.encrypt_object(value)?;

        let Some(dir) = path.parent() else {
            return Err(HearthError::InvalidRecordName(path.display().to_string()));
        };
        fs::create_dir_all(dir).await?;

        // Write then rename so readers never see a half-written envelope.
        // The temp name is unique per write so concurrent writers never share it.
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("record");
        let tmp = dir.join(format!("{stem}.{}.tmp", Uuid::new_v4()));
        if let Err(e) = fs::write(&tmp, envelope).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Read and decrypt a record; Ok(None) if it does not exist
    pub async fn get<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Result<Option<T>> {
        let path = self.record_path(collection, id)?;
        self.read_record(&path).await
    }

    async fn read_record<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        self.codec.decrypt_object(content.trim()).map(Some)
    }

    /// Remove a record; Ok(false) if it did not exist
    pub async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let path = self.record_path(collection, id)?;
        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Ids in a collection, sorted
    pub async fn list_ids(&self, collection: &str) -> Result<Vec<String>> {
        validate_record_name(collection)?;
        list_record_ids(&self.root.join(collection)).await
    }

    /// Collections present on disk, sorted
    pub async fn collections(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Classify every stored record without deserializing it
    pub async fn scan(&self) -> Result<VaultScan> {
        let strict = self.codec.clone().strict(true);
        let mut scan = VaultScan::default();

        for collection in self.collections().await? {
            let dir = self.root.join(&collection);
            for id in list_record_ids(&dir).await? {
                let path = dir.join(format!("{id}.{EXTENSION}"));
                let content = fs::read_to_string(&path).await?;
                let content = content.trim();
                if !EncryptionCodec::is_encrypted(content) {
                    scan.legacy += 1;
                } else if strict.decrypt(content).is_ok() {
                    scan.encrypted += 1;
                } else {
                    scan.unreadable.push(format!("{collection}/{id}"));
                }
            }
        }
        Ok(scan)
    }
}

async fn list_record_ids(dir: &Path) -> Result<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut ids = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            ids.push(stem.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}

/// Names become path components, so only a safe subset is allowed
pub fn validate_record_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(HearthError::InvalidRecordName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_record_name() {
        for ok in ["conversations", "abc-123", "a_b", "v1.2"] {
            assert!(validate_record_name(ok).is_ok(), "{ok}");
        }
        for bad in ["", "..", ".hidden", "a/b", "a\\b", "../etc", "sp ace"] {
            assert!(
                matches!(validate_record_name(bad), Err(HearthError::InvalidRecordName(_))),
                "{bad}"
            );
        }
    }
}
