//! Durable storage of finished keygen results.
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, warn};

use crate::{error::StorageError, peers::CeremonyMetadata, peers::PeerId};

pub const KEYGEN_FILE_NAME: &str = "keygen.json";

/// Ceremony metadata together with the engine's save data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRecord {
    pub peer_id: PeerId,
    pub meta_data: CeremonyMetadata,
    pub keygen_data: serde_json::Value,
}

impl PersistedRecord {
    pub fn new<T: Serialize>(
        peer_id: PeerId,
        meta_data: CeremonyMetadata,
        keygen_data: &T,
    ) -> Result<Self, StorageError> {
        Ok(PersistedRecord {
            peer_id,
            meta_data,
            keygen_data: serde_json::to_value(keygen_data)?,
        })
    }

    pub fn keygen_data<T: DeserializeOwned>(&self) -> Result<T, StorageError> {
        Ok(serde_json::from_value(self.keygen_data.clone())?)
    }
}

#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn write(&self, ceremony_type: &str, record: &PersistedRecord) -> Result<(), StorageError>;

    /// The record stored for `local`, if there is one.
    async fn load(
        &self,
        ceremony_type: &str,
        local: &PeerId,
    ) -> Result<Option<PersistedRecord>, StorageError>;
}

/// Stores one JSON record per ceremony type under `<root>/<ceremony_type>/keygen.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, ceremony_type: &str) -> PathBuf {
        self.root.join(ceremony_type).join(KEYGEN_FILE_NAME)
    }
}

#[async_trait]
impl KeyStore for FileStore {
    async fn write(&self, ceremony_type: &str, record: &PersistedRecord) -> Result<(), StorageError> {
        let path = self.record_path(ceremony_type);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }

        // write then rename so a crash never leaves a truncated record behind
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record)?;
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;

        debug!(path = %path.display(), "wrote keygen record");
        Ok(())
    }

    async fn load(
        &self,
        ceremony_type: &str,
        local: &PeerId,
    ) -> Result<Option<PersistedRecord>, StorageError> {
        let path = self.record_path(ceremony_type);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: PersistedRecord = serde_json::from_slice(&bytes)?;
        if &record.peer_id != local {
            warn!(
                stored = %record.peer_id,
                %local,
                "keygen record belongs to another peer"
            );
            return Ok(None);
        }
        Ok(Some(record))
    }
}
