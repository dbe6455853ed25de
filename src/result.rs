//! Turning the engine's final output into a durable record and a reported result.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{
    engine::KeygenOutput,
    error::CeremonyError,
    notify::Notifier,
    peers::{CeremonyMetadata, PeerId},
    storage::{KeyStore, PersistedRecord},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeygenStatus {
    Success,
}

/// What the ceremony reports to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeygenResult {
    pub share_id: String,
    /// Hex encoded public key.
    pub public_key: String,
    pub status: KeygenStatus,
}

impl KeygenResult {
    pub fn success<O: KeygenOutput>(output: &O) -> Self {
        KeygenResult {
            share_id: output.share_id(),
            public_key: hex::encode(output.public_key()),
            status: KeygenStatus::Success,
        }
    }
}

/// Persists and reports the output of one ceremony.
pub struct Finalizer {
    pub store: Arc<dyn KeyStore>,
    pub notifier: Arc<dyn Notifier>,
    pub ceremony_type: &'static str,
    pub local: PeerId,
    pub metadata: CeremonyMetadata,
    pub callback_url: String,
}

impl Finalizer {
    /// Write the record, then call back. The callback only runs once the record is durable,
    /// and a failed callback leaves the record in place.
    pub async fn finalize<O: KeygenOutput>(&self, output: O) -> Result<KeygenResult, CeremonyError> {
        let result = KeygenResult::success(&output);
        info!(
            share_id = %result.share_id,
            public_key = %result.public_key,
            ceremony = self.ceremony_type,
            "keygen finished"
        );

        let record = PersistedRecord::new(self.local.clone(), self.metadata, &output)
            .map_err(CeremonyError::Persist)?;
        self.store
            .write(self.ceremony_type, &record)
            .await
            .map_err(CeremonyError::Persist)?;

        if let Err(source) = self.notifier.notify(&self.callback_url, &result).await {
            error!(address = %self.callback_url, %source, "callback failed, keygen record kept");
            return Err(CeremonyError::Notify {
                address: self.callback_url.clone(),
                source,
            });
        }
        Ok(result)
    }
}
