//! Delivery of keygen results to the party that requested the ceremony.
use async_trait::async_trait;
use tracing::info;

use crate::{error::NotifyError, result::KeygenResult};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, address: &str, result: &KeygenResult) -> Result<(), NotifyError>;
}

/// POSTs the result as JSON to the callback address.
#[derive(Debug, Clone, Default)]
pub struct HttpNotifier {
    client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new(client: reqwest::Client) -> Self {
        HttpNotifier { client }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, address: &str, result: &KeygenResult) -> Result<(), NotifyError> {
        let response = self.client.post(address).json(result).send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Logs the result instead of calling anyone; used when no callback is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, address: &str, result: &KeygenResult) -> Result<(), NotifyError> {
        info!(
            address,
            share_id = %result.share_id,
            public_key = %result.public_key,
            "keygen finished"
        );
        Ok(())
    }
}
