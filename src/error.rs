use std::time::Duration;

use thiserror::Error;

/// Errors raised by a keygen engine while starting or processing messages.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid party parameters: {0}")]
    InvalidParameters(String),
    #[error("message from unknown party {0}")]
    UnknownSender(String),
    #[error("duplicate {round} message from {sender}")]
    Duplicate { round: &'static str, sender: String },
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("protocol failure: {0}")]
    Protocol(String),
    #[error("party output channel closed")]
    OutputClosed,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} stopped receiving messages")]
    Disconnected(String),
    #[error("peer {0} is already subscribed")]
    AlreadySubscribed(String),
    #[error("failed to encode payload: {0}")]
    Encode(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("callback responded with status {0}")]
    Status(u16),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Terminal failure of a keygen ceremony.
///
/// Only the first fatal error observed by the coordinator is returned to the caller.
#[derive(Debug, Error)]
pub enum CeremonyError {
    #[error("local peer {0} is not in the ceremony peer list")]
    LocalIdentityNotFound(String),
    #[error("invalid keygen request: {0}")]
    InvalidRequest(String),
    #[error("failed to start keygen party: {0}")]
    EngineStart(#[source] EngineError),
    #[error("party rejected message from {sender}: {source}")]
    EngineUpdate {
        sender: String,
        #[source]
        source: EngineError,
    },
    #[error("failed to decode message from {sender}: {reason}")]
    Decode { sender: String, reason: String },
    #[error("failed to publish message: {0}")]
    Dispatch(#[source] TransportError),
    #[error("failed to persist keygen data: {0}")]
    Persist(#[source] StorageError),
    #[error("failed to notify {address}: {source}")]
    Notify {
        address: String,
        #[source]
        source: NotifyError,
    },
    #[error("communication channel is closed")]
    ChannelClosed,
    #[error("ceremony did not finish within {0:?}")]
    Timeout(Duration),
}
