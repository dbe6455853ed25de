//! Translation between gossip payloads and engine messages, plus the transport seam.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    engine::EngineMessage,
    error::{CeremonyError, TransportError},
    peers::PeerId,
};

/// Message as it travels over the gossip transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    /// Hex encoded JSON of one [`EngineMessage`].
    pub message: String,
    #[serde(default)]
    pub message_id: String,
    pub sender_id: String,
}

/// Inbound payloads are called envelopes; the wire shape is the same.
pub type WireEnvelope = Payload;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// Every peer except the sender.
    All,
    Peer(PeerId),
}

#[async_trait]
pub trait GossipTransport: Send + Sync {
    async fn publish(&self, recipient: Recipient, payload: Payload) -> Result<(), TransportError>;

    /// Start receiving the payloads addressed to the local peer.
    async fn subscribe(&self) -> Result<mpsc::Receiver<Payload>, TransportError>;

    fn local_peer(&self) -> PeerId;
}

pub fn decode(envelope: &WireEnvelope) -> Result<EngineMessage, CeremonyError> {
    let fail = |reason: String| CeremonyError::Decode {
        sender: envelope.sender_id.clone(),
        reason,
    };
    let bytes = hex::decode(&envelope.message).map_err(|e| fail(e.to_string()))?;
    let message: EngineMessage =
        serde_json::from_slice(&bytes).map_err(|e| fail(e.to_string()))?;
    if message.from.as_str() != envelope.sender_id {
        return Err(fail(format!("message claims to be from {}", message.from)));
    }
    Ok(message)
}

/// Publish one engine message, once to everyone or once per explicit recipient.
pub async fn dispatch(
    transport: &dyn GossipTransport,
    message: &EngineMessage,
    sender: &PeerId,
    operation_tag: &str,
) -> Result<(), CeremonyError> {
    let encoded = serde_json::to_vec(message)
        .map_err(|e| CeremonyError::Dispatch(TransportError::Encode(e.to_string())))?;
    let payload = Payload {
        message: hex::encode(encoded),
        message_id: operation_tag.to_string(),
        sender_id: sender.to_string(),
    };

    if message.is_for_everyone() {
        return transport
            .publish(Recipient::All, payload)
            .await
            .map_err(CeremonyError::Dispatch);
    }

    for peer in message.to.iter().filter(|peer| *peer != sender) {
        debug!(to = %peer, "sending direct message");
        transport
            .publish(Recipient::Peer(peer.clone()), payload.clone())
            .await
            .map_err(CeremonyError::Dispatch)?;
    }
    Ok(())
}

/// Per-peer inbox. Payloads queue in the channel until the peer subscribes and takes the
/// receiver.
struct Mailbox {
    sender: mpsc::Sender<Payload>,
    receiver: Option<mpsc::Receiver<Payload>>,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Mailbox {
            sender,
            receiver: Some(receiver),
        }
    }
}

/// In-process store-and-forward gossip hub shared by every [`MemoryGossip`] endpoint.
///
/// Every endpoint owns a mailbox from the moment it is created, so a peer receives everything
/// broadcast after its endpoint exists, and every direct message, whether or not it has
/// subscribed yet.
#[derive(Clone)]
pub struct MemoryNetwork {
    capacity: usize,
    mailboxes: Arc<RwLock<HashMap<PeerId, Mailbox>>>,
}

impl MemoryNetwork {
    pub fn new(capacity: usize) -> Self {
        MemoryNetwork {
            capacity: capacity.max(1),
            mailboxes: Arc::default(),
        }
    }

    pub fn endpoint(&self, peer: PeerId) -> MemoryGossip {
        self.write()
            .entry(peer.clone())
            .or_insert_with(|| Mailbox::new(self.capacity));
        MemoryGossip {
            local: peer,
            network: self.clone(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<PeerId, Mailbox>> {
        self.mailboxes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn targets(&self, from: &PeerId, recipient: &Recipient) -> Vec<(PeerId, mpsc::Sender<Payload>)> {
        let mut mailboxes = self.write();
        match recipient {
            Recipient::All => mailboxes
                .iter()
                .filter(|(peer, _)| *peer != from)
                .map(|(peer, mailbox)| (peer.clone(), mailbox.sender.clone()))
                .collect(),
            // a direct message opens a mailbox for a peer that has not shown up yet
            Recipient::Peer(peer) => {
                let mailbox = mailboxes
                    .entry(peer.clone())
                    .or_insert_with(|| Mailbox::new(self.capacity));
                vec![(peer.clone(), mailbox.sender.clone())]
            }
        }
    }
}

pub struct MemoryGossip {
    local: PeerId,
    network: MemoryNetwork,
}

#[async_trait]
impl GossipTransport for MemoryGossip {
    async fn publish(&self, recipient: Recipient, payload: Payload) -> Result<(), TransportError> {
        let targets = self.network.targets(&self.local, &recipient);
        for (peer, sender) in targets {
            if sender.send(payload.clone()).await.is_err() {
                // gossip delivery is best effort; a departed peer only fails direct sends
                if recipient != Recipient::All {
                    return Err(TransportError::Disconnected(peer.to_string()));
                }
                debug!(%peer, "skipping departed peer");
            }
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<Payload>, TransportError> {
        let capacity = self.network.capacity;
        let mut mailboxes = self.network.write();
        let mailbox = mailboxes
            .entry(self.local.clone())
            .or_insert_with(|| Mailbox::new(capacity));
        if let Some(receiver) = mailbox.receiver.take() {
            return Ok(receiver);
        }
        if !mailbox.sender.is_closed() {
            return Err(TransportError::AlreadySubscribed(self.local.to_string()));
        }
        // the previous subscriber is gone; start over with an empty mailbox
        let (sender, receiver) = mpsc::channel(capacity);
        mailbox.sender = sender;
        Ok(receiver)
    }

    fn local_peer(&self) -> PeerId {
        self.local.clone()
    }
}
