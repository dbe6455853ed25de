//! The seam between the coordinator and a threshold keygen protocol.
//!
//! The coordinator never looks inside protocol messages. A [`KeygenScheme`] builds one
//! [`KeygenParty`] per ceremony; the party pushes [`EngineMessage`]s into its outbound channel
//! and, once the protocol is done, exactly one [`KeygenOutput`] into its completion channel.
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    error::EngineError,
    peers::{PeerId, PeerSet},
};

/// A protocol message produced or consumed by a keygen party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineMessage {
    pub from: PeerId,
    #[serde(default)]
    pub to: Vec<PeerId>,
    pub is_broadcast: bool,
    #[serde(with = "hex")]
    pub payload: Vec<u8>,
}

impl EngineMessage {
    pub fn broadcast(from: PeerId, payload: Vec<u8>) -> Self {
        EngineMessage {
            from,
            to: vec![],
            is_broadcast: true,
            payload,
        }
    }

    pub fn direct(from: PeerId, to: Vec<PeerId>, payload: Vec<u8>) -> Self {
        EngineMessage {
            from,
            to,
            is_broadcast: false,
            payload,
        }
    }

    /// Whether this message goes to every peer but the sender.
    pub fn is_for_everyone(&self) -> bool {
        self.is_broadcast || self.to.is_empty()
    }
}

/// Everything a party needs to know about its ceremony.
#[derive(Debug, Clone)]
pub struct PartyParams {
    pub peer_set: PeerSet,
    pub threshold: usize,
}

/// The final artifact of a party, stored verbatim as the keygen save data.
pub trait KeygenOutput: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Identifier of the local key share.
    fn share_id(&self) -> String;

    /// The joint public key in the scheme's standard serialized form.
    fn public_key(&self) -> Vec<u8>;
}

pub trait KeygenScheme: Send + Sync + 'static {
    type Party: KeygenParty;
    type Output: KeygenOutput;

    /// Storage key for persisted records of this scheme.
    fn ceremony_type(&self) -> &'static str;

    /// Tag sent as the `messageId` of every outbound payload.
    fn operation_tag(&self) -> &'static str;

    fn new_party(
        &self,
        params: PartyParams,
        outbound: mpsc::Sender<EngineMessage>,
        completion: mpsc::Sender<Self::Output>,
    ) -> Result<Self::Party, EngineError>;
}

/// A running protocol instance. Not safe to drive concurrently; the caller serialises access.
#[async_trait]
pub trait KeygenParty: Send + 'static {
    async fn start(&mut self) -> Result<(), EngineError>;

    /// Apply one inbound message. The party buffers messages that arrive ahead of its round.
    async fn update(&mut self, message: EngineMessage) -> Result<(), EngineError>;

    /// Peers the party still expects a message from.
    fn waiting_for(&self) -> Vec<PeerId>;
}
