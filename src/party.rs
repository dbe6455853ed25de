//! Lazily started handle to the keygen engine of one ceremony.
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex, OnceCell};
use tracing::{debug, info};

use crate::{
    engine::{EngineMessage, KeygenParty, KeygenScheme, PartyParams},
    error::CeremonyError,
    peers::PeerId,
};

type SharedParty<S> = Arc<Mutex<<S as KeygenScheme>::Party>>;

/// The two output streams of a started party.
pub struct PartyStreams<O> {
    pub outbound: mpsc::Receiver<EngineMessage>,
    pub completion: mpsc::Receiver<O>,
}

pub struct CeremonyParty<S: KeygenScheme> {
    scheme: Arc<S>,
    params: PartyParams,
    party: OnceCell<SharedParty<S>>,
    ready: watch::Sender<Option<SharedParty<S>>>,
}

impl<S: KeygenScheme> CeremonyParty<S> {
    pub fn new(scheme: Arc<S>, params: PartyParams) -> Self {
        let (ready, _) = watch::channel(None);
        CeremonyParty {
            scheme,
            params,
            party: OnceCell::new(),
            ready,
        }
    }

    pub fn is_started(&self) -> bool {
        self.party.initialized()
    }

    /// Create and start the engine party unless it already exists.
    ///
    /// Only the call that actually creates the party gets the streams back; every other call,
    /// concurrent or later, is a no-op returning `None`.
    pub async fn ensure_started(
        &self,
    ) -> Result<Option<PartyStreams<S::Output>>, CeremonyError> {
        let mut streams = None;
        let created = &mut streams;
        let party = self
            .party
            .get_or_try_init(|| async move {
                let capacity = self.params.peer_set.len();
                let (outbound_tx, outbound) = mpsc::channel(capacity);
                let (completion_tx, completion) = mpsc::channel(capacity);

                let mut party = self
                    .scheme
                    .new_party(self.params.clone(), outbound_tx, completion_tx)
                    .map_err(CeremonyError::EngineStart)?;
                party.start().await.map_err(CeremonyError::EngineStart)?;

                *created = Some(PartyStreams {
                    outbound,
                    completion,
                });
                Ok::<_, CeremonyError>(Arc::new(Mutex::new(party)))
            })
            .await?;

        if streams.is_some() {
            self.ready.send_replace(Some(party.clone()));
            info!(
                party = %self.params.peer_set.local(),
                threshold = self.params.threshold,
                "party started"
            );
        }
        Ok(streams)
    }

    /// Feed one inbound message to the party, waiting for it to be started first.
    pub async fn update(&self, message: EngineMessage) -> Result<(), CeremonyError> {
        let party = self.wait_started().await?;
        let mut party = party.lock().await;

        let sender = message.from.to_string();
        party
            .update(message)
            .await
            .map_err(|source| CeremonyError::EngineUpdate { sender, source })?;
        debug!(waiting_for = ?party.waiting_for(), "party updated");
        Ok(())
    }

    /// Peers the engine still waits for. `None` before the party exists or while it is busy
    /// applying a message.
    pub fn waiting_for(&self) -> Option<Vec<PeerId>> {
        let party = self.party.get()?;
        let party = party.try_lock().ok()?;
        Some(party.waiting_for())
    }

    async fn wait_started(&self) -> Result<SharedParty<S>, CeremonyError> {
        let mut ready = self.ready.subscribe();
        let party = ready
            .wait_for(Option::is_some)
            .await
            .map_err(|_| CeremonyError::ChannelClosed)?;
        party.clone().ok_or(CeremonyError::ChannelClosed)
    }
}
