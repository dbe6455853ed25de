//! Keygen ceremony coordinator
//!
//! Drives one ceremony from a list of peer ids to a persisted, reported result:
//!
//! * the main loop (`drive`) owns the ceremony and is the only place that starts the party;
//! * a feeder task applies decoded inbound messages to the party, one at a time, in the order
//!   they arrived, waiting for the party to exist before the first one;
//! * a relay task publishes everything the party produces and finalizes its result.
//!
//! The tasks report back over a shared error channel where the first failure wins, and the
//! relay reports success over a separate completion channel. Once the relay starts finalizing,
//! the deadline no longer applies: a key that reaches the store is always reported.
use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    engine::{EngineMessage, KeygenOutput, KeygenScheme, PartyParams},
    error::CeremonyError,
    gossip::{self, GossipTransport, WireEnvelope},
    notify::Notifier,
    party::{CeremonyParty, PartyStreams},
    peers::{CeremonyContext, CeremonyMetadata, PeerId},
    result::{Finalizer, KeygenResult},
    storage::{KeyStore, PersistedRecord},
};

pub const DEFAULT_CEREMONY_TIMEOUT: Duration = Duration::from_secs(600);

/// A request to run one keygen ceremony.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeygenRequest {
    pub peer_ids: Vec<PeerId>,
    pub threshold: usize,
    pub peers_count: usize,
    pub callback_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CeremonyState {
    Idle,
    PartyStarting,
    Running,
    Finalizing,
    Completed,
    Failed,
}

impl CeremonyState {
    fn enter(&mut self, next: CeremonyState) {
        debug!(from = ?*self, to = ?next, "ceremony state");
        *self = next;
    }
}

pub struct Coordinator<S: KeygenScheme> {
    scheme: Arc<S>,
    transport: Arc<dyn GossipTransport>,
    store: Arc<dyn KeyStore>,
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
}

impl<S: KeygenScheme> Coordinator<S> {
    pub fn new(
        scheme: Arc<S>,
        transport: Arc<dyn GossipTransport>,
        store: Arc<dyn KeyStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Coordinator {
            scheme,
            transport,
            store,
            notifier,
            timeout: DEFAULT_CEREMONY_TIMEOUT,
        }
    }

    /// Fail any ceremony that has not finished after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn local_peer(&self) -> PeerId {
        self.transport.local_peer()
    }

    /// The key this peer produced in an earlier ceremony, if any.
    pub async fn stored_key(&self) -> Result<Option<PersistedRecord>, CeremonyError> {
        self.store
            .load(self.scheme.ceremony_type(), &self.local_peer())
            .await
            .map_err(CeremonyError::Persist)
    }

    /// Subscribe to the transport and run a ceremony on what arrives.
    pub async fn keygen(&self, request: KeygenRequest) -> Result<KeygenResult, CeremonyError> {
        let inbound = self
            .transport
            .subscribe()
            .await
            .map_err(CeremonyError::Dispatch)?;
        self.run(request, inbound).await
    }

    /// Run a ceremony on an already subscribed inbound channel. The channel is closed when the
    /// ceremony ends, whichever way it ends.
    pub async fn run(
        &self,
        request: KeygenRequest,
        inbound: mpsc::Receiver<WireEnvelope>,
    ) -> Result<KeygenResult, CeremonyError> {
        let local = self.local_peer();
        let span = info_span!("keygen", peer = %local);
        self.drive(request, local, inbound).instrument(span).await
    }

    async fn drive(
        &self,
        request: KeygenRequest,
        local: PeerId,
        mut inbound: mpsc::Receiver<WireEnvelope>,
    ) -> Result<KeygenResult, CeremonyError> {
        info!(
            peers = request.peers_count,
            threshold = request.threshold,
            "initiating keygen"
        );
        let context = CeremonyContext::new();
        let resolved = CeremonyMetadata::new(request.peers_count, request.threshold).and_then(
            |metadata| {
                context.resolve(&local, metadata, &request.peer_ids)?;
                context
                    .metadata()
                    .copied()
                    .zip(context.peer_set().cloned())
                    .ok_or_else(|| CeremonyError::InvalidRequest("peers were not resolved".into()))
            },
        );
        let (metadata, peer_set) = match resolved {
            Ok(resolved) => resolved,
            Err(err) => {
                inbound.close();
                error!(%err, "keygen ceremony failed");
                return Err(err);
            }
        };

        let capacity = peer_set.len();
        let party = Arc::new(CeremonyParty::new(
            self.scheme.clone(),
            PartyParams {
                peer_set,
                threshold: metadata.threshold,
            },
        ));

        let (errors_tx, mut errors) = mpsc::channel(capacity);
        let (completed_tx, mut completed) = mpsc::channel(1);
        let (finalizing_tx, mut finalizing) = mpsc::channel(1);
        let (queue_tx, queue) = mpsc::unbounded_channel();

        let feeder = tokio::spawn(feed(party.clone(), queue, errors_tx.clone()).in_current_span());
        let mut relay_handle = None;
        let mut relay_parts = Some((
            Finalizer {
                store: self.store.clone(),
                notifier: self.notifier.clone(),
                ceremony_type: self.scheme.ceremony_type(),
                local: local.clone(),
                metadata,
                callback_url: request.callback_url.clone(),
            },
            completed_tx,
            finalizing_tx,
        ));
        let operation_tag = self.scheme.operation_tag();

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut state = CeremonyState::Idle;

        let outcome = loop {
            tokio::select! {
                biased;

                Some(err) = errors.recv() => break Err(err),
                Some(result) = completed.recv() => break Ok(result),
                Some(()) = finalizing.recv(), if state == CeremonyState::Running => {
                    state.enter(CeremonyState::Finalizing);
                }
                envelope = inbound.recv(), if state != CeremonyState::Finalizing => match envelope {
                    Some(envelope) if !envelope.message_id.is_empty() && envelope.message_id != operation_tag => {
                        debug!(
                            sender = %envelope.sender_id,
                            message_id = %envelope.message_id,
                            "skipping message of another operation"
                        );
                    }
                    Some(envelope) => {
                        info!(sender = %envelope.sender_id, "received new message on communication channel");
                        match gossip::decode(&envelope) {
                            // the feeder only stops after reporting an error, which wins next turn
                            Ok(message) => {
                                let _ = queue_tx.send(message);
                            }
                            Err(err) => break Err(err),
                        }
                    }
                    None => {
                        if let Some(waiting_for) = party.waiting_for() {
                            warn!(?waiting_for, "communication channel closed while party was waiting");
                        }
                        break Err(CeremonyError::ChannelClosed);
                    }
                },
                _ = &mut deadline, if state != CeremonyState::Finalizing => {
                    if let Some(waiting_for) = party.waiting_for() {
                        warn!(?waiting_for, "ceremony timed out while party was waiting");
                    }
                    break Err(CeremonyError::Timeout(self.timeout));
                }
                _ = std::future::ready(()), if state == CeremonyState::Idle => {
                    state.enter(CeremonyState::PartyStarting);
                    match party.ensure_started().await {
                        Ok(Some(streams)) => {
                            if let Some((finalizer, completed_tx, finalizing_tx)) = relay_parts.take() {
                                relay_handle = Some(tokio::spawn(
                                    relay(
                                        streams,
                                        self.transport.clone(),
                                        operation_tag,
                                        local.clone(),
                                        finalizer,
                                        errors_tx.clone(),
                                        completed_tx,
                                        finalizing_tx,
                                    )
                                    .in_current_span(),
                                ));
                            }
                        }
                        Ok(None) => {}
                        Err(err) => break Err(err),
                    }
                    state.enter(CeremonyState::Running);
                }
            }
        };

        inbound.close();
        feeder.abort();
        if let Some(relay_handle) = relay_handle {
            relay_handle.abort();
        }

        match &outcome {
            Ok(result) => {
                state.enter(CeremonyState::Completed);
                info!(share_id = %result.share_id, "keygen ceremony completed");
            }
            Err(err) => {
                state.enter(CeremonyState::Failed);
                error!(%err, "keygen ceremony failed");
            }
        }
        outcome
    }
}

/// Apply queued inbound messages to the party in arrival order.
async fn feed<S: KeygenScheme>(
    party: Arc<CeremonyParty<S>>,
    mut queue: mpsc::UnboundedReceiver<EngineMessage>,
    errors: mpsc::Sender<CeremonyError>,
) {
    while let Some(message) = queue.recv().await {
        if let Err(err) = party.update(message).await {
            error!(%err, "there was an error in handling party message");
            report(&errors, err);
            return;
        }
    }
}

/// Publish party output until the party completes, then finalize its result.
async fn relay<O: KeygenOutput>(
    mut streams: PartyStreams<O>,
    transport: Arc<dyn GossipTransport>,
    operation_tag: &'static str,
    local: PeerId,
    finalizer: Finalizer,
    errors: mpsc::Sender<CeremonyError>,
    completed: mpsc::Sender<KeygenResult>,
    finalizing: mpsc::Sender<()>,
) {
    loop {
        tokio::select! {
            // drain everything the party sent before it completed
            biased;

            Some(message) = streams.outbound.recv() => {
                if let Err(err) = gossip::dispatch(transport.as_ref(), &message, &local, operation_tag).await {
                    error!(%err, "failed to publish party message");
                    report(&errors, err);
                    return;
                }
            }
            Some(output) = streams.completion.recv() => {
                let _ = finalizing.send(()).await;
                match finalizer.finalize(output).await {
                    Ok(result) => {
                        info!("end party successfully");
                        let _ = completed.send(result).await;
                    }
                    Err(err) => report(&errors, err),
                }
                return;
            }
            else => return,
        }
    }
}

/// First failure wins. Errors reported after the driver stopped listening, or while it
/// already has failures queued, are logged and dropped.
fn report(errors: &mpsc::Sender<CeremonyError>, err: CeremonyError) {
    if let Err(dropped) = errors.try_send(err) {
        let err = match dropped {
            mpsc::error::TrySendError::Full(err) | mpsc::error::TrySendError::Closed(err) => err,
        };
        debug!(%err, "discarding error after ceremony failure");
    }
}
