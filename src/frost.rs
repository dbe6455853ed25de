//! FROST distributed key generation over secp256k1 as a [`KeygenScheme`].
//!
//! Two rounds:
//! 1. every party broadcasts the point polynomial of its secret scalar polynomial;
//! 2. once all point polynomials are in, every party sends each other party its secret share
//!    together with its proof of possession.
//!
//! When a party holds every point polynomial and every share it finishes keygen and emits its
//! [`FrostSaveData`]. Messages may arrive in any order; early ones are buffered.
use std::collections::BTreeMap;

use async_trait::async_trait;
use schnorr_fun::{
    frost::{self, Frost},
    nonce::NonceGen,
    Signature,
};
use secp256kfun::{
    digest::typenum::U32,
    marker::{Secret, Zero},
    Point, Scalar,
};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    engine::{EngineMessage, KeygenOutput, KeygenParty, KeygenScheme, PartyParams},
    error::EngineError,
    peers::PeerId,
};

pub const CEREMONY_TYPE: &str = "frost-secp256k1";
pub const OPERATION_TAG: &str = "frostKeygen";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FrostMessage {
    PointPoly(Vec<Point>),
    Share {
        share: Scalar<Secret, Zero>,
        proof_of_possession: Signature,
    },
}

/// Key material of one party after a successful keygen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrostSaveData {
    pub share_id: String,
    pub my_index: usize,
    pub threshold: usize,
    #[serde(with = "hex")]
    pub secret_share: Vec<u8>,
    /// BIP-340 x-only joint public key.
    #[serde(with = "hex")]
    pub public_key: Vec<u8>,
    pub verification_shares: Vec<String>,
}

impl KeygenOutput for FrostSaveData {
    fn share_id(&self) -> String {
        self.share_id.clone()
    }

    fn public_key(&self) -> Vec<u8> {
        self.public_key.clone()
    }
}

impl<H, NG> KeygenScheme for Frost<H, NG>
where
    H: Digest<OutputSize = U32> + Clone + Send + Sync + 'static,
    NG: NonceGen + Clone + Send + Sync + 'static,
{
    type Party = FrostKeygenParty<H, NG>;
    type Output = FrostSaveData;

    fn ceremony_type(&self) -> &'static str {
        CEREMONY_TYPE
    }

    fn operation_tag(&self) -> &'static str {
        OPERATION_TAG
    }

    fn new_party(
        &self,
        params: PartyParams,
        outbound: mpsc::Sender<EngineMessage>,
        completion: mpsc::Sender<FrostSaveData>,
    ) -> Result<FrostKeygenParty<H, NG>, EngineError> {
        let n_parties = params.peer_set.len();
        if n_parties < 2 || params.threshold == 0 || params.threshold > n_parties {
            return Err(EngineError::InvalidParameters(format!(
                "cannot run {}-of-{} keygen",
                params.threshold, n_parties
            )));
        }

        let mut rng = rand::thread_rng();
        let scalar_poly = frost::generate_scalar_poly(params.threshold, &mut rng);

        Ok(FrostKeygenParty {
            frost: self.clone(),
            params,
            outbound,
            completion,
            scalar_poly: Some(scalar_poly),
            point_polys: BTreeMap::new(),
            shares: BTreeMap::new(),
            finished: false,
        })
    }
}

pub struct FrostKeygenParty<H, NG> {
    frost: Frost<H, NG>,
    params: PartyParams,
    outbound: mpsc::Sender<EngineMessage>,
    completion: mpsc::Sender<FrostSaveData>,
    /// Taken once our shares have been handed out.
    scalar_poly: Option<Vec<Scalar>>,
    point_polys: BTreeMap<usize, Vec<Point>>,
    shares: BTreeMap<usize, (Scalar<Secret, Zero>, Signature)>,
    finished: bool,
}

impl<H, NG> FrostKeygenParty<H, NG>
where
    H: Digest<OutputSize = U32> + Clone + Send + Sync + 'static,
    NG: NonceGen + Clone + Send + Sync + 'static,
{
    fn my_index(&self) -> usize {
        self.params.peer_set.local_index()
    }

    fn my_id(&self) -> PeerId {
        self.params.peer_set.local().id.clone()
    }

    async fn send(&self, message: EngineMessage) -> Result<(), EngineError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| EngineError::OutputClosed)
    }

    fn point_polys(&self) -> Vec<Vec<Point>> {
        self.point_polys.values().cloned().collect()
    }

    async fn distribute_shares(&mut self) -> Result<(), EngineError> {
        let scalar_poly = match self.scalar_poly.take() {
            Some(scalar_poly) => scalar_poly,
            None => return Ok(()),
        };
        let keygen = self
            .frost
            .new_keygen(self.point_polys())
            .map_err(|e| EngineError::Protocol(format!("{:?}", e)))?;
        let (shares, proof_of_possession) = self.frost.create_shares(&keygen, scalar_poly);

        let me = self.my_index();
        for (index, share) in shares.into_iter().enumerate() {
            if index == me {
                self.shares
                    .insert(me, (share, proof_of_possession.clone()));
                continue;
            }
            let to = self.params.peer_set.parties()[index].id.clone();
            let payload = encode(&FrostMessage::Share {
                share,
                proof_of_possession: proof_of_possession.clone(),
            })?;
            self.send(EngineMessage::direct(self.my_id(), vec![to], payload))
                .await?;
        }
        debug!("sent secret shares");
        Ok(())
    }

    async fn try_finish(&mut self) -> Result<(), EngineError> {
        let n_parties = self.params.peer_set.len();
        if self.finished || self.point_polys.len() < n_parties || self.shares.len() < n_parties {
            return Ok(());
        }

        let keygen = self
            .frost
            .new_keygen(self.point_polys())
            .map_err(|e| EngineError::Protocol(format!("{:?}", e)))?;
        let (secret_shares, proofs_of_possession): (Vec<_>, Vec<_>) =
            self.shares.values().cloned().unzip();
        let (secret_share, frost_key) = self
            .frost
            .finish_keygen(
                keygen,
                self.my_index(),
                secret_shares,
                proofs_of_possession,
            )
            .map_err(|e| EngineError::Protocol(format!("{:?}", e)))?;
        let xonly_frost_key = frost_key.into_xonly_key();

        let save_data = FrostSaveData {
            share_id: self.params.peer_set.local().share_index.to_string(),
            my_index: self.my_index(),
            threshold: self.params.threshold,
            secret_share: secret_share.to_bytes().to_vec(),
            public_key: xonly_frost_key.public_key().to_xonly_bytes().to_vec(),
            verification_shares: xonly_frost_key
                .verification_shares()
                .map(|share| hex::encode(share.to_bytes()))
                .collect(),
        };
        self.finished = true;
        self.completion
            .send(save_data)
            .await
            .map_err(|_| EngineError::OutputClosed)
    }
}

#[async_trait]
impl<H, NG> KeygenParty for FrostKeygenParty<H, NG>
where
    H: Digest<OutputSize = U32> + Clone + Send + Sync + 'static,
    NG: NonceGen + Clone + Send + Sync + 'static,
{
    async fn start(&mut self) -> Result<(), EngineError> {
        let scalar_poly = self
            .scalar_poly
            .as_ref()
            .ok_or_else(|| EngineError::Protocol("party already started".into()))?;
        let point_poly = frost::to_point_poly(scalar_poly);

        self.point_polys.insert(self.my_index(), point_poly.clone());
        let payload = encode(&FrostMessage::PointPoly(point_poly))?;
        self.send(EngineMessage::broadcast(self.my_id(), payload))
            .await
    }

    async fn update(&mut self, message: EngineMessage) -> Result<(), EngineError> {
        let sender = self
            .params
            .peer_set
            .position(&message.from)
            .ok_or_else(|| EngineError::UnknownSender(message.from.to_string()))?;
        if sender == self.my_index() {
            return Err(EngineError::Malformed("message claims to be from us".into()));
        }
        if self.finished {
            debug!(sender = %message.from, "ignoring message after keygen finished");
            return Ok(());
        }

        let decoded: FrostMessage = serde_json::from_slice(&message.payload)
            .map_err(|e| EngineError::Malformed(e.to_string()))?;
        match decoded {
            FrostMessage::PointPoly(point_poly) => {
                if point_poly.len() != self.params.threshold {
                    return Err(EngineError::Malformed(format!(
                        "point polynomial of degree {} for threshold {}",
                        point_poly.len(),
                        self.params.threshold
                    )));
                }
                if self.point_polys.contains_key(&sender) {
                    return Err(EngineError::Duplicate {
                        round: "point polynomial",
                        sender: message.from.to_string(),
                    });
                }
                self.point_polys.insert(sender, point_poly);
                if self.point_polys.len() == self.params.peer_set.len() {
                    self.distribute_shares().await?;
                }
            }
            FrostMessage::Share {
                share,
                proof_of_possession,
            } => {
                if self.shares.contains_key(&sender) {
                    return Err(EngineError::Duplicate {
                        round: "secret share",
                        sender: message.from.to_string(),
                    });
                }
                self.shares.insert(sender, (share, proof_of_possession));
            }
        }

        self.try_finish().await
    }

    fn waiting_for(&self) -> Vec<PeerId> {
        let me = self.my_index();
        self.params
            .peer_set
            .parties()
            .iter()
            .enumerate()
            .filter(|(index, _)| {
                *index != me
                    && (!self.point_polys.contains_key(index) || !self.shares.contains_key(index))
            })
            .map(|(_, party)| party.id.clone())
            .collect()
    }
}

fn encode(message: &FrostMessage) -> Result<Vec<u8>, EngineError> {
    serde_json::to_vec(message).map_err(|e| EngineError::Malformed(e.to_string()))
}
