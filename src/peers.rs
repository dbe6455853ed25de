//! Canonical ordering of ceremony participants.
//!
//! Every participant derives the same [`PeerSet`] from the same list of peer identifiers: each
//! identifier is base58-decoded and read as a big-endian unsigned integer (its *share index*),
//! and parties are ordered by ascending share index. The engine relies on every honest party
//! agreeing on this order, so the derivation uses no randomness and ignores input order.
use std::{collections::HashSet, fmt};

use num_bigint::BigUint;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::CeremonyError;

/// Opaque network identifier of a participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        PeerId::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        PeerId(id)
    }
}

/// Protocol-level identity of a participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartyId {
    pub id: PeerId,
    pub moniker: String,
    pub share_index: BigUint,
}

impl PartyId {
    pub fn from_peer(peer: &PeerId) -> Result<Self, CeremonyError> {
        if peer.as_str().is_empty() {
            return Err(CeremonyError::InvalidRequest("empty peer id".into()));
        }
        let bytes = bs58::decode(peer.as_str()).into_vec().map_err(|e| {
            CeremonyError::InvalidRequest(format!("peer id {} is not base58: {}", peer, e))
        })?;

        Ok(PartyId {
            id: peer.clone(),
            moniker: format!("tssPeer/{}", peer),
            share_index: BigUint::from_bytes_be(&bytes),
        })
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{},{}}}", self.moniker, self.share_index)
    }
}

/// Ceremony parameters shared by every participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CeremonyMetadata {
    pub peers_count: usize,
    pub threshold: usize,
}

impl CeremonyMetadata {
    pub fn new(peers_count: usize, threshold: usize) -> Result<Self, CeremonyError> {
        if threshold == 0 || threshold >= peers_count {
            return Err(CeremonyError::InvalidRequest(format!(
                "threshold {} must be in 1..{}",
                threshold, peers_count
            )));
        }
        Ok(CeremonyMetadata {
            peers_count,
            threshold,
        })
    }
}

/// The ordered roster of one ceremony, including which entry is us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSet {
    parties: Vec<PartyId>,
    local: usize,
}

impl PeerSet {
    pub fn new(local: &PeerId, peers: &[PeerId]) -> Result<Self, CeremonyError> {
        if peers.is_empty() {
            return Err(CeremonyError::InvalidRequest("empty peer list".into()));
        }

        let mut seen = HashSet::new();
        let mut parties = Vec::with_capacity(peers.len());
        for peer in peers {
            if !seen.insert(peer) {
                return Err(CeremonyError::InvalidRequest(format!(
                    "peer {} listed twice",
                    peer
                )));
            }
            parties.push(PartyId::from_peer(peer)?);
        }

        // ties on share index can only come from distinct spellings of the same number
        parties.sort_by(|a, b| {
            a.share_index
                .cmp(&b.share_index)
                .then_with(|| a.id.cmp(&b.id))
        });

        let local = parties
            .iter()
            .position(|party| &party.id == local)
            .ok_or_else(|| CeremonyError::LocalIdentityNotFound(local.to_string()))?;

        Ok(PeerSet { parties, local })
    }

    pub fn parties(&self) -> &[PartyId] {
        &self.parties
    }

    pub fn local(&self) -> &PartyId {
        &self.parties[self.local]
    }

    /// Position of the local party in the canonical order.
    pub fn local_index(&self) -> usize {
        self.local
    }

    pub fn position(&self, peer: &PeerId) -> Option<usize> {
        self.parties.iter().position(|party| &party.id == peer)
    }

    pub fn len(&self) -> usize {
        self.parties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parties.is_empty()
    }
}

/// Ceremony-scoped state filled in once by the resolver and read by later stages.
#[derive(Debug, Default)]
pub struct CeremonyContext {
    metadata: OnceCell<CeremonyMetadata>,
    peer_set: OnceCell<PeerSet>,
}

impl CeremonyContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the peer set for this ceremony. The first successful call wins; later calls
    /// return the already resolved set without looking at their arguments.
    pub fn resolve(
        &self,
        local: &PeerId,
        metadata: CeremonyMetadata,
        peers: &[PeerId],
    ) -> Result<&PeerSet, CeremonyError> {
        self.peer_set.get_or_try_init(|| {
            if peers.len() != metadata.peers_count {
                return Err(CeremonyError::InvalidRequest(format!(
                    "expected {} peers, got {}",
                    metadata.peers_count,
                    peers.len()
                )));
            }
            let peer_set = PeerSet::new(local, peers)?;
            let _ = self.metadata.set(metadata);
            info!(local = %peer_set.local(), peers = peer_set.len(), "resolved ceremony peers");
            Ok(peer_set)
        })
    }

    pub fn metadata(&self) -> Option<&CeremonyMetadata> {
        self.metadata.get()
    }

    pub fn peer_set(&self) -> Option<&PeerSet> {
        self.peer_set.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn peer(share_index: &[u8]) -> PeerId {
        PeerId::new(bs58::encode(share_index).into_string())
    }

    #[test]
    fn orders_by_share_index() {
        let a = peer(&[10]);
        let b = peer(&[5]);
        let c = peer(&[20]);

        let peer_set = PeerSet::new(&a, &[a.clone(), b.clone(), c.clone()]).unwrap();
        let order: Vec<_> = peer_set.parties().iter().map(|p| p.id.clone()).collect();
        assert_eq!(order, vec![b, a.clone(), c]);
        assert_eq!(peer_set.local().id, a);
        assert_eq!(peer_set.local_index(), 1);
        assert_eq!(peer_set.local().share_index, BigUint::from(10u8));
    }

    #[test]
    fn longer_ids_sort_as_larger_numbers() {
        let small = peer(&[0xff]);
        let large = peer(&[0x01, 0x00]);
        let peer_set = PeerSet::new(&small, &[large.clone(), small.clone()]).unwrap();
        assert_eq!(peer_set.parties()[0].id, small);
        assert_eq!(peer_set.parties()[1].id, large);
    }

    #[test]
    fn missing_local_identity() {
        let err = PeerSet::new(&peer(&[1]), &[peer(&[2]), peer(&[3])]).unwrap_err();
        assert!(matches!(err, CeremonyError::LocalIdentityNotFound(_)));
    }

    #[test]
    fn rejects_bad_peer_lists() {
        let a = peer(&[1]);
        assert!(matches!(
            PeerSet::new(&a, &[]),
            Err(CeremonyError::InvalidRequest(_))
        ));
        assert!(matches!(
            PeerSet::new(&a, &[a.clone(), a.clone()]),
            Err(CeremonyError::InvalidRequest(_))
        ));
        // '0' is not in the base58 alphabet
        assert!(matches!(
            PeerSet::new(&a, &[a.clone(), PeerId::new("0OIl")]),
            Err(CeremonyError::InvalidRequest(_))
        ));
    }

    #[test]
    fn threshold_bounds() {
        assert!(CeremonyMetadata::new(3, 2).is_ok());
        assert!(CeremonyMetadata::new(3, 3).is_err());
        assert!(CeremonyMetadata::new(3, 0).is_err());
    }

    #[test]
    fn first_resolution_wins() {
        let ctx = CeremonyContext::new();
        let (a, b, c) = (peer(&[1]), peer(&[2]), peer(&[3]));
        let meta = CeremonyMetadata::new(2, 1).unwrap();

        let first = ctx.resolve(&a, meta, &[a.clone(), b.clone()]).unwrap().clone();
        let other_meta = CeremonyMetadata::new(3, 2).unwrap();
        let second = ctx
            .resolve(&c, other_meta, &[a.clone(), b.clone(), c.clone()])
            .unwrap();

        assert_eq!(&first, second);
        assert_eq!(ctx.metadata(), Some(&meta));
    }

    #[test]
    fn count_mismatch_leaves_context_empty() {
        let ctx = CeremonyContext::new();
        let a = peer(&[1]);
        let meta = CeremonyMetadata::new(3, 2).unwrap();
        assert!(ctx.resolve(&a, meta, &[a.clone(), peer(&[2])]).is_err());
        assert!(ctx.peer_set().is_none());
        assert!(ctx.metadata().is_none());
    }

    proptest! {
        #[test]
        fn ordering_ignores_input_order(
            indexes in proptest::collection::hash_set(proptest::collection::vec(1u8.., 1..6), 2..8),
            seed in any::<u64>(),
        ) {
            use rand::{seq::SliceRandom, SeedableRng};

            let peers: Vec<_> = indexes.iter().map(|bytes| peer(bytes)).collect();
            let local = peers[0].clone();
            let canonical = PeerSet::new(&local, &peers).unwrap();

            let mut shuffled = peers.clone();
            shuffled.shuffle(&mut rand::rngs::StdRng::seed_from_u64(seed));
            let reordered = PeerSet::new(&local, &shuffled).unwrap();

            prop_assert_eq!(canonical, reordered);
        }
    }
}
