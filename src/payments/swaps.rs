//! Swap records and the bounded per-channel swap history.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::abiencode::{self, Token};
use crate::sig::{recover_signer, SigError, Signer};
use crate::types::{Address, Destination, Hash, Signature, U256};

/// How many completed swaps are retained per channel.
pub const MAX_SWAP_STORAGE_LIMIT: usize = 5;

/// The terms of a swap: give `amount_in` of `token_in`, get `amount_out`
/// of `token_out`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub token_in: Address,
    pub token_out: Address,
    pub amount_in: U256,
    pub amount_out: U256,
}

/// One swap inside a swap channel. Identified by the hash of its terms, so
/// re-proposing identical terms under the same nonce is idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Swap {
    pub id: Destination,
    pub channel_id: Destination,
    pub exchange: Exchange,
    /// Signatures by participant index, filled in as the swap is proposed
    /// and then accepted.
    pub sigs: BTreeMap<usize, Signature>,
    pub nonce: u64,
}

impl Swap {
    pub fn new(channel_id: Destination, exchange: Exchange, nonce: u64) -> Self {
        let mut swap = Swap {
            id: Destination::default(),
            channel_id,
            exchange,
            sigs: BTreeMap::new(),
            nonce,
        };
        swap.id = Destination(swap.hash().0);
        swap
    }

    /// Canonical hash of the swap terms; doubles as the swap ID.
    pub fn hash(&self) -> Hash {
        abiencode::to_hash(&[
            Token::Bytes32(self.channel_id.0),
            Token::Address(self.exchange.token_in),
            Token::Address(self.exchange.token_out),
            Token::Uint(self.exchange.amount_in),
            Token::Uint(self.exchange.amount_out),
            Token::Uint(U256::from(self.nonce)),
        ])
    }

    /// Hash of the terms bound to the proposing participant, used to break
    /// ties when both parties propose concurrently.
    pub fn fingerprint(&self, sender: Address) -> Hash {
        abiencode::to_hash(&[Token::Bytes32(self.hash().0), Token::Address(sender)])
    }

    pub fn sign(&mut self, participant_index: usize, signer: &Signer) -> Result<(), SigError> {
        let sig = signer.sign_eth(self.hash())?;
        self.sigs.insert(participant_index, sig);
        Ok(())
    }

    pub fn signer_of(&self, participant_index: usize) -> Option<Result<Address, SigError>> {
        self.sigs
            .get(&participant_index)
            .map(|sig| recover_signer(self.hash(), *sig))
    }
}

/// FIFO of the most recent swap IDs for one channel, bounded at
/// [MAX_SWAP_STORAGE_LIMIT]. Pushing onto a full queue evicts and returns
/// the oldest ID so its record can be deleted from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapHistory {
    ids: VecDeque<Destination>,
}

impl SwapHistory {
    pub fn push(&mut self, id: Destination) -> Option<Destination> {
        let evicted = if self.ids.len() >= MAX_SWAP_STORAGE_LIMIT {
            self.ids.pop_front()
        } else {
            None
        };
        self.ids.push_back(id);
        evicted
    }

    pub fn ids(&self) -> impl Iterator<Item = Destination> + '_ {
        self.ids.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    fn exchange() -> Exchange {
        Exchange {
            token_in: Address([0x11; 20]),
            token_out: Address([0x22; 20]),
            amount_in: U256::from(40u64),
            amount_out: U256::from(20u64),
        }
    }

    #[test]
    fn id_commits_to_terms_and_nonce() {
        let cid = Destination([0x01; 32]);
        let a = Swap::new(cid, exchange(), 7);
        let b = Swap::new(cid, exchange(), 7);
        assert_eq!(a.id, b.id);

        let c = Swap::new(cid, exchange(), 8);
        assert_ne!(a.id, c.id);

        let mut other = exchange();
        other.amount_in = U256::from(41u64);
        let d = Swap::new(cid, other, 7);
        assert_ne!(a.id, d.id);
    }

    #[test]
    fn fingerprint_differs_by_sender() {
        let swap = Swap::new(Destination([0x01; 32]), exchange(), 0);
        let a = swap.fingerprint(Address([0xaa; 20]));
        let b = swap.fingerprint(Address([0xbb; 20]));
        assert_ne!(a, b);
    }

    #[test]
    fn sign_and_recover() {
        let signer = Signer::random(&mut thread_rng());
        let mut swap = Swap::new(Destination([0x01; 32]), exchange(), 0);
        swap.sign(0, &signer).unwrap();
        assert_eq!(swap.signer_of(0).unwrap().unwrap(), signer.address());
        assert!(swap.signer_of(1).is_none());
    }

    #[test]
    fn history_is_bounded_fifo() {
        let mut h = SwapHistory::default();
        let mut all = Vec::new();
        for i in 0..MAX_SWAP_STORAGE_LIMIT as u8 {
            let id = Destination([i; 32]);
            all.push(id);
            assert_eq!(h.push(id), None);
        }
        assert_eq!(h.len(), MAX_SWAP_STORAGE_LIMIT);

        let overflow = Destination([0xff; 32]);
        assert_eq!(h.push(overflow), Some(all[0]));
        assert_eq!(h.len(), MAX_SWAP_STORAGE_LIMIT);
        let ids: Vec<_> = h.ids().collect();
        assert_eq!(ids.first(), Some(&all[1]));
        assert_eq!(ids.last(), Some(&overflow));
    }
}
