//! Per-channel bookkeeping: signed states, the on-chain view, and the
//! channel-mode state machine.

pub mod consensus;
pub mod outcome;
pub mod state;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::ChainEvent;
use crate::sig::Signer;
use crate::types::{Destination, Funds};

use self::state::{SignedState, State, StateError};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("participant index {0} out of range")]
    MyIndexOutOfRange(usize),
    #[error("signed state belongs to channel {actual:?}, not {expected:?}")]
    WrongChannel {
        expected: Destination,
        actual: Destination,
    },
    #[error("channel holds no signed states")]
    NoSignedStates,
    #[error("no state is supported by all participants")]
    NoSupportedState,
    #[error("signer is not participant {0}")]
    WrongSigner(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelType {
    Ledger,
    Virtual,
    Swap,
}

/// `Open → Challenge → Finalized`, with `Challenge → Open` on a cleared
/// challenge. No other backward transition exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelMode {
    Open,
    Challenge,
    Finalized,
}

/// What the chain has told us about this channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OnChainData {
    pub holdings: Funds,
    /// Unix timestamp at which a registered challenge finalizes; zero when
    /// no challenge is pending.
    pub finalizes_at: u64,
}

/// A channel as one participant sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: Destination,
    pub my_index: usize,
    pub channel_type: ChannelType,
    fixed: state::FixedPart,
    /// Signed states keyed by turn number.
    off_chain: BTreeMap<u64, SignedState>,
    pub on_chain: OnChainData,
    pub channel_mode: ChannelMode,
    pub is_challenge_initiated_by_me: bool,
    /// Highest block this channel has processed; older events are replays.
    pub latest_block_num: u64,
}

impl Channel {
    /// Creates a channel from its initial (turn 0) state, unsigned.
    pub fn new(
        initial: State,
        my_index: usize,
        channel_type: ChannelType,
    ) -> Result<Self, ChannelError> {
        let fixed = initial.fixed_part();
        fixed.validate()?;
        if my_index >= fixed.participants.len() {
            return Err(ChannelError::MyIndexOutOfRange(my_index));
        }
        let id = fixed.channel_id();
        let mut off_chain = BTreeMap::new();
        off_chain.insert(initial.turn_num, SignedState::new(initial));
        Ok(Channel {
            id,
            my_index,
            channel_type,
            fixed,
            off_chain,
            on_chain: OnChainData::default(),
            channel_mode: ChannelMode::Open,
            is_challenge_initiated_by_me: false,
            latest_block_num: 0,
        })
    }

    pub fn fixed_part(&self) -> &state::FixedPart {
        &self.fixed
    }

    pub fn participants(&self) -> &[crate::types::Address] {
        &self.fixed.participants
    }

    pub fn my_address(&self) -> crate::types::Address {
        self.fixed.participants[self.my_index]
    }

    pub fn my_destination(&self) -> Destination {
        self.my_address().to_destination()
    }

    /// Every participant except us, in slot order.
    pub fn other_participants(&self) -> Vec<crate::types::Address> {
        self.fixed
            .participants
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != self.my_index)
            .map(|(_, p)| *p)
            .collect()
    }

    /// Verifies and merges a signed state received from a peer or the
    /// chain. Idempotent per signature slot.
    pub fn add_signed_state(&mut self, ss: &SignedState) -> Result<(), ChannelError> {
        let cid = ss.state().channel_id();
        if cid != self.id {
            return Err(ChannelError::WrongChannel {
                expected: self.id,
                actual: cid,
            });
        }
        let turn = ss.state().turn_num;
        match self.off_chain.get_mut(&turn) {
            Some(existing) => {
                // Re-verify each incoming signature rather than trusting the
                // slot layout of a deserialized message.
                for sig in ss.signatures() {
                    existing.add_signature(sig)?;
                }
            }
            None => {
                let mut fresh = SignedState::new(ss.state().clone());
                for sig in ss.signatures() {
                    fresh.add_signature(sig)?;
                }
                self.off_chain.insert(turn, fresh);
            }
        }
        Ok(())
    }

    /// Signs `s` with our key and records it, returning our signed copy
    /// (the one to put on the wire).
    pub fn sign_and_add_state(
        &mut self,
        s: State,
        signer: &Signer,
    ) -> Result<SignedState, ChannelError> {
        if signer.address() != self.my_address() {
            return Err(ChannelError::WrongSigner(self.my_index));
        }
        let sig = s.sign(signer)?;
        let mut ss = SignedState::new(s);
        ss.add_signature(sig)?;
        self.add_signed_state(&ss)?;
        Ok(ss)
    }

    pub fn signed_state_for_turn(&self, turn: u64) -> Option<&SignedState> {
        self.off_chain.get(&turn)
    }

    /// Highest-turn state present, whatever its signature coverage.
    pub fn latest_signed_state(&self) -> Result<&SignedState, ChannelError> {
        self.off_chain
            .values()
            .next_back()
            .ok_or(ChannelError::NoSignedStates)
    }

    pub fn latest_signed_state_signed_by_me(&self) -> bool {
        self.latest_signed_state()
            .map(|ss| ss.has_signature_for(self.my_index))
            .unwrap_or(false)
    }

    /// Highest-turn state carrying signatures from every participant.
    pub fn latest_supported_state(&self) -> Result<&SignedState, ChannelError> {
        self.off_chain
            .values()
            .rev()
            .find(|ss| ss.has_all_signatures())
            .ok_or(ChannelError::NoSupportedState)
    }

    // Fund objectives work with the conventional turn numbers: 0 is the
    // prefund state, 1 the postfund state.

    pub fn pre_fund_state(&self) -> Result<State, ChannelError> {
        Ok(self
            .off_chain
            .get(&0)
            .ok_or(ChannelError::NoSignedStates)?
            .state()
            .clone())
    }

    pub fn post_fund_state(&self) -> Result<State, ChannelError> {
        if let Some(ss) = self.off_chain.get(&1) {
            return Ok(ss.state().clone());
        }
        let mut s = self.pre_fund_state()?;
        s.turn_num = 1;
        Ok(s)
    }

    pub fn pre_fund_signed_by_me(&self) -> bool {
        self.off_chain
            .get(&0)
            .map(|ss| ss.has_signature_for(self.my_index))
            .unwrap_or(false)
    }

    pub fn post_fund_signed_by_me(&self) -> bool {
        self.off_chain
            .get(&1)
            .map(|ss| ss.has_signature_for(self.my_index))
            .unwrap_or(false)
    }

    pub fn pre_fund_complete(&self) -> bool {
        self.off_chain
            .get(&0)
            .map(SignedState::has_all_signatures)
            .unwrap_or(false)
    }

    pub fn post_fund_complete(&self) -> bool {
        self.off_chain
            .get(&1)
            .map(SignedState::has_all_signatures)
            .unwrap_or(false)
    }

    pub fn fully_withdrawn(&self) -> bool {
        !self.on_chain.holdings.is_non_zero()
    }

    /// Applies an adjudicator event to the on-chain view. Events older than
    /// the latest observed block are ignored.
    pub fn update_with_chain_event(&mut self, event: &ChainEvent) -> Result<(), ChannelError> {
        let meta = event.meta();
        if meta.block_num < self.latest_block_num {
            return Ok(());
        }
        self.latest_block_num = meta.block_num;

        match event {
            ChainEvent::Deposited { asset, now_held, .. }
            | ChainEvent::AllocationUpdated { asset, now_held, .. }
            | ChainEvent::Reclaimed { asset, now_held, .. } => {
                self.on_chain.holdings.insert(*asset, *now_held);
            }
            ChainEvent::ChallengeRegistered {
                candidate,
                finalizes_at,
                ..
            } => {
                self.on_chain.finalizes_at = *finalizes_at;
                if self.channel_mode == ChannelMode::Open {
                    self.channel_mode = ChannelMode::Challenge;
                }
                // The candidate may carry signatures we have not seen.
                self.add_signed_state(candidate)?;
            }
            ChainEvent::ChallengeCleared { .. } => {
                if self.channel_mode == ChannelMode::Challenge {
                    self.on_chain.finalizes_at = 0;
                    self.channel_mode = ChannelMode::Open;
                }
            }
            ChainEvent::Concluded { finalizes_at, .. } => {
                self.on_chain.finalizes_at = *finalizes_at;
                self.channel_mode = ChannelMode::Finalized;
            }
        }
        Ok(())
    }

    /// Re-evaluates `channel_mode` against the clock: a pending challenge
    /// whose deadline has passed finalizes the channel.
    pub fn update_channel_mode(&mut self, now_timestamp: u64) {
        if self.channel_mode == ChannelMode::Finalized {
            return;
        }
        if self.on_chain.finalizes_at != 0 && now_timestamp >= self.on_chain.finalizes_at {
            self.channel_mode = ChannelMode::Finalized;
        } else if self.on_chain.finalizes_at != 0 {
            self.channel_mode = ChannelMode::Challenge;
        } else {
            self.channel_mode = ChannelMode::Open;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::EventMeta;
    use crate::channel::outcome::{Allocation, AssetMetadata, Exit, SingleAssetExit};
    use crate::types::{Address, U256};
    use rand::thread_rng;

    fn fixture() -> (Signer, Signer, Channel) {
        let mut rng = thread_rng();
        let alice = Signer::random(&mut rng);
        let bob = Signer::random(&mut rng);
        let state = State {
            participants: vec![alice.address(), bob.address()],
            channel_nonce: 7,
            app_definition: Address::default(),
            challenge_duration: 60,
            app_data: Vec::new(),
            outcome: Exit(vec![SingleAssetExit {
                asset: Address::default(),
                asset_metadata: AssetMetadata::default(),
                allocations: vec![
                    Allocation::simple(alice.address().to_destination(), U256::from(5u64)),
                    Allocation::simple(bob.address().to_destination(), U256::from(5u64)),
                ],
            }]),
            turn_num: 0,
            is_final: false,
        };
        let channel = Channel::new(state, 0, ChannelType::Ledger).unwrap();
        (alice, bob, channel)
    }

    #[test]
    fn out_of_range_index_fails() {
        let (_, _, c) = fixture();
        let state = c.pre_fund_state().unwrap();
        assert!(matches!(
            Channel::new(state, 2, ChannelType::Ledger),
            Err(ChannelError::MyIndexOutOfRange(2))
        ));
    }

    #[test]
    fn supported_state_requires_all_signatures() {
        let (alice, bob, mut c) = fixture();
        let s0 = c.pre_fund_state().unwrap();
        c.sign_and_add_state(s0.clone(), &alice).unwrap();
        assert!(c.latest_supported_state().is_err());

        let mut theirs = SignedState::new(s0.clone());
        theirs.add_signature(s0.sign(&bob).unwrap()).unwrap();
        c.add_signed_state(&theirs).unwrap();
        assert_eq!(c.latest_supported_state().unwrap().state().turn_num, 0);
    }

    #[test]
    fn latest_supported_tracks_highest_fully_signed_turn() {
        let (alice, bob, mut c) = fixture();
        for turn in [0u64, 1] {
            let mut s = c.pre_fund_state().unwrap();
            s.turn_num = turn;
            c.sign_and_add_state(s.clone(), &alice).unwrap();
            let mut theirs = SignedState::new(s.clone());
            theirs.add_signature(s.sign(&bob).unwrap()).unwrap();
            c.add_signed_state(&theirs).unwrap();
        }
        // Turn 2 only signed by us.
        let mut s2 = c.pre_fund_state().unwrap();
        s2.turn_num = 2;
        c.sign_and_add_state(s2, &alice).unwrap();

        assert_eq!(c.latest_supported_state().unwrap().state().turn_num, 1);
        assert_eq!(c.latest_signed_state().unwrap().state().turn_num, 2);
    }

    #[test]
    fn chain_events_advance_holdings_and_mode() {
        let (alice, bob, mut c) = fixture();
        let asset = Address::default();
        let channel_id = c.id;
        let meta = |block| EventMeta {
            channel_id,
            block_num: block,
            block_timestamp: block,
        };

        c.update_with_chain_event(&ChainEvent::Deposited {
            meta: meta(10),
            asset,
            now_held: U256::from(5u64),
        })
        .unwrap();
        assert_eq!(c.on_chain.holdings.get(&asset), U256::from(5u64));

        // Stale event (older block) is ignored.
        c.update_with_chain_event(&ChainEvent::Deposited {
            meta: meta(4),
            asset,
            now_held: U256::from(1u64),
        })
        .unwrap();
        assert_eq!(c.on_chain.holdings.get(&asset), U256::from(5u64));

        // Challenge with a fully signed candidate.
        let s0 = c.pre_fund_state().unwrap();
        let mut candidate = SignedState::new(s0.clone());
        candidate.add_signature(s0.sign(&alice).unwrap()).unwrap();
        candidate.add_signature(s0.sign(&bob).unwrap()).unwrap();
        c.update_with_chain_event(&ChainEvent::ChallengeRegistered {
            meta: meta(11),
            candidate,
            finalizes_at: 1000,
        })
        .unwrap();
        assert_eq!(c.channel_mode, ChannelMode::Challenge);

        c.update_channel_mode(999);
        assert_eq!(c.channel_mode, ChannelMode::Challenge);
        c.update_channel_mode(1000);
        assert_eq!(c.channel_mode, ChannelMode::Finalized);
    }

    #[test]
    fn cleared_challenge_reopens() {
        let (_, _, mut c) = fixture();
        c.on_chain.finalizes_at = 500;
        c.channel_mode = ChannelMode::Challenge;
        c.update_with_chain_event(&ChainEvent::ChallengeCleared {
            meta: EventMeta {
                channel_id: c.id,
                block_num: 20,
                block_timestamp: 20,
            },
            new_turn_num: 3,
        })
        .unwrap();
        assert_eq!(c.channel_mode, ChannelMode::Open);
        assert_eq!(c.on_chain.finalizes_at, 0);
    }
}
