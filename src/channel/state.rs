//! Channel states: fixed part, variable part, hashing and signing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::abiencode::{self, Token};
use crate::channel::outcome::Exit;
use crate::sig::{self, SigError, Signer};
use crate::types::{Address, Destination, Hash, Signature, U256};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("a channel must have at least two participants")]
    TooFewParticipants,
    #[error("channel participants must be distinct")]
    DuplicateParticipant,
    #[error("signature error: {0}")]
    Sig(#[from] SigError),
    #[error("recovered signer {0:?} is not a channel participant")]
    SignerNotParticipant(Address),
    #[error("signed states are for different states")]
    StateMismatch,
    #[error("signature count does not match participant count")]
    SignatureCount,
}

/// The invariant part of a channel. Hashing it yields the channel ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedPart {
    pub participants: Vec<Address>,
    pub channel_nonce: u64,
    pub app_definition: Address,
    /// Seconds. Encoded as a uint48 on-chain; values fit comfortably in u64.
    pub challenge_duration: u64,
}

impl FixedPart {
    pub fn validate(&self) -> Result<(), StateError> {
        if self.participants.len() < 2 {
            return Err(StateError::TooFewParticipants);
        }
        for (i, p) in self.participants.iter().enumerate() {
            if self.participants[..i].contains(p) {
                return Err(StateError::DuplicateParticipant);
            }
        }
        Ok(())
    }

    /// keccak256 of the canonical fixed-part encoding.
    pub fn channel_id(&self) -> Destination {
        let participants = Token::Array(
            self.participants
                .iter()
                .map(|p| Token::Address(*p))
                .collect(),
        );
        let hash = abiencode::to_hash(&[
            participants,
            Token::Uint(U256::from(self.channel_nonce)),
            Token::Address(self.app_definition),
            Token::Uint(U256::from(self.challenge_duration)),
        ]);
        Destination(hash.0)
    }
}

/// The part of a state which changes between turns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariablePart {
    pub outcome: Exit,
    pub app_data: Vec<u8>,
    pub turn_num: u64,
    pub is_final: bool,
}

/// A full channel state: fixed part plus variable part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub participants: Vec<Address>,
    pub channel_nonce: u64,
    pub app_definition: Address,
    pub challenge_duration: u64,
    pub app_data: Vec<u8>,
    pub outcome: Exit,
    pub turn_num: u64,
    pub is_final: bool,
}

impl State {
    pub fn from_parts(fixed: FixedPart, variable: VariablePart) -> Self {
        State {
            participants: fixed.participants,
            channel_nonce: fixed.channel_nonce,
            app_definition: fixed.app_definition,
            challenge_duration: fixed.challenge_duration,
            app_data: variable.app_data,
            outcome: variable.outcome,
            turn_num: variable.turn_num,
            is_final: variable.is_final,
        }
    }

    pub fn fixed_part(&self) -> FixedPart {
        FixedPart {
            participants: self.participants.clone(),
            channel_nonce: self.channel_nonce,
            app_definition: self.app_definition,
            challenge_duration: self.challenge_duration,
        }
    }

    pub fn variable_part(&self) -> VariablePart {
        VariablePart {
            outcome: self.outcome.clone(),
            app_data: self.app_data.clone(),
            turn_num: self.turn_num,
            is_final: self.is_final,
        }
    }

    pub fn channel_id(&self) -> Destination {
        self.fixed_part().channel_id()
    }

    /// keccak256 of `(channelId, appData, outcome, turnNum, isFinal)`.
    pub fn hash(&self) -> Hash {
        abiencode::to_hash(&[
            Token::Bytes32(self.channel_id().0),
            Token::Bytes(self.app_data.clone()),
            self.outcome.as_token(),
            Token::Uint(U256::from(self.turn_num)),
            Token::Bool(self.is_final),
        ])
    }

    pub fn sign(&self, signer: &Signer) -> Result<Signature, StateError> {
        Ok(signer.sign_eth(self.hash())?)
    }

    /// Recovers the address that produced `sig` and checks it is one of the
    /// channel's participants.
    pub fn recover_signer(&self, sig: Signature) -> Result<Address, StateError> {
        let addr = sig::recover_signer(self.hash(), sig)?;
        if !self.participants.contains(&addr) {
            return Err(StateError::SignerNotParticipant(addr));
        }
        Ok(addr)
    }
}

/// A state plus one signature slot per participant (zero when absent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedState {
    state: State,
    sigs: Vec<Signature>,
}

impl SignedState {
    pub fn new(state: State) -> Self {
        let n = state.participants.len();
        SignedState {
            state,
            sigs: vec![Signature::default(); n],
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Records a signature in the slot of whichever participant produced
    /// it. Idempotent in that slot.
    pub fn add_signature(&mut self, sig: Signature) -> Result<(), StateError> {
        let addr = self.state.recover_signer(sig)?;
        // recover_signer guarantees membership
        let idx = self
            .state
            .participants
            .iter()
            .position(|p| *p == addr)
            .expect("recovered signer is a participant");
        self.sigs[idx] = sig;
        Ok(())
    }

    pub fn signature_for(&self, participant_index: usize) -> Option<Signature> {
        let sig = *self.sigs.get(participant_index)?;
        (!sig.is_zero()).then_some(sig)
    }

    pub fn has_signature_for(&self, participant_index: usize) -> bool {
        self.signature_for(participant_index).is_some()
    }

    /// All non-empty signatures, in participant order.
    pub fn signatures(&self) -> Vec<Signature> {
        self.sigs.iter().copied().filter(|s| !s.is_zero()).collect()
    }

    pub fn has_all_signatures(&self) -> bool {
        self.sigs.iter().all(|s| !s.is_zero())
    }

    /// Absorbs the signatures of `other`, which must wrap the same state.
    pub fn merge(&mut self, other: &SignedState) -> Result<(), StateError> {
        if self.state != other.state {
            return Err(StateError::StateMismatch);
        }
        if self.sigs.len() != other.sigs.len() {
            return Err(StateError::SignatureCount);
        }
        for (slot, sig) in self.sigs.iter_mut().zip(other.sigs.iter()) {
            if slot.is_zero() && !sig.is_zero() {
                *slot = *sig;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::outcome::{Allocation, AssetMetadata, SingleAssetExit};
    use rand::thread_rng;

    fn two_party_state(a: Address, b: Address) -> State {
        State {
            participants: vec![a, b],
            channel_nonce: 37140676580,
            app_definition: Address::default(),
            challenge_duration: 60,
            app_data: Vec::new(),
            outcome: Exit(vec![SingleAssetExit {
                asset: Address::default(),
                asset_metadata: AssetMetadata::default(),
                allocations: vec![
                    Allocation::simple(a.to_destination(), U256::from(5u64)),
                    Allocation::simple(b.to_destination(), U256::from(5u64)),
                ],
            }]),
            turn_num: 0,
            is_final: false,
        }
    }

    #[test]
    fn channel_id_depends_only_on_fixed_part() {
        let a = Address([0x0a; 20]);
        let b = Address([0x0b; 20]);
        let s1 = two_party_state(a, b);
        let mut s2 = s1.clone();
        s2.turn_num = 5;
        s2.is_final = true;
        assert_eq!(s1.channel_id(), s2.channel_id());

        let mut s3 = s1.clone();
        s3.channel_nonce += 1;
        assert_ne!(s1.channel_id(), s3.channel_id());
    }

    #[test]
    fn fixed_part_validation() {
        let a = Address([0x0a; 20]);
        let fp = FixedPart {
            participants: vec![a],
            channel_nonce: 1,
            app_definition: Address::default(),
            challenge_duration: 60,
        };
        assert!(matches!(
            fp.validate(),
            Err(StateError::TooFewParticipants)
        ));
        let fp = FixedPart {
            participants: vec![a, a],
            channel_nonce: 1,
            app_definition: Address::default(),
            challenge_duration: 60,
        };
        assert!(matches!(
            fp.validate(),
            Err(StateError::DuplicateParticipant)
        ));
    }

    #[test]
    fn signing_and_slotting() {
        let mut rng = thread_rng();
        let alice = Signer::random(&mut rng);
        let bob = Signer::random(&mut rng);
        let state = two_party_state(alice.address(), bob.address());

        let mut ss = SignedState::new(state.clone());
        assert!(!ss.has_all_signatures());

        let sig_a = state.sign(&alice).unwrap();
        ss.add_signature(sig_a).unwrap();
        assert!(ss.has_signature_for(0));
        assert!(!ss.has_signature_for(1));

        // Idempotent in the slot.
        ss.add_signature(sig_a).unwrap();
        assert_eq!(ss.signatures().len(), 1);

        let sig_b = state.sign(&bob).unwrap();
        ss.add_signature(sig_b).unwrap();
        assert!(ss.has_all_signatures());
    }

    #[test]
    fn stranger_signature_is_rejected() {
        let mut rng = thread_rng();
        let alice = Signer::random(&mut rng);
        let bob = Signer::random(&mut rng);
        let mallory = Signer::random(&mut rng);
        let state = two_party_state(alice.address(), bob.address());
        let mut ss = SignedState::new(state.clone());
        let sig = state.sign(&mallory).unwrap();
        assert!(matches!(
            ss.add_signature(sig),
            Err(StateError::SignerNotParticipant(_))
        ));
    }

    #[test]
    fn merge_requires_same_state() {
        let mut rng = thread_rng();
        let alice = Signer::random(&mut rng);
        let bob = Signer::random(&mut rng);
        let state = two_party_state(alice.address(), bob.address());

        let mut ours = SignedState::new(state.clone());
        ours.add_signature(state.sign(&alice).unwrap()).unwrap();

        let mut theirs = SignedState::new(state.clone());
        theirs.add_signature(state.sign(&bob).unwrap()).unwrap();

        ours.merge(&theirs).unwrap();
        assert!(ours.has_all_signatures());

        let mut different = state.clone();
        different.turn_num += 1;
        let other = SignedState::new(different);
        assert!(matches!(ours.merge(&other), Err(StateError::StateMismatch)));
    }

    #[test]
    fn signed_state_json_fixed_point() {
        let mut rng = thread_rng();
        let alice = Signer::random(&mut rng);
        let bob = Signer::random(&mut rng);
        let state = two_party_state(alice.address(), bob.address());
        let mut ss = SignedState::new(state.clone());
        ss.add_signature(state.sign(&alice).unwrap()).unwrap();

        let json = serde_json::to_string(&ss).unwrap();
        let back: SignedState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ss);
    }
}
