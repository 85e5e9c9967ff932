//! The consensus ledger channel: an agreed `current` state plus an ordered
//! queue of proposed amendments awaiting counter-signature.
//!
//! Two participants by construction. The leader (participant 0) proposes
//! adds and removes; the follower (participant 1) counter-signs or rejects.

mod follower;
mod leader;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::outcome::{
    Allocation, AllocationType, AssetMetadata, Exit, GuaranteeMetadata, SingleAssetExit,
};
use crate::channel::state::{FixedPart, SignedState, State, StateError};
use crate::sig::Signer;
use crate::types::{Address, Destination, Funds, Signature, U256};

pub const LEADER: usize = 0;
pub const FOLLOWER: usize = 1;

#[derive(Debug, Error, PartialEq)]
pub enum ConsensusError {
    #[error("proposal ID and channel ID do not match")]
    IncorrectChannelId,
    #[error("incorrect turn number: expected {expected}, got {got}")]
    IncorrectTurnNum { expected: u64, got: u64 },
    #[error("unable to divert to guarantee: invalid deposit")]
    InvalidDeposit,
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("duplicate guarantee detected")]
    DuplicateGuarantee,
    #[error("guarantee not found")]
    GuaranteeNotFound,
    #[error("left amount is greater than the guarantee amount")]
    InvalidAmount,
    #[error("guarantee left/right do not match the ledger participants")]
    NoMatchingBalance,
    #[error("no outcome for asset {0:?}")]
    NoMatchingAsset(Address),
    #[error("only the leader may perform this operation")]
    NotLeader,
    #[error("only the follower may perform this operation")]
    NotFollower,
    #[error("the proposal queue holds no entry for that turn")]
    ProposalQueueExhausted,
    #[error("queue head does not match the expected proposal")]
    NonMatchingProposal,
    #[error("participant {expected} did not sign: recovered {recovered:?}")]
    WrongSigner {
        expected: usize,
        recovered: Address,
    },
    #[error("state error: {0}")]
    State(String),
    #[error("outcome exit is not a valid ledger outcome")]
    InvalidExit,
}

impl From<StateError> for ConsensusError {
    fn from(e: StateError) -> Self {
        ConsensusError::State(e.to_string())
    }
}

/// A simple (type 0) single-asset allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    destination: Destination,
    amount: U256,
}

impl Balance {
    pub fn new(destination: Destination, amount: U256) -> Self {
        Balance {
            destination,
            amount,
        }
    }

    pub fn destination(&self) -> Destination {
        self.destination
    }

    pub fn amount(&self) -> U256 {
        self.amount
    }

    fn as_allocation(&self) -> Allocation {
        Allocation::simple(self.destination, self.amount)
    }
}

/// A guarantee (type 1) allocation earmarking ledger funds for a target
/// channel, with an explicit left/right ordering of the two participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guarantee {
    amount: U256,
    target: Destination,
    left: Destination,
    right: Destination,
}

impl Guarantee {
    pub fn new(amount: U256, target: Destination, left: Destination, right: Destination) -> Self {
        Guarantee {
            amount,
            target,
            left,
            right,
        }
    }

    pub fn amount(&self) -> U256 {
        self.amount
    }

    pub fn target(&self) -> Destination {
        self.target
    }

    pub fn left(&self) -> Destination {
        self.left
    }

    pub fn right(&self) -> Destination {
        self.right
    }

    fn as_allocation(&self) -> Allocation {
        Allocation::guarantee(
            self.target,
            self.amount,
            GuaranteeMetadata {
                left: self.left,
                right: self.right,
            },
        )
    }
}

/// One asset's slice of the ledger outcome: a leader balance, a follower
/// balance, and the active guarantees keyed by target.
///
/// The conventional allocation ordering when rendered on-chain is
/// `[leader, follower, ...guarantees sorted by target]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerOutcome {
    asset_address: Address,
    leader: Balance,
    follower: Balance,
    guarantees: BTreeMap<Destination, Guarantee>,
}

impl LedgerOutcome {
    pub fn new(
        asset_address: Address,
        leader: Balance,
        follower: Balance,
        guarantees: Vec<Guarantee>,
    ) -> Self {
        LedgerOutcome {
            asset_address,
            leader,
            follower,
            guarantees: guarantees.into_iter().map(|g| (g.target, g)).collect(),
        }
    }

    pub fn asset_address(&self) -> Address {
        self.asset_address
    }

    pub fn leader(&self) -> &Balance {
        &self.leader
    }

    pub fn follower(&self) -> &Balance {
        &self.follower
    }

    pub fn guarantee_for(&self, target: &Destination) -> Option<&Guarantee> {
        self.guarantees.get(target)
    }

    fn includes(&self, g: &Guarantee) -> bool {
        self.guarantees.get(&g.target) == Some(g)
    }

    pub fn includes_target(&self, target: &Destination) -> bool {
        self.guarantees.contains_key(target)
    }

    fn funding_targets(&self) -> Vec<Destination> {
        self.guarantees.keys().copied().collect()
    }

    /// Renders this ledger outcome as a single-asset exit in the
    /// conventional order. The guarantee map already iterates in ascending
    /// target order.
    pub fn as_single_asset_exit(&self) -> SingleAssetExit {
        let mut allocations = vec![self.leader.as_allocation(), self.follower.as_allocation()];
        allocations.extend(self.guarantees.values().map(Guarantee::as_allocation));
        SingleAssetExit {
            asset: self.asset_address,
            asset_metadata: AssetMetadata::default(),
            allocations,
        }
    }

    /// Interprets a single-asset exit as a ledger outcome.
    ///
    /// Assumes the conventional ordering: allocation 0 is the leader,
    /// allocation 1 the follower, everything else a guarantee.
    pub fn from_single_asset_exit(sae: &SingleAssetExit) -> Result<Self, ConsensusError> {
        if sae.allocations.len() < 2 {
            return Err(ConsensusError::InvalidExit);
        }
        let leader = Balance::new(sae.allocations[0].destination, sae.allocations[0].amount);
        let follower = Balance::new(sae.allocations[1].destination, sae.allocations[1].amount);
        let mut guarantees = BTreeMap::new();
        for a in &sae.allocations {
            if a.allocation_type == AllocationType::Guarantee {
                let meta = GuaranteeMetadata::decode(&a.metadata)
                    .map_err(|_| ConsensusError::InvalidExit)?;
                guarantees.insert(
                    a.destination,
                    Guarantee::new(a.amount, a.destination, meta.left, meta.right),
                );
            }
        }
        Ok(LedgerOutcome {
            asset_address: sae.asset,
            leader,
            follower,
            guarantees,
        })
    }
}

/// The turn number and outcome of one ledger state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vars {
    pub turn_num: u64,
    pub outcome: Vec<LedgerOutcome>,
}

impl Vars {
    fn outcome_for_asset_mut(&mut self, asset: Address) -> Option<&mut LedgerOutcome> {
        // Multi-asset selection: the first outcome whose asset matches,
        // mirroring the historical behavior of the protocol.
        self.outcome.iter_mut().find(|o| o.asset_address == asset)
    }

    fn outcome_for_asset(&self, asset: Address) -> Option<&LedgerOutcome> {
        self.outcome.iter().find(|o| o.asset_address == asset)
    }

    pub fn includes(&self, g: &Guarantee, asset: Address) -> bool {
        self.outcome_for_asset(asset)
            .map(|o| o.includes(g))
            .unwrap_or(false)
    }

    pub fn includes_target(&self, target: &Destination) -> bool {
        self.outcome.iter().any(|o| o.includes_target(target))
    }

    pub fn funding_targets(&self) -> Vec<Destination> {
        self.outcome
            .iter()
            .flat_map(LedgerOutcome::funding_targets)
            .collect()
    }

    /// Applies a proposal to the receiver, incrementing the turn number.
    ///
    /// On error the receiver is left untouched: callers pass clones and
    /// commit only on success.
    pub fn handle_proposal(&mut self, p: &Proposal) -> Result<(), ConsensusError> {
        match &p.change {
            ProposalChange::Add(add) => self.add(add),
            ProposalChange::Remove(remove) => self.remove(remove),
        }
    }

    /// Adds a guarantee, deducting the deposits from the two balances.
    fn add(&mut self, p: &Add) -> Result<(), ConsensusError> {
        let o = self
            .outcome_for_asset(p.asset_address)
            .ok_or(ConsensusError::NoMatchingAsset(p.asset_address))?;

        if o.guarantees.contains_key(&p.guarantee.target) {
            return Err(ConsensusError::DuplicateGuarantee);
        }

        let leader_is_left = if o.leader.destination == p.guarantee.left {
            true
        } else if o.follower.destination == p.guarantee.left {
            false
        } else {
            return Err(ConsensusError::NoMatchingBalance);
        };
        let (left_amount, right_amount) = if leader_is_left {
            (o.leader.amount, o.follower.amount)
        } else {
            (o.follower.amount, o.leader.amount)
        };

        if p.left_deposit > p.guarantee.amount {
            return Err(ConsensusError::InvalidDeposit);
        }
        if p.left_deposit > left_amount {
            return Err(ConsensusError::InsufficientFunds);
        }
        let right_deposit = p.right_deposit();
        if right_deposit > right_amount {
            return Err(ConsensusError::InsufficientFunds);
        }

        // All checks passed; commit.
        self.turn_num += 1;
        let o = self
            .outcome_for_asset_mut(p.asset_address)
            .expect("asset outcome checked above");
        if leader_is_left {
            o.leader.amount = o.leader.amount - p.left_deposit;
            o.follower.amount = o.follower.amount - right_deposit;
        } else {
            o.follower.amount = o.follower.amount - p.left_deposit;
            o.leader.amount = o.leader.amount - right_deposit;
        }
        o.guarantees.insert(p.guarantee.target, p.guarantee.clone());
        Ok(())
    }

    /// Removes a guarantee, crediting its amount back to the balances
    /// according to the left/right split.
    fn remove(&mut self, p: &Remove) -> Result<(), ConsensusError> {
        let o = self
            .outcome_for_asset(p.asset_address)
            .ok_or(ConsensusError::NoMatchingAsset(p.asset_address))?;

        let guarantee = o
            .guarantees
            .get(&p.target)
            .ok_or(ConsensusError::GuaranteeNotFound)?
            .clone();

        if p.left_amount > guarantee.amount {
            return Err(ConsensusError::InvalidAmount);
        }

        self.turn_num += 1;
        let right_amount = guarantee.amount - p.left_amount;
        let o = self
            .outcome_for_asset_mut(p.asset_address)
            .expect("asset outcome checked above");
        if o.leader.destination == guarantee.left {
            o.leader.amount = o.leader.amount + p.left_amount;
            o.follower.amount = o.follower.amount + right_amount;
        } else {
            o.leader.amount = o.leader.amount + right_amount;
            o.follower.amount = o.follower.amount + p.left_amount;
        }
        o.guarantees.remove(&p.target);
        Ok(())
    }

    /// Renders these vars as a full channel state over the fixed part.
    pub fn as_state(&self, fp: &FixedPart) -> State {
        let exit = Exit(
            self.outcome
                .iter()
                .map(LedgerOutcome::as_single_asset_exit)
                .collect(),
        );
        State {
            participants: fp.participants.clone(),
            channel_nonce: fp.channel_nonce,
            app_definition: fp.app_definition,
            challenge_duration: fp.challenge_duration,
            app_data: Vec::new(),
            outcome: exit,
            turn_num: self.turn_num,
            is_final: false,
        }
    }
}

/// Vars plus the two signatures making them the consensus state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedVars {
    pub vars: Vars,
    pub signatures: [Signature; 2],
}

/// An amendment to the ledger outcome: add or remove one guarantee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalChange {
    Add(Add),
    Remove(Remove),
}

/// A proposed amendment addressed to one consensus channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// The consensus channel which should receive the proposal. The target
    /// virtual channel is inside the change.
    pub ledger_id: Destination,
    pub change: ProposalChange,
}

impl Proposal {
    pub fn add(ledger_id: Destination, g: Guarantee, left_deposit: U256, asset: Address) -> Self {
        Proposal {
            ledger_id,
            change: ProposalChange::Add(Add {
                guarantee: g,
                left_deposit,
                asset_address: asset,
            }),
        }
    }

    pub fn remove(
        ledger_id: Destination,
        target: Destination,
        left_amount: U256,
        asset: Address,
    ) -> Self {
        Proposal {
            ledger_id,
            change: ProposalChange::Remove(Remove {
                target,
                left_amount,
                asset_address: asset,
            }),
        }
    }

    /// The channel this proposal funds or defunds.
    pub fn target(&self) -> Destination {
        match &self.change {
            ProposalChange::Add(a) => a.guarantee.target,
            ProposalChange::Remove(r) => r.target,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Add {
    pub guarantee: Guarantee,
    /// The portion of the guarantee amount funded by the "left"
    /// participant; the right participant funds the difference.
    pub left_deposit: U256,
    pub asset_address: Address,
}

impl Add {
    pub fn right_deposit(&self) -> U256 {
        self.guarantee.amount - self.left_deposit
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remove {
    /// The virtual channel being defunded.
    pub target: Destination,
    /// The amount credited back to the "left" participant; the right
    /// participant is credited the difference.
    pub left_amount: U256,
    pub asset_address: Address,
}

/// A proposal signed by its proposer, stamped with the turn number the
/// amended state will carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedProposal {
    pub signature: Signature,
    pub proposal: Proposal,
    pub turn_num: u64,
}

/// A running two-party ledger channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusChannel {
    pub id: Destination,
    pub my_index: usize,
    pub on_chain_funding: Funds,
    fp: FixedPart,
    /// The consensus state, signed by both parties.
    current: SignedVars,
    /// Proposed changes applicable on top of `current`, ordered by
    /// strictly contiguous turn number.
    proposal_queue: Vec<SignedProposal>,
}

impl ConsensusChannel {
    /// Constructs a consensus channel, checking that both signatures are
    /// valid over the initial state.
    pub fn new(
        fp: FixedPart,
        my_index: usize,
        initial_turn_num: u64,
        outcome: Vec<LedgerOutcome>,
        signatures: [Signature; 2],
    ) -> Result<Self, ConsensusError> {
        fp.validate()?;
        let id = fp.channel_id();
        let vars = Vars {
            turn_num: initial_turn_num,
            outcome,
        };
        let state = vars.as_state(&fp);
        for (idx, sig) in signatures.iter().enumerate() {
            let recovered = state.recover_signer(*sig)?;
            if recovered != fp.participants[idx] {
                return Err(ConsensusError::WrongSigner {
                    expected: idx,
                    recovered,
                });
            }
        }
        Ok(ConsensusChannel {
            id,
            my_index,
            on_chain_funding: Funds::new(),
            fp,
            current: SignedVars {
                vars,
                signatures,
            },
            proposal_queue: Vec::new(),
        })
    }

    pub fn fixed_part(&self) -> &FixedPart {
        &self.fp
    }

    pub fn participants(&self) -> &[Address] {
        &self.fp.participants
    }

    pub fn is_leader(&self) -> bool {
        self.my_index == LEADER
    }

    pub fn is_follower(&self) -> bool {
        self.my_index == FOLLOWER
    }

    pub fn leader(&self) -> Address {
        self.fp.participants[LEADER]
    }

    pub fn follower(&self) -> Address {
        self.fp.participants[FOLLOWER]
    }

    pub fn my_address(&self) -> Address {
        self.fp.participants[self.my_index]
    }

    pub fn counterparty(&self) -> Address {
        self.fp.participants[1 - self.my_index]
    }

    pub fn my_destination(&self) -> Destination {
        self.my_address().to_destination()
    }

    pub fn consensus_turn_num(&self) -> u64 {
        self.current.vars.turn_num
    }

    pub fn consensus_vars(&self) -> &Vars {
        &self.current.vars
    }

    pub fn signatures(&self) -> [Signature; 2] {
        self.current.signatures
    }

    pub fn proposal_queue(&self) -> &[SignedProposal] {
        &self.proposal_queue
    }

    /// Channels funded by guarantees in the consensus state.
    pub fn funding_targets(&self) -> Vec<Destination> {
        self.current.vars.funding_targets()
    }

    /// True when the consensus state includes the given guarantee.
    pub fn includes(&self, g: &Guarantee, asset: Address) -> bool {
        self.current.vars.includes(g, asset)
    }

    pub fn includes_target(&self, target: &Destination) -> bool {
        self.current.vars.includes_target(target)
    }

    /// True when applying the whole queue would include `g` and the
    /// consensus state does not already.
    pub fn is_proposed(&self, g: &Guarantee, asset: Address) -> Result<bool, ConsensusError> {
        let latest = self.latest_proposed_vars()?;
        Ok(latest.includes(g, asset) && !self.includes(g, asset))
    }

    /// Like [Self::is_proposed], but restricted to the head of the queue.
    pub fn is_proposed_next(&self, g: &Guarantee, asset: Address) -> Result<bool, ConsensusError> {
        let Some(head) = self.proposal_queue.first() else {
            return Ok(false);
        };
        if let Ok(dump) = serde_json::to_string(&self.proposal_queue) {
            tracing::trace!(proposal_queue = %dump, "inspecting queue head");
        }
        let mut vars = self.current.vars.clone();
        vars.handle_proposal(&head.proposal)?;
        if vars.turn_num != head.turn_num {
            return Err(ConsensusError::IncorrectTurnNum {
                expected: vars.turn_num,
                got: head.turn_num,
            });
        }
        Ok(vars.includes(g, asset) && !self.includes(g, asset))
    }

    /// True when a queued proposal removes the guarantee for `target`.
    pub fn has_removal_been_proposed(&self, target: Destination, asset: Address) -> bool {
        self.proposal_queue.iter().any(|p| {
            matches!(&p.proposal.change, ProposalChange::Remove(r)
                if r.target == target && r.asset_address == asset)
        })
    }

    pub fn has_removal_been_proposed_next(&self, target: Destination, asset: Address) -> bool {
        self.proposal_queue.first().is_some_and(|p| {
            matches!(&p.proposal.change, ProposalChange::Remove(r)
                if r.target == target && r.asset_address == asset)
        })
    }

    /// Clones `current` and applies every queued proposal in order.
    pub fn latest_proposed_vars(&self) -> Result<Vars, ConsensusError> {
        let mut vars = self.current.vars.clone();
        for p in &self.proposal_queue {
            vars.handle_proposal(&p.proposal)?;
        }
        Ok(vars)
    }

    fn validate_proposal_id(&self, proposal: &Proposal) -> Result<(), ConsensusError> {
        if proposal.ledger_id != self.id {
            return Err(ConsensusError::IncorrectChannelId);
        }
        Ok(())
    }

    fn sign_vars(&self, vars: &Vars, signer: &Signer) -> Result<Signature, ConsensusError> {
        if signer.address() != self.my_address() {
            return Err(ConsensusError::WrongSigner {
                expected: self.my_index,
                recovered: signer.address(),
            });
        }
        Ok(vars.as_state(&self.fp).sign(signer)?)
    }

    fn recover_vars_signer(
        &self,
        vars: &Vars,
        sig: Signature,
    ) -> Result<Address, ConsensusError> {
        Ok(vars.as_state(&self.fp).recover_signer(sig)?)
    }

    /// Dispatches a counterparty proposal message to the role-specific
    /// handler.
    pub fn receive(&mut self, sp: SignedProposal) -> Result<(), ConsensusError> {
        if self.is_follower() {
            self.follower_receive(sp)
        } else {
            self.leader_receive(sp)
        }
    }

    /// The consensus state rendered as a fully signed state.
    pub fn supported_signed_state(&self) -> SignedState {
        let state = self.current.vars.as_state(&self.fp);
        let mut ss = SignedState::new(state);
        for sig in self.current.signatures {
            // Both signatures were validated at construction or consensus
            // time; a failure here would mean internal corruption.
            let _ = ss.add_signature(sig);
        }
        ss
    }

    /// Builds a consensus channel from a plain channel whose latest
    /// supported state has the conventional ledger shape. Used when a
    /// funding objective completes and governance transfers.
    pub fn from_channel(
        c: &crate::channel::Channel,
        my_index: usize,
    ) -> Result<Self, ConsensusError> {
        let ss = c
            .latest_supported_state()
            .map_err(|e| ConsensusError::State(e.to_string()))?;
        let outcome = ss
            .state()
            .outcome
            .0
            .iter()
            .map(LedgerOutcome::from_single_asset_exit)
            .collect::<Result<Vec<_>, _>>()?;
        let signatures = [
            ss.signature_for(LEADER)
                .ok_or(ConsensusError::InvalidExit)?,
            ss.signature_for(FOLLOWER)
                .ok_or(ConsensusError::InvalidExit)?,
        ];
        let mut cc = ConsensusChannel::new(
            c.fixed_part().clone(),
            my_index,
            ss.state().turn_num,
            outcome,
            signatures,
        )?;
        cc.on_chain_funding = c.on_chain.holdings.clone();
        Ok(cc)
    }
}
