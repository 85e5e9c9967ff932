//! Types crossing the boundary between the node and the blockchain.
//!
//! The engine only ever sees these; the concrete backend (a real EVM client
//! or the in-process mock) lives behind [crate::engine::chain::ChainService].

use serde::{Deserialize, Serialize};

use crate::channel::state::SignedState;
use crate::types::{Address, Destination, Funds, Signature, U256};

/// Fields common to every adjudicator event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    pub channel_id: Destination,
    pub block_num: u64,
    pub block_timestamp: u64,
}

/// An adjudicator log entry, as observed by the chain service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainEvent {
    Deposited {
        meta: EventMeta,
        asset: Address,
        now_held: U256,
    },
    AllocationUpdated {
        meta: EventMeta,
        asset: Address,
        now_held: U256,
    },
    ChallengeRegistered {
        meta: EventMeta,
        candidate: SignedState,
        finalizes_at: u64,
    },
    ChallengeCleared {
        meta: EventMeta,
        new_turn_num: u64,
    },
    Concluded {
        meta: EventMeta,
        finalizes_at: u64,
    },
    Reclaimed {
        meta: EventMeta,
        asset: Address,
        now_held: U256,
    },
}

impl ChainEvent {
    pub fn meta(&self) -> EventMeta {
        match self {
            ChainEvent::Deposited { meta, .. }
            | ChainEvent::AllocationUpdated { meta, .. }
            | ChainEvent::ChallengeRegistered { meta, .. }
            | ChainEvent::ChallengeCleared { meta, .. }
            | ChainEvent::Concluded { meta, .. }
            | ChainEvent::Reclaimed { meta, .. } => *meta,
        }
    }

    pub fn channel_id(&self) -> Destination {
        self.meta().channel_id
    }
}

/// Notification that a submitted transaction was dropped from the mempool
/// and needs to be retried by its objective.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedEvent {
    pub channel_id: Destination,
    pub tx: ChainTransaction,
}

/// A transaction the node asks the chain service to submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainTransaction {
    Deposit {
        channel_id: Destination,
        /// Holdings we expect on-chain before our deposit lands; the
        /// adjudicator's deposit helper is conditional on this, making the
        /// call idempotent.
        expected_held: Funds,
        deposit: Funds,
    },
    /// Conclude with a fully-signed final state and transfer all assets.
    WithdrawAll {
        channel_id: Destination,
        signed_state: SignedState,
    },
    Challenge {
        channel_id: Destination,
        candidate: SignedState,
        challenger_sig: Signature,
    },
    Checkpoint {
        channel_id: Destination,
        candidate: SignedState,
    },
    TransferAllAssets {
        channel_id: Destination,
        signed_state: SignedState,
    },
    /// Collapse a virtual channel's guarantee back into its ledger using
    /// two signed final states.
    Reclaim {
        ledger_id: Destination,
        target_id: Destination,
        guarantee_amount: U256,
    },
    /// Withdraw the L1 mirror of a bridged channel using the finalized L2
    /// signed state.
    MirrorWithdrawAll {
        channel_id: Destination,
        l2_signed_state: SignedState,
    },
}

impl ChainTransaction {
    pub fn channel_id(&self) -> Destination {
        match self {
            ChainTransaction::Deposit { channel_id, .. }
            | ChainTransaction::WithdrawAll { channel_id, .. }
            | ChainTransaction::Challenge { channel_id, .. }
            | ChainTransaction::Checkpoint { channel_id, .. }
            | ChainTransaction::TransferAllAssets { channel_id, .. }
            | ChainTransaction::MirrorWithdrawAll { channel_id, .. } => *channel_id,
            ChainTransaction::Reclaim { ledger_id, .. } => *ledger_id,
        }
    }
}
