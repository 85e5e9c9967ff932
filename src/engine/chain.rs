//! The abstract chain backend and an in-process mock of it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::chain::{ChainEvent, ChainTransaction, EventMeta};
use crate::types::{Destination, Funds, U256};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("transaction rejected: {0}")]
    Rejected(String),
}

/// Submits transactions to the adjudicator. Events come back through the
/// subscription the engine was constructed with.
pub trait ChainService: Send {
    fn submit(&mut self, tx: ChainTransaction) -> Result<(), ChainError>;
}

const EVENT_BUFFER: usize = 64;

#[derive(Default)]
struct MockChainInner {
    holdings: BTreeMap<Destination, Funds>,
    block_num: u64,
    subscribers: Vec<mpsc::Sender<ChainEvent>>,
}

/// An in-process adjudicator: one instance is shared by every node under
/// test, mined instantly, one block per transaction.
#[derive(Clone, Default)]
pub struct MockChain {
    inner: Arc<Mutex<MockChainInner>>,
}

impl MockChain {
    pub fn new() -> Self {
        MockChain::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockChainInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribes to every event the chain emits from now on.
    pub fn subscribe(&self) -> mpsc::Receiver<ChainEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.lock().subscribers.push(tx);
        rx
    }

    pub fn holdings(&self, channel_id: Destination) -> Funds {
        self.lock().holdings.get(&channel_id).cloned().unwrap_or_default()
    }
}

impl MockChainInner {
    fn meta(&self, channel_id: Destination) -> EventMeta {
        EventMeta {
            channel_id,
            block_num: self.block_num,
            block_timestamp: self.block_num,
        }
    }

    fn broadcast(&mut self, event: ChainEvent) {
        self.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(?event, "mock chain subscriber buffer full, event lost");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    fn drain(&mut self, channel_id: Destination, assets: Vec<crate::types::Address>) {
        self.holdings.insert(channel_id, Funds::new());
        let meta = self.meta(channel_id);
        for asset in assets {
            self.broadcast(ChainEvent::AllocationUpdated {
                meta,
                asset,
                now_held: U256::zero(),
            });
        }
    }
}

impl ChainService for MockChain {
    fn submit(&mut self, tx: ChainTransaction) -> Result<(), ChainError> {
        let mut chain = self.lock();
        chain.block_num += 1;
        match tx {
            ChainTransaction::Deposit {
                channel_id,
                expected_held,
                deposit,
            } => {
                let held = chain.holdings.entry(channel_id).or_default().clone();
                // The adjudicator's deposit helper reverts unless current
                // holdings match what the depositor saw; this is what makes
                // re-submitted deposits idempotent.
                if !held.covers(&expected_held) {
                    return Err(ChainError::Rejected(format!(
                        "holdings below expected for {channel_id:?}"
                    )));
                }
                let updated = held.add(&deposit);
                chain.holdings.insert(channel_id, updated.clone());
                let meta = chain.meta(channel_id);
                for (asset, _) in deposit.0.iter() {
                    chain.broadcast(ChainEvent::Deposited {
                        meta,
                        asset: *asset,
                        now_held: updated.get(asset),
                    });
                }
            }
            ChainTransaction::WithdrawAll {
                channel_id,
                signed_state,
            }
            | ChainTransaction::TransferAllAssets {
                channel_id,
                signed_state,
            } => {
                let assets = signed_state
                    .state()
                    .outcome
                    .0
                    .iter()
                    .map(|sae| sae.asset)
                    .collect();
                chain.drain(channel_id, assets);
            }
            ChainTransaction::MirrorWithdrawAll {
                channel_id,
                l2_signed_state,
            } => {
                let assets = l2_signed_state
                    .state()
                    .outcome
                    .0
                    .iter()
                    .map(|sae| sae.asset)
                    .collect();
                chain.drain(channel_id, assets);
            }
            ChainTransaction::Challenge {
                channel_id,
                candidate,
                ..
            } => {
                let meta = chain.meta(channel_id);
                let finalizes_at =
                    meta.block_timestamp + candidate.state().challenge_duration;
                chain.broadcast(ChainEvent::ChallengeRegistered {
                    meta,
                    candidate,
                    finalizes_at,
                });
            }
            ChainTransaction::Checkpoint {
                channel_id,
                candidate,
            } => {
                let meta = chain.meta(channel_id);
                chain.broadcast(ChainEvent::ChallengeCleared {
                    meta,
                    new_turn_num: candidate.state().turn_num,
                });
            }
            ChainTransaction::Reclaim {
                ledger_id,
                guarantee_amount,
                ..
            } => {
                let held = chain.holdings.entry(ledger_id).or_default().clone();
                let meta = chain.meta(ledger_id);
                for (asset, amount) in held.0.iter() {
                    chain.broadcast(ChainEvent::Reclaimed {
                        meta,
                        asset: *asset,
                        now_held: amount.saturating_sub(guarantee_amount),
                    });
                }
            }
        }
        Ok(())
    }
}
