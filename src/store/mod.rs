//! Persistence for objectives, channels, consensus channels, vouchers
//! and swaps. Two backends: an in-memory map store for tests and
//! ephemeral nodes, and a sled-backed durable store.

mod durable;
mod memstore;

pub use durable::DurableStore;
pub use memstore::MemStore;

use thiserror::Error;

use crate::channel::consensus::ConsensusChannel;
use crate::channel::Channel;
use crate::payments::swaps::Swap;
use crate::payments::VoucherStore;
use crate::protocols::{Objective, ObjectiveEnum, ObjectiveId, ObjectiveStatus};
use crate::types::{Address, Destination};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("channel {0:?} is already owned by objective {1}")]
    ChannelLocked(Destination, ObjectiveId),
    #[error("no objective {0} in the store")]
    NoSuchObjective(ObjectiveId),
    #[error("no channel {0:?} in the store")]
    NoSuchChannel(Destination),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("storage backend: {0}")]
    Backend(String),
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Typed persistence shared by the engine and the voucher manager.
///
/// `set_objective` persists the objective together with every channel it
/// reports as related, and records the channel-to-objective ownership
/// lock. Two live objectives may never own the same channel.
pub trait Store: VoucherStore + Send + Sync {
    fn get_objective(&self, id: &ObjectiveId) -> Result<Option<ObjectiveEnum>, StoreError>;
    fn set_objective(&self, o: &ObjectiveEnum) -> Result<(), StoreError>;
    fn get_objective_by_channel_id(
        &self,
        channel_id: Destination,
    ) -> Result<Option<ObjectiveEnum>, StoreError>;
    fn get_objectives(&self) -> Result<Vec<ObjectiveEnum>, StoreError>;

    fn get_channel(&self, id: Destination) -> Result<Option<Channel>, StoreError>;
    fn set_channel(&self, c: &Channel) -> Result<(), StoreError>;
    fn destroy_channel(&self, id: Destination) -> Result<(), StoreError>;

    fn get_consensus_channel(
        &self,
        id: Destination,
    ) -> Result<Option<ConsensusChannel>, StoreError>;
    /// The ledger shared with `counterparty`, if one is live.
    fn get_consensus_channel_by_counterparty(
        &self,
        counterparty: Address,
    ) -> Result<Option<ConsensusChannel>, StoreError>;
    fn get_all_consensus_channels(&self) -> Result<Vec<ConsensusChannel>, StoreError>;
    fn set_consensus_channel(&self, cc: &ConsensusChannel) -> Result<(), StoreError>;
    fn destroy_consensus_channel(&self, id: Destination) -> Result<(), StoreError>;

    /// Persists a swap and appends it to its channel's bounded history,
    /// garbage-collecting the displaced record if the history is full.
    fn set_swap(&self, swap: &Swap) -> Result<(), StoreError>;
    fn get_swap(&self, id: Destination) -> Result<Option<Swap>, StoreError>;
    fn get_swaps_by_channel_id(&self, channel_id: Destination) -> Result<Vec<Swap>, StoreError>;

    fn last_block_num_seen(&self) -> Result<u64, StoreError>;
    fn set_last_block_num_seen(&self, block_num: u64) -> Result<(), StoreError>;
}

/// The swap under a not-yet-finished Swap objective on `channel_id`,
/// found by scanning live swap objectives. Swap objectives own no
/// channel, so the ownership index cannot answer this.
pub fn pending_swap_by_channel_id<S: Store + ?Sized>(
    store: &S,
    channel_id: Destination,
) -> Result<Option<Swap>, StoreError> {
    for o in store.get_objectives()? {
        if let ObjectiveEnum::Swap(s) = o {
            let live = !matches!(
                s.status,
                ObjectiveStatus::Completed | ObjectiveStatus::Rejected
            );
            if live && s.swap.channel_id == channel_id {
                return Ok(Some(s.swap));
            }
        }
    }
    Ok(None)
}

/// Whether an objective still participates in the ownership lock.
fn is_live(o: &ObjectiveEnum) -> bool {
    !matches!(
        o.status(),
        ObjectiveStatus::Completed | ObjectiveStatus::Rejected
    )
}

/// Lock bookkeeping shared by the backends: the owner entry a new
/// objective may claim, or the conflicting live owner.
fn check_lock(
    existing_owner: Option<&ObjectiveEnum>,
    incoming: &ObjectiveEnum,
    channel_id: Destination,
) -> Result<(), StoreError> {
    if let Some(owner) = existing_owner {
        if owner.id() != incoming.id() && is_live(owner) && is_live(incoming) {
            return Err(StoreError::ChannelLocked(channel_id, owner.id()));
        }
    }
    Ok(())
}
