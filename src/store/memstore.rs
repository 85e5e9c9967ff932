//! In-memory store backend. Everything lives in maps behind one mutex;
//! used by tests and by nodes that can afford to lose state.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::channel::consensus::ConsensusChannel;
use crate::channel::Channel;
use crate::payments::swaps::{Swap, SwapHistory};
use crate::payments::{PaymentError, VoucherInfo, VoucherStore};
use crate::protocols::{Objective, ObjectiveEnum, ObjectiveId, Related};
use crate::types::{Address, Destination};

use super::{check_lock, Store, StoreError};

#[derive(Default)]
struct Inner {
    objectives: BTreeMap<ObjectiveId, ObjectiveEnum>,
    channels: BTreeMap<Destination, Channel>,
    consensus_channels: BTreeMap<Destination, ConsensusChannel>,
    channel_to_objective: BTreeMap<Destination, ObjectiveId>,
    vouchers: BTreeMap<Destination, VoucherInfo>,
    swaps: BTreeMap<Destination, Swap>,
    channel_to_swaps: BTreeMap<Destination, SwapHistory>,
    last_block_num_seen: u64,
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Store for MemStore {
    fn get_objective(&self, id: &ObjectiveId) -> Result<Option<ObjectiveEnum>, StoreError> {
        Ok(self.lock().objectives.get(id).cloned())
    }

    fn set_objective(&self, o: &ObjectiveEnum) -> Result<(), StoreError> {
        let mut g = self.lock();
        let cid = o.owns_channel();
        if !cid.is_zero() {
            let owner = g
                .channel_to_objective
                .get(&cid)
                .and_then(|id| g.objectives.get(id));
            check_lock(owner, o, cid)?;
            g.channel_to_objective.insert(cid, o.id());
        }
        for rel in o.related() {
            match rel {
                Related::Channel(c) => {
                    g.channels.insert(c.id, c.clone());
                }
                Related::Consensus(cc) => {
                    g.consensus_channels.insert(cc.id, cc.clone());
                }
            }
        }
        g.objectives.insert(o.id(), o.clone());
        Ok(())
    }

    fn get_objective_by_channel_id(
        &self,
        channel_id: Destination,
    ) -> Result<Option<ObjectiveEnum>, StoreError> {
        let g = self.lock();
        Ok(g.channel_to_objective
            .get(&channel_id)
            .and_then(|id| g.objectives.get(id))
            .cloned())
    }

    fn get_objectives(&self) -> Result<Vec<ObjectiveEnum>, StoreError> {
        Ok(self.lock().objectives.values().cloned().collect())
    }

    fn get_channel(&self, id: Destination) -> Result<Option<Channel>, StoreError> {
        Ok(self.lock().channels.get(&id).cloned())
    }

    fn set_channel(&self, c: &Channel) -> Result<(), StoreError> {
        self.lock().channels.insert(c.id, c.clone());
        Ok(())
    }

    fn destroy_channel(&self, id: Destination) -> Result<(), StoreError> {
        self.lock().channels.remove(&id);
        Ok(())
    }

    fn get_consensus_channel(
        &self,
        id: Destination,
    ) -> Result<Option<ConsensusChannel>, StoreError> {
        Ok(self.lock().consensus_channels.get(&id).cloned())
    }

    fn get_consensus_channel_by_counterparty(
        &self,
        counterparty: Address,
    ) -> Result<Option<ConsensusChannel>, StoreError> {
        Ok(self
            .lock()
            .consensus_channels
            .values()
            .find(|cc| cc.counterparty() == counterparty)
            .cloned())
    }

    fn get_all_consensus_channels(&self) -> Result<Vec<ConsensusChannel>, StoreError> {
        Ok(self.lock().consensus_channels.values().cloned().collect())
    }

    fn set_consensus_channel(&self, cc: &ConsensusChannel) -> Result<(), StoreError> {
        self.lock().consensus_channels.insert(cc.id, cc.clone());
        Ok(())
    }

    fn destroy_consensus_channel(&self, id: Destination) -> Result<(), StoreError> {
        self.lock().consensus_channels.remove(&id);
        Ok(())
    }

    fn set_swap(&self, swap: &Swap) -> Result<(), StoreError> {
        let mut g = self.lock();
        g.swaps.insert(swap.id, swap.clone());
        let history = g.channel_to_swaps.entry(swap.channel_id).or_default();
        if let Some(evicted) = history.push(swap.id) {
            if evicted != swap.id {
                g.swaps.remove(&evicted);
            }
        }
        Ok(())
    }

    fn get_swap(&self, id: Destination) -> Result<Option<Swap>, StoreError> {
        Ok(self.lock().swaps.get(&id).cloned())
    }

    fn get_swaps_by_channel_id(&self, channel_id: Destination) -> Result<Vec<Swap>, StoreError> {
        let g = self.lock();
        let Some(history) = g.channel_to_swaps.get(&channel_id) else {
            return Ok(Vec::new());
        };
        Ok(history.ids().filter_map(|id| g.swaps.get(&id).cloned()).collect())
    }

    fn last_block_num_seen(&self) -> Result<u64, StoreError> {
        Ok(self.lock().last_block_num_seen)
    }

    fn set_last_block_num_seen(&self, block_num: u64) -> Result<(), StoreError> {
        self.lock().last_block_num_seen = block_num;
        Ok(())
    }
}

impl VoucherStore for MemStore {
    fn set_voucher_info(
        &self,
        channel_id: Destination,
        info: VoucherInfo,
    ) -> Result<(), PaymentError> {
        self.lock().vouchers.insert(channel_id, info);
        Ok(())
    }

    fn get_voucher_info(
        &self,
        channel_id: Destination,
    ) -> Result<Option<VoucherInfo>, PaymentError> {
        Ok(self.lock().vouchers.get(&channel_id).cloned())
    }

    fn remove_voucher_info(&self, channel_id: Destination) -> Result<(), PaymentError> {
        self.lock().vouchers.remove(&channel_id);
        Ok(())
    }
}
