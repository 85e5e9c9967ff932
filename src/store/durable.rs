//! Durable store backend over sled. One tree per record family, JSON
//! values, keys derived from the hex rendering of the record's ID.

use std::path::Path;

use crate::channel::consensus::ConsensusChannel;
use crate::channel::Channel;
use crate::payments::swaps::{Swap, SwapHistory};
use crate::payments::{PaymentError, VoucherInfo, VoucherStore};
use crate::protocols::{Objective, ObjectiveEnum, ObjectiveId, Related};
use crate::types::{Address, Destination};

use super::{check_lock, Store, StoreError};

const LAST_BLOCK_KEY: &str = "lastBlockNumSeen";

pub struct DurableStore {
    db: sled::Db,
    objectives: sled::Tree,
    channels: sled::Tree,
    consensus_channels: sled::Tree,
    channel_to_objective: sled::Tree,
    vouchers: sled::Tree,
    swaps: sled::Tree,
    channel_to_swaps: sled::Tree,
    meta: sled::Tree,
}

fn dest_key(d: Destination) -> String {
    format!("{d:?}")
}

fn get_json<T: serde::de::DeserializeOwned>(
    tree: &sled::Tree,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match tree.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        None => Ok(None),
    }
}

fn put_json<T: serde::Serialize>(
    tree: &sled::Tree,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    tree.insert(key, serde_json::to_vec(value)?)?;
    Ok(())
}

impl DurableStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(DurableStore {
            objectives: db.open_tree("objectives")?,
            channels: db.open_tree("channels")?,
            consensus_channels: db.open_tree("consensus_channels")?,
            channel_to_objective: db.open_tree("channel_to_objective")?,
            vouchers: db.open_tree("vouchers")?,
            swaps: db.open_tree("swaps")?,
            channel_to_swaps: db.open_tree("channel_to_swaps")?,
            meta: db.open_tree("meta")?,
            db,
        })
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl Store for DurableStore {
    fn get_objective(&self, id: &ObjectiveId) -> Result<Option<ObjectiveEnum>, StoreError> {
        get_json(&self.objectives, &id.0)
    }

    fn set_objective(&self, o: &ObjectiveEnum) -> Result<(), StoreError> {
        let cid = o.owns_channel();
        if !cid.is_zero() {
            let owner = match get_json::<ObjectiveId>(&self.channel_to_objective, &dest_key(cid))? {
                Some(owner_id) => self.get_objective(&owner_id)?,
                None => None,
            };
            check_lock(owner.as_ref(), o, cid)?;
            put_json(&self.channel_to_objective, &dest_key(cid), &o.id())?;
        }
        for rel in o.related() {
            match rel {
                Related::Channel(c) => put_json(&self.channels, &dest_key(c.id), c)?,
                Related::Consensus(cc) => {
                    put_json(&self.consensus_channels, &dest_key(cc.id), cc)?
                }
            }
        }
        put_json(&self.objectives, &o.id().0, o)?;
        self.flush()
    }

    fn get_objective_by_channel_id(
        &self,
        channel_id: Destination,
    ) -> Result<Option<ObjectiveEnum>, StoreError> {
        match get_json::<ObjectiveId>(&self.channel_to_objective, &dest_key(channel_id))? {
            Some(id) => self.get_objective(&id),
            None => Ok(None),
        }
    }

    fn get_objectives(&self) -> Result<Vec<ObjectiveEnum>, StoreError> {
        let mut out = Vec::new();
        for entry in self.objectives.iter() {
            let (_, raw) = entry?;
            out.push(serde_json::from_slice(&raw)?);
        }
        Ok(out)
    }

    fn get_channel(&self, id: Destination) -> Result<Option<Channel>, StoreError> {
        get_json(&self.channels, &dest_key(id))
    }

    fn set_channel(&self, c: &Channel) -> Result<(), StoreError> {
        put_json(&self.channels, &dest_key(c.id), c)?;
        self.flush()
    }

    fn destroy_channel(&self, id: Destination) -> Result<(), StoreError> {
        self.channels.remove(dest_key(id))?;
        self.flush()
    }

    fn get_consensus_channel(
        &self,
        id: Destination,
    ) -> Result<Option<ConsensusChannel>, StoreError> {
        get_json(&self.consensus_channels, &dest_key(id))
    }

    fn get_consensus_channel_by_counterparty(
        &self,
        counterparty: Address,
    ) -> Result<Option<ConsensusChannel>, StoreError> {
        for entry in self.consensus_channels.iter() {
            let (_, raw) = entry?;
            let cc: ConsensusChannel = serde_json::from_slice(&raw)?;
            if cc.counterparty() == counterparty {
                return Ok(Some(cc));
            }
        }
        Ok(None)
    }

    fn get_all_consensus_channels(&self) -> Result<Vec<ConsensusChannel>, StoreError> {
        let mut out = Vec::new();
        for entry in self.consensus_channels.iter() {
            let (_, raw) = entry?;
            out.push(serde_json::from_slice(&raw)?);
        }
        Ok(out)
    }

    fn set_consensus_channel(&self, cc: &ConsensusChannel) -> Result<(), StoreError> {
        put_json(&self.consensus_channels, &dest_key(cc.id), cc)?;
        self.flush()
    }

    fn destroy_consensus_channel(&self, id: Destination) -> Result<(), StoreError> {
        self.consensus_channels.remove(dest_key(id))?;
        self.flush()
    }

    fn set_swap(&self, swap: &Swap) -> Result<(), StoreError> {
        put_json(&self.swaps, &dest_key(swap.id), swap)?;
        let history_key = dest_key(swap.channel_id);
        let mut history: SwapHistory =
            get_json(&self.channel_to_swaps, &history_key)?.unwrap_or_default();
        if let Some(evicted) = history.push(swap.id) {
            if evicted != swap.id {
                self.swaps.remove(dest_key(evicted))?;
            }
        }
        put_json(&self.channel_to_swaps, &history_key, &history)?;
        self.flush()
    }

    fn get_swap(&self, id: Destination) -> Result<Option<Swap>, StoreError> {
        get_json(&self.swaps, &dest_key(id))
    }

    fn get_swaps_by_channel_id(&self, channel_id: Destination) -> Result<Vec<Swap>, StoreError> {
        let history: SwapHistory =
            match get_json(&self.channel_to_swaps, &dest_key(channel_id))? {
                Some(h) => h,
                None => return Ok(Vec::new()),
            };
        let mut out = Vec::new();
        for id in history.ids() {
            if let Some(swap) = self.get_swap(id)? {
                out.push(swap);
            }
        }
        Ok(out)
    }

    fn last_block_num_seen(&self) -> Result<u64, StoreError> {
        match self.meta.get(LAST_BLOCK_KEY)? {
            // Stored as a decimal string for greppability.
            Some(raw) => String::from_utf8_lossy(&raw)
                .parse()
                .map_err(|e| StoreError::Backend(format!("corrupt block counter: {e}"))),
            None => Ok(0),
        }
    }

    fn set_last_block_num_seen(&self, block_num: u64) -> Result<(), StoreError> {
        self.meta
            .insert(LAST_BLOCK_KEY, block_num.to_string().as_bytes())?;
        self.flush()
    }
}

impl VoucherStore for DurableStore {
    fn set_voucher_info(
        &self,
        channel_id: Destination,
        info: VoucherInfo,
    ) -> Result<(), PaymentError> {
        put_json(&self.vouchers, &dest_key(channel_id), &info)
            .map_err(|e| PaymentError::Store(e.to_string()))?;
        self.flush().map_err(|e| PaymentError::Store(e.to_string()))
    }

    fn get_voucher_info(
        &self,
        channel_id: Destination,
    ) -> Result<Option<VoucherInfo>, PaymentError> {
        get_json(&self.vouchers, &dest_key(channel_id))
            .map_err(|e| PaymentError::Store(e.to_string()))
    }

    fn remove_voucher_info(&self, channel_id: Destination) -> Result<(), PaymentError> {
        self.vouchers
            .remove(dest_key(channel_id))
            .map_err(|e| PaymentError::Store(e.to_string()))?;
        self.flush().map_err(|e| PaymentError::Store(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::direct_fund::tests::fixture;
    use crate::protocols::direct_fund::DirectFund;

    fn funding_objective() -> ObjectiveEnum {
        let fx = fixture();
        ObjectiveEnum::DirectFund(
            DirectFund::new(&fx.request, true, fx.alice.address(), false).unwrap(),
        )
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let o = funding_objective();
        {
            let store = DurableStore::open(dir.path()).unwrap();
            store.set_objective(&o).unwrap();
            store.set_last_block_num_seen(17).unwrap();
        }
        let store = DurableStore::open(dir.path()).unwrap();
        let back = store.get_objective(&o.id()).unwrap().unwrap();
        assert_eq!(back.id(), o.id());
        assert_eq!(store.last_block_num_seen().unwrap(), 17);
        assert!(store.get_channel(o.owns_channel()).unwrap().is_some());
        assert_eq!(
            store
                .get_objective_by_channel_id(o.owns_channel())
                .unwrap()
                .unwrap()
                .id(),
            o.id()
        );
    }

    #[test]
    fn consensus_channels_roundtrip() {
        use crate::channel::consensus::tests::Fixture;

        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::open(dir.path()).unwrap();
        let fx = Fixture::new();
        let (lc, _) = fx.pair(50, 50);
        store.set_consensus_channel(&lc).unwrap();

        let back = store.get_consensus_channel(lc.id).unwrap().unwrap();
        assert_eq!(back.consensus_turn_num(), lc.consensus_turn_num());
        assert_eq!(
            store
                .get_consensus_channel_by_counterparty(fx.follower.address())
                .unwrap()
                .unwrap()
                .id,
            lc.id
        );
        assert_eq!(store.get_all_consensus_channels().unwrap().len(), 1);

        store.destroy_consensus_channel(lc.id).unwrap();
        assert!(store.get_consensus_channel(lc.id).unwrap().is_none());
    }

    #[test]
    fn swap_history_is_bounded_across_restarts() {
        use crate::payments::swaps::{Exchange, MAX_SWAP_STORAGE_LIMIT};
        use crate::types::U256;

        let dir = tempfile::tempdir().unwrap();
        let channel_id = Destination([0x33; 32]);
        {
            let store = DurableStore::open(dir.path()).unwrap();
            for nonce in 0..(MAX_SWAP_STORAGE_LIMIT as u64 + 2) {
                let swap = Swap::new(
                    channel_id,
                    Exchange {
                        token_in: Address::default(),
                        token_out: Address([0x02; 20]),
                        amount_in: U256::from(nonce + 1),
                        amount_out: U256::from(1u64),
                    },
                    nonce,
                );
                store.set_swap(&swap).unwrap();
            }
        }
        let store = DurableStore::open(dir.path()).unwrap();
        let kept = store.get_swaps_by_channel_id(channel_id).unwrap();
        assert_eq!(kept.len(), MAX_SWAP_STORAGE_LIMIT);
    }
}
