//! Micropayments over virtual channels.
//!
//! A voucher is a cumulative claim "the payer owes the payee N of the
//! channel's funds", signed by the payer. Only the largest voucher matters;
//! redeeming is idempotent and out-of-order delivery is harmless.

pub mod swaps;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::abiencode::{self, Token};
use crate::sig::{recover_signer, SigError, Signer};
use crate::types::{Address, Destination, Hash, Signature, U256};

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("channel {0:?} already registered")]
    ChannelAlreadyRegistered(Destination),
    #[error("channel {0:?} not registered")]
    ChannelNotRegistered(Destination),
    #[error("payment amount exceeds the channel balance")]
    AmountExceedsBalance,
    #[error("only the payer {payer:?} may sign vouchers, got {got:?}")]
    NotPayer { payer: Address, got: Address },
    #[error("voucher signature does not recover to the payer")]
    InvalidVoucherSignature,
    #[error(transparent)]
    Sig(#[from] SigError),
    #[error("voucher store: {0}")]
    Store(String),
}

/// A signed cumulative payment claim for one virtual channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voucher {
    pub channel_id: Destination,
    pub amount: U256,
    pub signature: Signature,
}

impl Voucher {
    pub fn new(channel_id: Destination, amount: U256) -> Self {
        Voucher {
            channel_id,
            amount,
            signature: Signature::default(),
        }
    }

    pub fn hash(&self) -> Hash {
        abiencode::to_hash(&[
            Token::Bytes32(self.channel_id.0),
            Token::Uint(self.amount),
        ])
    }

    pub fn sign(&mut self, signer: &Signer) -> Result<(), SigError> {
        self.signature = signer.sign_eth(self.hash())?;
        Ok(())
    }

    pub fn recover_signer(&self) -> Result<Address, SigError> {
        recover_signer(self.hash(), self.signature)
    }
}

/// Everything the manager tracks for one payment channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherInfo {
    pub channel_payer: Address,
    pub channel_payee: Address,
    pub starting_balance: U256,
    pub largest_voucher: Voucher,
}

impl VoucherInfo {
    pub fn paid(&self) -> U256 {
        self.largest_voucher.amount
    }

    pub fn remaining(&self) -> U256 {
        self.starting_balance - self.largest_voucher.amount
    }
}

/// Persistence boundary for voucher state, implemented by both store
/// backends.
pub trait VoucherStore: Send + Sync {
    fn set_voucher_info(&self, id: Destination, info: VoucherInfo) -> Result<(), PaymentError>;
    fn get_voucher_info(&self, id: Destination) -> Result<Option<VoucherInfo>, PaymentError>;
    fn remove_voucher_info(&self, id: Destination) -> Result<(), PaymentError>;
}

/// Tracks, creates and redeems vouchers on behalf of one node.
#[derive(Clone)]
pub struct VoucherManager {
    me: Address,
    store: Arc<dyn VoucherStore>,
}

impl VoucherManager {
    pub fn new(me: Address, store: Arc<dyn VoucherStore>) -> Self {
        VoucherManager { me, store }
    }

    fn info(&self, channel_id: Destination) -> Result<VoucherInfo, PaymentError> {
        self.store
            .get_voucher_info(channel_id)?
            .ok_or(PaymentError::ChannelNotRegistered(channel_id))
    }

    /// Starts tracking a payment channel with the given starting balance.
    pub fn register(
        &self,
        channel_id: Destination,
        payer: Address,
        payee: Address,
        starting_balance: U256,
    ) -> Result<(), PaymentError> {
        if self.store.get_voucher_info(channel_id)?.is_some() {
            return Err(PaymentError::ChannelAlreadyRegistered(channel_id));
        }
        let info = VoucherInfo {
            channel_payer: payer,
            channel_payee: payee,
            starting_balance,
            largest_voucher: Voucher::new(channel_id, U256::zero()),
        };
        self.store.set_voucher_info(channel_id, info)
    }

    pub fn remove(&self, channel_id: Destination) -> Result<(), PaymentError> {
        self.store.remove_voucher_info(channel_id)
    }

    pub fn channel_registered(&self, channel_id: Destination) -> bool {
        matches!(self.store.get_voucher_info(channel_id), Ok(Some(_)))
    }

    /// Creates a voucher increasing the cumulative paid amount by `amount`.
    /// Only the payer may do this.
    pub fn pay(
        &self,
        channel_id: Destination,
        amount: U256,
        signer: &Signer,
    ) -> Result<Voucher, PaymentError> {
        let mut info = self.info(channel_id)?;
        if signer.address() != info.channel_payer || self.me != info.channel_payer {
            return Err(PaymentError::NotPayer {
                payer: info.channel_payer,
                got: signer.address(),
            });
        }
        if amount > info.remaining() {
            return Err(PaymentError::AmountExceedsBalance);
        }
        let mut voucher = Voucher::new(channel_id, info.paid() + amount);
        voucher.sign(signer)?;
        info.largest_voucher = voucher.clone();
        self.store.set_voucher_info(channel_id, info)?;
        Ok(voucher)
    }

    /// Redeems a voucher, returning `(total, delta)`. Vouchers that do not
    /// increase the total are accepted with `delta = 0`.
    pub fn receive(&self, voucher: &Voucher) -> Result<(U256, U256), PaymentError> {
        let mut info = self.info(voucher.channel_id)?;
        if voucher.amount > info.starting_balance {
            return Err(PaymentError::AmountExceedsBalance);
        }
        let signer = voucher.recover_signer()?;
        if signer != info.channel_payer {
            return Err(PaymentError::InvalidVoucherSignature);
        }

        let previous = info.paid();
        if voucher.amount <= previous {
            return Ok((previous, U256::zero()));
        }
        let delta = voucher.amount - previous;
        info.largest_voucher = voucher.clone();
        self.store.set_voucher_info(voucher.channel_id, info)?;
        Ok((voucher.amount, delta))
    }

    pub fn paid(&self, channel_id: Destination) -> Result<U256, PaymentError> {
        Ok(self.info(channel_id)?.paid())
    }

    pub fn remaining(&self, channel_id: Destination) -> Result<U256, PaymentError> {
        Ok(self.info(channel_id)?.remaining())
    }

    pub fn paid_and_remaining(
        &self,
        channel_id: Destination,
    ) -> Result<(U256, U256), PaymentError> {
        let info = self.info(channel_id)?;
        Ok((info.paid(), info.remaining()))
    }

    /// The largest voucher, provided it covers at least `min_amount`.
    pub fn voucher_if_amount_present(
        &self,
        channel_id: Destination,
        min_amount: U256,
    ) -> Result<Option<Voucher>, PaymentError> {
        let info = self.info(channel_id)?;
        if info.paid() >= min_amount && !info.paid().is_zero() {
            Ok(Some(info.largest_voucher))
        } else {
            Ok(None)
        }
    }
}
