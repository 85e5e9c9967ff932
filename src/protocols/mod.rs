//! Objectives: the state machines driving each channel lifecycle.
//!
//! An objective is cranked by the engine whenever relevant input arrives.
//! Each crank inspects the accumulated data, emits side effects (outbound
//! messages, chain transactions, ledger proposals) and reports what it is
//! waiting for next. Cranks are idempotent over persisted state, so a crash
//! and re-crank resend at most what the stored state demands.

pub mod bridged_defund;
pub mod bridged_fund;
pub mod direct_defund;
pub mod direct_fund;
pub mod messages;
pub mod mirror_bridged_defund;
pub mod swap;
pub mod swap_defund;
pub mod swap_fund;
pub mod virtual_defund;
pub mod virtual_fund;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::ChainTransaction;
use crate::channel::consensus::{ConsensusChannel, ConsensusError, Proposal};
use crate::channel::state::StateError;
use crate::channel::{Channel, ChannelError};
use crate::payments::PaymentError;
use crate::sig::SigError;
use crate::types::Destination;

use messages::{Message, ObjectivePayload};

#[derive(Debug, Error)]
pub enum ObjectiveError {
    #[error("objective is not approved")]
    NotApproved,
    #[error("objective {0} is not of the expected kind")]
    WrongKind(ObjectiveId),
    #[error("malformed objective ID: {0}")]
    MalformedId(String),
    #[error("payload missing or of unexpected type")]
    InvalidPayload,
    #[error("payload serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("a ledger channel with this counterparty already exists")]
    LedgerChannelExists,
    #[error("{0:?} is not a participant of the channel")]
    NotAParticipant(crate::types::Address),
    #[error("no final state in the payload")]
    NoFinalState,
    #[error("ledger channel still funds other channels")]
    LedgerStillFunding,
    #[error("ledger channel has pending proposals")]
    PendingProposals,
    #[error("a channel leg has zero funds")]
    ZeroFunds,
    #[error("swap would overdraw a channel balance")]
    InvalidSwap,
    #[error("a swap objective is already pending on this channel")]
    SwapObjectiveExists,
    #[error("no ledger connection to {0:?}")]
    NoLedgerConnection(crate::types::Address),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Sig(#[from] SigError),
    #[error(transparent)]
    Payment(#[from] PaymentError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveStatus {
    Unapproved,
    Approved,
    Rejected,
    Completed,
}

/// The label an objective reports while paused. Compared for equality by
/// the engine and surfaced in logs and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitingFor(pub &'static str);

impl std::fmt::Display for WaitingFor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

pub const WAITING_FOR_NOTHING: WaitingFor = WaitingFor("Nothing");

/// Everything a crank wants the engine to do on its behalf, emitted only
/// after the objective has been persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SideEffects {
    pub messages_to_send: Vec<Message>,
    pub transactions_to_submit: Vec<ChainTransaction>,
    pub proposals_to_process: Vec<Proposal>,
}

impl SideEffects {
    pub fn merge(&mut self, mut other: SideEffects) {
        self.messages_to_send.append(&mut other.messages_to_send);
        self.transactions_to_submit
            .append(&mut other.transactions_to_submit);
        self.proposals_to_process
            .append(&mut other.proposals_to_process);
    }

    pub fn is_empty(&self) -> bool {
        self.messages_to_send.is_empty()
            && self.transactions_to_submit.is_empty()
            && self.proposals_to_process.is_empty()
    }
}

/// The closed set of objective kinds, in dependency-free form. The wire
/// and storage representation of a kind is its ID prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveKind {
    DirectFund,
    DirectDefund,
    VirtualFund,
    VirtualDefund,
    SwapFund,
    SwapDefund,
    Swap,
    BridgedFund,
    BridgedDefund,
    MirrorBridgedDefund,
}

impl ObjectiveKind {
    pub const ALL: [ObjectiveKind; 10] = [
        ObjectiveKind::DirectFund,
        ObjectiveKind::DirectDefund,
        ObjectiveKind::VirtualFund,
        ObjectiveKind::VirtualDefund,
        ObjectiveKind::SwapFund,
        ObjectiveKind::SwapDefund,
        ObjectiveKind::Swap,
        ObjectiveKind::BridgedFund,
        ObjectiveKind::BridgedDefund,
        ObjectiveKind::MirrorBridgedDefund,
    ];

    /// The historical prefix spelling differs for mirrored defunds and is
    /// kept for compatibility with stored and in-flight IDs.
    pub fn prefix(self) -> &'static str {
        match self {
            ObjectiveKind::DirectFund => "DirectFund-",
            ObjectiveKind::DirectDefund => "DirectDefund-",
            ObjectiveKind::VirtualFund => "VirtualFund-",
            ObjectiveKind::VirtualDefund => "VirtualDefund-",
            ObjectiveKind::SwapFund => "SwapFund-",
            ObjectiveKind::SwapDefund => "SwapDefund-",
            ObjectiveKind::Swap => "Swap-",
            ObjectiveKind::BridgedFund => "BridgedFund-",
            ObjectiveKind::BridgedDefund => "BridgedDefund-",
            ObjectiveKind::MirrorBridgedDefund => "mirrorbridgeddefunding-",
        }
    }
}

/// `"<kind>-<channel id hex>"`, the storage and wire identity of an
/// objective.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectiveId(pub String);

impl ObjectiveId {
    pub fn new(kind: ObjectiveKind, cid: Destination) -> Self {
        ObjectiveId(format!("{}{:?}", kind.prefix(), cid))
    }

    pub fn kind(&self) -> Result<ObjectiveKind, ObjectiveError> {
        // "Swap-" is a prefix of nothing else, but "SwapFund-" starts with
        // "Swap" too, so match on the full prefix including the dash.
        ObjectiveKind::ALL
            .into_iter()
            .find(|k| self.0.starts_with(k.prefix()))
            .ok_or_else(|| ObjectiveError::MalformedId(self.0.clone()))
    }

    /// The channel ID embedded in the objective ID.
    pub fn channel_id(&self) -> Result<Destination, ObjectiveError> {
        let kind = self.kind()?;
        self.0[kind.prefix().len()..]
            .parse()
            .map_err(|_| ObjectiveError::MalformedId(self.0.clone()))
    }
}

impl std::fmt::Display for ObjectiveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A channel record an objective carries and the store must persist
/// alongside it.
#[derive(Debug)]
pub enum Related<'a> {
    Channel(&'a Channel),
    Consensus(&'a ConsensusChannel),
}

/// Common surface of all objective state machines.
///
/// `crank` takes `&mut self`; callers wanting transactional semantics
/// clone first and commit the clone on success, which is what the engine
/// does.
pub trait Objective {
    fn id(&self) -> ObjectiveId;
    fn status(&self) -> ObjectiveStatus;
    /// The channel whose ownership this objective locks, or the zero
    /// destination if it owns none.
    fn owns_channel(&self) -> Destination;
    fn related(&self) -> Vec<Related<'_>>;
    fn approve(&mut self);
    /// Marks the objective rejected and produces rejection notices for the
    /// other participants.
    fn reject(&mut self, me: crate::types::Address) -> SideEffects;
    /// Folds an inbound payload into the objective's accumulated state.
    fn update(&mut self, payload: &ObjectivePayload) -> Result<(), ObjectiveError>;
    fn crank(&mut self, signer: &crate::sig::Signer)
        -> Result<(SideEffects, WaitingFor), ObjectiveError>;
}

/// Serializable sum of all objective kinds; what the store persists and
/// the engine dispatches on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ObjectiveEnum {
    DirectFund(direct_fund::DirectFund),
    DirectDefund(direct_defund::DirectDefund),
    VirtualFund(virtual_fund::VirtualFund),
    VirtualDefund(virtual_defund::VirtualDefund),
    SwapFund(swap_fund::SwapFund),
    SwapDefund(swap_defund::SwapDefund),
    Swap(swap::SwapObjective),
    BridgedFund(bridged_fund::BridgedFund),
    BridgedDefund(bridged_defund::BridgedDefund),
    MirrorBridgedDefund(mirror_bridged_defund::MirrorBridgedDefund),
}

macro_rules! delegate {
    ($self:expr, $o:ident => $body:expr) => {
        match $self {
            ObjectiveEnum::DirectFund($o) => $body,
            ObjectiveEnum::DirectDefund($o) => $body,
            ObjectiveEnum::VirtualFund($o) => $body,
            ObjectiveEnum::VirtualDefund($o) => $body,
            ObjectiveEnum::SwapFund($o) => $body,
            ObjectiveEnum::SwapDefund($o) => $body,
            ObjectiveEnum::Swap($o) => $body,
            ObjectiveEnum::BridgedFund($o) => $body,
            ObjectiveEnum::BridgedDefund($o) => $body,
            ObjectiveEnum::MirrorBridgedDefund($o) => $body,
        }
    };
}

impl Objective for ObjectiveEnum {
    fn id(&self) -> ObjectiveId {
        delegate!(self, o => o.id())
    }

    fn status(&self) -> ObjectiveStatus {
        delegate!(self, o => o.status())
    }

    fn owns_channel(&self) -> Destination {
        delegate!(self, o => o.owns_channel())
    }

    fn related(&self) -> Vec<Related<'_>> {
        delegate!(self, o => o.related())
    }

    fn approve(&mut self) {
        delegate!(self, o => o.approve())
    }

    fn reject(&mut self, me: crate::types::Address) -> SideEffects {
        delegate!(self, o => o.reject(me))
    }

    fn update(&mut self, payload: &ObjectivePayload) -> Result<(), ObjectiveError> {
        delegate!(self, o => o.update(payload))
    }

    fn crank(
        &mut self,
        signer: &crate::sig::Signer,
    ) -> Result<(SideEffects, WaitingFor), ObjectiveError> {
        delegate!(self, o => o.crank(signer))
    }
}

impl ObjectiveEnum {
    /// The consensus channels this objective drives proposals through.
    /// The engine routes ledger proposals into these and refreshes them
    /// from the store before cranking, since one ledger may fund several
    /// channels at once.
    pub fn ledger_connections_mut(&mut self) -> Vec<&mut ConsensusChannel> {
        match self {
            ObjectiveEnum::VirtualFund(o) => o
                .to_my_left
                .iter_mut()
                .chain(o.to_my_right.iter_mut())
                .map(|conn| &mut conn.channel)
                .collect(),
            ObjectiveEnum::SwapFund(o) => o
                .to_my_left
                .iter_mut()
                .chain(o.to_my_right.iter_mut())
                .map(|conn| &mut conn.channel)
                .collect(),
            ObjectiveEnum::VirtualDefund(o) => o
                .to_my_left
                .iter_mut()
                .chain(o.to_my_right.iter_mut())
                .collect(),
            ObjectiveEnum::SwapDefund(o) => o
                .to_my_left
                .iter_mut()
                .chain(o.to_my_right.iter_mut())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// The plain channel this objective progresses; chain events for that
    /// channel are folded in here.
    pub fn channel_mut(&mut self) -> &mut Channel {
        match self {
            ObjectiveEnum::DirectFund(o) => &mut o.channel,
            ObjectiveEnum::DirectDefund(o) => &mut o.channel,
            ObjectiveEnum::VirtualFund(o) => &mut o.v,
            ObjectiveEnum::VirtualDefund(o) => &mut o.v,
            ObjectiveEnum::SwapFund(o) => &mut o.s,
            ObjectiveEnum::SwapDefund(o) => &mut o.s,
            ObjectiveEnum::Swap(o) => &mut o.c,
            ObjectiveEnum::BridgedFund(o) => &mut o.channel,
            ObjectiveEnum::BridgedDefund(o) => &mut o.channel,
            ObjectiveEnum::MirrorBridgedDefund(o) => &mut o.channel,
        }
    }

    /// Clears the submitted-transaction guards so a re-crank resubmits.
    /// Kinds that never submit transactions are a no-op.
    pub fn clear_transaction_submitted(&mut self) {
        match self {
            ObjectiveEnum::DirectFund(o) => o.clear_transaction_submitted(),
            ObjectiveEnum::DirectDefund(o) => o.clear_transaction_submitted(),
            ObjectiveEnum::MirrorBridgedDefund(o) => o.clear_transaction_submitted(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn objective_id_roundtrip() {
        let cid = Destination([0x5a; 32]);
        for kind in ObjectiveKind::ALL {
            let id = ObjectiveId::new(kind, cid);
            assert_eq!(id.kind().unwrap(), kind);
            assert_eq!(id.channel_id().unwrap(), cid);
        }
    }

    #[test]
    fn swap_prefix_is_not_confused_with_swap_fund() {
        let cid = Destination([0x01; 32]);
        let id = ObjectiveId::new(ObjectiveKind::SwapFund, cid);
        assert_eq!(id.kind().unwrap(), ObjectiveKind::SwapFund);
        let id = ObjectiveId::new(ObjectiveKind::Swap, cid);
        assert_eq!(id.kind().unwrap(), ObjectiveKind::Swap);
    }

    #[test]
    fn mirror_prefix_spelling_is_stable() {
        let id = ObjectiveId::new(ObjectiveKind::MirrorBridgedDefund, Destination([0; 32]));
        assert!(id.0.starts_with("mirrorbridgeddefunding-0x"));
    }

    #[test]
    fn malformed_ids_are_rejected() {
        assert!(ObjectiveId("Nonsense-0x00".into()).kind().is_err());
        let id = ObjectiveId("DirectFund-nothex".into());
        assert!(id.channel_id().is_err());
    }

    #[test]
    fn side_effects_merge() {
        let mut a = SideEffects::default();
        assert!(a.is_empty());
        let mut b = SideEffects::default();
        b.proposals_to_process.push(Proposal::remove(
            Destination::default(),
            Destination::default(),
            crate::types::U256::zero(),
            crate::types::Address::default(),
        ));
        a.merge(b);
        assert_eq!(a.proposals_to_process.len(), 1);
        assert!(!a.is_empty());
    }
}
