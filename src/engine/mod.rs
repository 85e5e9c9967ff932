//! The event loop driving every objective.
//!
//! One cooperatively-scheduled task owns all mutable state: objectives,
//! channels and the store. Inbound work arrives on queues (API requests,
//! peer messages, chain events, a periodic block tick); each item is folded
//! into the owning objective, the objective is persisted, and only then are
//! its side effects let out of the process. Ledger proposals an objective
//! emits loop back through the engine so the proposing consensus channel
//! and the objective are committed together.

pub mod chain;
pub mod messaging;
pub mod notifier;
pub mod policy;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

use crate::chain::{ChainEvent, ChainTransaction, DroppedEvent};
use crate::channel::consensus::{ConsensusChannel, ConsensusError, Proposal, SignedProposal};
use crate::channel::state::{SignedState, StateError};
use crate::channel::{ChannelError, ChannelMode};
use crate::payments::swaps::{Exchange, Swap};
use crate::payments::{PaymentError, Voucher, VoucherManager, VoucherStore};
use crate::protocols::direct_defund::channel_from_consensus;
use crate::protocols::messages::{Message, ObjectivePayload, PayloadType};
use crate::protocols::swap::{swap_takes_priority, SwapDecision, SwapObjective};
use crate::protocols::{
    bridged_defund, bridged_fund, direct_defund, direct_fund, mirror_bridged_defund, swap_defund,
    swap_fund, virtual_defund, virtual_fund, Objective, ObjectiveEnum, ObjectiveError, ObjectiveId,
    ObjectiveKind, ObjectiveStatus, SideEffects,
};
use crate::sig::{SigError, Signer};
use crate::store::{pending_swap_by_channel_id, Store, StoreError};
use crate::types::{Address, Destination, Hash, Signature, U256};

use chain::{ChainError, ChainService};
use messaging::MessageService;
use notifier::{ChannelNotification, Notifier};
pub use policy::{PermissivePolicy, PolicyMaker};

/// How often the loop sweeps challenge deadlines when no chain events
/// arrive.
const BLOCK_TICK: time::Duration = time::Duration::from_secs(5);

const API_BUFFER: usize = 32;
const DROPPED_BUFFER: usize = 8;
const SIGN_BUFFER: usize = 8;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Objective(#[from] ObjectiveError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Payment(#[from] PaymentError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Sig(#[from] SigError),
    #[error("no channel {0:?}")]
    UnknownChannel(Destination),
    #[error("no objective {0}")]
    UnknownObjective(ObjectiveId),
    #[error("dropped-transaction event names no channel")]
    EmptyDroppedEvent,
}

impl EngineError {
    /// Errors outside this set indicate store corruption or a bug and make
    /// the loop panic so the supervising host can restart the node.
    pub fn is_non_fatal(&self) -> bool {
        match self {
            EngineError::UnknownChannel(_)
            | EngineError::UnknownObjective(_)
            | EngineError::EmptyDroppedEvent
            | EngineError::Objective(_)
            | EngineError::Payment(_)
            | EngineError::Consensus(_)
            | EngineError::Channel(_)
            | EngineError::State(_)
            | EngineError::Chain(_)
            | EngineError::Sig(_) => true,
            EngineError::Store(e) => matches!(
                e,
                StoreError::ChannelLocked(..)
                    | StoreError::NoSuchObjective(_)
                    | StoreError::NoSuchChannel(_)
            ),
        }
    }
}

/// A request from the embedding application.
#[derive(Debug)]
pub enum ApiRequest {
    OpenLedger(direct_fund::ObjectiveRequest),
    CloseLedger(direct_defund::ObjectiveRequest),
    OpenVirtual(virtual_fund::ObjectiveRequest),
    CloseVirtual(virtual_defund::ObjectiveRequest),
    OpenSwapChannel(swap_fund::ObjectiveRequest),
    CloseSwapChannel(swap_defund::ObjectiveRequest),
    OpenBridged(bridged_fund::ObjectiveRequest),
    CloseBridged(bridged_defund::ObjectiveRequest),
    MirrorBridgedDefund(mirror_bridged_defund::ObjectiveRequest),
    ProposeSwap(ProposeSwapRequest),
    ConfirmSwap(ConfirmSwapRequest),
    Pay(PaymentRequest),
    CounterChallenge(CounterChallengeRequest),
    RetryObjectiveTx(RetryObjectiveTxRequest),
}

#[derive(Debug, Clone)]
pub struct ProposeSwapRequest {
    pub channel_id: Destination,
    pub exchange: Exchange,
    pub nonce: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ConfirmSwapRequest {
    pub swap_id: Destination,
    pub decision: SwapDecision,
}

#[derive(Debug, Clone, Copy)]
pub struct PaymentRequest {
    pub channel_id: Destination,
    pub amount: U256,
}

#[derive(Debug, Clone, Copy)]
pub enum CounterChallengeAction {
    Checkpoint,
    Challenge,
}

#[derive(Debug, Clone, Copy)]
pub struct CounterChallengeRequest {
    pub channel_id: Destination,
    pub action: CounterChallengeAction,
}

#[derive(Debug, Clone)]
pub struct RetryObjectiveTxRequest {
    pub objective_id: ObjectiveId,
}

/// A transport asking the node to prove its identity during a peer
/// handshake. The signing key never leaves the engine.
#[derive(Debug)]
pub struct SignRequest {
    pub digest: Hash,
    pub respond: oneshot::Sender<Signature>,
}

/// What one loop iteration produced, surfaced to the embedding
/// application. Empty events are suppressed.
#[derive(Debug, Clone, Default)]
pub struct EngineEvent {
    pub completed_objectives: Vec<ObjectiveId>,
    pub failed_objectives: Vec<ObjectiveId>,
    pub received_vouchers: Vec<Voucher>,
    pub updated_channels: Vec<Destination>,
}

impl EngineEvent {
    pub fn is_empty(&self) -> bool {
        self.completed_objectives.is_empty()
            && self.failed_objectives.is_empty()
            && self.received_vouchers.is_empty()
            && self.updated_channels.is_empty()
    }

    pub fn merge(&mut self, mut other: EngineEvent) {
        self.completed_objectives
            .append(&mut other.completed_objectives);
        self.failed_objectives.append(&mut other.failed_objectives);
        self.received_vouchers.append(&mut other.received_vouchers);
        self.updated_channels.append(&mut other.updated_channels);
    }
}

/// Control surface handed to the embedding application.
pub struct EngineHandle {
    pub api: mpsc::Sender<ApiRequest>,
    pub inbound_messages: mpsc::UnboundedSender<Message>,
    pub dropped_events: mpsc::Sender<DroppedEvent>,
    pub sign_requests: mpsc::Sender<SignRequest>,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
    cancel: Option<oneshot::Sender<()>>,
}

impl EngineHandle {
    /// Stops the loop after the in-flight item finishes.
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }
}

pub struct Engine<S, C, M, P>
where
    S: Store + 'static,
    C: ChainService,
    M: MessageService,
    P: PolicyMaker,
{
    core: EngineCore<S, C, M, P>,
    api_rx: mpsc::Receiver<ApiRequest>,
    message_rx: mpsc::UnboundedReceiver<Message>,
    chain_rx: mpsc::Receiver<ChainEvent>,
    dropped_rx: mpsc::Receiver<DroppedEvent>,
    sign_rx: mpsc::Receiver<SignRequest>,
    cancel_rx: oneshot::Receiver<()>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
}

impl<S, C, M, P> Engine<S, C, M, P>
where
    S: Store + 'static,
    C: ChainService,
    M: MessageService,
    P: PolicyMaker,
{
    pub fn new(
        signer: Signer,
        store: Arc<S>,
        chain: C,
        chain_events: mpsc::Receiver<ChainEvent>,
        messaging: M,
        policy: P,
    ) -> (Self, EngineHandle) {
        let (api_tx, api_rx) = mpsc::channel(API_BUFFER);
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (dropped_tx, dropped_rx) = mpsc::channel(DROPPED_BUFFER);
        let (sign_tx, sign_rx) = mpsc::channel(SIGN_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let engine = Engine {
            core: EngineCore::new(signer, store, chain, messaging, policy),
            api_rx,
            message_rx,
            chain_rx: chain_events,
            dropped_rx,
            sign_rx,
            cancel_rx,
            events_tx,
        };
        let handle = EngineHandle {
            api: api_tx,
            inbound_messages: message_tx,
            dropped_events: dropped_tx,
            sign_requests: sign_tx,
            events: events_rx,
            cancel: Some(cancel_tx),
        };
        (engine, handle)
    }

    /// Registers interest in one channel's updates. Must be called before
    /// [Engine::run] consumes the engine.
    pub fn subscribe_channel(
        &mut self,
        channel_id: Destination,
    ) -> mpsc::Receiver<ChannelNotification> {
        self.core.notifier.subscribe(channel_id)
    }

    pub async fn run(self) {
        let Engine {
            mut core,
            mut api_rx,
            mut message_rx,
            mut chain_rx,
            mut dropped_rx,
            mut sign_rx,
            mut cancel_rx,
            events_tx,
        } = self;
        let mut tick = time::interval(BLOCK_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let result = tokio::select! {
                _ = &mut cancel_rx => break,
                maybe = api_rx.recv() => match maybe {
                    Some(req) => core.handle_api_request(req),
                    None => break,
                },
                maybe = message_rx.recv() => match maybe {
                    Some(msg) => core.handle_message(msg),
                    None => break,
                },
                maybe = chain_rx.recv() => match maybe {
                    Some(ev) => core.handle_chain_event(ev),
                    None => break,
                },
                maybe = dropped_rx.recv() => match maybe {
                    Some(ev) => core.handle_dropped_event(ev),
                    None => break,
                },
                maybe = sign_rx.recv() => match maybe {
                    Some(req) => core.handle_sign_request(req),
                    None => break,
                },
                _ = tick.tick() => core.handle_block_tick(),
            };
            match result {
                Ok(event) => {
                    if !event.is_empty() {
                        let _ = events_tx.send(event);
                    }
                }
                Err(e) if e.is_non_fatal() => warn!(error = %e, "event dropped"),
                Err(e) => panic!("engine: unrecoverable error: {e}"),
            }
        }
        debug!("engine loop stopped");
    }
}

struct EngineCore<S, C, M, P>
where
    S: Store + 'static,
    C: ChainService,
    M: MessageService,
    P: PolicyMaker,
{
    signer: Signer,
    me: Address,
    store: Arc<S>,
    vouchers: VoucherManager,
    chain: C,
    messaging: M,
    policy: P,
    notifier: Notifier,
    /// Timestamp of the newest block observed, driving the challenge
    /// deadline sweep.
    latest_block_timestamp: u64,
}

impl<S, C, M, P> EngineCore<S, C, M, P>
where
    S: Store + 'static,
    C: ChainService,
    M: MessageService,
    P: PolicyMaker,
{
    fn new(signer: Signer, store: Arc<S>, chain: C, messaging: M, policy: P) -> Self {
        let me = signer.address();
        let voucher_store: Arc<dyn VoucherStore> = store.clone();
        EngineCore {
            signer,
            me,
            vouchers: VoucherManager::new(me, voucher_store),
            store,
            chain,
            messaging,
            policy,
            notifier: Notifier::new(),
            latest_block_timestamp: 0,
        }
    }

    // ---- API requests -------------------------------------------------

    fn handle_api_request(&mut self, req: ApiRequest) -> Result<EngineEvent, EngineError> {
        let mut event = EngineEvent::default();
        match req {
            ApiRequest::OpenLedger(req) => {
                let ledger_exists = self
                    .store
                    .get_consensus_channel_by_counterparty(req.counterparty)?
                    .is_some();
                let o = direct_fund::DirectFund::new(&req, true, self.me, ledger_exists)?;
                self.attempt_progress(ObjectiveEnum::DirectFund(o), &mut event)?;
            }
            ApiRequest::CloseLedger(req) => {
                let cc = self.require_consensus_channel(req.channel_id)?;
                let o = direct_defund::DirectDefund::new(&req, true, &cc)?;
                self.store.destroy_consensus_channel(req.channel_id)?;
                self.attempt_progress(ObjectiveEnum::DirectDefund(o), &mut event)?;
            }
            ApiRequest::OpenVirtual(req) => {
                let right_peer = req
                    .intermediaries
                    .first()
                    .copied()
                    .unwrap_or(req.counterparty);
                let right = self.require_ledger_with(right_peer)?;
                let o = virtual_fund::VirtualFund::new(&req, true, self.me, right)?;
                self.attempt_progress(ObjectiveEnum::VirtualFund(o), &mut event)?;
            }
            ApiRequest::CloseVirtual(req) => {
                let v = self.require_channel(req.channel_id)?;
                let participants = v.participants().to_vec();
                let last = participants.len() - 1;
                // The payer closes with what it paid; the payee additionally
                // refuses any settlement below it; intermediaries see no
                // vouchers at all.
                let (paid, minimum) = if v.my_index == 0 {
                    (self.vouchers.paid(req.channel_id)?, U256::zero())
                } else if v.my_index == last {
                    let paid = self.vouchers.paid(req.channel_id)?;
                    (paid, paid)
                } else {
                    (U256::zero(), U256::zero())
                };
                let (left, right) = self.adjacent_ledgers(&participants, v.my_index)?;
                let o = virtual_defund::VirtualDefund::new(v, paid, minimum, true, left, right)?;
                self.attempt_progress(ObjectiveEnum::VirtualDefund(o), &mut event)?;
            }
            ApiRequest::OpenSwapChannel(req) => {
                let right_peer = req
                    .intermediaries
                    .first()
                    .copied()
                    .unwrap_or(req.counterparty);
                let right = self.require_ledger_with(right_peer)?;
                let o = swap_fund::SwapFund::new(&req, true, self.me, right)?;
                self.attempt_progress(ObjectiveEnum::SwapFund(o), &mut event)?;
            }
            ApiRequest::CloseSwapChannel(req) => {
                let s = self.require_channel(req.channel_id)?;
                let settled = s.latest_supported_state()?.state().outcome.clone();
                let participants = s.participants().to_vec();
                let (left, right) = self.adjacent_ledgers(&participants, s.my_index)?;
                let o = swap_defund::SwapDefund::new(s, settled, true, left, right)?;
                self.attempt_progress(ObjectiveEnum::SwapDefund(o), &mut event)?;
            }
            ApiRequest::OpenBridged(req) => {
                let ledger_exists = self
                    .store
                    .get_consensus_channel_by_counterparty(req.counterparty)?
                    .is_some();
                let o = bridged_fund::BridgedFund::new(&req, true, self.me, ledger_exists)?;
                self.attempt_progress(ObjectiveEnum::BridgedFund(o), &mut event)?;
            }
            ApiRequest::CloseBridged(req) => {
                let cc = self.require_consensus_channel(req.channel_id)?;
                let o = bridged_defund::BridgedDefund::new(&req, true, &cc)?;
                self.store.destroy_consensus_channel(req.channel_id)?;
                self.attempt_progress(ObjectiveEnum::BridgedDefund(o), &mut event)?;
            }
            ApiRequest::MirrorBridgedDefund(req) => {
                let cc = self.require_consensus_channel(req.channel_id)?;
                let o = mirror_bridged_defund::MirrorBridgedDefund::new(&req, true, &cc)?;
                self.store.destroy_consensus_channel(req.channel_id)?;
                self.attempt_progress(ObjectiveEnum::MirrorBridgedDefund(o), &mut event)?;
            }
            ApiRequest::ProposeSwap(req) => {
                if pending_swap_by_channel_id(self.store.as_ref(), req.channel_id)?.is_some() {
                    return Err(ObjectiveError::SwapObjectiveExists.into());
                }
                let c = self.require_channel(req.channel_id)?;
                let swap = Swap::new(req.channel_id, req.exchange, req.nonce);
                let o = SwapObjective::new(swap, c, true)?;
                self.attempt_progress(ObjectiveEnum::Swap(o), &mut event)?;
            }
            ApiRequest::ConfirmSwap(req) => {
                let id = ObjectiveId::new(ObjectiveKind::Swap, req.swap_id);
                let mut o = self
                    .store
                    .get_objective(&id)?
                    .ok_or_else(|| EngineError::UnknownObjective(id.clone()))?;
                match &mut o {
                    ObjectiveEnum::Swap(s) => s.confirm(req.decision),
                    _ => return Err(ObjectiveError::WrongKind(id).into()),
                }
                self.attempt_progress(o, &mut event)?;
            }
            ApiRequest::Pay(req) => {
                let voucher = self.vouchers.pay(req.channel_id, req.amount, &self.signer)?;
                let info = self
                    .store
                    .get_voucher_info(req.channel_id)?
                    .ok_or(EngineError::UnknownChannel(req.channel_id))?;
                self.messaging
                    .send(Message::for_voucher(self.me, info.channel_payee, voucher));
                event.updated_channels.push(req.channel_id);
            }
            ApiRequest::CounterChallenge(req) => {
                self.handle_counter_challenge(req)?;
            }
            ApiRequest::RetryObjectiveTx(req) => {
                let mut o = self
                    .store
                    .get_objective(&req.objective_id)?
                    .ok_or(EngineError::UnknownObjective(req.objective_id))?;
                o.clear_transaction_submitted();
                self.attempt_progress(o, &mut event)?;
            }
        }
        Ok(event)
    }

    /// Answers an on-chain challenge with the latest supported state,
    /// either clearing it (checkpoint) or racing it (counter-challenge).
    fn handle_counter_challenge(
        &mut self,
        req: CounterChallengeRequest,
    ) -> Result<(), EngineError> {
        let channel = match self.store.get_channel(req.channel_id)? {
            Some(c) => c,
            None => {
                let cc = self.require_consensus_channel(req.channel_id)?;
                channel_from_consensus(&cc)?
            }
        };
        let candidate: SignedState = channel.latest_supported_state()?.clone();
        let tx = match req.action {
            CounterChallengeAction::Checkpoint => ChainTransaction::Checkpoint {
                channel_id: req.channel_id,
                candidate,
            },
            CounterChallengeAction::Challenge => {
                let challenger_sig = candidate.state().sign(&self.signer)?;
                ChainTransaction::Challenge {
                    channel_id: req.channel_id,
                    candidate,
                    challenger_sig,
                }
            }
        };
        self.chain.submit(tx)?;
        Ok(())
    }

    // ---- peer messages ------------------------------------------------

    fn handle_message(&mut self, msg: Message) -> Result<EngineEvent, EngineError> {
        debug!(summary = %msg.summarize(), "message received");
        let Message {
            from,
            objective_payloads,
            ledger_proposals,
            payments,
            rejected_objectives,
            ..
        } = msg;
        let mut event = EngineEvent::default();

        for id in rejected_objectives {
            if let Some(mut o) = self.store.get_objective(&id)? {
                if !matches!(
                    o.status(),
                    ObjectiveStatus::Rejected | ObjectiveStatus::Completed
                ) {
                    // Mark rejected without echoing notices back.
                    let _ = o.reject(self.me);
                    self.store.set_objective(&o)?;
                    event.failed_objectives.push(id);
                }
            }
        }

        for payload in objective_payloads {
            self.handle_objective_payload(from, payload, &mut event)?;
        }

        for sp in ledger_proposals {
            self.handle_inbound_proposal(sp, &mut event)?;
        }

        for voucher in payments {
            let (total, delta) = self.vouchers.receive(&voucher)?;
            debug!(channel = ?voucher.channel_id, %total, %delta, "voucher received");
            self.notifier.notify(ChannelNotification::PaymentReceived {
                channel_id: voucher.channel_id,
                paid: total,
            });
            event.received_vouchers.push(voucher);
        }

        Ok(event)
    }

    fn handle_objective_payload(
        &mut self,
        from: Address,
        payload: ObjectivePayload,
        event: &mut EngineEvent,
    ) -> Result<(), EngineError> {
        let id = payload.objective_id.clone();
        if let Some(mut o) = self.store.get_objective(&id)? {
            if o.status() == ObjectiveStatus::Rejected {
                return Ok(());
            }
            self.refresh_ledgers(&mut o)?;
            o.update(&payload)?;
            return self.attempt_progress(o, event);
        }
        let o = self.construct_objective(from, &payload, event)?;
        self.attempt_progress(o, event)
    }

    /// Builds a new objective on first sight of a payload, dispatching on
    /// the ID prefix and collecting whatever local state the kind needs.
    fn construct_objective(
        &mut self,
        from: Address,
        payload: &ObjectivePayload,
        event: &mut EngineEvent,
    ) -> Result<ObjectiveEnum, EngineError> {
        let kind = payload.objective_id.kind()?;
        let o = match kind {
            ObjectiveKind::DirectFund => ObjectiveEnum::DirectFund(
                direct_fund::DirectFund::from_payload(payload, false, self.me)?,
            ),
            ObjectiveKind::DirectDefund => {
                let cid = payload.objective_id.channel_id()?;
                let cc = self.require_consensus_channel(cid)?;
                let o = direct_defund::DirectDefund::from_payload(payload, false, &cc)?;
                self.store.destroy_consensus_channel(cid)?;
                ObjectiveEnum::DirectDefund(o)
            }
            ObjectiveKind::VirtualFund => {
                let ss: SignedState = payload.decode(PayloadType::SignedStatePayload)?;
                let (left, right) = self.ledgers_for_participants(&ss.state().participants)?;
                ObjectiveEnum::VirtualFund(virtual_fund::VirtualFund::from_payload(
                    payload, false, self.me, left, right,
                )?)
            }
            ObjectiveKind::VirtualDefund => {
                let cid = payload.objective_id.channel_id()?;
                let v = self.require_channel(cid)?;
                let participants = v.participants().to_vec();
                let minimum = if v.my_index == participants.len() - 1
                    && self.vouchers.channel_registered(cid)
                {
                    self.vouchers.paid(cid)?
                } else {
                    U256::zero()
                };
                let (left, right) = self.adjacent_ledgers(&participants, v.my_index)?;
                ObjectiveEnum::VirtualDefund(virtual_defund::VirtualDefund::from_payload(
                    payload, false, v, minimum, left, right,
                )?)
            }
            ObjectiveKind::SwapFund => {
                let ss: SignedState = payload.decode(PayloadType::SignedStatePayload)?;
                let (left, right) = self.ledgers_for_participants(&ss.state().participants)?;
                ObjectiveEnum::SwapFund(swap_fund::SwapFund::from_payload(
                    payload, false, self.me, left, right,
                )?)
            }
            ObjectiveKind::SwapDefund => {
                let cid = payload.objective_id.channel_id()?;
                let s = self.require_channel(cid)?;
                let participants = s.participants().to_vec();
                let (left, right) = self.adjacent_ledgers(&participants, s.my_index)?;
                ObjectiveEnum::SwapDefund(swap_defund::SwapDefund::from_payload(
                    payload, false, s, left, right,
                )?)
            }
            ObjectiveKind::Swap => {
                let swap: Swap = payload.decode(PayloadType::SignedSwapPayload)?;
                let c = self.require_channel(swap.channel_id)?;
                self.resolve_swap_race(&swap, from, c.my_index, event)?;
                ObjectiveEnum::Swap(SwapObjective::from_payload(payload, false, c)?)
            }
            ObjectiveKind::BridgedFund => ObjectiveEnum::BridgedFund(
                bridged_fund::BridgedFund::from_payload(payload, false, self.me)?,
            ),
            ObjectiveKind::BridgedDefund => {
                let cid = payload.objective_id.channel_id()?;
                let cc = self.require_consensus_channel(cid)?;
                let o = bridged_defund::BridgedDefund::from_payload(payload, false, &cc)?;
                self.store.destroy_consensus_channel(cid)?;
                ObjectiveEnum::BridgedDefund(o)
            }
            ObjectiveKind::MirrorBridgedDefund => {
                let cid = payload.objective_id.channel_id()?;
                let cc = self.require_consensus_channel(cid)?;
                let o =
                    mirror_bridged_defund::MirrorBridgedDefund::from_payload(payload, false, &cc)?;
                self.store.destroy_consensus_channel(cid)?;
                ObjectiveEnum::MirrorBridgedDefund(o)
            }
        };
        Ok(o)
    }

    /// Two swaps proposed concurrently on the same channel: the party at
    /// index 0 resolves the race by fingerprint; the other party keeps
    /// both and waits for the resolver's rejection notice.
    fn resolve_swap_race(
        &mut self,
        incoming: &Swap,
        from: Address,
        my_index: usize,
        event: &mut EngineEvent,
    ) -> Result<(), EngineError> {
        let Some(pending) = pending_swap_by_channel_id(self.store.as_ref(), incoming.channel_id)?
        else {
            return Ok(());
        };
        if my_index != 0 {
            return Ok(());
        }
        if swap_takes_priority(&pending, self.me, incoming, from) {
            return Err(ObjectiveError::SwapObjectiveExists.into());
        }
        let pending_id = ObjectiveId::new(ObjectiveKind::Swap, pending.id);
        if let Some(mut mine) = self.store.get_objective(&pending_id)? {
            let effects = mine.reject(self.me);
            self.store.set_objective(&mine)?;
            event.failed_objectives.push(pending_id);
            self.dispatch(effects, event)?;
        }
        Ok(())
    }

    // ---- ledger proposals ---------------------------------------------

    fn handle_inbound_proposal(
        &mut self,
        sp: SignedProposal,
        event: &mut EngineEvent,
    ) -> Result<(), EngineError> {
        let target = sp.proposal.target();
        let ledger_id = sp.proposal.ledger_id;
        let mut o = self
            .store
            .get_objective_by_channel_id(target)?
            .ok_or(EngineError::UnknownChannel(target))?;
        self.refresh_ledgers(&mut o)?;
        match o
            .ledger_connections_mut()
            .into_iter()
            .find(|cc| cc.id == ledger_id)
        {
            Some(cc) => cc.receive(sp)?,
            None => return Err(EngineError::UnknownChannel(ledger_id)),
        }
        self.store.set_objective(&o)?;
        self.attempt_progress(o, event)
    }

    /// A proposal an objective asked us to make on its behalf: sign it
    /// into the ledger's queue and ship the whole queue to the follower.
    fn process_loopback_proposal(
        &mut self,
        p: Proposal,
        event: &mut EngineEvent,
    ) -> Result<(), EngineError> {
        let target = p.target();
        let mut o = self
            .store
            .get_objective_by_channel_id(target)?
            .ok_or(EngineError::UnknownChannel(target))?;
        self.refresh_ledgers(&mut o)?;
        let message = match o
            .ledger_connections_mut()
            .into_iter()
            .find(|cc| cc.id == p.ledger_id)
        {
            Some(cc) => {
                cc.propose(p, &self.signer)?;
                Message::for_proposals(
                    cc.my_address(),
                    cc.counterparty(),
                    cc.proposal_queue().to_vec(),
                )
            }
            None => return Err(EngineError::UnknownChannel(p.ledger_id)),
        };
        self.store.set_objective(&o)?;
        self.messaging.send(message);
        self.attempt_progress(o, event)
    }

    // ---- chain events -------------------------------------------------

    fn handle_chain_event(&mut self, ev: ChainEvent) -> Result<EngineEvent, EngineError> {
        let mut event = EngineEvent::default();
        let meta = ev.meta();
        if meta.block_timestamp > self.latest_block_timestamp {
            self.latest_block_timestamp = meta.block_timestamp;
        }
        if meta.block_num < self.store.last_block_num_seen()? {
            debug!(block = meta.block_num, "replayed chain event ignored");
            return Ok(event);
        }
        self.store.set_last_block_num_seen(meta.block_num)?;

        let cid = ev.channel_id();
        if let Some(mut o) = self.store.get_objective_by_channel_id(cid)? {
            o.channel_mut().update_with_chain_event(&ev)?;
            self.attempt_progress(o, &mut event)?;
        } else if let Some(mut cc) = self.store.get_consensus_channel(cid)? {
            match &ev {
                ChainEvent::Deposited {
                    asset, now_held, ..
                }
                | ChainEvent::AllocationUpdated {
                    asset, now_held, ..
                }
                | ChainEvent::Reclaimed {
                    asset, now_held, ..
                } => {
                    cc.on_chain_funding.insert(*asset, *now_held);
                    self.store.set_consensus_channel(&cc)?;
                    self.notifier.notify(ChannelNotification::LedgerUpdated {
                        channel_id: cid,
                        turn_num: cc.consensus_turn_num(),
                    });
                    event.updated_channels.push(cid);
                }
                ChainEvent::ChallengeRegistered { .. } => {
                    // No objective is driving this ledger; the application
                    // decides whether to checkpoint or counter-challenge.
                    warn!(channel = ?cid, "challenge registered against idle ledger");
                }
                _ => {}
            }
        } else {
            return Err(EngineError::UnknownChannel(cid));
        }
        Ok(event)
    }

    fn handle_dropped_event(&mut self, ev: DroppedEvent) -> Result<EngineEvent, EngineError> {
        if ev.channel_id.is_zero() {
            return Err(EngineError::EmptyDroppedEvent);
        }
        let mut event = EngineEvent::default();
        let mut o = self
            .store
            .get_objective_by_channel_id(ev.channel_id)?
            .ok_or(EngineError::UnknownChannel(ev.channel_id))?;
        o.clear_transaction_submitted();
        self.attempt_progress(o, &mut event)?;
        Ok(event)
    }

    /// A peer handshake needs an identity proof; the requesting transport
    /// may have given up, so a closed response channel is not an error.
    fn handle_sign_request(&mut self, req: SignRequest) -> Result<EngineEvent, EngineError> {
        let sig = self.signer.sign_eth(req.digest)?;
        let _ = req.respond.send(sig);
        Ok(EngineEvent::default())
    }

    /// Sweeps challenge deadlines against the newest observed block time
    /// and re-cranks objectives whose channel just finalized.
    fn handle_block_tick(&mut self) -> Result<EngineEvent, EngineError> {
        let now = self.latest_block_timestamp;
        let mut event = EngineEvent::default();
        for mut o in self.store.get_objectives()? {
            if matches!(
                o.status(),
                ObjectiveStatus::Completed | ObjectiveStatus::Rejected
            ) {
                continue;
            }
            let channel = o.channel_mut();
            if channel.channel_mode != ChannelMode::Challenge {
                continue;
            }
            channel.update_channel_mode(now);
            if channel.channel_mode == ChannelMode::Finalized {
                self.attempt_progress(o, &mut event)?;
            } else {
                self.store.set_objective(&o)?;
            }
        }
        Ok(event)
    }

    // ---- progress -----------------------------------------------------

    /// Persists the objective, cranks the working copy and commits the
    /// result, so a failed crank leaves the stored state one step behind.
    /// Side effects are released only after the commit.
    fn attempt_progress(
        &mut self,
        mut o: ObjectiveEnum,
        event: &mut EngineEvent,
    ) -> Result<(), EngineError> {
        self.refresh_ledgers(&mut o)?;

        if o.status() == ObjectiveStatus::Unapproved {
            if self.policy.should_approve(&o) {
                o.approve();
            } else {
                let effects = o.reject(self.me);
                self.store.set_objective(&o)?;
                event.failed_objectives.push(o.id());
                return self.dispatch(effects, event);
            }
        }
        if o.status() == ObjectiveStatus::Rejected {
            return Ok(());
        }
        self.store.set_objective(&o)?;

        let was_completed = o.status() == ObjectiveStatus::Completed;
        let mut work = o;
        let (effects, waiting) = work.crank(&self.signer)?;
        debug!(objective = %work.id(), %waiting, "cranked");
        self.store.set_objective(&work)?;

        if work.status() == ObjectiveStatus::Completed && !was_completed {
            self.handle_completion(&work)?;
            event.completed_objectives.push(work.id());
            let channel_id = work.owns_channel();
            if !channel_id.is_zero() {
                self.notifier
                    .notify(ChannelNotification::ObjectiveCompleted { channel_id });
            }
        }
        let channel_id = work.owns_channel();
        if !channel_id.is_zero() {
            event.updated_channels.push(channel_id);
        }
        self.dispatch(effects, event)
    }

    /// Governance hand-offs at the end of an objective's life.
    fn handle_completion(&mut self, o: &ObjectiveEnum) -> Result<(), EngineError> {
        match o {
            ObjectiveEnum::DirectFund(df) => self.promote_to_consensus(&df.channel)?,
            ObjectiveEnum::BridgedFund(bf) => self.promote_to_consensus(&bf.channel)?,
            ObjectiveEnum::VirtualFund(vf) => {
                // Only the endpoints exchange vouchers over the channel.
                if self.me == vf.payer() || self.me == vf.payee() {
                    let prefund = vf.v.pre_fund_state()?;
                    let (_, a0, _) = virtual_fund::initial_balances(&prefund.outcome)?;
                    if !self.vouchers.channel_registered(vf.v.id) {
                        self.vouchers.register(vf.v.id, vf.payer(), vf.payee(), a0)?;
                    }
                }
            }
            ObjectiveEnum::VirtualDefund(vd) => {
                if self.vouchers.channel_registered(vd.v.id) {
                    self.vouchers.remove(vd.v.id)?;
                }
                self.store.destroy_channel(vd.v.id)?;
            }
            ObjectiveEnum::SwapFund(_) => {}
            ObjectiveEnum::SwapDefund(sd) => self.store.destroy_channel(sd.s.id)?,
            ObjectiveEnum::Swap(s) => {
                self.store.set_swap(&s.swap)?;
                self.notifier.notify(ChannelNotification::SwapExecuted {
                    channel_id: s.swap.channel_id,
                    swap_id: s.swap.id,
                });
            }
            ObjectiveEnum::DirectDefund(dd) => self.store.destroy_channel(dd.channel.id)?,
            ObjectiveEnum::BridgedDefund(bd) => self.store.destroy_channel(bd.channel.id)?,
            ObjectiveEnum::MirrorBridgedDefund(m) => self.store.destroy_channel(m.channel.id)?,
        }
        Ok(())
    }

    /// A funded ledger graduates from signed-state rounds to the
    /// consensus protocol.
    fn promote_to_consensus(&mut self, c: &crate::channel::Channel) -> Result<(), EngineError> {
        let cc = ConsensusChannel::from_channel(c, c.my_index)?;
        self.store.set_consensus_channel(&cc)?;
        self.store.destroy_channel(c.id)?;
        self.notifier.notify(ChannelNotification::LedgerUpdated {
            channel_id: cc.id,
            turn_num: cc.consensus_turn_num(),
        });
        Ok(())
    }

    /// Releases side effects: messages and transactions leave the process,
    /// proposals loop back through the engine.
    fn dispatch(
        &mut self,
        effects: SideEffects,
        event: &mut EngineEvent,
    ) -> Result<(), EngineError> {
        for msg in effects.messages_to_send {
            debug!(summary = %msg.summarize(), "sending message");
            self.messaging.send(msg);
        }
        for tx in effects.transactions_to_submit {
            self.chain.submit(tx)?;
        }
        for p in effects.proposals_to_process {
            self.process_loopback_proposal(p, event)?;
        }
        Ok(())
    }

    /// One ledger may fund several channels, each holding its own copy;
    /// the store's copy is authoritative between cranks.
    fn refresh_ledgers(&self, o: &mut ObjectiveEnum) -> Result<(), StoreError> {
        for cc in o.ledger_connections_mut() {
            if let Some(fresh) = self.store.get_consensus_channel(cc.id)? {
                *cc = fresh;
            }
        }
        Ok(())
    }

    // ---- lookups ------------------------------------------------------

    fn require_channel(
        &self,
        id: Destination,
    ) -> Result<crate::channel::Channel, EngineError> {
        self.store
            .get_channel(id)?
            .ok_or(EngineError::UnknownChannel(id))
    }

    fn require_consensus_channel(&self, id: Destination) -> Result<ConsensusChannel, EngineError> {
        self.store
            .get_consensus_channel(id)?
            .ok_or(EngineError::UnknownChannel(id))
    }

    fn require_ledger_with(&self, peer: Address) -> Result<ConsensusChannel, EngineError> {
        self.store
            .get_consensus_channel_by_counterparty(peer)?
            .ok_or_else(|| ObjectiveError::NoLedgerConnection(peer).into())
    }

    /// The consensus channels shared with the previous and next hop of a
    /// multi-party channel, from our position in its participant list.
    fn adjacent_ledgers(
        &self,
        participants: &[Address],
        my_index: usize,
    ) -> Result<(Option<ConsensusChannel>, Option<ConsensusChannel>), EngineError> {
        let left = if my_index > 0 {
            Some(self.require_ledger_with(participants[my_index - 1])?)
        } else {
            None
        };
        let right = if my_index + 1 < participants.len() {
            Some(self.require_ledger_with(participants[my_index + 1])?)
        } else {
            None
        };
        Ok((left, right))
    }

    fn ledgers_for_participants(
        &self,
        participants: &[Address],
    ) -> Result<(Option<ConsensusChannel>, Option<ConsensusChannel>), EngineError> {
        let my_index = participants
            .iter()
            .position(|&p| p == self.me)
            .ok_or(ObjectiveError::NotAParticipant(self.me))?;
        self.adjacent_ledgers(participants, my_index)
    }
}
