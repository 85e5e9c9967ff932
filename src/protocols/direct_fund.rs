//! Direct funding: open a ledger channel by co-signing prefund and
//! postfund states while each party deposits its share on-chain.
//!
//! Deposits happen in allocation order. A participant only deposits once
//! everything allocated ahead of it is already held on-chain, so nobody
//! can be left funding a channel the counterparty abandons.

use serde::{Deserialize, Serialize};

use crate::chain::ChainTransaction;
use crate::channel::outcome::Exit;
use crate::channel::state::{SignedState, State};
use crate::channel::{Channel, ChannelType};
use crate::sig::Signer;
use crate::types::{Address, Destination, Funds};

use super::messages::{Message, ObjectivePayload, PayloadType};
use super::{
    Objective, ObjectiveError, ObjectiveId, ObjectiveKind, ObjectiveStatus, Related, SideEffects,
    WaitingFor, WAITING_FOR_NOTHING,
};

pub const WAITING_FOR_COMPLETE_PREFUND: WaitingFor = WaitingFor("WaitingForCompletePrefund");
pub const WAITING_FOR_MY_TURN_TO_FUND: WaitingFor = WaitingFor("WaitingForMyTurnToFund");
pub const WAITING_FOR_COMPLETE_FUNDING: WaitingFor = WaitingFor("WaitingForCompleteFunding");
pub const WAITING_FOR_COMPLETE_POSTFUND: WaitingFor = WaitingFor("WaitingForCompletePostFund");

/// API request to open a ledger channel with one counterparty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectiveRequest {
    pub counterparty: Address,
    pub challenge_duration: u64,
    pub outcome: Exit,
    pub app_definition: Address,
    pub nonce: u64,
}

impl ObjectiveRequest {
    pub fn initial_state(&self, me: Address) -> State {
        State {
            participants: vec![me, self.counterparty],
            channel_nonce: self.nonce,
            app_definition: self.app_definition,
            challenge_duration: self.challenge_duration,
            app_data: Vec::new(),
            outcome: self.outcome.clone(),
            turn_num: 0,
            is_final: false,
        }
    }

    pub fn id(&self, me: Address) -> ObjectiveId {
        let cid = self.initial_state(me).channel_id();
        ObjectiveId::new(ObjectiveKind::DirectFund, cid)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectFund {
    pub status: ObjectiveStatus,
    pub channel: Channel,
    my_deposit_safety_threshold: Funds,
    my_deposit_target: Funds,
    fully_funded_threshold: Funds,
    transaction_submitted: bool,
}

impl DirectFund {
    /// Builds the objective from a local request. `ledger_exists` reports
    /// whether any ledger with this counterparty is already live; funding
    /// a second one is refused.
    pub fn new(
        request: &ObjectiveRequest,
        preapprove: bool,
        me: Address,
        ledger_exists: bool,
    ) -> Result<Self, ObjectiveError> {
        if ledger_exists {
            return Err(ObjectiveError::LedgerChannelExists);
        }
        let initial = request.initial_state(me);
        let channel = Channel::new(initial, 0, ChannelType::Ledger)?;
        Ok(Self::from_channel(channel, preapprove, me))
    }

    /// Builds the objective from the counterparty's prefund payload.
    pub fn from_payload(
        payload: &ObjectivePayload,
        preapprove: bool,
        me: Address,
    ) -> Result<Self, ObjectiveError> {
        let ss: SignedState = payload.decode(PayloadType::SignedStatePayload)?;
        let initial = ss.state().clone();
        if initial.is_final {
            return Err(ObjectiveError::InvalidPayload);
        }
        let my_index = initial
            .participants
            .iter()
            .position(|&p| p == me)
            .ok_or(ObjectiveError::NotAParticipant(me))?;
        let mut channel = Channel::new(initial, my_index, ChannelType::Ledger)?;
        channel.add_signed_state(&ss)?;
        Ok(Self::from_channel(channel, preapprove, me))
    }

    fn from_channel(channel: Channel, preapprove: bool, me: Address) -> Self {
        let my_dest = me.to_destination();
        // The prefund outcome is a simple allocation list, so funding
        // thresholds are plain prefix sums over it.
        let outcome = &channel
            .signed_state_for_turn(0)
            .expect("channel construction stores the turn 0 state")
            .state()
            .outcome;
        let fully_funded_threshold = outcome.total_allocated();
        let my_deposit_safety_threshold = outcome.total_allocated_before(my_dest);
        let my_deposit_target =
            my_deposit_safety_threshold.add(&outcome.total_allocated_for(my_dest));
        DirectFund {
            status: if preapprove {
                ObjectiveStatus::Approved
            } else {
                ObjectiveStatus::Unapproved
            },
            channel,
            my_deposit_safety_threshold,
            my_deposit_target,
            fully_funded_threshold,
            transaction_submitted: false,
        }
    }

    fn funding_complete(&self) -> bool {
        self.channel
            .on_chain
            .holdings
            .covers(&self.fully_funded_threshold)
    }

    fn safe_to_deposit(&self) -> bool {
        self.channel
            .on_chain
            .holdings
            .covers(&self.my_deposit_safety_threshold)
    }

    fn amount_to_deposit(&self) -> Funds {
        self.my_deposit_target
            .saturating_sub(&self.channel.on_chain.holdings)
    }

    /// Re-arms the deposit after the chain service reports the transaction
    /// dropped.
    pub fn clear_transaction_submitted(&mut self) {
        self.transaction_submitted = false;
    }

    fn send_to_others(
        &self,
        ss: &SignedState,
        effects: &mut SideEffects,
    ) -> Result<(), ObjectiveError> {
        effects.messages_to_send.extend(Message::for_objective(
            self.channel.my_address(),
            &self.channel.other_participants(),
            self.id(),
            PayloadType::SignedStatePayload,
            ss,
        )?);
        Ok(())
    }
}

impl Objective for DirectFund {
    fn id(&self) -> ObjectiveId {
        ObjectiveId::new(ObjectiveKind::DirectFund, self.channel.id)
    }

    fn status(&self) -> ObjectiveStatus {
        self.status
    }

    fn owns_channel(&self) -> Destination {
        self.channel.id
    }

    fn related(&self) -> Vec<Related<'_>> {
        vec![Related::Channel(&self.channel)]
    }

    fn approve(&mut self) {
        if self.status == ObjectiveStatus::Unapproved {
            self.status = ObjectiveStatus::Approved;
        }
    }

    fn reject(&mut self, me: Address) -> SideEffects {
        self.status = ObjectiveStatus::Rejected;
        SideEffects {
            messages_to_send: Message::rejection_notice(
                me,
                &self.channel.other_participants(),
                self.id(),
            ),
            ..SideEffects::default()
        }
    }

    fn update(&mut self, payload: &ObjectivePayload) -> Result<(), ObjectiveError> {
        if payload.objective_id != self.id() {
            return Err(ObjectiveError::WrongKind(payload.objective_id.clone()));
        }
        let ss: SignedState = payload.decode(PayloadType::SignedStatePayload)?;
        self.channel.add_signed_state(&ss)?;
        Ok(())
    }

    fn crank(&mut self, signer: &Signer) -> Result<(SideEffects, WaitingFor), ObjectiveError> {
        if self.status == ObjectiveStatus::Completed {
            return Ok((SideEffects::default(), WAITING_FOR_NOTHING));
        }
        if self.status != ObjectiveStatus::Approved {
            return Err(ObjectiveError::NotApproved);
        }
        let mut effects = SideEffects::default();

        if !self.channel.pre_fund_signed_by_me() {
            let prefund = self.channel.pre_fund_state()?;
            let ss = self.channel.sign_and_add_state(prefund, signer)?;
            self.send_to_others(&ss, &mut effects)?;
        }
        if !self.channel.pre_fund_complete() {
            return Ok((effects, WAITING_FOR_COMPLETE_PREFUND));
        }

        let funding_complete = self.funding_complete();
        if !funding_complete {
            if !self.safe_to_deposit() {
                return Ok((effects, WAITING_FOR_MY_TURN_TO_FUND));
            }
            let deposit = self.amount_to_deposit();
            if deposit.is_non_zero() && !self.transaction_submitted {
                effects.transactions_to_submit.push(ChainTransaction::Deposit {
                    channel_id: self.channel.id,
                    expected_held: self.channel.on_chain.holdings.clone(),
                    deposit,
                });
                self.transaction_submitted = true;
            }
            return Ok((effects, WAITING_FOR_COMPLETE_FUNDING));
        }

        if !self.channel.post_fund_signed_by_me() {
            let postfund = self.channel.post_fund_state()?;
            let ss = self.channel.sign_and_add_state(postfund, signer)?;
            self.send_to_others(&ss, &mut effects)?;
        }
        if !self.channel.post_fund_complete() {
            return Ok((effects, WAITING_FOR_COMPLETE_POSTFUND));
        }

        self.status = ObjectiveStatus::Completed;
        Ok((effects, WAITING_FOR_NOTHING))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::EventMeta;
    use crate::channel::outcome::{Allocation, AssetMetadata, SingleAssetExit};
    use crate::chain::ChainEvent;
    use crate::types::U256;
    use rand::thread_rng;

    pub(crate) struct Fixture {
        pub alice: Signer,
        pub bob: Signer,
        pub request: ObjectiveRequest,
    }

    // Bob's allocation is listed first so Alice has a non-trivial safety
    // threshold.
    pub(crate) fn fixture() -> Fixture {
        let mut rng = thread_rng();
        let alice = Signer::random(&mut rng);
        let bob = Signer::random(&mut rng);
        let request = ObjectiveRequest {
            counterparty: bob.address(),
            challenge_duration: 60,
            outcome: Exit(vec![SingleAssetExit {
                asset: Address::default(),
                asset_metadata: AssetMetadata::default(),
                allocations: vec![
                    Allocation::simple(bob.address().to_destination(), U256::from(5u64)),
                    Allocation::simple(alice.address().to_destination(), U256::from(5u64)),
                ],
            }]),
            app_definition: Address::default(),
            nonce: 37140676580,
        };
        Fixture {
            alice,
            bob,
            request,
        }
    }

    fn deposited(c: &Channel, amount: u64) -> ChainEvent {
        ChainEvent::Deposited {
            meta: EventMeta {
                channel_id: c.id,
                block_num: c.latest_block_num + 1,
                block_timestamp: 0,
            },
            asset: Address::default(),
            now_held: U256::from(amount),
        }
    }

    fn counter_sign(o: &mut DirectFund, turn: u64, by: &Signer) {
        let s = if turn == 0 {
            o.channel.pre_fund_state().unwrap()
        } else {
            o.channel.post_fund_state().unwrap()
        };
        let mut ss = SignedState::new(s.clone());
        ss.add_signature(s.sign(by).unwrap()).unwrap();
        o.channel.add_signed_state(&ss).unwrap();
    }

    #[test]
    fn construction_refuses_duplicate_ledger() {
        let fx = fixture();
        assert!(matches!(
            DirectFund::new(&fx.request, true, fx.alice.address(), true),
            Err(ObjectiveError::LedgerChannelExists)
        ));
    }

    #[test]
    fn construction_from_payload_rejects_final_state() {
        let fx = fixture();
        let mut initial = fx.request.initial_state(fx.alice.address());
        initial.is_final = true;
        let payload = ObjectivePayload::new(
            fx.request.id(fx.alice.address()),
            PayloadType::SignedStatePayload,
            &SignedState::new(initial),
        )
        .unwrap();
        assert!(DirectFund::from_payload(&payload, false, fx.alice.address()).is_err());

        // A non-participant cannot construct the objective either.
        let good = ObjectivePayload::new(
            fx.request.id(fx.alice.address()),
            PayloadType::SignedStatePayload,
            &SignedState::new(fx.request.initial_state(fx.alice.address())),
        )
        .unwrap();
        let outsider = Signer::random(&mut thread_rng()).address();
        assert!(matches!(
            DirectFund::from_payload(&good, false, outsider),
            Err(ObjectiveError::NotAParticipant(_))
        ));
    }

    #[test]
    fn crank_requires_approval() {
        let fx = fixture();
        let mut o = DirectFund::new(&fx.request, false, fx.alice.address(), false).unwrap();
        assert!(matches!(
            o.crank(&fx.alice),
            Err(ObjectiveError::NotApproved)
        ));
        o.approve();
        assert_eq!(o.status, ObjectiveStatus::Approved);
    }

    #[test]
    fn full_lifecycle_as_alice() {
        let fx = fixture();
        let mut o = DirectFund::new(&fx.request, true, fx.alice.address(), false).unwrap();

        // Prefund: sign, send, wait for the counterparty.
        let (effects, waiting) = o.crank(&fx.alice).unwrap();
        assert_eq!(waiting, WAITING_FOR_COMPLETE_PREFUND);
        assert_eq!(effects.messages_to_send.len(), 1);
        assert_eq!(effects.messages_to_send[0].to, fx.bob.address());
        assert!(o.channel.pre_fund_signed_by_me());

        counter_sign(&mut o, 0, &fx.bob);

        // Bob's allocation is first, so Alice must wait for his deposit.
        let (effects, waiting) = o.crank(&fx.alice).unwrap();
        assert_eq!(waiting, WAITING_FOR_MY_TURN_TO_FUND);
        assert!(effects.is_empty());

        // Bob deposits 5; now it is Alice's turn.
        o.channel.update_with_chain_event(&deposited(&o.channel, 5)).unwrap();
        let (effects, waiting) = o.crank(&fx.alice).unwrap();
        assert_eq!(waiting, WAITING_FOR_COMPLETE_FUNDING);
        assert_eq!(effects.transactions_to_submit.len(), 1);
        match &effects.transactions_to_submit[0] {
            ChainTransaction::Deposit {
                channel_id,
                expected_held,
                deposit,
            } => {
                assert_eq!(*channel_id, o.channel.id);
                assert_eq!(expected_held.get(&Address::default()), U256::from(5u64));
                assert_eq!(deposit.get(&Address::default()), U256::from(5u64));
            }
            other => panic!("expected a deposit, got {other:?}"),
        }

        // Re-cranking must not resubmit the deposit.
        let (effects, waiting) = o.crank(&fx.alice).unwrap();
        assert_eq!(waiting, WAITING_FOR_COMPLETE_FUNDING);
        assert!(effects.transactions_to_submit.is_empty());

        // Full funding lands; postfund round runs.
        o.channel.update_with_chain_event(&deposited(&o.channel, 10)).unwrap();
        let (effects, waiting) = o.crank(&fx.alice).unwrap();
        assert_eq!(waiting, WAITING_FOR_COMPLETE_POSTFUND);
        assert_eq!(effects.messages_to_send.len(), 1);

        counter_sign(&mut o, 1, &fx.bob);
        let (effects, waiting) = o.crank(&fx.alice).unwrap();
        assert_eq!(waiting, WAITING_FOR_NOTHING);
        assert!(effects.is_empty());
        assert_eq!(o.status, ObjectiveStatus::Completed);

        // Completed objectives crank to a no-op.
        let (effects, waiting) = o.crank(&fx.alice).unwrap();
        assert_eq!(waiting, WAITING_FOR_NOTHING);
        assert!(effects.is_empty());
    }

    #[test]
    fn dropped_deposit_is_retried_after_clearing() {
        let fx = fixture();
        let mut o = DirectFund::new(&fx.request, true, fx.alice.address(), false).unwrap();
        o.crank(&fx.alice).unwrap();
        counter_sign(&mut o, 0, &fx.bob);
        o.channel.update_with_chain_event(&deposited(&o.channel, 5)).unwrap();

        let (effects, _) = o.crank(&fx.alice).unwrap();
        assert_eq!(effects.transactions_to_submit.len(), 1);
        o.clear_transaction_submitted();
        let (effects, _) = o.crank(&fx.alice).unwrap();
        assert_eq!(effects.transactions_to_submit.len(), 1);
    }

    #[test]
    fn update_rejects_foreign_payload() {
        let fx = fixture();
        let mut o = DirectFund::new(&fx.request, true, fx.alice.address(), false).unwrap();
        let payload = ObjectivePayload::new(
            ObjectiveId::new(ObjectiveKind::DirectFund, Destination([9; 32])),
            PayloadType::SignedStatePayload,
            &SignedState::new(fx.request.initial_state(fx.alice.address())),
        )
        .unwrap();
        assert!(matches!(
            o.update(&payload),
            Err(ObjectiveError::WrongKind(_))
        ));
    }

    #[test]
    fn update_merges_counterparty_signature() {
        let fx = fixture();
        let mut o = DirectFund::new(&fx.request, true, fx.alice.address(), false).unwrap();
        let prefund = o.channel.pre_fund_state().unwrap();
        let mut ss = SignedState::new(prefund.clone());
        ss.add_signature(prefund.sign(&fx.bob).unwrap()).unwrap();
        let payload =
            ObjectivePayload::new(o.id(), PayloadType::SignedStatePayload, &ss).unwrap();
        o.update(&payload).unwrap();
        o.crank(&fx.alice).unwrap();
        assert!(o.channel.pre_fund_complete());
    }

    #[test]
    fn reject_emits_notice() {
        let fx = fixture();
        let mut o = DirectFund::new(&fx.request, false, fx.alice.address(), false).unwrap();
        let effects = o.reject(fx.alice.address());
        assert_eq!(o.status, ObjectiveStatus::Rejected);
        assert_eq!(effects.messages_to_send.len(), 1);
        assert_eq!(
            effects.messages_to_send[0].rejected_objectives,
            vec![o.id()]
        );
    }

    #[test]
    fn serde_roundtrip() {
        let fx = fixture();
        let o = DirectFund::new(&fx.request, true, fx.alice.address(), false).unwrap();
        let json = serde_json::to_string(&o).unwrap();
        let back: DirectFund = serde_json::from_str(&json).unwrap();
        assert_eq!(back.channel.id, o.channel.id);
        assert_eq!(back.my_deposit_target, o.my_deposit_target);
        assert_eq!(back.fully_funded_threshold, o.fully_funded_threshold);
        assert_eq!(back.status, o.status);
    }
}
