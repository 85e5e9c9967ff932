//! Bridged funding: open a mirrored ledger channel on the secondary
//! chain. The protocol matches direct funding except that nobody
//! deposits here; the bridge reflects the primary chain's holdings into
//! this channel, and the objective simply waits for them to appear.

use serde::{Deserialize, Serialize};

use crate::channel::outcome::Exit;
use crate::channel::state::{SignedState, State};
use crate::channel::{Channel, ChannelType};
use crate::sig::Signer;
use crate::types::{Address, Destination, Funds};

use super::direct_fund::{
    WAITING_FOR_COMPLETE_FUNDING, WAITING_FOR_COMPLETE_POSTFUND, WAITING_FOR_COMPLETE_PREFUND,
};
use super::messages::{Message, ObjectivePayload, PayloadType};
use super::{
    Objective, ObjectiveError, ObjectiveId, ObjectiveKind, ObjectiveStatus, Related, SideEffects,
    WaitingFor, WAITING_FOR_NOTHING,
};

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
        ObjectiveId::new(ObjectiveKind::BridgedFund, cid)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgedFund {
    pub status: ObjectiveStatus,
    pub channel: Channel,
    fully_funded_threshold: Funds,
}

impl BridgedFund {
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
        Ok(Self::from_channel(channel, preapprove))
    }

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
        Ok(Self::from_channel(channel, preapprove))
    }

    fn from_channel(channel: Channel, preapprove: bool) -> Self {
        let fully_funded_threshold = channel
            .signed_state_for_turn(0)
            .expect("channel construction stores the turn 0 state")
            .state()
            .outcome
            .total_allocated();
        BridgedFund {
            status: if preapprove {
                ObjectiveStatus::Approved
            } else {
                ObjectiveStatus::Unapproved
            },
            channel,
            fully_funded_threshold,
        }
    }

    fn funding_complete(&self) -> bool {
        self.channel
            .on_chain
            .holdings
            .covers(&self.fully_funded_threshold)
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

impl Objective for BridgedFund {
    fn id(&self) -> ObjectiveId {
        ObjectiveId::new(ObjectiveKind::BridgedFund, self.channel.id)
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

        // The bridge mirrors holdings from the primary chain; no deposit
        // transaction gets submitted from this side.
        if !self.funding_complete() {
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
mod tests {
    use super::*;
    use crate::chain::{ChainEvent, EventMeta};
    use crate::channel::outcome::{Allocation, AssetMetadata, SingleAssetExit};
    use crate::types::U256;
    use rand::thread_rng;

    fn request(alice: &Signer, bob: &Signer) -> ObjectiveRequest {
        ObjectiveRequest {
            counterparty: bob.address(),
            challenge_duration: 60,
            outcome: Exit(vec![SingleAssetExit {
                asset: Address::default(),
                asset_metadata: AssetMetadata::default(),
                allocations: vec![
                    Allocation::simple(alice.address().to_destination(), U256::from(5u64)),
                    Allocation::simple(bob.address().to_destination(), U256::from(5u64)),
                ],
            }]),
            app_definition: Address::default(),
            nonce: 7,
        }
    }

    #[test]
    fn waits_for_mirrored_holdings_without_depositing() {
        let mut rng = thread_rng();
        let alice = Signer::random(&mut rng);
        let bob = Signer::random(&mut rng);
        let mut o = BridgedFund::new(&request(&alice, &bob), true, alice.address(), false).unwrap();

        let (_, waiting) = o.crank(&alice).unwrap();
        assert_eq!(waiting, WAITING_FOR_COMPLETE_PREFUND);

        let prefund = o.channel.pre_fund_state().unwrap();
        let mut ss = SignedState::new(prefund.clone());
        ss.add_signature(prefund.sign(&bob).unwrap()).unwrap();
        o.channel.add_signed_state(&ss).unwrap();

        // Prefund done. No deposit may be submitted while the bridge has
        // not mirrored anything.
        let (effects, waiting) = o.crank(&alice).unwrap();
        assert_eq!(waiting, WAITING_FOR_COMPLETE_FUNDING);
        assert!(effects.transactions_to_submit.is_empty());

        // The bridge reflects the full L1 holdings in one event.
        o.channel
            .update_with_chain_event(&ChainEvent::Deposited {
                meta: EventMeta {
                    channel_id: o.channel.id,
                    block_num: 1,
                    block_timestamp: 0,
                },
                asset: Address::default(),
                now_held: U256::from(10u64),
            })
            .unwrap();

        let (effects, waiting) = o.crank(&alice).unwrap();
        assert_eq!(waiting, WAITING_FOR_COMPLETE_POSTFUND);
        assert_eq!(effects.messages_to_send.len(), 1);
        assert!(effects.transactions_to_submit.is_empty());

        let postfund = o.channel.post_fund_state().unwrap();
        let mut ss = SignedState::new(postfund.clone());
        ss.add_signature(postfund.sign(&bob).unwrap()).unwrap();
        o.channel.add_signed_state(&ss).unwrap();

        let (_, waiting) = o.crank(&alice).unwrap();
        assert_eq!(waiting, WAITING_FOR_NOTHING);
        assert_eq!(o.status, ObjectiveStatus::Completed);
    }
}
