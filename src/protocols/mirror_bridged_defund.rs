//! Mirror defunding on the primary chain: once the secondary-chain copy
//! of a bridged ledger has concluded, present its final state here and
//! withdraw the real funds.
//!
//! Leader and follower orientation is inverted between the two chains,
//! so the primary-chain final state is the secondary-chain one with the
//! first two allocation slots swapped.

use serde::{Deserialize, Serialize};

use crate::chain::ChainTransaction;
use crate::channel::consensus::ConsensusChannel;
use crate::channel::state::{SignedState, State};
use crate::channel::Channel;
use crate::sig::Signer;
use crate::types::{Address, Destination};

use super::direct_defund::{
    channel_from_consensus, WAITING_FOR_FINALIZATION, WAITING_FOR_WITHDRAW,
};
use super::messages::{Message, ObjectivePayload, PayloadType};
use super::{
    Objective, ObjectiveError, ObjectiveId, ObjectiveKind, ObjectiveStatus, Related, SideEffects,
    WaitingFor, WAITING_FOR_NOTHING,
};

/// API request carrying the concluded secondary-chain state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveRequest {
    pub channel_id: Destination,
    pub l2_signed_state: SignedState,
}

impl ObjectiveRequest {
    pub fn id(&self) -> ObjectiveId {
        ObjectiveId::new(ObjectiveKind::MirrorBridgedDefund, self.channel_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorBridgedDefund {
    pub status: ObjectiveStatus,
    /// The primary-chain ledger channel.
    pub channel: Channel,
    /// Present only on the side that concluded the secondary chain.
    pub l2_signed_state: Option<SignedState>,
    mirror_transaction_submitted: bool,
    final_turn_num: u64,
}

impl MirrorBridgedDefund {
    pub fn new(
        request: &ObjectiveRequest,
        preapprove: bool,
        cc: &ConsensusChannel,
    ) -> Result<Self, ObjectiveError> {
        if !request.l2_signed_state.state().is_final {
            return Err(ObjectiveError::NoFinalState);
        }
        let channel = channel_from_consensus(cc)?;
        let final_turn_num = cc.consensus_turn_num() + 1;
        Ok(MirrorBridgedDefund {
            status: if preapprove {
                ObjectiveStatus::Approved
            } else {
                ObjectiveStatus::Unapproved
            },
            channel,
            l2_signed_state: Some(request.l2_signed_state.clone()),
            mirror_transaction_submitted: false,
            final_turn_num,
        })
    }

    /// Builds the counterparty-side objective from the derived
    /// primary-chain final state.
    pub fn from_payload(
        payload: &ObjectivePayload,
        preapprove: bool,
        cc: &ConsensusChannel,
    ) -> Result<Self, ObjectiveError> {
        let ss: SignedState = payload.decode(PayloadType::SignedStatePayload)?;
        if !ss.state().is_final {
            return Err(ObjectiveError::NoFinalState);
        }
        let mut channel = channel_from_consensus(cc)?;
        let final_turn_num = ss.state().turn_num;
        channel.add_signed_state(&ss)?;
        Ok(MirrorBridgedDefund {
            status: if preapprove {
                ObjectiveStatus::Approved
            } else {
                ObjectiveStatus::Unapproved
            },
            channel,
            l2_signed_state: None,
            mirror_transaction_submitted: false,
            final_turn_num,
        })
    }

    /// The primary-chain final state, derived by carrying the
    /// secondary-chain outcome over with slots [0] and [1] swapped.
    fn derive_l1_final_state(&self, l2: &SignedState) -> Result<State, ObjectiveError> {
        let mut s = self.channel.latest_supported_state()?.state().clone();
        s.turn_num = self.final_turn_num;
        s.is_final = true;
        let mut outcome = l2.state().outcome.clone();
        for sae in &mut outcome.0 {
            if sae.allocations.len() < 2 {
                return Err(ObjectiveError::InvalidPayload);
            }
            sae.allocations.swap(0, 1);
        }
        s.outcome = outcome;
        Ok(s)
    }

    fn final_state_signed_by_me(&self) -> bool {
        self.channel
            .signed_state_for_turn(self.final_turn_num)
            .map(|ss| ss.state().is_final && ss.has_signature_for(self.channel.my_index))
            .unwrap_or(false)
    }

    pub fn clear_transaction_submitted(&mut self) {
        self.mirror_transaction_submitted = false;
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

impl Objective for MirrorBridgedDefund {
    fn id(&self) -> ObjectiveId {
        ObjectiveId::new(ObjectiveKind::MirrorBridgedDefund, self.channel.id)
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
        if !ss.state().is_final {
            return Err(ObjectiveError::NoFinalState);
        }
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

        if let Some(l2) = self.l2_signed_state.clone() {
            if !self.mirror_transaction_submitted {
                let final_state = self.derive_l1_final_state(&l2)?;
                let ss = self.channel.sign_and_add_state(final_state, signer)?;
                self.send_to_others(&ss, &mut effects)?;
                effects
                    .transactions_to_submit
                    .push(ChainTransaction::MirrorWithdrawAll {
                        channel_id: self.channel.id,
                        l2_signed_state: l2,
                    });
                self.mirror_transaction_submitted = true;
                return Ok((effects, WAITING_FOR_FINALIZATION));
            }
        } else if !self.final_state_signed_by_me() {
            let received = self
                .channel
                .signed_state_for_turn(self.final_turn_num)
                .ok_or(ObjectiveError::NoFinalState)?
                .state()
                .clone();
            let ss = self.channel.sign_and_add_state(received, signer)?;
            self.send_to_others(&ss, &mut effects)?;
            return Ok((effects, WAITING_FOR_WITHDRAW));
        }

        if !self.channel.fully_withdrawn() {
            return Ok((effects, WAITING_FOR_WITHDRAW));
        }

        self.status = ObjectiveStatus::Completed;
        Ok((effects, WAITING_FOR_NOTHING))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainEvent, EventMeta};
    use crate::channel::consensus::tests::Fixture;
    use crate::types::U256;

    /// A concluded secondary-chain final state matching the fixture
    /// ledger, with the allocation slots in secondary-chain order.
    fn l2_final(fx: &Fixture, lc: &ConsensusChannel) -> SignedState {
        let mut s = lc.supported_signed_state().state().clone();
        s.turn_num += 1;
        s.is_final = true;
        s.outcome.0[0].allocations.swap(0, 1);
        let mut ss = SignedState::new(s.clone());
        ss.add_signature(s.sign(&fx.leader).unwrap()).unwrap();
        ss.add_signature(s.sign(&fx.follower).unwrap()).unwrap();
        ss
    }

    fn drained(c: &Channel) -> ChainEvent {
        ChainEvent::AllocationUpdated {
            meta: EventMeta {
                channel_id: c.id,
                block_num: c.latest_block_num + 1,
                block_timestamp: 0,
            },
            asset: Address::default(),
            now_held: U256::zero(),
        }
    }

    #[test]
    fn request_requires_final_l2_state() {
        let fx = Fixture::new();
        let (lc, _) = fx.pair(60, 40);
        let mut not_final = l2_final(&fx, &lc);
        not_final = {
            let mut s = not_final.state().clone();
            s.is_final = false;
            SignedState::new(s)
        };
        let request = ObjectiveRequest {
            channel_id: lc.id,
            l2_signed_state: not_final,
        };
        assert!(matches!(
            MirrorBridgedDefund::new(&request, true, &lc),
            Err(ObjectiveError::NoFinalState)
        ));
    }

    #[test]
    fn initiator_submits_mirror_withdrawal() {
        use crate::types::Funds;

        let fx = Fixture::new();
        let (mut lc, mut fc) = fx.pair(60, 40);
        lc.on_chain_funding = Funds::single(Address::default(), U256::from(100u64));
        fc.on_chain_funding = lc.on_chain_funding.clone();
        let request = ObjectiveRequest {
            channel_id: lc.id,
            l2_signed_state: l2_final(&fx, &lc),
        };
        let mut leader_o = MirrorBridgedDefund::new(&request, true, &lc).unwrap();

        let (effects, waiting) = leader_o.crank(&fx.leader).unwrap();
        assert_eq!(waiting, WAITING_FOR_FINALIZATION);
        assert_eq!(effects.messages_to_send.len(), 1);
        assert_eq!(effects.transactions_to_submit.len(), 1);
        match &effects.transactions_to_submit[0] {
            ChainTransaction::MirrorWithdrawAll { channel_id, .. } => {
                assert_eq!(*channel_id, leader_o.channel.id);
            }
            other => panic!("expected a mirror withdrawal, got {other:?}"),
        }

        // The derived state restores primary-chain slot order, leader
        // allocation first.
        let derived = leader_o
            .channel
            .signed_state_for_turn(2)
            .unwrap()
            .state()
            .clone();
        assert!(derived.is_final);
        assert_eq!(
            derived.outcome.0[0].allocations[0].destination,
            fx.leader.address().to_destination()
        );

        // Re-cranking submits nothing new while the withdrawal is out.
        let (effects, waiting) = leader_o.crank(&fx.leader).unwrap();
        assert_eq!(waiting, WAITING_FOR_WITHDRAW);
        assert!(effects.is_empty());

        // The counterparty counter-signs the derived state.
        let payload = ObjectivePayload::new(
            leader_o.id(),
            PayloadType::SignedStatePayload,
            &leader_o.channel.signed_state_for_turn(2).unwrap().clone(),
        )
        .unwrap();
        let mut follower_o = MirrorBridgedDefund::from_payload(&payload, true, &fc).unwrap();
        let (effects, waiting) = follower_o.crank(&fx.follower).unwrap();
        assert_eq!(waiting, WAITING_FOR_WITHDRAW);
        assert_eq!(effects.messages_to_send.len(), 1);
        assert!(effects.transactions_to_submit.is_empty());

        // Withdrawal lands on-chain; both sides complete.
        leader_o
            .channel
            .update_with_chain_event(&drained(&leader_o.channel))
            .unwrap();
        let (_, waiting) = leader_o.crank(&fx.leader).unwrap();
        assert_eq!(waiting, WAITING_FOR_NOTHING);
        assert_eq!(leader_o.status, ObjectiveStatus::Completed);

        follower_o
            .channel
            .update_with_chain_event(&drained(&follower_o.channel))
            .unwrap();
        let (_, waiting) = follower_o.crank(&fx.follower).unwrap();
        assert_eq!(waiting, WAITING_FOR_NOTHING);
        assert_eq!(follower_o.status, ObjectiveStatus::Completed);
    }
}
