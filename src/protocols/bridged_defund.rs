//! Bridged defunding: co-sign a final state for a mirrored ledger on the
//! secondary chain. No withdrawal happens here; the mirror defund on the
//! primary chain presents this final state and does the on-chain work.

use serde::{Deserialize, Serialize};

use crate::channel::consensus::ConsensusChannel;
use crate::channel::state::SignedState;
use crate::channel::Channel;
use crate::sig::Signer;
use crate::types::{Address, Destination};

use super::direct_defund::{channel_from_consensus, WAITING_FOR_FINALIZATION};
use super::messages::{Message, ObjectivePayload, PayloadType};
use super::{
    Objective, ObjectiveError, ObjectiveId, ObjectiveKind, ObjectiveStatus, Related, SideEffects,
    WaitingFor, WAITING_FOR_NOTHING,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectiveRequest {
    pub channel_id: Destination,
}

impl ObjectiveRequest {
    pub fn id(&self) -> ObjectiveId {
        ObjectiveId::new(ObjectiveKind::BridgedDefund, self.channel_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgedDefund {
    pub status: ObjectiveStatus,
    pub channel: Channel,
    final_turn_num: u64,
}

impl BridgedDefund {
    /// Builds the objective from a local close request. The mirrored
    /// ledger must be quiescent.
    pub fn new(
        request: &ObjectiveRequest,
        preapprove: bool,
        cc: &ConsensusChannel,
    ) -> Result<Self, ObjectiveError> {
        if cc.id != request.channel_id {
            return Err(ObjectiveError::InvalidPayload);
        }
        if !cc.proposal_queue().is_empty() {
            return Err(ObjectiveError::PendingProposals);
        }
        if !cc.funding_targets().is_empty() {
            return Err(ObjectiveError::LedgerStillFunding);
        }
        let channel = channel_from_consensus(cc)?;
        let final_turn_num = cc.consensus_turn_num() + 1;
        Ok(BridgedDefund {
            status: if preapprove {
                ObjectiveStatus::Approved
            } else {
                ObjectiveStatus::Unapproved
            },
            channel,
            final_turn_num,
        })
    }

    pub fn from_payload(
        payload: &ObjectivePayload,
        preapprove: bool,
        cc: &ConsensusChannel,
    ) -> Result<Self, ObjectiveError> {
        let ss: SignedState = payload.decode(PayloadType::SignedStatePayload)?;
        if !ss.state().is_final {
            return Err(ObjectiveError::NoFinalState);
        }
        let request = ObjectiveRequest {
            channel_id: ss.state().channel_id(),
        };
        let mut o = BridgedDefund::new(&request, preapprove, cc)?;
        o.final_turn_num = ss.state().turn_num;
        o.channel.add_signed_state(&ss)?;
        Ok(o)
    }

    /// The fully signed final state, once the cooperative round is done.
    /// The mirror defund on the primary chain consumes this.
    pub fn final_signed_state(&self) -> Option<SignedState> {
        self.channel
            .signed_state_for_turn(self.final_turn_num)
            .filter(|ss| ss.state().is_final && ss.has_all_signatures())
            .cloned()
    }

    fn final_state_signed_by_me(&self) -> bool {
        self.channel
            .signed_state_for_turn(self.final_turn_num)
            .map(|ss| ss.state().is_final && ss.has_signature_for(self.channel.my_index))
            .unwrap_or(false)
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

impl Objective for BridgedDefund {
    fn id(&self) -> ObjectiveId {
        ObjectiveId::new(ObjectiveKind::BridgedDefund, self.channel.id)
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

        if !self.final_state_signed_by_me() {
            let mut final_state = self.channel.latest_supported_state()?.state().clone();
            final_state.turn_num = self.final_turn_num;
            final_state.is_final = true;
            let ss = self.channel.sign_and_add_state(final_state, signer)?;
            self.send_to_others(&ss, &mut effects)?;
        }
        if self.final_signed_state().is_none() {
            return Ok((effects, WAITING_FOR_FINALIZATION));
        }

        // No withdrawal from this side; the mirrored holdings unwind on
        // the primary chain.
        self.status = ObjectiveStatus::Completed;
        Ok((effects, WAITING_FOR_NOTHING))
    }
}
