//! Swap defunding: agree a final state for a swap channel whose balances
//! reflect the executed swaps, then remove its per-asset guarantees from
//! the adjacent ledgers.

use serde::{Deserialize, Serialize};

use crate::channel::consensus::{ConsensusChannel, Proposal};
use crate::channel::outcome::Exit;
use crate::channel::state::{SignedState, State};
use crate::channel::Channel;
use crate::sig::Signer;
use crate::types::{Address, Destination};

use super::messages::{Message, ObjectivePayload, PayloadType};
use super::virtual_defund::{
    WAITING_FOR_COMPLETE_FINAL, WAITING_FOR_COMPLETE_LEDGER_DEFUNDING,
};
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
        ObjectiveId::new(ObjectiveKind::SwapDefund, self.channel_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapDefund {
    pub status: ObjectiveStatus,
    pub s: Channel,
    pub to_my_left: Option<ConsensusChannel>,
    pub to_my_right: Option<ConsensusChannel>,
    pub my_role: usize,
    /// Balances after folding the executed swap history into the opening
    /// outcome. The final state carries exactly these.
    pub settled_outcome: Exit,
}

impl SwapDefund {
    /// Builds the objective at an endpoint, which computes the settled
    /// outcome from its swap history.
    pub fn new(
        s: Channel,
        settled_outcome: Exit,
        preapprove: bool,
        to_my_left: Option<ConsensusChannel>,
        to_my_right: Option<ConsensusChannel>,
    ) -> Result<Self, ObjectiveError> {
        validate_settlement(&s, &settled_outcome)?;
        Self::assemble(s, settled_outcome, preapprove, to_my_left, to_my_right)
    }

    /// Builds the objective on first sight of a final-state payload,
    /// adopting the settled outcome it carries.
    pub fn from_payload(
        payload: &ObjectivePayload,
        preapprove: bool,
        mut s: Channel,
        to_my_left: Option<ConsensusChannel>,
        to_my_right: Option<ConsensusChannel>,
    ) -> Result<Self, ObjectiveError> {
        let ss: SignedState = payload.decode(PayloadType::SignedStatePayload)?;
        if !ss.state().is_final {
            return Err(ObjectiveError::NoFinalState);
        }
        if ss.state().channel_id() != s.id {
            return Err(ObjectiveError::InvalidPayload);
        }
        let settled_outcome = ss.state().outcome.clone();
        validate_settlement(&s, &settled_outcome)?;
        s.add_signed_state(&ss)?;
        Self::assemble(s, settled_outcome, preapprove, to_my_left, to_my_right)
    }

    fn assemble(
        s: Channel,
        settled_outcome: Exit,
        preapprove: bool,
        to_my_left: Option<ConsensusChannel>,
        to_my_right: Option<ConsensusChannel>,
    ) -> Result<Self, ObjectiveError> {
        let my_role = s.my_index;
        let last = s.participants().len() - 1;
        if (my_role == 0 && to_my_left.is_some()) || (my_role == last && to_my_right.is_some()) {
            return Err(ObjectiveError::InvalidPayload);
        }
        if (my_role != 0 && to_my_left.is_none()) || (my_role != last && to_my_right.is_none()) {
            return Err(ObjectiveError::InvalidPayload);
        }
        Ok(SwapDefund {
            status: if preapprove {
                ObjectiveStatus::Approved
            } else {
                ObjectiveStatus::Unapproved
            },
            s,
            to_my_left,
            to_my_right,
            my_role,
            settled_outcome,
        })
    }

    pub fn final_state(&self) -> Result<State, ObjectiveError> {
        let supported = self.s.latest_supported_state()?.state();
        if supported.is_final {
            return Ok(supported.clone());
        }
        let mut f = supported.clone();
        f.turn_num += 1;
        f.is_final = true;
        f.outcome = self.settled_outcome.clone();
        Ok(f)
    }

    fn final_signed_by_me(&self) -> Result<bool, ObjectiveError> {
        let turn = self.final_state()?.turn_num;
        Ok(self
            .s
            .signed_state_for_turn(turn)
            .map(|ss| ss.has_signature_for(self.s.my_index))
            .unwrap_or(false))
    }

    fn final_complete(&self) -> Result<bool, ObjectiveError> {
        let turn = self.final_state()?.turn_num;
        Ok(self
            .s
            .signed_state_for_turn(turn)
            .map(|ss| ss.has_all_signatures())
            .unwrap_or(false))
    }

    /// Proposes or counter-signs removals until the ledger carries no
    /// guarantee for the swap channel in any asset.
    fn defund_ledger(
        ledger: &mut ConsensusChannel,
        target: Destination,
        settled: &Exit,
        signer: &Signer,
        effects: &mut SideEffects,
    ) -> Result<bool, ObjectiveError> {
        if !ledger.includes_target(&target) {
            return Ok(true);
        }
        for sae in &settled.0 {
            let guaranteed = ledger
                .consensus_vars()
                .outcome
                .iter()
                .any(|o| o.asset_address() == sae.asset && o.includes_target(&target));
            if !guaranteed {
                continue;
            }
            let left_amount = sae
                .allocations
                .first()
                .map(|a| a.amount)
                .unwrap_or_default();
            let expected = Proposal::remove(ledger.id, target, left_amount, sae.asset);
            if ledger.is_leader() {
                if !ledger.has_removal_been_proposed(target, sae.asset) {
                    effects.proposals_to_process.push(expected);
                }
            } else if ledger.has_removal_been_proposed_next(target, sae.asset) {
                let sp = ledger.sign_next_proposal(&expected, signer)?;
                effects.messages_to_send.push(Message::for_proposals(
                    ledger.my_address(),
                    ledger.counterparty(),
                    vec![sp],
                ));
                // The queue advanced; later assets are handled on the
                // next crank.
                break;
            }
        }
        Ok(!ledger.includes_target(&target))
    }

    fn send_to_others(
        &self,
        ss: &SignedState,
        effects: &mut SideEffects,
    ) -> Result<(), ObjectiveError> {
        effects.messages_to_send.extend(Message::for_objective(
            self.s.my_address(),
            &self.s.other_participants(),
            self.id(),
            PayloadType::SignedStatePayload,
            ss,
        )?);
        Ok(())
    }
}

/// The settled outcome must redistribute within each asset, never mint:
/// same assets in the same order, totals preserved.
fn validate_settlement(s: &Channel, settled: &Exit) -> Result<(), ObjectiveError> {
    let opening = s.pre_fund_state()?.outcome;
    if opening.0.len() != settled.0.len() {
        return Err(ObjectiveError::InvalidPayload);
    }
    for (before, after) in opening.0.iter().zip(settled.0.iter()) {
        if before.asset != after.asset
            || before.total_allocated() != after.total_allocated()
        {
            return Err(ObjectiveError::InvalidPayload);
        }
    }
    Ok(())
}

impl Objective for SwapDefund {
    fn id(&self) -> ObjectiveId {
        ObjectiveId::new(ObjectiveKind::SwapDefund, self.s.id)
    }

    fn status(&self) -> ObjectiveStatus {
        self.status
    }

    fn owns_channel(&self) -> Destination {
        self.s.id
    }

    fn related(&self) -> Vec<Related<'_>> {
        let mut r = vec![Related::Channel(&self.s)];
        if let Some(c) = &self.to_my_left {
            r.push(Related::Consensus(c));
        }
        if let Some(c) = &self.to_my_right {
            r.push(Related::Consensus(c));
        }
        r
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
                &self.s.other_participants(),
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
        self.s.add_signed_state(&ss)?;
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

        if !self.final_signed_by_me()? {
            let final_state = self.final_state()?;
            let ss = self.s.sign_and_add_state(final_state, signer)?;
            self.send_to_others(&ss, &mut effects)?;
        }
        if !self.final_complete()? {
            return Ok((effects, WAITING_FOR_COMPLETE_FINAL));
        }

        let settled = self.settled_outcome.clone();
        let target = self.s.id;
        let mut all_defunded = true;
        for ledger in self
            .to_my_left
            .iter_mut()
            .chain(self.to_my_right.iter_mut())
        {
            all_defunded &=
                Self::defund_ledger(ledger, target, &settled, signer, &mut effects)?;
        }
        if !all_defunded {
            return Ok((effects, WAITING_FOR_COMPLETE_LEDGER_DEFUNDING));
        }

        self.status = ObjectiveStatus::Completed;
        Ok((effects, WAITING_FOR_NOTHING))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::consensus::tests::Fixture;
    use crate::channel::outcome::{Allocation, AssetMetadata, SingleAssetExit};
    use crate::channel::ChannelType;
    use crate::protocols::swap_fund::tests::two_asset_request;
    use crate::types::U256;

    fn open_swap_pair(fx: &Fixture) -> (Channel, Channel) {
        let request = two_asset_request(&fx.leader, &fx.follower, false);
        let initial = request.initial_state(fx.leader.address());
        let mut a = Channel::new(initial.clone(), 0, ChannelType::Swap).unwrap();
        let mut b = Channel::new(initial.clone(), 1, ChannelType::Swap).unwrap();
        for turn in [0u64, 1] {
            let mut s = initial.clone();
            s.turn_num = turn;
            let mut ss = SignedState::new(s.clone());
            ss.add_signature(s.sign(&fx.leader).unwrap()).unwrap();
            ss.add_signature(s.sign(&fx.follower).unwrap()).unwrap();
            a.add_signed_state(&ss).unwrap();
            b.add_signed_state(&ss).unwrap();
        }
        (a, b)
    }

    /// The opening 6/4 and 4/0 balances after one executed swap of
    /// 2 asset-one for 1 asset-two.
    fn settled(fx: &Fixture) -> Exit {
        let alice = fx.leader.address().to_destination();
        let bob = fx.follower.address().to_destination();
        Exit(vec![
            SingleAssetExit {
                asset: Address::default(),
                asset_metadata: AssetMetadata::default(),
                allocations: vec![
                    Allocation::simple(alice, U256::from(4u64)),
                    Allocation::simple(bob, U256::from(6u64)),
                ],
            },
            SingleAssetExit {
                asset: Address([0x02; 20]),
                asset_metadata: AssetMetadata::default(),
                allocations: vec![
                    Allocation::simple(alice, U256::from(5u64)),
                    Allocation::simple(bob, U256::zero()),
                ],
            },
        ])
    }

    #[test]
    fn final_state_carries_settled_balances() {
        let fx = Fixture::new();
        let (a_chan, _) = open_swap_pair(&fx);
        let (lc, _) = fx.pair(100, 100);
        let o = SwapDefund::new(a_chan, settled(&fx), true, None, Some(lc)).unwrap();
        let f = o.final_state().unwrap();
        assert!(f.is_final);
        assert_eq!(f.turn_num, 2);
        assert_eq!(f.outcome, settled(&fx));
    }

    #[test]
    fn settlement_must_preserve_per_asset_totals() {
        let fx = Fixture::new();
        let (a_chan, _) = open_swap_pair(&fx);
        let (lc, _) = fx.pair(100, 100);
        let mut bad = settled(&fx);
        bad.0[0].allocations[0].amount = U256::from(100u64);
        assert!(SwapDefund::new(a_chan, bad, true, None, Some(lc)).is_err());
    }

    #[test]
    fn counterparty_adopts_settlement_from_payload() {
        let fx = Fixture::new();
        let (a_chan, b_chan) = open_swap_pair(&fx);
        let (lc, fc) = fx.pair(100, 100);
        let mut alice_o = SwapDefund::new(a_chan, settled(&fx), true, None, Some(lc)).unwrap();

        let (effects, waiting) = alice_o.crank(&fx.leader).unwrap();
        assert_eq!(waiting, WAITING_FOR_COMPLETE_FINAL);
        let payload = effects.messages_to_send[0].objective_payloads[0].clone();

        let mut bob_o =
            SwapDefund::from_payload(&payload, true, b_chan, Some(fc), None).unwrap();
        assert_eq!(bob_o.settled_outcome, settled(&fx));
        let (bob_effects, waiting) = bob_o.crank(&fx.follower).unwrap();
        // The fixture ledger carries no guarantee for the swap channel,
        // so Bob finishes once the final state is fully signed.
        assert_eq!(waiting, WAITING_FOR_NOTHING);
        assert_eq!(bob_o.status, ObjectiveStatus::Completed);

        let bob_payload = bob_effects.messages_to_send[0].objective_payloads[0].clone();
        alice_o.update(&bob_payload).unwrap();
        let (_, waiting) = alice_o.crank(&fx.leader).unwrap();
        assert_eq!(waiting, WAITING_FOR_NOTHING);
    }
}
