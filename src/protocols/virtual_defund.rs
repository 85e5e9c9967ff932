//! Virtual defunding: settle a payment channel from its vouchers, agree a
//! final state, and collapse the guarantee out of the adjacent ledgers.

use serde::{Deserialize, Serialize};

use crate::channel::consensus::{ConsensusChannel, Proposal};
use crate::channel::state::{SignedState, State};
use crate::channel::Channel;
use crate::sig::Signer;
use crate::types::{Address, Destination, U256};

use super::messages::{Message, ObjectivePayload, PayloadType};
use super::virtual_fund::initial_balances;
use super::{
    Objective, ObjectiveError, ObjectiveId, ObjectiveKind, ObjectiveStatus, Related, SideEffects,
    WaitingFor, WAITING_FOR_NOTHING,
};

pub const WAITING_FOR_COMPLETE_FINAL: WaitingFor = WaitingFor("WaitingForCompleteFinal");
pub const WAITING_FOR_COMPLETE_LEDGER_DEFUNDING: WaitingFor =
    WaitingFor("WaitingForCompleteLedgerDefunding");

/// API request to settle and close a virtual channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectiveRequest {
    pub channel_id: Destination,
}

impl ObjectiveRequest {
    pub fn id(&self) -> ObjectiveId {
        ObjectiveId::new(ObjectiveKind::VirtualDefund, self.channel_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualDefund {
    pub status: ObjectiveStatus,
    pub v: Channel,
    pub to_my_left: Option<ConsensusChannel>,
    pub to_my_right: Option<ConsensusChannel>,
    pub my_role: usize,
    /// Cumulative amount paid through the channel, fixed at construction.
    pub paid: U256,
    /// Floor guarding an in-flight voucher: a final state settling less
    /// than this is refused.
    pub minimum_payment_amount: U256,
}

impl VirtualDefund {
    /// Builds the objective at the payer or payee, who learn `paid` from
    /// their voucher manager.
    pub fn new(
        v: Channel,
        paid: U256,
        minimum_payment_amount: U256,
        preapprove: bool,
        to_my_left: Option<ConsensusChannel>,
        to_my_right: Option<ConsensusChannel>,
    ) -> Result<Self, ObjectiveError> {
        if paid < minimum_payment_amount {
            return Err(ObjectiveError::InvalidPayload);
        }
        Self::assemble(v, paid, minimum_payment_amount, preapprove, to_my_left, to_my_right)
    }

    /// Builds the objective on first sight of a final-state payload,
    /// adopting the settled amount it carries after validating it.
    pub fn from_payload(
        payload: &ObjectivePayload,
        preapprove: bool,
        mut v: Channel,
        minimum_payment_amount: U256,
        to_my_left: Option<ConsensusChannel>,
        to_my_right: Option<ConsensusChannel>,
    ) -> Result<Self, ObjectiveError> {
        let ss: SignedState = payload.decode(PayloadType::SignedStatePayload)?;
        if !ss.state().is_final {
            return Err(ObjectiveError::NoFinalState);
        }
        if ss.state().channel_id() != v.id {
            return Err(ObjectiveError::InvalidPayload);
        }
        let paid = settled_amount(&v, ss.state())?;
        if paid < minimum_payment_amount {
            return Err(ObjectiveError::InvalidPayload);
        }
        v.add_signed_state(&ss)?;
        Self::assemble(v, paid, minimum_payment_amount, preapprove, to_my_left, to_my_right)
    }

    fn assemble(
        v: Channel,
        paid: U256,
        minimum_payment_amount: U256,
        preapprove: bool,
        to_my_left: Option<ConsensusChannel>,
        to_my_right: Option<ConsensusChannel>,
    ) -> Result<Self, ObjectiveError> {
        let my_role = v.my_index;
        let last = v.participants().len() - 1;
        if (my_role == 0 && to_my_left.is_some()) || (my_role == last && to_my_right.is_some()) {
            return Err(ObjectiveError::InvalidPayload);
        }
        if (my_role != 0 && to_my_left.is_none()) || (my_role != last && to_my_right.is_none()) {
            return Err(ObjectiveError::InvalidPayload);
        }
        Ok(VirtualDefund {
            status: if preapprove {
                ObjectiveStatus::Approved
            } else {
                ObjectiveStatus::Unapproved
            },
            v,
            to_my_left,
            to_my_right,
            my_role,
            paid,
            minimum_payment_amount,
        })
    }

    /// The final state: latest supported outcome with `paid` moved from
    /// the payer's allocation to the payee's.
    pub fn final_state(&self) -> Result<State, ObjectiveError> {
        let supported = self.v.latest_supported_state()?.state();
        if supported.is_final {
            return Ok(supported.clone());
        }
        let mut s = supported.clone();
        s.turn_num += 1;
        s.is_final = true;
        let sae = s
            .outcome
            .0
            .first_mut()
            .ok_or(ObjectiveError::InvalidPayload)?;
        let paid = self.paid;
        let a = &mut sae.allocations;
        a[0].amount = a[0]
            .amount
            .checked_sub(paid)
            .ok_or(ObjectiveError::InvalidPayload)?;
        a[1].amount = a[1]
            .amount
            .checked_add(paid)
            .ok_or(ObjectiveError::InvalidPayload)?;
        Ok(s)
    }

    fn final_turn_num(&self) -> Result<u64, ObjectiveError> {
        Ok(self.final_state()?.turn_num)
    }

    fn final_signed_by_me(&self) -> Result<bool, ObjectiveError> {
        let turn = self.final_turn_num()?;
        Ok(self
            .v
            .signed_state_for_turn(turn)
            .map(|ss| ss.has_signature_for(self.v.my_index))
            .unwrap_or(false))
    }

    fn final_complete(&self) -> Result<bool, ObjectiveError> {
        let turn = self.final_turn_num()?;
        Ok(self
            .v
            .signed_state_for_turn(turn)
            .map(|ss| ss.has_all_signatures())
            .unwrap_or(false))
    }

    /// Drives one adjacent ledger toward removing the guarantee. Returns
    /// true once the guarantee is gone from its consensus outcome.
    fn defund_ledger(
        ledger: &mut ConsensusChannel,
        target: Destination,
        left_amount: U256,
        asset: Address,
        signer: &Signer,
        effects: &mut SideEffects,
    ) -> Result<bool, ObjectiveError> {
        if !ledger.includes_target(&target) {
            return Ok(true);
        }
        let expected = Proposal::remove(ledger.id, target, left_amount, asset);
        if ledger.is_leader() {
            if !ledger.has_removal_been_proposed(target, asset) {
                effects.proposals_to_process.push(expected);
            }
        } else if ledger.has_removal_been_proposed_next(target, asset) {
            let sp = ledger.sign_next_proposal(&expected, signer)?;
            effects.messages_to_send.push(Message::for_proposals(
                ledger.my_address(),
                ledger.counterparty(),
                vec![sp],
            ));
            return Ok(!ledger.includes_target(&target));
        }
        Ok(false)
    }

    fn send_to_others(
        &self,
        ss: &SignedState,
        effects: &mut SideEffects,
    ) -> Result<(), ObjectiveError> {
        effects.messages_to_send.extend(Message::for_objective(
            self.v.my_address(),
            &self.v.other_participants(),
            self.id(),
            PayloadType::SignedStatePayload,
            ss,
        )?);
        Ok(())
    }
}

/// How much the received final state pays out beyond the opening balance,
/// checked against conservation of the channel total.
fn settled_amount(v: &Channel, final_state: &State) -> Result<U256, ObjectiveError> {
    let initial = v.pre_fund_state()?;
    let (asset, a0, b0) = initial_balances(&initial.outcome)?;
    let sae = final_state
        .outcome
        .0
        .first()
        .ok_or(ObjectiveError::InvalidPayload)?;
    if sae.asset != asset || sae.allocations.len() < 2 {
        return Err(ObjectiveError::InvalidPayload);
    }
    let a_final = sae.allocations[0].amount;
    let b_final = sae.allocations[1].amount;
    let total = a0.checked_add(b0).ok_or(ObjectiveError::InvalidPayload)?;
    let final_total = a_final
        .checked_add(b_final)
        .ok_or(ObjectiveError::InvalidPayload)?;
    if total != final_total || b_final < b0 {
        return Err(ObjectiveError::InvalidPayload);
    }
    Ok(b_final - b0)
}

impl Objective for VirtualDefund {
    fn id(&self) -> ObjectiveId {
        ObjectiveId::new(ObjectiveKind::VirtualDefund, self.v.id)
    }

    fn status(&self) -> ObjectiveStatus {
        self.status
    }

    fn owns_channel(&self) -> Destination {
        self.v.id
    }

    fn related(&self) -> Vec<Related<'_>> {
        let mut r = vec![Related::Channel(&self.v)];
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
                &self.v.other_participants(),
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
        self.v.add_signed_state(&ss)?;
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
            let ss = self.v.sign_and_add_state(final_state, signer)?;
            self.send_to_others(&ss, &mut effects)?;
        }
        if !self.final_complete()? {
            return Ok((effects, WAITING_FOR_COMPLETE_FINAL));
        }

        let final_state = self.final_state()?;
        let sae = final_state
            .outcome
            .0
            .first()
            .ok_or(ObjectiveError::InvalidPayload)?;
        let left_amount = sae.allocations[0].amount;
        let asset = sae.asset;
        let target = self.v.id;

        let mut all_defunded = true;
        for ledger in self
            .to_my_left
            .iter_mut()
            .chain(self.to_my_right.iter_mut())
        {
            all_defunded &=
                Self::defund_ledger(ledger, target, left_amount, asset, signer, &mut effects)?;
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
    use crate::channel::consensus::Guarantee;
    use crate::channel::ChannelType;
    use crate::protocols::virtual_fund::tests::request_between;
    use rand::thread_rng;

    /// A fully opened 2-hop virtual channel between the ledger fixture's
    /// leader (payer) and a fresh Bob (payee), capacity 7/3.
    fn opened_virtual(fx: &Fixture, bob: &Signer) -> (Channel, Channel) {
        let request = request_between(&fx.leader, &fx.follower, bob);
        let initial = request.initial_state(fx.leader.address());
        let signers = [&fx.leader, &fx.follower, bob];

        let mut alice_v = Channel::new(initial.clone(), 0, ChannelType::Virtual).unwrap();
        let mut bob_v = Channel::new(initial.clone(), 2, ChannelType::Virtual).unwrap();
        for turn in [0u64, 1] {
            let mut s = initial.clone();
            s.turn_num = turn;
            let mut ss = SignedState::new(s.clone());
            for signer in signers {
                ss.add_signature(s.sign(signer).unwrap()).unwrap();
            }
            alice_v.add_signed_state(&ss).unwrap();
            bob_v.add_signed_state(&ss).unwrap();
        }
        (alice_v, bob_v)
    }

    /// A ledger between two arbitrary signers whose consensus outcome
    /// already carries the virtual channel's guarantee, seen from the
    /// follower's side.
    fn guaranteed_ledger_between(
        leader: &Signer,
        follower: &Signer,
        target: Destination,
    ) -> ConsensusChannel {
        use crate::channel::consensus::{Balance, LedgerOutcome, Vars, FOLLOWER};
        use crate::channel::state::FixedPart;

        let fp = FixedPart {
            participants: vec![leader.address(), follower.address()],
            channel_nonce: 7,
            app_definition: Address::default(),
            challenge_duration: 60,
        };
        let g = Guarantee::new(
            U256::from(10u64),
            target,
            leader.address().to_destination(),
            follower.address().to_destination(),
        );
        let outcome = vec![LedgerOutcome::new(
            Address::default(),
            Balance::new(leader.address().to_destination(), U256::from(93u64)),
            Balance::new(follower.address().to_destination(), U256::from(97u64)),
            vec![g],
        )];
        let vars = Vars {
            turn_num: 1,
            outcome: outcome.clone(),
        };
        let state = vars.as_state(&fp);
        let sigs = [state.sign(leader).unwrap(), state.sign(follower).unwrap()];
        ConsensusChannel::new(fp, FOLLOWER, 1, outcome, sigs).unwrap()
    }

    /// Installs the virtual channel's guarantee into a fresh ledger pair
    /// so defunding has something to remove.
    fn guaranteed_ledgers(
        fx: &Fixture,
        target: Destination,
    ) -> (ConsensusChannel, ConsensusChannel) {
        let (mut lc, mut fc) = fx.pair(100, 100);
        let g = Guarantee::new(
            U256::from(10u64),
            target,
            fx.leader.address().to_destination(),
            fx.follower.address().to_destination(),
        );
        let proposal = Proposal::add(lc.id, g, U256::from(7u64), Address::default());
        let sp = lc.propose(proposal.clone(), &fx.leader).unwrap();
        fc.receive(sp).unwrap();
        let counter = fc.sign_next_proposal(&proposal, &fx.follower).unwrap();
        lc.receive(counter).unwrap();
        (lc, fc)
    }

    #[test]
    fn settles_vouchers_into_final_state() {
        let fx = Fixture::new();
        let bob = Signer::random(&mut thread_rng());
        let (alice_v, _) = opened_virtual(&fx, &bob);
        let (lc, _) = guaranteed_ledgers(&fx, alice_v.id);

        let o = VirtualDefund::new(
            alice_v,
            U256::from(2u64),
            U256::zero(),
            true,
            None,
            Some(lc),
        )
        .unwrap();
        let final_state = o.final_state().unwrap();
        assert!(final_state.is_final);
        assert_eq!(final_state.turn_num, 2);
        let a = &final_state.outcome.0[0].allocations;
        assert_eq!(a[0].amount, U256::from(5u64));
        assert_eq!(a[1].amount, U256::from(5u64));
    }

    #[test]
    fn full_defund_between_payer_and_intermediary() {
        let fx = Fixture::new();
        let bob = Signer::random(&mut thread_rng());
        let (alice_v, bob_v) = opened_virtual(&fx, &bob);
        let (lc, fc) = guaranteed_ledgers(&fx, alice_v.id);
        let paid = U256::from(2u64);

        let mut alice_o =
            VirtualDefund::new(alice_v, paid, U256::zero(), true, None, Some(lc)).unwrap();

        // Alice signs and distributes the final state.
        let (effects, waiting) = alice_o.crank(&fx.leader).unwrap();
        assert_eq!(waiting, WAITING_FOR_COMPLETE_FINAL);
        assert_eq!(effects.messages_to_send.len(), 2);
        let final_ss: SignedState = effects.messages_to_send[0]
            .payload_for(&alice_o.id(), PayloadType::SignedStatePayload)
            .unwrap();

        // Bob builds his view from the payload and settles on the same
        // amount.
        let payload = ObjectivePayload::new(
            alice_o.id(),
            PayloadType::SignedStatePayload,
            &final_ss,
        )
        .unwrap();
        let bob_left = guaranteed_ledger_between(&fx.follower, &bob, alice_o.v.id);
        let mut bob_o = VirtualDefund::from_payload(
            &payload,
            true,
            bob_v,
            U256::zero(),
            Some(bob_left),
            None,
        )
        .unwrap();
        assert_eq!(bob_o.paid, paid);
        let (bob_effects, _) = bob_o.crank(&bob).unwrap();
        let bob_ss: SignedState = bob_effects.messages_to_send[0]
            .payload_for(&bob_o.id(), PayloadType::SignedStatePayload)
            .unwrap();

        // The intermediary signs it too; collect everything at Alice.
        let mut irene_ss = SignedState::new(final_ss.state().clone());
        irene_ss
            .add_signature(final_ss.state().sign(&fx.follower).unwrap())
            .unwrap();
        alice_o.v.add_signed_state(&bob_ss).unwrap();
        alice_o.v.add_signed_state(&irene_ss).unwrap();

        // Alice leads her ledger, so she emits the removal proposal.
        let (effects, waiting) = alice_o.crank(&fx.leader).unwrap();
        assert_eq!(waiting, WAITING_FOR_COMPLETE_LEDGER_DEFUNDING);
        assert_eq!(effects.proposals_to_process.len(), 1);
        let proposal = effects.proposals_to_process[0].clone();

        // Engine loopback: propose on the ledger, counterparty accepts.
        let ledger = alice_o.to_my_right.as_mut().unwrap();
        let sp = ledger.propose(proposal.clone(), &fx.leader).unwrap();
        let mut fc = fc;
        fc.receive(sp).unwrap();
        let counter = fc.sign_next_proposal(&proposal, &fx.follower).unwrap();
        ledger.receive(counter).unwrap();

        // The guarantee returns settled: leader 93+5, follower 97+5.
        let (_, waiting) = alice_o.crank(&fx.leader).unwrap();
        assert_eq!(waiting, WAITING_FOR_NOTHING);
        assert_eq!(alice_o.status, ObjectiveStatus::Completed);
        let ledger = alice_o.to_my_right.as_ref().unwrap();
        assert!(!ledger.includes_target(&alice_o.v.id));
        assert_eq!(
            ledger.consensus_vars().outcome[0].leader().amount(),
            U256::from(98u64)
        );
        assert_eq!(
            ledger.consensus_vars().outcome[0].follower().amount(),
            U256::from(102u64)
        );
    }

    #[test]
    fn refuses_final_state_below_voucher_floor() {
        let fx = Fixture::new();
        let bob = Signer::random(&mut thread_rng());
        let (alice_v, bob_v) = opened_virtual(&fx, &bob);
        let (lc, _) = guaranteed_ledgers(&fx, alice_v.id);

        let alice_o = VirtualDefund::new(
            alice_v,
            U256::from(1u64),
            U256::zero(),
            true,
            None,
            Some(lc),
        )
        .unwrap();
        let final_state = alice_o.final_state().unwrap();
        let mut ss = SignedState::new(final_state.clone());
        ss.add_signature(final_state.sign(&fx.leader).unwrap()).unwrap();
        let payload =
            ObjectivePayload::new(alice_o.id(), PayloadType::SignedStatePayload, &ss).unwrap();

        // Bob has seen a voucher for 2 but the state only settles 1.
        let bob_left = guaranteed_ledger_between(&fx.follower, &bob, alice_o.v.id);
        let err = VirtualDefund::from_payload(
            &payload,
            true,
            bob_v,
            U256::from(2u64),
            Some(bob_left),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ObjectiveError::InvalidPayload));
    }

    #[test]
    fn rejects_inflated_total() {
        let fx = Fixture::new();
        let bob = Signer::random(&mut thread_rng());
        let (alice_v, bob_v) = opened_virtual(&fx, &bob);

        let mut bad = alice_v.latest_supported_state().unwrap().state().clone();
        bad.turn_num += 1;
        bad.is_final = true;
        bad.outcome.0[0].allocations[1].amount = U256::from(50u64);
        let mut ss = SignedState::new(bad.clone());
        ss.add_signature(bad.sign(&fx.leader).unwrap()).unwrap();
        let payload = ObjectivePayload::new(
            ObjectiveId::new(ObjectiveKind::VirtualDefund, alice_v.id),
            PayloadType::SignedStatePayload,
            &ss,
        )
        .unwrap();
        let bob_left = guaranteed_ledger_between(&fx.follower, &bob, alice_v.id);
        assert!(VirtualDefund::from_payload(
            &payload,
            true,
            bob_v,
            U256::zero(),
            Some(bob_left),
            None
        )
        .is_err());
    }
}
