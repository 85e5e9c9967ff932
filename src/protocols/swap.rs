//! A single atomic exchange inside an open swap channel. The objective
//! owns no channel; the swap record itself, once signed by both parties,
//! is the unit of agreement and lands in the channel's bounded history.

use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::payments::swaps::Swap;
use crate::sig::Signer;
use crate::types::{Address, Destination, U256};

use super::messages::{Message, ObjectivePayload, PayloadType};
use super::{
    Objective, ObjectiveError, ObjectiveId, ObjectiveKind, ObjectiveStatus, Related, SideEffects,
    WaitingFor, WAITING_FOR_NOTHING,
};

pub const WAITING_FOR_CONFIRMATION: WaitingFor = WaitingFor("WaitingForSwapConfirmation");

/// The counterparty's answer to a proposed swap, delivered through the
/// ConfirmSwap API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapDecision {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapObjective {
    pub status: ObjectiveStatus,
    pub swap: Swap,
    /// The swap channel the exchange runs over. Referenced, not owned.
    pub c: Channel,
    /// Participant index of the party who proposed the swap.
    pub proposer_index: usize,
    /// Set on the receiving side once ConfirmSwap arrives.
    pub decision: Option<SwapDecision>,
}

/// Applies the exchange to the proposer's and receiver's allocations in
/// the channel's latest supported outcome, failing if any balance would
/// go negative.
fn check_balances(
    c: &Channel,
    swap: &Swap,
    proposer_index: usize,
) -> Result<(), ObjectiveError> {
    let state = c.latest_supported_state()?.state();
    let receiver_index = 1 - proposer_index;
    let balance_of = |asset: Address, index: usize| -> Result<U256, ObjectiveError> {
        let sae = state
            .outcome
            .0
            .iter()
            .find(|sae| sae.asset == asset)
            .ok_or(ObjectiveError::InvalidSwap)?;
        sae.allocations
            .get(index)
            .map(|a| a.amount)
            .ok_or(ObjectiveError::InvalidSwap)
    };
    // The proposer pays amount_in; the receiver pays amount_out.
    let proposer_in = balance_of(swap.exchange.token_in, proposer_index)?;
    if proposer_in < swap.exchange.amount_in {
        return Err(ObjectiveError::InvalidSwap);
    }
    let receiver_out = balance_of(swap.exchange.token_out, receiver_index)?;
    if receiver_out < swap.exchange.amount_out {
        return Err(ObjectiveError::InvalidSwap);
    }
    Ok(())
}

impl SwapObjective {
    /// Builds the proposer-side objective.
    pub fn new(swap: Swap, c: Channel, preapprove: bool) -> Result<Self, ObjectiveError> {
        if swap.channel_id != c.id {
            return Err(ObjectiveError::InvalidSwap);
        }
        let proposer_index = c.my_index;
        check_balances(&c, &swap, proposer_index)?;
        Ok(SwapObjective {
            status: if preapprove {
                ObjectiveStatus::Approved
            } else {
                ObjectiveStatus::Unapproved
            },
            swap,
            c,
            proposer_index,
            decision: None,
        })
    }

    /// Builds the receiving-side objective from an inbound swap payload.
    /// The proposer's signature must already be on the swap.
    pub fn from_payload(
        payload: &ObjectivePayload,
        preapprove: bool,
        c: Channel,
    ) -> Result<Self, ObjectiveError> {
        let swap: Swap = payload.decode(PayloadType::SignedSwapPayload)?;
        if swap.channel_id != c.id {
            return Err(ObjectiveError::InvalidSwap);
        }
        let proposer_index = 1 - c.my_index;
        let recovered = swap
            .signer_of(proposer_index)
            .ok_or(ObjectiveError::InvalidSwap)?
            .map_err(ObjectiveError::Sig)?;
        if recovered != c.participants()[proposer_index] {
            return Err(ObjectiveError::InvalidSwap);
        }
        check_balances(&c, &swap, proposer_index)?;
        Ok(SwapObjective {
            status: if preapprove {
                ObjectiveStatus::Approved
            } else {
                ObjectiveStatus::Unapproved
            },
            swap,
            c,
            proposer_index,
            decision: None,
        })
    }

    pub fn is_proposer(&self) -> bool {
        self.c.my_index == self.proposer_index
    }

    /// Records the local party's answer; only meaningful on the
    /// receiving side.
    pub fn confirm(&mut self, decision: SwapDecision) {
        if !self.is_proposer() && self.decision.is_none() {
            self.decision = Some(decision);
        }
    }

    fn both_signed(&self) -> Result<bool, ObjectiveError> {
        for index in [self.proposer_index, 1 - self.proposer_index] {
            match self.swap.signer_of(index) {
                Some(Ok(addr)) if addr == self.c.participants()[index] => {}
                Some(Ok(_)) => return Err(ObjectiveError::InvalidSwap),
                Some(Err(e)) => return Err(ObjectiveError::Sig(e)),
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    fn counterparty(&self) -> Address {
        self.c.participants()[1 - self.c.my_index]
    }

    fn send_swap(&self, effects: &mut SideEffects) -> Result<(), ObjectiveError> {
        effects.messages_to_send.extend(Message::for_objective(
            self.c.my_address(),
            &[self.counterparty()],
            self.id(),
            PayloadType::SignedSwapPayload,
            &self.swap,
        )?);
        Ok(())
    }
}

/// Resolves two concurrently proposed swaps on the same channel: the
/// smaller fingerprint proceeds. Evaluated by the participant at index 0.
pub fn swap_takes_priority(
    mine: &Swap,
    my_address: Address,
    theirs: &Swap,
    their_address: Address,
) -> bool {
    mine.fingerprint(my_address) <= theirs.fingerprint(their_address)
}

impl Objective for SwapObjective {
    fn id(&self) -> ObjectiveId {
        ObjectiveId::new(ObjectiveKind::Swap, self.swap.id)
    }

    fn status(&self) -> ObjectiveStatus {
        self.status
    }

    fn owns_channel(&self) -> Destination {
        Destination::default()
    }

    fn related(&self) -> Vec<Related<'_>> {
        vec![Related::Channel(&self.c)]
    }

    fn approve(&mut self) {
        if self.status == ObjectiveStatus::Unapproved {
            self.status = ObjectiveStatus::Approved;
        }
    }

    fn reject(&mut self, me: Address) -> SideEffects {
        self.status = ObjectiveStatus::Rejected;
        SideEffects {
            messages_to_send: Message::rejection_notice(me, &[self.counterparty()], self.id()),
            ..SideEffects::default()
        }
    }

    fn update(&mut self, payload: &ObjectivePayload) -> Result<(), ObjectiveError> {
        if payload.objective_id != self.id() {
            return Err(ObjectiveError::WrongKind(payload.objective_id.clone()));
        }
        let swap: Swap = payload.decode(PayloadType::SignedSwapPayload)?;
        if swap.id != self.swap.id {
            return Err(ObjectiveError::InvalidSwap);
        }
        // Adopt any signatures we have not seen.
        for (index, sig) in swap.sigs {
            self.swap.sigs.entry(index).or_insert(sig);
        }
        Ok(())
    }

    fn crank(&mut self, signer: &Signer) -> Result<(SideEffects, WaitingFor), ObjectiveError> {
        if self.status == ObjectiveStatus::Completed
            || self.status == ObjectiveStatus::Rejected
        {
            return Ok((SideEffects::default(), WAITING_FOR_NOTHING));
        }
        if self.status != ObjectiveStatus::Approved {
            return Err(ObjectiveError::NotApproved);
        }
        let mut effects = SideEffects::default();
        let my_index = self.c.my_index;

        if self.is_proposer() {
            if !self.swap.sigs.contains_key(&my_index) {
                self.swap.sign(my_index, signer)?;
                self.send_swap(&mut effects)?;
            }
            if !self.both_signed()? {
                return Ok((effects, WAITING_FOR_CONFIRMATION));
            }
            self.status = ObjectiveStatus::Completed;
            return Ok((effects, WAITING_FOR_NOTHING));
        }

        match self.decision {
            None => Ok((effects, WAITING_FOR_CONFIRMATION)),
            Some(SwapDecision::Rejected) => {
                let me = self.c.my_address();
                Ok((self.reject(me), WAITING_FOR_NOTHING))
            }
            Some(SwapDecision::Accepted) => {
                if !self.swap.sigs.contains_key(&my_index) {
                    self.swap.sign(my_index, signer)?;
                    self.send_swap(&mut effects)?;
                }
                self.status = ObjectiveStatus::Completed;
                Ok((effects, WAITING_FOR_NOTHING))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::consensus::tests::Fixture;
    use crate::channel::state::SignedState;
    use crate::channel::ChannelType;
    use crate::payments::swaps::Exchange;
    use crate::protocols::swap_fund::tests::two_asset_request;

    /// An open two-asset swap channel between the fixture participants,
    /// seen from both sides.
    fn open_swap_channel(fx: &Fixture) -> (Channel, Channel) {
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

    fn exchange(amount_in: u64, amount_out: u64) -> Exchange {
        Exchange {
            token_in: Address::default(),
            token_out: Address([0x02; 20]),
            amount_in: U256::from(amount_in),
            amount_out: U256::from(amount_out),
        }
    }

    #[test]
    fn accepted_swap_collects_both_signatures() {
        let fx = Fixture::new();
        let (a_chan, b_chan) = open_swap_channel(&fx);
        let swap = Swap::new(a_chan.id, exchange(2, 1), 1);

        let mut proposer = SwapObjective::new(swap, a_chan, true).unwrap();
        let (effects, waiting) = proposer.crank(&fx.leader).unwrap();
        assert_eq!(waiting, WAITING_FOR_CONFIRMATION);
        assert_eq!(effects.messages_to_send.len(), 1);
        let payload = effects.messages_to_send[0].objective_payloads[0].clone();

        let mut receiver = SwapObjective::from_payload(&payload, true, b_chan).unwrap();
        assert!(!receiver.is_proposer());
        let (_, waiting) = receiver.crank(&fx.follower).unwrap();
        assert_eq!(waiting, WAITING_FOR_CONFIRMATION);

        receiver.confirm(SwapDecision::Accepted);
        let (effects, waiting) = receiver.crank(&fx.follower).unwrap();
        assert_eq!(waiting, WAITING_FOR_NOTHING);
        assert_eq!(receiver.status, ObjectiveStatus::Completed);
        let counter = effects.messages_to_send[0].objective_payloads[0].clone();

        proposer.update(&counter).unwrap();
        let (_, waiting) = proposer.crank(&fx.leader).unwrap();
        assert_eq!(waiting, WAITING_FOR_NOTHING);
        assert_eq!(proposer.status, ObjectiveStatus::Completed);
    }

    #[test]
    fn rejected_swap_notifies_the_proposer() {
        let fx = Fixture::new();
        let (a_chan, b_chan) = open_swap_channel(&fx);
        let swap = Swap::new(a_chan.id, exchange(2, 1), 1);

        let mut proposer = SwapObjective::new(swap, a_chan, true).unwrap();
        let (effects, _) = proposer.crank(&fx.leader).unwrap();
        let payload = effects.messages_to_send[0].objective_payloads[0].clone();

        let mut receiver = SwapObjective::from_payload(&payload, true, b_chan).unwrap();
        receiver.confirm(SwapDecision::Rejected);
        let (effects, _) = receiver.crank(&fx.follower).unwrap();
        assert_eq!(receiver.status, ObjectiveStatus::Rejected);
        assert_eq!(effects.messages_to_send.len(), 1);
        assert_eq!(
            effects.messages_to_send[0].rejected_objectives,
            vec![receiver.id()]
        );
    }

    #[test]
    fn overdrawn_swap_is_invalid() {
        let fx = Fixture::new();
        let (a_chan, _) = open_swap_channel(&fx);
        // The proposer only holds 6 of the first asset.
        let swap = Swap::new(a_chan.id, exchange(7, 1), 1);
        let err = SwapObjective::new(swap, a_chan, true).unwrap_err();
        assert!(matches!(err, ObjectiveError::InvalidSwap));
    }

    #[test]
    fn concurrent_proposals_resolve_by_fingerprint() {
        let fx = Fixture::new();
        let (a_chan, _) = open_swap_channel(&fx);
        let mine = Swap::new(a_chan.id, exchange(2, 1), 1);
        let theirs = Swap::new(a_chan.id, exchange(1, 2), 2);
        let me = fx.leader.address();
        let them = fx.follower.address();
        // Exactly one of the two proposals wins.
        assert_ne!(
            swap_takes_priority(&mine, me, &theirs, them),
            swap_takes_priority(&theirs, them, &mine, me)
        );
    }
}
