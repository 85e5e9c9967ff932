//! Direct defunding: close a ledger channel and withdraw on-chain.
//!
//! Two routes to finalization. The cooperative route co-signs an explicit
//! final state and concludes with it. The challenge route puts the latest
//! supported state on-chain and waits out the challenge window, and exists
//! for counterparties that have stopped responding.

use serde::{Deserialize, Serialize};

use crate::chain::ChainTransaction;
use crate::channel::consensus::ConsensusChannel;
use crate::channel::state::SignedState;
use crate::channel::{Channel, ChannelMode, ChannelType};
use crate::sig::Signer;
use crate::types::{Address, Destination};

use super::messages::{Message, ObjectivePayload, PayloadType};
use super::{
    Objective, ObjectiveError, ObjectiveId, ObjectiveKind, ObjectiveStatus, Related, SideEffects,
    WaitingFor, WAITING_FOR_NOTHING,
};

pub const WAITING_FOR_FINALIZATION: WaitingFor = WaitingFor("WaitingForFinalization");
pub const WAITING_FOR_WITHDRAW: WaitingFor = WaitingFor("WaitingForWithdraw");

/// API request to close a ledger channel, optionally via on-chain
/// challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectiveRequest {
    pub channel_id: Destination,
    pub is_challenge: bool,
}

impl ObjectiveRequest {
    pub fn id(&self) -> ObjectiveId {
        ObjectiveId::new(ObjectiveKind::DirectDefund, self.channel_id)
    }
}

/// Reconstitutes a plain channel from a consensus channel so the final
/// on-chain race runs over ordinary signed states. Also used by the
/// bridged defund variants.
pub(crate) fn channel_from_consensus(
    cc: &ConsensusChannel,
) -> Result<Channel, ObjectiveError> {
    let supported = cc.supported_signed_state();
    let mut c = Channel::new(
        supported.state().clone(),
        cc.my_index,
        ChannelType::Ledger,
    )?;
    c.add_signed_state(&supported)?;
    c.on_chain.holdings = cc.on_chain_funding.clone();
    Ok(c)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectDefund {
    pub status: ObjectiveStatus,
    pub channel: Channel,
    final_turn_num: u64,
    pub is_challenge: bool,
    /// Virtual channels which were funded by this ledger at the time the
    /// defund started; a challenge against any of them cascades.
    pub funded_channels: Vec<Destination>,
    withdraw_transaction_submitted: bool,
    challenge_transaction_submitted: bool,
}

impl DirectDefund {
    /// Builds the objective from a local close request. The ledger must be
    /// quiescent: no queued proposals and no live guarantees.
    pub fn new(
        request: &ObjectiveRequest,
        preapprove: bool,
        cc: &ConsensusChannel,
    ) -> Result<Self, ObjectiveError> {
        if !cc.proposal_queue().is_empty() {
            return Err(ObjectiveError::PendingProposals);
        }
        let funded_channels = cc.funding_targets();
        if !funded_channels.is_empty() && !request.is_challenge {
            return Err(ObjectiveError::LedgerStillFunding);
        }
        let channel = channel_from_consensus(cc)?;
        let final_turn_num = cc.consensus_turn_num() + 1;
        Ok(DirectDefund {
            status: if preapprove {
                ObjectiveStatus::Approved
            } else {
                ObjectiveStatus::Unapproved
            },
            channel,
            final_turn_num,
            is_challenge: request.is_challenge,
            funded_channels,
            withdraw_transaction_submitted: false,
            challenge_transaction_submitted: false,
        })
    }

    /// Builds the objective from a counterparty's final-state payload.
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
            is_challenge: false,
        };
        let mut o = DirectDefund::new(&request, preapprove, cc)?;
        o.final_turn_num = ss.state().turn_num;
        o.channel.add_signed_state(&ss)?;
        Ok(o)
    }

    fn final_state_signed_by_me(&self) -> bool {
        self.channel
            .signed_state_for_turn(self.final_turn_num)
            .map(|ss| {
                ss.state().is_final && ss.has_signature_for(self.channel.my_index)
            })
            .unwrap_or(false)
    }

    fn final_state_complete(&self) -> bool {
        self.channel
            .signed_state_for_turn(self.final_turn_num)
            .map(|ss| ss.state().is_final && ss.has_all_signatures())
            .unwrap_or(false)
    }

    pub fn clear_transaction_submitted(&mut self) {
        self.withdraw_transaction_submitted = false;
        self.challenge_transaction_submitted = false;
    }

    fn crank_challenge(
        &mut self,
        signer: &Signer,
    ) -> Result<(SideEffects, WaitingFor), ObjectiveError> {
        let mut effects = SideEffects::default();
        match self.channel.channel_mode {
            ChannelMode::Open => {
                if !self.challenge_transaction_submitted {
                    let candidate = self.channel.latest_supported_state()?.clone();
                    let challenger_sig = candidate.state().sign(signer)?;
                    effects.transactions_to_submit.push(ChainTransaction::Challenge {
                        channel_id: self.channel.id,
                        candidate,
                        challenger_sig,
                    });
                    self.challenge_transaction_submitted = true;
                    self.channel.is_challenge_initiated_by_me = true;
                }
                Ok((effects, WAITING_FOR_FINALIZATION))
            }
            ChannelMode::Challenge => Ok((effects, WAITING_FOR_FINALIZATION)),
            ChannelMode::Finalized => {
                if self.channel.on_chain.holdings.is_non_zero() {
                    if !self.withdraw_transaction_submitted {
                        let signed_state = self.channel.latest_supported_state()?.clone();
                        effects
                            .transactions_to_submit
                            .push(ChainTransaction::TransferAllAssets {
                                channel_id: self.channel.id,
                                signed_state,
                            });
                        self.withdraw_transaction_submitted = true;
                    }
                    return Ok((effects, WAITING_FOR_WITHDRAW));
                }
                self.status = ObjectiveStatus::Completed;
                Ok((effects, WAITING_FOR_NOTHING))
            }
        }
    }
}

impl Objective for DirectDefund {
    fn id(&self) -> ObjectiveId {
        ObjectiveId::new(ObjectiveKind::DirectDefund, self.channel.id)
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

        if self.is_challenge {
            return self.crank_challenge(signer);
        }

        let mut effects = SideEffects::default();

        if !self.final_state_signed_by_me() {
            let mut final_state = self.channel.latest_supported_state()?.state().clone();
            final_state.turn_num = self.final_turn_num;
            final_state.is_final = true;
            let ss = self.channel.sign_and_add_state(final_state, signer)?;
            effects.messages_to_send.extend(Message::for_objective(
                self.channel.my_address(),
                &self.channel.other_participants(),
                self.id(),
                PayloadType::SignedStatePayload,
                &ss,
            )?);
        }
        if !self.final_state_complete() {
            return Ok((effects, WAITING_FOR_FINALIZATION));
        }

        if self.channel.on_chain.holdings.is_non_zero() {
            if !self.withdraw_transaction_submitted {
                let signed_state = self
                    .channel
                    .signed_state_for_turn(self.final_turn_num)
                    .ok_or(ObjectiveError::NoFinalState)?
                    .clone();
                effects
                    .transactions_to_submit
                    .push(ChainTransaction::WithdrawAll {
                        channel_id: self.channel.id,
                        signed_state,
                    });
                self.withdraw_transaction_submitted = true;
            }
            return Ok((effects, WAITING_FOR_WITHDRAW));
        }

        self.status = ObjectiveStatus::Completed;
        Ok((effects, WAITING_FOR_NOTHING))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::{ChainEvent, EventMeta};
    use crate::channel::consensus::tests::Fixture;
    use crate::channel::consensus::{Guarantee, Proposal, LEADER};
    use crate::types::{Address, U256};

    pub(crate) fn funded_pair(fx: &Fixture) -> ConsensusChannel {
        let (mut lc, _) = fx.pair(100, 100);
        lc.on_chain_funding =
            crate::types::Funds::single(Address::default(), U256::from(200u64));
        lc
    }

    fn holdings_event(c: &Channel, amount: u64) -> ChainEvent {
        ChainEvent::AllocationUpdated {
            meta: EventMeta {
                channel_id: c.id,
                block_num: c.latest_block_num + 1,
                block_timestamp: 0,
            },
            asset: Address::default(),
            now_held: U256::from(amount),
        }
    }

    #[test]
    fn refuses_busy_ledger() {
        let fx = Fixture::new();
        let (mut lc, _) = fx.pair(100, 100);
        let g = Guarantee::new(
            U256::from(5u64),
            Destination([0x77; 32]),
            fx.leader.address().to_destination(),
            fx.follower.address().to_destination(),
        );
        lc.propose(
            Proposal::add(lc.id, g, U256::from(5u64), Address::default()),
            &fx.leader,
        )
        .unwrap();
        let request = ObjectiveRequest {
            channel_id: lc.id,
            is_challenge: false,
        };
        assert!(matches!(
            DirectDefund::new(&request, true, &lc),
            Err(ObjectiveError::PendingProposals)
        ));
    }

    #[test]
    fn cooperative_close() {
        let fx = Fixture::new();
        let lc = funded_pair(&fx);
        let request = ObjectiveRequest {
            channel_id: lc.id,
            is_challenge: false,
        };
        let mut o = DirectDefund::new(&request, true, &lc).unwrap();

        // Sign and send the final state.
        let (effects, waiting) = o.crank(&fx.leader).unwrap();
        assert_eq!(waiting, WAITING_FOR_FINALIZATION);
        assert_eq!(effects.messages_to_send.len(), 1);
        let sent: SignedState = effects.messages_to_send[0]
            .payload_for(&o.id(), PayloadType::SignedStatePayload)
            .unwrap();
        assert!(sent.state().is_final);
        assert_eq!(sent.state().turn_num, 2);

        // Counterparty constructs its own objective from that payload and
        // counter-signs.
        let payload = ObjectivePayload::new(o.id(), PayloadType::SignedStatePayload, &sent).unwrap();
        let follower_cc = {
            let (_, fc) = fx.pair(100, 100);
            fc
        };
        let mut their = DirectDefund::from_payload(&payload, true, &follower_cc).unwrap();
        let (their_effects, _) = their.crank(&fx.follower).unwrap();
        let countersigned: SignedState = their_effects.messages_to_send[0]
            .payload_for(&their.id(), PayloadType::SignedStatePayload)
            .unwrap();

        let payload =
            ObjectivePayload::new(o.id(), PayloadType::SignedStatePayload, &countersigned)
                .unwrap();
        o.update(&payload).unwrap();

        // Fully signed final state: withdraw.
        let (effects, waiting) = o.crank(&fx.leader).unwrap();
        assert_eq!(waiting, WAITING_FOR_WITHDRAW);
        assert!(matches!(
            effects.transactions_to_submit[0],
            ChainTransaction::WithdrawAll { .. }
        ));

        // Withdraw not yet mined: no duplicate transaction.
        let (effects, waiting) = o.crank(&fx.leader).unwrap();
        assert_eq!(waiting, WAITING_FOR_WITHDRAW);
        assert!(effects.transactions_to_submit.is_empty());

        // Holdings empty out: complete.
        let ev = holdings_event(&o.channel, 0);
        o.channel.update_with_chain_event(&ev).unwrap();
        let (_, waiting) = o.crank(&fx.leader).unwrap();
        assert_eq!(waiting, WAITING_FOR_NOTHING);
        assert_eq!(o.status, ObjectiveStatus::Completed);
    }

    #[test]
    fn challenge_close() {
        let fx = Fixture::new();
        let lc = funded_pair(&fx);
        let request = ObjectiveRequest {
            channel_id: lc.id,
            is_challenge: true,
        };
        let mut o = DirectDefund::new(&request, true, &lc).unwrap();

        let (effects, waiting) = o.crank(&fx.leader).unwrap();
        assert_eq!(waiting, WAITING_FOR_FINALIZATION);
        assert!(matches!(
            effects.transactions_to_submit[0],
            ChainTransaction::Challenge { .. }
        ));
        assert!(o.channel.is_challenge_initiated_by_me);

        // Challenge registered on-chain.
        let candidate = o.channel.latest_supported_state().unwrap().clone();
        o.channel
            .update_with_chain_event(&ChainEvent::ChallengeRegistered {
                meta: EventMeta {
                    channel_id: o.channel.id,
                    block_num: 5,
                    block_timestamp: 100,
                },
                candidate,
                finalizes_at: 160,
            })
            .unwrap();
        let (_, waiting) = o.crank(&fx.leader).unwrap();
        assert_eq!(waiting, WAITING_FOR_FINALIZATION);

        // The block tick passes the deadline.
        o.channel.update_channel_mode(160);
        assert_eq!(o.channel.channel_mode, ChannelMode::Finalized);
        let (effects, waiting) = o.crank(&fx.leader).unwrap();
        assert_eq!(waiting, WAITING_FOR_WITHDRAW);
        assert!(matches!(
            effects.transactions_to_submit[0],
            ChainTransaction::TransferAllAssets { .. }
        ));

        let ev = holdings_event(&o.channel, 0);
        o.channel.update_with_chain_event(&ev).unwrap();
        let (_, waiting) = o.crank(&fx.leader).unwrap();
        assert_eq!(waiting, WAITING_FOR_NOTHING);
    }
}
