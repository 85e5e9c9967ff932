//! Virtual funding: open an N-party payment channel whose capacity is a
//! chain of guarantees through the adjacent ledger channels.
//!
//! Participant 0 (the payer) and the last participant (the payee) each
//! have one neighboring ledger; intermediaries have two. A connection is
//! funded once its ledger's consensus outcome includes the expected
//! guarantee targeting the virtual channel.

use serde::{Deserialize, Serialize};

use crate::channel::consensus::{Guarantee, Proposal};
use crate::channel::consensus::ConsensusChannel;
use crate::channel::outcome::Exit;
use crate::channel::state::{SignedState, State};
use crate::channel::{Channel, ChannelType};
use crate::sig::Signer;
use crate::types::{Address, Destination, U256};

use super::messages::{Message, ObjectivePayload, PayloadType};
use super::{
    Objective, ObjectiveError, ObjectiveId, ObjectiveKind, ObjectiveStatus, Related, SideEffects,
    WaitingFor, WAITING_FOR_NOTHING,
};

pub const WAITING_FOR_COMPLETE_PREFUND: WaitingFor = WaitingFor("WaitingForCompletePrefund");
pub const WAITING_FOR_COMPLETE_FUNDING: WaitingFor = WaitingFor("WaitingForCompleteFunding");
pub const WAITING_FOR_COMPLETE_POSTFUND: WaitingFor = WaitingFor("WaitingForCompletePostFund");

/// API request to open a virtual channel through zero or more
/// intermediaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectiveRequest {
    pub intermediaries: Vec<Address>,
    pub counterparty: Address,
    pub challenge_duration: u64,
    pub outcome: Exit,
    pub app_definition: Address,
    pub nonce: u64,
}

impl ObjectiveRequest {
    pub fn initial_state(&self, me: Address) -> State {
        let mut participants = vec![me];
        participants.extend_from_slice(&self.intermediaries);
        participants.push(self.counterparty);
        State {
            participants,
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
        ObjectiveId::new(ObjectiveKind::VirtualFund, cid)
    }
}

/// One adjacent ledger channel, together with the guarantee this virtual
/// channel expects it to carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub channel: ConsensusChannel,
    pub expected_guarantee: Guarantee,
    /// What the "left" (payer-side) ledger participant deposits into the
    /// guarantee; the right participant funds the remainder.
    pub left_deposit: U256,
    pub asset: Address,
}

impl Connection {
    /// Wires up a ledger between `left_addr` and `right_addr` funding the
    /// virtual channel `target` with `amount`, of which the left side
    /// deposits `left_deposit`.
    pub fn new(
        channel: ConsensusChannel,
        target: Destination,
        left_addr: Address,
        right_addr: Address,
        amount: U256,
        left_deposit: U256,
        asset: Address,
    ) -> Self {
        let expected_guarantee = Guarantee::new(
            amount,
            target,
            left_addr.to_destination(),
            right_addr.to_destination(),
        );
        Connection {
            channel,
            expected_guarantee,
            left_deposit,
            asset,
        }
    }

    pub fn funded(&self) -> bool {
        self.channel.includes(&self.expected_guarantee, self.asset)
    }

    pub fn expected_proposal(&self) -> Proposal {
        Proposal::add(
            self.channel.id,
            self.expected_guarantee.clone(),
            self.left_deposit,
            self.asset,
        )
    }

    /// Advances this connection toward carrying the expected guarantee.
    /// The ledger leader proposes through the engine loopback; the
    /// follower counter-signs the queue head once it shows up.
    pub fn crank(
        &mut self,
        signer: &Signer,
        effects: &mut SideEffects,
    ) -> Result<bool, ObjectiveError> {
        if self.funded() {
            return Ok(true);
        }
        if self.channel.is_leader() {
            if !self
                .channel
                .is_proposed(&self.expected_guarantee, self.asset)?
            {
                effects.proposals_to_process.push(self.expected_proposal());
            }
        } else if self
            .channel
            .is_proposed_next(&self.expected_guarantee, self.asset)?
        {
            let sp = self
                .channel
                .sign_next_proposal(&self.expected_proposal(), signer)?;
            effects.messages_to_send.push(Message::for_proposals(
                self.channel.my_address(),
                self.channel.counterparty(),
                vec![sp],
            ));
            return Ok(self.funded());
        }
        Ok(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualFund {
    pub status: ObjectiveStatus,
    /// The virtual channel being opened.
    pub v: Channel,
    pub to_my_left: Option<Connection>,
    pub to_my_right: Option<Connection>,
    /// Our position in the participant chain; 0 is the payer.
    pub my_role: usize,
}

/// Amounts the payer and payee bring in, read off the initial outcome.
/// Virtual channels are single-asset.
pub(crate) fn initial_balances(outcome: &Exit) -> Result<(Address, U256, U256), ObjectiveError> {
    let sae = outcome.0.first().ok_or(ObjectiveError::InvalidPayload)?;
    if sae.allocations.len() < 2 {
        return Err(ObjectiveError::InvalidPayload);
    }
    Ok((
        sae.asset,
        sae.allocations[0].amount,
        sae.allocations[1].amount,
    ))
}

impl VirtualFund {
    /// Builds the payer-side objective. `right_ledger` is the consensus
    /// channel shared with the first intermediary (or with the payee when
    /// there are no intermediaries).
    pub fn new(
        request: &ObjectiveRequest,
        preapprove: bool,
        me: Address,
        right_ledger: ConsensusChannel,
    ) -> Result<Self, ObjectiveError> {
        let initial = request.initial_state(me);
        let v = Channel::new(initial, 0, ChannelType::Virtual)?;
        Self::from_channel(v, preapprove, None, Some(right_ledger))
    }

    /// Builds the objective on first sight of a prefund payload, at an
    /// intermediary or the payee. The engine passes the adjacent ledgers
    /// it holds with the previous and next hop.
    pub fn from_payload(
        payload: &ObjectivePayload,
        preapprove: bool,
        me: Address,
        left_ledger: Option<ConsensusChannel>,
        right_ledger: Option<ConsensusChannel>,
    ) -> Result<Self, ObjectiveError> {
        let ss: SignedState = payload.decode(PayloadType::SignedStatePayload)?;
        let initial = ss.state().clone();
        let my_index = initial
            .participants
            .iter()
            .position(|&p| p == me)
            .ok_or(ObjectiveError::NotAParticipant(me))?;
        let mut v = Channel::new(initial, my_index, ChannelType::Virtual)?;
        v.add_signed_state(&ss)?;
        Self::from_channel(v, preapprove, left_ledger, right_ledger)
    }

    fn from_channel(
        v: Channel,
        preapprove: bool,
        left_ledger: Option<ConsensusChannel>,
        right_ledger: Option<ConsensusChannel>,
    ) -> Result<Self, ObjectiveError> {
        let my_role = v.my_index;
        let participants = v.participants().to_vec();
        let last = participants.len() - 1;
        let initial = v
            .pre_fund_state()?;
        let (asset, a0, b0) = initial_balances(&initial.outcome)?;
        let amount = a0
            .checked_add(b0)
            .ok_or(ObjectiveError::InvalidPayload)?;

        if my_role == 0 && left_ledger.is_some() {
            return Err(ObjectiveError::InvalidPayload);
        }
        if my_role == last && right_ledger.is_some() {
            return Err(ObjectiveError::InvalidPayload);
        }

        let to_my_left = match left_ledger {
            Some(cc) => Some(Connection::new(
                cc,
                v.id,
                participants[my_role - 1],
                participants[my_role],
                amount,
                a0,
                asset,
            )),
            None if my_role == 0 => None,
            None => return Err(ObjectiveError::InvalidPayload),
        };
        let to_my_right = match right_ledger {
            Some(cc) => Some(Connection::new(
                cc,
                v.id,
                participants[my_role],
                participants[my_role + 1],
                amount,
                a0,
                asset,
            )),
            None if my_role == last => None,
            None => return Err(ObjectiveError::InvalidPayload),
        };

        Ok(VirtualFund {
            status: if preapprove {
                ObjectiveStatus::Approved
            } else {
                ObjectiveStatus::Unapproved
            },
            v,
            to_my_left,
            to_my_right,
            my_role,
        })
    }

    /// The payer and payee addresses, used for voucher registration.
    pub fn payer(&self) -> Address {
        self.v.participants()[0]
    }

    pub fn payee(&self) -> Address {
        *self
            .v
            .participants()
            .last()
            .expect("validated channels have participants")
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

    fn connections_mut(&mut self) -> Vec<&mut Connection> {
        self.to_my_left
            .iter_mut()
            .chain(self.to_my_right.iter_mut())
            .collect()
    }
}

impl Objective for VirtualFund {
    fn id(&self) -> ObjectiveId {
        ObjectiveId::new(ObjectiveKind::VirtualFund, self.v.id)
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
            r.push(Related::Consensus(&c.channel));
        }
        if let Some(c) = &self.to_my_right {
            r.push(Related::Consensus(&c.channel));
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

        if !self.v.pre_fund_signed_by_me() {
            let prefund = self.v.pre_fund_state()?;
            let ss = self.v.sign_and_add_state(prefund, signer)?;
            self.send_to_others(&ss, &mut effects)?;
        }
        if !self.v.pre_fund_complete() {
            return Ok((effects, WAITING_FOR_COMPLETE_PREFUND));
        }

        let mut all_funded = true;
        for conn in self.connections_mut() {
            all_funded &= conn.crank(signer, &mut effects)?;
        }
        if !all_funded {
            return Ok((effects, WAITING_FOR_COMPLETE_FUNDING));
        }

        if !self.v.post_fund_signed_by_me() {
            let postfund = self.v.post_fund_state()?;
            let ss = self.v.sign_and_add_state(postfund, signer)?;
            self.send_to_others(&ss, &mut effects)?;
        }
        if !self.v.post_fund_complete() {
            return Ok((effects, WAITING_FOR_COMPLETE_POSTFUND));
        }

        self.status = ObjectiveStatus::Completed;
        Ok((effects, WAITING_FOR_NOTHING))
    }
}
