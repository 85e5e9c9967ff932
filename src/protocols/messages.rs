//! The engine-to-engine wire message.
//!
//! Serialization is JSON. Ledger proposals are packed in ascending turn
//! order and receivers rely on that; see the consensus channel's ordering
//! rules.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::channel::consensus::SignedProposal;
use crate::payments::Voucher;
use crate::types::Address;

use super::{ObjectiveError, ObjectiveId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadType {
    SignedStatePayload,
    RequestFinalStatePayload,
    SignedSwapPayload,
}

/// An opaque payload addressed to one objective. The engine routes it by
/// ID; the objective decodes it by type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectivePayload {
    pub objective_id: ObjectiveId,
    pub payload_type: PayloadType,
    pub payload_data: Vec<u8>,
}

impl ObjectivePayload {
    pub fn new<T: Serialize>(
        objective_id: ObjectiveId,
        payload_type: PayloadType,
        payload: &T,
    ) -> Result<Self, ObjectiveError> {
        Ok(ObjectivePayload {
            objective_id,
            payload_type,
            payload_data: serde_json::to_vec(payload)?,
        })
    }

    /// Decodes the payload, checking the declared type first.
    pub fn decode<T: DeserializeOwned>(
        &self,
        expected: PayloadType,
    ) -> Result<T, ObjectiveError> {
        if self.payload_type != expected {
            return Err(ObjectiveError::InvalidPayload);
        }
        Ok(serde_json::from_slice(&self.payload_data)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub to: Address,
    pub from: Address,
    #[serde(default)]
    pub objective_payloads: Vec<ObjectivePayload>,
    /// Sorted ascending by turn number.
    #[serde(default)]
    pub ledger_proposals: Vec<SignedProposal>,
    #[serde(default)]
    pub payments: Vec<Voucher>,
    #[serde(default)]
    pub rejected_objectives: Vec<ObjectiveId>,
}

impl Message {
    pub fn serialize(&self) -> Result<String, ObjectiveError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn deserialize(raw: &str) -> Result<Message, ObjectiveError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// One message per recipient carrying the same objective payload.
    pub fn for_objective<T: Serialize>(
        from: Address,
        recipients: &[Address],
        objective_id: ObjectiveId,
        payload_type: PayloadType,
        payload: &T,
    ) -> Result<Vec<Message>, ObjectiveError> {
        let p = ObjectivePayload::new(objective_id, payload_type, payload)?;
        Ok(recipients
            .iter()
            .map(|&to| Message {
                to,
                from,
                objective_payloads: vec![p.clone()],
                ..Message::default()
            })
            .collect())
    }

    /// A message carrying signed ledger proposals. The caller supplies the
    /// proposals in queue order; ascending turn numbers are asserted here
    /// rather than re-sorted.
    pub fn for_proposals(
        from: Address,
        to: Address,
        proposals: Vec<SignedProposal>,
    ) -> Message {
        debug_assert!(proposals.windows(2).all(|w| w[0].turn_num < w[1].turn_num));
        Message {
            to,
            from,
            ledger_proposals: proposals,
            ..Message::default()
        }
    }

    pub fn for_voucher(from: Address, to: Address, voucher: Voucher) -> Message {
        Message {
            to,
            from,
            payments: vec![voucher],
            ..Message::default()
        }
    }

    pub fn rejection_notice(
        from: Address,
        recipients: &[Address],
        objective_id: ObjectiveId,
    ) -> Vec<Message> {
        recipients
            .iter()
            .map(|&to| Message {
                to,
                from,
                rejected_objectives: vec![objective_id.clone()],
                ..Message::default()
            })
            .collect()
    }

    /// Extracts and decodes the payload for `objective_id`.
    pub fn payload_for<T: DeserializeOwned>(
        &self,
        objective_id: &ObjectiveId,
        payload_type: PayloadType,
    ) -> Result<T, ObjectiveError> {
        self.objective_payloads
            .iter()
            .find(|p| &p.objective_id == objective_id && p.payload_type == payload_type)
            .ok_or(ObjectiveError::InvalidPayload)?
            .decode(payload_type)
    }

    /// Compact description for tracing, avoiding the full payload bytes.
    pub fn summarize(&self) -> String {
        let payloads: Vec<String> = self
            .objective_payloads
            .iter()
            .map(|p| format!("{}({} bytes)", p.objective_id, p.payload_data.len()))
            .collect();
        let turns: Vec<u64> = self.ledger_proposals.iter().map(|p| p.turn_num).collect();
        format!(
            "to={:?} payloads=[{}] proposal_turns={:?} vouchers={} rejections={}",
            self.to,
            payloads.join(", "),
            turns,
            self.payments.len(),
            self.rejected_objectives.len(),
        )
    }
}
