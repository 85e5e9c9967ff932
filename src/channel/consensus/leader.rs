//! Leader-side operations: proposing amendments and consuming the
//! follower's counter-signatures.

use super::{ConsensusChannel, ConsensusError, Proposal, SignedProposal, SignedVars, FOLLOWER};
use crate::sig::Signer;

impl ConsensusChannel {
    /// Validates `proposal` against the latest proposed vars, signs the
    /// amended state and appends it to the queue.
    ///
    /// The returned [SignedProposal] must be delivered to the follower;
    /// proposals are contractually sent in ascending turn-number order, so
    /// the caller packs the whole queue into the outbound message.
    pub fn propose(
        &mut self,
        proposal: Proposal,
        signer: &Signer,
    ) -> Result<SignedProposal, ConsensusError> {
        if !self.is_leader() {
            return Err(ConsensusError::NotLeader);
        }
        self.validate_proposal_id(&proposal)?;

        let mut vars = self.latest_proposed_vars()?;
        vars.handle_proposal(&proposal)?;
        let signature = self.sign_vars(&vars, signer)?;

        let signed = SignedProposal {
            signature,
            proposal,
            turn_num: vars.turn_num,
        };
        self.proposal_queue.push(signed.clone());
        Ok(signed)
    }

    /// Consumes a follower counter-signature for a queued proposal,
    /// advancing consensus through that turn and compacting the queue.
    ///
    /// Counter-signatures for turns at or below consensus are treated as
    /// replays and ignored.
    pub(super) fn leader_receive(&mut self, sp: SignedProposal) -> Result<(), ConsensusError> {
        if !self.is_leader() {
            return Err(ConsensusError::NotLeader);
        }
        self.validate_proposal_id(&sp.proposal)?;

        if sp.turn_num <= self.current.vars.turn_num {
            return Ok(());
        }

        let mut vars = self.current.vars.clone();
        for (idx, queued) in self.proposal_queue.iter().enumerate() {
            vars.handle_proposal(&queued.proposal)?;
            if vars.turn_num != queued.turn_num {
                return Err(ConsensusError::IncorrectTurnNum {
                    expected: vars.turn_num,
                    got: queued.turn_num,
                });
            }
            if queued.turn_num < sp.turn_num {
                continue;
            }
            // Found the countersigned entry.
            if queued.proposal != sp.proposal {
                return Err(ConsensusError::NonMatchingProposal);
            }
            let recovered = self.recover_vars_signer(&vars, sp.signature)?;
            if recovered != self.follower() {
                return Err(ConsensusError::WrongSigner {
                    expected: FOLLOWER,
                    recovered,
                });
            }
            self.current = SignedVars {
                vars,
                signatures: [queued.signature, sp.signature],
            };
            self.proposal_queue.drain(..=idx);
            return Ok(());
        }

        Err(ConsensusError::ProposalQueueExhausted)
    }
}
