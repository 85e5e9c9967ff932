//! Follower-side operations: enqueueing leader proposals and
//! counter-signing the head of the queue.

use super::{ConsensusChannel, ConsensusError, Proposal, SignedProposal, SignedVars, LEADER};
use crate::sig::Signer;

impl ConsensusChannel {
    /// Validates a leader proposal and appends it to the queue.
    ///
    /// The proposal must carry the next contiguous turn number on top of
    /// the latest proposed vars and a leader signature over the amended
    /// state. Proposals for turns at or below consensus are replays and
    /// are ignored.
    pub(super) fn follower_receive(&mut self, sp: SignedProposal) -> Result<(), ConsensusError> {
        if !self.is_follower() {
            return Err(ConsensusError::NotFollower);
        }
        self.validate_proposal_id(&sp.proposal)?;

        if sp.turn_num <= self.current.vars.turn_num {
            return Ok(());
        }

        let mut vars = self.latest_proposed_vars()?;
        let expected = vars.turn_num + 1;
        if sp.turn_num != expected {
            return Err(ConsensusError::IncorrectTurnNum {
                expected,
                got: sp.turn_num,
            });
        }
        vars.handle_proposal(&sp.proposal)?;

        let recovered = self.recover_vars_signer(&vars, sp.signature)?;
        if recovered != self.leader() {
            return Err(ConsensusError::WrongSigner {
                expected: LEADER,
                recovered,
            });
        }

        self.proposal_queue.push(sp);
        Ok(())
    }

    /// Counter-signs the queue head, which must match `expected`, making
    /// the amended state the new consensus. Returns our signed proposal,
    /// to be delivered back to the leader.
    pub fn sign_next_proposal(
        &mut self,
        expected: &Proposal,
        signer: &Signer,
    ) -> Result<SignedProposal, ConsensusError> {
        if !self.is_follower() {
            return Err(ConsensusError::NotFollower);
        }
        let head = self
            .proposal_queue
            .first()
            .ok_or(ConsensusError::ProposalQueueExhausted)?
            .clone();
        if head.proposal != *expected {
            return Err(ConsensusError::NonMatchingProposal);
        }

        let mut vars = self.current.vars.clone();
        vars.handle_proposal(&head.proposal)?;
        if vars.turn_num != head.turn_num {
            return Err(ConsensusError::IncorrectTurnNum {
                expected: vars.turn_num,
                got: head.turn_num,
            });
        }

        let my_sig = self.sign_vars(&vars, signer)?;
        let turn_num = vars.turn_num;
        self.current = SignedVars {
            vars,
            signatures: [head.signature, my_sig],
        };
        self.proposal_queue.remove(0);

        Ok(SignedProposal {
            signature: my_sig,
            proposal: head.proposal,
            turn_num,
        })
    }
}
