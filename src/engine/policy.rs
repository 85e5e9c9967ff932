//! Approval policy for objectives proposed by counterparties.

use crate::protocols::ObjectiveEnum;

/// Decides whether an objective received from a peer should be approved.
/// Locally requested objectives skip the policy; they were approved by
/// being requested.
pub trait PolicyMaker: Send {
    fn should_approve(&self, o: &ObjectiveEnum) -> bool;
}

/// Approves everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissivePolicy;

impl PolicyMaker for PermissivePolicy {
    fn should_approve(&self, _o: &ObjectiveEnum) -> bool {
        true
    }
}
