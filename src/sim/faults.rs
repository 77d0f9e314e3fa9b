//! Scripted device failures

use std::collections::{HashMap, VecDeque};

use crate::persistence::{CallKind, DeviceFailure};

/// Failures to inject into a [`SimDevice`](super::SimDevice), consumed in
/// order per call kind.
///
/// Completion faults make an issued call complete with the failure. Issue
/// faults make the call fail before anything is posted.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    completion: HashMap<CallKind, VecDeque<DeviceFailure>>,
    issue: HashMap<CallKind, VecDeque<DeviceFailure>>,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(mut self, kind: CallKind, failure: DeviceFailure) -> Self {
        self.push(kind, failure);
        self
    }

    pub fn fail_on_issue(mut self, kind: CallKind, failure: DeviceFailure) -> Self {
        self.push_issue(kind, failure);
        self
    }

    pub fn push(&mut self, kind: CallKind, failure: DeviceFailure) {
        self.completion.entry(kind).or_default().push_back(failure);
    }

    pub fn push_issue(&mut self, kind: CallKind, failure: DeviceFailure) {
        self.issue.entry(kind).or_default().push_back(failure);
    }

    pub fn take(&mut self, kind: CallKind) -> Option<DeviceFailure> {
        self.completion.get_mut(&kind)?.pop_front()
    }

    pub fn take_issue(&mut self, kind: CallKind) -> Option<DeviceFailure> {
        self.issue.get_mut(&kind)?.pop_front()
    }

    /// True once every scripted failure has fired
    pub fn is_exhausted(&self) -> bool {
        self.completion.values().all(VecDeque::is_empty)
            && self.issue.values().all(VecDeque::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_fire_in_order_per_kind() {
        let mut plan = FaultPlan::new()
            .fail(CallKind::Mount, DeviceFailure::corrupted())
            .fail(CallKind::Mount, DeviceFailure::busy())
            .fail_on_issue(CallKind::Delete, DeviceFailure::internal());

        assert!(plan.take(CallKind::Transfer).is_none());
        assert_eq!(plan.take(CallKind::Mount), Some(DeviceFailure::corrupted()));
        assert!(plan.take(CallKind::Delete).is_none());
        assert_eq!(plan.take(CallKind::Mount), Some(DeviceFailure::busy()));
        assert!(!plan.is_exhausted());
        assert_eq!(plan.take_issue(CallKind::Delete), Some(DeviceFailure::internal()));
        assert!(plan.is_exhausted());
    }
}
