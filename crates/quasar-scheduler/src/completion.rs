use std::collections::HashSet;

use quasar_common::{ControllerError, ReplicaEvent, ReplicaOp, ReplicaPlacement};

use crate::controller::ReplicaController;

/// Outcome of feeding one worker completion to a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Applied,
    Duplicate,
    /// Already reflected in the observed placement the pass started from.
    Observed,
}

/// Completions applied to a controller since the last reconciliation pass.
///
/// Workers may publish the same completion more than once; only the first
/// delivery moves the intermediate placement. Replica numbers on a device
/// are dense, so an add numbered at or below the snapshot count, or a
/// remove numbered above it, was already counted when the pass loaded the
/// observed placement.
#[derive(Debug, Default)]
pub struct CompletionLedger {
    applied: HashSet<String>,
    snapshot: ReplicaPlacement,
}

impl CompletionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new pass from `observed`.
    pub fn reset(&mut self, observed: ReplicaPlacement) {
        self.applied.clear();
        self.snapshot = observed;
    }

    pub fn in_snapshot(&self, event: &ReplicaEvent) -> bool {
        let observed = self.snapshot.get(&event.device_id);
        match event.op {
            ReplicaOp::Add => event.replica_no <= observed,
            ReplicaOp::Remove => event.replica_no > observed,
        }
    }

    /// A rejected event is not remembered.
    pub fn apply(
        &mut self,
        controller: &mut ReplicaController,
        event: &ReplicaEvent,
    ) -> Result<Completion, ControllerError> {
        if self.applied.contains(&event.op_id) {
            return Ok(Completion::Duplicate);
        }
        if self.in_snapshot(event) {
            return Ok(Completion::Observed);
        }
        controller.record_completion(&event.device_id, event.delta())?;
        self.applied.insert(event.op_id.clone());
        Ok(Completion::Applied)
    }

    pub fn len(&self) -> usize {
        self.applied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn controller() -> ReplicaController {
        ReplicaController::new(
            "master".into(),
            json!({
                "end_point_id": "9",
                "end_point_name": "ep",
                "model_config": {"model_name": "m"},
                "gpu_topology": {"devA": 2},
            }),
        )
        .unwrap()
    }

    fn event(op: ReplicaOp, replica_no: u32) -> ReplicaEvent {
        ReplicaEvent::new("9".into(), "devA".into(), op, replica_no, 0)
    }

    #[test]
    fn test_duplicate_delivery_counts_once() {
        let mut c = controller();
        let mut ledger = CompletionLedger::new();
        ledger.reset(ReplicaPlacement::new());
        let ev = event(ReplicaOp::Add, 1);

        assert_eq!(ledger.apply(&mut c, &ev).unwrap(), Completion::Applied);
        assert_eq!(ledger.apply(&mut c, &ev).unwrap(), Completion::Duplicate);
        assert_eq!(c.intermediate().get(&"devA".into()), 1);
        assert!(!c.has_converged());
    }

    #[test]
    fn test_rejected_event_is_not_remembered() {
        let mut c = controller();
        let mut ledger = CompletionLedger::new();
        let ev = ReplicaEvent::new("9".into(), "devX".into(), ReplicaOp::Add, 1, 0);

        assert!(ledger.apply(&mut c, &ev).is_err());
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_completions_inside_the_snapshot_are_skipped() {
        let observed: ReplicaPlacement = [("devA".into(), 1)].into_iter().collect();
        let mut ledger = CompletionLedger::new();
        ledger.reset(observed);

        assert!(ledger.in_snapshot(&event(ReplicaOp::Add, 1)));
        assert!(!ledger.in_snapshot(&event(ReplicaOp::Add, 2)));
        assert!(ledger.in_snapshot(&event(ReplicaOp::Remove, 2)));
        assert!(!ledger.in_snapshot(&event(ReplicaOp::Remove, 1)));
    }

    #[test]
    fn test_late_add_does_not_converge_early() {
        let mut c = controller();
        let mut ledger = CompletionLedger::new();
        // replica 1 was recorded before the pass loaded the snapshot
        let observed: ReplicaPlacement = [("devA".into(), 1)].into_iter().collect();
        c.record_completion(&"devA".into(), quasar_common::ReplicaDelta::Added).unwrap();
        ledger.reset(observed);

        assert_eq!(ledger.apply(&mut c, &event(ReplicaOp::Add, 1)).unwrap(), Completion::Observed);
        assert!(!c.has_converged());
        assert_eq!(ledger.apply(&mut c, &event(ReplicaOp::Add, 2)).unwrap(), Completion::Applied);
        assert!(c.has_converged());
    }
}
