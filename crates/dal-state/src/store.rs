//! In-memory "current state" snapshot.
//!
//! Actions save the shared envelope after every step. The store keeps only the
//! latest snapshot and lets callers watch it change; nothing is persisted.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use dal_core::StateEnvelope;

use crate::state::SubWorkflowState;

/// Externally observable state of the running sub-workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State whose action saved this snapshot.
    pub state: SubWorkflowState,
    /// Increases with every save.
    pub sequence: u64,
    pub envelope: StateEnvelope,
}

/// Latest-value store shared by the controller and its callers.
#[derive(Debug, Clone)]
pub struct StateStore {
    sender: Arc<watch::Sender<StateSnapshot>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(StateSnapshot::default());
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Replace the snapshot with `envelope` as saved by `state`.
    pub fn save(&self, state: SubWorkflowState, envelope: &StateEnvelope) {
        self.sender.send_modify(|snapshot| {
            snapshot.state = state;
            snapshot.sequence += 1;
            snapshot.envelope = envelope.clone();
        });
    }

    pub fn current(&self) -> StateSnapshot {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dal_core::{DalRequest, DeviceAction};

    #[test]
    fn test_save_replaces_snapshot() {
        let store = StateStore::new();
        let envelope = StateEnvelope::new(DalRequest::for_action(DeviceAction::GetZip));

        store.save(SubWorkflowState::GetZip, &envelope);
        store.save(SubWorkflowState::SanityCheck, &envelope);

        let snapshot = store.current();
        assert_eq!(snapshot.state, SubWorkflowState::SanityCheck);
        assert_eq!(snapshot.sequence, 2);
        assert_eq!(snapshot.envelope, envelope);
    }

    #[tokio::test]
    async fn test_subscribers_see_saves() {
        let store = StateStore::new();
        let mut receiver = store.subscribe();

        store.save(
            SubWorkflowState::RequestComplete,
            &StateEnvelope::new(DalRequest::default()),
        );

        receiver.changed().await.unwrap();
        assert_eq!(receiver.borrow().state, SubWorkflowState::RequestComplete);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(StateSnapshot::default()).unwrap();
        assert_eq!(json["state"], "Undefined");
        assert_eq!(json["sequence"], 0);
    }
}
