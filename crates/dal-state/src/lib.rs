//! Sub-workflow engine and workflow manager for the device abstraction layer.
//!
//! A request naming one device action runs as a short sub-workflow:
//!
//! ```text
//! <action state> ──► SanityCheck ──► RequestComplete
//!      │                  │
//!      └─ broker ─► device └─ recovery when the step failed, timed out,
//!                             was cancelled or raised a device event
//! ```
//!
//! - [`state`]: the state enum and transition table.
//! - [`broker`]: runs each device call under a timeout and the caller's
//!   cancellation token.
//! - [`actions`]: one action object per state.
//! - [`controller`]: walks a request through its states.
//! - [`manager`]: discovers devices and serializes requests.
//! - [`store`]: latest snapshot of the running sub-workflow.
//!
//! Device faults never escape a sub-workflow; they come back as structured
//! per-device errors in the final [`StateEnvelope`](dal_core::StateEnvelope).

pub mod actions;
pub mod broker;
pub mod controller;
pub mod error;
pub mod manager;
pub mod state;
pub mod store;

pub use actions::{AnySubStateAction, LaunchRules, SubStateAction};
pub use broker::{BrokerFailure, BrokerOutcome, OutcomeKind, TimeoutBroker};
pub use controller::{SubWorkflowController, WorkflowContext, WorkflowRegisters};
pub use error::{Result, StateError};
pub use manager::{ManagerState, WorkflowManager, WorkflowManagerBuilder};
pub use state::{StateTransition, SubWorkflowState, determine_initial_state, transition};
pub use store::{StateSnapshot, StateStore};
