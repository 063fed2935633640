//! Sub-workflow states and the transition table.
//!
//! A sub-workflow decomposes one requested device action into a fixed walk:
//!
//! ```text
//! <action state> -> SanityCheck -> RequestComplete -> Undefined
//! ```
//!
//! Every action state moves to `SanityCheck` whether or not it failed, so a
//! single gate decides if the device needs recovery before a result is
//! released. The failure flag is still an input to [`transition`]; the
//! table simply routes both values the same way.
//!
//! # Examples
//!
//! ```
//! use dal_core::{DalRequest, DeviceAction};
//! use dal_state::state::{SubWorkflowState, determine_initial_state, transition};
//!
//! let request = DalRequest::for_action(DeviceAction::GetStatus);
//! let state = determine_initial_state(&request);
//! assert_eq!(state, SubWorkflowState::GetStatus);
//!
//! let state = transition(state, false)?;
//! assert_eq!(state, SubWorkflowState::SanityCheck);
//! assert_eq!(transition(state, true)?, SubWorkflowState::RequestComplete);
//! # Ok::<(), dal_core::Error>(())
//! ```

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use dal_core::{DalRequest, DeviceAction, Error, Result};

/// Every state a sub-workflow can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SubWorkflowState {
    /// No sub-workflow is running. Has no outgoing transition.
    #[default]
    Undefined,
    GetStatus,
    AbortCommand,
    ManualCardEntry,
    PresentCard,
    GetCardData,
    GetManualPanData,
    GetVerifyAmount,
    GetCreditOrDebit,
    GetZip,
    GetPin,
    RemoveCard,
    DeviceUi,
    StartPreSwipeMode,
    EndPreSwipeMode,
    PurgeHeldCardData,
    /// Recovers the device when the previous step failed, timed out, was
    /// cancelled or raised a device event.
    SanityCheck,
    /// Terminal; the next transition resets to `Undefined`.
    RequestComplete,
}

impl SubWorkflowState {
    pub const ALL: [SubWorkflowState; 18] = [
        Self::Undefined,
        Self::GetStatus,
        Self::AbortCommand,
        Self::ManualCardEntry,
        Self::PresentCard,
        Self::GetCardData,
        Self::GetManualPanData,
        Self::GetVerifyAmount,
        Self::GetCreditOrDebit,
        Self::GetZip,
        Self::GetPin,
        Self::RemoveCard,
        Self::DeviceUi,
        Self::StartPreSwipeMode,
        Self::EndPreSwipeMode,
        Self::PurgeHeldCardData,
        Self::SanityCheck,
        Self::RequestComplete,
    ];

    /// State that performs `action`.
    pub fn from_action(action: DeviceAction) -> Self {
        match action {
            DeviceAction::GetStatus => Self::GetStatus,
            DeviceAction::AbortCommand => Self::AbortCommand,
            DeviceAction::ManualCardEntry => Self::ManualCardEntry,
            DeviceAction::PresentCard => Self::PresentCard,
            DeviceAction::GetCardData => Self::GetCardData,
            DeviceAction::GetManualPanData => Self::GetManualPanData,
            DeviceAction::GetVerifyAmount => Self::GetVerifyAmount,
            DeviceAction::GetCreditOrDebit => Self::GetCreditOrDebit,
            DeviceAction::GetZip => Self::GetZip,
            DeviceAction::GetPin => Self::GetPin,
            DeviceAction::RemoveCard => Self::RemoveCard,
            DeviceAction::DeviceUi => Self::DeviceUi,
            DeviceAction::StartPreSwipeMode => Self::StartPreSwipeMode,
            DeviceAction::EndPreSwipeMode => Self::EndPreSwipeMode,
            DeviceAction::PurgeHeldCardData => Self::PurgeHeldCardData,
        }
    }

    /// Device action performed in this state, `None` for the bookkeeping states.
    pub fn action(&self) -> Option<DeviceAction> {
        match self {
            Self::GetStatus => Some(DeviceAction::GetStatus),
            Self::AbortCommand => Some(DeviceAction::AbortCommand),
            Self::ManualCardEntry => Some(DeviceAction::ManualCardEntry),
            Self::PresentCard => Some(DeviceAction::PresentCard),
            Self::GetCardData => Some(DeviceAction::GetCardData),
            Self::GetManualPanData => Some(DeviceAction::GetManualPanData),
            Self::GetVerifyAmount => Some(DeviceAction::GetVerifyAmount),
            Self::GetCreditOrDebit => Some(DeviceAction::GetCreditOrDebit),
            Self::GetZip => Some(DeviceAction::GetZip),
            Self::GetPin => Some(DeviceAction::GetPin),
            Self::RemoveCard => Some(DeviceAction::RemoveCard),
            Self::DeviceUi => Some(DeviceAction::DeviceUi),
            Self::StartPreSwipeMode => Some(DeviceAction::StartPreSwipeMode),
            Self::EndPreSwipeMode => Some(DeviceAction::EndPreSwipeMode),
            Self::PurgeHeldCardData => Some(DeviceAction::PurgeHeldCardData),
            Self::Undefined | Self::SanityCheck | Self::RequestComplete => None,
        }
    }

    pub fn is_action(&self) -> bool {
        self.action().is_some()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RequestComplete)
    }
}

impl fmt::Display for SubWorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Next state after `state` finished, given whether it failed.
///
/// # Errors
///
/// Returns `Error::UndeclaredTransition` for `Undefined`, which has no
/// outgoing edge.
pub fn transition(state: SubWorkflowState, failed: bool) -> Result<SubWorkflowState> {
    use SubWorkflowState::*;

    let next = match (state, failed) {
        (Undefined, _) => {
            return Err(Error::UndeclaredTransition {
                state: state.to_string(),
            });
        }
        (SanityCheck, _) => RequestComplete,
        (RequestComplete, _) => Undefined,
        // Success and failure share the recovery gate.
        (_, true) | (_, false) => SanityCheck,
    };
    Ok(next)
}

/// First state for the request's first action; `Undefined` when the request
/// names no recognised action.
pub fn determine_initial_state(request: &DalRequest) -> SubWorkflowState {
    request
        .first_action()
        .and_then(|action| action.action)
        .map_or(SubWorkflowState::Undefined, SubWorkflowState::from_action)
}

/// One step of a sub-workflow, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: SubWorkflowState,
    pub to: SubWorkflowState,
    /// Failure flag of the action that finished in `from`.
    pub failed: bool,
    pub timestamp: Instant,
}

impl StateTransition {
    pub fn new(from: SubWorkflowState, to: SubWorkflowState, failed: bool) -> Self {
        Self {
            from,
            to,
            failed,
            timestamp: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.timestamp.elapsed()
    }
}
