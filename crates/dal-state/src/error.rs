//! Error type for sub-workflow and manager operations.

use dal_hardware::HardwareError;

pub type Result<T> = std::result::Result<T, StateError>;

/// Errors raised by the state layer.
///
/// Workflow faults (undeclared transitions, a stopped manager) come from
/// [`dal_core::Error`]; device faults that escape an action keep their
/// [`HardwareError`].
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error(transparent)]
    Core(#[from] dal_core::Error),

    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

impl StateError {
    /// Whether the workflow manager refused the call because it is not running.
    pub fn is_manager_stopped(&self) -> bool {
        matches!(self, Self::Core(dal_core::Error::ManagerStopped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_errors_display_transparently() {
        let error = StateError::from(dal_core::Error::UndeclaredTransition {
            state: "Undefined".into(),
        });
        assert_eq!(error.to_string(), "No transition declared for state Undefined");
        assert!(!error.is_manager_stopped());
    }

    #[test]
    fn test_manager_stopped_is_classified() {
        assert!(StateError::from(dal_core::Error::ManagerStopped).is_manager_stopped());
        assert!(!StateError::from(HardwareError::Cancelled).is_manager_stopped());
    }
}
