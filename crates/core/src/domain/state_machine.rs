use super::phase::PhaseState;
use crate::error::{CoreError, Result};

pub struct PhaseStateMachine;

impl PhaseStateMachine {
    pub fn validate_transition(phase: &str, from: &PhaseState, to: &PhaseState) -> Result<()> {
        let allowed = Self::allowed_transitions(from);

        if allowed.contains(to) {
            Ok(())
        } else {
            Err(CoreError::InvalidStatusTransition {
                phase: phase.to_string(),
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }

    fn allowed_transitions(from: &PhaseState) -> Vec<PhaseState> {
        match from {
            PhaseState::Unstarted => vec![PhaseState::InProgress],
            PhaseState::InProgress => vec![PhaseState::Completed, PhaseState::Failed],
            PhaseState::Completed => vec![PhaseState::RolledBack],
            PhaseState::Failed => vec![PhaseState::InProgress, PhaseState::RolledBack],
            PhaseState::RolledBack => vec![PhaseState::InProgress],
        }
    }

    pub fn can_transition(from: &PhaseState, to: &PhaseState) -> bool {
        Self::allowed_transitions(from).contains(to)
    }

    /// Whether the engine may start the phase from this state.
    pub fn can_start(state: &PhaseState) -> bool {
        Self::can_transition(state, &PhaseState::InProgress)
    }

    /// Whether `Rollback` may be invoked on a phase in this state.
    pub fn can_roll_back(state: &PhaseState) -> bool {
        matches!(state, PhaseState::Completed | PhaseState::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        assert!(PhaseStateMachine::can_transition(
            &PhaseState::Unstarted,
            &PhaseState::InProgress
        ));
        assert!(PhaseStateMachine::can_transition(
            &PhaseState::InProgress,
            &PhaseState::Completed
        ));
        assert!(PhaseStateMachine::can_transition(
            &PhaseState::InProgress,
            &PhaseState::Failed
        ));
        assert!(PhaseStateMachine::can_transition(
            &PhaseState::Completed,
            &PhaseState::RolledBack
        ));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!PhaseStateMachine::can_transition(
            &PhaseState::Unstarted,
            &PhaseState::Completed
        ));
        assert!(!PhaseStateMachine::can_transition(
            &PhaseState::Unstarted,
            &PhaseState::RolledBack
        ));
        assert!(!PhaseStateMachine::can_transition(
            &PhaseState::Completed,
            &PhaseState::InProgress
        ));
    }

    #[test]
    fn test_retry_from_failure() {
        assert!(PhaseStateMachine::can_start(&PhaseState::Failed));
        assert!(PhaseStateMachine::can_start(&PhaseState::RolledBack));
        assert!(!PhaseStateMachine::can_start(&PhaseState::Completed));
        assert!(!PhaseStateMachine::can_start(&PhaseState::InProgress));
    }

    #[test]
    fn test_rollback_eligibility() {
        assert!(PhaseStateMachine::can_roll_back(&PhaseState::Completed));
        assert!(PhaseStateMachine::can_roll_back(&PhaseState::Failed));
        assert!(!PhaseStateMachine::can_roll_back(&PhaseState::Unstarted));
        assert!(!PhaseStateMachine::can_roll_back(&PhaseState::RolledBack));
    }

    #[test]
    fn test_error_names_phase() {
        let err = PhaseStateMachine::validate_transition(
            "/rbac",
            &PhaseState::Unstarted,
            &PhaseState::Completed,
        )
        .unwrap_err();
        assert!(err.to_string().contains("/rbac"));
    }
}
