use super::{
    errors::{StateMachineError, StateMachineResult},
    events::ExperimentEvent,
    states::ExperimentStatus,
};

/// Experiment lifecycle: `Pending -> Running -> {Completed, Stopped}`.
///
/// Terminal states are sticky; stopping an already stopped experiment is a
/// no-op rather than an error so `stop_experiment` stays idempotent.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExperimentStateMachine;

impl ExperimentStateMachine {
    pub fn determine_target_state(
        current: ExperimentStatus,
        event: ExperimentEvent,
    ) -> StateMachineResult<ExperimentStatus> {
        let target = match (current, event) {
            (ExperimentStatus::Pending, ExperimentEvent::Start) => ExperimentStatus::Running,

            (ExperimentStatus::Running, ExperimentEvent::Complete) => ExperimentStatus::Completed,
            (ExperimentStatus::Running, ExperimentEvent::Stop) => ExperimentStatus::Stopped,
            (ExperimentStatus::Pending, ExperimentEvent::Stop) => ExperimentStatus::Stopped,

            (ExperimentStatus::Stopped, ExperimentEvent::Stop) => ExperimentStatus::Stopped,
            (ExperimentStatus::Completed, ExperimentEvent::Complete) => ExperimentStatus::Completed,

            (from, event) => {
                return Err(StateMachineError::InvalidTransition {
                    from: from.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        use ExperimentEvent::*;
        use ExperimentStatus::*;

        assert_eq!(
            ExperimentStateMachine::determine_target_state(Pending, Start).unwrap(),
            Running
        );
        assert_eq!(
            ExperimentStateMachine::determine_target_state(Running, Complete).unwrap(),
            Completed
        );
        assert_eq!(
            ExperimentStateMachine::determine_target_state(Running, Stop).unwrap(),
            Stopped
        );
        assert_eq!(
            ExperimentStateMachine::determine_target_state(Stopped, Stop).unwrap(),
            Stopped
        );
    }

    #[test]
    fn test_terminal_states_cannot_restart() {
        use ExperimentEvent::*;
        use ExperimentStatus::*;

        assert!(ExperimentStateMachine::determine_target_state(Stopped, Start).is_err());
        assert!(ExperimentStateMachine::determine_target_state(Completed, Stop).is_err());
        assert!(ExperimentStateMachine::determine_target_state(Completed, Start).is_err());
    }
}
