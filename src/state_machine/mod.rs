// State machines for pipeline task attempts and experiment lifecycles.
//
// Transitions are pure functions of (current state, event) so that both the
// pipeline executor and the A/B framework can validate a move before applying it.

pub mod errors;
pub mod events;
pub mod experiment_state_machine;
pub mod states;
pub mod task_state_machine;

pub use errors::{StateMachineError, StateMachineResult};
pub use events::{ExperimentEvent, TaskEvent};
pub use experiment_state_machine::ExperimentStateMachine;
pub use states::{ExperimentStatus, TaskStatus};
pub use task_state_machine::TaskStateMachine;
