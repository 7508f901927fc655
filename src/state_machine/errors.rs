use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateMachineError {
    #[error("Invalid transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Retry limit of {limit} exhausted")]
    RetryLimitExhausted { limit: u32 },
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;

impl From<StateMachineError> for crate::error::ModelOpsError {
    fn from(err: StateMachineError) -> Self {
        crate::error::ModelOpsError::Validation(err.to_string())
    }
}
