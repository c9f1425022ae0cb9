use thiserror::Error;

// Unified error type for mixddm

#[derive(Error, Debug)]
pub enum MixError {
    #[error("non-finite value in row {row} after {stage}")]
    NumericalFault { stage: &'static str, row: usize },
    #[error("jacobian insert at unreserved position ({row}, {col})")]
    StructuralViolation { row: usize, col: usize },
    #[error("unknown region role `{0}`")]
    UnknownRole(String),
    #[error("unknown option value `{0}`")]
    UnknownOption(String),
    #[error("node {0} is not in the dof map")]
    UnknownNode(usize),
    #[error("slot {slot} out of range for node {node}")]
    SlotOutOfRange { node: usize, slot: usize },
    #[error("layout error: {0}")]
    Layout(String),
    #[error("row coupling request lists differ in length ({sources} sources, {destinations} destinations)")]
    MismatchedCoupling { sources: usize, destinations: usize },
    #[error("linear solve error: {0}")]
    LinearSolve(String),
    #[error("newton iteration did not converge after {iterations} iterations")]
    NewtonDiverged { iterations: usize },
    #[error("retry budget exhausted at {at:e} (last step {step:e})")]
    RetryBudgetExhausted { at: f64, step: f64 },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("rank {rank} failed during {stage}")]
    PeerFailure { stage: &'static str, rank: usize, recoverable: bool },
}

impl MixError {
    /// Failures a driver may recover from by reloading state and retrying smaller.
    pub fn is_recoverable(&self) -> bool {
        match self {
            MixError::PeerFailure { recoverable, .. } => *recoverable,
            _ => matches!(
                self,
                MixError::NewtonDiverged { .. } | MixError::NumericalFault { .. } | MixError::LinearSolve(_)
            ),
        }
    }
}

pub type Result<T> = std::result::Result<T, MixError>;
