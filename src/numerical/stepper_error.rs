//! error type shared by problems, methods and solvers
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepperError {
    /// missing required parameter or unrecognized name
    #[error("configuration error: {0}")]
    Configuration(String),
    /// a problem was asked for something it does not define (analytic Jacobian, split matrix...)
    #[error("{0} is not defined")]
    NotDefined(String),
    /// optional capability that is not available in this build or on this code path
    #[error("unsupported capability: {0}")]
    Unsupported(String),
    /// step count or minimum step size exhausted
    #[error("{0}")]
    ResourceExhausted(String),
    #[error("singular matrix in linear solve")]
    SingularMatrix,
    #[error("parsing error: {0}")]
    Parse(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StepperError>;

impl StepperError {
    /// errors that the solver converts into a step rejection instead of aborting the run
    pub fn is_soft(&self) -> bool {
        matches!(self, StepperError::SingularMatrix)
    }
}
