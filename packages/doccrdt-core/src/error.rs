use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("inconsistent state: {0}")]
    InconsistentState(String),
    #[error("missing dependency: {0}")]
    MissingDependency(String),
    #[error("undo/redo is not allowed while an update is in progress")]
    HistoryDuringUpdate,
    #[error("nothing to {0}")]
    EmptyHistory(&'static str),
    #[error("document is removed")]
    DocumentRemoved,
    #[error("lamport clock overflow")]
    ClockOverflow,
}
