use thiserror::Error;

/// Result type used by every fallible operation in the crate.
///
/// Assertion failures (precondition or invariant violations) are not
/// errors and never surface through this type; they panic.
pub type Res<T> = Result<T, ResErr>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResErr {
    #[error("out of memory")]
    Memory,
    #[error("commit limit would be exceeded")]
    CommitLimit,
    #[error("out of an internal resource")]
    Resource,
    #[error("internal limit reached")]
    Limit,
    #[error("operation failed")]
    Fail,
    #[error("I/O error on describe stream")]
    Io,
    #[error("operation not implemented")]
    Unimpl,
    #[error("invalid parameter")]
    Param,
}
