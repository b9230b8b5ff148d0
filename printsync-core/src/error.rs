use thiserror::Error;

/// Engine-wide error type. Every fault the engine can surface carries a kind
/// discriminant so callers can branch on it (skip a poll on `RateLimited`,
/// abort the cycle on `Connectivity`, report and continue on the
/// per-document kinds) without string matching.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("endpoint unreachable: {0}")]
    Connectivity(String),

    #[error("rate limited by supplier: {0}")]
    RateLimited(String),

    #[error("supplier fault: {0}")]
    Supplier(String),

    #[error("document content invalid: {0}")]
    Content(String),

    #[error("accounting violation: {0}")]
    Accounting(String),

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("ledger store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
