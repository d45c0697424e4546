use ulid::Ulid;

use crate::gateway::GatewayError;
use crate::model::{ReservationStatus, Span, TransactionStatus};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("no transaction for intent {0}")]
    IntentNotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("host {host_id} is not available for [{}, {}]", .span.start, .span.end)]
    NotCovered { host_id: Ulid, span: Span },
    #[error("conflict with reservation: {0}")]
    Conflict(Ulid),
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
    #[error("cannot move reservation from {from} to {to}")]
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    #[error("transaction {id} is {status}")]
    EntryState { id: Ulid, status: TransactionStatus },
    #[error("{0}")]
    OutsideWindow(&'static str),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("payment gateway timed out after {0} ms")]
    GatewayTimeout(u64),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// SQLSTATE reported to the client for this failure.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "22023",
            EngineError::NotFound(_) | EngineError::IntentNotFound(_) => "02000",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::NotCovered { .. } | EngineError::Conflict(_) => "23P01",
            EngineError::Forbidden(_) => "42501",
            EngineError::InvalidTransition { .. }
            | EngineError::EntryState { .. }
            | EngineError::OutsideWindow(_) => "55000",
            EngineError::Gateway(_) => "58000",
            EngineError::GatewayTimeout(_) => "57014",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(_) | EngineError::IntentNotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::NotCovered { .. } => "not_covered",
            EngineError::Conflict(_) => "conflict",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::EntryState { .. } => "entry_state",
            EngineError::OutsideWindow(_) => "outside_window",
            EngineError::Gateway(_) => "gateway",
            EngineError::GatewayTimeout(_) => "gateway_timeout",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal",
        }
    }
}
