// src/error.rs
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;
use warp::http::StatusCode;
use warp::reject::Reject;

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("{0}")]
    Validation(String),

    #[error("Insufficient funds for the purchase: need {required}, available {available}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("User does not hold enough shares: need {requested}, available {available}")]
    InsufficientShares { requested: f64, available: f64 },

    #[error("Provided shareCount is not present for circulation: need {requested}, for sale {available}")]
    InsufficientFloat { requested: f64, available: f64 },

    #[error("Shares for sale of {ticker} would exceed total shares {total}")]
    FloatOverflow { ticker: String, total: f64 },

    #[error("Invalid Security ticker provided: {0}")]
    UnknownTicker(String),

    #[error("Invalid User id: {0}")]
    UnknownUser(String),

    #[error("Transaction not found: {0}")]
    UnknownTransaction(String),

    #[error("Security with ticker {0} already exists")]
    DuplicateTicker(String),

    #[error("Transaction is locked until {until}")]
    Locked { until: DateTime<Utc> },

    #[error("Invalid transaction set: {0}")]
    InvalidTransactionSet(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Failed to process transaction: {0}")]
    Processing(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    pub fn status(&self) -> StatusCode {
        match self {
            LedgerError::Validation(_)
            | LedgerError::InsufficientFunds { .. }
            | LedgerError::InsufficientShares { .. }
            | LedgerError::InsufficientFloat { .. }
            | LedgerError::FloatOverflow { .. }
            | LedgerError::UnknownTicker(_)
            | LedgerError::UnknownUser(_)
            | LedgerError::InvalidTransactionSet(_) => StatusCode::BAD_REQUEST,
            LedgerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            LedgerError::UnknownTransaction(_) => StatusCode::NOT_FOUND,
            LedgerError::DuplicateTicker(_) => StatusCode::CONFLICT,
            LedgerError::Locked { .. } => StatusCode::LOCKED,
            LedgerError::Processing(_) | LedgerError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<scylla::transport::errors::QueryError> for LedgerError {
    fn from(e: scylla::transport::errors::QueryError) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

impl From<scylla::transport::errors::NewSessionError> for LedgerError {
    fn from(e: scylla::transport::errors::NewSessionError) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

/// Rejection carried through warp filters until `handle_rejection` renders it.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

impl Reject for ApiError {}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        ApiError {
            status: e.status(),
            message: e.to_string(),
        }
    }
}
