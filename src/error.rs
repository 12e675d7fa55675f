use serde::Serialize;
use thiserror::Error;

use crate::types::{BillStatus, TransactionReference};

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("{message}: {cause}")]
    Query {
        message: String,
        cause: anyhow::Error,
    },

    #[error("concurrent modification: {0}")]
    Concurrency(String),

    #[error("a transaction already exists for {0}")]
    DuplicateTransaction(TransactionReference),
}

impl DatabaseError {
    pub fn new<T: AsRef<str>>(message: T, cause: anyhow::Error) -> Self {
        DatabaseError::Query {
            message: message.as_ref().to_string(),
            cause,
        }
    }

    pub fn concurrency(message: &str) -> Self {
        DatabaseError::Concurrency(message.to_string())
    }

    pub fn duplicate_transaction(reference: TransactionReference) -> Self {
        DatabaseError::DuplicateTransaction(reference)
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("cannot store evidence at `{path}`: {cause}")]
    Store {
        path: String,
        #[source]
        cause: std::io::Error,
    },

    #[error("cannot delete evidence `{url}`: {cause}")]
    Delete {
        url: String,
        #[source]
        cause: std::io::Error,
    },

    #[error("invalid evidence path `{0}`")]
    InvalidPath(String),
}

#[derive(Error, Debug)]
pub enum InputError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("cannot read evidence file `{path}`: {cause}")]
    UnreadableEvidence {
        path: String,
        #[source]
        cause: std::io::Error,
    },
}

impl InputError {
    pub fn invalid_request(e: serde_json::Error) -> Self {
        InputError::InvalidRequest(e.to_string())
    }

    pub fn unreadable_evidence(path: &std::path::Path, cause: std::io::Error) -> Self {
        InputError::UnreadableEvidence {
            path: path.display().to_string(),
            cause,
        }
    }
}

/// The error taxonomy exposed to callers of the settlement core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    Validation,
    DuplicateTransaction,
    StorageFailure,
    RoundOutOfRange,
    CannotShrinkPastPaidRounds,
    Internal,
}

impl ErrorKind {
    /// The status code a transport should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::Validation
            | ErrorKind::RoundOutOfRange
            | ErrorKind::CannotShrinkPastPaidRounds => 400,
            ErrorKind::InvalidState | ErrorKind::DuplicateTransaction => 409,
            ErrorKind::StorageFailure | ErrorKind::Internal => 500,
        }
    }
}

#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("bill is {0}, only pending bills can be changed")]
    BillNotPending(BillStatus),

    #[error("bill is already canceled")]
    AlreadyCanceled,

    #[error("this share is already paid")]
    AlreadyPaid,

    #[error("this payment is not awaiting confirmation")]
    NotAwaitingConfirmation,

    #[error("this user has not submitted payment evidence yet")]
    MissingEvidence,

    #[error("round {requested} is not actionable, the current round is {current}")]
    RoundNotActionable { requested: u32, current: u32 },

    #[error("not a round bill")]
    NotRoundBill,

    #[error("invalid bill: {0}")]
    Validation(String),

    #[error("a transaction already exists for {0}")]
    DuplicateTransaction(TransactionReference),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("round {round} is out of range, the bill has {total_period} rounds")]
    RoundOutOfRange { round: u32, total_period: u32 },

    #[error("cannot shrink to {requested} rounds: round {highest_paid} is already paid")]
    CannotShrinkPastPaidRounds { requested: u32, highest_paid: u32 },

    #[error(transparent)]
    Database(DatabaseError),
}

impl From<DatabaseError> for SettlementError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::DuplicateTransaction(reference) => {
                SettlementError::DuplicateTransaction(reference)
            }
            e => SettlementError::Database(e),
        }
    }
}

impl SettlementError {
    pub fn not_found<T: std::fmt::Display>(what: &str, id: T) -> Self {
        SettlementError::NotFound(format!("{what} {id}"))
    }

    pub fn validation<T: AsRef<str>>(reason: T) -> Self {
        SettlementError::Validation(reason.as_ref().to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SettlementError::NotFound(_) => ErrorKind::NotFound,
            SettlementError::BillNotPending(_)
            | SettlementError::AlreadyCanceled
            | SettlementError::AlreadyPaid
            | SettlementError::NotAwaitingConfirmation
            | SettlementError::MissingEvidence
            | SettlementError::RoundNotActionable { .. }
            | SettlementError::NotRoundBill => ErrorKind::InvalidState,
            SettlementError::Validation(_) => ErrorKind::Validation,
            SettlementError::DuplicateTransaction(_) => ErrorKind::DuplicateTransaction,
            SettlementError::Storage(_) => ErrorKind::StorageFailure,
            SettlementError::RoundOutOfRange { .. } => ErrorKind::RoundOutOfRange,
            SettlementError::CannotShrinkPastPaidRounds { .. } => {
                ErrorKind::CannotShrinkPastPaidRounds
            }
            SettlementError::Database(DatabaseError::Concurrency(_)) => ErrorKind::InvalidState,
            SettlementError::Database(_) => ErrorKind::Internal,
        }
    }

    /// Optimistic-concurrency conflicts are worth retrying on a fresh load.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SettlementError::Database(DatabaseError::Concurrency(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_database_error_becomes_domain_error() {
        let reference = TransactionReference::bill(1, 2, 3, Some(1));
        let e: SettlementError = DatabaseError::duplicate_transaction(reference).into();
        assert_eq!(e.kind(), ErrorKind::DuplicateTransaction);
        assert_eq!(e.kind().status_code(), 409);
    }

    #[test]
    fn test_conflict_is_retryable() {
        let e: SettlementError = DatabaseError::concurrency("bill 1 changed").into();
        assert!(e.is_conflict());
        assert_eq!(e.kind(), ErrorKind::InvalidState);

        let e = SettlementError::not_found("bill", 7);
        assert!(!e.is_conflict());
        assert_eq!(e.to_string(), "bill 7 not found");
        assert_eq!(e.kind().status_code(), 404);
    }
}
