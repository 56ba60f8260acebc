use std::time::Duration;

use thiserror::Error;

use crate::domain::{LedgerError, UserId};

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Timed out after {waited:?} waiting for the ledger of user {user_id}")]
    LockTimeout { user_id: UserId, waited: Duration },

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl AppError {
    /// The domain rule this error reports, if any.
    pub fn ledger_error(&self) -> Option<&LedgerError> {
        match self {
            AppError::Ledger(err) => Some(err),
            _ => None,
        }
    }
}
