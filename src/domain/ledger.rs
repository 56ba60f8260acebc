use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{validate_amount, AmountError, HistoryEntry, Points, TransactionKind, MAX_BALANCE};

pub type UserId = i64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(#[from] AmountError),

    #[error("Charging {amount} points would exceed the limit of {max}: balance {balance}")]
    LimitExceeded {
        balance: Points,
        amount: Points,
        max: Points,
    },

    #[error("Insufficient balance: balance {balance}, required {amount}")]
    InsufficientBalance { balance: Points, amount: Points },

    #[error("Invalid ledger state: balance {balance} {reason}")]
    InvalidState { balance: Points, reason: String },

    #[error("Ledger history is not initialized")]
    UninitializedHistory,
}

/// Balance and history of one ledger as served by a store at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub user_id: UserId,
    pub balance: Points,
    pub updated_at: DateTime<Utc>,
    /// `None` when the store served a balance-only read
    pub history: Option<Vec<HistoryEntry>>,
}

impl Snapshot {
    /// Snapshot of a user the store has never seen: zero balance, no history.
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            balance: 0,
            updated_at: DateTime::UNIX_EPOCH,
            history: Some(Vec::new()),
        }
    }
}

fn check_balance(balance: Points) -> Result<Points, LedgerError> {
    if balance < 0 {
        return Err(LedgerError::InvalidState {
            balance,
            reason: "is negative".to_string(),
        });
    }
    if balance > MAX_BALANCE {
        return Err(LedgerError::InvalidState {
            balance,
            reason: format!("exceeds the maximum of {}", MAX_BALANCE),
        });
    }
    Ok(balance)
}

/// The point balance and transaction history of a single user.
///
/// A `Ledger` can only be obtained through validated construction, and the
/// only mutations are [`Ledger::charge`] and [`Ledger::use_points`], so the
/// balance always stays within `0..=MAX_BALANCE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ledger {
    user_id: UserId,
    balance: Points,
    updated_at: DateTime<Utc>,
    history: Option<Vec<HistoryEntry>>,
}

impl Ledger {
    pub fn new(
        user_id: UserId,
        balance: Points,
        updated_at: DateTime<Utc>,
        history: Vec<HistoryEntry>,
    ) -> Result<Self, LedgerError> {
        Self::from_snapshot(Snapshot {
            user_id,
            balance,
            updated_at,
            history: Some(history),
        })
    }

    /// Rebuild a ledger from a loaded snapshot, failing fast on an
    /// out-of-range balance.
    pub fn from_snapshot(snapshot: Snapshot) -> Result<Self, LedgerError> {
        let balance = check_balance(snapshot.balance)?;
        Ok(Self {
            user_id: snapshot.user_id,
            balance,
            updated_at: snapshot.updated_at,
            history: snapshot.history,
        })
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn balance(&self) -> Points {
        self.balance
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Entries in chronological order, or `None` if history was not loaded.
    pub fn history(&self) -> Option<&[HistoryEntry]> {
        self.history.as_deref()
    }

    /// Entries created since the ledger was loaded.
    pub fn unpersisted(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history
            .iter()
            .flatten()
            .filter(|entry| !entry.is_persisted())
    }

    pub fn charge(&mut self, amount: Points) -> Result<&HistoryEntry, LedgerError> {
        self.charge_at(amount, Utc::now())
    }

    pub fn charge_at(
        &mut self,
        amount: Points,
        now: DateTime<Utc>,
    ) -> Result<&HistoryEntry, LedgerError> {
        let amount = validate_amount(amount)?;
        let new_balance = self
            .balance
            .checked_add(amount)
            .filter(|balance| *balance <= MAX_BALANCE)
            .ok_or(LedgerError::LimitExceeded {
                balance: self.balance,
                amount,
                max: MAX_BALANCE,
            })?;
        self.commit(TransactionKind::Charge, amount, new_balance, now)
    }

    pub fn use_points(&mut self, amount: Points) -> Result<&HistoryEntry, LedgerError> {
        self.use_points_at(amount, Utc::now())
    }

    pub fn use_points_at(
        &mut self,
        amount: Points,
        now: DateTime<Utc>,
    ) -> Result<&HistoryEntry, LedgerError> {
        let amount = validate_amount(amount)?;
        let new_balance = self.balance - amount;
        if new_balance < 0 {
            return Err(LedgerError::InsufficientBalance {
                balance: self.balance,
                amount,
            });
        }
        self.commit(TransactionKind::Use, amount, new_balance, now)
    }

    /// Apply a transaction of the given kind.
    pub fn apply(
        &mut self,
        kind: TransactionKind,
        amount: Points,
    ) -> Result<&HistoryEntry, LedgerError> {
        match kind {
            TransactionKind::Charge => self.charge(amount),
            TransactionKind::Use => self.use_points(amount),
        }
    }

    /// Replay the history from zero and compare it with the balance.
    pub fn verify(&self) -> Result<IntegrityReport, LedgerError> {
        let history = self.history().ok_or(LedgerError::UninitializedHistory)?;
        let replayed_balance = replay_balance(history).ok();

        Ok(IntegrityReport {
            user_id: self.user_id,
            balance: self.balance,
            replayed_balance,
            entry_count: history.len(),
            unpersisted_count: self.unpersisted().count(),
            is_consistent: replayed_balance == Some(self.balance),
        })
    }

    // Every check has passed by the time this runs; nothing is touched
    // unless the history can take the new entry.
    fn commit(
        &mut self,
        kind: TransactionKind,
        amount: Points,
        new_balance: Points,
        now: DateTime<Utc>,
    ) -> Result<&HistoryEntry, LedgerError> {
        let history = self
            .history
            .as_mut()
            .ok_or(LedgerError::UninitializedHistory)?;

        let timestamp = now.max(self.updated_at);
        history.push(HistoryEntry::new(kind, amount, timestamp));
        self.balance = new_balance;
        self.updated_at = timestamp;

        Ok(&history[history.len() - 1])
    }
}

/// Compute the balance produced by a history starting from zero.
/// Fails if any prefix of the history leaves the valid balance range.
pub fn replay_balance(history: &[HistoryEntry]) -> Result<Points, LedgerError> {
    history.iter().try_fold(0, |balance: Points, entry| {
        check_balance(balance.saturating_add(entry.kind.delta(entry.amount)))
    })
}

/// Result of reconciling a ledger's balance with its history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub user_id: UserId,
    pub balance: Points,
    /// `None` if the replay left the valid range at some point
    pub replayed_balance: Option<Points>,
    pub entry_count: usize,
    pub unpersisted_count: usize,
    pub is_consistent: bool,
}
