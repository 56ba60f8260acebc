use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{
    HistoryEntry, IntegrityReport, Ledger, LedgerError, Points, Snapshot, TransactionKind, UserId,
};
use crate::storage::{LedgerStore, SqliteLedgerStore};
use crate::sync::{KeyLock, KeyLockGuard};

use super::AppError;

/// Application service providing high-level operations for the ledger.
/// This is the primary interface for any client (CLI, API, TUI, etc.).
///
/// Charges and uses for the same user run one at a time, in the order they
/// arrived; reads never wait.
pub struct LedgerService<S = SqliteLedgerStore> {
    store: S,
    locks: KeyLock<UserId>,
    lock_timeout: Option<Duration>,
}

/// Balance of a user as last persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BalanceEntry {
    pub user_id: UserId,
    pub balance: Points,
    pub updated_at: DateTime<Utc>,
}

impl From<&Snapshot> for BalanceEntry {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            user_id: snapshot.user_id,
            balance: snapshot.balance,
            updated_at: snapshot.updated_at,
        }
    }
}

impl From<&Ledger> for BalanceEntry {
    fn from(ledger: &Ledger) -> Self {
        Self {
            user_id: ledger.user_id(),
            balance: ledger.balance(),
            updated_at: ledger.updated_at(),
        }
    }
}

impl LedgerService<SqliteLedgerStore> {
    /// Initialize a new database at the given path.
    pub async fn init(database_path: &str) -> Result<Self, AppError> {
        let db_url = format!("sqlite:{}?mode=rwc", database_path);
        let store = SqliteLedgerStore::init(&db_url).await?;
        Ok(Self::new(store))
    }

    /// Connect to an existing database.
    pub async fn connect(database_path: &str) -> Result<Self, AppError> {
        let db_url = format!("sqlite:{}", database_path);
        let store = SqliteLedgerStore::connect(&db_url).await?;
        Ok(Self::new(store))
    }
}

impl<S: LedgerStore> LedgerService<S> {
    /// Create a new ledger service over the given store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            locks: KeyLock::new(),
            lock_timeout: None,
        }
    }

    /// Fail charges and uses that wait longer than `timeout` for their turn.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn locks(&self) -> &KeyLock<UserId> {
        &self.locks
    }

    // ========================
    // Queries
    // ========================

    /// Get the current balance of a user.
    pub async fn get_balance(&self, user_id: UserId) -> Result<BalanceEntry, AppError> {
        let ledger = Ledger::from_snapshot(self.store.load_summary(user_id).await?)?;
        Ok(BalanceEntry::from(&ledger))
    }

    /// Get the full charge/use history of a user, oldest first.
    pub async fn get_history(&self, user_id: UserId) -> Result<Vec<HistoryEntry>, AppError> {
        let ledger = Ledger::from_snapshot(self.store.load(user_id).await?)?;
        ledger
            .history()
            .map(<[HistoryEntry]>::to_vec)
            .ok_or(AppError::Ledger(LedgerError::UninitializedHistory))
    }

    /// Check that a user's balance matches the replay of their history.
    pub async fn verify(&self, user_id: UserId) -> Result<IntegrityReport, AppError> {
        let ledger = Ledger::from_snapshot(self.store.load(user_id).await?)?;
        Ok(ledger.verify()?)
    }

    // ========================
    // Transactions
    // ========================

    /// Add points to a user's balance.
    pub async fn charge(&self, user_id: UserId, amount: Points) -> Result<BalanceEntry, AppError> {
        self.transact(user_id, TransactionKind::Charge, amount).await
    }

    /// Spend points from a user's balance.
    pub async fn use_points(
        &self,
        user_id: UserId,
        amount: Points,
    ) -> Result<BalanceEntry, AppError> {
        self.transact(user_id, TransactionKind::Use, amount).await
    }

    /// Run one transaction of the given kind.
    pub async fn transact(
        &self,
        user_id: UserId,
        kind: TransactionKind,
        amount: Points,
    ) -> Result<BalanceEntry, AppError> {
        // Held until this function returns, whichever way it returns.
        let _guard = self.lock(user_id).await?;

        let mut ledger = Ledger::from_snapshot(self.store.load(user_id).await?)?;
        if let Err(err) = ledger.apply(kind, amount) {
            tracing::debug!(user_id, %kind, amount, error = %err, "transaction rejected");
            return Err(err.into());
        }

        let snapshot = self.store.persist(&ledger).await?;
        tracing::info!(
            user_id,
            %kind,
            amount,
            balance = snapshot.balance,
            "transaction committed"
        );

        Ok(BalanceEntry::from(&snapshot))
    }

    async fn lock(&self, user_id: UserId) -> Result<KeyLockGuard<'_, UserId>, AppError> {
        match self.lock_timeout {
            Some(timeout) => self
                .locks
                .acquire_timeout(user_id, timeout)
                .await
                .map_err(|err| {
                    tracing::warn!(user_id, waited = ?err.waited, "gave up waiting for ledger");
                    AppError::LockTimeout {
                        user_id,
                        waited: err.waited,
                    }
                }),
            None => Ok(self.locks.acquire(user_id).await),
        }
    }
}
