mod memory;
mod sqlite;

pub use memory::*;
pub use sqlite::*;

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::{Ledger, Snapshot, UserId};

/// SQL migration for initial schema
pub const MIGRATION_001_INITIAL: &str = include_str!("migrations/001_initial.sql");

/// Persistence for user ledgers.
///
/// A user the store has never seen loads as [`Snapshot::empty`]: zero balance,
/// `updated_at` at the Unix epoch, and no history.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Load the balance and the full history of a user.
    async fn load(&self, user_id: UserId) -> Result<Snapshot>;

    /// Load the balance only. The returned snapshot carries no history.
    async fn load_summary(&self, user_id: UserId) -> Result<Snapshot> {
        let mut snapshot = self.load(user_id).await?;
        snapshot.history = None;
        Ok(snapshot)
    }

    /// Write the ledger's balance and every entry it has not persisted yet,
    /// then return the snapshot as reloaded from the store.
    async fn persist(&self, ledger: &Ledger) -> Result<Snapshot>;
}
