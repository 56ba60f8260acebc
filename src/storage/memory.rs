use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::yield_now;

use crate::domain::{HistoryId, Ledger, Snapshot, UserId};

use super::LedgerStore;

#[derive(Default)]
struct Tables {
    ledgers: HashMap<UserId, Snapshot>,
    next_id: HistoryId,
}

/// In-process ledger store.
///
/// Every call yields to the scheduler once before touching the tables, the
/// way a real store suspends on I/O, so concurrent callers interleave at the
/// same points they would against a database.
#[derive(Default)]
pub struct MemoryLedgerStore {
    tables: Mutex<Tables>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user's ledger directly, bypassing validation. Ids assigned
    /// later continue after the largest seeded id.
    pub fn insert(&self, snapshot: Snapshot) {
        let mut tables = self.tables();
        let seeded_max = snapshot
            .history
            .iter()
            .flatten()
            .filter_map(|entry| entry.id)
            .max();
        if let Some(max) = seeded_max {
            tables.next_id = tables.next_id.max(max);
        }
        tables.ledgers.insert(snapshot.user_id, snapshot);
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn load(&self, user_id: UserId) -> Result<Snapshot> {
        yield_now().await;
        let tables = self.tables();
        Ok(tables
            .ledgers
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| Snapshot::empty(user_id)))
    }

    async fn persist(&self, ledger: &Ledger) -> Result<Snapshot> {
        yield_now().await;
        let mut tables = self.tables();
        let Tables { ledgers, next_id } = &mut *tables;

        let stored = ledgers
            .entry(ledger.user_id())
            .or_insert_with(|| Snapshot::empty(ledger.user_id()));
        stored.balance = ledger.balance();
        stored.updated_at = ledger.updated_at();

        let history = stored.history.get_or_insert_with(Vec::new);
        for entry in ledger.unpersisted() {
            *next_id += 1;
            history.push(entry.clone().with_id(*next_id));
        }

        Ok(stored.clone())
    }
}
