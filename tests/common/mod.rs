// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use anyhow::Result;
use chrono::Utc;
use pointbook::application::LedgerService;
use pointbook::domain::{Points, Snapshot, UserId};
use pointbook::storage::MemoryLedgerStore;
use tempfile::TempDir;

/// Helper to create a test service with a temporary database
pub async fn test_service() -> Result<(LedgerService, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");
    let service = LedgerService::init(db_path.to_str().unwrap()).await?;
    Ok((service, temp_dir))
}

/// Helper to create an in-memory service
pub fn memory_service() -> LedgerService<MemoryLedgerStore> {
    LedgerService::new(MemoryLedgerStore::new())
}

/// Helper to create an in-memory service where `user_id` starts with `balance`
pub fn memory_service_with(user_id: UserId, balance: Points) -> LedgerService<MemoryLedgerStore> {
    let store = MemoryLedgerStore::new();
    store.insert(Snapshot {
        user_id,
        balance,
        updated_at: Utc::now(),
        history: Some(Vec::new()),
    });
    LedgerService::new(store)
}

/// Fund a user through a regular charge
pub async fn fund<S: pointbook::LedgerStore>(
    service: &LedgerService<S>,
    user_id: UserId,
    amount: Points,
) -> Result<()> {
    service.charge(user_id, amount).await?;
    Ok(())
}
