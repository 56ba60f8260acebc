mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use common::{memory_service, memory_service_with};
use pointbook::application::{AppError, LedgerService};
use pointbook::domain::{Ledger, LedgerError, Points, Snapshot, TransactionKind, UserId};
use pointbook::storage::{LedgerStore, MemoryLedgerStore};
use tokio::task::yield_now;

async fn wait_for_queue<S: LedgerStore>(service: &LedgerService<S>, user_id: UserId, len: usize) {
    while service.locks().queued(&user_id) < len {
        yield_now().await;
    }
}

fn ledger_error(err: AppError) -> LedgerError {
    match err {
        AppError::Ledger(err) => err,
        other => panic!("expected a ledger error, got {other:?}"),
    }
}

/// Small deterministic generator so every run covers the same interleavings.
struct Lcg(u64);

impl Lcg {
    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

#[tokio::test]
async fn test_concurrent_charges_scenario() -> Result<()> {
    let service = memory_service_with(1, 100);

    let (a, b, c) = tokio::join!(
        service.charge(1, 10),
        service.charge(1, 20),
        service.charge(1, 30)
    );
    assert_eq!(a?.balance, 110);
    assert_eq!(b?.balance, 130);
    assert_eq!(c?.balance, 160);

    let history: Vec<_> = service
        .get_history(1)
        .await?
        .iter()
        .map(|e| (e.kind, e.amount))
        .collect();
    assert_eq!(
        history,
        vec![
            (TransactionKind::Charge, 10),
            (TransactionKind::Charge, 20),
            (TransactionKind::Charge, 30),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_concurrent_uses_scenario() -> Result<()> {
    let service = memory_service_with(1, 100);

    let (first, second) = tokio::join!(service.use_points(1, 20), service.use_points(1, 40));
    assert_eq!(first?.balance, 80);
    assert_eq!(second?.balance, 40);
    assert_eq!(service.get_balance(1).await?.balance, 40);
    Ok(())
}

#[tokio::test]
async fn test_failed_use_leaves_balance_and_releases_lock() -> Result<()> {
    let service = memory_service_with(1, 100);

    let err = service.use_points(1, 150).await.unwrap_err();
    assert_eq!(
        ledger_error(err),
        LedgerError::InsufficientBalance {
            balance: 100,
            amount: 150
        }
    );
    assert_eq!(service.get_balance(1).await?.balance, 100);
    assert_eq!(service.locks().held_keys(), 0);

    assert_eq!(service.charge(1, 1).await?.balance, 101);
    Ok(())
}

#[tokio::test]
async fn test_interleavings_match_sequential_replay() -> Result<()> {
    for seed in 0..25 {
        let mut rng = Lcg(seed);
        let service = Arc::new(memory_service_with(1, 500));

        let ops: Vec<(TransactionKind, Points)> = (0..30)
            .map(|_| {
                let kind = if rng.next_u64() % 2 == 0 {
                    TransactionKind::Charge
                } else {
                    TransactionKind::Use
                };
                let amount = (rng.next_u64() % 400) as Points - 20;
                (kind, amount)
            })
            .collect();

        let handles: Vec<_> = ops
            .iter()
            .map(|&(kind, amount)| {
                let service = Arc::clone(&service);
                tokio::spawn(async move { service.transact(1, kind, amount).await })
            })
            .collect();

        let mut actual = Vec::new();
        for handle in handles {
            actual.push(handle.await?.map(|b| b.balance).map_err(ledger_error));
        }

        let mut ledger = Ledger::new(1, 500, Utc::now(), Vec::new())?;
        let expected: Vec<_> = ops
            .iter()
            .map(|&(kind, amount)| {
                let applied = ledger.apply(kind, amount).map(|_| ());
                applied.map(|()| ledger.balance())
            })
            .collect();

        assert_eq!(actual, expected, "seed {seed}");
        assert_eq!(service.get_balance(1).await?.balance, ledger.balance());

        let history = service.get_history(1).await?;
        assert_eq!(history.len(), ledger.history().map_or(0, |h| h.len()));
        assert!(service.verify(1).await.is_ok());
        assert_eq!(service.locks().held_keys(), 0);
    }
    Ok(())
}

#[tokio::test]
async fn test_independent_users_do_not_wait_on_each_other() -> Result<()> {
    let service = memory_service();

    let _held = service.locks().acquire(1).await;

    // User 1 is locked, user 2 proceeds.
    assert_eq!(service.charge(2, 10).await?.balance, 10);
    assert_eq!(service.use_points(2, 4).await?.balance, 6);
    assert!(service.locks().is_held(&1));
    assert!(!service.locks().is_held(&2));
    Ok(())
}

#[tokio::test]
async fn test_reads_bypass_the_lock() -> Result<()> {
    let service = memory_service_with(1, 100);

    let _held = service.locks().acquire(1).await;
    assert_eq!(service.get_balance(1).await?.balance, 100);
    assert!(service.get_history(1).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_cancelled_charge_leaves_no_trace() -> Result<()> {
    let service = Arc::new(memory_service_with(1, 100));
    let held = service.locks().acquire(1).await;

    let task = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.charge(1, 10).await })
    };
    wait_for_queue(&service, 1, 1).await;

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert_eq!(service.locks().queued(&1), 0);

    drop(held);
    assert_eq!(service.locks().held_keys(), 0);
    assert_eq!(service.get_balance(1).await?.balance, 100);
    assert!(service.get_history(1).await?.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_lock_timeout() -> Result<()> {
    let service = memory_service_with(1, 100).with_lock_timeout(Duration::from_millis(100));
    let held = service.locks().acquire(1).await;

    let err = service.charge(1, 10).await.unwrap_err();
    assert!(matches!(
        err,
        AppError::LockTimeout {
            user_id: 1,
            waited
        } if waited == Duration::from_millis(100)
    ));
    assert_eq!(service.locks().queued(&1), 0);

    drop(held);
    assert_eq!(service.get_balance(1).await?.balance, 100);
    assert_eq!(service.charge(1, 10).await?.balance, 110);
    Ok(())
}

/// Store whose writes always fail.
struct BrokenStore(MemoryLedgerStore);

#[async_trait]
impl LedgerStore for BrokenStore {
    async fn load(&self, user_id: UserId) -> Result<Snapshot> {
        self.0.load(user_id).await
    }

    async fn persist(&self, _ledger: &Ledger) -> Result<Snapshot> {
        yield_now().await;
        Err(anyhow!("disk full"))
    }
}

#[tokio::test]
async fn test_storage_failure_releases_lock() -> Result<()> {
    let service = LedgerService::new(BrokenStore(MemoryLedgerStore::new()));

    let (first, second) = tokio::join!(service.charge(1, 10), service.charge(1, 20));
    for result in [first, second] {
        let err = result.unwrap_err();
        assert!(matches!(err, AppError::Storage(_)));
        assert!(err.to_string().contains("disk full"));
    }
    assert_eq!(service.locks().held_keys(), 0);
    assert_eq!(service.get_balance(1).await?.balance, 0);
    Ok(())
}

#[tokio::test]
async fn test_corrupt_snapshot_is_rejected() -> Result<()> {
    let store = MemoryLedgerStore::new();
    store.insert(Snapshot {
        user_id: 1,
        balance: -5,
        updated_at: Utc::now(),
        history: Some(Vec::new()),
    });
    let service = LedgerService::new(store);

    let err = service.charge(1, 10).await.unwrap_err();
    assert!(matches!(
        ledger_error(err),
        LedgerError::InvalidState { balance: -5, .. }
    ));
    assert!(service.get_balance(1).await.is_err());
    assert_eq!(service.locks().held_keys(), 0);
    Ok(())
}
