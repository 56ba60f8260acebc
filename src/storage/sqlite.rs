use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};

use crate::domain::{HistoryEntry, Ledger, Snapshot, TransactionKind, UserId};

use super::{LedgerStore, MIGRATION_001_INITIAL};

/// Ledger store backed by a SQLite database.
///
/// Balances live in `user_points`, history in `point_history`. A ledger is
/// always written inside one transaction and read inside another, so readers
/// never see a balance without the entries that produced it.
pub struct SqliteLedgerStore {
    pool: SqlitePool,
}

impl SqliteLedgerStore {
    /// Create a new store with the given SQLite connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite database at the given URL.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool))
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(MIGRATION_001_INITIAL)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 001")?;
        Ok(())
    }

    /// Initialize a new database (connect + migrate).
    pub async fn init(database_url: &str) -> Result<Self> {
        let store = Self::connect(database_url).await?;
        store.migrate().await?;
        Ok(store)
    }

    async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool
            .begin()
            .await
            .context("Failed to begin transaction")
    }

    async fn fetch_balance(conn: &mut SqliteConnection, user_id: UserId) -> Result<Snapshot> {
        let row = sqlx::query(
            r#"
            SELECT balance, updated_at
            FROM user_points
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(conn)
        .await
        .context("Failed to fetch balance")?;

        let Some(row) = row else {
            let mut snapshot = Snapshot::empty(user_id);
            snapshot.history = None;
            return Ok(snapshot);
        };

        let updated_at: String = row.get("updated_at");
        Ok(Snapshot {
            user_id,
            balance: row.get("balance"),
            updated_at: parse_timestamp(&updated_at).context("Invalid updated_at timestamp")?,
            history: None,
        })
    }

    async fn fetch_history(
        conn: &mut SqliteConnection,
        user_id: UserId,
    ) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, amount, timestamp
            FROM point_history
            WHERE user_id = ?
            ORDER BY id
            "#,
        )
        .bind(user_id)
        .fetch_all(conn)
        .await
        .context("Failed to fetch history")?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<HistoryEntry> {
        let kind_str: String = row.get("kind");
        let timestamp_str: String = row.get("timestamp");

        Ok(HistoryEntry {
            id: Some(row.get("id")),
            kind: TransactionKind::parse(&kind_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid transaction kind: {}", kind_str))?,
            amount: row.get("amount"),
            timestamp: parse_timestamp(&timestamp_str).context("Invalid history timestamp")?,
        })
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn load(&self, user_id: UserId) -> Result<Snapshot> {
        let mut tx = self.begin().await?;
        let mut snapshot = Self::fetch_balance(&mut tx, user_id).await?;
        snapshot.history = Some(Self::fetch_history(&mut tx, user_id).await?);
        tx.commit().await.context("Failed to finish read")?;
        Ok(snapshot)
    }

    async fn load_summary(&self, user_id: UserId) -> Result<Snapshot> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire connection")?;
        Self::fetch_balance(&mut conn, user_id).await
    }

    async fn persist(&self, ledger: &Ledger) -> Result<Snapshot> {
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO user_points (user_id, balance, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (user_id) DO UPDATE
            SET balance = excluded.balance, updated_at = excluded.updated_at
            "#,
        )
        .bind(ledger.user_id())
        .bind(ledger.balance())
        .bind(ledger.updated_at().to_rfc3339())
        .execute(&mut *tx)
        .await
        .context("Failed to save balance")?;

        for entry in ledger.unpersisted() {
            sqlx::query(
                r#"
                INSERT INTO point_history (user_id, kind, amount, timestamp)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(ledger.user_id())
            .bind(entry.kind.as_str())
            .bind(entry.amount)
            .bind(entry.timestamp.to_rfc3339())
            .execute(&mut *tx)
            .await
            .context("Failed to save history entry")?;
        }

        tx.commit().await.context("Failed to commit ledger")?;

        self.load(ledger.user_id()).await
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}
