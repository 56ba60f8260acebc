use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;

use crate::application::LedgerService;
use crate::domain::{HistoryEntry, Points, UserId};
use crate::storage::LedgerStore;

/// Full history of one user for JSON export
#[derive(Debug, Clone, Serialize)]
pub struct HistoryExport {
    pub user_id: UserId,
    pub balance: Points,
    pub updated_at: DateTime<Utc>,
    pub exported_at: DateTime<Utc>,
    pub history: Vec<HistoryEntry>,
}

/// Exporter for converting ledger data to various formats
pub struct Exporter<'a, S> {
    service: &'a LedgerService<S>,
}

impl<'a, S: LedgerStore> Exporter<'a, S> {
    pub fn new(service: &'a LedgerService<S>) -> Self {
        Self { service }
    }

    /// Export a user's history to CSV format
    pub async fn export_history_csv<W: Write>(&self, user_id: UserId, writer: W) -> Result<usize> {
        let history = self.service.get_history(user_id).await?;
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record(["id", "kind", "amount", "timestamp"])?;

        for entry in &history {
            csv_writer.write_record(&[
                entry.id.map(|id| id.to_string()).unwrap_or_default(),
                entry.kind.as_str().to_string(),
                entry.amount.to_string(),
                entry.timestamp.to_rfc3339(),
            ])?;
        }

        csv_writer.flush()?;
        Ok(history.len())
    }

    /// Export a user's balance and history to pretty-printed JSON
    pub async fn export_history_json<W: Write>(&self, user_id: UserId, writer: W) -> Result<usize> {
        // Two separate reads: a charge landing in between shows up in the
        // history but not in the balance.
        let balance = self.service.get_balance(user_id).await?;
        let history = self.service.get_history(user_id).await?;
        let count = history.len();

        let export = HistoryExport {
            user_id,
            balance: balance.balance,
            updated_at: balance.updated_at,
            exported_at: Utc::now(),
            history,
        };
        serde_json::to_writer_pretty(writer, &export)?;
        Ok(count)
    }
}
