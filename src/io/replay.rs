use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use crate::application::{BalanceEntry, LedgerService};
use crate::domain::{parse_points, Points, TransactionKind, UserId};
use crate::storage::LedgerStore;

/// One row of an operations file: `user_id,kind,amount`
#[derive(Debug, Deserialize)]
struct ReplayRecord {
    user_id: String,
    kind: String,
    amount: String,
}

/// An operation that parsed cleanly and can be submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOp {
    pub user_id: UserId,
    pub kind: TransactionKind,
    pub amount: Points,
}

/// What happened to one line of the operations file
#[derive(Debug)]
pub struct ReplayOutcome {
    pub line: usize,
    /// `None` when the line could not be parsed
    pub op: Option<ReplayOp>,
    pub result: Result<BalanceEntry, String>,
}

/// Summary of a replay run, outcomes in file order
#[derive(Debug, Default)]
pub struct ReplayResult {
    pub applied: usize,
    pub rejected: usize,
    pub outcomes: Vec<ReplayOutcome>,
}

fn parse_record(record: &ReplayRecord) -> Result<ReplayOp, String> {
    let user_id = record
        .user_id
        .trim()
        .parse()
        .map_err(|_| format!("Invalid user_id: {:?}", record.user_id))?;
    let kind = TransactionKind::parse(record.kind.trim())
        .ok_or_else(|| format!("Invalid kind: {:?} (expected charge or use)", record.kind))?;
    let amount = parse_points(&record.amount).map_err(|e| format!("Invalid amount: {}", e))?;

    Ok(ReplayOp {
        user_id,
        kind,
        amount,
    })
}

/// Submit every operation of a CSV file concurrently.
///
/// Rows are grouped by user. Each user's operations run one after another
/// in file order inside a task of their own, while different users proceed
/// independently. Outcomes are reported in file order.
pub async fn replay_csv<S, R>(service: Arc<LedgerService<S>>, reader: R) -> Result<ReplayResult>
where
    S: LedgerStore + 'static,
    R: Read,
{
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut outcomes: Vec<ReplayOutcome> = Vec::new();
    let mut per_user: HashMap<UserId, Vec<(usize, ReplayOp)>> = HashMap::new();
    for (line_num, record) in csv_reader.deserialize::<ReplayRecord>().enumerate() {
        let line = line_num + 2; // +2 for header and 0-indexing

        let op = record
            .map_err(|e| format!("CSV parse error: {}", e))
            .and_then(|record| parse_record(&record));

        match op {
            Ok(op) => {
                per_user
                    .entry(op.user_id)
                    .or_default()
                    .push((outcomes.len(), op));
                outcomes.push(ReplayOutcome {
                    line,
                    op: Some(op),
                    result: Err("not applied".to_string()),
                });
            }
            Err(error) => outcomes.push(ReplayOutcome {
                line,
                op: None,
                result: Err(error),
            }),
        }
    }

    let workers: Vec<_> = per_user
        .into_values()
        .map(|ops| {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                let mut results = Vec::with_capacity(ops.len());
                for (index, op) in ops {
                    results.push((index, run_op(&service, op).await));
                }
                results
            })
        })
        .collect();

    for worker in workers {
        match worker.await {
            Ok(results) => {
                for (index, result) in results {
                    outcomes[index].result = result;
                }
            }
            // Lines of that user keep their "not applied" outcome.
            Err(err) => tracing::error!(error = %err, "replay worker failed"),
        }
    }

    let applied = outcomes.iter().filter(|o| o.result.is_ok()).count();
    Ok(ReplayResult {
        applied,
        rejected: outcomes.len() - applied,
        outcomes,
    })
}

/// Run one operation in its own task so a panic only fails its own line.
async fn run_op<S>(service: &Arc<LedgerService<S>>, op: ReplayOp) -> Result<BalanceEntry, String>
where
    S: LedgerStore + 'static,
{
    let service = Arc::clone(service);
    let handle = tokio::spawn(async move {
        service
            .transact(op.user_id, op.kind, op.amount)
            .await
            .map_err(|e| e.to_string())
    });

    match handle.await {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(user_id = op.user_id, error = %err, "replayed operation failed");
            Err(format!("Operation failed: {}", err))
        }
    }
}
