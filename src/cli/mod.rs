use std::fs::File;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use crate::application::LedgerService;
use crate::domain::{parse_points, HistoryEntry, UserId};
use crate::io::{replay_csv, Exporter};

/// Pointbook - per-user point ledger
#[derive(Parser)]
#[command(name = "pointbook")]
#[command(about = "Charge, spend and audit per-user point balances")]
#[command(version)]
pub struct Cli {
    /// Database file path
    #[arg(
        short,
        long,
        env = "POINTBOOK_DATABASE",
        default_value = "pointbook.db",
        global = true
    )]
    pub database: String,

    /// Log filter (e.g. "warn", "pointbook=debug")
    #[arg(long, env = "POINTBOOK_LOG", default_value = "warn", global = true)]
    pub log_level: String,

    /// Give up on a charge or use after waiting this long for the user's ledger
    #[arg(long, env = "POINTBOOK_LOCK_TIMEOUT_MS", global = true)]
    pub lock_timeout_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new database
    Init,

    /// Show a user's balance
    Balance {
        /// User ID
        user: UserId,
    },

    /// Show a user's charge/use history
    History {
        /// User ID
        user: UserId,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = HistoryFormat::Table)]
        format: HistoryFormat,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Add points to a user's balance
    Charge {
        /// User ID
        user: UserId,

        /// Whole number of points
        amount: String,
    },

    /// Spend points from a user's balance
    Use {
        /// User ID
        user: UserId,

        /// Whole number of points
        amount: String,
    },

    /// Verify that a user's balance matches their history
    Check {
        /// User ID
        user: UserId,
    },

    /// Submit every operation of a CSV file (user_id,kind,amount) concurrently
    Replay {
        /// Input file (stdin if omitted)
        input: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HistoryFormat {
    Table,
    Csv,
    Json,
}

impl Cli {
    async fn service(&self) -> Result<LedgerService> {
        let service = LedgerService::connect(&self.database)
            .await
            .with_context(|| format!("Cannot open database '{}'", self.database))?;
        Ok(match self.lock_timeout_ms {
            Some(ms) => service.with_lock_timeout(Duration::from_millis(ms)),
            None => service,
        })
    }

    pub async fn run(self) -> Result<()> {
        match &self.command {
            Commands::Init => {
                LedgerService::init(&self.database).await?;
                println!("Database initialized: {}", self.database);
            }

            Commands::Balance { user } => {
                let service = self.service().await?;
                let entry = service.get_balance(*user).await?;
                println!(
                    "User {}: {} points (updated {})",
                    entry.user_id,
                    entry.balance,
                    entry.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }

            Commands::History {
                user,
                format,
                output,
            } => {
                let service = self.service().await?;
                run_history_command(&service, *user, *format, output.as_deref()).await?;
            }

            Commands::Charge { user, amount } => {
                let service = self.service().await?;
                let amount = parse_points(amount).context("Invalid amount")?;
                let entry = service.charge(*user, amount).await?;
                println!(
                    "Charged {} points to user {}: balance {}",
                    amount, entry.user_id, entry.balance
                );
            }

            Commands::Use { user, amount } => {
                let service = self.service().await?;
                let amount = parse_points(amount).context("Invalid amount")?;
                let entry = service.use_points(*user, amount).await?;
                println!(
                    "Used {} points from user {}: balance {}",
                    amount, entry.user_id, entry.balance
                );
            }

            Commands::Check { user } => {
                let service = self.service().await?;
                run_check_command(&service, *user).await?;
            }

            Commands::Replay { input } => {
                let service = Arc::new(self.service().await?);
                run_replay_command(service, input.as_deref()).await?;
            }
        }

        Ok(())
    }
}

async fn run_history_command(
    service: &LedgerService,
    user: UserId,
    format: HistoryFormat,
    output: Option<&str>,
) -> Result<()> {
    let writer: Box<dyn io::Write> = match output {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("Cannot create output file '{}'", path))?,
        ),
        None => Box::new(io::stdout()),
    };

    match format {
        HistoryFormat::Csv => {
            let count = Exporter::new(service).export_history_csv(user, writer).await?;
            eprintln!("Exported {} entries", count);
        }
        HistoryFormat::Json => {
            Exporter::new(service).export_history_json(user, writer).await?;
        }
        HistoryFormat::Table => {
            let history = service.get_history(user).await?;
            print_history_table(writer, &history)?;
        }
    }
    Ok(())
}

fn print_history_table(mut writer: impl io::Write, history: &[HistoryEntry]) -> Result<()> {
    if history.is_empty() {
        writeln!(writer, "No history found.")?;
        return Ok(());
    }

    writeln!(writer, "{:<8} {:<20} {:<8} {:>10}", "ID", "TIME", "KIND", "AMOUNT")?;
    writeln!(writer, "{}", "-".repeat(49))?;
    for entry in history {
        writeln!(
            writer,
            "{:<8} {:<20} {:<8} {:>10}",
            entry.id.map(|id| id.to_string()).unwrap_or_else(|| "-".into()),
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.kind.as_str(),
            entry.amount
        )?;
    }
    Ok(())
}

async fn run_check_command(service: &LedgerService, user: UserId) -> Result<()> {
    let report = service.verify(user).await?;

    println!("User:     {}", report.user_id);
    println!("Balance:  {}", report.balance);
    println!("Entries:  {}", report.entry_count);
    match report.replayed_balance {
        Some(replayed) => println!("Replayed: {}", replayed),
        None => println!("Replayed: history leaves the valid balance range"),
    }
    println!();

    if report.is_consistent {
        println!("Balance matches history");
        Ok(())
    } else {
        anyhow::bail!("balance of user {} does not match its history", report.user_id)
    }
}

async fn run_replay_command(service: Arc<LedgerService>, input: Option<&str>) -> Result<()> {
    let reader: Box<dyn io::Read> = match input {
        Some(path) => Box::new(
            File::open(path).with_context(|| format!("Cannot open input file '{}'", path))?,
        ),
        None => Box::new(io::stdin()),
    };

    let result = replay_csv(service, reader).await?;

    for outcome in &result.outcomes {
        match (&outcome.op, &outcome.result) {
            (Some(op), Ok(entry)) => println!(
                "line {:>4}: {} {} for user {} -> balance {}",
                outcome.line, op.kind, op.amount, op.user_id, entry.balance
            ),
            (Some(op), Err(error)) => println!(
                "line {:>4}: {} {} for user {} rejected: {}",
                outcome.line, op.kind, op.amount, op.user_id, error
            ),
            (None, Err(error)) => println!("line {:>4}: skipped: {}", outcome.line, error),
            (None, Ok(_)) => {}
        }
    }
    println!();
    println!("Applied: {}, rejected: {}", result.applied, result.rejected);
    Ok(())
}
