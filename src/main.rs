use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use coin_ledger::engine::{CoinEngine, EngineConfig};
use coin_ledger::history::MAX_PAGE_SIZE;
use coin_ledger::reconciler::DEFAULT_SIGNATURE_TOLERANCE_SECS;
use coin_ledger::service::{build_router, ServiceConfig, ServiceState};
use coin_ledger::{process_mutations, verify_journal};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "coin-ledger", version, about = "Coin ledger and payment reconciliation service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP service
    Serve(ServeArgs),
    /// Apply `op,user,amount,reason,ref` rows from a CSV file and print balances
    Batch {
        input: PathBuf,
        /// Journal to apply the rows to; memory only when omitted
        #[arg(long)]
        journal: Option<PathBuf>,
    },
    /// Replay a journal and report accounts whose balance disagrees with their ledger
    Verify {
        #[arg(long, env = "COIN_LEDGER_JOURNAL")]
        journal: PathBuf,
    },
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Socket address to bind, e.g. 127.0.0.1:8080
    #[arg(long, default_value = "127.0.0.1:8080", env = "COIN_LEDGER_LISTEN")]
    listen: SocketAddr,
    /// Journal file; the ledger is kept in memory only when omitted
    #[arg(long, env = "COIN_LEDGER_JOURNAL")]
    journal: Option<PathBuf>,
    /// File holding payment events that need manual follow-up
    #[arg(long, env = "COIN_LEDGER_OPERATOR_QUEUE")]
    operator_queue: Option<PathBuf>,
    /// Shared secret for webhook signatures
    #[arg(long, env = "COIN_LEDGER_WEBHOOK_SECRET", hide_env_values = true)]
    webhook_secret: String,
    /// Token for admin routes; admin routes are disabled when omitted
    #[arg(long, env = "COIN_LEDGER_ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,
    #[arg(long, default_value_t = 5000, env = "COIN_LEDGER_LOCK_TIMEOUT_MS")]
    lock_timeout_ms: u64,
    #[arg(long, default_value_t = DEFAULT_SIGNATURE_TOLERANCE_SECS, env = "COIN_LEDGER_SIGNATURE_TOLERANCE_SECS")]
    signature_tolerance_secs: i64,
    #[arg(long, default_value_t = MAX_PAGE_SIZE, env = "COIN_LEDGER_MAX_PAGE_SIZE")]
    max_page_size: u32,
}

impl ServeArgs {
    fn into_config(self) -> ServiceConfig {
        ServiceConfig {
            journal_path: self.journal,
            operator_queue_path: self.operator_queue,
            webhook_secret: self.webhook_secret,
            admin_token: self.admin_token,
            signature_tolerance_secs: self.signature_tolerance_secs,
            engine: EngineConfig {
                lock_timeout: Duration::from_millis(self.lock_timeout_ms),
                max_page_size: self.max_page_size,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "coin_ledger=info,warn".to_string()),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Batch { input, journal } => {
            let engine = match journal {
                Some(path) => {
                    let journal = coin_ledger::persistence::FileJournal::open(&path)
                        .with_context(|| format!("Failed to open journal '{}'", path.display()))?;
                    CoinEngine::recover(Box::new(journal), EngineConfig::default())?
                }
                None => CoinEngine::in_memory(),
            };

            let file = File::open(&input)
                .with_context(|| format!("Failed to open input file '{}'", input.display()))?;

            process_mutations(&engine, file, io::stdout())
                .await
                .context("Failed to apply mutations and write output")?;
            Ok(())
        }
        Command::Verify { journal } => {
            let reports = verify_journal(&journal)
                .with_context(|| format!("Failed to replay journal '{}'", journal.display()))?;

            let inconsistent: Vec<_> = reports.iter().filter(|r| !r.is_consistent()).collect();
            for report in &inconsistent {
                println!("{}", serde_json::to_string(report)?);
            }
            info!(
                accounts = reports.len(),
                inconsistent = inconsistent.len(),
                "Journal verified"
            );

            anyhow::ensure!(
                inconsistent.is_empty(),
                "{} account(s) disagree with their ledger",
                inconsistent.len()
            );
            Ok(())
        }
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let listen = args.listen;
    let state = ServiceState::bootstrap(args.into_config())
        .context("Failed to load ledger state")?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!("coin-ledger listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
