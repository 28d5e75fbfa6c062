use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Report, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use resq::config::Config;
use resq::error::{ErrorHandler, StructuredError};
use resq::history::{CachedHistoryClient, HistoryQuery, HistoryRecord, OperationType};
use resq::logging::init_logging;

#[derive(Parser, Debug)]
#[command(name = "resq")]
#[command(about = "Resilient, cached access to the instance history API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/resq/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List history records, one JSON object per line
  History {
    /// Only this instance
    #[arg(short, long)]
    instance: Option<u64>,

    /// create, update, delete or rollback
    #[arg(long)]
    operation: Option<OperationType>,

    /// Only records of this original instance (all-instance listing)
    #[arg(long)]
    original: Option<u64>,

    /// Pages to load
    #[arg(short, long, default_value_t = 1)]
    pages: usize,
  },
  /// Search records by name
  Search {
    term: String,

    #[arg(short, long)]
    instance: Option<u64>,
  },
  /// Show records by history id
  Get { ids: Vec<u64> },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_logging(&config.logging)?;

  let handler = Arc::new(ErrorHandler::default());
  let client = CachedHistoryClient::new(&config, handler)?;

  let records = match args.command {
    Command::History {
      instance,
      operation,
      original,
      pages,
    } => {
      let query = HistoryQuery {
        instance_id: instance,
        operation_type: operation,
        original_id: original,
        ..HistoryQuery::default()
      };

      client.history(&query).await.map_err(report)?;
      for _ in 1..pages {
        if client.next_page(&query).await.map_err(report)?.is_none() {
          break;
        }
      }
      client.history(&query).await.map_err(report)?
    }
    Command::Search { term, instance } => {
      let query = instance
        .map(HistoryQuery::for_instance)
        .unwrap_or_default();
      client
        .search(&query, &term)
        .await
        .map_err(report)?
        .unwrap_or_default()
    }
    Command::Get { ids } => client.records(&ids).await.map_err(report)?,
  };

  info!(records = records.len(), "done");
  print_records(&records)
}

/// Render a structured error for the terminal.
fn report(error: StructuredError) -> Report {
  let mut message = format!("{} ({})", error.user_message(), error.message());
  for suggestion in error.suggestions() {
    message.push_str(&format!("\n  - {}", suggestion));
  }
  eyre!(message)
}

fn print_records(records: &[HistoryRecord]) -> Result<()> {
  for record in records {
    println!("{}", serde_json::to_string(record)?);
  }
  Ok(())
}
