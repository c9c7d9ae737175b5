//! AuditTrail Operator CLI
//!
//! Provisions the audit table and runs the read-side queries against any
//! configured backend:
//! - init-schema: create the table and indexes (or print the DDL)
//! - list / get: full audit documents
//! - by-action / by-range: filtered documents
//! - summary: last event per entity

use std::path::PathBuf;

use anyhow::Result;
use at_common::{logging::init_logging, timestamp, AuditAction, AuditLogEntry, AuditSummary};
use at_config::{AuditConfig, ConfigLoader};
use at_core::{ensure_schema, AuditQueryService, DocumentCodec};
use at_store::open_backend;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

/// AuditTrail CLI
#[derive(Parser, Debug)]
#[command(name = "at-audit")]
#[command(about = "AuditTrail - provision and query entity audit logs")]
struct Args {
    /// Configuration file (otherwise AUDIT_TRAIL_CONFIG or the standard paths)
    #[arg(long, env = "AUDIT_TRAIL_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, env = "AUDIT_TRAIL_OUTPUT", value_enum, default_value = "json")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the audit table and its indexes
    InitSchema {
        /// Print the provisioning statement instead of running it
        #[arg(long)]
        print: bool,
    },
    /// Print a sample configuration file
    ExampleConfig,
    /// Audit documents of one source type, ordered by key
    List {
        source_type: String,
        #[arg(long, default_value = "0")]
        skip: u64,
        #[arg(long, default_value = "50")]
        take: u64,
    },
    /// The audit document of one entity
    Get { source_type: String, source_key: String },
    /// Last event of each entity of one source type
    Summary {
        source_type: String,
        #[arg(long, default_value = "0")]
        skip: u64,
        #[arg(long, default_value = "50")]
        take: u64,
    },
    /// Documents with at least one event of the given action
    ByAction { source_type: String, action: AuditAction },
    /// Documents with at least one event in [from, to]
    ByRange {
        source_type: String,
        #[arg(long, value_parser = parse_timestamp)]
        from: DateTime<Utc>,
        /// Defaults to now
        #[arg(long, value_parser = parse_timestamp)]
        to: Option<DateTime<Utc>>,
        /// Also require an event with this action
        #[arg(long)]
        action: Option<AuditAction>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Json,
    Text,
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    timestamp::parse(value).map_err(|e| format!("expected an RFC 3339 timestamp: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging("at-audit");
    let args = Args::parse();

    if let Command::ExampleConfig = args.command {
        print!("{}", AuditConfig::example_toml());
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => ConfigLoader::with_path(path).load()?,
        None => ConfigLoader::new().load()?,
    };
    let backend = open_backend(&config).await?;
    let codec = DocumentCodec::new(config.document.format);

    if let Command::InitSchema { print } = args.command {
        if print {
            println!("{}", backend.provisioning_statement());
        } else {
            backend.init_schema().await?;
            info!(table = %backend.table_config().qualified_name(), "Audit schema ready");
        }
        return Ok(());
    }

    ensure_schema(backend.schema(), config.storage.auto_provision, &codec).await?;
    let queries = AuditQueryService::new(backend.into_reader(), codec);

    let output = match args.command {
        Command::List { source_type, skip, take } => {
            render_logs(args.output, &queries.get_logs_by_type(&source_type, skip, take).await?)?
        }
        Command::Get { source_type, source_key } => {
            let logs: Vec<_> = queries.get_log(&source_type, &source_key).await?.into_iter().collect();
            render_logs(args.output, &logs)?
        }
        Command::Summary { source_type, skip, take } => {
            render_summaries(args.output, &queries.get_audit_summary(&source_type, skip, take).await?)?
        }
        Command::ByAction { source_type, action } => {
            render_logs(args.output, &queries.get_logs_by_action(&source_type, action).await?)?
        }
        Command::ByRange { source_type, from, to, action } => {
            let logs = match action {
                Some(action) => {
                    queries
                        .get_logs_by_action_and_date_range(&source_type, action, from, to)
                        .await?
                }
                None => queries.get_logs_by_date_range(&source_type, from, to).await?,
            };
            render_logs(args.output, &logs)?
        }
        Command::InitSchema { .. } | Command::ExampleConfig => return Ok(()),
    };

    println!("{}", output);
    Ok(())
}

fn render_logs(format: OutputFormat, logs: &[AuditLogEntry]) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(logs)?),
        OutputFormat::Text => Ok(logs
            .iter()
            .map(|log| {
                let mut block = format!("{} ({} events)", log.identity(), log.events.len());
                for event in &log.events {
                    block.push_str("\n  ");
                    block.push_str(&event.format_human_readable().replace('\n', "\n  "));
                }
                block
            })
            .collect::<Vec<_>>()
            .join("\n\n")),
    }
}

fn render_summaries(format: OutputFormat, summaries: &[AuditSummary]) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(summaries)?),
        OutputFormat::Text => Ok(summaries
            .iter()
            .map(|s| {
                format!(
                    "{}#{}\t{}\t{}\t{}",
                    s.source_type,
                    s.source_key,
                    s.last_action.map(|a| a.as_str()).unwrap_or("-"),
                    s.last_timestamp.as_ref().map(timestamp::format).unwrap_or_else(|| "-".into()),
                    s.last_actor.as_deref().unwrap_or("-"),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")),
    }
}
