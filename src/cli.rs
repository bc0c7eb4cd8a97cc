//! Operator command line for the recovery engine and its backup store.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use crate::backup::plan::generate_plan;
use crate::backup::{BackupStore, BackupType, IntegrityReport, RecoveryPlan, ScanOptions};
use crate::config::ResilienceConfig;
use crate::errors::{EXIT_INTEGRITY_FAILURE, EXIT_SUCCESS};
use crate::observability::telemetry::init_tracing;
use crate::recovery::RecoveryOrchestrator;

#[derive(Parser, Debug)]
#[command(name = "resilience")]
#[command(about = "Automated recovery engine and verified backup store")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Storage root, overriding `backup.storage_location`
    #[arg(short, long, value_name = "DIR", global = true)]
    pub storage: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub format: OutputFormat,

    /// Log JSON lines to stderr
    #[arg(long, global = true)]
    pub json_logs: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text (default)
    #[default]
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Run the engine and its monitoring loop until SIGINT/SIGTERM
    Run,

    /// Check stored backups against their checksums
    Verify {
        /// Only check this component's backups
        #[arg(long)]
        component: Option<String>,
        /// Also rebuild and structurally validate payloads
        #[arg(long)]
        deep: bool,
        /// Repair damaged backups from a verified sibling
        #[arg(long)]
        repair: bool,
    },

    /// List registered backups
    Backups {
        #[arg(long)]
        component: Option<String>,
    },

    /// Print the recovery plan for a corruption level
    Plan {
        /// Corrupted share of the data, 0 to 100
        #[arg(long, value_parser = parse_percentage)]
        corruption: f64,
        /// Affected data, e.g. `db/state`
        #[arg(long, value_delimiter = ',')]
        affected: Vec<String>,
    },

    /// Re-encrypt every encrypted backup with a fresh key
    RotateKey,
}

fn parse_percentage(s: &str) -> Result<f64, String> {
    let value: f64 = s.parse().map_err(|_| format!("'{}' is not a number", s))?;
    if (0.0..=100.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("{} is outside 0..=100", value))
    }
}

/// Parse arguments from the process and run. Returns the process exit code.
pub async fn run<F>(shutdown: F) -> Result<u8>
where
    F: Future<Output = ()>,
{
    execute(Cli::parse(), shutdown).await
}

pub async fn execute<F>(cli: Cli, shutdown: F) -> Result<u8>
where
    F: Future<Output = ()>,
{
    let mut config = ResilienceConfig::load(cli.config.as_deref())?;
    if let Some(storage) = cli.storage {
        config = config.with_storage(storage);
    }
    if cli.json_logs {
        config.logging.json = true;
    }
    init_tracing(&config.logging);

    match cli.command {
        Commands::Run => run_engine(config, shutdown).await,
        Commands::Verify {
            component,
            deep,
            repair,
        } => {
            let store = Arc::new(open_store(&config)?);
            let options = ScanOptions {
                component,
                deep,
                repair,
            };
            let scan_store = Arc::clone(&store);
            let report = tokio::task::spawn_blocking(move || scan_store.scan(&options))
                .await
                .context("integrity scan task panicked")?;
            let path = store.write_report(&report)?;
            print_report(&report, cli.format)?;
            if cli.format == OutputFormat::Text {
                println!("Report written to {}", path.display());
            }
            let unresolved = report
                .checks
                .iter()
                .any(|c| c.is_damaged() && c.repair_succeeded != Some(true));
            Ok(if unresolved {
                EXIT_INTEGRITY_FAILURE
            } else {
                EXIT_SUCCESS
            })
        }
        Commands::Backups { component } => {
            let store = open_store(&config)?;
            let backups = store.list(component.as_deref());
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&backups)?),
                OutputFormat::Text => {
                    if backups.is_empty() {
                        println!("No backups");
                    }
                    for b in &backups {
                        println!(
                            "{}  {}  {}/{}  {:?}  {} bytes  {}",
                            b.id,
                            b.timestamp.format("%Y-%m-%d %H:%M:%S"),
                            b.component,
                            b.data_type,
                            b.backup_type,
                            b.size,
                            if b.restorable { "restorable" } else { "unrestorable" }
                        );
                    }
                }
            }
            Ok(EXIT_SUCCESS)
        }
        Commands::Plan {
            corruption,
            affected,
        } => {
            let store = open_store(&config)?;
            let healthy: Vec<_> = store
                .list(None)
                .into_iter()
                .filter(|b| b.verified && b.restorable)
                .collect();
            let has_full = healthy.iter().any(|b| b.backup_type == BackupType::Full);
            let plan = generate_plan(corruption, &affected, !healthy.is_empty(), has_full);
            print_plan(&plan, cli.format)?;
            Ok(EXIT_SUCCESS)
        }
        Commands::RotateKey => {
            let store = Arc::new(open_store(&config)?);
            let rotation = tokio::task::spawn_blocking(move || store.rotate_key())
                .await
                .context("key rotation task panicked")??;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rotation)?),
                OutputFormat::Text => println!(
                    "Re-encrypted {} backup(s) under key {}{}",
                    rotation.rewritten,
                    rotation.key_id,
                    if rotation.resumed { " (resumed)" } else { "" }
                ),
            }
            Ok(EXIT_SUCCESS)
        }
    }
}

fn open_store(config: &ResilienceConfig) -> Result<BackupStore> {
    BackupStore::open(config.backup.clone()).with_context(|| {
        format!(
            "Cannot open backup store at {}",
            config.backup.storage_location.display()
        )
    })
}

async fn run_engine<F>(config: ResilienceConfig, shutdown: F) -> Result<u8>
where
    F: Future<Output = ()>,
{
    let engine = RecoveryOrchestrator::new(config)?;
    if !engine.start_monitoring() {
        tracing::warn!("Monitoring is disabled; waiting for shutdown");
    }
    shutdown.await;
    eprintln!("Received shutdown signal, stopping...");
    let report = engine.shutdown().await;
    tracing::info!(
        cancelled = report.cancelled,
        forced = report.forced,
        "Engine stopped"
    );
    Ok(EXIT_SUCCESS)
}

fn print_report(report: &IntegrityReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Text => {
            println!(
                "Checked {} backup(s): {} valid, {} corrupted, {} missing, {} unknown ({:.1}% damaged)",
                report.total,
                report.valid,
                report.corrupted,
                report.missing,
                report.unknown,
                report.corruption_percentage
            );
            for check in report.checks.iter().filter(|c| c.is_damaged()) {
                let repair = match (check.repair_attempted, check.repair_succeeded) {
                    (false, _) if check.auto_repairable => " [repairable]",
                    (false, _) => "",
                    (true, Some(true)) => " [repaired]",
                    (true, _) => " [repair failed]",
                };
                println!(
                    "  {:?} {} {}/{}: {}{}",
                    check.status,
                    check.backup_id,
                    check.component,
                    check.data_type,
                    check.message.as_deref().unwrap_or("-"),
                    repair
                );
            }
        }
    }
    Ok(())
}

fn print_plan(plan: &RecoveryPlan, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(plan)?),
        OutputFormat::Text => {
            println!(
                "Corruption {:.1}%: risk {:?}, ~{}s{}",
                plan.corruption_percentage,
                plan.data_loss_risk,
                plan.total_estimated_secs,
                if plan.approval_required {
                    ", approval required"
                } else {
                    ""
                }
            );
            for step in &plan.steps {
                println!(
                    "  {}. {:?} ({}s): {}",
                    step.order, step.kind, step.estimated_secs, step.description
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_flags() {
        let cli = Cli::try_parse_from([
            "resilience",
            "verify",
            "--component",
            "db",
            "--deep",
            "--storage",
            "/tmp/x",
        ])
        .unwrap();
        assert_eq!(
            cli.command,
            Commands::Verify {
                component: Some("db".into()),
                deep: true,
                repair: false
            }
        );
        assert_eq!(cli.storage, Some(PathBuf::from("/tmp/x")));
    }

    #[test]
    fn test_plan_rejects_out_of_range() {
        assert!(Cli::try_parse_from(["resilience", "plan", "--corruption", "150"]).is_err());
        assert!(Cli::try_parse_from(["resilience", "plan", "--corruption", "lots"]).is_err());
        let cli = Cli::try_parse_from([
            "resilience",
            "plan",
            "--corruption",
            "30",
            "--affected",
            "db/state,cache/index",
        ])
        .unwrap();
        match cli.command {
            Commands::Plan {
                corruption,
                affected,
            } => {
                assert_eq!(corruption, 30.0);
                assert_eq!(affected, vec!["db/state", "cache/index"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_format_flag() {
        let cli = Cli::try_parse_from(["resilience", "backups", "--format", "json"]).unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from([
            "resilience",
            "run",
            "--storage",
            dir.path().to_str().unwrap(),
        ])
        .unwrap();
        let code = execute(cli, async {}).await.unwrap();
        assert_eq!(code, EXIT_SUCCESS);
    }
}
