use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use consensus::{AuditSink, CancellationToken, JsonlAuditSink};
use grader_agents::{build_capability, load_batch, GraderConfig, GradingRun, ProviderKind};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "grader", about = "Self-consistency grading of free-form submissions")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Grade every unit in a JSON or YAML batch file
    Grade {
        /// Batch of gradable units (.json, .yaml, .yml)
        #[arg(long)]
        input: PathBuf,

        /// TOML config with [engine] and [provider] sections
        #[arg(long)]
        config: Option<PathBuf>,

        /// Append one JSONL record per attempt to this file
        #[arg(long)]
        audit: Option<PathBuf>,

        /// Where to write results JSON
        #[arg(long, default_value = "grading-results.json")]
        output: PathBuf,

        /// Attempts per unit (overrides config and GRADER_ATTEMPTS)
        #[arg(long)]
        attempts: Option<usize>,

        /// Minimum valid attempts for a trusted result
        #[arg(long)]
        quorum: Option<usize>,

        /// Use the offline mock grader instead of a model endpoint
        #[arg(long)]
        mock: bool,
    },
    /// Print the consistency report for a saved results file
    Report {
        #[arg(long)]
        results: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Grade {
            input,
            config,
            audit,
            output,
            attempts,
            quorum,
            mock,
        } => {
            let mut config = GraderConfig::load(config.as_deref())?;
            if let Some(n) = attempts {
                config.engine.attempt_count = n;
            }
            if let Some(q) = quorum {
                config.engine.quorum = Some(q);
            }
            if mock {
                config.provider.kind = ProviderKind::Mock;
            }

            let batch = load_batch(&input)?;
            let capability =
                build_capability(&config.provider).context("Failed to set up model provider")?;
            let audit: Option<Arc<dyn AuditSink>> = audit.map(|path| {
                info!(path = %path.display(), "auditing attempts");
                Arc::new(JsonlAuditSink::new(path)) as Arc<dyn AuditSink>
            });

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, finishing graded units and stopping");
                    on_signal.cancel();
                }
            });

            let run = grader_agents::grade(&config, batch, capability, audit, &cancel).await?;
            run.save(&output)?;
            info!(path = %output.display(), "results written");
            println!("{}", run.report());
        }
        Command::Report { results } => {
            let run = GradingRun::load(&results)?;
            println!("{}", run.report());
        }
    }

    Ok(())
}
