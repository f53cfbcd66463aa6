use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use regwatch_sync::{Overrides, SyncEngine};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "regwatch")]
#[command(about = "Scheduled refresh of business registration feeds")]
struct Cli {
    #[command(flatten)]
    overrides: OverrideArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Args)]
struct OverrideArgs {
    /// Hours between cycles (and default per-source interval).
    #[arg(long, global = true)]
    cycle_interval_hours: Option<i64>,
    /// Records requested from each producer per run.
    #[arg(long, global = true)]
    records_per_run: Option<usize>,
    /// Cap on each source's retention set.
    #[arg(long, global = true)]
    max_retention_size: Option<usize>,
}

impl From<&OverrideArgs> for Overrides {
    fn from(args: &OverrideArgs) -> Self {
        Self {
            cycle_interval_hours: args.cycle_interval_hours,
            records_per_run: args.records_per_run,
            max_retention_size: args.max_retention_size,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a single cycle, optionally for one source only.
    RunOnce {
        #[arg(long)]
        source: Option<String>,
    },
    /// Run cycles until interrupted.
    RunForever,
    /// Rebuild the aggregate export from stored retention sets.
    Export,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let engine = SyncEngine::from_env(&Overrides::from(&cli.overrides)).await?;

    match cli.command.unwrap_or(Commands::RunOnce { source: None }) {
        Commands::RunOnce { source } => {
            let report = engine.run_once(source.as_deref()).await?;
            println!(
                "cycle complete: run_id={} ok={} skipped={} failed={} disabled={} next_cycle_at={}",
                report.run_id,
                report.counts.ok,
                report.counts.skipped,
                report.counts.failed,
                report.counts.disabled,
                report.next_cycle_at
            );
        }
        Commands::RunForever => {
            let export_scheduler = engine.maybe_build_export_scheduler().await?;
            if let Some(sched) = &export_scheduler {
                sched.start().await?;
                info!("export cron scheduler started");
            }
            engine.run_forever(shutdown_signal()).await?;
            if let Some(mut sched) = export_scheduler {
                sched.shutdown().await?;
            }
        }
        Commands::Export => {
            let summary = engine.export().await?;
            println!(
                "export complete: records={} dir={}",
                summary.records.len(),
                summary.out_dir.display()
            );
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
