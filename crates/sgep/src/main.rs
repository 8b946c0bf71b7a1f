//! sgep - presubmit front-end
//!
//! Runs the presubmit over a changelist, or `sgep fix` to run only
//! fix-capable checks and apply their fixes.

use clap::{Parser, Subcommand};
use eyre::WrapErr;
use sge_core::{ChangedFile, Changelist, FileStatus, Monorepo, UnitRegistry};
use sgeb::engine::{Engine, EngineOptions};
use sgeb::process::{LogSink, TracingSink};
use sgeb::SystemConfig;
use sgep::listeners::{LoggingListener, MetricsListener};
use sgep::Presubmit;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Presubmit runner.
#[derive(Parser)]
#[command(name = "sgep")]
#[command(about = "Run presubmit checks over a changelist")]
#[command(version)]
struct Cli {
    /// Log level forwarded to tools.
    #[arg(long = "log_level", global = true, default_value = "info")]
    log_level: String,

    /// Pending change identifier.
    #[arg(short = 'c', long = "change", global = true)]
    change: Option<String>,

    /// CL description, for checks that want it.
    #[arg(long, global = true)]
    description: Option<String>,

    /// Changed files (root-relative). CI integrations pass the default
    /// changelist here.
    files: Vec<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run only fix-capable checks, then apply the returned fixes.
    Fix { files: Vec<String> },
}

fn main() -> ExitCode {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    match runtime.block_on(run(cli)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> eyre::Result<bool> {
    let cwd = std::env::current_dir().wrap_err("no working directory")?;
    let mr = Arc::new(Monorepo::find(&cwd)?);
    let config = SystemConfig::load(mr.root())?;
    let registry = Arc::new(UnitRegistry::new(Arc::clone(&mr)));

    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received SIGINT, cancelling");
            cancel_on_signal.cancel();
        }
    });

    let (fix_mode, files) = match &cli.command {
        Some(Command::Fix { files }) => (true, files.clone()),
        None => (false, cli.files.clone()),
    };
    let changelist = Changelist {
        number: 0,
        description: cli.description.clone(),
        files: files
            .iter()
            .map(|p| ChangedFile::new(p.clone(), FileStatus::Edit))
            .collect(),
    };

    let sink: Arc<dyn LogSink> = Arc::new(TracingSink);
    let engine = Arc::new(Engine::new(
        registry,
        &config,
        std::env::temp_dir().join(format!("sgep-{}", std::process::id())),
        Arc::clone(&sink),
        cancel.clone(),
        EngineOptions {
            log_level: cli.log_level.clone(),
            change: cli.change.clone(),
            ..EngineOptions::default()
        },
    ));

    let metrics = Arc::new(MetricsListener::new());
    let mut presubmit = Presubmit::new(engine, config, sink, cancel).with_fix_only(fix_mode);
    presubmit.add_listener(Arc::new(LoggingListener));
    presubmit.add_listener(Arc::clone(&metrics) as Arc<dyn sgep::PresubmitListener>);

    let results = presubmit.run(&changelist).await?;
    if fix_mode {
        let applied = presubmit.apply_fixes(&results).await;
        for (check, ok) in &applied {
            if *ok {
                tracing::info!(check, "fix applied");
            } else {
                tracing::error!(check, "fix failed");
            }
        }
    }
    metrics.join().await;
    Ok(results.iter().all(|r| r.success))
}
