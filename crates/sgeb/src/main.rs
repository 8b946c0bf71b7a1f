//! sgeb - monorepo build driver
//!
//! Front-end for building, testing, publishing, and running units, plus
//! the post-submit controller tick used by CI.

use clap::{Parser, Subcommand};
use eyre::{eyre, WrapErr};
use sge_core::{Label, Monorepo, TargetExpression, UnitRegistry};
use sgeb::engine::{Engine, EngineOptions};
use sgeb::kv::KvStore;
use sgeb::notify::Notifier;
use sgeb::postsubmit::{PostSubmitController, TaskLauncher, TickContext};
use sgeb::process::{LogSink, TracingSink};
use sgeb::remote::{DispatchOptions, RemoteAction, RemoteDispatcher};
use sgeb::SystemConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Monorepo build driver.
#[derive(Parser)]
#[command(name = "sgeb")]
#[command(about = "Build, test, publish, and run monorepo units")]
#[command(version)]
struct Cli {
    /// Log level forwarded to tools (error, warn, info, debug).
    #[arg(long = "log_level", global = true, default_value = "info")]
    log_level: String,

    /// Dispatch the work to the remote CI fleet instead of running
    /// locally.
    #[arg(long, global = true)]
    remote: bool,

    /// Pending change to operate on.
    #[arg(short = 'c', long = "change", global = true)]
    change: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a unit.
    Build { label: String },
    /// Run a test unit, suite, or `...` expression.
    Test { label: String },
    /// Publish a unit.
    Publish {
        label: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Build a unit and run its binary.
    Run {
        label: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run a cron unit once, immediately.
    Cron {
        label: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run a task unit.
    Task {
        label: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// One post-submit controller tick over every post-submit unit.
    Postsubmit {
        /// Changelist the tick observes.
        #[arg(long, default_value_t = 0)]
        cl: u64,
        /// Changed files since the last observed CL.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        changed_files: Vec<String>,
    },
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
        Ok(all_passed) => {
            if all_passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the workload completed with every result a success.
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

    let scratch = scratch_dir();
    let sink: Arc<dyn LogSink> = Arc::new(TracingSink);
    let opts = EngineOptions {
        log_level: cli.log_level.clone(),
        change: cli.change.clone(),
        ..EngineOptions::default()
    };
    let engine = Engine::new(
        Arc::clone(&registry),
        &config,
        scratch,
        sink,
        cancel.clone(),
        opts,
    );

    if cli.remote {
        return dispatch_remote(&cli, &mr, &config).await;
    }

    match cli.command {
        Command::Build { label } => {
            let label = Label::parse(&mr, &cwd, &label, None)?;
            let result = engine.build(&label).await?;
            report(&result.name, result.success, &result.logs);
            Ok(result.success)
        }
        Command::Test { label } => {
            let expr = TargetExpression::parse(&mr, &cwd, &label)?;
            let labels = engine.expand_target_expression(&expr)?;
            let mut all_passed = true;
            for label in labels {
                let result = engine.test(&label).await?;
                for sub in &result.results {
                    report(&sub.name, sub.success, &sub.logs);
                    all_passed &= sub.success;
                }
            }
            Ok(all_passed)
        }
        Command::Publish { label, args } => {
            let label = Label::parse(&mr, &cwd, &label, None)?;
            let results = engine.publish(&label, &args).await?;
            let mut all_passed = true;
            for result in &results {
                report(&result.name, result.success, &result.logs);
                all_passed &= result.success;
            }
            Ok(all_passed)
        }
        Command::Run { label, args } => {
            let label = Label::parse(&mr, &cwd, &label, None)?;
            let resolved = engine.resolve_bin(&cwd, &label.to_string()).await?;
            let status = tokio::process::Command::new(&resolved.path)
                .args(&args)
                .current_dir(mr.root())
                .status()
                .await?;
            Ok(status.success())
        }
        Command::Cron { label, args } => {
            let label = Label::parse(&mr, &cwd, &label, None)?;
            let result = engine.run_cron(&label, &args).await?;
            report(&result.name, result.success, &result.logs);
            Ok(result.success)
        }
        Command::Task { label, args } => {
            let label = Label::parse(&mr, &cwd, &label, None)?;
            let result = engine.run_task(&label, &args).await?;
            report(&result.name, result.success, &result.logs);
            Ok(result.success)
        }
        Command::Postsubmit { cl, changed_files } => {
            let kv = Arc::new(KvStore::vcs(&config.kv.command));
            let notifier = if config.mail.smtp_host.is_empty() {
                Arc::new(Notifier::Disabled)
            } else {
                Arc::new(Notifier::smtp(&config.mail.smtp_host, &config.mail.from)?)
            };
            let dispatcher = RemoteDispatcher::new(config.ci.clone())?;
            let controller = PostSubmitController::new(
                Arc::clone(&mr),
                kv,
                notifier,
                TaskLauncher::Remote {
                    dispatcher,
                    log_level: cli.log_level.clone(),
                    invoker_url: config.ci.endpoint.clone(),
                },
                &config.environment,
            );
            let ctx = TickContext {
                now: chrono::Utc::now(),
                current_cl: cl,
                changed_files,
            };
            let ticked = controller.tick_all(&registry, &ctx).await?;
            tracing::info!(units = ticked.len(), "post-submit tick complete");
            Ok(true)
        }
    }
}

async fn dispatch_remote(cli: &Cli, mr: &Monorepo, config: &SystemConfig) -> eyre::Result<bool> {
    let cwd = std::env::current_dir()?;
    let (action, label, args) = match &cli.command {
        Command::Build { label } => (RemoteAction::Build, label, Vec::new()),
        Command::Test { label } => (RemoteAction::Test, label, Vec::new()),
        Command::Publish { label, args } => (RemoteAction::Publish, label, args.clone()),
        Command::Task { label, args } => (RemoteAction::Task, label, args.clone()),
        _ => return Err(eyre!("this command cannot be dispatched remotely")),
    };
    let label = Label::parse(mr, &cwd, label, None)?;
    let dispatcher = RemoteDispatcher::new(config.ci.clone())?;
    let opts = DispatchOptions {
        change: cli.change.clone(),
        log_level: cli.log_level.clone(),
        invoker: "sgeb".to_string(),
        args,
        ..DispatchOptions::default()
    };
    dispatcher.dispatch(action, &label, &opts).await?;
    Ok(true)
}

fn report(name: &str, success: bool, logs: &[sgeb::NamedLog]) {
    if success {
        tracing::info!(unit = name, "PASSED");
        return;
    }
    tracing::error!(unit = name, "FAILED");
    for log in logs {
        for line in log.contents.lines() {
            tracing::error!(unit = name, log = %log.name, "{line}");
        }
    }
}

fn scratch_dir() -> PathBuf {
    std::env::temp_dir().join(format!("sgeb-{}", uuid::Uuid::now_v7()))
}
