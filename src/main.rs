use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use speedtrap::agent::{Agent, Endpoint, RunOptions};
use speedtrap::config::Config;
use speedtrap::pipeline::Stage;
use speedtrap::report::{self, Report};

/// IPv6 alias resolution via fragmentation-identifier velocity.
#[derive(Parser)]
#[command(name = "speedtrap", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe a list of addresses through a running daemon.
    Run(RunArgs),
    /// Summarise one or more result files.
    Dump {
        /// Report to produce.
        #[arg(short = 'd', long = "report", value_enum)]
        report: Report,

        /// Result files written by earlier runs.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print version information and exit.
    Version,
}

#[derive(Args)]
#[command(group(ArgGroup::new("daemon").required(true).args(["port", "unix"])))]
struct RunArgs {
    /// File of IPv6 addresses to probe, one per line.
    #[arg(short = 'a', long = "addresses")]
    addresses: PathBuf,

    /// Result file every decoded object is written to.
    #[arg(short = 'o', long)]
    output: PathBuf,

    /// Daemon control port on the loopback interface.
    #[arg(short = 'p', long, value_parser = clap::value_parser!(u16).range(1..))]
    port: Option<u16>,

    /// Daemon control socket.
    #[arg(short = 'U', long = "unix")]
    unix: Option<PathBuf>,

    /// Assume every address increments and start at the descend stage.
    #[arg(short = 'I', long)]
    incrementing: bool,

    /// Append confirmed aliases to this file.
    #[arg(short = 'A', long = "aliases")]
    alias_log: Option<PathBuf>,

    /// Write logs to this file instead of stderr.
    #[arg(short = 'l', long = "log-file")]
    log_file: Option<PathBuf>,

    /// Stop after this stage completes.
    #[arg(short = 's', long)]
    stop: Option<Stage>,

    /// File of address pairs never to test with ally.
    #[arg(short = 'S', long = "skip")]
    skip: Option<PathBuf>,
}

/// Build-time version info, injected via RUSTFLAGS.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = match cli.command {
        Command::Version => {
            println!("speedtrap {}", version::full());
            return Ok(());
        }
        Command::Dump { report: kind, files } => {
            init_tracing(&cli.log_level, None)?;
            let cfg = Config::load_or_default(cli.config.as_deref())?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            return report::run(kind, &files, cfg.fudge, &mut out);
        }
        Command::Run(args) => args,
    };

    init_tracing(&cli.log_level, args.log_file.as_deref())?;

    let cfg = Config::load_or_default(cli.config.as_deref()).context("loading config")?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting speedtrap",
    );

    // One connection, one event loop: a single-threaded runtime suffices.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg, args))
}

fn init_tracing(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("creating log file {}", path.display()))?;
            fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => fmt().with_env_filter(filter).with_target(true).init(),
    }

    Ok(())
}

async fn run(cfg: Config, args: RunArgs) -> Result<()> {
    let endpoint = match (args.port, args.unix) {
        (Some(port), _) => Endpoint::Port(port),
        (None, Some(path)) => Endpoint::Unix(path),
        (None, None) => anyhow::bail!("one of --port or --unix is required"),
    };

    let agent = Agent::new(
        cfg,
        RunOptions {
            addresses: args.addresses,
            output: args.output,
            endpoint,
            assume_incrementing: args.incrementing,
            alias_log: args.alias_log,
            stop: args.stop,
            skip_pairs: args.skip,
        },
    )?;

    tokio::spawn(cancel_on_signal(agent.cancel_token()));

    let summary = agent.run().await?;

    tracing::info!(
        stage = %summary.stage,
        aliases = summary.aliases.len(),
        cancelled = summary.cancelled,
        "speedtrap stopped",
    );

    Ok(())
}

async fn cancel_on_signal(cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to register SIGTERM handler");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, finishing outstanding commands");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, finishing outstanding commands");
        }
    }

    cancel.cancel();
}
