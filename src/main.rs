use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ebpfmon::config::Config;
use ebpfmon::daemon::{self, DaemonStatus};
use ebpfmon::logging::DailyLogWriter;

const EXIT_CONFIG: u8 = 1;
const EXIT_PERMISSION: u8 = 2;
const EXIT_LOAD: u8 = 3;
const EXIT_RUNTIME: u8 = 4;

/// Multi-subsystem Linux kernel telemetry collector built on eBPF.
#[derive(Parser)]
#[command(name = "ebpfmon", version, about)]
struct Cli {
    /// Comma-separated monitors to enable; overrides the config file.
    #[arg(short = 'm', value_name = "names", value_delimiter = ',')]
    monitors: Option<Vec<String>>,

    /// Configuration file path.
    #[arg(short = 'c', long = "config", value_name = "path")]
    config: Option<PathBuf>,

    /// Run as a background process.
    #[arg(long)]
    daemon: bool,

    /// Report the daemon's status and exit.
    #[arg(long)]
    daemon_status: bool,

    /// Stop a running daemon and exit.
    #[arg(long)]
    daemon_stop: bool,

    /// Raise the log level to debug.
    #[arg(short, long)]
    verbose: bool,

    /// Override the CSV output directory.
    #[arg(long, value_name = "path")]
    output_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Configuration problems are fatal before anything else runs.
    let mut cfg = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("ebpfmon: {e}");
                return ExitCode::from(EXIT_CONFIG);
            }
        },
        None => Config::default(),
    };

    if let Some(names) = &cli.monitors {
        if let Err(e) = cfg.select_monitors(names) {
            eprintln!("ebpfmon: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    }

    if let Some(dir) = &cli.output_dir {
        cfg.output.directory = dir.clone();
    }

    if cfg.enabled_monitors().is_empty() {
        eprintln!("ebpfmon: no monitors enabled");
        return ExitCode::from(EXIT_CONFIG);
    }

    // Daemon inspection commands never start the collector.
    if cli.daemon_status {
        return match daemon::status(&cfg.daemon.pid_file) {
            Ok(DaemonStatus::Running(pid)) => {
                println!("running (pid {pid})");
                ExitCode::SUCCESS
            }
            Ok(DaemonStatus::NotRunning) => {
                println!("not running");
                ExitCode::SUCCESS
            }
            Ok(DaemonStatus::Stale(pid)) => {
                println!("stale pid file (pid {pid} is gone)");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("ebpfmon: {e}");
                ExitCode::from(EXIT_RUNTIME)
            }
        };
    }

    if cli.daemon_stop {
        return match daemon::stop(&cfg.daemon.pid_file, cfg.stop_timeout * 2) {
            Ok(true) => {
                println!("stopped");
                ExitCode::SUCCESS
            }
            Ok(false) => {
                println!("not running");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("ebpfmon: {e}");
                ExitCode::from(EXIT_RUNTIME)
            }
        };
    }

    // Fork before the runtime exists; a multi-threaded fork only carries
    // the calling thread.
    let daemonized = cli.daemon;
    if daemonized {
        if let Err(e) = daemon::daemonize(&cfg.daemon.pid_file) {
            eprintln!("ebpfmon: {e}");
            return ExitCode::from(EXIT_RUNTIME);
        }
    }

    if let Err(e) = init_logging(&cfg, cli.verbose) {
        eprintln!("ebpfmon: {e}");
        return ExitCode::from(EXIT_CONFIG);
    }

    let code = run(cfg, daemonized);
    ExitCode::from(code)
}

fn init_logging(cfg: &Config, verbose: bool) -> Result<()> {
    let level: &str = if verbose { "debug" } else { &cfg.log_level };
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    let file_writer = DailyLogWriter::new(&cfg.logs.directory, cfg.logs.retention_days)
        .context("creating log file writer")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    Ok(())
}

#[cfg(feature = "bpf")]
fn run(cfg: Config, daemonized: bool) -> u8 {
    use ebpfmon::context::ApplicationContext;
    use ebpfmon::error::LoadError;
    use ebpfmon::output::OutputController;
    use ebpfmon::supervisor::{self, Supervisor};

    let pid_file = cfg.daemon.pid_file.clone();

    let ctx = match ApplicationContext::init(cfg) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            return EXIT_RUNTIME;
        }
    };

    if let Err(e) = ctx.caps.ensure_bpf_ready() {
        tracing::error!(error = %e, "environment cannot load BPF");
        return match e {
            LoadError::InsufficientPrivilege => EXIT_PERMISSION,
            _ => EXIT_LOAD,
        };
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        kernel = %ctx.caps.kernel_release,
        host = %ctx.hostname,
        monitors = ?ctx.config.enabled_monitors(),
        "starting ebpfmon",
    );

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "runtime setup failed");
            return EXIT_RUNTIME;
        }
    };

    let code = rt.block_on(async {
        let enabled = ctx.config.enabled_monitors();

        let mut output = match OutputController::new(
            ctx.config.output.clone(),
            &ctx.hostname,
            enabled.len(),
        ) {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(error = %e, "output controller setup failed");
                return EXIT_RUNTIME;
            }
        };

        let mut supervisor = Supervisor::new(&ctx);

        let report = match supervisor.start(&mut output) {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "supervisor start failed");
                return EXIT_RUNTIME;
            }
        };

        if supervisor::all_monitors_failed(&ctx.config, report) {
            tracing::error!("all configured monitors failed to start");
            supervisor.shutdown().await;
            return EXIT_LOAD;
        }

        tracing::info!(
            started = report.started,
            failed = report.failed,
            "collection running",
        );

        let code = match supervisor::wait_for_shutdown_signal().await {
            Ok(()) => 0,
            Err(e) => {
                tracing::error!(error = %e, "signal handling failed");
                EXIT_RUNTIME
            }
        };

        supervisor.shutdown().await;
        output.close(ctx.config.stop_timeout).await;
        supervisor.print_summary();

        code
    });

    if daemonized {
        daemon::remove_pid_file(&pid_file);
    }

    tracing::info!("ebpfmon stopped");
    code
}

#[cfg(not(feature = "bpf"))]
fn run(_cfg: Config, _daemonized: bool) -> u8 {
    tracing::error!("this build has no BPF support (compiled without the 'bpf' feature)");
    EXIT_RUNTIME
}
