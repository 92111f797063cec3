#![forbid(unsafe_code)]

//! `stagehand`: ordered process supervisor binary.
//!
//! `start` launches the configured stages in order and supervises them
//! until a shutdown signal or a `stop` request; `stop` and `status` talk to
//! a running supervisor over the local IPC socket.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use stagehand::config::GlobalConfig;
use stagehand::ipc::auth::{self, AuthToken};
use stagehand::ipc::{client, server};
use stagehand::models::stage::FailurePolicy;
use stagehand::orchestrator::supervisor::Supervisor;
use stagehand::pidfile::{self, PidFile};
use stagehand::{AppError, Result};

/// Extra time `stop --wait` allows beyond the configured grace period.
const STOP_WAIT_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "stagehand", about = "Ordered process supervisor", version, long_about = None)]
struct Cli {
    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Launch every stage in order and supervise until shutdown.
    Start {
        /// Path to the TOML configuration file.
        #[arg(long)]
        config: PathBuf,

        /// Override the configured failure policy.
        #[arg(long, value_enum)]
        policy: Option<FailurePolicy>,
    },

    /// Ask a running supervisor to terminate its stages and exit.
    Stop {
        /// Path to the TOML configuration file.
        #[arg(long)]
        config: PathBuf,

        /// Block until the supervisor has exited.
        #[arg(long)]
        wait: bool,
    },

    /// Print the state of a running supervisor as JSON.
    Status {
        /// Path to the TOML configuration file.
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> ExitCode {
    let args = Cli::parse();
    if let Err(err) = init_tracing(args.log_format) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    let result = match args.command {
        Command::Start { config, policy } => GlobalConfig::load_from_path(&config)
            .map(|mut config| {
                if let Some(policy) = policy {
                    config.failure_policy = policy;
                }
                config
            })
            .and_then(|config| {
                tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .build()
                    .map_err(|err| {
                        AppError::Config(format!("failed to build tokio runtime: {err}"))
                    })?
                    .block_on(start(config))
            }),
        Command::Stop { config, wait } => {
            GlobalConfig::load_from_path(&config).and_then(|config| stop(&config, wait))
        }
        Command::Status { config } => {
            GlobalConfig::load_from_path(&config).and_then(|config| status(&config))
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "stagehand failed");
            ExitCode::FAILURE
        }
    }
}

async fn start(config: GlobalConfig) -> Result<()> {
    let config = Arc::new(config);
    let _pid_file = PidFile::acquire(config.pid_path())?;
    let auth_token = AuthToken::issue(config.token_path())?;
    info!(stages = config.stages.len(), policy = ?config.failure_policy, "stagehand starting");

    let ct = CancellationToken::new();
    let supervisor = Supervisor::new(Arc::clone(&config), ct.clone());
    let ipc_handle = server::spawn_ipc_server(
        &config.ipc_name,
        supervisor.session(),
        ct.clone(),
        Some(auth_token.value().to_owned()),
    )?;

    let signal_ct = ct.clone();
    let signal_handle = tokio::spawn(async move {
        tokio::select! {
            () = shutdown_signal() => {
                info!("shutdown signal received");
                signal_ct.cancel();
            }
            () = signal_ct.cancelled() => {}
        }
    });

    let result = supervisor.run().await;

    ct.cancel();
    let (ipc_result, signal_result) = tokio::join!(ipc_handle, signal_handle);
    if let Err(err) = ipc_result {
        warn!(%err, "ipc server task failed");
    }
    if let Err(err) = signal_result {
        warn!(%err, "signal task failed");
    }
    info!("stagehand shut down");

    result
}

fn stop(config: &GlobalConfig, wait: bool) -> Result<()> {
    let request = serde_json::json!({ "command": "stop" });
    let token = auth::read_token(&config.token_path())
        .map_err(|err| warn!(%err, "no ipc token; the supervisor will refuse the request"))
        .ok();
    match client::send_command(&config.ipc_name, token.as_deref(), &request)
        .and_then(client::into_data)
    {
        Ok(data) => info!(%data, "stop requested"),
        Err(err) => {
            warn!(%err, "stop request failed; signalling pid from pid file");
            let pid = pidfile::signal_supervisor(&config.pid_path())?;
            info!(pid, "sent SIGTERM to supervisor");
        }
    }

    if wait {
        wait_for_exit(config)?;
    }
    Ok(())
}

fn wait_for_exit(config: &GlobalConfig) -> Result<()> {
    let path = config.pid_path();
    let deadline = Instant::now() + config.grace_period() + STOP_WAIT_SLACK;
    while Instant::now() < deadline {
        match pidfile::read_pid(&path)? {
            Some(pid) if pidfile::process_alive(pid) => {}
            _ => {
                info!("supervisor exited");
                return Ok(());
            }
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    Err(AppError::Shutdown(format!(
        "supervisor still running after {}ms",
        (config.grace_period() + STOP_WAIT_SLACK).as_millis()
    )))
}

fn status(config: &GlobalConfig) -> Result<()> {
    let request = serde_json::json!({ "command": "status" });
    let token = auth::read_token(&config.token_path())?;
    let data = client::into_data(client::send_command(
        &config.ipc_name,
        Some(&token),
        &request,
    )?)?;
    let pretty = serde_json::to_string_pretty(&data)
        .map_err(|err| AppError::Ipc(format!("failed to render status: {err}")))?;
    println!("{pretty}");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
