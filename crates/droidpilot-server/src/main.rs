use std::path::PathBuf;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod server;
use server::{build_manager, ServerSettings};

use droidpilot_core::config::DroidpilotConfig;
use droidpilot_core::ipc::IpcServer;

#[derive(Parser)]
#[command(name = "droidpilot-server")]
#[command(about = "Standalone automation server for Android devices")]
struct Args {
    /// Server name for the IPC socket
    #[arg(short, long, default_value = "default", env = "DROIDPILOT_SESSION")]
    session: String,

    /// adb executable (overrides the config file)
    #[arg(long)]
    adb: Option<PathBuf>,

    /// chromedriver executable (overrides the config file)
    #[arg(long)]
    chromedriver: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let log_dir = droidpilot_core::journal::logs_dir();
    let file_appender = tracing_appender::rolling::never(&log_dir, "droidpilot-server.log");
    tracing_subscriber::fmt()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(session = %args.session, "Starting droidpilot-server");

    let settings = ServerSettings::resolve(
        DroidpilotConfig::load(),
        args.adb,
        args.chromedriver,
        ServerSettings::default_work_dir(),
    );
    let manager = build_manager(&settings);
    let server = IpcServer::new(manager.clone(), &args.session);

    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                warn!(error = %e, "IPC server exited");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
    }

    info!("Cleaning up");
    let reports = manager.delete_all().await;
    for (session_id, report) in &reports {
        if !report.is_clean() {
            warn!(session_id = %session_id, failures = report.failures.len(), "session teardown incomplete");
        }
    }
    drop(server);
    info!("Server stopped");

    Ok(())
}
