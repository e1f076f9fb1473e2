//! Server wiring.
//!
//! Resolves tool locations from the persisted config and command-line
//! overrides, and builds the [`SessionManager`] the IPC server fronts.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use droidpilot_core::adb::AdbBridgeFactory;
use droidpilot_core::app_helper::LocalAppHelper;
use droidpilot_core::chromedriver::ChromedriverFactory;
use droidpilot_core::config::DroidpilotConfig;
use droidpilot_core::ipc::droidpilot_dir;
use droidpilot_core::manager::SessionManager;

/// Effective settings for one server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub adb_path: PathBuf,
    pub adb_port: u16,
    pub chromedriver_path: PathBuf,
    pub chromedriver_base_port: u16,
    /// Where downloaded apps and generated preference files go.
    pub work_dir: PathBuf,
}

impl ServerSettings {
    /// Applies command-line overrides on top of the persisted config.
    pub fn resolve(
        config: DroidpilotConfig,
        adb: Option<PathBuf>,
        chromedriver: Option<PathBuf>,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            adb_path: adb.unwrap_or(config.adb_path),
            adb_port: config.adb_port,
            chromedriver_path: chromedriver.unwrap_or(config.chromedriver_path),
            chromedriver_base_port: config.chromedriver_base_port,
            work_dir,
        }
    }

    /// Default work directory (`~/.droidpilot/apps/`).
    pub fn default_work_dir() -> PathBuf {
        droidpilot_dir().join("apps")
    }
}

/// Builds the session manager with the real device, browser-driver and
/// app collaborators.
pub fn build_manager(settings: &ServerSettings) -> Arc<SessionManager> {
    info!(
        adb = %settings.adb_path.display(),
        chromedriver = %settings.chromedriver_path.display(),
        port = settings.chromedriver_base_port,
        "session manager configured"
    );
    Arc::new(SessionManager::new(
        Arc::new(AdbBridgeFactory::new(settings.adb_path.clone()).with_default_port(settings.adb_port)),
        Arc::new(ChromedriverFactory::new(
            settings.chromedriver_path.clone(),
            settings.chromedriver_base_port,
        )),
        Arc::new(LocalAppHelper::new(settings.work_dir.clone())),
    ))
}
