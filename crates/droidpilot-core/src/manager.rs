//! Session registry.
//!
//! [`SessionManager`] creates, looks up and deletes sessions. Each session
//! sits behind its own async mutex, so commands for one session run strictly
//! one at a time in arrival order while different sessions proceed
//! independently.
//!
//! The manager holds the collaborator factories and is the only place that
//! hands them to sessions.
//!
//! Deleted sessions are kept, closed, in a bounded set so a repeated delete
//! still reaches [`Session::delete`] and stops log capture again. Closed
//! sessions accept no commands.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::app_helper::AppHelper;
use crate::bridge::DeviceBridgeFactory;
use crate::capabilities::Capabilities;
use crate::command::Command;
use crate::error::DriverError;
use crate::executor::{CommandExecutor, ExecutionResult};
use crate::journal::{SessionEvent, SessionJournal};
use crate::lifecycle::TeardownReport;
use crate::secondary::SecondaryDriverFactory;
use crate::session::{Session, SessionState};

/// Listing entry for a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// The session id.
    pub session_id: String,
    /// Lifecycle state.
    pub state: String,
    /// Serial of the bound device, once acquired.
    pub device: Option<String>,
}

/// How many closed sessions are remembered for repeated deletes.
pub const CLOSED_SESSION_LIMIT: usize = 64;

/// Recently deleted sessions, oldest first.
#[derive(Default)]
struct ClosedSessions {
    order: VecDeque<String>,
    sessions: HashMap<String, Arc<Mutex<Session>>>,
}

impl ClosedSessions {
    fn insert(&mut self, id: String, session: Arc<Mutex<Session>>) {
        if self.sessions.insert(id.clone(), session).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > CLOSED_SESSION_LIMIT {
            if let Some(oldest) = self.order.pop_front() {
                self.sessions.remove(&oldest);
            }
        }
    }

    fn get(&self, id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(id).cloned()
    }
}

/// Owns every live session.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    closed: RwLock<ClosedSessions>,
    devices: Arc<dyn DeviceBridgeFactory>,
    secondary: Arc<dyn SecondaryDriverFactory>,
    apps: Arc<dyn AppHelper>,
    log_dir: Option<PathBuf>,
}

impl SessionManager {
    /// Creates a manager with the given collaborators.
    pub fn new(
        devices: Arc<dyn DeviceBridgeFactory>,
        secondary: Arc<dyn SecondaryDriverFactory>,
        apps: Arc<dyn AppHelper>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            closed: RwLock::new(ClosedSessions::default()),
            devices,
            secondary,
            apps,
            log_dir: None,
        }
    }

    /// Writes session journals into `dir` instead of `~/.droidpilot/logs/`.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Creates a session from raw capabilities and brings it to `Ready`.
    ///
    /// Returns the new session id and the capabilities reported back to the
    /// client. A failed creation leaves nothing registered.
    pub async fn create_session(&self, raw: &Value) -> Result<(String, Value), DriverError> {
        let caps = Capabilities::from_json(raw)?;
        let id = Uuid::new_v4().to_string();
        let journal = match &self.log_dir {
            Some(dir) => SessionJournal::new_with_log_dir(id.clone(), &id, dir.clone()),
            None => SessionJournal::new(id.clone(), &id),
        };

        let mut session = Session::new(id.clone(), caps, self.secondary.clone(), journal);
        session
            .create(self.devices.as_ref(), self.apps.as_ref())
            .await?;
        let capabilities = session.capabilities_json();

        self.sessions
            .write()
            .await
            .insert(id.clone(), Arc::new(Mutex::new(session)));
        info!(session_id = %id, "session registered");
        Ok((id, capabilities))
    }

    /// Tears a session down and moves it to the closed set.
    ///
    /// Commands already queued on the session finish first. Deleting a
    /// closed session succeeds with an `already_closed` report; only ids
    /// never seen (or long forgotten) fail with `NoSuchSession`.
    pub async fn delete_session(&self, session_id: &str) -> Result<TeardownReport, DriverError> {
        let session = {
            let mut live = self.sessions.write().await;
            match live.remove(session_id) {
                Some(session) => {
                    self.closed
                        .write()
                        .await
                        .insert(session_id.to_string(), Arc::clone(&session));
                    session
                }
                None => self
                    .closed
                    .read()
                    .await
                    .get(session_id)
                    .ok_or_else(|| DriverError::NoSuchSession(session_id.to_string()))?,
            }
        };

        let report = session.lock().await.delete().await;
        if !report.is_clean() {
            warn!(session_id, failures = report.failures.len(), "session deleted with teardown failures");
        }
        Ok(report)
    }

    /// Runs one command on a session.
    pub async fn execute(&self, session_id: &str, command: Command) -> Result<ExecutionResult, DriverError> {
        let session = self.get(session_id).await?;
        let mut session = session.lock().await;
        Ok(CommandExecutor::execute(&mut session, session_id, command).await)
    }

    /// Subscribes to a session's events.
    pub async fn subscribe(&self, session_id: &str) -> Result<broadcast::Receiver<SessionEvent>, DriverError> {
        let session = self.get(session_id).await?;
        let session = session.lock().await;
        Ok(session.journal().subscribe())
    }

    /// Summaries of every live session.
    ///
    /// A session busy with a command is reported as `Ready` without waiting.
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut summaries: Vec<SessionSummary> = sessions
            .iter()
            .map(|(id, session)| match session.try_lock() {
                Ok(session) => SessionSummary {
                    session_id: id.clone(),
                    state: session.state().to_string(),
                    device: session.device().ok().map(|b| b.serial().to_string()),
                },
                Err(_) => SessionSummary {
                    session_id: id.clone(),
                    state: SessionState::Ready.to_string(),
                    device: None,
                },
            })
            .collect();
        summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        summaries
    }

    /// Deletes every session; used on shutdown.
    pub async fn delete_all(&self) -> Vec<(String, TeardownReport)> {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        let mut reports = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(report) = self.delete_session(&id).await {
                reports.push((id, report));
            }
        }
        reports
    }

    async fn get(&self, session_id: &str) -> Result<Arc<Mutex<Session>>, DriverError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| DriverError::NoSuchSession(session_id.to_string()))
    }
}
