//! Per-session command history and event broadcasting.
//!
//! Every session owns a [`SessionJournal`]:
//!
//! - executed commands are kept in a ring buffer of the last 1000 entries
//! - each entry is appended to a JSON Lines file in `~/.droidpilot/logs/`
//! - [`SessionEvent`]s are broadcast to any subscribers (IPC clients)
//!
//! # Example
//!
//! ```no_run
//! use droidpilot_core::journal::SessionJournal;
//! use droidpilot_core::command::{Command, CommandResult};
//!
//! #[tokio::main]
//! async fn main() {
//!     let journal = SessionJournal::new("3f1c", "default");
//!     let mut rx = journal.subscribe();
//!
//!     journal.log_command(Command::GetPageSource, CommandResult::Success, false, Some(40)).await;
//! }
//! ```

use std::collections::VecDeque;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::command::{Command, CommandLog, CommandResult};
use crate::ipc::droidpilot_dir;

/// Maximum number of command log entries to retain in the ring buffer.
const MAX_COMMAND_LOG_SIZE: usize = 1000;

/// Returns the logs directory path (`~/.droidpilot/logs/`).
///
/// Creates the directory if it doesn't exist.
pub fn logs_dir() -> PathBuf {
    let dir = droidpilot_dir().join("logs");
    std::fs::create_dir_all(&dir).ok();
    dir
}

/// Events broadcast to subscribers when session state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    /// The session reached the ready state.
    Started {
        /// The session id.
        session_id: String,
    },

    /// A command was executed and logged.
    CommandLogged(CommandLog),

    /// The active context changed.
    ContextChanged {
        /// The new context name.
        context: String,
    },

    /// The session was deleted.
    Ended {
        /// The session id.
        session_id: String,
    },
}

/// Command history and event channel of one session.
pub struct SessionJournal {
    session_id: String,

    /// When the journal was opened.
    pub created_at: DateTime<Utc>,

    log: RwLock<VecDeque<CommandLog>>,

    event_tx: broadcast::Sender<SessionEvent>,

    log_writer: Mutex<Option<BufWriter<std::fs::File>>>,
}

impl SessionJournal {
    /// Opens a journal writing to `~/.droidpilot/logs/{name}_{timestamp}.jsonl`.
    pub fn new(session_id: impl Into<String>, name: &str) -> Self {
        Self::new_with_log_dir(session_id, name, logs_dir())
    }

    /// Opens a journal writing into `log_dir`.
    ///
    /// A log file that cannot be created only disables persistence.
    pub fn new_with_log_dir(session_id: impl Into<String>, name: &str, log_dir: PathBuf) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let created_at = Utc::now();

        let log_writer = {
            std::fs::create_dir_all(&log_dir).ok();
            let timestamp = created_at.format("%Y%m%d_%H%M%S");
            let log_path = log_dir.join(format!("{}_{}.jsonl", name, timestamp));
            std::fs::File::create(&log_path).ok().map(BufWriter::new)
        };

        Self {
            session_id: session_id.into(),
            created_at,
            log: RwLock::new(VecDeque::with_capacity(MAX_COMMAND_LOG_SIZE)),
            event_tx,
            log_writer: Mutex::new(log_writer),
        }
    }

    /// Subscribes to session events.
    ///
    /// Receivers that lag too far behind miss events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Broadcasts an event. Having no subscribers is not an error.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Announces that the session is ready.
    pub fn started(&self) {
        self.emit(SessionEvent::Started {
            session_id: self.session_id.clone(),
        });
    }

    /// Announces that the session ended.
    pub fn ended(&self) {
        self.emit(SessionEvent::Ended {
            session_id: self.session_id.clone(),
        });
    }

    /// Records an executed command, persists it and broadcasts it.
    ///
    /// When the ring buffer is full the oldest entry is dropped.
    pub async fn log_command(
        &self,
        command: Command,
        result: CommandResult,
        proxied: bool,
        duration_ms: Option<u64>,
    ) -> CommandLog {
        let log = CommandLog::new(command, result, duration_ms).proxied(proxied);

        {
            let mut entries = self.log.write().await;
            if entries.len() >= MAX_COMMAND_LOG_SIZE {
                entries.pop_front();
            }
            entries.push_back(log.clone());
        }

        {
            let mut writer_guard = self.log_writer.lock().await;
            if let Some(ref mut writer) = *writer_guard {
                if let Ok(json) = serde_json::to_string(&log) {
                    let _ = writeln!(writer, "{}", json);
                    let _ = writer.flush();
                }
            }
        }

        self.emit(SessionEvent::CommandLogged(log.clone()));
        log
    }

    /// All retained entries in chronological order.
    pub async fn entries(&self) -> Vec<CommandLog> {
        self.log.read().await.iter().cloned().collect()
    }
}

impl std::fmt::Debug for SessionJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionJournal")
            .field("session_id", &self.session_id)
            .field("created_at", &self.created_at)
            .field("log", &"<RwLock<VecDeque<CommandLog>>>")
            .field("event_tx", &"<broadcast::Sender>")
            .finish()
    }
}
