//! Error types for mirrorhost-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mirrorhost-core
#[derive(Error, Debug)]
pub enum Error {
    /// Storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Monitoring server API errors
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Telemetry sink errors
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// Task lifecycle errors
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (join failures, channel failures, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(StorageError::from(e))
    }
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Storage(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Remote(err) => Some(err.remediation()),
            Self::Sink(err) => Some(err.remediation()),
            Self::Lifecycle(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the data directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("A stored record could not be decoded.")
                    .command("Inspect task", "mirrorhost status --host <id>")
                    .alternative("Re-run the replication to rewrite the record."),
            ),
            Self::Runtime(_) => Some(
                Remediation::new("Restart the replay service or retry the command.")
                    .command("Restart", "mirrorhost serve"),
            ),
        }
    }

    /// True when the error is transient write contention on the task store.
    #[must_use]
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Storage(StorageError::Busy(_)))
    }
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite reported `SQLITE_BUSY` or `SQLITE_LOCKED`.
    #[error("Database is locked: {0}")]
    Busy(String),

    #[error("Database schema version ({current}) is newer than supported ({supported})")]
    SchemaTooNew { current: i32, supported: i32 },

    #[error("Database corruption detected: {details}")]
    Corruption { details: String },

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) => {
                Self::Busy(e.to_string())
            }
            Some(rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase) => {
                Self::Corruption {
                    details: e.to_string(),
                }
            }
            _ => Self::Database(e.to_string()),
        }
    }
}

impl StorageError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Database(_) => Remediation::new(
                "Database operation failed. Check data directory permissions and retry.",
            )
            .alternative("Ensure the data directory is writable."),
            Self::Busy(_) => Remediation::new(
                "The task database stayed locked through every retry. Another writer is holding it.",
            )
            .command("List jobs", "mirrorhost jobs")
            .alternative("Raise storage.commit_max_attempts or storage.busy_timeout_ms."),
            Self::SchemaTooNew { current, supported } => Remediation::new(format!(
                "Database schema version {current} is newer than supported ({supported}). Upgrade mirrorhost."
            ))
            .alternative("Point storage.db_path at a database created by this version."),
            Self::Corruption { .. } => Remediation::new(
                "Database corruption detected. Automatic recovery is not possible.",
            )
            .alternative("Delete the database file and re-run the replications."),
            Self::NotFound(_) => Remediation::new("The requested task was not found.")
                .command("List tasks", "mirrorhost status")
                .alternative("Start a replication for the host first."),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Invalid config: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => {
                Remediation::new(format!("Create the config file or pass a different path: {path}"))
                    .command("Check config", "mirrorhost config-check")
            }
            Self::ReadFailed(path, _) => {
                Remediation::new(format!("Check permissions on the config file: {path}"))
            }
            Self::ParseFailed(_) => Remediation::new("Fix the TOML syntax in the config file.")
                .command("Check config", "mirrorhost config-check"),
            Self::ValidationError(_) => {
                Remediation::new("Adjust the reported config value and retry.")
                    .command("Check config", "mirrorhost config-check")
            }
        }
    }
}

/// Monitoring server API errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The server answered with an error or could not be reached.
    #[error("{server} request failed: {message}")]
    Request { server: String, message: String },

    #[error("Host not found on {server}: {host_id}")]
    HostNotFound { server: String, host_id: String },

    #[error("Unexpected response from {server}: {message}")]
    InvalidResponse { server: String, message: String },
}

impl RemoteError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Request { server, .. } => {
                Remediation::new(format!("Check connectivity and credentials for {server}."))
            }
            Self::HostNotFound { server, host_id } => Remediation::new(format!(
                "Host {host_id} does not exist on {server}. Verify the host id."
            )),
            Self::InvalidResponse { server, .. } => Remediation::new(format!(
                "{server} returned data this version cannot interpret. Check the server version."
            )),
        }
    }
}

/// Telemetry sink errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The batch or sink address could not be prepared; nothing was sent.
    #[error("Sink setup failed: {0}")]
    Setup(String),

    /// An emission failed validation; nothing was sent.
    #[error("Invalid emission: {0}")]
    Validation(String),

    #[error("Sink transport failed: {0}")]
    Transport(String),

    #[error("Sink protocol error: {0}")]
    Protocol(String),

    #[error("Sink timed out after {0} ms")]
    Timeout(u64),
}

impl SinkError {
    /// True when the failure happened before anything went on the wire.
    #[must_use]
    pub fn is_setup(&self) -> bool {
        matches!(self, Self::Setup(_) | Self::Validation(_))
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        if self.is_setup() {
            Remediation::new("Check sink.host and sink.port and the stored task data.")
                .command("Check config", "mirrorhost config-check")
        } else {
            Remediation::new("The destination trapper did not accept the batch. Check that it is reachable.")
                .alternative("Raise sink.io_timeout_ms for slow links.")
        }
    }
}

/// Task lifecycle errors
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("No replication task for source host {0}")]
    TaskNotFound(String),

    #[error(
        "Source host {source_host_id} is already linked to {linked_dest}; refusing to relink to {requested_dest}"
    )]
    Conflict {
        source_host_id: String,
        linked_dest: String,
        requested_dest: String,
    },

    #[error("Task {0} is missing data required for this step: {1}")]
    MissingData(String, String),

    #[error("{0}")]
    RebuildFailed(String),
}

impl LifecycleError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::TaskNotFound(_) => Remediation::new("Start a replication for the host first.")
                .command("List tasks", "mirrorhost status"),
            Self::Conflict { .. } => Remediation::new(
                "Stop the existing replay before linking the host to another destination.",
            )
            .command("List tasks", "mirrorhost status"),
            Self::MissingData(_, _) => {
                Remediation::new("Re-run the replication so the task record is complete.")
            }
            Self::RebuildFailed(_) => Remediation::new(
                "Check that the destination host carries items with the source item keys.",
            ),
        }
    }
}
