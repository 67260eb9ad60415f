//! Error taxonomy for bring-up, readiness and teardown

use std::path::PathBuf;
use std::time::Duration;

/// Errors raised while installing, launching, preloading or stopping services
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// Network or IO failure while fetching an artifact. Not retried automatically.
    #[error("failed to download {url}: {source:#}")]
    Download {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    /// Archive digest does not match the manifest. Artifacts have been removed.
    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    /// No recorded digest for the artifact and unverified installs are refused
    #[error("no recorded checksum for {url} and unverified installs are refused")]
    UntestedArtifact { url: String },

    /// The archive could not be unpacked or did not contain the expected entry
    #[error("failed to extract {entry} from {}: {source:#}", archive.display())]
    Extract {
        archive: PathBuf,
        entry: String,
        #[source]
        source: anyhow::Error,
    },

    /// The executable could not be spawned. Never retried.
    #[error("failed to spawn {name} ({command}): {source}")]
    ProcessSpawn {
        name: String,
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A service did not pass its health probe before the deadline
    #[error("{name} not healthy after {elapsed:?} ({attempts} probes): {last_error}")]
    HealthTimeout {
        name: String,
        elapsed: Duration,
        attempts: u32,
        last_error: String,
    },

    /// A service exited while it was still expected to become healthy
    #[error("{name} exited before becoming healthy: {status}")]
    ProcessExited { name: String, status: String },

    /// A reachability target did not respond before the deadline
    #[error("{target} not reachable after {elapsed:?} ({attempts} probes): {last_error}")]
    ConvergenceTimeout {
        target: String,
        elapsed: Duration,
        attempts: u32,
        last_error: String,
    },

    /// A preload transaction was rejected. The dependent process must not be started.
    #[error("{backend} preload transaction aborted: {source:#}")]
    PreloadTransaction {
        backend: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// An authentication bootstrap step failed. The backend may be left half-configured.
    #[error("{backend} auth bootstrap failed at '{step}': {source:#}")]
    AuthBootstrap {
        backend: &'static str,
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// The OS refused to terminate or reap a process
    #[error("failed to terminate {name}: {source}")]
    Termination {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// An operation was requested in a lifecycle state that does not allow it
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BootstrapError {
    /// True for failures produced by an exhausted readiness deadline
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            BootstrapError::HealthTimeout { .. } | BootstrapError::ConvergenceTimeout { .. }
        )
    }
}

pub type Result<T, E = BootstrapError> = std::result::Result<T, E>;
