//! Error types.

use std::path::PathBuf;

/// Error type for mockmail.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Malformed template at offset {offset}: {reason}")]
    MalformedTemplate { offset: usize, reason: &'static str },
    #[error("Unknown template {0:?}")]
    UnknownTemplate(String),
    #[error("Partials nested too deeply at {0:?}")]
    PartialDepth(String),
    #[error("No mail with id {0:?}")]
    NotFound(String),
    #[error("Configuration is invalid: {0}")]
    Config(#[source] serde_json::Error),
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
    #[error("Unknown user {0}")]
    UnknownUser(String),
    #[error("Unknown group {0}")]
    UnknownGroup(String),
    #[error("No pidfile set! Use --pidfile or the \"pidfile\" configuration option")]
    NoPidfile,
    #[error("mockmail is already running (pid {pid}, read from {})", path.display())]
    AlreadyRunning { pid: i32, path: PathBuf },
    #[error("mockmail failed to start in the background: {0}")]
    StartFailed(String),
    #[error(transparent)]
    Sys(#[from] nix::errno::Errno),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
