//! Error types for the mirror agent

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IMAP error: {0}")]
    Imap(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object-store operation exceeded its deadline: {0}")]
    Deadline(String),

    #[error("state file corrupt and no usable backup: {0}")]
    StateCorrupt(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("plugin {0} failed to initialize: {1}")]
    PluginInit(String, String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error corresponds to the IMAP "not logged in" signal
    /// that triggers a one-shot re-login and retry.
    #[must_use]
    pub fn is_not_logged_in(&self) -> bool {
        matches!(self, Self::Imap(msg) if msg.contains("not logged in") || msg.contains("Not logged in"))
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
