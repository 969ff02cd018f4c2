//! Public error taxonomy.
//!
//! Every public entry point returns one of these variants so callers can
//! match on failure class instead of parsing strings, the same shape the
//! teacher's `proxmox_client::Error` gives its own callers.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad address, missing port, empty credentials — surfaced at
    /// construction, never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// 401 / bad credentials. For password auth the caller may retry once
    /// the cached ticket has been cleared; for token auth this is fatal
    /// for the call.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Network error, timeout, or 5xx — retryable by `HttpClient::get_with_retry`.
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-2xx response other than 401, or a malformed JSON envelope.
    #[error("api error: status {status}: {body}")]
    Api { status: u16, body: String },

    /// Response JSON did not have the shape an endpoint requires.
    #[error("unexpected format for {0}")]
    DataShape(String),

    /// One or more VMs failed enrichment; failures are aggregated here
    /// rather than aborting the whole pipeline.
    #[error("enrichment failed for {0} guest(s): {1}")]
    Enrichment(usize, String),

    /// A task-poller tick failed to fetch status for a UPID.
    #[error("task poll error: {0}")]
    TaskPoll(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn authentication(msg: impl Into<String>) -> Self {
        Error::Authentication(msg.into())
    }

    pub fn transport(msg: impl fmt::Display) -> Self {
        Error::Transport(msg.to_string())
    }

    pub fn data_shape(what: impl Into<String>) -> Self {
        Error::DataShape(what.into())
    }

    /// Transient classification used by the retry loop: connection resets,
    /// timeouts, and 5xx are worth retrying; everything else is not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transport(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("connection") || msg.contains("timeout")
            }
            Error::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::DataShape(err.to_string())
    }
}
