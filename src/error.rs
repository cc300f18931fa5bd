//! Error taxonomy (see spec §7).
//!
//! `AdapterError` is what provider adapters return; `SessionError` is what a
//! WS handler surfaces to the client as `{type:"error"}` before closing.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum AdapterError {
    #[error("missing credentials for provider {0}")]
    MissingCredentials(String),
    #[error("invalid sample rate: requested {requested}, provider requires {required}")]
    InvalidSampleRate { requested: u32, required: u32 },
    #[error("connect timeout waiting for provider ready gate")]
    ConnectTimeout,
    #[error("provider stream closed abnormally (code={code:?}, reason={reason:?})")]
    StreamClosed {
        code: Option<u16>,
        reason: Option<String>,
    },
    #[error("item-scoped transcription failure: {0}")]
    Transient(String),
    #[error("provider error: {0}")]
    Fatal(String),
}

impl AdapterError {
    /// Transient errors keep the session alive; everything else is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, AdapterError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not open config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("unsupported provider requested: {0}")]
    UnsupportedProvider(String),
    #[error("origin not allowed: {0}")]
    OriginNotAllowed(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),
    #[error("audio backlog exceeded {max_bytes} bytes for longer than the overflow grace period")]
    Backpressure { max_bytes: usize },
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("resampler process exited with status {0}")]
    ResamplerExit(i32),
    #[error("network intermittent failure in voice turn: {0}")]
    NetworkIntermittent(String),
}

impl SessionError {
    /// The text sent to the client in a `{type:"error"}` message.
    pub fn client_message(&self) -> String {
        self.to_string()
    }
}
