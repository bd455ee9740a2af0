use std::time::Duration;
use thiserror::Error;

/// Relay-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy shared by the proxy, the control-plane client and the
/// local process supervisor.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid signature")]
    SignatureInvalid,

    #[error("link expired")]
    LinkExpired,

    /// Transport-level failure after every retry attempt was used.
    #[error("control-plane unavailable after {attempts} attempts: {last}")]
    BackendUnavailable { attempts: u32, last: String },

    /// The control-plane answered with a well-formed error envelope.
    #[error("control-plane error {code}: {message}")]
    BackendError { code: i64, message: String },

    #[error("channel {channel_id} is not ready yet")]
    WorkerNotReady { channel_id: i64, retry_after: Duration },

    #[error("invalid playlist: {0}")]
    InvalidPlaylist(String),

    #[error("channel {0} is not available")]
    ChannelUnavailable(i64),

    #[error("failed to start process: {0}")]
    ProcessStartFailed(String),

    #[error("process still running after stop: {0}")]
    ProcessStopFailed(String),

    #[error("no output from transcoder for {0}s")]
    ProcessStalled(u64),

    #[error("process exited abnormally: {0}")]
    ProcessExitedAbnormally(String),

    #[error("giving up after {retries} consecutive failures: {last}")]
    RetriesExhausted { retries: u32, last: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Stalls and abnormal exits are absorbed by the stream-loop backoff.
    pub fn is_transient_stream_failure(&self) -> bool {
        matches!(
            self,
            Self::ProcessStalled(_) | Self::ProcessExitedAbnormally(_) | Self::ProcessStartFailed(_)
        )
    }
}
