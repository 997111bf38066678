use thiserror::Error;

/// Failure kinds surfaced by the recording pipeline.
///
/// Encoder loops and the render bridge never return these to their callers;
/// they log and end their stream. The orchestrator is the only place where a
/// `RecorderError` crosses a public boundary.
#[derive(Debug, Error)]
pub enum RecorderError {
    /// A required hardware or OS capability (codec, audio capture, surface) is missing.
    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),
    /// A codec or container refused the requested parameters.
    #[error("Configuration rejected: {0}")]
    ConfigurationRejected(String),
    /// Reading, writing or finalizing a stream or file failed.
    #[error("Stream IO failure: {0}")]
    StreamIOFailure(String),
    /// Track selection, copy or finalization of the merged file failed.
    #[error("Merge failure: {0}")]
    MergeFailure(String),
    /// Operation not valid in the current session state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<std::io::Error> for RecorderError {
    fn from(err: std::io::Error) -> Self {
        RecorderError::StreamIOFailure(err.to_string())
    }
}

impl RecorderError {
    /// Short machine-friendly tag, used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            RecorderError::CapabilityUnavailable(_) => "capability_unavailable",
            RecorderError::ConfigurationRejected(_) => "configuration_rejected",
            RecorderError::StreamIOFailure(_) => "stream_io_failure",
            RecorderError::MergeFailure(_) => "merge_failure",
            RecorderError::InvalidState(_) => "invalid_state",
        }
    }

    /// Rewrap any error as a merge failure, keeping its message.
    pub(crate) fn into_merge_failure(self) -> Self {
        match self {
            RecorderError::MergeFailure(_) => self,
            other => RecorderError::MergeFailure(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RecorderError>;
