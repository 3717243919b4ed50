use thiserror::Error;

use crate::types::OutputType;

pub type Result<T, E = EgressError> = std::result::Result<T, E>;

/// Error taxonomy for an egress job.
///
/// `is_user_error` controls whether a construction failure is reported as a
/// FAILED status update (exit 0) or aborts the process before any update.
#[derive(Debug, Error)]
pub enum EgressError {
    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("no codec is compatible with all outputs")]
    NoCompatibleCodec,

    #[error("{output} output does not support {codec}")]
    Incompatible { output: OutputType, codec: String },

    #[error("no file output type is compatible with the selected codecs")]
    NoCompatibleFileOutputType,

    #[error("egress not found")]
    EgressNotFound,

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("not supported by this egress: {0}")]
    NotSupported(&'static str),

    #[error("profiling is not enabled in this build")]
    ProfilingNotAvailable,

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(&'static str),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("upload of {path} failed: {reason}")]
    Upload { path: String, reason: String },

    #[error("pipeline shut down")]
    PipelineClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Glib(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EgressError {
    pub fn invalid_input(field: impl Into<String>) -> Self {
        EgressError::InvalidInput(field.into())
    }

    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        EgressError::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Errors caused by the request contents rather than the service. These
    /// produce a terminal FAILED update and a clean exit.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            EgressError::InvalidInput(_)
                | EgressError::InvalidUrl { .. }
                | EgressError::NoCompatibleCodec
                | EgressError::Incompatible { .. }
                | EgressError::NoCompatibleFileOutputType
        )
    }

    pub fn is_fatal(&self) -> bool {
        !self.is_user_error()
    }
}

impl From<gstreamer::glib::Error> for EgressError {
    fn from(e: gstreamer::glib::Error) -> Self {
        EgressError::Glib(e.to_string())
    }
}

impl From<gstreamer::glib::BoolError> for EgressError {
    fn from(e: gstreamer::glib::BoolError) -> Self {
        EgressError::Glib(e.to_string())
    }
}

impl From<gstreamer::StateChangeError> for EgressError {
    fn from(e: gstreamer::StateChangeError) -> Self {
        EgressError::Pipeline(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(EgressError::invalid_input("egress_id").is_user_error());
        assert!(EgressError::NoCompatibleCodec.is_user_error());
        assert!(EgressError::Incompatible {
            output: OutputType::Ogg,
            codec: "h264".to_string(),
        }
        .is_user_error());
        assert!(EgressError::Pipeline("bus error".to_string()).is_fatal());
        assert!(EgressError::Internal("oops".to_string()).is_fatal());
    }

    #[test]
    fn test_incompatible_names_output_and_codec() {
        let err = EgressError::Incompatible {
            output: OutputType::Ogg,
            codec: "h264".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("ogg"));
        assert!(msg.contains("h264"));
    }
}
