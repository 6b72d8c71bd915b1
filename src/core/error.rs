//! Error types shared by the synthesis boundary and the generation loop.

use thiserror::Error;

/// Failure of a single call across the TTS boundary.
#[derive(Debug, Error)]
pub enum SynthesisError {
    /// Payload exceeds the provider's declared limit. Raised before any request is sent.
    #[error("payload of {bytes} bytes exceeds provider limit of {limit} bytes")]
    PayloadTooLarge { bytes: usize, limit: usize },

    /// Network failure, timeout, rate limiting or server-side error.
    #[error("transient synthesis failure: {0}")]
    Transient(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The provider answered but no usable audio came back.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl SynthesisError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SynthesisError::Transient(_))
    }

    /// Maps an HTTP status to the taxonomy.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => SynthesisError::Auth(body),
            408 | 429 | 500..=599 => SynthesisError::Transient(format!("HTTP {}: {}", status, body)),
            _ => SynthesisError::Rejected { status, body },
        }
    }
}

impl From<reqwest::Error> for SynthesisError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return SynthesisError::from_status(status.as_u16(), e.to_string());
        }
        if e.is_decode() {
            SynthesisError::MalformedResponse(e.to_string())
        } else {
            // connect, timeout, body and request errors all count as network trouble
            SynthesisError::Transient(e.to_string())
        }
    }
}

/// Run-level failure of a generation run.
#[derive(Debug, Error)]
pub enum RunError {
    /// Rejected before any synthesis call. Not resumable.
    #[error("invalid input: {0}")]
    Input(String),

    /// A segment failed. The checkpoint was written, so the run resumes at `index`.
    #[error("segment {index} failed: {source:#}")]
    Segment {
        index: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("interrupted after {completed} segments")]
    Interrupted { completed: usize },

    #[error("I/O failure: {0:#}")]
    Io(#[source] anyhow::Error),
}

impl RunError {
    /// Segment index a `--resume` run would start from, if the failure left resumable state.
    pub fn resume_from(&self) -> Option<usize> {
        match self {
            RunError::Segment { index, .. } => Some(*index),
            RunError::Interrupted { completed } => Some(*completed),
            RunError::Input(_) | RunError::Io(_) => None,
        }
    }
}
