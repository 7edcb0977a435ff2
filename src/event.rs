//! What the collaborator sees of a running job.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::error::DownloadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Planning,
    Running,
    Reassembling,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    Probe(String),
    SegmentTransport(String),
    Io(String),
    AuthRequired(String),
    RedirectRefused(String),
    TooManyRedirects(String),
}

impl From<&DownloadError> for FailureReason {
    fn from(err: &DownloadError) -> Self {
        let detail = err.to_string();
        match err {
            DownloadError::Probe { .. } | DownloadError::Client(_) | DownloadError::Redirect { .. } => {
                Self::Probe(detail)
            }
            DownloadError::SegmentTransport { .. } => Self::SegmentTransport(detail),
            DownloadError::Io { .. } => Self::Io(detail),
            DownloadError::AuthRequired { .. } => Self::AuthRequired(detail),
            DownloadError::Cancelled | DownloadError::NotCancellable => Self::Io(detail),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Probe(d)
            | Self::SegmentTransport(d)
            | Self::Io(d)
            | Self::AuthRequired(d)
            | Self::RedirectRefused(d)
            | Self::TooManyRedirects(d) => f.write_str(d),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Progress { bytes_done: u64, total_bytes: u64 },
    /// The job is starting over against a redirect target.
    Restarted { url: String },
    Completed { output_path: PathBuf },
    Failed { reason: FailureReason },
    Cancelled,
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled)
    }
}
