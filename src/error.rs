//! Error types shared by the download core.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DownloadError>;

#[derive(Debug, Error)]
pub enum DownloadError {
    /// The size of the resource could not be determined before planning.
    #[error("probe of {url} failed: {detail}")]
    Probe { url: String, detail: String },

    /// One segment's connection failed.
    #[error("segment {index} failed: {detail}")]
    SegmentTransport { index: usize, detail: String },

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The remote answered 401/407.
    #[error("authentication required for {url} (HTTP {status})")]
    AuthRequired { url: String, status: u16 },

    #[error("download cancelled")]
    Cancelled,

    /// Cancellation arrived after reassembly started or after the job ended.
    #[error("job can no longer be cancelled")]
    NotCancellable,

    #[error("invalid redirect from {url}: {detail}")]
    Redirect { url: String, detail: String },

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

impl DownloadError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
