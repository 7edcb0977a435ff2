//! Concatenates completed segment sinks into the final output.

use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use crate::error::{DownloadError, Result};

/// Writes every sink, in the given order, into `output`, deleting each sink
/// once it has been copied.
///
/// A failure part way through is final: sinks already consumed are gone, so
/// the job cannot retry reassembly on its own.
pub async fn assemble(output: &Path, sinks: &[PathBuf]) -> Result<PathBuf> {
    let file = File::create(output)
        .await
        .map_err(|e| DownloadError::io(output, e))?;
    let mut writer = BufWriter::new(file);

    for sink in sinks {
        let mut reader = File::open(sink).await.map_err(|e| DownloadError::io(sink, e))?;
        let copied = tokio::io::copy(&mut reader, &mut writer)
            .await
            .map_err(|e| DownloadError::io(output, e))?;
        drop(reader);
        fs::remove_file(sink)
            .await
            .map_err(|e| DownloadError::io(sink, e))?;
        debug!(sink = %sink.display(), bytes = copied, "segment consumed");
    }

    writer.flush().await.map_err(|e| DownloadError::io(output, e))?;
    writer
        .into_inner()
        .sync_all()
        .await
        .map_err(|e| DownloadError::io(output, e))?;

    Ok(output.to_path_buf())
}

/// Removes sink files. Missing files are fine; a sink may never have been
/// created or its worker may have deleted it already.
pub async fn discard(sinks: &[PathBuf]) {
    for sink in sinks {
        match fs::remove_file(sink).await {
            Ok(()) => debug!(sink = %sink.display(), "sink removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(sink = %sink.display(), error = %e, "failed to remove sink"),
        }
    }
}
