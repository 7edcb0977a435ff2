//! Byte ranges of the resource and the coordinator's bookkeeping for each.

use std::path::{Path, PathBuf};

use serde::Serialize;

/// One inclusive byte range of the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SegmentRange {
    /// Position in reassembly order.
    pub index: usize,
    pub start: u64,
    /// Inclusive.
    pub end: u64,
}

impl SegmentRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value of the `Range` request header for this segment.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SegmentState {
    Pending,
    InProgress,
    Complete,
    Failed,
    Cancelled,
}

impl SegmentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

/// Coordinator-side bookkeeping for one segment.
#[derive(Debug, Clone)]
pub struct Segment {
    pub range: SegmentRange,
    pub state: SegmentState,
    /// Bytes written by the current attempt.
    pub bytes_received: u64,
    /// Largest `bytes_received` seen across attempts; drives aggregate progress.
    pub high_water: u64,
    pub failures: u32,
    pub sink_path: PathBuf,
}

impl Segment {
    pub fn new(range: SegmentRange, sink_path: PathBuf) -> Self {
        Self {
            range,
            state: SegmentState::Pending,
            bytes_received: 0,
            high_water: 0,
            failures: 0,
            sink_path,
        }
    }

    pub fn index(&self) -> usize {
        self.range.index
    }

    /// Records `delta` more bytes and returns how much the high-water mark grew.
    pub fn record(&mut self, delta: u64) -> u64 {
        self.bytes_received = (self.bytes_received + delta).min(self.range.len());
        let grown = self.bytes_received.saturating_sub(self.high_water);
        self.high_water = self.high_water.max(self.bytes_received);
        grown
    }

    /// Resets the per-attempt counter before a relaunch.
    pub fn restart(&mut self) {
        self.bytes_received = 0;
        self.state = SegmentState::Pending;
    }
}

/// `<dir>/<destination file name>_<index>`.
pub fn sink_path(dir: &Path, destination: &Path, index: usize) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    dir.join(format!("{}_{}", name, index))
}
