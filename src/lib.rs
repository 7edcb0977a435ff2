//! # rsdl
//!
//! Segmented HTTP downloads: a resource is probed for its size, split into
//! contiguous byte ranges, fetched by one worker per range in parallel and
//! stitched back together in order.
//!
//! ```no_run
//! use rsdl::{DownloadCoordinator, JobEvent, JobRequest};
//!
//! # async fn demo() -> rsdl::Result<()> {
//! let url = url::Url::parse("https://example.com/big.iso").unwrap();
//! let request = JobRequest::new(url, "big.iso").with_workers(8);
//! let mut job = DownloadCoordinator::new(request).start()?;
//! while let Some(event) = job.next_event().await {
//!     if let JobEvent::Progress { bytes_done, total_bytes } = event {
//!         println!("{}/{}", bytes_done, total_bytes);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod planner;
pub mod probe;
pub mod reassembler;
pub mod segment;
pub mod worker;

pub use config::{build_client, Credentials, JobRequest, ProxySettings};
pub use coordinator::{
    Canceller, DownloadCoordinator, FollowRedirects, JobHandle, RedirectApprover, RefuseRedirects,
};
pub use error::{DownloadError, Result};
pub use event::{FailureReason, JobEvent, JobState};
pub use planner::plan;
pub use probe::{probe, ProbeOutcome};
pub use segment::{Segment, SegmentRange, SegmentState};
pub use worker::{SegmentWorker, WorkerHandle, WorkerState};
