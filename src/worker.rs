//! One ranged fetch per segment, streamed into that segment's sink.
//!
//! A worker never touches coordinator state. Everything it learns (bytes
//! received, completion, failure, redirects) is sent as a [`WorkerEvent`] on
//! the channel shared by all workers of a job. The coordinator keeps one
//! [`WorkerHandle`] per running segment to cancel or await it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::config::{authorize, Credentials};
use crate::error::DownloadError;
use crate::probe::{is_auth_challenge, redirect_target};
use crate::segment::SegmentRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug)]
pub struct WorkerEvent {
    /// Job attempt the worker was launched for. Bumped on every redirect restart.
    pub generation: u64,
    pub index: usize,
    pub kind: WorkerEventKind,
}

#[derive(Debug)]
pub enum WorkerEventKind {
    Progress(u64),
    Done,
    Failed(DownloadError),
    Redirect(Url),
    AuthRequired(u16),
}

/// Per-attempt settings shared by every worker of a job.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub client: Client,
    pub url: Url,
    pub credentials: Option<Credentials>,
    pub total_bytes: u64,
    pub read_timeout: Option<Duration>,
    pub generation: u64,
}

enum Outcome {
    Done,
    Failed(DownloadError),
    Redirect(Url),
    AuthRequired(u16),
    Cancelled,
}

pub struct SegmentWorker {
    ctx: Arc<WorkerContext>,
    range: SegmentRange,
    sink: File,
    sink_path: PathBuf,
    events: mpsc::Sender<WorkerEvent>,
}

impl SegmentWorker {
    pub fn new(
        ctx: Arc<WorkerContext>,
        range: SegmentRange,
        sink: File,
        sink_path: PathBuf,
        events: mpsc::Sender<WorkerEvent>,
    ) -> Self {
        Self {
            ctx,
            range,
            sink,
            sink_path,
            events,
        }
    }

    /// Spawns the fetch. It waits for a slot in `pool` before connecting.
    pub fn start(self, token: CancellationToken, pool: Arc<Semaphore>) -> WorkerHandle {
        let (state_tx, state_rx) = watch::channel(WorkerState::Idle);
        let index = self.range.index;
        let task_token = token.clone();
        let join = tokio::spawn(self.run(task_token, pool, state_tx));

        WorkerHandle {
            index,
            token,
            state: state_rx,
            join,
        }
    }

    async fn run(self, token: CancellationToken, pool: Arc<Semaphore>, state: watch::Sender<WorkerState>) {
        let SegmentWorker {
            ctx,
            range,
            sink,
            sink_path,
            events,
        } = self;
        let mut sink = BufWriter::new(sink);

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Outcome::Cancelled,
            outcome = async {
                let _permit = match pool.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Outcome::Cancelled,
                };
                transition(&state, WorkerState::Running);
                debug!(index = range.index, range = %range.header_value(), "segment started");
                fetch(&ctx, range, &mut sink, &sink_path, &events).await
            } => outcome,
        };

        let kind = match outcome {
            Outcome::Done => {
                transition(&state, WorkerState::Done);
                debug!(index = range.index, "segment done");
                WorkerEventKind::Done
            }
            Outcome::Cancelled => {
                transition(&state, WorkerState::Cancelled);
                discard(sink, &sink_path).await;
                debug!(index = range.index, "segment cancelled");
                return;
            }
            Outcome::Failed(err) => {
                transition(&state, WorkerState::Failed);
                discard(sink, &sink_path).await;
                warn!(index = range.index, error = %err, "segment failed");
                WorkerEventKind::Failed(err)
            }
            Outcome::Redirect(target) => {
                transition(&state, WorkerState::Failed);
                discard(sink, &sink_path).await;
                debug!(index = range.index, %target, "segment redirected");
                WorkerEventKind::Redirect(target)
            }
            Outcome::AuthRequired(status) => {
                transition(&state, WorkerState::Failed);
                discard(sink, &sink_path).await;
                WorkerEventKind::AuthRequired(status)
            }
        };

        // A cancel that races the final report still wins.
        let report = WorkerEvent {
            generation: ctx.generation,
            index: range.index,
            kind,
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => {}
            _ = events.send(report) => {}
        }
    }
}

/// Terminal states are sticky.
fn transition(state: &watch::Sender<WorkerState>, next: WorkerState) {
    state.send_if_modified(|current| {
        if current.is_terminal() {
            false
        } else {
            *current = next;
            true
        }
    });
}

async fn discard(sink: BufWriter<File>, path: &Path) {
    drop(sink);
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove segment sink");
        }
    }
}

async fn fetch(
    ctx: &WorkerContext,
    range: SegmentRange,
    sink: &mut BufWriter<File>,
    sink_path: &Path,
    events: &mpsc::Sender<WorkerEvent>,
) -> Outcome {
    let transport = |detail: String| {
        Outcome::Failed(DownloadError::SegmentTransport {
            index: range.index,
            detail,
        })
    };

    let request = ctx
        .client
        .get(ctx.url.clone())
        .header(RANGE, range.header_value());
    let response = match authorize(request, ctx.credentials.as_ref()).send().await {
        Ok(response) => response,
        Err(e) => return transport(format!("request failed: {}", e)),
    };

    let status = response.status();
    if status.is_redirection() {
        return match redirect_target(&ctx.url, response.headers()) {
            Ok(target) => Outcome::Redirect(target),
            Err(e) => transport(e.to_string()),
        };
    }
    if is_auth_challenge(status) {
        return Outcome::AuthRequired(status.as_u16());
    }
    // A plain 200 carries the whole body, which only matches a segment spanning everything.
    let spans_resource = range.start == 0 && range.end + 1 == ctx.total_bytes;
    match status {
        StatusCode::PARTIAL_CONTENT => {}
        StatusCode::OK if spans_resource => {}
        other => {
            return transport(format!(
                "unexpected HTTP {} for {}",
                other,
                range.header_value()
            ))
        }
    }

    let expected = range.len();
    let mut received = 0u64;
    let mut stream = response.bytes_stream();

    loop {
        let next = match ctx.read_timeout {
            Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
                Ok(next) => next,
                Err(_) => return transport(format!("no data received for {:?}", limit)),
            },
            None => stream.next().await,
        };
        let chunk = match next {
            None => break,
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => return transport(format!("error while downloading chunk: {}", e)),
        };
        if chunk.is_empty() {
            continue;
        }

        received += chunk.len() as u64;
        if received > expected {
            return transport(format!("server sent more than the {} requested bytes", expected));
        }
        if let Err(e) = sink.write_all(&chunk).await {
            return Outcome::Failed(DownloadError::io(sink_path, e));
        }

        let progress = WorkerEvent {
            generation: ctx.generation,
            index: range.index,
            kind: WorkerEventKind::Progress(chunk.len() as u64),
        };
        if events.send(progress).await.is_err() {
            // Coordinator is gone; nobody will consume this segment.
            return Outcome::Cancelled;
        }
    }

    if received != expected {
        return transport(format!("body ended after {} of {} bytes", received, expected));
    }
    if let Err(e) = sink.flush().await {
        return Outcome::Failed(DownloadError::io(sink_path, e));
    }
    Outcome::Done
}

/// Coordinator-side handle on a running worker.
pub struct WorkerHandle {
    index: usize,
    token: CancellationToken,
    state: watch::Receiver<WorkerState>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Aborts the in-flight request and deletes the sink. Safe to call repeatedly.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub async fn join(self) {
        if let Err(e) = self.join.await {
            warn!(index = self.index, error = %e, "segment task panicked");
        }
    }
}
