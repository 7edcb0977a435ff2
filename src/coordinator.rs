//! Drives one download job from probe to reassembly.
//!
//! The coordinator runs as a single control task. It is the only place where
//! job and segment state change: workers report through one event channel,
//! the collaborator talks to it through a [`JobHandle`], and it answers with
//! [`JobEvent`]s. Every worker event is stamped with the job generation so
//! events from an abandoned attempt (after a redirect restart) or from a
//! segment that already reached a terminal state are dropped.

use std::path::PathBuf;
use std::sync::Arc;

use reqwest::Client;
use tokio::fs::{self, File};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::{build_client, JobRequest};
use crate::error::{DownloadError, Result};
use crate::event::{FailureReason, JobEvent, JobState};
use crate::planner::plan;
use crate::probe::{probe, ProbeOutcome};
use crate::reassembler;
use crate::segment::{sink_path, Segment, SegmentState};
use crate::worker::{SegmentWorker, WorkerContext, WorkerEvent, WorkerEventKind, WorkerHandle};

const EVENT_BUFFER: usize = 256;

/// Decides whether a job may restart against a redirect target.
pub trait RedirectApprover: Send + Sync {
    fn approve(&self, from: &Url, to: &Url) -> bool;
}

impl<F> RedirectApprover for F
where
    F: Fn(&Url, &Url) -> bool + Send + Sync,
{
    fn approve(&self, from: &Url, to: &Url) -> bool {
        self(from, to)
    }
}

pub struct FollowRedirects;

impl RedirectApprover for FollowRedirects {
    fn approve(&self, _from: &Url, _to: &Url) -> bool {
        true
    }
}

pub struct RefuseRedirects;

impl RedirectApprover for RefuseRedirects {
    fn approve(&self, _from: &Url, _to: &Url) -> bool {
        false
    }
}

enum Command {
    Cancel(oneshot::Sender<()>),
}

pub struct DownloadCoordinator {
    request: JobRequest,
    approver: Arc<dyn RedirectApprover>,
}

impl DownloadCoordinator {
    pub fn new(request: JobRequest) -> Self {
        Self {
            request,
            approver: Arc::new(FollowRedirects),
        }
    }

    pub fn with_redirect_approver(mut self, approver: impl RedirectApprover + 'static) -> Self {
        self.approver = Arc::new(approver);
        self
    }

    /// Spawns the control task. Fails only if the HTTP client cannot be built.
    pub fn start(self) -> Result<JobHandle> {
        let client = build_client(&self.request)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(JobState::Planning);
        let (commands_tx, commands_rx) = mpsc::channel(8);

        let job = Job {
            request: self.request,
            client,
            approver: self.approver,
            events: events_tx,
            state: state_tx,
            commands: commands_rx,
            generation: 0,
            reported: 0,
            reported_total: None,
        };
        let task = tokio::spawn(job.run());

        let canceller = Canceller {
            commands: commands_tx,
            state: state_rx.clone(),
        };
        Ok(JobHandle {
            events: events_rx,
            state: state_rx,
            canceller,
            task,
        })
    }
}

/// Collaborator side of a running job.
pub struct JobHandle {
    events: mpsc::UnboundedReceiver<JobEvent>,
    state: watch::Receiver<JobState>,
    canceller: Canceller,
    task: JoinHandle<JobState>,
}

impl JobHandle {
    /// Next lifecycle event; `None` once the job has ended and all events were read.
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        self.events.recv().await
    }

    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<JobState> {
        self.state.clone()
    }

    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    pub async fn cancel(&self) -> Result<()> {
        self.canceller.cancel().await
    }

    /// Waits for the control task and returns the terminal state.
    pub async fn wait(self) -> JobState {
        match self.task.await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "control task panicked");
                JobState::Failed
            }
        }
    }
}

/// Cloneable cancel trigger, for signal handlers and UI callbacks.
#[derive(Clone)]
pub struct Canceller {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<JobState>,
}

impl Canceller {
    /// Resolves once the job has stopped every worker and removed its sinks.
    /// Rejected when reassembly already started or the job is over.
    pub async fn cancel(&self) -> Result<()> {
        let state = *self.state.borrow();
        if state.is_terminal() || state == JobState::Reassembling {
            return Err(DownloadError::NotCancellable);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Cancel(reply_tx))
            .await
            .map_err(|_| DownloadError::NotCancellable)?;
        reply_rx.await.map_err(|_| DownloadError::NotCancellable)
    }
}

enum Step {
    Finished(JobState),
    Redirect(Url),
}

struct Job {
    request: JobRequest,
    client: Client,
    approver: Arc<dyn RedirectApprover>,
    events: mpsc::UnboundedSender<JobEvent>,
    state: watch::Sender<JobState>,
    commands: mpsc::Receiver<Command>,
    generation: u64,
    /// Highest aggregate already reported; survives redirect restarts of the same-sized resource.
    reported: u64,
    reported_total: Option<u64>,
}

/// Live workers of one attempt, indexed like the segment table.
struct Workers {
    handles: Vec<Option<WorkerHandle>>,
    root: CancellationToken,
    pool: Arc<Semaphore>,
    ctx: Arc<WorkerContext>,
    events: mpsc::Sender<WorkerEvent>,
}

impl Workers {
    fn launch(&mut self, segment: &mut Segment, sink: File) {
        segment.state = SegmentState::InProgress;
        let worker = SegmentWorker::new(
            self.ctx.clone(),
            segment.range,
            sink,
            segment.sink_path.clone(),
            self.events.clone(),
        );
        let handle = worker.start(self.root.child_token(), self.pool.clone());
        self.handles[segment.index()] = Some(handle);
    }

    async fn release(&mut self, index: usize) {
        if let Some(handle) = self.handles.get_mut(index).and_then(Option::take) {
            handle.join().await;
        }
    }

    /// Cancels every worker still holding a handle and waits for them to exit.
    async fn stop_all(&mut self) {
        self.root.cancel();
        for handle in self.handles.iter_mut().filter_map(Option::take) {
            handle.join().await;
        }
    }
}

impl Job {
    #[instrument(skip_all, fields(url = %self.request.url, dest = %self.request.destination_path.display()))]
    async fn run(mut self) -> JobState {
        let mut url = self.request.url.clone();
        let mut redirects = 0usize;

        loop {
            self.set_state(JobState::Planning);
            match self.attempt(&url).await {
                Step::Finished(state) => return state,
                Step::Redirect(target) => {
                    redirects += 1;
                    if redirects > self.request.max_redirects {
                        return self.fail(FailureReason::TooManyRedirects(format!(
                            "more than {} redirects, last to {}",
                            self.request.max_redirects, target
                        )));
                    }
                    if !self.approver.approve(&url, &target) {
                        return self.fail(FailureReason::RedirectRefused(format!(
                            "redirect from {} to {} was refused",
                            url, target
                        )));
                    }
                    info!(from = %url, to = %target, "restarting job at redirect target");
                    self.generation += 1;
                    self.emit(JobEvent::Restarted {
                        url: target.to_string(),
                    });
                    url = target;
                }
            }
        }
    }

    async fn attempt(&mut self, url: &Url) -> Step {
        // Credentials only go to the origin they were given for.
        let credentials = if url.origin() == self.request.url.origin() {
            self.request.credentials()
        } else {
            debug!(%url, "redirected to another origin, dropping credentials");
            None
        };

        let probed = tokio::select! {
            probed = probe(&self.client, url, credentials.as_ref()) => probed,
            Some(Command::Cancel(reply)) = self.commands.recv() => {
                let state = self.cancelled();
                let _ = reply.send(());
                return Step::Finished(state);
            }
        };

        let (total_bytes, range_supported) = match probed {
            Ok(ProbeOutcome::Resolved {
                total_bytes,
                range_supported,
            }) => (total_bytes, range_supported),
            Ok(ProbeOutcome::Redirect(target)) => return Step::Redirect(target),
            Err(e) => return Step::Finished(self.fail(FailureReason::from(&e))),
        };

        if self.reported_total != Some(total_bytes) {
            self.reported = 0;
            self.reported_total = Some(total_bytes);
        }

        let worker_count = if range_supported {
            self.request.worker_count.max(1)
        } else {
            debug!("server does not advertise byte ranges, using one segment");
            1
        };
        let ranges = plan(total_bytes, worker_count);
        info!(total_bytes, segments = ranges.len(), "planned segments");

        let sink_dir = self.request.sink_directory();
        if let Err(e) = fs::create_dir_all(&sink_dir).await {
            let err = DownloadError::io(&sink_dir, e);
            return Step::Finished(self.fail(FailureReason::from(&err)));
        }

        let mut segments: Vec<Segment> = ranges
            .into_iter()
            .map(|range| {
                let path = sink_path(&sink_dir, &self.request.destination_path, range.index);
                Segment::new(range, path)
            })
            .collect();

        let mut sinks = Vec::with_capacity(segments.len());
        for segment in &segments {
            match File::create(&segment.sink_path).await {
                Ok(file) => sinks.push(file),
                Err(e) => {
                    let err = DownloadError::io(&segment.sink_path, e);
                    drop(sinks);
                    reassembler::discard(&sink_paths(&segments)).await;
                    return Step::Finished(self.fail(FailureReason::from(&err)));
                }
            }
        }

        let (events_tx, mut events_rx) = mpsc::channel(EVENT_BUFFER);
        let mut workers = Workers {
            handles: (0..segments.len()).map(|_| None).collect(),
            root: CancellationToken::new(),
            pool: Arc::new(Semaphore::new(worker_count)),
            ctx: Arc::new(WorkerContext {
                client: self.client.clone(),
                url: url.clone(),
                credentials,
                total_bytes,
                read_timeout: self.request.read_timeout,
                generation: self.generation,
            }),
            events: events_tx,
        };
        for (segment, sink) in segments.iter_mut().zip(sinks) {
            workers.launch(segment, sink);
        }
        self.set_state(JobState::Running);

        let mut bytes_done = 0u64;
        let mut completed = 0usize;

        while completed < segments.len() {
            let event = tokio::select! {
                Some(Command::Cancel(reply)) = self.commands.recv() => {
                    abandon(&mut workers, &mut segments).await;
                    let state = self.cancelled();
                    let _ = reply.send(());
                    return Step::Finished(state);
                }
                Some(event) = events_rx.recv() => event,
            };

            if event.generation != self.generation {
                debug!(generation = event.generation, "dropping event from an earlier attempt");
                continue;
            }
            let Some(segment) = segments.get_mut(event.index) else {
                continue;
            };
            if segment.state != SegmentState::InProgress {
                debug!(index = event.index, state = ?segment.state, "dropping late segment event");
                continue;
            }

            match event.kind {
                WorkerEventKind::Progress(delta) => {
                    let grown = segment.record(delta);
                    bytes_done = (bytes_done + grown).min(total_bytes);
                    if bytes_done > self.reported {
                        self.reported = bytes_done;
                        self.emit(JobEvent::Progress {
                            bytes_done,
                            total_bytes,
                        });
                    }
                }
                WorkerEventKind::Done => {
                    segment.state = SegmentState::Complete;
                    completed += 1;
                    debug!(index = event.index, completed, of = segments.len(), "segment complete");
                    workers.release(event.index).await;
                }
                WorkerEventKind::Failed(err) => {
                    segment.state = SegmentState::Failed;
                    segment.failures += 1;
                    workers.release(event.index).await;

                    if segment.failures <= self.request.max_segment_retries {
                        warn!(index = event.index, attempt = segment.failures, error = %err, "retrying segment");
                        segment.restart();
                        match File::create(&segment.sink_path).await {
                            Ok(sink) => workers.launch(segment, sink),
                            Err(e) => {
                                let err = DownloadError::io(&segment.sink_path, e);
                                abandon(&mut workers, &mut segments).await;
                                return Step::Finished(self.fail(FailureReason::from(&err)));
                            }
                        }
                    } else {
                        abandon(&mut workers, &mut segments).await;
                        return Step::Finished(self.fail(FailureReason::from(&err)));
                    }
                }
                WorkerEventKind::Redirect(target) => {
                    debug!(index = event.index, %target, "segment redirected, abandoning attempt");
                    abandon(&mut workers, &mut segments).await;
                    return Step::Redirect(target);
                }
                WorkerEventKind::AuthRequired(status) => {
                    abandon(&mut workers, &mut segments).await;
                    let err = DownloadError::AuthRequired {
                        url: url.to_string(),
                        status,
                    };
                    return Step::Finished(self.fail(FailureReason::from(&err)));
                }
            }
        }

        self.set_state(JobState::Reassembling);
        workers.stop_all().await;
        let paths = sink_paths(&segments);
        info!(segments = paths.len(), "reassembling");

        match reassembler::assemble(&self.request.destination_path, &paths).await {
            Ok(output_path) => {
                info!(output = %output_path.display(), bytes = total_bytes, "download complete");
                self.set_state(JobState::Completed);
                self.emit(JobEvent::Completed { output_path });
                Step::Finished(JobState::Completed)
            }
            Err(e) => {
                // The partial output stays for inspection; leftover sinks go.
                reassembler::discard(&paths).await;
                Step::Finished(self.fail(FailureReason::from(&e)))
            }
        }
    }

    fn set_state(&self, next: JobState) {
        self.state.send_replace(next);
    }

    fn emit(&self, event: JobEvent) {
        // The collaborator may have dropped its handle; the job still runs to the end.
        let _ = self.events.send(event);
    }

    fn fail(&self, reason: FailureReason) -> JobState {
        warn!(%reason, "job failed");
        self.set_state(JobState::Failed);
        self.emit(JobEvent::Failed { reason });
        JobState::Failed
    }

    fn cancelled(&self) -> JobState {
        info!("job cancelled");
        self.set_state(JobState::Cancelled);
        self.emit(JobEvent::Cancelled);
        JobState::Cancelled
    }
}

/// Stops every worker, marks unfinished segments cancelled and deletes all sinks.
async fn abandon(workers: &mut Workers, segments: &mut [Segment]) {
    workers.stop_all().await;
    for segment in segments.iter_mut() {
        if !segment.state.is_terminal() {
            segment.state = SegmentState::Cancelled;
        }
    }
    reassembler::discard(&sink_paths(segments)).await;
}

fn sink_paths(segments: &[Segment]) -> Vec<PathBuf> {
    segments.iter().map(|s| s.sink_path.clone()).collect()
}
