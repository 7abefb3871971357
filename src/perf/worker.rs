//! Processing worker: fetch, decode, parse and stream one task at a time
//!
//! Each worker runs on its own thread and talks to the pool only through
//! messages. Handled failures become `WorkerResponse::Error` and the worker
//! keeps serving; a panic ends the thread and is reported as a fault.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, SendError, Sender, channel};
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::downsample::downsample_lap;
use super::fetch::Fetcher;
use super::pool::WorkerOutbox;
use crate::constants::progress;
use crate::data::{Channel, LapMetadata, TelemetryPoint, codec, compute_metadata, parse_upload};
use crate::error::{PipelineError, Result, TaskFailure};

/// Pool-unique task identifier used to route worker messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Requests that can be sent to a processing worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerRequest {
    /// Fetch a gzip'd compressed-point array and stream it back
    ParseLap {
        task_id: TaskId,
        url: String,
        lap_id: String,
    },
    /// Parse an uploaded delimited file
    ParseUpload {
        task_id: TaskId,
        data: Vec<u8>,
        filename: String,
    },
    /// Downsample points in one shot
    Downsample {
        task_id: TaskId,
        data: Vec<TelemetryPoint>,
        target_points: usize,
        channel: Channel,
    },
}

impl WorkerRequest {
    pub fn task_id(&self) -> TaskId {
        match self {
            WorkerRequest::ParseLap { task_id, .. }
            | WorkerRequest::ParseUpload { task_id, .. }
            | WorkerRequest::Downsample { task_id, .. } => *task_id,
        }
    }
}

/// Messages returned from a processing worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerResponse {
    Progress { task_id: TaskId, progress: u8 },
    Chunk { task_id: TaskId, chunk: Vec<TelemetryPoint> },
    Complete { task_id: TaskId, metadata: LapMetadata },
    Downsampled { task_id: TaskId, points: Vec<TelemetryPoint> },
    Error { task_id: TaskId, error: TaskFailure },
}

impl WorkerResponse {
    pub fn task_id(&self) -> TaskId {
        match self {
            WorkerResponse::Progress { task_id, .. }
            | WorkerResponse::Chunk { task_id, .. }
            | WorkerResponse::Complete { task_id, .. }
            | WorkerResponse::Downsampled { task_id, .. }
            | WorkerResponse::Error { task_id, .. } => *task_id,
        }
    }

    /// Complete, Downsampled and Error end a task
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            WorkerResponse::Progress { .. } | WorkerResponse::Chunk { .. }
        )
    }
}

/// Executes worker requests
pub struct ProcessingWorker {
    fetcher: Arc<dyn Fetcher>,
    chunk_size: usize,
}

impl ProcessingWorker {
    pub fn new(fetcher: Arc<dyn Fetcher>, chunk_size: usize) -> Self {
        Self {
            fetcher,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Serve requests until the channel closes or `emit` reports the receiver gone
    pub fn run(&self, requests: Receiver<WorkerRequest>, mut emit: impl FnMut(WorkerResponse) -> bool) {
        while let Ok(request) = requests.recv() {
            let mut open = true;
            self.process(request, &mut |response| {
                if open {
                    open = emit(response);
                }
            });
            if !open {
                break;
            }
        }
    }

    /// Run one request to its terminal message
    pub fn process(&self, request: WorkerRequest, emit: &mut dyn FnMut(WorkerResponse)) {
        let task_id = request.task_id();
        let outcome = match request {
            WorkerRequest::ParseLap { url, lap_id, .. } => {
                debug!(%task_id, %lap_id, "parsing remote lap");
                self.parse_lap(task_id, &url, emit)
            }
            WorkerRequest::ParseUpload { data, filename, .. } => {
                debug!(%task_id, %filename, "parsing upload");
                self.parse_file(task_id, &data, &filename, emit)
            }
            WorkerRequest::Downsample {
                data,
                target_points,
                channel,
                ..
            } => {
                let points = downsample_lap(&data, target_points, channel).into_owned();
                emit(WorkerResponse::Downsampled { task_id, points });
                Ok(())
            }
        };

        if let Err(e) = outcome {
            warn!(%task_id, error = %e, "task failed");
            emit(WorkerResponse::Error {
                task_id,
                error: e.to_failure(),
            });
        }
    }

    fn parse_lap(&self, task_id: TaskId, url: &str, emit: &mut dyn FnMut(WorkerResponse)) -> Result<()> {
        emit(WorkerResponse::Progress {
            task_id,
            progress: progress::START,
        });

        let compressed = self.fetcher.fetch(url)?;
        emit(WorkerResponse::Progress {
            task_id,
            progress: progress::FETCHED,
        });

        let json = codec::gunzip(&compressed)?;
        emit(WorkerResponse::Progress {
            task_id,
            progress: progress::DECOMPRESSED,
        });

        let points = codec::decode_points(&json)?;
        if points.is_empty() {
            return Err(PipelineError::Parse("payload contains no points".to_string()));
        }
        self.stream(task_id, points, progress::DECOMPRESSED, emit);
        Ok(())
    }

    fn parse_file(
        &self,
        task_id: TaskId,
        data: &[u8],
        filename: &str,
        emit: &mut dyn FnMut(WorkerResponse),
    ) -> Result<()> {
        emit(WorkerResponse::Progress {
            task_id,
            progress: progress::START,
        });

        let parsed = parse_upload(data, filename)?;
        emit(WorkerResponse::Progress {
            task_id,
            progress: progress::UPLOAD_DECODED,
        });

        self.stream(task_id, parsed.points, progress::UPLOAD_DECODED, emit);
        Ok(())
    }

    /// Emit points in order as fixed-size chunks, then the completion metadata
    fn stream(
        &self,
        task_id: TaskId,
        points: Vec<TelemetryPoint>,
        base_progress: u8,
        emit: &mut dyn FnMut(WorkerResponse),
    ) {
        profiling::scope!("stream_chunks");

        let metadata = compute_metadata(&points);
        let total_chunks = points.len().div_ceil(self.chunk_size);
        let span = (progress::DONE - base_progress) as usize;

        let mut remaining = points.into_iter();
        for sent in 1..=total_chunks {
            let chunk: Vec<TelemetryPoint> = remaining.by_ref().take(self.chunk_size).collect();
            emit(WorkerResponse::Chunk { task_id, chunk });
            emit(WorkerResponse::Progress {
                task_id,
                progress: base_progress + (span * sent / total_chunks) as u8,
            });
        }

        emit(WorkerResponse::Complete { task_id, metadata });
    }
}

/// Caller side of a running worker
pub struct WorkerHandle {
    requests: Sender<WorkerRequest>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn new(requests: Sender<WorkerRequest>, thread: Option<JoinHandle<()>>) -> Self {
        Self { requests, thread }
    }

    pub fn send(&self, request: WorkerRequest) -> std::result::Result<(), SendError<WorkerRequest>> {
        self.requests.send(request)
    }

    /// Close the request channel; optionally wait for the thread to exit
    pub fn shutdown(mut self, join: bool) {
        let thread = self.thread.take();
        drop(self);
        if let (true, Some(thread)) = (join, thread) {
            let _ = thread.join();
        }
    }
}

/// Builds workers for pool slots; used at startup and to replace faulted workers
pub trait WorkerFactory: Send + Sync + 'static {
    fn spawn(&self, outbox: WorkerOutbox) -> Result<WorkerHandle>;
}

impl<F> WorkerFactory for F
where
    F: Fn(WorkerOutbox) -> Result<WorkerHandle> + Send + Sync + 'static,
{
    fn spawn(&self, outbox: WorkerOutbox) -> Result<WorkerHandle> {
        self(outbox)
    }
}

/// Spawns a `ProcessingWorker` on a named OS thread per slot
pub struct ThreadWorkerFactory {
    fetcher: Arc<dyn Fetcher>,
    chunk_size: usize,
}

impl ThreadWorkerFactory {
    pub fn new(fetcher: Arc<dyn Fetcher>, chunk_size: usize) -> Self {
        Self { fetcher, chunk_size }
    }
}

impl WorkerFactory for ThreadWorkerFactory {
    fn spawn(&self, outbox: WorkerOutbox) -> Result<WorkerHandle> {
        let (req_tx, req_rx) = channel::<WorkerRequest>();
        let worker = ProcessingWorker::new(self.fetcher.clone(), self.chunk_size);

        let thread = thread::Builder::new()
            .name(format!("lap-worker-{}", outbox.slot()))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    worker.run(req_rx, |response| outbox.respond(response))
                }));
                if let Err(payload) = outcome {
                    outbox.fault(panic_message(payload.as_ref()));
                }
            })?;

        Ok(WorkerHandle::new(req_tx, Some(thread)))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}
