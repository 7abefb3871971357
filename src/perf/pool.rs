//! Worker pool: priority queue, dispatch and crash recovery
//!
//! A dispatcher thread owns all pool state. Callers, workers and the
//! dispatcher only exchange messages over a single inbox:
//!
//! ```text
//! enqueue/cancel/stats ──► inbox ──► dispatcher ──► worker slot N
//!                            ▲                          │
//!                            └──── responses / fault ◄──┘
//! ```
//!
//! Every message a worker sends is tagged with its slot and generation.
//! Messages from a replaced worker, or for a task the slot is no longer
//! running, are dropped.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError, channel};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::fetch::Fetcher;
use super::worker::{TaskId, ThreadWorkerFactory, WorkerFactory, WorkerHandle, WorkerRequest, WorkerResponse};
use crate::config::PipelineConfig;
use crate::data::{Channel, LapMetadata, TelemetryPoint};
use crate::error::{PipelineError, Result};

/// Dispatch priority; higher runs first, ties run in enqueue order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Work submitted to the pool
#[derive(Debug, Clone)]
pub enum TaskRequest {
    ParseLap { url: String, lap_id: String },
    ParseUpload { data: Vec<u8>, filename: String },
    Downsample {
        points: Vec<TelemetryPoint>,
        target_points: usize,
        channel: Channel,
    },
}

impl TaskRequest {
    /// Short human label used in logs
    fn label(&self) -> String {
        match self {
            TaskRequest::ParseLap { lap_id, .. } => format!("lap:{}", lap_id),
            TaskRequest::ParseUpload { filename, .. } => format!("upload:{}", filename),
            TaskRequest::Downsample { target_points, channel, .. } => {
                format!("downsample:{}@{}", channel, target_points)
            }
        }
    }

    fn into_worker_request(self, task_id: TaskId) -> WorkerRequest {
        match self {
            TaskRequest::ParseLap { url, lap_id } => WorkerRequest::ParseLap { task_id, url, lap_id },
            TaskRequest::ParseUpload { data, filename } => {
                WorkerRequest::ParseUpload { task_id, data, filename }
            }
            TaskRequest::Downsample {
                points,
                target_points,
                channel,
            } => WorkerRequest::Downsample {
                task_id,
                data: points,
                target_points,
                channel,
            },
        }
    }
}

/// Successful outcome of a task
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    /// Parse finished; points were delivered through `on_chunk`
    Lap(LapMetadata),
    Downsampled(Vec<TelemetryPoint>),
}

impl TaskOutput {
    pub fn into_metadata(self) -> Option<LapMetadata> {
        match self {
            TaskOutput::Lap(m) => Some(m),
            TaskOutput::Downsampled(_) => None,
        }
    }

    pub fn into_points(self) -> Option<Vec<TelemetryPoint>> {
        match self {
            TaskOutput::Downsampled(p) => Some(p),
            TaskOutput::Lap(_) => None,
        }
    }
}

type ProgressFn = Box<dyn FnMut(u8) + Send>;
type ChunkFn = Box<dyn FnMut(Vec<TelemetryPoint>) + Send>;
type CompleteFn = Box<dyn FnOnce(&LapMetadata) + Send>;
type ErrorFn = Box<dyn FnOnce(&PipelineError) + Send>;

/// Optional hooks invoked on the dispatcher thread as a task progresses.
///
/// A hook may call back into its `WorkerPool`. Those calls do not wait for
/// the dispatcher, which is busy running the hook: `stats` returns the
/// snapshot taken after the previous pool event, `cancel` reports `true`
/// once the request is queued, `clear_queue` reports the queued count from
/// that snapshot and `terminate` returns without joining. The request itself
/// is applied as soon as the hook returns.
#[derive(Default)]
pub struct TaskCallbacks {
    on_progress: Option<ProgressFn>,
    on_chunk: Option<ChunkFn>,
    on_complete: Option<CompleteFn>,
    on_error: Option<ErrorFn>,
}

impl TaskCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress(mut self, f: impl FnMut(u8) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_chunk(mut self, f: impl FnMut(Vec<TelemetryPoint>) + Send + 'static) -> Self {
        self.on_chunk = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl FnOnce(&LapMetadata) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(&PipelineError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Copy every chunk into `tx` after the existing chunk hook has seen it
    pub(crate) fn tee_chunks(mut self, tx: Sender<Vec<TelemetryPoint>>) -> Self {
        let mut inner = self.on_chunk.take();
        self.on_chunk = Some(Box::new(move |chunk| {
            if let Some(f) = inner.as_mut() {
                f(chunk.clone());
            }
            let _ = tx.send(chunk);
        }));
        self
    }
}

/// Caller side of an enqueued task; settles exactly once
pub struct TaskHandle {
    id: TaskId,
    outcome: Receiver<Result<TaskOutput>>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Block until the task settles
    pub fn wait(self) -> Result<TaskOutput> {
        self.outcome
            .recv()
            .unwrap_or(Err(PipelineError::PoolTerminated))
    }

    /// Block for at most `timeout`; `None` while the task is still pending.
    /// The outcome is handed out once.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<TaskOutput>> {
        match self.outcome.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(PipelineError::PoolTerminated)),
        }
    }

    pub fn try_result(&self) -> Option<Result<TaskOutput>> {
        match self.outcome.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(PipelineError::PoolTerminated)),
        }
    }
}

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub busy: usize,
    pub queued: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub restarts: u64,
}

/// Worker-side sender; tags every message with the worker's slot and generation
#[derive(Clone)]
pub struct WorkerOutbox {
    slot: usize,
    generation: u64,
    tx: Sender<PoolMessage>,
}

impl WorkerOutbox {
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Returns false once the pool has gone away
    pub fn respond(&self, response: WorkerResponse) -> bool {
        self.send(WorkerEvent::Response(response))
    }

    /// Report that the worker died
    pub fn fault(&self, message: String) {
        self.send(WorkerEvent::Fault(message));
    }

    fn send(&self, event: WorkerEvent) -> bool {
        self.tx
            .send(PoolMessage::Worker {
                slot: self.slot,
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

enum WorkerEvent {
    Response(WorkerResponse),
    Fault(String),
}

enum PoolMessage {
    Enqueue(PendingTask),
    Cancel { task_id: TaskId, reply: Sender<bool> },
    ClearQueue { reply: Sender<usize> },
    Stats { reply: Sender<PoolStats> },
    Terminate { reply: Sender<()> },
    Worker {
        slot: usize,
        generation: u64,
        event: WorkerEvent,
    },
}

struct PendingTask {
    request: TaskRequest,
    priority: Priority,
    task: ActiveTask,
}

/// Dispatcher-side state of a task
struct ActiveTask {
    id: TaskId,
    label: String,
    callbacks: TaskCallbacks,
    settle: Sender<Result<TaskOutput>>,
}

impl ActiveTask {
    fn progress(&mut self, progress: u8) {
        if let Some(f) = self.callbacks.on_progress.as_mut() {
            guarded(&self.label, || f(progress));
        }
    }

    fn chunk(&mut self, chunk: Vec<TelemetryPoint>) {
        if let Some(f) = self.callbacks.on_chunk.as_mut() {
            guarded(&self.label, || f(chunk));
        }
    }

    fn resolve(mut self, output: TaskOutput) {
        if let (TaskOutput::Lap(metadata), Some(f)) = (&output, self.callbacks.on_complete.take()) {
            guarded(&self.label, || f(metadata));
        }
        let _ = self.settle.send(Ok(output));
    }

    fn reject(mut self, error: PipelineError) {
        if let Some(f) = self.callbacks.on_error.take() {
            guarded(&self.label, || f(&error));
        }
        let _ = self.settle.send(Err(error));
    }
}

/// Run a user callback; a panic is logged instead of taking the dispatcher down
fn guarded(label: &str, f: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(task = label, "task callback panicked");
    }
}

struct WorkerSlot {
    handle: Option<WorkerHandle>,
    generation: u64,
    running: Option<ActiveTask>,
}

struct Dispatcher {
    inbox: Receiver<PoolMessage>,
    tx: Sender<PoolMessage>,
    factory: Box<dyn WorkerFactory>,
    slots: Vec<WorkerSlot>,
    queue: Vec<PendingTask>,
    stats: PoolStats,
    published: Arc<Mutex<PoolStats>>,
}

impl Dispatcher {
    fn run(mut self) {
        while let Ok(message) = self.inbox.recv() {
            let stop = self.handle(message);
            *self.published.lock() = self.snapshot();
            if stop {
                break;
            }
        }
    }

    /// Apply one message; true once the pool has shut down
    fn handle(&mut self, message: PoolMessage) -> bool {
        match message {
            PoolMessage::Enqueue(pending) => {
                debug!(task = %pending.task.id, label = %pending.task.label, priority = ?pending.priority, "queued");
                self.queue.push(pending);
                self.dispatch();
            }
            PoolMessage::Cancel { task_id, reply } => {
                let _ = reply.send(self.cancel(task_id));
            }
            PoolMessage::ClearQueue { reply } => {
                let _ = reply.send(self.clear_queue(|| PipelineError::QueueCleared));
            }
            PoolMessage::Stats { reply } => {
                let _ = reply.send(self.snapshot());
            }
            PoolMessage::Terminate { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return true;
            }
            PoolMessage::Worker {
                slot,
                generation,
                event,
            } => {
                self.on_worker_event(slot, generation, event);
                self.dispatch();
            }
        }
        false
    }

    /// Hand queued tasks to idle slots, highest priority first
    fn dispatch(&mut self) {
        if self.queue.is_empty() {
            return;
        }

        // Slots left empty by a failed replacement get another try
        for idx in 0..self.slots.len() {
            if self.slots[idx].handle.is_none() {
                self.spawn_worker(idx);
            }
        }
        if self.slots.iter().all(|s| s.handle.is_none()) {
            error!(queued = self.queue.len(), "no live workers, rejecting queued tasks");
            self.stats.failed += self.queue.len() as u64;
            self.clear_queue(|| PipelineError::WorkerFault("no live workers".to_string()));
            return;
        }

        // Stable: equal priorities keep enqueue order
        self.queue.sort_by(|a, b| b.priority.cmp(&a.priority));

        for idx in 0..self.slots.len() {
            if self.queue.is_empty() {
                break;
            }
            let slot = &self.slots[idx];
            if slot.running.is_some() || slot.handle.is_none() {
                continue;
            }
            let pending = self.queue.remove(0);
            self.start(idx, pending);
        }
    }

    fn start(&mut self, idx: usize, pending: PendingTask) {
        let PendingTask { request, task, .. } = pending;
        let request = request.into_worker_request(task.id);
        let sent = match self.slots[idx].handle.as_ref() {
            Some(handle) => handle.send(request).is_ok(),
            None => false,
        };

        if sent {
            debug!(task = %task.id, label = %task.label, slot = idx, "dispatched");
            self.slots[idx].running = Some(task);
        } else {
            warn!(task = %task.id, slot = idx, "worker unreachable, replacing");
            self.stats.failed += 1;
            task.reject(PipelineError::WorkerFault("worker unreachable".to_string()));
            self.replace_worker(idx);
        }
    }

    fn on_worker_event(&mut self, idx: usize, generation: u64, event: WorkerEvent) {
        let Some(slot) = self.slots.get_mut(idx) else {
            return;
        };
        if slot.generation != generation {
            debug!(slot = idx, generation, "dropping message from replaced worker");
            return;
        }

        match event {
            WorkerEvent::Fault(message) => {
                error!(slot = idx, %message, "worker crashed");
                if let Some(task) = slot.running.take() {
                    self.stats.failed += 1;
                    task.reject(PipelineError::WorkerFault(message));
                }
                self.replace_worker(idx);
            }
            WorkerEvent::Response(response) => {
                let owned = slot
                    .running
                    .as_ref()
                    .is_some_and(|t| t.id == response.task_id());
                if !owned {
                    debug!(slot = idx, task = %response.task_id(), "dropping message for inactive task");
                    return;
                }
                self.on_response(idx, response);
            }
        }
    }

    fn on_response(&mut self, idx: usize, response: WorkerResponse) {
        let slot = &mut self.slots[idx];
        match response {
            WorkerResponse::Progress { progress, .. } => {
                if let Some(task) = slot.running.as_mut() {
                    task.progress(progress);
                }
            }
            WorkerResponse::Chunk { chunk, .. } => {
                if let Some(task) = slot.running.as_mut() {
                    task.chunk(chunk);
                }
            }
            WorkerResponse::Complete { metadata, .. } => {
                if let Some(task) = slot.running.take() {
                    debug!(task = %task.id, points = metadata.point_count, "completed");
                    self.stats.completed += 1;
                    task.resolve(TaskOutput::Lap(metadata));
                }
            }
            WorkerResponse::Downsampled { points, .. } => {
                if let Some(task) = slot.running.take() {
                    self.stats.completed += 1;
                    task.resolve(TaskOutput::Downsampled(points));
                }
            }
            WorkerResponse::Error { error, .. } => {
                if let Some(task) = slot.running.take() {
                    self.stats.failed += 1;
                    task.reject(PipelineError::from_failure(error));
                }
            }
        }
    }

    /// Swap in a fresh worker; the old one is detached
    fn replace_worker(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        slot.generation += 1;
        if let Some(old) = slot.handle.take() {
            old.shutdown(false);
        }
        self.spawn_worker(idx);
    }

    /// Fill slot `idx`. On failure it stays empty until the next dispatch.
    fn spawn_worker(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        let outbox = WorkerOutbox {
            slot: idx,
            generation: slot.generation,
            tx: self.tx.clone(),
        };
        match self.factory.spawn(outbox) {
            Ok(handle) => {
                slot.handle = Some(handle);
                self.stats.restarts += 1;
                info!(slot = idx, generation = slot.generation, "worker started");
            }
            Err(e) => error!(slot = idx, error = %e, "failed to start worker"),
        }
    }

    fn cancel(&mut self, task_id: TaskId) -> bool {
        if let Some(pos) = self.queue.iter().position(|p| p.task.id == task_id) {
            let pending = self.queue.remove(pos);
            debug!(task = %task_id, "cancelled while queued");
            self.stats.cancelled += 1;
            pending.task.reject(PipelineError::Cancelled);
            return true;
        }

        // In-flight work keeps running on the worker; its later messages are dropped
        let running = self
            .slots
            .iter_mut()
            .find(|s| s.running.as_ref().is_some_and(|t| t.id == task_id));
        if let Some(task) = running.and_then(|s| s.running.take()) {
            debug!(task = %task_id, "cancelled in flight");
            self.stats.cancelled += 1;
            task.reject(PipelineError::Cancelled);
            self.dispatch();
            return true;
        }
        false
    }

    fn clear_queue(&mut self, error: impl Fn() -> PipelineError) -> usize {
        let cleared = self.queue.len();
        for pending in self.queue.drain(..) {
            pending.task.reject(error());
        }
        if cleared > 0 {
            info!(cleared, "queue cleared");
        }
        cleared
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            workers: self.slots.iter().filter(|s| s.handle.is_some()).count(),
            busy: self.slots.iter().filter(|s| s.running.is_some()).count(),
            queued: self.queue.len(),
            ..self.stats
        }
    }

    fn shutdown(&mut self) {
        self.clear_queue(|| PipelineError::QueueCleared);
        for slot in self.slots.iter_mut() {
            let busy = match slot.running.take() {
                Some(task) => {
                    task.reject(PipelineError::PoolTerminated);
                    true
                }
                None => false,
            };
            if let Some(handle) = slot.handle.take() {
                handle.shutdown(!busy);
            }
        }
        info!("worker pool terminated");
    }
}

/// Fixed-size pool of processing workers
pub struct WorkerPool {
    tx: Sender<PoolMessage>,
    next_id: AtomicU64,
    size: usize,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    dispatcher_id: ThreadId,
    published: Arc<Mutex<PoolStats>>,
}

impl WorkerPool {
    /// Start `size` workers built by `factory`
    pub fn new(size: usize, factory: impl WorkerFactory) -> Result<Self> {
        let size = size.max(1);
        let (tx, inbox) = channel();

        let mut slots = Vec::with_capacity(size);
        for idx in 0..size {
            let outbox = WorkerOutbox {
                slot: idx,
                generation: 0,
                tx: tx.clone(),
            };
            match factory.spawn(outbox) {
                Ok(handle) => slots.push(WorkerSlot {
                    handle: Some(handle),
                    generation: 0,
                    running: None,
                }),
                Err(e) => {
                    for slot in slots {
                        if let Some(handle) = slot.handle {
                            handle.shutdown(true);
                        }
                    }
                    return Err(e);
                }
            }
        }

        let published = Arc::new(Mutex::new(PoolStats {
            workers: size,
            ..PoolStats::default()
        }));
        let dispatcher = Dispatcher {
            inbox,
            tx: tx.clone(),
            factory: Box::new(factory),
            slots,
            queue: Vec::new(),
            stats: PoolStats::default(),
            published: published.clone(),
        };
        let handle = thread::Builder::new()
            .name("lap-dispatcher".to_string())
            .spawn(move || dispatcher.run())?;
        let dispatcher_id = handle.thread().id();

        info!(workers = size, "worker pool started");
        Ok(Self {
            tx,
            next_id: AtomicU64::new(1),
            size,
            dispatcher: Mutex::new(Some(handle)),
            dispatcher_id,
            published,
        })
    }

    /// Pool of thread workers sized from `config.pool`
    pub fn from_config(config: &PipelineConfig, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        let factory = ThreadWorkerFactory::new(fetcher, config.worker.chunk_size);
        Self::new(config.pool.worker_count(), factory)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn enqueue(&self, request: TaskRequest, priority: Priority, callbacks: TaskCallbacks) -> TaskHandle {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (settle, outcome) = channel();
        let task = ActiveTask {
            id,
            label: request.label(),
            callbacks,
            settle,
        };

        if let Err(rejected) = self.tx.send(PoolMessage::Enqueue(PendingTask {
            request,
            priority,
            task,
        })) {
            if let PoolMessage::Enqueue(pending) = rejected.0 {
                pending.task.reject(PipelineError::PoolTerminated);
            }
        }
        TaskHandle { id, outcome }
    }

    /// Reject a queued or running task with `Cancelled`; false if it is unknown or settled
    pub fn cancel(&self, task_id: TaskId) -> bool {
        self.request(|reply| PoolMessage::Cancel { task_id, reply }, true)
            .unwrap_or(false)
    }

    /// Reject every queued task with `QueueCleared`; running tasks are untouched
    pub fn clear_queue(&self) -> usize {
        let deferred = self.published.lock().queued;
        self.request(|reply| PoolMessage::ClearQueue { reply }, deferred)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> PoolStats {
        if self.on_dispatcher() {
            return *self.published.lock();
        }
        self.request(|reply| PoolMessage::Stats { reply }, PoolStats::default())
            .unwrap_or_default()
    }

    /// Stop all workers. Queued tasks reject with `QueueCleared`, running ones
    /// with `PoolTerminated`. Safe to call more than once.
    pub fn terminate(&self) {
        let _ = self.request(|reply| PoolMessage::Terminate { reply }, ());
        if self.on_dispatcher() {
            return;
        }
        if let Some(handle) = self.dispatcher.lock().take() {
            let _ = handle.join();
        }
    }

    /// True inside a task callback
    fn on_dispatcher(&self) -> bool {
        thread::current().id() == self.dispatcher_id
    }

    /// Round trip to the dispatcher. From inside a callback the message is
    /// only queued and `deferred` stands in for the reply.
    fn request<T>(&self, message: impl FnOnce(Sender<T>) -> PoolMessage, deferred: T) -> Option<T> {
        let (reply, response) = channel();
        self.tx.send(message(reply)).ok()?;
        if self.on_dispatcher() {
            return Some(deferred);
        }
        response.recv().ok()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::codec::encode_points;
    use crate::error::ErrorKind;
    use crate::perf::fetch::MemoryFetcher;
    use std::sync::atomic::AtomicUsize;

    /// Serves canned payloads; blocks on the gate URL and panics on `mem://panic`
    struct GateFetcher {
        routes: MemoryFetcher,
        gate: String,
        entered: Mutex<Sender<()>>,
        release: Mutex<Receiver<()>>,
        order: Mutex<Vec<String>>,
    }

    impl Fetcher for GateFetcher {
        fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            self.order.lock().push(url.to_string());
            if url == self.gate {
                let _ = self.entered.lock().send(());
                let _ = self.release.lock().recv();
            }
            if url == "mem://panic" {
                panic!("simulated worker fault");
            }
            self.routes.fetch(url)
        }
    }

    struct Harness {
        fetcher: Arc<GateFetcher>,
        entered: Receiver<()>,
        release: Sender<()>,
    }

    fn lap_points(n: usize) -> Vec<TelemetryPoint> {
        (0..n)
            .map(|i| {
                let mut p = TelemetryPoint::at(1_700_000_000_000.0 + i as f64 * 10.0, 3);
                p.speed = Some(100.0 + (i % 50) as f64);
                p
            })
            .collect()
    }

    fn harness(urls: &[&str], points: &[TelemetryPoint]) -> Harness {
        let routes = MemoryFetcher::new();
        let payload = encode_points(points).unwrap();
        for url in urls {
            routes.insert(*url, payload.clone());
        }
        routes.insert("mem://gate", payload);
        routes.insert_status("mem://missing", 404);

        let (entered_tx, entered) = channel();
        let (release, release_rx) = channel();
        let fetcher = Arc::new(GateFetcher {
            routes,
            gate: "mem://gate".to_string(),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
            order: Mutex::new(Vec::new()),
        });
        Harness {
            fetcher,
            entered,
            release,
        }
    }

    fn pool(h: &Harness, workers: usize, chunk_size: usize) -> WorkerPool {
        WorkerPool::new(workers, ThreadWorkerFactory::new(h.fetcher.clone(), chunk_size)).unwrap()
    }

    fn lap(url: &str) -> TaskRequest {
        TaskRequest::ParseLap {
            url: url.to_string(),
            lap_id: url.trim_start_matches("mem://").to_string(),
        }
    }

    /// Thread workers, except that spawn calls matching `refuse` fail
    fn flaky_factory(h: &Harness, refuse: impl Fn(usize) -> bool + Send + Sync + 'static) -> impl WorkerFactory {
        let inner = ThreadWorkerFactory::new(h.fetcher.clone(), 1000);
        let calls = AtomicUsize::new(0);
        move |outbox: WorkerOutbox| {
            if refuse(calls.fetch_add(1, Ordering::SeqCst)) {
                return Err(PipelineError::WorkerFault("spawn refused".to_string()));
            }
            inner.spawn(outbox)
        }
    }

    /// Occupy the only worker with the gate task
    fn hold(pool: &WorkerPool, h: &Harness) -> TaskHandle {
        let handle = pool.enqueue(lap("mem://gate"), Priority::Normal, TaskCallbacks::new());
        h.entered.recv_timeout(Duration::from_secs(5)).unwrap();
        handle
    }

    const WAIT: Duration = Duration::from_secs(10);

    #[test]
    fn test_parse_lap_streams_chunks_then_completes() {
        let points = lap_points(5000);
        let h = harness(&["mem://lap"], &points);
        let pool = pool(&h, 2, 1000);

        let (chunk_tx, chunk_rx) = channel();
        let (progress_tx, progress_rx) = channel();
        let (done_tx, done_rx) = channel();
        let callbacks = TaskCallbacks::new()
            .on_chunk(move |c| chunk_tx.send(c).unwrap())
            .on_progress(move |p| progress_tx.send(p).unwrap())
            .on_complete(move |m| done_tx.send(m.clone()).unwrap());

        let handle = pool.enqueue(lap("mem://lap"), Priority::High, callbacks);
        let metadata = handle.wait().unwrap().into_metadata().unwrap();

        let chunks: Vec<Vec<TelemetryPoint>> = chunk_rx.try_iter().collect();
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.len() == 1000));
        assert_eq!(chunks.concat(), points);

        assert_eq!(metadata.point_count, 5000);
        assert!(metadata.duration_ms > 0.0);
        assert_eq!(done_rx.try_recv().unwrap(), metadata);

        let progress: Vec<u8> = progress_rx.try_iter().collect();
        assert_eq!(progress.last(), Some(&100));
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_not_found_rejects_without_chunks() {
        let h = harness(&[], &lap_points(10));
        let pool = pool(&h, 1, 1000);

        let (chunk_tx, chunk_rx) = channel::<Vec<TelemetryPoint>>();
        let (error_tx, error_rx) = channel();
        let (done_tx, done_rx) = channel::<()>();
        let callbacks = TaskCallbacks::new()
            .on_chunk(move |c| chunk_tx.send(c).unwrap())
            .on_complete(move |_| done_tx.send(()).unwrap())
            .on_error(move |e| error_tx.send(e.kind()).unwrap());

        let result = pool.enqueue(lap("mem://missing"), Priority::Normal, callbacks).wait();
        assert!(matches!(result, Err(PipelineError::Fetch { status: Some(404), .. })));
        assert_eq!(error_rx.try_recv().unwrap(), ErrorKind::Transport);
        assert!(chunk_rx.try_recv().is_err());
        assert!(done_rx.try_recv().is_err());
    }

    #[test]
    fn test_priority_order_on_single_worker() {
        let h = harness(&["mem://low", "mem://high", "mem://normal"], &lap_points(20));
        let pool = pool(&h, 1, 1000);

        let gate = hold(&pool, &h);
        let low = pool.enqueue(lap("mem://low"), Priority::Low, TaskCallbacks::new());
        let high = pool.enqueue(lap("mem://high"), Priority::High, TaskCallbacks::new());
        let normal = pool.enqueue(lap("mem://normal"), Priority::Normal, TaskCallbacks::new());

        assert_eq!(pool.stats().queued, 3);
        h.release.send(()).unwrap();

        for handle in [gate, low, high, normal] {
            handle.wait().unwrap();
        }
        assert_eq!(
            *h.fetcher.order.lock(),
            vec!["mem://gate", "mem://high", "mem://normal", "mem://low"]
        );
    }

    #[test]
    fn test_equal_priority_is_fifo() {
        let h = harness(&["mem://a", "mem://b", "mem://c"], &lap_points(20));
        let pool = pool(&h, 1, 1000);

        let gate = hold(&pool, &h);
        let handles: Vec<TaskHandle> = ["mem://a", "mem://b", "mem://c"]
            .into_iter()
            .map(|u| pool.enqueue(lap(u), Priority::Normal, TaskCallbacks::new()))
            .collect();
        h.release.send(()).unwrap();

        gate.wait().unwrap();
        for handle in handles {
            handle.wait().unwrap();
        }
        assert_eq!(*h.fetcher.order.lock(), vec!["mem://gate", "mem://a", "mem://b", "mem://c"]);
    }

    #[test]
    fn test_crash_is_isolated_and_worker_replaced() {
        let h = harness(&["mem://after"], &lap_points(50));
        let pool = pool(&h, 2, 1000);

        let gate = hold(&pool, &h);
        let crash = pool.enqueue(lap("mem://panic"), Priority::Normal, TaskCallbacks::new());
        assert!(matches!(crash.wait(), Err(PipelineError::WorkerFault(_))));

        h.release.send(()).unwrap();
        assert!(gate.wait().is_ok());

        let after = pool.enqueue(lap("mem://after"), Priority::Normal, TaskCallbacks::new());
        assert!(after.wait().is_ok());

        let stats = pool.stats();
        assert_eq!(stats.workers, 2);
        assert_eq!(stats.restarts, 1);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn test_cancel_queued_task() {
        let h = harness(&["mem://queued"], &lap_points(20));
        let pool = pool(&h, 1, 1000);

        let gate = hold(&pool, &h);
        let queued = pool.enqueue(lap("mem://queued"), Priority::Normal, TaskCallbacks::new());
        assert!(pool.cancel(queued.id()));
        assert!(matches!(queued.wait(), Err(PipelineError::Cancelled)));
        assert!(!pool.cancel(TaskId(9999)));

        h.release.send(()).unwrap();
        assert!(gate.wait().is_ok());
        assert_eq!(*h.fetcher.order.lock(), vec!["mem://gate"]);
    }

    #[test]
    fn test_cancel_in_flight_ignores_late_messages() {
        let h = harness(&["mem://next"], &lap_points(20));
        let pool = pool(&h, 1, 1000);

        let (chunk_tx, chunk_rx) = channel::<Vec<TelemetryPoint>>();
        let gate = pool.enqueue(
            lap("mem://gate"),
            Priority::Normal,
            TaskCallbacks::new().on_chunk(move |c| chunk_tx.send(c).unwrap()),
        );
        h.entered.recv_timeout(WAIT).unwrap();

        assert!(pool.cancel(gate.id()));
        assert!(matches!(gate.wait(), Err(PipelineError::Cancelled)));

        let next = pool.enqueue(lap("mem://next"), Priority::Normal, TaskCallbacks::new());
        h.release.send(()).unwrap();
        assert!(next.wait().is_ok());
        assert!(chunk_rx.try_recv().is_err());
        assert_eq!(pool.stats().cancelled, 1);
    }

    #[test]
    fn test_clear_queue_rejects_waiting_tasks() {
        let h = harness(&["mem://a", "mem://b"], &lap_points(20));
        let pool = pool(&h, 1, 1000);

        let gate = hold(&pool, &h);
        let a = pool.enqueue(lap("mem://a"), Priority::Low, TaskCallbacks::new());
        let b = pool.enqueue(lap("mem://b"), Priority::High, TaskCallbacks::new());
        assert_eq!(pool.clear_queue(), 2);

        assert!(matches!(a.wait(), Err(PipelineError::QueueCleared)));
        assert!(matches!(b.wait(), Err(PipelineError::QueueCleared)));

        h.release.send(()).unwrap();
        assert!(gate.wait().is_ok());
    }

    #[test]
    fn test_terminate_rejects_pending_and_later_work() {
        let h = harness(&["mem://queued"], &lap_points(20));
        let pool = pool(&h, 1, 1000);

        let gate = hold(&pool, &h);
        let queued = pool.enqueue(lap("mem://queued"), Priority::Normal, TaskCallbacks::new());
        pool.terminate();
        pool.terminate();

        assert!(matches!(gate.wait(), Err(PipelineError::PoolTerminated)));
        assert!(matches!(queued.wait(), Err(PipelineError::QueueCleared)));

        let late = pool.enqueue(lap("mem://queued"), Priority::High, TaskCallbacks::new());
        assert!(matches!(late.wait_timeout(WAIT), Some(Err(PipelineError::PoolTerminated))));
        assert!(!pool.cancel(late.id()));
        assert_eq!(pool.stats(), PoolStats::default());

        h.release.send(()).unwrap();
    }

    #[test]
    fn test_downsample_task() {
        let h = harness(&[], &lap_points(1));
        let pool = pool(&h, 1, 1000);

        let handle = pool.enqueue(
            TaskRequest::Downsample {
                points: lap_points(4000),
                target_points: 400,
                channel: Channel::Speed,
            },
            Priority::Normal,
            TaskCallbacks::new(),
        );
        let points = handle.wait().unwrap().into_points().unwrap();
        assert_eq!(points.len(), 400);
    }

    #[test]
    fn test_factory_failure_fails_construction() {
        let result = WorkerPool::new(2, |_outbox: WorkerOutbox| -> Result<WorkerHandle> {
            Err(PipelineError::Config("no threads".into()))
        });
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_failed_replacement_is_retried_on_next_dispatch() {
        let h = harness(&["mem://after"], &lap_points(20));
        let pool = WorkerPool::new(1, flaky_factory(&h, |call| call == 1)).unwrap();

        let crash = pool.enqueue(lap("mem://panic"), Priority::Normal, TaskCallbacks::new());
        assert!(matches!(crash.wait_timeout(WAIT), Some(Err(PipelineError::WorkerFault(_)))));
        assert_eq!(pool.stats().workers, 0);

        let after = pool.enqueue(lap("mem://after"), Priority::Normal, TaskCallbacks::new());
        assert!(matches!(after.wait_timeout(WAIT), Some(Ok(_))));

        let stats = pool.stats();
        assert_eq!(stats.workers, 1);
        assert_eq!(stats.restarts, 1);
    }

    #[test]
    fn test_no_live_workers_rejects_queued_tasks() {
        let h = harness(&["mem://after"], &lap_points(20));
        let pool = WorkerPool::new(1, flaky_factory(&h, |call| call > 0)).unwrap();

        let crash = pool.enqueue(lap("mem://panic"), Priority::Normal, TaskCallbacks::new());
        assert!(matches!(crash.wait_timeout(WAIT), Some(Err(PipelineError::WorkerFault(_)))));

        let after = pool.enqueue(lap("mem://after"), Priority::High, TaskCallbacks::new());
        assert!(matches!(after.wait_timeout(WAIT), Some(Err(PipelineError::WorkerFault(_)))));

        let stats = pool.stats();
        assert_eq!(stats.workers, 0);
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.failed, 2);
        assert_eq!(*h.fetcher.order.lock(), vec!["mem://panic"]);
    }

    #[test]
    fn test_callbacks_can_call_into_pool() {
        let h = harness(&["mem://first", "mem://victim"], &lap_points(20));
        let pool = Arc::new(pool(&h, 1, 1000));
        let gate = hold(&pool, &h);

        let victim_id = Arc::new(Mutex::new(None));
        let (seen_tx, seen_rx) = channel();
        let callbacks = {
            let progress_pool = pool.clone();
            let complete_pool = pool.clone();
            let victim_id = victim_id.clone();
            TaskCallbacks::new()
                .on_progress(move |_| {
                    let _ = seen_tx.send(progress_pool.stats());
                })
                .on_complete(move |_| {
                    if let Some(id) = *victim_id.lock() {
                        assert!(complete_pool.cancel(id));
                    }
                })
        };
        let first = pool.enqueue(lap("mem://first"), Priority::Normal, callbacks);
        let victim = pool.enqueue(lap("mem://victim"), Priority::Normal, TaskCallbacks::new());
        *victim_id.lock() = Some(victim.id());
        h.release.send(()).unwrap();

        assert!(matches!(gate.wait_timeout(WAIT), Some(Ok(_))));
        assert!(matches!(first.wait_timeout(WAIT), Some(Ok(_))));
        assert!(matches!(victim.wait_timeout(WAIT), Some(Err(PipelineError::Cancelled))));

        let seen: Vec<PoolStats> = seen_rx.try_iter().collect();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|s| s.workers == 1));
        assert_eq!(pool.stats().cancelled, 1);
    }

    #[test]
    fn test_terminate_from_callback() {
        let h = harness(&["mem://stopper", "mem://queued"], &lap_points(20));
        let pool = Arc::new(pool(&h, 1, 1000));
        let gate = hold(&pool, &h);

        let stopper = {
            let pool_ref = pool.clone();
            pool.enqueue(
                lap("mem://stopper"),
                Priority::Normal,
                TaskCallbacks::new().on_complete(move |_| pool_ref.terminate()),
            )
        };
        let queued = pool.enqueue(lap("mem://queued"), Priority::Low, TaskCallbacks::new());
        h.release.send(()).unwrap();

        assert!(matches!(gate.wait_timeout(WAIT), Some(Ok(_))));
        assert!(matches!(stopper.wait_timeout(WAIT), Some(Ok(_))));
        assert!(matches!(
            queued.wait_timeout(WAIT),
            Some(Err(PipelineError::PoolTerminated | PipelineError::QueueCleared))
        ));

        pool.terminate();
        assert_eq!(pool.stats(), PoolStats::default());
    }
}
