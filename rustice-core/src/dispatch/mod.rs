//! Decode-and-dispatch worker pool.
//!
//! Inbound datagrams become immutable jobs on a bounded queue; a fixed
//! set of workers competes for them, decodes, and hands the structured
//! message to the registered event handler on the worker itself. A
//! job's cancellation flag is advisory: it is read once before decode
//! and once more before dispatch, so a cancel racing a decode lets the
//! decode finish but suppresses delivery.
//!
//! Whatever exit a job takes (delivered, undecodable, cancelled,
//! panicked worker, or dropped in the queue at shutdown), its
//! completion callback runs exactly once; the pool's pending count
//! stays honest the same way.

mod arena;

pub use arena::{ArenaBuf, BufferArena};

use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::message::Message;

/// Identifies the worker reporting a fatal failure.
pub type WorkerId = usize;

/// Delivery target for decoded messages. Invoked synchronously on the
/// worker that decoded the datagram.
pub trait MessageEventHandler: Send + Sync {
    fn handle_message_event(&self, event: StunMessageEvent);
}

/// Sink for the two error severities the pool distinguishes.
pub trait DispatchErrorHandler: Send + Sync {
    /// A single message could not be processed; the pool moves on.
    fn handle_error(&self, message: &str, error: &Error);
    /// A worker caught something it cannot attribute to the input.
    /// The job is abandoned but the pool keeps running.
    fn handle_fatal_error(&self, worker: WorkerId, message: &str, detail: &str);
}

/// Default error sink: log and keep going.
struct LogErrorHandler;

impl DispatchErrorHandler for LogErrorHandler {
    fn handle_error(&self, message: &str, error: &Error) {
        log::debug!("{message}: {error:?}");
    }
    fn handle_fatal_error(&self, worker: WorkerId, message: &str, detail: &str) {
        log::warn!("worker {worker}: {message}: {detail}");
    }
}

/// One datagram as received, before decoding.
pub struct RawMessage {
    buf: ArenaBuf,
    remote: SocketAddr,
    local: SocketAddr,
}

impl RawMessage {
    pub fn new(buf: ArenaBuf, remote: SocketAddr, local: SocketAddr) -> Self {
        Self { buf, remote, local }
    }
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.buf
    }
    #[inline]
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
    #[inline]
    pub fn local(&self) -> SocketAddr {
        self.local
    }
}

/// A decoded message plus the addresses it travelled between.
pub struct StunMessageEvent {
    message: Message,
    remote: SocketAddr,
    local: SocketAddr,
}

impl StunMessageEvent {
    #[inline]
    pub fn message(&self) -> &Message {
        &self.message
    }
    #[inline]
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
    #[inline]
    pub fn local(&self) -> SocketAddr {
        self.local
    }
    pub fn into_message(self) -> Message {
        self.message
    }
}

type DoneCallback = Box<dyn FnOnce() + Send>;

struct DispatchJob {
    raw: RawMessage,
    cancelled: Arc<AtomicBool>,
    on_done: Option<DoneCallback>,
    pending: Arc<AtomicUsize>,
}

impl DispatchJob {
    fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Drop for DispatchJob {
    // The drop site is the single completion point: process() drops the
    // job when it is done with it, and a job discarded in the queue at
    // shutdown completes here too.
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        if let Some(on_done) = self.on_done.take() {
            on_done();
        }
    }
}

/// Cancels one submitted job.
#[derive(Clone)]
pub struct JobHandle {
    cancelled: Arc<AtomicBool>,
}

impl JobHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

pub struct DispatchConfig {
    workers: usize,
    queue_capacity: usize,
    arena_buffers: usize,
    buffer_capacity: usize,
    event_handler: Option<Arc<dyn MessageEventHandler>>,
    error_handler: Option<Arc<dyn DispatchErrorHandler>>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 128,
            arena_buffers: 128,
            buffer_capacity: 2048,
            event_handler: None,
            error_handler: None,
        }
    }
}

impl DispatchConfig {
    pub fn set_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
    pub fn set_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }
    pub fn set_arena_buffers(mut self, arena_buffers: usize) -> Self {
        self.arena_buffers = arena_buffers;
        self
    }
    pub fn set_buffer_capacity(mut self, buffer_capacity: usize) -> Self {
        self.buffer_capacity = buffer_capacity;
        self
    }
    pub fn set_event_handler(mut self, handler: Arc<dyn MessageEventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }
    pub fn set_error_handler(mut self, handler: Arc<dyn DispatchErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }
    pub fn check(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "workers must be greater than 0",
            )));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "queue_capacity must be greater than 0",
            )));
        }
        if self.event_handler.is_none() {
            return Err(Error::NoEventHandler);
        }
        Ok(())
    }
}

pub struct DispatchPool {
    queue: flume::Sender<DispatchJob>,
    arena: BufferArena,
    close: async_broadcast::Sender<()>,
    pending: Arc<AtomicUsize>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl DispatchPool {
    /// Validates the configuration and spawns the workers. A pool
    /// without an event handler has nowhere to deliver and is refused.
    pub fn new(config: DispatchConfig) -> Result<Self> {
        config.check()?;
        let event_handler = config.event_handler.ok_or(Error::NoEventHandler)?;
        let error_handler = config
            .error_handler
            .unwrap_or_else(|| Arc::new(LogErrorHandler));

        let (queue, jobs) = flume::bounded::<DispatchJob>(config.queue_capacity);
        let (close, close_rx) = async_broadcast::broadcast(1);
        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            workers.push(tokio::spawn(worker_loop(
                index,
                jobs.clone(),
                close_rx.clone(),
                event_handler.clone(),
                error_handler.clone(),
            )));
        }
        Ok(Self {
            queue,
            arena: BufferArena::new(config.arena_buffers, config.buffer_capacity),
            close,
            pending: Arc::new(AtomicUsize::new(0)),
            workers,
        })
    }

    /// The arena raw datagram buffers should be checked out of.
    pub fn arena(&self) -> &BufferArena {
        &self.arena
    }

    /// Queues one datagram for decode and delivery.
    ///
    /// `on_done` runs exactly once when the pool is finished with the
    /// job, no matter how the job ends. An empty payload is refused
    /// here, before anything is queued or counted.
    pub fn dispatch<F: FnOnce() + Send + 'static>(
        &self,
        raw: RawMessage,
        on_done: F,
    ) -> Result<JobHandle> {
        if raw.payload().is_empty() {
            return Err(Error::EmptyMessage);
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        self.pending.fetch_add(1, Ordering::AcqRel);
        let job = DispatchJob {
            raw,
            cancelled: cancelled.clone(),
            on_done: Some(Box::new(on_done)),
            pending: self.pending.clone(),
        };
        // The job's Drop keeps the count right if the send is refused.
        match self.queue.try_send(job) {
            Ok(()) => Ok(JobHandle { cancelled }),
            Err(flume::TrySendError::Full(_)) => Err(Error::QueueFull),
            Err(flume::TrySendError::Disconnected(_)) => Err(Error::PoolClosed),
        }
    }

    /// Jobs accepted but not yet completed.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Stops the workers and waits for them to exit. Jobs still queued
    /// are discarded, which completes their callbacks.
    pub async fn shutdown(self) {
        let DispatchPool {
            queue,
            close,
            workers,
            ..
        } = self;
        let _ = close.close();
        drop(queue);
        futures::future::join_all(workers).await;
    }
}

async fn worker_loop(
    index: WorkerId,
    jobs: flume::Receiver<DispatchJob>,
    mut close: async_broadcast::Receiver<()>,
    event_handler: Arc<dyn MessageEventHandler>,
    error_handler: Arc<dyn DispatchErrorHandler>,
) {
    loop {
        // Close wins over queued work: a stopping pool discards what
        // it has not started, and discarding still completes the jobs.
        let job = tokio::select! {
            biased;
            _ = close.recv() => break,
            job = jobs.recv_async() => match job {
                Ok(job) => job,
                Err(_) => break,
            },
        };
        process(index, job, &*event_handler, &*error_handler);
    }
    log::debug!("dispatch worker {index} exit");
}

fn process(
    worker: WorkerId,
    job: DispatchJob,
    events: &dyn MessageEventHandler,
    errors: &dyn DispatchErrorHandler,
) {
    // Dropping `job` at the end of this scope is what fires the
    // completion callback, on every path below including a panic.
    if job.cancelled() {
        return;
    }
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let message = match Message::decode(job.raw.payload()) {
            Ok(message) => message,
            Err(e) => {
                errors.handle_error("failed to decode datagram", &e);
                return;
            }
        };
        if job.cancelled() {
            return;
        }
        events.handle_message_event(StunMessageEvent {
            message,
            remote: job.raw.remote(),
            local: job.raw.local(),
        });
    }));
    if let Err(panic) = outcome {
        errors.handle_fatal_error(
            worker,
            "uncaught failure while processing message",
            panic_detail(&panic),
        );
    }
}

fn panic_detail(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "panic"
    }
}
