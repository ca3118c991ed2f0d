//! The agent handle: owns the panic hook, the delivery queue and the
//! transport worker for one configuration.

use std::error::Error as StdError;
use std::panic::PanicHookInfo;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::builder::{EventBuilder, EventSource};
use crate::config::{Config, Executor};
use crate::context::{ContextMap, ContextStore, ContextValue, UserUpdate};
use crate::error::{Error, Result};
use crate::hook::{self, HookGuard};
use crate::queue::{delivery_queue, QueueSender, StatsSnapshot};
use crate::sampler::should_sample;
use crate::transport::{
    Connector, DrainReport, TransportWorker, WebSocketConnector, WorkerSettings, WorkerState,
};

/// How long `shutdown` waits for an aborted host-runtime task to stop.
const ABORT_GRACE: Duration = Duration::from_millis(500);

/// Lifecycle of an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum AgentState {
    #[default]
    Uninitialized = 0,
    Running = 1,
    /// Shutdown requested, queued events are being flushed.
    Draining = 2,
    Shutdown = 3,
}

impl AgentState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Draining,
            3 => Self::Shutdown,
            _ => Self::Uninitialized,
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Result of [`Agent::shutdown_with_deadline`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Events sent during the shutdown flush.
    pub flushed: u64,
    /// Events still undelivered when the deadline passed.
    pub discarded: u64,
    /// Events delivered over the agent's lifetime.
    pub delivered: u64,
    /// Events dropped over the agent's lifetime (overflow, failed sends,
    /// discarded at shutdown).
    pub total_dropped: u64,
    /// Whether the flush was cut short by the deadline.
    pub timed_out: bool,
}

/// Snapshot returned by [`Agent::status`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentStatus {
    pub state: AgentState,
    /// Transport connection state; `None` once the worker has stopped.
    pub connection: Option<WorkerState>,
    pub environment: String,
    pub agent_id: String,
    pub stats: StatsSnapshot,
}

/// State shared between the handle and the installed panic hook.
struct Shared {
    config: Config,
    builder: EventBuilder,
    context: ContextStore,
    sender: QueueSender,
    state: AtomicU8,
}

impl Shared {
    fn state(&self) -> AgentState {
        AgentState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: AgentState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn capture(
        &self,
        source: impl FnOnce(&EventBuilder) -> EventSource,
        context: Option<&ContextMap>,
    ) -> Option<String> {
        let state = self.state();
        if state != AgentState::Running {
            if self.config.debug {
                debug!(%state, "Capture ignored, agent is not running");
            }
            return None;
        }
        if !should_sample(self.config.sampling_rate) {
            return None;
        }

        let event = self
            .builder
            .build(source(&self.builder), context, &self.context.snapshot());
        let event_id = event.id.clone();
        let kind = event.kind;
        if self.sender.enqueue(event) {
            if self.config.debug {
                debug!(event_id = %event_id, %kind, "Event queued");
            }
            Some(event_id)
        } else {
            if self.config.debug {
                debug!(event_id = %event_id, "Delivery queue full, event dropped");
            }
            None
        }
    }

    /// Runs inside the panic hook: no logging, no blocking locks.
    fn capture_fault(&self, info: &PanicHookInfo<'_>) {
        if self.state() != AgentState::Running || !should_sample(self.config.sampling_rate) {
            return;
        }
        let source = self.builder.fault_source(info);
        let event = self
            .builder
            .build(source, None, &self.context.try_snapshot());
        let _ = self.sender.enqueue(event);
    }
}

enum WorkerHandle {
    /// Task on a runtime owned by the host.
    Spawned(tokio::task::JoinHandle<()>),
    /// Dedicated thread owning a current-thread runtime.
    Dedicated {
        thread: thread::JoinHandle<()>,
        abort: oneshot::Sender<()>,
    },
}

struct Running {
    hook: HookGuard,
    shutdown: watch::Sender<bool>,
    worker: WorkerHandle,
    done: std_mpsc::Receiver<DrainReport>,
    connection: watch::Receiver<WorkerState>,
}

/// A running capture agent.
///
/// Most applications use the process-wide functions ([`crate::init`],
/// [`crate::capture_error`], ...) which wrap a single `Agent`. Holding an
/// `Agent` directly is useful when the lifecycle should be tied to a scope.
///
/// Dropping a running agent shuts it down with the configured
/// `shutdown_timeout`.
pub struct Agent {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl Agent {
    /// Validate `config`, start the transport worker and install the panic
    /// hook.
    pub fn start(config: Config) -> Result<Self> {
        let connector = WebSocketConnector::new(config.backend_url.clone());
        Self::start_with_connector(config, connector)
    }

    /// Like [`Agent::start`] but delivering through a custom [`Connector`].
    pub fn start_with_connector(config: Config, connector: impl Connector) -> Result<Self> {
        let config = config.validated()?;

        let (sender, receiver) = delivery_queue(config.queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = TransportWorker::new(
            connector,
            receiver,
            WorkerSettings::from_config(&config),
            shutdown_rx,
        );
        let connection = worker.state();
        let (done_tx, done_rx) = std_mpsc::sync_channel(1);
        let handle = spawn_worker(&config.executor, worker, done_tx)?;

        let shared = Arc::new(Shared {
            builder: EventBuilder::new(&config),
            context: ContextStore::new(),
            sender,
            state: AtomicU8::new(AgentState::Running as u8),
            config,
        });

        let hook_shared = Arc::clone(&shared);
        let hook = hook::install(move |info| hook_shared.capture_fault(info));

        info!(
            environment = %shared.config.environment,
            agent_id = %shared.config.agent_id,
            backend_url = %shared.config.backend_url,
            "Faultline agent started"
        );

        Ok(Self {
            shared,
            running: Mutex::new(Some(Running {
                hook,
                shutdown: shutdown_tx,
                worker: handle,
                done: done_rx,
                connection,
            })),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn state(&self) -> AgentState {
        self.shared.state()
    }

    /// Capture an error and its `source()` chain.
    ///
    /// Returns the event id when the event was queued; `None` when it was
    /// sampled out, dropped, or the agent is not running.
    pub fn capture_error<E: StdError + ?Sized>(&self, error: &E) -> Option<String> {
        self.shared
            .capture(|builder| builder.error_source(error), None)
    }

    /// Capture an error with extra context. Per-call keys win over global
    /// ones.
    pub fn capture_error_with_context<E: StdError + ?Sized>(
        &self,
        error: &E,
        context: ContextMap,
    ) -> Option<String> {
        self.shared
            .capture(|builder| builder.error_source(error), Some(&context))
    }

    /// Capture a plain message as a reported error.
    pub fn capture_message(&self, message: &str) -> Option<String> {
        self.shared
            .capture(|builder| builder.message_source(message), None)
    }

    /// Replace the global context attached to every later event.
    pub fn set_global_context(&self, context: ContextMap) {
        self.shared.context.set_global(context);
    }

    pub fn set_context_value(&self, key: impl Into<String>, value: impl Into<ContextValue>) {
        self.shared.context.set_global_value(key, value);
    }

    /// Set the user identity. `None` keeps the current value of that field.
    pub fn set_user(&self, id: Option<&str>, email: Option<&str>, username: Option<&str>) {
        self.shared
            .context
            .update_user(UserUpdate::from_options(id, email, username));
    }

    /// Apply a field-by-field identity update, including explicit clears.
    pub fn update_user(&self, update: UserUpdate) {
        self.shared.context.update_user(update);
    }

    /// Remove the user identity.
    pub fn clear_user(&self) {
        self.shared.context.clear_user();
    }

    /// Lifecycle state, connection state and queue counters.
    pub fn status(&self) -> AgentStatus {
        let connection = self
            .lock_running()
            .as_ref()
            .map(|running| *running.connection.borrow());
        AgentStatus {
            state: self.state(),
            connection,
            environment: self.shared.config.environment.clone(),
            agent_id: self.shared.config.agent_id.clone(),
            stats: self.shared.sender.stats().snapshot(),
        }
    }

    /// Shut down with the configured `shutdown_timeout`.
    pub fn shutdown(&self) -> ShutdownReport {
        self.shutdown_with_deadline(self.shared.config.shutdown_timeout)
    }

    /// Stop capturing, restore the previous panic hook and flush queued
    /// events, waiting at most `deadline`.
    ///
    /// Events still queued when the deadline passes are discarded and
    /// counted. Calling this on an agent that is already shut down returns an
    /// empty report.
    ///
    /// Blocks the calling thread. Inside a multi-threaded tokio runtime the
    /// wait goes through `block_in_place`; on a current-thread runtime that
    /// also runs the worker, the flush cannot progress and the deadline
    /// applies.
    pub fn shutdown_with_deadline(&self, deadline: Duration) -> ShutdownReport {
        let Some(running) = self.lock_running().take() else {
            return ShutdownReport::default();
        };

        self.shared.set_state(AgentState::Draining);
        let stats = Arc::clone(self.shared.sender.stats());
        let delivered_before = stats.delivered();

        running.hook.uninstall();
        running.shutdown.send_replace(true);

        let outcome = blocking_recv(&running.done, deadline);
        let timed_out = matches!(outcome, Err(RecvTimeoutError::Timeout));
        if let Err(RecvTimeoutError::Disconnected) = outcome {
            warn!("Transport worker exited before finishing the flush");
        }
        stop_worker(running.worker, &running.done, timed_out);

        let discarded = stats.discard_pending();
        self.shared.set_state(AgentState::Shutdown);

        let report = ShutdownReport {
            flushed: match outcome {
                Ok(drain) => drain.sent,
                Err(_) => stats.delivered().saturating_sub(delivered_before),
            },
            discarded,
            delivered: stats.delivered(),
            total_dropped: stats.dropped(),
            timed_out,
        };
        if timed_out {
            warn!(
                flushed = report.flushed,
                discarded = report.discarded,
                ?deadline,
                "Shutdown deadline reached, discarding undelivered events"
            );
        } else {
            info!(
                flushed = report.flushed,
                total_dropped = report.total_dropped,
                "Faultline agent shut down"
            );
        }
        report
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Agent lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if self.lock_running().is_some() {
            self.shutdown();
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("state", &self.state())
            .field("environment", &self.shared.config.environment)
            .field("agent_id", &self.shared.config.agent_id)
            .finish()
    }
}

/// Resolve the runtime the worker runs on and start it there.
fn spawn_worker(
    executor: &Executor,
    worker: TransportWorker,
    done: std_mpsc::SyncSender<DrainReport>,
) -> Result<WorkerHandle> {
    let task = async move {
        let report = worker.run().await;
        let _ = done.send(report);
    };

    let host = match executor {
        Executor::Handle(handle) => Some(handle.clone()),
        Executor::Auto => Handle::try_current()
            .ok()
            .filter(|handle| handle.runtime_flavor() == RuntimeFlavor::MultiThread),
        Executor::Dedicated => None,
    };
    if let Some(handle) = host {
        debug!("Spawning transport worker on the host runtime");
        return Ok(WorkerHandle::Spawned(handle.spawn(task)));
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Runtime(e.to_string()))?;
    let (abort_tx, abort_rx) = oneshot::channel::<()>();

    let thread = thread::Builder::new()
        .name("faultline-transport".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                tokio::select! {
                    _ = task => {}
                    _ = abort_rx => debug!("Transport worker aborted"),
                }
            });
            // Don't wait on blocking tasks (DNS lookups) left by an abort.
            runtime.shutdown_background();
        })?;
    debug!("Started dedicated transport thread");

    Ok(WorkerHandle::Dedicated {
        thread,
        abort: abort_tx,
    })
}

/// Wait on the worker's report channel without stalling a multi-threaded
/// runtime the caller may be running on.
fn blocking_recv(
    done: &std_mpsc::Receiver<DrainReport>,
    timeout: Duration,
) -> std::result::Result<DrainReport, RecvTimeoutError> {
    let wait = || done.recv_timeout(timeout);
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(wait)
        }
        _ => wait(),
    }
}

fn stop_worker(worker: WorkerHandle, done: &std_mpsc::Receiver<DrainReport>, abort: bool) {
    match worker {
        WorkerHandle::Spawned(task) => {
            if abort {
                task.abort();
                wait_for_task_exit(done);
            }
        }
        WorkerHandle::Dedicated { thread, abort: abort_tx } => {
            if abort {
                let _ = abort_tx.send(());
            }
            if thread.join().is_err() {
                warn!("Transport thread panicked");
            }
        }
    }
}

/// Wait until an aborted task has been dropped.
///
/// `abort` only takes effect at the task's next yield point; a send already
/// being polled on another runtime thread still completes and updates the
/// queue counters. The task owns the report sender, so the channel
/// disconnects once the task is gone.
fn wait_for_task_exit(done: &std_mpsc::Receiver<DrainReport>) {
    let deadline = Instant::now() + ABORT_GRACE;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match blocking_recv(done, remaining) {
            Ok(_) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {
                warn!(grace = ?ABORT_GRACE, "Aborted transport task has not stopped");
                return;
            }
        }
    }
}
