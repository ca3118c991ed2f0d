//! Faultline Agent
//!
//! In-process capture of panics and reported errors for Rust services. Events
//! are built on the calling thread, bounded to configurable limits, handed to
//! a non-blocking queue and streamed to a remote collector by a background
//! transport worker.
//!
//! # Quick Start
//!
//! ```no_run
//! use faultline::Config;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Installs the panic hook and starts the transport worker.
//!     faultline::init(Config::new("my-api-key").environment("staging"))?;
//!
//!     faultline::set_global_context(faultline::context! { "service" => "billing" });
//!
//!     if let Err(e) = std::fs::read_to_string("/etc/billing.toml") {
//!         faultline::capture_error(&e);
//!     }
//!
//!     // Flush queued events, bounded by the configured shutdown timeout.
//!     let report = faultline::shutdown();
//!     println!("delivered {} events", report.delivered);
//!     Ok(())
//! }
//! ```
//!
//! # Threading
//!
//! Capture calls never block on the network: when the queue is full the new
//! event is dropped and counted. The worker runs on the host's multi-threaded
//! tokio runtime when `init` is called from inside one, otherwise on a
//! dedicated `faultline-transport` thread (see [`Executor`]). Only
//! [`shutdown`] blocks, and never for longer than its deadline.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

mod agent;
pub mod builder;
mod config;
mod context;
mod error;
mod event;
mod hook;
pub mod queue;
mod sampler;
pub mod transport;

use std::error::Error as StdError;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

pub use agent::{Agent, AgentState, AgentStatus, ShutdownReport};
pub use config::{
    BackoffConfig, Config, Executor, DEFAULT_BACKEND_URL, DEFAULT_ENVIRONMENT,
    DEFAULT_MAX_CAPTURE_DEPTH, DEFAULT_MAX_COLLECTION_SIZE, DEFAULT_MAX_STRING_LENGTH,
    DEFAULT_QUEUE_CAPACITY, DEFAULT_SAMPLING_RATE, DEFAULT_SHUTDOWN_TIMEOUT,
};
pub use context::{
    ContextMap, ContextValue, FieldUpdate, UserIdentity, UserUpdate, UNSERIALIZABLE_PLACEHOLDER,
};
pub use error::{ConfigError, Error, Result, TransportError};
pub use event::{Event, EventKind, RuntimeInfo, StackFrame};
pub use hook::active_hooks;
pub use queue::StatsSnapshot;

/// Init/shutdown lock to prevent concurrent initialization races.
static INIT_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// The process-wide agent used by the free functions.
static AGENT: RwLock<Option<Arc<Agent>>> = RwLock::new(None);

/// Initialize the process-wide agent.
///
/// Applies `FAULTLINE_*` environment variables to fields left at their
/// defaults, validates the configuration, starts the transport worker and
/// installs the panic hook.
///
/// Calling `init` while an agent is already running is a no-op: the first
/// configuration stays in effect and no second hook or worker is started.
///
/// # Errors
///
/// Returns [`Error::Config`] when the API key is missing or a value is
/// invalid, and [`Error::Runtime`]/[`Error::Io`] when the dedicated transport
/// runtime cannot be started.
///
/// # Example
///
/// ```no_run
/// faultline::init(faultline::Config::new("my-api-key").sampling_rate(0.5))?;
/// # Ok::<(), faultline::Error>(())
/// ```
pub fn init(config: Config) -> Result<()> {
    let _init_guard = lock_init();

    if is_initialized() {
        debug!("Faultline already initialized, ignoring init");
        return Ok(());
    }

    let agent = Agent::start(config.with_env_overrides())?;
    *write_slot() = Some(Arc::new(agent));
    Ok(())
}

/// Shut down the process-wide agent using its configured `shutdown_timeout`.
///
/// Returns an empty report when no agent is running.
pub fn shutdown() -> ShutdownReport {
    shutdown_inner(None)
}

/// Shut down the process-wide agent, flushing for at most `deadline`.
pub fn shutdown_with_deadline(deadline: Duration) -> ShutdownReport {
    shutdown_inner(Some(deadline))
}

fn shutdown_inner(deadline: Option<Duration>) -> ShutdownReport {
    let _init_guard = lock_init();

    let Some(agent) = write_slot().take() else {
        return ShutdownReport::default();
    };
    match deadline {
        Some(deadline) => agent.shutdown_with_deadline(deadline),
        None => agent.shutdown(),
    }
}

/// Whether the process-wide agent is running.
pub fn is_initialized() -> bool {
    current().is_some_and(|agent| agent.state() == AgentState::Running)
}

/// Capture an error through the process-wide agent.
///
/// No-op before [`init`] and after [`shutdown`]. Returns the event id when
/// the event was queued.
pub fn capture_error<E: StdError + ?Sized>(error: &E) -> Option<String> {
    current()?.capture_error(error)
}

/// Capture an error with per-call context.
pub fn capture_error_with_context<E: StdError + ?Sized>(
    error: &E,
    context: ContextMap,
) -> Option<String> {
    current()?.capture_error_with_context(error, context)
}

/// Capture a plain message as a reported error.
pub fn capture_message(message: &str) -> Option<String> {
    current()?.capture_message(message)
}

/// Replace the global context attached to every event.
pub fn set_global_context(context: ContextMap) {
    if let Some(agent) = current() {
        agent.set_global_context(context);
    }
}

/// Insert or replace one global context key.
pub fn set_context_value(key: impl Into<String>, value: impl Into<ContextValue>) {
    if let Some(agent) = current() {
        agent.set_context_value(key, value);
    }
}

/// Set the user identity. `None` leaves that field unchanged; use
/// [`update_user`] or [`clear_user`] to remove values.
pub fn set_user(id: Option<&str>, email: Option<&str>, username: Option<&str>) {
    if let Some(agent) = current() {
        agent.set_user(id, email, username);
    }
}

/// Apply a field-by-field identity update; unlike [`set_user`] it can clear
/// individual fields.
pub fn update_user(update: UserUpdate) {
    if let Some(agent) = current() {
        agent.update_user(update);
    }
}

/// Remove the user identity from subsequent events.
pub fn clear_user() {
    if let Some(agent) = current() {
        agent.clear_user();
    }
}

/// Current agent status; `Uninitialized` with zeroed counters when no agent
/// is running.
pub fn status() -> AgentStatus {
    current().map(|agent| agent.status()).unwrap_or_default()
}

fn current() -> Option<Arc<Agent>> {
    match AGENT.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn write_slot() -> std::sync::RwLockWriteGuard<'static, Option<Arc<Agent>>> {
    match AGENT.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Agent slot lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

fn lock_init() -> std::sync::MutexGuard<'static, ()> {
    let lock = INIT_LOCK.get_or_init(|| Mutex::new(()));
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
