//! Background task that owns the collector connection.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected (backoff) -> ...
//!                                   |
//!                       shutdown -> Draining -> Closed
//! ```

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::{
    Connection, Connector, HeartbeatPayload, OutgoingMessage, RegisterPayload, ServerMessage,
};
use crate::config::{BackoffConfig, Config};
use crate::error::TransportError;
use crate::event::Event;
use crate::queue::QueueReceiver;

/// Connection state of the transport worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
    Closed,
}

/// Worker knobs, taken from [`Config`].
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub backoff: BackoffConfig,
    pub debug: bool,
    pub register: RegisterPayload,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            connect_timeout: config.connect_timeout,
            backoff: config.backoff.clone(),
            debug: config.debug,
            register: RegisterPayload::from_config(config),
        }
    }
}

/// Outcome of the shutdown flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Events sent after shutdown was requested.
    pub sent: u64,
    /// Events dropped after shutdown was requested.
    pub dropped: u64,
}

pub struct TransportWorker {
    connector: Box<dyn Connector>,
    queue: QueueReceiver,
    settings: WorkerSettings,
    shutdown: watch::Receiver<bool>,
    backoff: Backoff,
    state: watch::Sender<WorkerState>,
}

impl TransportWorker {
    /// `shutdown` flips to `true` (or its sender is dropped) to start the
    /// drain.
    pub fn new(
        connector: impl Connector,
        queue: QueueReceiver,
        settings: WorkerSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Disconnected);
        Self {
            connector: Box::new(connector),
            queue,
            backoff: Backoff::new(settings.backoff.clone()),
            settings,
            shutdown,
            state,
        }
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Run until shutdown is requested and the queue has been flushed.
    pub async fn run(mut self) -> DrainReport {
        let mut conn = None;

        while !self.shutdown_requested() {
            self.set_state(WorkerState::Connecting);
            let opened = tokio::select! {
                opened = Self::open(self.connector.as_ref(), &self.settings) => opened,
                _ = self.shutdown.changed() => break,
            };

            match opened {
                Ok(mut connected) => {
                    self.on_connected();
                    match self.pump(&mut connected).await {
                        Ok(()) => {
                            conn = Some(connected);
                            break;
                        }
                        Err(e) => {
                            self.log_disconnect(&e);
                            self.set_state(WorkerState::Disconnected);
                        }
                    }
                }
                Err(e) => {
                    self.log_connect_failure(&e);
                    self.set_state(WorkerState::Disconnected);
                }
            }

            if self.shutdown_requested() {
                break;
            }
            let delay = self.backoff.next_delay();
            debug!(?delay, attempt = self.backoff.attempt(), "Reconnecting after delay");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => {}
            }
        }

        self.drain(conn).await
    }

    async fn open(
        connector: &dyn Connector,
        settings: &WorkerSettings,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let mut conn = tokio::time::timeout(settings.connect_timeout, connector.connect())
            .await
            .map_err(|_| TransportError::Timeout(settings.connect_timeout))??;

        let register = OutgoingMessage::new("register", &settings.register).to_json()?;
        conn.send(register).await?;
        Ok(conn)
    }

    fn on_connected(&mut self) {
        if self.backoff.attempt() > 0 {
            info!(attempts = self.backoff.attempt(), "Reconnected to collector");
        } else {
            info!("Connected to collector");
        }
        self.backoff.reset();
        self.set_state(WorkerState::Connected);
    }

    /// Forward events while connected. `Ok` means shutdown was requested.
    async fn pump(&mut self, conn: &mut Box<dyn Connection>) -> Result<(), TransportError> {
        let period = self.settings.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => return Ok(()),
                event = self.queue.recv() => match event {
                    Some(event) => self.deliver(conn, event).await?,
                    // Every sender is gone, nothing more can arrive.
                    None => return Ok(()),
                },
                incoming = conn.recv() => match incoming {
                    Some(Ok(text)) => self.handle_server_message(&text)?,
                    Some(Err(e)) => return Err(e),
                    None => return Err(TransportError::Closed),
                },
                _ = heartbeat.tick() => {
                    let payload = HeartbeatPayload {
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    };
                    conn.send(OutgoingMessage::new("heartbeat", &payload).to_json()?).await?;
                }
            }
        }
    }

    /// Send one event. On failure the event is requeued (or dropped when the
    /// queue is full) and the error returned so the caller reconnects.
    async fn deliver(
        &mut self,
        conn: &mut Box<dyn Connection>,
        event: Event,
    ) -> Result<(), TransportError> {
        let json = match OutgoingMessage::new("exception", &event).to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "Dropping event that failed to serialize");
                self.queue.mark_dropped();
                return Ok(());
            }
        };

        match conn.send(json).await {
            Ok(()) => {
                self.queue.mark_delivered();
                if self.settings.debug {
                    debug!(event_id = %event.id, kind = %event.kind, "Event delivered");
                }
                Ok(())
            }
            Err(e) => {
                let event_id = event.id.clone();
                if !self.queue.requeue_front(event) {
                    warn!(event_id = %event_id, "Queue full, dropping undelivered event");
                }
                Err(e)
            }
        }
    }

    fn handle_server_message(&self, text: &str) -> Result<(), TransportError> {
        match ServerMessage::parse(text) {
            Some(ServerMessage::Registered) => info!("Agent registered with collector"),
            Some(ServerMessage::Error { code, message }) => {
                let err = TransportError::Rejected { code, message };
                if err.is_auth_failure() {
                    error!(error = %err, "Collector authentication failed");
                    return Err(err);
                }
                warn!(error = %err, "Collector reported an error");
            }
            Some(ServerMessage::Other(msg_type)) => {
                if self.settings.debug {
                    debug!(%msg_type, "Ignoring collector message");
                }
            }
            None => {
                if self.settings.debug {
                    debug!("Ignoring malformed collector message");
                }
            }
        }
        Ok(())
    }

    /// Flush what is queued, reconnecting only while events remain.
    async fn drain(mut self, mut conn: Option<Box<dyn Connection>>) -> DrainReport {
        self.set_state(WorkerState::Draining);
        self.queue.close();

        let stats = std::sync::Arc::clone(self.queue.stats());
        let delivered_before = stats.delivered();
        let dropped_before = stats.dropped();
        debug!(queued = self.queue.len(), "Draining delivery queue");

        while !self.queue.is_empty() {
            if conn.is_none() {
                match Self::open(self.connector.as_ref(), &self.settings).await {
                    Ok(connection) => {
                        self.backoff.reset();
                        conn = Some(connection);
                    }
                    Err(e) => {
                        self.log_connect_failure(&e);
                        tokio::time::sleep(self.backoff.next_delay()).await;
                        continue;
                    }
                }
            }
            let Some(connection) = conn.as_mut() else {
                continue;
            };

            let Some(event) = self.queue.try_recv() else {
                break;
            };
            if let Err(e) = self.deliver(connection, event).await {
                self.log_disconnect(&e);
                conn = None;
            }
        }

        if let Some(mut connection) = conn {
            connection.close().await;
        }
        self.set_state(WorkerState::Closed);

        let report = DrainReport {
            sent: stats.delivered().saturating_sub(delivered_before),
            dropped: stats.dropped().saturating_sub(dropped_before),
        };
        info!(sent = report.sent, dropped = report.dropped, "Transport drained");
        report
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    fn log_connect_failure(&self, error: &TransportError) {
        if self.backoff.attempt() == 0 {
            warn!(error = %error, "Failed to connect to collector");
        } else {
            debug!(error = %error, attempt = self.backoff.attempt(), "Connection attempt failed");
        }
    }

    fn log_disconnect(&self, error: &TransportError) {
        warn!(error = %error, "Disconnected from collector");
    }
}
