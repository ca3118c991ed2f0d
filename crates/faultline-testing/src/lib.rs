//! Test utilities for faultline
//!
//! [`MockCollector`] is an in-process WebSocket collector. It runs on its own
//! thread and runtime so it works from both sync tests and `#[tokio::test]`,
//! answers `register` with `registered`, and records every JSON message it
//! receives.
//!
//! # Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use faultline_testing::MockCollector;
//!
//! let collector = MockCollector::start().unwrap();
//! // Point the agent's backend_url at collector.url(), capture, shut down.
//! assert!(collector.wait_for_exceptions(1, Duration::from_secs(5)));
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, warn};

#[derive(Default)]
struct CollectorState {
    messages: Mutex<Vec<Value>>,
    connections: AtomicUsize,
    /// When set, registrations with any other key are rejected.
    expected_api_key: Option<String>,
}

impl CollectorState {
    fn record(&self, message: Value) {
        match self.messages.lock() {
            Ok(mut guard) => guard.push(message),
            Err(poisoned) => poisoned.into_inner().push(message),
        }
    }
}

/// In-process mock of the collector's agent endpoint.
pub struct MockCollector {
    addr: SocketAddr,
    state: Arc<CollectorState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl MockCollector {
    /// Start a collector on an ephemeral localhost port that accepts any key.
    pub fn start() -> std::io::Result<Self> {
        Self::spawn(CollectorState::default())
    }

    /// Start a collector that rejects registrations whose API key differs
    /// from `api_key` with an `invalid_api_key` error.
    pub fn with_api_key(api_key: impl Into<String>) -> std::io::Result<Self> {
        Self::spawn(CollectorState {
            expected_api_key: Some(api_key.into()),
            ..CollectorState::default()
        })
    }

    fn spawn(state: CollectorState) -> std::io::Result<Self> {
        // Bind on the caller's thread so the port is known before returning.
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = std_listener.local_addr()?;
        std_listener.set_nonblocking(true)?;

        let state = Arc::new(state);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let thread_state = Arc::clone(&state);
        let thread_handle = thread::Builder::new()
            .name("mock-collector".to_string())
            .spawn(move || run_collector_thread(std_listener, shutdown_rx, thread_state))?;

        debug!("Mock collector listening on {}", addr);
        Ok(Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            thread_handle: Some(thread_handle),
        })
    }

    /// WebSocket URL to use as `backend_url`.
    pub fn url(&self) -> String {
        format!("ws://{}/ws/agent", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Every message received so far, in arrival order.
    pub fn messages(&self) -> Vec<Value> {
        match self.state.messages.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Messages whose `type` equals `msg_type`.
    pub fn messages_of_type(&self, msg_type: &str) -> Vec<Value> {
        self.messages()
            .into_iter()
            .filter(|m| m["type"] == msg_type)
            .collect()
    }

    /// Payloads of every `exception` message.
    pub fn exceptions(&self) -> Vec<Value> {
        self.messages_of_type("exception")
            .into_iter()
            .map(|mut m| m["payload"].take())
            .collect()
    }

    /// Number of WebSocket connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Poll until at least `count` exceptions arrived or `timeout` passed.
    pub fn wait_for_exceptions(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.exceptions().len() >= count)
    }

    /// Poll until at least `count` messages of `msg_type` arrived.
    pub fn wait_for_messages(&self, msg_type: &str, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.messages_of_type(msg_type).len() >= count)
    }

    fn wait_until(&self, timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    /// Stop accepting and close every connection.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MockCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_collector_thread(
    std_listener: std::net::TcpListener,
    shutdown_rx: oneshot::Receiver<()>,
    state: Arc<CollectorState>,
) {
    let rt = match Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return;
        }
    };

    rt.block_on(async move {
        let listener = match TcpListener::from_std(std_listener) {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to adopt listener: {}", e);
                return;
            }
        };
        tokio::select! {
            _ = accept_loop(listener, state) => {}
            _ = shutdown_rx => debug!("Mock collector shutting down"),
        }
    });
    // Connection tasks are dropped with the runtime.
    rt.shutdown_background();
}

async fn accept_loop(listener: TcpListener, state: Arc<CollectorState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("Mock collector accepted {}", peer);
                tokio::spawn(serve_connection(stream, Arc::clone(&state)));
            }
            Err(e) => {
                warn!("Mock collector accept failed: {}", e);
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<CollectorState>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake failed: {}", e);
            return;
        }
    };
    state.connections.fetch_add(1, Ordering::SeqCst);
    let (mut write, mut read) = ws.split();

    while let Some(frame) = read.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let Ok(message) = serde_json::from_str::<Value>(text.as_str()) else {
            warn!("Mock collector received non-JSON text");
            continue;
        };
        let is_register = message["type"] == "register";
        let api_key = message["payload"]["api_key"].as_str().map(str::to_string);
        state.record(message);

        if !is_register {
            continue;
        }
        let reply = match (&state.expected_api_key, api_key) {
            (Some(expected), Some(got)) if *expected != got => {
                json!({"type": "error", "payload": {"code": "invalid_api_key", "message": "Unknown API key"}})
            }
            _ => json!({"type": "registered", "payload": {}}),
        };
        if write.send(Message::Text(reply.to_string().into())).await.is_err() {
            break;
        }
    }
}
