//! Configuration for the faultline agent.

use std::collections::HashSet;
use std::env;
use std::time::Duration;

use crate::error::ConfigError;

/// Default collector endpoint.
pub const DEFAULT_BACKEND_URL: &str = "wss://collector.faultline.dev/ws/agent";

/// Default environment label.
pub const DEFAULT_ENVIRONMENT: &str = "production";

pub const DEFAULT_SAMPLING_RATE: f64 = 1.0;
pub const DEFAULT_MAX_CAPTURE_DEPTH: usize = 10;
pub const DEFAULT_MAX_STRING_LENGTH: usize = 1000;
pub const DEFAULT_MAX_COLLECTION_SIZE: usize = 100;

/// Delivery queue capacity (events).
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// How long `shutdown` waits for the queue to drain.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Initial delay before the first reconnection attempt.
pub const DEFAULT_INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for the reconnection delay.
pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_JITTER_RATIO: f64 = 0.1;

/// Where the transport worker runs.
#[derive(Debug, Clone, Default)]
pub enum Executor {
    /// Reuse the current multi-threaded tokio runtime if `init` is called from
    /// inside one, otherwise start a dedicated runtime.
    #[default]
    Auto,
    /// Always start a dedicated runtime on its own thread.
    Dedicated,
    /// Spawn onto the given runtime.
    Handle(tokio::runtime::Handle),
}

/// Reconnection backoff settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the computed delay (before jitter).
    pub max_delay: Duration,
    /// Growth factor applied per consecutive failure.
    pub multiplier: f64,
    /// Random extra delay as a fraction of the computed delay (0.0-1.0).
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_RECONNECT_DELAY,
            max_delay: DEFAULT_MAX_RECONNECT_DELAY,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: DEFAULT_JITTER_RATIO,
        }
    }
}

/// Configuration for the faultline agent.
///
/// Every option can also come from a `FAULTLINE_*` environment variable; see
/// [`Config::with_env_overrides`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Collector API key (required).
    pub api_key: Option<String>,

    /// Collector WebSocket URL.
    pub backend_url: String,

    /// Environment label attached to every event.
    pub environment: String,

    /// Fraction of captures forwarded (0.0 - 1.0).
    pub sampling_rate: f64,

    /// Bound for nested context depth, cause chains and stack frames.
    pub max_capture_depth: usize,

    /// Bound for any string field, in characters.
    pub max_string_length: usize,

    /// Bound for map and list entries.
    pub max_collection_size: usize,

    /// Verbose internal diagnostics.
    pub debug: bool,

    /// Delivery queue capacity.
    pub queue_capacity: usize,

    /// Default deadline for `shutdown`.
    pub shutdown_timeout: Duration,

    /// Interval between heartbeat messages while connected.
    pub heartbeat_interval: Duration,

    /// Timeout for a single connection attempt.
    pub connect_timeout: Duration,

    /// Reconnection backoff.
    pub backoff: BackoffConfig,

    /// Runtime the transport worker is spawned on.
    pub executor: Executor,

    /// Identity of this agent instance.
    pub agent_id: String,

    /// Host name reported at registration and on every event.
    pub hostname: String,

    /// Fields set through a builder method; the environment never touches them.
    explicit: HashSet<&'static str>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            environment: DEFAULT_ENVIRONMENT.to_string(),
            sampling_rate: DEFAULT_SAMPLING_RATE,
            max_capture_depth: DEFAULT_MAX_CAPTURE_DEPTH,
            max_string_length: DEFAULT_MAX_STRING_LENGTH,
            max_collection_size: DEFAULT_MAX_COLLECTION_SIZE,
            debug: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            backoff: BackoffConfig::default(),
            executor: Executor::default(),
            agent_id: generate_agent_id(),
            hostname: local_hostname(),
            explicit: HashSet::new(),
        }
    }
}

impl Config {
    /// Create a config with the given API key and defaults for everything else.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }

    /// Collector WebSocket URL (`ws://` or `wss://`).
    pub fn backend_url(mut self, url: impl Into<String>) -> Self {
        self.backend_url = url.into();
        self.explicit.insert("backend_url");
        self
    }

    /// Environment label, e.g. `staging`.
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self.explicit.insert("environment");
        self
    }

    /// Fraction of captures to forward. Clamped into `[0.0, 1.0]` by validation.
    pub fn sampling_rate(mut self, rate: f64) -> Self {
        self.sampling_rate = rate;
        self.explicit.insert("sampling_rate");
        self
    }

    /// Bound for context nesting, cause chains and stack frames.
    pub fn max_capture_depth(mut self, depth: usize) -> Self {
        self.max_capture_depth = depth;
        self.explicit.insert("max_capture_depth");
        self
    }

    /// Bound for any string field, in characters.
    pub fn max_string_length(mut self, length: usize) -> Self {
        self.max_string_length = length;
        self.explicit.insert("max_string_length");
        self
    }

    /// Bound for map and list entries.
    pub fn max_collection_size(mut self, size: usize) -> Self {
        self.max_collection_size = size;
        self.explicit.insert("max_collection_size");
        self
    }

    /// Log per-event diagnostics at `debug` level.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self.explicit.insert("debug");
        self
    }

    /// Events held for delivery before new ones are dropped.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self.explicit.insert("queue_capacity");
        self
    }

    /// Deadline used by `shutdown`.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self.explicit.insert("shutdown_timeout");
        self
    }

    /// Interval between heartbeats while connected.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Timeout for a single connection attempt.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Reconnection backoff.
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Where the transport worker runs.
    pub fn executor(mut self, executor: Executor) -> Self {
        self.executor = executor;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// Environment variables only fill in fields that were not set
    /// explicitly: a builder method call always wins, even when it sets the
    /// default value, and so does a field assigned a non-default value.
    pub fn with_env_overrides(mut self) -> Self {
        if self.api_key.as_deref().map_or(true, str::is_empty) {
            if let Some(key) = non_empty_env("FAULTLINE_API_KEY") {
                self.api_key = Some(key);
            }
        }

        if self.from_env("backend_url", self.backend_url == DEFAULT_BACKEND_URL) {
            if let Some(url) = non_empty_env("FAULTLINE_BACKEND_URL") {
                self.backend_url = url;
            }
        }

        if self.from_env("environment", self.environment == DEFAULT_ENVIRONMENT) {
            if let Some(environment) = non_empty_env("FAULTLINE_ENVIRONMENT") {
                self.environment = environment;
            }
        }

        if self.from_env("sampling_rate", self.sampling_rate == DEFAULT_SAMPLING_RATE) {
            if let Some(rate) = parse_env::<f64>("FAULTLINE_SAMPLING_RATE") {
                self.sampling_rate = rate;
            }
        }

        if self.from_env("max_capture_depth", self.max_capture_depth == DEFAULT_MAX_CAPTURE_DEPTH) {
            if let Some(depth) = parse_env("FAULTLINE_MAX_DEPTH") {
                self.max_capture_depth = depth;
            }
        }

        if self.from_env("max_string_length", self.max_string_length == DEFAULT_MAX_STRING_LENGTH) {
            if let Some(length) = parse_env("FAULTLINE_MAX_STRING_LENGTH") {
                self.max_string_length = length;
            }
        }

        if self.from_env(
            "max_collection_size",
            self.max_collection_size == DEFAULT_MAX_COLLECTION_SIZE,
        ) {
            if let Some(size) = parse_env("FAULTLINE_MAX_COLLECTION_SIZE") {
                self.max_collection_size = size;
            }
        }

        if self.from_env("debug", !self.debug) {
            if let Some(value) = non_empty_env("FAULTLINE_DEBUG") {
                self.debug = parse_bool(&value);
            }
        }

        if self.from_env("queue_capacity", self.queue_capacity == DEFAULT_QUEUE_CAPACITY) {
            if let Some(capacity) = parse_env("FAULTLINE_QUEUE_CAPACITY") {
                self.queue_capacity = capacity;
            }
        }

        // Seconds, e.g. "2.5"
        if self.from_env(
            "shutdown_timeout",
            self.shutdown_timeout == DEFAULT_SHUTDOWN_TIMEOUT,
        ) {
            if let Some(secs) = parse_env::<f64>("FAULTLINE_SHUTDOWN_TIMEOUT") {
                if secs.is_finite() && secs >= 0.0 {
                    self.shutdown_timeout = Duration::from_secs_f64(secs);
                }
            }
        }

        self
    }

    fn from_env(&self, field: &'static str, at_default: bool) -> bool {
        at_default && !self.explicit.contains(field)
    }

    /// Validate and normalize the configuration.
    ///
    /// The sampling rate is clamped into `[0.0, 1.0]`; a missing API key, an
    /// unparseable backend URL or a zero limit is rejected.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        match self.api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => {}
            _ => return Err(ConfigError::MissingApiKey),
        }

        let url = url::Url::parse(&self.backend_url).map_err(|e| {
            ConfigError::InvalidBackendUrl {
                url: self.backend_url.clone(),
                message: e.to_string(),
            }
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidBackendUrl {
                url: self.backend_url.clone(),
                message: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        if self.sampling_rate.is_nan() {
            return Err(ConfigError::InvalidSamplingRate(self.sampling_rate));
        }
        self.sampling_rate = self.sampling_rate.clamp(0.0, 1.0);

        for (field, value) in [
            ("max_capture_depth", self.max_capture_depth),
            ("max_string_length", self.max_string_length),
            ("max_collection_size", self.max_collection_size),
            ("queue_capacity", self.queue_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroLimit { field });
            }
        }

        Ok(self)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    non_empty_env(key).and_then(|v| v.trim().parse().ok())
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Generate an agent id of the form `agent-<hex seconds>-<uuid prefix>`.
fn generate_agent_id() -> String {
    let ts = chrono::Utc::now().timestamp().to_be_bytes();
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("agent-{}-{}", hex::encode(&ts[4..]), &uuid[..8])
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
