//! Basic usage example for the faultline agent.
//!
//! Captures a reported error and a panic, then shuts down and prints what was
//! delivered.
//!
//! To run against a collector:
//!   FAULTLINE_API_KEY=... FAULTLINE_BACKEND_URL=ws://127.0.0.1:8080/ws/agent \
//!     cargo run --example basic_usage

use std::time::Duration;

use faultline::{context, Config};

#[derive(Debug, thiserror::Error)]
#[error("failed to load settings from {path}")]
struct SettingsError {
    path: String,
    #[source]
    source: std::io::Error,
}

fn load_settings(path: &str) -> Result<String, SettingsError> {
    std::fs::read_to_string(path).map_err(|source| SettingsError {
        path: path.to_string(),
        source,
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing for debug output
    tracing_subscriber::fmt()
        .with_env_filter("faultline=debug")
        .init();

    let api_key = std::env::var("FAULTLINE_API_KEY").unwrap_or_else(|_| "demo-key".to_string());
    faultline::init(Config::new(api_key).environment("example").debug(true))?;

    faultline::set_global_context(context! {
        "service" => "basic-example",
        "version" => env!("CARGO_PKG_VERSION"),
    });
    faultline::set_user(Some("user-1"), None, Some("demo"));

    if let Err(e) = load_settings("/nonexistent/settings.toml") {
        let id = faultline::capture_error_with_context(&e, context! { "attempt" => 1 });
        println!("Captured settings error: {:?}", id);
    }

    // The hook reports the panic, then the default hook prints it as usual.
    let worker = std::thread::spawn(|| {
        let queue: Vec<u32> = Vec::new();
        queue[0]
    });
    let _ = worker.join();

    let status = faultline::status();
    println!(
        "State: {}, queued: {}, dropped: {}",
        status.state, status.stats.pending, status.stats.dropped
    );

    let report = faultline::shutdown_with_deadline(Duration::from_secs(3));
    println!(
        "Shutdown: delivered {}, discarded {}, timed out: {}",
        report.delivered, report.discarded, report.timed_out
    );
    Ok(())
}
