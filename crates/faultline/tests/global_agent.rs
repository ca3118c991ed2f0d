//! Process-wide agent: init/shutdown lifecycle and panic capture.
//!
//! Every test here touches the global agent or the panic hook, so they run
//! one at a time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use faultline::{AgentState, Config, ConfigError, Error, Executor};
use faultline_testing::MockCollector;

/// The collector records on its own thread, after the agent's send returns.
const WAIT: Duration = Duration::from_secs(5);

fn serial() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn config_for(collector: &MockCollector) -> Config {
    Config::new("test-key")
        .backend_url(collector.url())
        .executor(Executor::Dedicated)
}

/// Replace the current hook with a counting one and return the counter.
fn install_counting_hook() -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    std::panic::set_hook(Box::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    calls
}

#[test]
fn test_panic_reported_once_and_previous_hook_runs() {
    let _serial = serial();
    let collector = MockCollector::start().unwrap();
    let previous_calls = install_counting_hook();

    faultline::init(config_for(&collector)).unwrap();
    faultline::set_context_value("job", "nightly-export");

    let worker = std::thread::spawn(|| {
        let rows: Vec<u32> = Vec::new();
        rows[3]
    });
    assert!(worker.join().is_err());

    let report = faultline::shutdown_with_deadline(Duration::from_secs(5));
    assert_eq!(report.delivered, 1);

    assert!(collector.wait_for_exceptions(1, WAIT));
    let events = collector.exceptions();
    assert_eq!(events.len(), 1);
    let fault = &events[0];
    assert_eq!(fault["kind"], "fault");
    assert_eq!(fault["exception_type"], "panic");
    assert!(fault["message"]
        .as_str()
        .unwrap()
        .starts_with("index out of bounds"));
    assert!(fault["location"]
        .as_str()
        .unwrap()
        .contains("global_agent.rs"));
    assert!(!fault["stack_frames"].as_array().unwrap().is_empty());
    assert_eq!(fault["context"]["job"], "nightly-export");

    assert_eq!(previous_calls.load(Ordering::SeqCst), 1);
    drop(std::panic::take_hook());
}

#[test]
fn test_double_init_installs_one_hook_and_one_worker() {
    let _serial = serial();
    let collector = MockCollector::start().unwrap();
    let hooks_before = faultline::active_hooks();
    let _previous = install_counting_hook();

    faultline::init(config_for(&collector)).unwrap();
    faultline::init(config_for(&collector)).unwrap();
    assert_eq!(faultline::active_hooks(), hooks_before + 1);

    let _ = std::panic::catch_unwind(|| panic!("reported once"));
    faultline::shutdown_with_deadline(Duration::from_secs(5));

    assert!(collector.wait_for_exceptions(1, WAIT));
    let events = collector.exceptions();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["message"], "reported once");
    assert_eq!(collector.connection_count(), 1);
    assert_eq!(faultline::active_hooks(), hooks_before);
    drop(std::panic::take_hook());
}

#[test]
fn test_capture_before_init_and_after_shutdown_is_noop() {
    let _serial = serial();
    let collector = MockCollector::start().unwrap();

    assert!(faultline::capture_message("too early").is_none());
    assert_eq!(faultline::status().state, AgentState::Uninitialized);

    faultline::init(config_for(&collector)).unwrap();
    assert!(faultline::is_initialized());
    assert!(faultline::capture_message("just right").is_some());
    faultline::shutdown_with_deadline(Duration::from_secs(5));

    assert!(faultline::capture_message("too late").is_none());
    assert!(collector.wait_for_exceptions(1, WAIT));
    let messages: Vec<_> = collector
        .exceptions()
        .iter()
        .map(|e| e["message"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(messages, vec!["just right"]);
}

#[test]
fn test_missing_api_key_is_a_config_error() {
    let _serial = serial();
    std::env::remove_var("FAULTLINE_API_KEY");

    let err = faultline::init(Config::default()).unwrap_err();
    assert!(matches!(err, Error::Config(ConfigError::MissingApiKey)));
    assert!(!faultline::is_initialized());
}

#[test]
fn test_user_updates_flow_into_events() {
    let _serial = serial();
    let collector = MockCollector::start().unwrap();
    faultline::init(config_for(&collector)).unwrap();

    faultline::set_user(Some("u-7"), Some("ops@example.com"), Some("ops"));
    faultline::set_user(None, None, Some("operator"));
    faultline::capture_message("first");
    faultline::update_user(faultline::UserUpdate::new().clear_email());
    faultline::capture_message("second");
    faultline::clear_user();
    faultline::capture_message("third");
    faultline::shutdown_with_deadline(Duration::from_secs(5));

    assert!(collector.wait_for_exceptions(3, WAIT));
    let events = collector.exceptions();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0]["user"]["id"], "u-7");
    assert_eq!(events[0]["user"]["email"], "ops@example.com");
    assert_eq!(events[0]["user"]["username"], "operator");
    assert!(events[1]["user"].get("email").is_none());
    assert_eq!(events[1]["user"]["id"], "u-7");
    assert!(events[2].get("user").is_none());
}
