//! Event construction with bounded fields.
//!
//! Error messages, panic payloads and context are controlled by whatever
//! failed, so nothing here trusts their size. Every string is cut to
//! `max_string_length` characters, every map and list to
//! `max_collection_size` entries, and nesting to `max_capture_depth` levels.
//! Raw sources are read through [`bounded_display`] so an enormous `Display`
//! impl is never fully materialized.

use std::error::Error as StdError;
use std::fmt::{self, Display, Write as _};
use std::panic::PanicHookInfo;

use chrono::{SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::Config;
use crate::context::{
    ContextMap, ContextSnapshot, ContextValue, UserIdentity, UNSERIALIZABLE_PLACEHOLDER,
};
use crate::event::{Event, EventKind, RuntimeInfo, StackFrame};

/// Appended to any string cut at `max_string_length`.
pub const TRUNCATION_MARKER: &str = "...[truncated]";

/// Replaces values nested deeper than `max_capture_depth`.
pub const MAX_DEPTH_MARKER: &str = "[max depth exceeded]";

/// Key added to a truncated map, holding the number of omitted entries.
pub const TRUNCATED_ENTRIES_KEY: &str = "_truncated";

/// Hard cap on frames walked before filtering.
const MAX_WALKED_FRAMES: usize = 128;

/// Hard cap on `source()` links followed.
const MAX_CAUSE_WALK: usize = 64;

/// In-app frames that feed the fingerprint.
const FINGERPRINT_FRAMES: usize = 5;

/// Size bounds applied to every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_depth: usize,
    pub max_string_length: usize,
    pub max_collection_size: usize,
}

impl Limits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_depth: config.max_capture_depth,
            max_string_length: config.max_string_length,
            max_collection_size: config.max_collection_size,
        }
    }
}

/// Raw material for an event, before bounding.
#[derive(Debug, Clone)]
pub struct EventSource {
    pub kind: EventKind,
    pub exception_type: String,
    pub message: String,
    pub cause_chain: Vec<String>,
    /// Pre-captured stack; resolved from the current thread when `None`.
    pub stack: Option<Vec<StackFrame>>,
    pub location: Option<String>,
}

/// Builds bounded [`Event`]s from errors, panics and messages.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    limits: Limits,
    environment: String,
    agent_id: String,
    hostname: String,
}

impl EventBuilder {
    pub fn new(config: &Config) -> Self {
        Self {
            limits: Limits::from_config(config),
            environment: config.environment.clone(),
            agent_id: config.agent_id.clone(),
            hostname: config.hostname.clone(),
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Read an error and its `source()` chain.
    pub fn error_source<E: StdError + ?Sized>(&self, error: &E) -> EventSource {
        let read_limit = self.limits.max_string_length + 1;
        // One past the depth limit so the builder can tell the chain was cut.
        let walk_limit = MAX_CAUSE_WALK.min(self.limits.max_depth + 1);
        let mut cause_chain = Vec::new();
        let mut next = error.source();
        while let Some(cause) = next {
            if cause_chain.len() == walk_limit {
                break;
            }
            cause_chain.push(bounded_display(cause, read_limit));
            next = cause.source();
        }

        EventSource {
            kind: EventKind::ReportedError,
            exception_type: short_type_name::<E>().to_string(),
            message: bounded_display(error, read_limit),
            cause_chain,
            stack: None,
            location: None,
        }
    }

    /// Read a plain message reported without an error value.
    pub fn message_source(&self, message: &str) -> EventSource {
        EventSource {
            kind: EventKind::ReportedError,
            exception_type: "message".to_string(),
            message: bounded_str(message, self.limits.max_string_length + 1).to_string(),
            cause_chain: Vec::new(),
            stack: None,
            location: None,
        }
    }

    /// Read a panic payload and location.
    pub fn fault_source(&self, info: &PanicHookInfo<'_>) -> EventSource {
        let read_limit = self.limits.max_string_length + 1;
        let payload = info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            bounded_str(s, read_limit).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            bounded_str(s, read_limit).to_string()
        } else {
            "panic with non-string payload".to_string()
        };

        let location = info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()));

        let stack = resolve_stack(self.limits.max_depth);
        let stack = if stack.is_empty() {
            // Keep at least the panic site when no symbols could be resolved.
            info.location().map(|loc| {
                vec![StackFrame {
                    function: "<panic>".to_string(),
                    module: None,
                    file: Some(loc.file().to_string()),
                    line: Some(loc.line()),
                    column: Some(loc.column()),
                    in_app: true,
                }]
            })
        } else {
            Some(stack)
        };

        EventSource {
            kind: EventKind::Fault,
            exception_type: "panic".to_string(),
            message,
            cause_chain: Vec::new(),
            stack,
            location,
        }
    }

    /// Bound the source, merge context and produce the event.
    ///
    /// Per-call keys override global keys of the same name.
    pub fn build(
        &self,
        source: EventSource,
        call_context: Option<&ContextMap>,
        snapshot: &ContextSnapshot,
    ) -> Event {
        let limits = self.limits;
        let mut truncated = false;
        let mut text = |s: &str| bound_text(s, limits.max_string_length, &mut truncated);

        let message = text(&source.message);
        let exception_type = text(&source.exception_type);
        let location = source.location.as_deref().map(&mut text);
        let environment = text(&self.environment);

        if source.cause_chain.len() > limits.max_depth {
            truncated = true;
        }
        let cause_chain: Vec<String> = source
            .cause_chain
            .iter()
            .take(limits.max_depth)
            .map(|c| bound_text(c, limits.max_string_length, &mut truncated))
            .collect();

        let frames = match source.stack {
            Some(frames) => frames,
            None => resolve_stack(limits.max_depth),
        };
        if frames.len() > limits.max_depth {
            truncated = true;
        }
        let stack_frames: Vec<StackFrame> = frames
            .into_iter()
            .take(limits.max_depth)
            .map(|frame| bound_frame(frame, limits.max_string_length, &mut truncated))
            .collect();

        let merged = match call_context {
            Some(call) => snapshot.global.merged_with(call),
            None => (*snapshot.global).clone(),
        };
        let context = bound_map(&merged, 1, &limits, &mut truncated);

        let user = snapshot.user.as_ref().map(|u| UserIdentity {
            id: u
                .id
                .as_deref()
                .map(|s| bound_text(s, limits.max_string_length, &mut truncated)),
            email: u
                .email
                .as_deref()
                .map(|s| bound_text(s, limits.max_string_length, &mut truncated)),
            username: u
                .username
                .as_deref()
                .map(|s| bound_text(s, limits.max_string_length, &mut truncated)),
        });

        let fingerprint = fingerprint(&exception_type, &stack_frames);

        Event {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            kind: source.kind,
            exception_type,
            message,
            cause_chain,
            stack_frames,
            location,
            fingerprint,
            context,
            user,
            environment,
            agent_id: self.agent_id.clone(),
            hostname: self.hostname.clone(),
            runtime: RuntimeInfo::current(),
            truncated,
        }
    }
}

/// Cut `s` to `max_chars` characters plus [`TRUNCATION_MARKER`].
///
/// Returns the input unchanged when it already fits.
pub fn truncate_string(s: &str, max_chars: usize) -> (String, bool) {
    match s.char_indices().nth(max_chars) {
        None => (s.to_string(), false),
        Some((cut, _)) => {
            let mut out = String::with_capacity(cut + TRUNCATION_MARKER.len());
            out.push_str(&s[..cut]);
            out.push_str(TRUNCATION_MARKER);
            (out, true)
        }
    }
}

fn bound_text(s: &str, max_chars: usize, truncated: &mut bool) -> String {
    let (out, cut) = truncate_string(s, max_chars);
    *truncated |= cut;
    out
}

/// Longest prefix of `s` with at most `max_chars` characters.
fn bounded_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((cut, _)) => &s[..cut],
        None => s,
    }
}

/// Render `value` with `Display`, keeping at most `max_chars` characters.
pub fn bounded_display(value: &(impl Display + ?Sized), max_chars: usize) -> String {
    let mut writer = BoundedWriter {
        buf: String::new(),
        chars: 0,
        max_chars,
    };
    // An Err here only means the writer filled up.
    let _ = write!(writer, "{value}");
    writer.buf
}

struct BoundedWriter {
    buf: String,
    chars: usize,
    max_chars: usize,
}

impl fmt::Write for BoundedWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars() {
            if self.chars == self.max_chars {
                return Err(fmt::Error);
            }
            self.buf.push(c);
            self.chars += 1;
        }
        Ok(())
    }
}

/// Bound a context map whose entries sit at `depth`.
pub fn bound_map(
    map: &ContextMap,
    depth: usize,
    limits: &Limits,
    truncated: &mut bool,
) -> ContextMap {
    let kept = map.len().min(limits.max_collection_size);
    let omitted = map.len() - kept;
    let mut out = ContextMap::with_capacity(kept + 1);
    for (key, value) in map.iter().take(kept) {
        let key = bound_text(key, limits.max_string_length, truncated);
        let key = unique_key(&out, key, omitted > 0);
        out.insert(key, bound_value(value, depth, limits, truncated));
    }
    if omitted > 0 {
        *truncated = true;
        out.insert(TRUNCATED_ENTRIES_KEY, omitted);
    }
    out
}

/// `key`, or `key#2`, `key#3`, ... when already present in `map`.
///
/// Two keys can collide once cut to the same prefix. [`TRUNCATED_ENTRIES_KEY`]
/// counts as taken when the map overflows.
fn unique_key(map: &ContextMap, key: String, reserve_entries_key: bool) -> String {
    let taken =
        |k: &str| map.contains_key(k) || (reserve_entries_key && k == TRUNCATED_ENTRIES_KEY);
    if !taken(&key) {
        return key;
    }
    let mut n = 2usize;
    loop {
        let candidate = format!("{key}#{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Bound a single value sitting at `depth` (top-level context values are at 1).
pub fn bound_value(
    value: &ContextValue,
    depth: usize,
    limits: &Limits,
    truncated: &mut bool,
) -> ContextValue {
    if depth > limits.max_depth {
        *truncated = true;
        return ContextValue::String(MAX_DEPTH_MARKER.to_string());
    }

    match value {
        ContextValue::Null => ContextValue::Null,
        ContextValue::Bool(b) => ContextValue::Bool(*b),
        ContextValue::Number(n) if n.is_finite() => ContextValue::Number(*n),
        ContextValue::Number(_) => ContextValue::String(UNSERIALIZABLE_PLACEHOLDER.to_string()),
        ContextValue::String(s) => {
            ContextValue::String(bound_text(s, limits.max_string_length, truncated))
        }
        ContextValue::Map(map) => ContextValue::Map(bound_map(map, depth + 1, limits, truncated)),
        ContextValue::List(items) => {
            let kept = items.len().min(limits.max_collection_size);
            let mut out: Vec<ContextValue> = items
                .iter()
                .take(kept)
                .map(|item| bound_value(item, depth + 1, limits, truncated))
                .collect();
            if items.len() > kept {
                *truncated = true;
                out.push(ContextValue::String(format!(
                    "[{} more items truncated]",
                    items.len() - kept
                )));
            }
            ContextValue::List(out)
        }
    }
}

fn bound_frame(frame: StackFrame, max_chars: usize, truncated: &mut bool) -> StackFrame {
    StackFrame {
        function: bound_text(&frame.function, max_chars, truncated),
        module: frame.module.map(|m| bound_text(&m, max_chars, truncated)),
        file: frame.file.map(|f| bound_text(&f, max_chars, truncated)),
        line: frame.line,
        column: frame.column,
        in_app: frame.in_app,
    }
}

/// Walk the current thread's stack, innermost first.
///
/// Frames from the toolchain, the unwinder and this agent are skipped; at
/// most `max_frames` frames are kept.
pub fn resolve_stack(max_frames: usize) -> Vec<StackFrame> {
    let mut frames = Vec::with_capacity(max_frames.min(MAX_WALKED_FRAMES));
    let mut walked = 0;

    backtrace::trace(|raw| {
        walked += 1;
        backtrace::resolve_frame(raw, |symbol| {
            if frames.len() >= max_frames {
                return;
            }
            let Some(name) = symbol.name() else {
                return;
            };
            let full_name = format!("{name:#}");
            if is_internal_frame(&full_name) {
                return;
            }

            let (module, function) = match full_name.rsplit_once("::") {
                Some((module, function)) => (Some(module.to_string()), function.to_string()),
                None => (None, full_name.clone()),
            };
            let file = symbol
                .filename()
                .map(|p| p.to_string_lossy().to_string());
            let in_app = file.as_deref().is_some_and(is_app_path);

            frames.push(StackFrame {
                function,
                module,
                file,
                line: symbol.lineno(),
                column: symbol.colno(),
                in_app,
            });
        });
        frames.len() < max_frames && walked < MAX_WALKED_FRAMES
    });

    frames
}

fn is_internal_frame(name: &str) -> bool {
    const PREFIXES: &[&str] = &[
        "std::",
        "core::",
        "alloc::",
        "backtrace::",
        "test::",
        "<std::",
        "<core::",
        "<alloc::",
        "<backtrace::",
        "rust_begin_unwind",
        "rust_panic",
        "__rust",
        "__libc_start",
        "_start",
    ];
    if PREFIXES.iter().any(|p| name.starts_with(p)) {
        return true;
    }
    // Our own capture machinery, but not test code compiled into this crate.
    (name.starts_with("faultline::") || name.starts_with("<faultline::"))
        && !name.contains("::tests::")
}

fn is_app_path(path: &str) -> bool {
    !(path.starts_with("/rustc/")
        || path.contains("/.cargo/registry/")
        || path.contains("/.rustup/")
        || path.contains("\\.cargo\\registry\\"))
}

fn short_type_name<E: ?Sized>() -> &'static str {
    let full = std::any::type_name::<E>();
    // Drop generic arguments before taking the last path segment.
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Stable grouping key: error type plus the first in-app frames.
fn fingerprint(exception_type: &str, frames: &[StackFrame]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(exception_type.as_bytes());
    for frame in frames.iter().filter(|f| f.in_app).take(FINGERPRINT_FRAMES) {
        hasher.update(b":");
        hasher.update(frame.function.as_bytes());
        hasher.update(b":");
        hasher.update(frame.line.unwrap_or(0).to_string().as_bytes());
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn builder_with(limits: Limits) -> EventBuilder {
        let config = Config::new("key")
            .max_capture_depth(limits.max_depth)
            .max_string_length(limits.max_string_length)
            .max_collection_size(limits.max_collection_size)
            .environment("test");
        EventBuilder::new(&config)
    }

    fn limits(depth: usize, string: usize, collection: usize) -> Limits {
        Limits {
            max_depth: depth,
            max_string_length: string,
            max_collection_size: collection,
        }
    }

    #[derive(Debug)]
    struct Outer(Inner);

    #[derive(Debug)]
    struct Inner;

    impl Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "request failed")
        }
    }

    impl Display for Inner {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "connection reset")
        }
    }

    impl StdError for Outer {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    impl StdError for Inner {}

    #[test]
    fn test_truncate_exact_length() {
        let (out, cut) = truncate_string(&"x".repeat(50), 10);
        assert!(cut);
        assert_eq!(out, format!("{}{}", "x".repeat(10), TRUNCATION_MARKER));

        let (out, cut) = truncate_string("short", 10);
        assert!(!cut);
        assert_eq!(out, "short");

        let (out, cut) = truncate_string("exactly10!", 10);
        assert!(!cut);
        assert_eq!(out, "exactly10!");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let (out, cut) = truncate_string("héllo wörld", 4);
        assert!(cut);
        assert!(out.starts_with("héll"));
        assert_eq!(out.chars().count(), 4 + TRUNCATION_MARKER.chars().count());
    }

    #[test]
    fn test_bounded_display_stops_early() {
        assert_eq!(bounded_display(&"abcdef", 3), "abc");
        assert_eq!(bounded_display(&42, 10), "42");
    }

    #[test]
    fn test_message_truncated_in_event() {
        let builder = builder_with(limits(10, 20, 100));
        let source = builder.message_source(&"m".repeat(500));
        let event = builder.build(source, None, &ContextSnapshot::default());

        assert!(event.truncated);
        assert_eq!(
            event.message.chars().count(),
            20 + TRUNCATION_MARKER.chars().count()
        );
        assert!(event.message.starts_with(&"m".repeat(20)));
        assert!(event.message.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_error_source_reads_cause_chain() {
        let builder = builder_with(limits(10, 100, 100));
        let source = builder.error_source(&Outer(Inner));

        assert_eq!(source.kind, EventKind::ReportedError);
        assert_eq!(source.exception_type, "Outer");
        assert_eq!(source.message, "request failed");
        assert_eq!(source.cause_chain, vec!["connection reset".to_string()]);
    }

    #[test]
    fn test_cause_chain_depth_bounded() {
        let builder = builder_with(limits(2, 100, 100));
        let source = EventSource {
            kind: EventKind::ReportedError,
            exception_type: "E".to_string(),
            message: "top".to_string(),
            cause_chain: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            stack: Some(Vec::new()),
            location: None,
        };
        let event = builder.build(source, None, &ContextSnapshot::default());
        assert_eq!(event.cause_chain, vec!["a".to_string(), "b".to_string()]);
        assert!(event.truncated);
    }

    #[test]
    fn test_context_merge_precedence() {
        let builder = builder_with(limits(10, 1000, 100));
        let snapshot = ContextSnapshot {
            global: Arc::new(context! { "service" => "api" }),
            user: None,
        };
        let call = context! { "user_id" => "u1", "service" => "override" };

        let event = builder.build(builder.message_source("boom"), Some(&call), &snapshot);

        assert_eq!(event.context.len(), 2);
        assert_eq!(
            event.context.get("service").and_then(|v| v.as_str()),
            Some("override")
        );
        assert_eq!(event.context.get("user_id").and_then(|v| v.as_str()), Some("u1"));
    }

    #[test]
    fn test_collection_truncation_keeps_insertion_order() {
        let l = limits(10, 100, 3);
        let map: ContextMap = (0..5).map(|i| (format!("k{i}"), i)).collect();
        let mut truncated = false;

        let out = bound_map(&map, 1, &l, &mut truncated);
        assert!(truncated);
        assert_eq!(
            out.keys().collect::<Vec<_>>(),
            vec!["k0", "k1", "k2", TRUNCATED_ENTRIES_KEY]
        );
        assert_eq!(out.get(TRUNCATED_ENTRIES_KEY), Some(&ContextValue::Number(2.0)));

        let list = ContextValue::from(vec![1, 2, 3, 4, 5, 6]);
        let out = bound_value(&list, 1, &l, &mut truncated);
        let items = out.as_list().unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(items[3].as_str(), Some("[3 more items truncated]"));
    }

    #[test]
    fn test_colliding_truncated_keys_are_kept() {
        let l = limits(5, 3, 100);
        let map = context! { "abcd1" => 1, "abcd2" => 2 };
        let mut truncated = false;
        let out = bound_map(&map, 1, &l, &mut truncated);

        assert!(truncated);
        let first = format!("abc{TRUNCATION_MARKER}");
        let second = format!("{first}#2");
        assert_eq!(out.keys().collect::<Vec<_>>(), vec![first.as_str(), second.as_str()]);
        assert_eq!(out.get(&first), Some(&ContextValue::Number(1.0)));
        assert_eq!(out.get(&second), Some(&ContextValue::Number(2.0)));
    }

    #[test]
    fn test_user_key_named_like_entries_count_survives_overflow() {
        let l = limits(5, 100, 1);
        let map = context! { TRUNCATED_ENTRIES_KEY => "mine", "b" => 2 };
        let mut truncated = false;
        let out = bound_map(&map, 1, &l, &mut truncated);

        assert_eq!(out.get("_truncated#2").and_then(|v| v.as_str()), Some("mine"));
        assert_eq!(out.get(TRUNCATED_ENTRIES_KEY), Some(&ContextValue::Number(1.0)));

        // Without overflow the key is left alone.
        let out = bound_map(&map, 1, &limits(5, 100, 10), &mut truncated);
        assert_eq!(out.get(TRUNCATED_ENTRIES_KEY).and_then(|v| v.as_str()), Some("mine"));
    }

    #[test]
    fn test_depth_truncation_marker() {
        let l = limits(2, 100, 100);
        let nested = context! {
            "level1" => context! {
                "level2" => context! { "level3" => "too deep" },
                "scalar" => 1,
            },
        };
        let mut truncated = false;
        let out = bound_map(&nested, 1, &l, &mut truncated);

        assert!(truncated);
        let level1 = out.get("level1").and_then(|v| v.as_map()).unwrap();
        assert_eq!(level1.get("scalar"), Some(&ContextValue::Number(1.0)));
        let level2 = level1.get("level2").and_then(|v| v.as_map()).unwrap();
        assert_eq!(
            level2.get("level3").and_then(|v| v.as_str()),
            Some(MAX_DEPTH_MARKER)
        );
    }

    #[test]
    fn test_non_finite_number_replaced() {
        let l = limits(5, 100, 100);
        let mut truncated = false;
        let out = bound_value(&ContextValue::Number(f64::NAN), 1, &l, &mut truncated);
        assert_eq!(out.as_str(), Some(UNSERIALIZABLE_PLACEHOLDER));
    }

    #[test]
    fn test_frames_bounded_innermost_first() {
        let builder = builder_with(limits(2, 100, 100));
        let frames: Vec<StackFrame> = (0..5)
            .map(|i| StackFrame {
                function: format!("f{i}"),
                module: None,
                file: None,
                line: Some(i),
                column: None,
                in_app: true,
            })
            .collect();
        let mut source = builder.message_source("boom");
        source.stack = Some(frames);

        let event = builder.build(source, None, &ContextSnapshot::default());
        let names: Vec<_> = event.stack_frames.iter().map(|f| f.function.as_str()).collect();
        assert_eq!(names, vec!["f0", "f1"]);
    }

    #[test]
    fn test_resolved_stack_skips_internal_frames() {
        let frames = resolve_stack(32);
        assert!(frames.len() <= 32);
        for frame in &frames {
            let full = match &frame.module {
                Some(m) => format!("{m}::{}", frame.function),
                None => frame.function.clone(),
            };
            assert!(!full.starts_with("std::"), "unexpected frame {full}");
            assert!(!full.starts_with("backtrace::"), "unexpected frame {full}");
        }
    }

    #[test]
    fn test_user_and_environment_attached() {
        let builder = builder_with(limits(10, 1000, 100));
        let snapshot = ContextSnapshot {
            global: Arc::default(),
            user: Some(UserIdentity {
                id: Some("u1".into()),
                email: None,
                username: Some("alice".into()),
            }),
        };
        let event = builder.build(builder.message_source("boom"), None, &snapshot);

        assert_eq!(event.environment, "test");
        let user = event.user.unwrap();
        assert_eq!(user.id.as_deref(), Some("u1"));
        assert_eq!(user.username.as_deref(), Some("alice"));
        assert!(!event.truncated);
    }

    #[test]
    fn test_fingerprint_stable_for_same_frames() {
        let frames = vec![StackFrame {
            function: "handler".into(),
            module: Some("app".into()),
            file: Some("src/app.rs".into()),
            line: Some(10),
            column: None,
            in_app: true,
        }];
        assert_eq!(fingerprint("E", &frames), fingerprint("E", &frames));
        assert_ne!(fingerprint("E", &frames), fingerprint("F", &frames));
        assert_eq!(fingerprint("E", &frames).len(), 16);
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<std::io::Error>(), "Error");
        assert_eq!(short_type_name::<Outer>(), "Outer");
        assert_eq!(short_type_name::<Vec<Outer>>(), "Vec");
    }

    proptest! {
        #[test]
        fn prop_truncated_strings_keep_exactly_max_chars(s in "\\PC{0,300}", max in 1usize..120) {
            let (out, cut) = truncate_string(&s, max);
            let len = s.chars().count();
            if len > max {
                prop_assert!(cut);
                prop_assert_eq!(out.chars().count(), max + TRUNCATION_MARKER.chars().count());
                prop_assert!(s.starts_with(&out[..out.len() - TRUNCATION_MARKER.len()]));
            } else {
                prop_assert!(!cut);
                prop_assert_eq!(out, s);
            }
        }

        #[test]
        fn prop_bounded_lists_never_exceed_limit(len in 0usize..300, max in 1usize..50) {
            let l = limits(5, 100, max);
            let value = ContextValue::from((0..len).collect::<Vec<usize>>());
            let mut truncated = false;
            let out = bound_value(&value, 1, &l, &mut truncated);
            let items = out.as_list().unwrap();
            prop_assert!(items.len() <= max + 1);
            prop_assert_eq!(truncated, len > max);
        }
    }
}
