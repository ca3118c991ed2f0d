//! Contextual metadata attached to events.
//!
//! Context comes in two layers: a process-wide *global* map plus user
//! identity held by the [`ContextStore`], and a *per-call* map supplied at a
//! single capture. The two are merged once when an event is built, so later
//! writes to the store never reach events that already exist.

use std::sync::{Arc, RwLock};

use serde::ser::{Serialize, SerializeMap, Serializer};
use tracing::warn;

/// Replacement for values that cannot be represented in an event.
pub const UNSERIALIZABLE_PLACEHOLDER: &str = "[unserializable value]";

/// A dynamically typed context value.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum ContextValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Map(ContextMap),
    List(Vec<ContextValue>),
}

impl ContextValue {
    /// Convert any serializable value.
    ///
    /// Values that fail to serialize become [`UNSERIALIZABLE_PLACEHOLDER`]
    /// instead of failing the capture.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(json) => Self::from(json),
            Err(_) => Self::String(UNSERIALIZABLE_PLACEHOLDER.to_string()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ContextMap> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ContextValue]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for ContextValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => Self::Number(f),
                None => Self::String(n.to_string()),
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for ContextValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<ContextMap> for ContextValue {
    fn from(value: ContextMap) -> Self {
        Self::Map(value)
    }
}

impl<T: Into<ContextValue>> From<Vec<T>> for ContextValue {
    fn from(value: Vec<T>) -> Self {
        Self::List(value.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<ContextValue>> From<Option<T>> for ContextValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

macro_rules! impl_from_number {
    ($($t:ty),*) => {
        $(
            impl From<$t> for ContextValue {
                fn from(value: $t) -> Self {
                    Self::Number(value as f64)
                }
            }
        )*
    };
}

impl_from_number!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

/// Insertion-ordered string-keyed map of context values.
///
/// Inserting an existing key replaces its value in place, keeping the
/// original position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextMap {
    entries: Vec<(String, ContextValue)>,
}

impl ContextMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Insert or replace a value, returning the previous one.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<ContextValue>,
    ) -> Option<ContextValue> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<ContextValue> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ContextValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Overlay `other` on top of `self`: keys in `other` win.
    pub fn merged_with(&self, other: &ContextMap) -> ContextMap {
        let mut merged = self.clone();
        for (key, value) in other.iter() {
            merged.insert(key, value.clone());
        }
        merged
    }
}

impl<K: Into<String>, V: Into<ContextValue>> FromIterator<(K, V)> for ContextMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = ContextMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl IntoIterator for ContextMap {
    type Item = (String, ContextValue);
    type IntoIter = std::vec::IntoIter<(String, ContextValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl From<std::collections::HashMap<String, serde_json::Value>> for ContextMap {
    fn from(map: std::collections::HashMap<String, serde_json::Value>) -> Self {
        map.into_iter().collect()
    }
}

impl Serialize for ContextMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Build a [`ContextMap`] from `key => value` pairs.
///
/// ```
/// let ctx = faultline::context! { "service" => "api", "attempt" => 3 };
/// assert_eq!(ctx.len(), 2);
/// ```
#[macro_export]
macro_rules! context {
    () => { $crate::ContextMap::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::ContextMap::new();
        $( map.insert($key, $value); )+
        map
    }};
}

/// Identity of the user affected by an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct UserIdentity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl UserIdentity {
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.email.is_none() && self.username.is_none()
    }
}

/// Change to a single identity field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FieldUpdate {
    /// Leave the stored value as it is.
    #[default]
    Keep,
    Set(String),
    Clear,
}

impl FieldUpdate {
    fn apply(self, slot: &mut Option<String>) {
        match self {
            Self::Keep => {}
            Self::Set(value) => *slot = Some(value),
            Self::Clear => *slot = None,
        }
    }
}

impl From<Option<&str>> for FieldUpdate {
    fn from(value: Option<&str>) -> Self {
        value.map_or(Self::Keep, |v| Self::Set(v.to_string()))
    }
}

/// Field-by-field update of the stored [`UserIdentity`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserUpdate {
    pub id: FieldUpdate,
    pub email: FieldUpdate,
    pub username: FieldUpdate,
}

impl UserUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Some` sets a field, `None` leaves it unchanged.
    pub fn from_options(id: Option<&str>, email: Option<&str>, username: Option<&str>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            username: username.into(),
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = FieldUpdate::Set(id.into());
        self
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = FieldUpdate::Set(email.into());
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = FieldUpdate::Set(username.into());
        self
    }

    pub fn clear_id(mut self) -> Self {
        self.id = FieldUpdate::Clear;
        self
    }

    pub fn clear_email(mut self) -> Self {
        self.email = FieldUpdate::Clear;
        self
    }

    pub fn clear_username(mut self) -> Self {
        self.username = FieldUpdate::Clear;
        self
    }
}

/// Immutable view of the store taken at capture time.
#[derive(Debug, Clone, Default)]
pub struct ContextSnapshot {
    pub global: Arc<ContextMap>,
    pub user: Option<UserIdentity>,
}

/// Process-wide context shared by every capture.
///
/// Readers clone an `Arc` under a short read lock; writers swap in a new map,
/// so a reader sees either the old or the new context, never a mix.
#[derive(Debug, Default)]
pub struct ContextStore {
    global: RwLock<Arc<ContextMap>>,
    user: RwLock<Option<UserIdentity>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the global context.
    pub fn set_global(&self, context: ContextMap) {
        let context = Arc::new(context);
        match self.global.write() {
            Ok(mut guard) => *guard = context,
            Err(poisoned) => {
                warn!("Global context lock poisoned during write, recovering");
                *poisoned.into_inner() = context;
            }
        }
    }

    /// Insert or replace a single global key.
    pub fn set_global_value(&self, key: impl Into<String>, value: impl Into<ContextValue>) {
        let mut guard = match self.global.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Global context lock poisoned during write, recovering");
                poisoned.into_inner()
            }
        };
        Arc::make_mut(&mut *guard).insert(key, value);
    }

    pub fn global(&self) -> Arc<ContextMap> {
        match self.global.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Apply a field-by-field identity update.
    pub fn update_user(&self, update: UserUpdate) {
        let mut guard = match self.user.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("User lock poisoned during write, recovering");
                poisoned.into_inner()
            }
        };
        let mut user = guard.take().unwrap_or_default();
        update.id.apply(&mut user.id);
        update.email.apply(&mut user.email);
        update.username.apply(&mut user.username);
        *guard = (!user.is_empty()).then_some(user);
    }

    pub fn clear_user(&self) {
        match self.user.write() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    pub fn user(&self) -> Option<UserIdentity> {
        match self.user.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            global: self.global(),
            user: self.user(),
        }
    }

    /// Snapshot without waiting on a lock.
    ///
    /// Used on the fault path, where the panicking thread may itself hold a
    /// write lock. Layers that are busy come back empty.
    pub fn try_snapshot(&self) -> ContextSnapshot {
        let global = match self.global.try_read() {
            Ok(guard) => Arc::clone(&guard),
            Err(_) => Arc::default(),
        };
        let user = match self.user.try_read() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        ContextSnapshot { global, user }
    }

    #[cfg(test)]
    pub(crate) fn lock_global(&self) -> std::sync::RwLockWriteGuard<'_, Arc<ContextMap>> {
        self.global.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_replaces_in_place() {
        let mut map = ContextMap::new();
        map.insert("a", 1);
        map.insert("b", 2);
        let prev = map.insert("a", "one");

        assert_eq!(prev, Some(ContextValue::Number(1.0)));
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(map.get("a").and_then(ContextValue::as_str), Some("one"));
    }

    #[test]
    fn test_merge_precedence() {
        let global = context! { "service" => "api" };
        let call = context! { "user_id" => "u1", "service" => "override" };

        let merged = global.merged_with(&call);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.get("service").and_then(|v| v.as_str()), Some("override"));
        assert_eq!(merged.get("user_id").and_then(|v| v.as_str()), Some("u1"));
    }

    #[test]
    fn test_serializes_as_ordered_object() {
        let ctx = context! {
            "z" => 1,
            "a" => vec!["x", "y"],
            "m" => context! { "nested" => true },
            "n" => ContextValue::Null,
        };
        let json = serde_json::to_string(&ctx).unwrap();
        assert_eq!(json, r#"{"z":1.0,"a":["x","y"],"m":{"nested":true},"n":null}"#);
    }

    #[test]
    fn test_from_json_value() {
        let value = ContextValue::from(serde_json::json!({
            "id": 7,
            "tags": ["a", "b"],
            "ok": false,
        }));
        let map = value.as_map().unwrap();
        assert_eq!(map.get("id"), Some(&ContextValue::Number(7.0)));
        assert_eq!(map.get("tags").and_then(|v| v.as_list()).map(<[_]>::len), Some(2));
        assert_eq!(map.get("ok"), Some(&ContextValue::Bool(false)));
    }

    #[test]
    fn test_from_serialize_failure_uses_placeholder() {
        struct Broken;
        impl Serialize for Broken {
            fn serialize<S: Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("nope"))
            }
        }

        let value = ContextValue::from_serialize(&Broken);
        assert_eq!(value.as_str(), Some(UNSERIALIZABLE_PLACEHOLDER));
    }

    #[test]
    fn test_global_snapshot_is_copy_on_read() {
        let store = ContextStore::new();
        store.set_global(context! { "service" => "api" });

        let before = store.snapshot();
        store.set_global(context! { "service" => "worker" });
        store.set_global_value("region", "eu");

        assert_eq!(before.global.get("service").and_then(|v| v.as_str()), Some("api"));
        assert!(!before.global.contains_key("region"));

        let after = store.global();
        assert_eq!(after.get("service").and_then(|v| v.as_str()), Some("worker"));
        assert_eq!(after.get("region").and_then(|v| v.as_str()), Some("eu"));
    }

    #[test]
    fn test_user_omitted_fields_preserved() {
        let store = ContextStore::new();
        store.update_user(UserUpdate::new().id("u1").email("a@example.com"));
        store.update_user(UserUpdate::from_options(None, None, Some("alice")));

        let user = store.user().unwrap();
        assert_eq!(user.id.as_deref(), Some("u1"));
        assert_eq!(user.email.as_deref(), Some("a@example.com"));
        assert_eq!(user.username.as_deref(), Some("alice"));
    }

    #[test]
    fn test_user_explicit_clear() {
        let store = ContextStore::new();
        store.update_user(UserUpdate::new().id("u1").email("a@example.com"));
        store.update_user(UserUpdate::new().clear_email());

        let user = store.user().unwrap();
        assert_eq!(user.id.as_deref(), Some("u1"));
        assert!(user.email.is_none());

        store.update_user(UserUpdate::new().clear_id());
        assert!(store.user().is_none());

        store.update_user(UserUpdate::new().username("bob"));
        store.clear_user();
        assert!(store.user().is_none());
    }

    #[test]
    fn test_try_snapshot_does_not_wait_on_writer() {
        let store = ContextStore::new();
        store.set_global(context! { "k" => "v" });

        let _writer = store.global.write().unwrap();
        let snapshot = store.try_snapshot();
        assert!(snapshot.global.is_empty());
    }
}
