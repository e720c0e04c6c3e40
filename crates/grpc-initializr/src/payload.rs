//! Payload normalization.
//!
//! Request payloads arriving as loosely-typed JSON objects are sanitized
//! against a declared schema before they reach business logic:
//!
//! - [`filter_unknown_keys`] drops keys the schema does not know about.
//! - [`merge_with_defaults`] fills missing keys from defaults.
//! - [`normalize`] does both against a typed request struct, using its
//!   `Default` value as schema and defaults, and deserializes the result.

use crate::error::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};

/// A set of recognized field names.
pub trait FieldSet {
    fn contains_field(&self, name: &str) -> bool;
}

impl FieldSet for Map<String, Value> {
    fn contains_field(&self, name: &str) -> bool {
        self.contains_key(name)
    }
}

impl FieldSet for [&str] {
    fn contains_field(&self, name: &str) -> bool {
        self.contains(&name)
    }
}

impl<const N: usize> FieldSet for [&str; N] {
    fn contains_field(&self, name: &str) -> bool {
        self.contains(&name)
    }
}

impl FieldSet for HashSet<String> {
    fn contains_field(&self, name: &str) -> bool {
        self.contains(name)
    }
}

impl FieldSet for BTreeSet<String> {
    fn contains_field(&self, name: &str) -> bool {
        self.contains(name)
    }
}

/// Removes every key of `payload` that `schema` does not recognize.
///
/// Each removed key is logged as a warning. Never fails.
pub fn filter_unknown_keys<S>(mut payload: Map<String, Value>, schema: &S) -> Map<String, Value>
where
    S: FieldSet + ?Sized,
{
    payload.retain(|key, _| {
        let known = schema.contains_field(key);
        if !known {
            tracing::warn!(key = %key, "Dropping unknown payload key `{key}`");
        }
        known
    });
    payload
}

/// Merges `user` values over `defaults`.
///
/// The result holds every default key, with user values winning on conflict;
/// keys only present in `user` are kept.
pub fn merge_with_defaults(
    user: Map<String, Value>,
    defaults: Map<String, Value>,
) -> Map<String, Value> {
    let mut merged = defaults;
    merged.extend(user);
    merged
}

/// Sanitizes an untyped payload into the request type `T`.
///
/// `T::default()` provides both the schema (its serialized field names) and
/// the defaults for missing fields. Unknown keys are dropped with a warning.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if `payload` is not a JSON object or a
/// field has the wrong type.
pub fn normalize<T>(payload: Value) -> Result<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    let Value::Object(payload) = payload else {
        return Err(Error::invalid_argument("payload must be a JSON object"));
    };
    let Value::Object(defaults) = serde_json::to_value(T::default())? else {
        return Err(Error::invalid_argument(
            "request type must serialize to a JSON object",
        ));
    };

    let filtered = filter_unknown_keys(payload, &defaults);
    let merged = merge_with_defaults(filtered, defaults);
    serde_json::from_value(Value::Object(merged))
        .map_err(|e| Error::invalid_argument(format!("invalid payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tracing::field::{Field, Visit};
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::{Layer, Registry};

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    /// Collects the `key` field of every WARN event.
    #[derive(Clone, Default)]
    struct WarnedKeys(Arc<Mutex<Vec<String>>>);

    struct KeyVisitor<'a>(&'a mut Option<String>);

    impl Visit for KeyVisitor<'_> {
        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            if field.name() == "key" {
                *self.0 = Some(format!("{value:?}"));
            }
        }
    }

    impl<S: Subscriber> Layer<S> for WarnedKeys {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == Level::WARN {
                let mut key = None;
                event.record(&mut KeyVisitor(&mut key));
                self.0.lock().unwrap().push(key.unwrap_or_default());
            }
        }
    }

    fn capture_warnings<R>(f: impl FnOnce() -> R) -> (R, Vec<String>) {
        let warned = WarnedKeys::default();
        let subscriber = Registry::default().with(warned.clone());
        let out = tracing::subscriber::with_default(subscriber, f);
        let keys = warned.0.lock().unwrap().clone();
        (out, keys)
    }

    #[test]
    fn filter_drops_unknown_keys_with_one_warning_each() {
        let (filtered, warned) = capture_warnings(|| {
            filter_unknown_keys(object(json!({"a": 1, "z": 9})), &object(json!({"a": 0})))
        });

        assert_eq!(Value::Object(filtered), json!({"a": 1}));
        assert_eq!(warned, vec!["z".to_string()]);
    }

    #[test]
    fn filter_keeps_known_keys_silently() {
        let (filtered, warned) = capture_warnings(|| {
            filter_unknown_keys(object(json!({"a": 1, "b": 2})), &["a", "b", "c"])
        });
        assert_eq!(Value::Object(filtered), json!({"a": 1, "b": 2}));
        assert!(warned.is_empty());
    }

    #[test]
    fn filter_accepts_name_sets() {
        let schema: HashSet<String> = ["model".to_string()].into();
        let filtered = filter_unknown_keys(object(json!({"model": "x", "debug": true})), &schema);
        assert_eq!(Value::Object(filtered), json!({"model": "x"}));

        let names: &[&str] = &[];
        assert!(filter_unknown_keys(object(json!({"a": 1})), names).is_empty());
    }

    #[test]
    fn merge_prefers_user_values() {
        let merged = merge_with_defaults(object(json!({"a": 1})), object(json!({"a": 0, "b": 2})));
        assert_eq!(Value::Object(merged), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn merge_keeps_user_only_keys() {
        let merged = merge_with_defaults(object(json!({"c": 3})), object(json!({"a": 0})));
        assert_eq!(Value::Object(merged), json!({"a": 0, "c": 3}));
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct PredictRequest {
        model: String,
        top_k: u32,
        temperature: f64,
    }

    impl Default for PredictRequest {
        fn default() -> Self {
            Self {
                model: "baseline".to_string(),
                top_k: 5,
                temperature: 1.0,
            }
        }
    }

    #[test]
    fn normalize_into_typed_request() {
        let (request, warned) = capture_warnings(|| {
            normalize::<PredictRequest>(json!({"top_k": 10, "verbose": true})).unwrap()
        });

        assert_eq!(
            request,
            PredictRequest {
                model: "baseline".to_string(),
                top_k: 10,
                temperature: 1.0,
            }
        );
        assert_eq!(warned, vec!["verbose".to_string()]);
    }

    #[test]
    fn normalize_rejects_bad_payloads() {
        assert!(matches!(
            normalize::<PredictRequest>(json!([1, 2])),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            normalize::<PredictRequest>(json!({"top_k": "many"})),
            Err(Error::InvalidArgument { .. })
        ));
    }
}
