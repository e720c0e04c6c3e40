//! # gRPC Service Configuration
//!
//! Builds the JSON *service configuration document* that declares per-method
//! timeouts and retry policies. The document follows the shape defined by the
//! gRPC service config format (`methodConfig[].retryPolicy`), so any compliant
//! client runtime can honor it:
//!
//! ```json
//! {
//!   "methodConfig": [{
//!     "name": [{}],
//!     "timeout": "30s",
//!     "waitForReady": true,
//!     "retryPolicy": {
//!       "maxAttempts": 5,
//!       "initialBackoff": "0.1s",
//!       "maxBackoff": "10s",
//!       "backoffMultiplier": 2,
//!       "retryableStatusCodes": ["UNAVAILABLE"]
//!     }
//!   }]
//! }
//! ```
//!
//! Nothing here performs retries. The server only *declares* the policy.

use crate::error::{Error, Result};
use core::cmp::Ordering;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::str::FromStr;
use core::time::Duration;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use tonic::Code;

/// Default per-call deadline, spelled `30.0s` on the wire.
pub const DEFAULT_TIMEOUT: ProtoDuration =
    ProtoDuration::with_literal(Duration::from_secs(30), "30.0s");
/// Default maximum number of attempts, including the original call.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Default delay before the first retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
/// Default upper bound for the delay between retries.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);
/// Default growth factor applied to the backoff after each attempt.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Canonical gRPC status code names, indexed by numeric code.
const CODE_NAMES: [&str; 17] = [
    "OK",
    "CANCELLED",
    "UNKNOWN",
    "INVALID_ARGUMENT",
    "DEADLINE_EXCEEDED",
    "NOT_FOUND",
    "ALREADY_EXISTS",
    "PERMISSION_DENIED",
    "RESOURCE_EXHAUSTED",
    "FAILED_PRECONDITION",
    "ABORTED",
    "OUT_OF_RANGE",
    "UNIMPLEMENTED",
    "INTERNAL",
    "UNAVAILABLE",
    "DATA_LOSS",
    "UNAUTHENTICATED",
];

/// Returns the canonical upper-case name of a status code (`UNAVAILABLE`).
pub fn code_name(code: Code) -> &'static str {
    usize::try_from(i32::from(code))
        .ok()
        .and_then(|idx| CODE_NAMES.get(idx).copied())
        .unwrap_or("UNKNOWN")
}

/// Parses a canonical status code name. Matching is case-insensitive.
pub fn parse_code(name: &str) -> Result<Code> {
    CODE_NAMES
        .iter()
        .position(|candidate| candidate.eq_ignore_ascii_case(name))
        .map(|idx| Code::from_i32(idx as i32))
        .ok_or_else(|| Error::invalid_argument(format!("unknown status code `{name}`")))
}

/// A duration in protobuf JSON notation: decimal seconds suffixed with `s`.
///
/// Durations built from a [`Duration`] render canonically: whole seconds
/// without a fractional part (`10s`), fractional values with trailing zeros
/// trimmed (`0.1s`). Parsed durations keep their original spelling (`30.0s`)
/// so documents survive a parse/render cycle byte for byte.
///
/// Comparison and hashing only look at the duration value.
#[derive(Debug, Clone, Default)]
pub struct ProtoDuration {
    duration: Duration,
    literal: Option<Cow<'static, str>>,
}

impl ProtoDuration {
    pub const fn new(duration: Duration) -> Self {
        Self {
            duration,
            literal: None,
        }
    }

    /// A duration rendered as `literal`, which must denote `duration`.
    pub const fn with_literal(duration: Duration, literal: &'static str) -> Self {
        Self {
            duration,
            literal: Some(Cow::Borrowed(literal)),
        }
    }

    pub const fn as_duration(&self) -> Duration {
        self.duration
    }
}

impl PartialEq for ProtoDuration {
    fn eq(&self, other: &Self) -> bool {
        self.duration == other.duration
    }
}

impl Eq for ProtoDuration {}

impl PartialOrd for ProtoDuration {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProtoDuration {
    fn cmp(&self, other: &Self) -> Ordering {
        self.duration.cmp(&other.duration)
    }
}

impl Hash for ProtoDuration {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.duration.hash(state);
    }
}

impl From<Duration> for ProtoDuration {
    fn from(duration: Duration) -> Self {
        Self::new(duration)
    }
}

impl From<ProtoDuration> for Duration {
    fn from(duration: ProtoDuration) -> Self {
        duration.duration
    }
}

impl fmt::Display for ProtoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(literal) = &self.literal {
            return f.write_str(literal);
        }
        let secs = self.duration.as_secs();
        let nanos = self.duration.subsec_nanos();
        if nanos == 0 {
            return write!(f, "{secs}s");
        }
        let frac = format!("{nanos:09}");
        write!(f, "{secs}.{}s", frac.trim_end_matches('0'))
    }
}

impl FromStr for ProtoDuration {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let malformed = || Error::invalid_argument(format!("malformed duration `{raw}`"));

        let body = raw.strip_suffix('s').ok_or_else(malformed)?;
        let (whole, frac) = match body.split_once('.') {
            Some((whole, frac)) => (whole, Some(frac)),
            None => (body, None),
        };

        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        let secs: u64 = whole.parse().map_err(|_| malformed())?;

        let nanos = match frac {
            None => 0,
            Some(frac) => {
                if frac.is_empty() || frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(malformed());
                }
                // Right-pad to nanosecond precision: "1" -> 100_000_000
                let padded = format!("{frac:0<9}");
                padded.parse::<u32>().map_err(|_| malformed())?
            }
        };

        Ok(Self {
            duration: Duration::new(secs, nanos),
            literal: Some(Cow::Owned(raw.to_string())),
        })
    }
}

impl Serialize for ProtoDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProtoDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Selects the RPCs a [`MethodConfig`] applies to.
///
/// An empty selector (neither service nor method) matches every method.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MethodSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

impl MethodSelector {
    /// Matches every method of every service.
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches every method of a fully-qualified service (`pkg.Service`).
    pub fn service(service: impl Into<String>) -> Self {
        Self {
            service: Some(service.into()),
            method: None,
        }
    }

    /// Matches a single method of a fully-qualified service.
    pub fn method(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: Some(service.into()),
            method: Some(method.into()),
        }
    }
}

/// Client-side retry policy declared for a set of methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: ProtoDuration,
    pub max_backoff: ProtoDuration,
    #[serde(serialize_with = "serialize_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(with = "status_codes")]
    pub retryable_status_codes: Vec<Code>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF.into(),
            max_backoff: DEFAULT_MAX_BACKOFF.into(),
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            retryable_status_codes: vec![Code::Unavailable],
        }
    }
}

impl RetryPolicy {
    /// Adds a retryable status code. Duplicates are ignored.
    pub fn retry_on(mut self, code: Code) -> Self {
        if !self.retryable_status_codes.contains(&code) {
            self.retryable_status_codes.push(code);
        }
        self
    }

    /// Checks the policy invariants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if:
    /// - `max_attempts` is zero.
    /// - `initial_backoff` exceeds `max_backoff`.
    /// - `backoff_multiplier` is not a positive finite number.
    /// - no retryable status code is declared.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(Error::invalid_argument("maxAttempts must be at least 1"));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(Error::invalid_argument(format!(
                "initialBackoff ({}) must not exceed maxBackoff ({})",
                self.initial_backoff, self.max_backoff
            )));
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier > 0.0) {
            return Err(Error::invalid_argument(format!(
                "backoffMultiplier must be positive, got {}",
                self.backoff_multiplier
            )));
        }
        if self.retryable_status_codes.is_empty() {
            return Err(Error::invalid_argument(
                "retryableStatusCodes must contain at least one code",
            ));
        }
        Ok(())
    }
}

/// Timeout and retry settings for the methods matched by `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodConfig {
    pub name: Vec<MethodSelector>,
    pub timeout: ProtoDuration,
    pub wait_for_ready: bool,
    pub retry_policy: RetryPolicy,
}

impl Default for MethodConfig {
    fn default() -> Self {
        Self {
            name: vec![MethodSelector::all()],
            timeout: DEFAULT_TIMEOUT,
            wait_for_ready: true,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl MethodConfig {
    pub fn new(
        selectors: Vec<MethodSelector>,
        timeout: impl Into<ProtoDuration>,
        retry_policy: RetryPolicy,
    ) -> Self {
        // An empty name list would match nothing; `[{}]` is the wildcard.
        let name = if selectors.is_empty() {
            vec![MethodSelector::all()]
        } else {
            selectors
        };
        Self {
            name,
            timeout: timeout.into(),
            wait_for_ready: true,
            retry_policy,
        }
    }

    pub fn wait_for_ready(mut self, wait_for_ready: bool) -> Self {
        self.wait_for_ready = wait_for_ready;
        self
    }
}

/// The service configuration document handed to the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub method_config: Vec<MethodConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            method_config: vec![MethodConfig::default()],
        }
    }
}

impl ServiceConfig {
    /// Builds a document with a single method config.
    ///
    /// An empty `selectors` list applies the policy to every method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the retry policy violates its
    /// invariants.
    pub fn build(
        selectors: Vec<MethodSelector>,
        timeout: impl Into<ProtoDuration>,
        retry_policy: RetryPolicy,
    ) -> Result<Self> {
        retry_policy.validate()?;
        Ok(Self {
            method_config: vec![MethodConfig::new(selectors, timeout, retry_policy)],
        })
    }

    /// Appends another method config.
    pub fn with_method_config(mut self, config: MethodConfig) -> Result<Self> {
        config.retry_policy.validate()?;
        self.method_config.push(config);
        Ok(self)
    }

    /// Parses and validates a document produced elsewhere.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| Error::invalid_argument(format!("invalid service config: {e}")))?;
        for method in &config.method_config {
            method.retry_policy.validate()?;
        }
        Ok(config)
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// Integral multipliers are emitted as JSON integers (`2`, not `2.0`).
fn serialize_multiplier<S: Serializer>(
    value: &f64,
    serializer: S,
) -> core::result::Result<S::Ok, S::Error> {
    if value.fract() == 0.0 && *value >= 0.0 && *value <= u32::MAX as f64 {
        serializer.serialize_u64(*value as u64)
    } else {
        serializer.serialize_f64(*value)
    }
}

mod status_codes {
    use super::{code_name, parse_code};
    use serde::{Deserialize, Deserializer, Serializer, ser::SerializeSeq};
    use tonic::Code;

    pub fn serialize<S: Serializer>(codes: &[Code], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(codes.len()))?;
        for code in codes {
            seq.serialize_element(code_name(*code))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Code>, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        let mut codes = Vec::with_capacity(names.len());
        for name in names {
            let code = parse_code(&name).map_err(serde::de::Error::custom)?;
            if !codes.contains(&code) {
                codes.push(code);
            }
        }
        Ok(codes)
    }
}
