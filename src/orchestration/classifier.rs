//! Failure classification and retry backoff.
//!
//! A `Failure` is the serializable description of why a story execution
//! failed. It crosses the IPC boundary inside `error` messages so the
//! orchestrator can decide between retrying and giving up without ever
//! seeing the worker's original error value.

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::LazyLock;
use std::time::Duration;

/// Transport-level failure codes treated as transient.
pub const TRANSIENT_CODES: &[&str] = &[
    "ETIMEDOUT",
    "ECONNRESET",
    "ECONNREFUSED",
    "ENOTFOUND",
    "EAI_AGAIN",
    "EHOSTUNREACH",
    "EPIPE",
];

/// Raw description of a failed execution.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Failure {
    /// Credentials were rejected. Never retried.
    #[serde(default)]
    pub auth_failure: bool,
    /// HTTP-style status code reported by the agent's backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Transport failure code such as `ECONNRESET`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

impl Failure {
    pub fn auth(message: impl Into<String>) -> Self {
        Self {
            auth_failure: true,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn transport(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Map an I/O error onto a transport code where one applies.
    pub fn from_io(err: &io::Error) -> Self {
        let code = match err.kind() {
            io::ErrorKind::TimedOut => Some("ETIMEDOUT"),
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                Some("ECONNRESET")
            }
            io::ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
            io::ErrorKind::BrokenPipe => Some("EPIPE"),
            _ => None,
        };
        Self {
            code: code.map(String::from),
            message: err.to_string(),
            ..Default::default()
        }
    }

    /// Build a failure from the combined output of a process that exited
    /// unsuccessfully.
    ///
    /// Looks for authentication markers first, then an HTTP status code,
    /// then a transport code name. The last non-empty line becomes the
    /// message.
    pub fn from_output(exit_code: Option<i32>, output: &str) -> Self {
        let message = output
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(String::from)
            .unwrap_or_else(|| match exit_code {
                Some(code) => format!("agent exited with code {}", code),
                None => "agent terminated by signal".to_string(),
            });

        let lower = output.to_lowercase();
        if AUTH_MARKERS.iter().any(|m| lower.contains(m)) {
            return Self::auth(message);
        }
        if let Some(status) = scan_status(output) {
            return Self::http(status, message);
        }
        if let Some(code) = TRANSIENT_CODES.iter().find(|c| output.contains(*c)) {
            return Self::transport(*code, message);
        }
        Self::other(message)
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.status, &self.code) {
            (Some(status), _) => write!(f, "{} (status {})", self.message, status),
            (None, Some(code)) => write!(f, "{} ({})", self.message, code),
            (None, None) => f.write_str(&self.message),
        }
    }
}

const AUTH_MARKERS: &[&str] = &[
    "invalid api key",
    "authentication_error",
    "authentication failed",
    "unauthorized",
    "please run /login",
];

/// HTTP-style status code following `status`, `HTTP/1.1`, or `Error:`.
static STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:status(?:\s+code)?|http(?:/\d(?:\.\d)?)?|error)[\s:=]+([45]\d\d)\b").unwrap()
});

fn scan_status(output: &str) -> Option<u16> {
    STATUS_RE
        .captures(output)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Classify a failure.
///
/// Rules apply in order: authentication failures are permanent; status 429
/// and 5xx are transient while other 4xx are permanent; known transport
/// codes are transient; anything else is permanent.
pub fn classify(failure: &Failure) -> ErrorClass {
    if failure.auth_failure {
        return ErrorClass::Permanent;
    }
    if let Some(status) = failure.status {
        if status == 429 || status >= 500 {
            return ErrorClass::Transient;
        }
        if (400..500).contains(&status) {
            return ErrorClass::Permanent;
        }
    }
    match failure.code.as_deref() {
        Some(code) if TRANSIENT_CODES.contains(&code) => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

pub fn is_transient(failure: &Failure) -> bool {
    classify(failure) == ErrorClass::Transient
}

/// True iff `attempt < max_retries` and the failure is transient.
pub fn should_retry(failure: &Failure, attempt: u32, max_retries: u32) -> bool {
    attempt < max_retries && is_transient(failure)
}

/// Jittered exponential backoff.
///
/// `min(initial * 2^attempt, max)` perturbed by uniform jitter of up to 25%
/// either way, never negative.
pub fn backoff(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let initial_ms = initial.as_millis().min(u64::MAX as u128) as u64;
    let max_ms = max.as_millis().min(u64::MAX as u128) as u64;
    let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
    let base = initial_ms.saturating_mul(factor).min(max_ms) as f64;

    let jitter = rand::thread_rng().gen_range(-0.25..=0.25) * base;
    Duration::from_millis((base + jitter).max(0.0).round() as u64)
}
