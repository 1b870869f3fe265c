//! Failure classification.
//!
//! Maps any failure to one of four kinds by case-insensitive keyword
//! matching on its text. The kind decides whether reconnecting can help.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

/// Category of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    Network,
    Config,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Network => "network",
            ErrorKind::Config => "config",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Whether a failure of this kind is worth another connection attempt.
    pub fn should_reconnect(&self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Unknown)
    }

    fn prefix(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "Authentication failed: ",
            ErrorKind::Network => "Network error: ",
            ErrorKind::Config => "Configuration error: ",
            ErrorKind::Unknown => "Unknown error: ",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure after classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    pub should_reconnect: bool,
}

impl ClassifiedError {
    /// Build with an explicit kind, bypassing keyword matching.
    pub fn new(kind: ErrorKind, raw: impl fmt::Display) -> Self {
        Self {
            kind,
            message: format!("{}{}", kind.prefix(), raw),
            should_reconnect: kind.should_reconnect(),
        }
    }

    /// Credentials were rejected before any connection was attempted.
    pub fn missing_credentials(reason: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Auth, reason)
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

const AUTH_KEYWORDS: &[&str] = &[
    "unauthorized",
    "401",
    "403",
    "forbidden",
    "invalid token",
    "authentication",
    "access denied",
    "bad credentials",
    "token expired",
];

const NETWORK_KEYWORDS: &[&str] = &[
    "connection reset",
    "timeout",
    "network",
    "econnrefused",
    "enotfound",
    "socket hang up",
    "dns",
    "502",
    "503",
    "504",
];

const CONFIG_KEYWORDS: &[&str] = &[
    "404",
    "not found",
    "invalid configuration",
    "missing parameter",
];

/// Classify any displayable failure. Auth wins over network, network over config.
pub fn classify<E: fmt::Display + ?Sized>(error: &E) -> ClassifiedError {
    let raw = error.to_string();
    ClassifiedError::new(kind_of(&raw), raw)
}

/// Classify an arbitrary JSON value. Strings are used as-is, everything else
/// is stringified.
pub fn classify_value(value: &Value) -> ClassifiedError {
    match value {
        Value::String(s) => classify(s.as_str()),
        other => classify(other),
    }
}

fn kind_of(raw: &str) -> ErrorKind {
    let lowered = raw.to_lowercase();
    let matches = |keywords: &[&str]| keywords.iter().any(|k| lowered.contains(k));

    if matches(AUTH_KEYWORDS) {
        ErrorKind::Auth
    } else if matches(NETWORK_KEYWORDS) {
        ErrorKind::Network
    } else if matches(CONFIG_KEYWORDS) || is_missing_organization(&lowered) {
        ErrorKind::Config
    } else {
        ErrorKind::Unknown
    }
}

// "organization 'acme' could not be found" and friends
fn is_missing_organization(lowered: &str) -> bool {
    lowered
        .find("organization")
        .is_some_and(|at| {
            let rest = &lowered[at..];
            rest.contains("not found") || rest.contains("not be found")
        })
}
