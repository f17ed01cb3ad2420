//! Mapping of raw technical error text to user-facing categories.
//!
//! Nothing that reaches the control plane may contain stack traces, file
//! paths or library error strings. Callers classify the raw text into an
//! [`ErrorCategory`] and relay only [`ErrorCategory::user_message`].

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    Connectivity,
    Permissions,
    Encoding,
    Unexpected,
}

static TIMEOUT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)time[sd]?[ _-]?out|deadline|not responding").expect("valid regex")
});

static CONNECTIVITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)connect|network|dns|unreachable|refused|reset by peer|broken pipe|socket|websocket")
        .expect("valid regex")
});

static PERMISSIONS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)permission|denied|forbidden|unauthori[sz]ed|not allowed|eacces")
        .expect("valid regex")
});

static ENCODING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)utf-?8|encod|decod|codec|invalid byte|unicode").expect("valid regex")
});

impl ErrorCategory {
    /// Classify raw error text. First match wins, in declaration order.
    pub fn classify(raw: &str) -> Self {
        if TIMEOUT_RE.is_match(raw) {
            Self::Timeout
        } else if CONNECTIVITY_RE.is_match(raw) {
            Self::Connectivity
        } else if PERMISSIONS_RE.is_match(raw) {
            Self::Permissions
        } else if ENCODING_RE.is_match(raw) {
            Self::Encoding
        } else {
            Self::Unexpected
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connectivity => "connectivity",
            Self::Permissions => "permissions",
            Self::Encoding => "encoding",
            Self::Unexpected => "unexpected",
        }
    }

    /// The fixed human-readable message relayed for this category.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Timeout => "The operation took too long and was stopped",
            Self::Connectivity => "A connection problem prevented the operation from completing",
            Self::Permissions => "The worker lacks the permissions needed for this operation",
            Self::Encoding => "The automation produced output that could not be read",
            Self::Unexpected => "An unexpected error occurred while processing the request",
        }
    }
}

/// Classify `raw` and return the sanitized message for it.
pub fn sanitize(raw: &str) -> &'static str {
    ErrorCategory::classify(raw).user_message()
}
