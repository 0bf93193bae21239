// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error types and transient/permanent classification.
//!
//! Driver-facing code returns `anyhow::Result` (the same boundary the
//! renderer traits use). The engine classifies those errors with
//! [`classify`] to decide whether an operation is worth retrying.

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

/// Errors surfaced by the public API. Only configuration problems escape
/// `collect`; everything else resolves into a result object.
#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to read config {path}: {source}")]
    ConfigIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("browser unavailable: {0}")]
    BrowserUnavailable(String),
}

/// Whether a failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Connectivity or timeout shaped; may succeed on retry.
    Transient,
    /// Structural or validation failure; retrying will not help.
    Permanent,
}

/// An error raised by a surface driver that already knows its class.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct SurfaceError {
    pub class: ErrorClass,
    pub message: String,
}

impl SurfaceError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }
}

/// Outcome of a single raced attempt that did not produce a value.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    /// The per-attempt timer fired first. Terminal: never retried.
    #[error("attempt timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The cancellation token fired first.
    #[error("attempt cancelled")]
    Cancelled,

    /// The operation itself failed.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl AttemptError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Back to a plain error. A failure yields the operation's own error so
    /// its cause chain stays visible to [`classify`].
    pub fn into_error(self) -> anyhow::Error {
        match self {
            Self::Failed(inner) => inner,
            other => anyhow::Error::new(other),
        }
    }
}

fn transient_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)(timed? ?out|timeout|etimedout|econnreset|econnrefused|econnaborted|enetunreach|ehostunreach|connection (reset|refused|closed|aborted)|socket hang ?up|network|net::err_|navigation (failed|interrupted)|target closed|session closed|detached|execution context was destroyed|temporarily unavailable|websocket|protocol error|broken pipe)",
        )
        .expect("transient error pattern is valid")
    })
}

/// Classify an error by walking its cause chain.
///
/// Explicit [`SurfaceError`] classes win, then io error kinds, then the
/// message is matched against known transient signatures. Anything else is
/// permanent.
pub fn classify(err: &anyhow::Error) -> ErrorClass {
    for cause in err.chain() {
        if let Some(surface) = cause.downcast_ref::<SurfaceError>() {
            return surface.class;
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind::*;
            if matches!(
                io.kind(),
                TimedOut
                    | ConnectionReset
                    | ConnectionRefused
                    | ConnectionAborted
                    | BrokenPipe
                    | Interrupted
                    | WouldBlock
                    | NotConnected
            ) {
                return ErrorClass::Transient;
            }
        }
    }
    if transient_pattern().is_match(&format!("{err:#}")) {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

/// Shorthand for `classify(err) == ErrorClass::Transient`.
pub fn is_transient(err: &anyhow::Error) -> bool {
    classify(err) == ErrorClass::Transient
}
