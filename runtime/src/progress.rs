// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Progress event types and per-session broadcast channels.
//!
//! The orchestrator emits `ProgressEvent`s while a session runs. Each session
//! gets its own `tokio::sync::broadcast` channel in the [`ProgressHub`]; when
//! nobody subscribed, events are silently dropped.

use crate::item::SortKey;
use crate::pagination::StopReason;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Buffered events per session before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 256;

/// A progress event emitted during a collection run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// The session this event belongs to.
    pub session_id: String,
    /// Monotonically increasing per session.
    pub seq: u64,
    pub event: ProgressEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProgressEventKind {
    PhaseStarted {
        phase: SortKey,
        target: usize,
    },
    /// Emitted after every extraction.
    PhaseProgress {
        phase: SortKey,
        current: usize,
        target: usize,
        percentage: f64,
    },
    PhaseCompleted {
        phase: SortKey,
        collected: usize,
        stopped_reason: StopReason,
        elapsed_ms: u64,
    },
    PhaseSkipped {
        phase: SortKey,
        reason: String,
    },
    /// A non-fatal problem worth surfacing.
    Warning {
        message: String,
    },
    CollectionComplete {
        total_collected: usize,
        duplicates_removed: usize,
        elapsed_ms: u64,
    },
}

impl ProgressEventKind {
    pub fn progress(phase: SortKey, current: usize, target: usize) -> Self {
        let percentage = if target == 0 {
            100.0
        } else {
            (current as f64 / target as f64 * 100.0).min(100.0)
        };
        Self::PhaseProgress {
            phase,
            current,
            target,
            percentage,
        }
    }
}

pub type ProgressSender = broadcast::Sender<ProgressEvent>;
pub type ProgressReceiver = broadcast::Receiver<ProgressEvent>;

struct Channel {
    tx: ProgressSender,
    seq: AtomicU64,
}

/// Progress channels keyed by session id.
#[derive(Clone, Default)]
pub struct ProgressHub {
    channels: Arc<DashMap<String, Arc<Channel>>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the channel for a session if it does not exist yet.
    pub fn open(&self, session_id: &str) {
        self.channel(session_id);
    }

    fn channel(&self, session_id: &str) -> Arc<Channel> {
        self.channels
            .entry(session_id.to_string())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
                Arc::new(Channel {
                    tx,
                    seq: AtomicU64::new(0),
                })
            })
            .clone()
    }

    /// Subscribe to a session. Opens the channel when needed so subscribers
    /// may attach before the run starts.
    pub fn subscribe(&self, session_id: &str) -> ProgressReceiver {
        self.channel(session_id).tx.subscribe()
    }

    /// Emit an event. No-op when the session has no channel.
    pub fn emit(&self, session_id: &str, event: ProgressEventKind) {
        let Some(channel) = self.channels.get(session_id).map(|c| Arc::clone(c.value())) else {
            return;
        };
        let seq = channel.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = channel.tx.send(ProgressEvent {
            session_id: session_id.to_string(),
            seq,
            event,
        });
    }

    /// Drop the session's channel; subscribers see the stream end once
    /// buffered events are drained.
    pub fn close(&self, session_id: &str) {
        self.channels.remove(session_id);
    }

    pub fn is_open(&self, session_id: &str) -> bool {
        self.channels.contains_key(session_id)
    }

    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[test]
    fn test_progress_event_serialization() {
        let event = ProgressEvent {
            session_id: "collect_1_abc".to_string(),
            seq: 1,
            event: ProgressEventKind::progress(SortKey::Worst, 5, 10),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("PhaseProgress"));
        assert!(json.contains("\"phase\":\"worst\""));
        assert!(json.contains("50.0"));

        let parsed: ProgressEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.session_id, "collect_1_abc");
        assert_eq!(parsed.event, event.event);
    }

    #[test]
    fn test_percentage_is_capped() {
        let ProgressEventKind::PhaseProgress { percentage, .. } =
            ProgressEventKind::progress(SortKey::Best, 15, 10)
        else {
            panic!("expected progress event");
        };
        assert_eq!(percentage, 100.0);
    }

    #[test]
    fn test_emit_without_channel_is_noop() {
        let hub = ProgressHub::new();
        hub.emit(
            "nobody",
            ProgressEventKind::Warning {
                message: "test".to_string(),
            },
        );
        assert_eq!(hub.open_channels(), 0);
    }

    #[test]
    fn test_emit_without_subscribers_does_not_panic() {
        let hub = ProgressHub::new();
        hub.open("s1");
        hub.emit(
            "s1",
            ProgressEventKind::Warning {
                message: "test".to_string(),
            },
        );
    }

    #[tokio::test]
    async fn test_sessions_are_isolated_and_sequenced() {
        let hub = ProgressHub::new();
        let mut a = hub.subscribe("a");
        let mut b = hub.subscribe("b");

        hub.emit("a", ProgressEventKind::progress(SortKey::Recent, 1, 4));
        hub.emit("a", ProgressEventKind::progress(SortKey::Recent, 2, 4));
        hub.emit("b", ProgressEventKind::progress(SortKey::Best, 1, 4));

        assert_eq!(a.recv().await.unwrap().seq, 1);
        assert_eq!(a.recv().await.unwrap().seq, 2);
        let from_b = b.recv().await.unwrap();
        assert_eq!(from_b.session_id, "b");
        assert_eq!(from_b.seq, 1);

        hub.close("a");
        assert!(!hub.is_open("a"));
        assert!(matches!(a.recv().await, Err(RecvError::Closed)));
    }
}
