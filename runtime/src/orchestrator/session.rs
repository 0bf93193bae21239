// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Session bookkeeping and the phase state machine.

use crate::config::{CollectionConfig, Retries, Targets, Timeouts};
use crate::item::SortKey;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Where a collection run is.
///
/// `Error` is reachable from any state; `Complete` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "phase", rename_all = "kebab-case")]
pub enum CollectionState {
    Pending,
    Phase(SortKey),
    Deduplicating,
    Complete,
    Error,
}

impl CollectionState {
    /// Successor on the normal path.
    pub fn next(self) -> Self {
        match self {
            Self::Pending => Self::Phase(SortKey::Recent),
            Self::Phase(SortKey::Recent) => Self::Phase(SortKey::Worst),
            Self::Phase(SortKey::Worst) => Self::Phase(SortKey::Best),
            Self::Phase(SortKey::Best) => Self::Deduplicating,
            Self::Deduplicating => Self::Complete,
            Self::Complete => Self::Complete,
            Self::Error => Self::Error,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// Phases not yet started from this state, in order.
    pub fn remaining_phases(self) -> Vec<SortKey> {
        match self {
            Self::Pending => SortKey::ALL.to_vec(),
            Self::Phase(key) => SortKey::ALL.into_iter().filter(|k| *k >= key).collect(),
            _ => Vec::new(),
        }
    }
}

impl std::fmt::Display for CollectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Phase(key) => write!(f, "phase:{key}"),
            Self::Deduplicating => write!(f, "deduplicating"),
            Self::Complete => write!(f, "complete"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Latest progress report of the running phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProgress {
    pub phase: Option<SortKey>,
    pub current: usize,
    pub target: usize,
    pub percentage: f64,
    /// Items held by finished phases.
    pub collected_so_far: usize,
}

/// A registered collection run. Removed from the registry at finalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSession {
    pub id: String,
    pub targets: Targets,
    pub timeouts: Timeouts,
    pub retries: Retries,
    pub state: CollectionState,
    pub progress: SessionProgress,
    pub created_at: DateTime<Utc>,
}

impl CollectionSession {
    pub fn new(config: &CollectionConfig) -> Self {
        Self {
            id: generate_session_id(&config.session_prefix),
            targets: config.targets,
            timeouts: config.timeouts,
            retries: config.retries,
            state: CollectionState::Pending,
            progress: SessionProgress::default(),
            created_at: Utc::now(),
        }
    }
}

/// `prefix_timestamp_random`: millisecond timestamp and nine lowercase
/// alphanumerics.
pub fn generate_session_id(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{prefix}_{}_{suffix}", Utc::now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_path() {
        let mut state = CollectionState::Pending;
        let mut visited = vec![state];
        while !state.is_terminal() {
            state = state.next();
            visited.push(state);
        }
        assert_eq!(
            visited,
            vec![
                CollectionState::Pending,
                CollectionState::Phase(SortKey::Recent),
                CollectionState::Phase(SortKey::Worst),
                CollectionState::Phase(SortKey::Best),
                CollectionState::Deduplicating,
                CollectionState::Complete,
            ]
        );
        assert_eq!(CollectionState::Error.next(), CollectionState::Error);
    }

    #[test]
    fn test_remaining_phases() {
        assert_eq!(
            CollectionState::Phase(SortKey::Worst).remaining_phases(),
            vec![SortKey::Worst, SortKey::Best]
        );
        assert_eq!(CollectionState::Pending.remaining_phases().len(), 3);
        assert!(CollectionState::Deduplicating.remaining_phases().is_empty());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_value(CollectionState::Phase(SortKey::Best)).unwrap();
        assert_eq!(json, serde_json::json!({"state": "phase", "phase": "best"}));
        let json = serde_json::to_value(CollectionState::Complete).unwrap();
        assert_eq!(json, serde_json::json!({"state": "complete"}));
    }

    #[test]
    fn test_session_id_format() {
        let id = generate_session_id("collect");
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "collect");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
        assert!(parts[2].chars().all(|c| c.is_ascii_alphanumeric() && !c.is_ascii_uppercase()));
        assert_ne!(id, generate_session_id("collect"));
    }
}
