// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Phase and run results.

use crate::item::{Item, SortKey};
use crate::memory::MemoryStats;
use crate::orchestrator::session::CollectionState;
use crate::pagination::{LoadMode, StopReason};
use crate::sort::{Confidence, SortMethod};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one phase. Always carries a stop reason, including after a
/// failure inside the phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseResult {
    pub phase: SortKey,
    /// Unique items gathered by this phase.
    pub collected: usize,
    /// Target in force; reduced when the phase ran unsorted.
    pub target: usize,
    pub requested_target: usize,
    pub success: bool,
    pub elapsed_ms: u64,
    pub stopped_reason: StopReason,
    /// False when the ordering could not be applied and the phase fell back
    /// to an unsorted pass.
    pub sorted: bool,
    pub navigation_method: Option<SortMethod>,
    pub navigation_confidence: Option<Confidence>,
    pub navigation_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub navigation_error: Option<String>,
    pub load_mode: Option<LoadMode>,
    pub pagination_attempts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhaseResult {
    /// A phase that failed before producing a regular result.
    pub fn failed(phase: SortKey, requested_target: usize, collected: usize, error: String) -> Self {
        Self {
            phase,
            collected,
            target: requested_target,
            requested_target,
            success: false,
            elapsed_ms: 0,
            stopped_reason: StopReason::Error,
            sorted: false,
            navigation_method: None,
            navigation_confidence: None,
            navigation_attempts: 0,
            navigation_error: None,
            load_mode: None,
            pagination_attempts: 0,
            error: Some(error),
        }
    }
}

/// Everything a run produced, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionResult {
    pub session_id: String,
    pub url: Option<String>,
    /// Deduplicated items, earlier phases first.
    pub items: Vec<Item>,
    pub total_collected: usize,
    /// Sum of per-phase counts before cross-phase deduplication.
    pub raw_collected: usize,
    pub duplicates_removed: usize,
    /// Deduplication failed and the raw concatenation was kept.
    pub dedup_degraded: bool,
    pub phases: Vec<PhaseResult>,
    /// Phases never started because the deadline passed or the run was
    /// cancelled.
    pub skipped_phases: Vec<SortKey>,
    pub final_state: CollectionState,
    pub deadline_hit: bool,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CollectionResult {
    pub fn phase(&self, key: SortKey) -> Option<&PhaseResult> {
        self.phases.iter().find(|p| p.phase == key)
    }

    /// Whether every requested phase ran and reached its target.
    pub fn fully_successful(&self) -> bool {
        self.skipped_phases.is_empty()
            && self.phases.len() == SortKey::ALL.len()
            && self
                .phases
                .iter()
                .all(|p| p.stopped_reason == StopReason::TargetReached)
    }
}
