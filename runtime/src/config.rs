// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Collection configuration.
//!
//! Loaded from an optional camelCase JSON document, then overridden by
//! `HARVEST_*` environment variables, then validated. Every field has a
//! default so a partial document is enough.

use crate::error::HarvestError;
use crate::item::SortKey;
use crate::memory::diagnostics::DiagnosticConfig;
use crate::memory::GovernorConfig;
use crate::pagination::{PaginationConfig, ScrollParams};
use crate::resilience::RetryConfig;
use crate::sort::{AddressHint, SortConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;

/// Per-phase target counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Targets {
    pub recent: usize,
    pub worst: usize,
    pub best: usize,
}

impl Default for Targets {
    fn default() -> Self {
        Self {
            recent: 100,
            worst: 100,
            best: 100,
        }
    }
}

impl Targets {
    pub fn get(&self, key: SortKey) -> usize {
        match key {
            SortKey::Recent => self.recent,
            SortKey::Worst => self.worst,
            SortKey::Best => self.best,
        }
    }

    pub fn total(&self) -> usize {
        self.recent + self.worst + self.best
    }
}

/// Budgets in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Timeouts {
    /// Per navigation attempt.
    pub sort_navigation: u64,
    /// Base budget of one pagination loop.
    pub pagination: u64,
    /// Shared deadline for the whole run.
    pub total_collection: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            sort_navigation: 15_000,
            pagination: 120_000,
            total_collection: 600_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Retries {
    pub sorting_attempts: u32,
    /// Maximum load attempts per pagination loop.
    pub pagination_attempts: u32,
}

impl Default for Retries {
    fn default() -> Self {
        Self {
            sorting_attempts: 3,
            pagination_attempts: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Performance {
    pub enable_memory_management: bool,
    /// Critical level; the warning level is 80% of it.
    #[serde(rename = "memoryThresholdMB")]
    pub memory_threshold_mb: u64,
    /// Pagination attempts between cleanup hook runs.
    pub batch_size: u32,
    /// Memory sampling interval.
    pub cleanup_interval_ms: u64,
}

impl Default for Performance {
    fn default() -> Self {
        Self {
            enable_memory_management: true,
            memory_threshold_mb: 512,
            batch_size: 10,
            cleanup_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PaginationTuning {
    pub stagnation_threshold: u32,
    pub progressive_timeout: bool,
    pub stabilize_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub action_timeout_ms: u64,
    pub max_consecutive_errors: u32,
    pub scroll_distance_px: u32,
    pub scroll_delay_ms: u64,
    pub scroll_repetitions: u32,
}

impl Default for PaginationTuning {
    fn default() -> Self {
        let scroll = ScrollParams::default();
        Self {
            stagnation_threshold: 5,
            progressive_timeout: true,
            stabilize_timeout_ms: 3_000,
            poll_interval_ms: 250,
            action_timeout_ms: 20_000,
            max_consecutive_errors: 3,
            scroll_distance_px: scroll.distance_px,
            scroll_delay_ms: scroll.delay.as_millis() as u64,
            scroll_repetitions: scroll.repetitions,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SortTuning {
    pub settle_delay_ms: u64,
    pub verify_sample: usize,
    pub strategy_timeout_ms: u64,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Overrides the surface profile's hint when set.
    pub address_hint: Option<AddressHint>,
}

impl Default for SortTuning {
    fn default() -> Self {
        Self {
            settle_delay_ms: 800,
            verify_sample: 5,
            strategy_timeout_ms: 10_000,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 8_000,
            address_hint: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CollectionConfig {
    pub targets: Targets,
    pub timeouts: Timeouts,
    pub retries: Retries,
    pub performance: Performance,
    pub pagination: PaginationTuning,
    pub sorting: SortTuning,
    /// Share of the phase target used by the unsorted fallback pass.
    pub fallback_target_ratio: f64,
    /// First segment of generated session ids.
    pub session_prefix: String,
    pub diagnostics: DiagnosticConfig,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            targets: Targets::default(),
            timeouts: Timeouts::default(),
            retries: Retries::default(),
            performance: Performance::default(),
            pagination: PaginationTuning::default(),
            sorting: SortTuning::default(),
            fallback_target_ratio: 0.5,
            session_prefix: "collect".to_string(),
            diagnostics: DiagnosticConfig::default(),
        }
    }
}

impl CollectionConfig {
    pub fn from_file(path: &Path) -> Result<Self, HarvestError> {
        let raw = std::fs::read_to_string(path).map_err(|source| HarvestError::ConfigIo {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| HarvestError::ConfigParse {
            path: path.display().to_string(),
            source,
        })
    }

    /// File (or defaults), then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, HarvestError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `HARVEST_*` overrides. Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        self.timeouts.total_collection =
            read_env_u64("HARVEST_TOTAL_TIMEOUT_MS", self.timeouts.total_collection);
        self.timeouts.sort_navigation =
            read_env_u64("HARVEST_SORT_TIMEOUT_MS", self.timeouts.sort_navigation);
        self.timeouts.pagination =
            read_env_u64("HARVEST_PAGINATION_TIMEOUT_MS", self.timeouts.pagination);
        self.performance.memory_threshold_mb = read_env_u64(
            "HARVEST_MEMORY_THRESHOLD_MB",
            self.performance.memory_threshold_mb,
        );
        self.performance.cleanup_interval_ms = read_env_u64(
            "HARVEST_CLEANUP_INTERVAL_MS",
            self.performance.cleanup_interval_ms,
        );
        self.retries.sorting_attempts =
            read_env_u32("HARVEST_SORTING_ATTEMPTS", self.retries.sorting_attempts);
        self.retries.pagination_attempts =
            read_env_u32("HARVEST_PAGINATION_ATTEMPTS", self.retries.pagination_attempts);
    }

    pub fn validate(&self) -> Result<(), HarvestError> {
        for key in SortKey::ALL {
            if self.targets.get(key) == 0 {
                return Err(HarvestError::InvalidConfig(format!(
                    "target for {key} must be positive"
                )));
            }
        }
        let positive = [
            ("timeouts.sortNavigation", self.timeouts.sort_navigation),
            ("timeouts.pagination", self.timeouts.pagination),
            ("timeouts.totalCollection", self.timeouts.total_collection),
            ("performance.cleanupIntervalMs", self.performance.cleanup_interval_ms),
            ("performance.memoryThresholdMB", self.performance.memory_threshold_mb),
            ("pagination.pollIntervalMs", self.pagination.poll_interval_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(HarvestError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if self.retries.sorting_attempts == 0 {
            return Err(HarvestError::InvalidConfig(
                "retries.sortingAttempts must be at least 1".into(),
            ));
        }
        if self.retries.pagination_attempts == 0 {
            return Err(HarvestError::InvalidConfig(
                "retries.paginationAttempts must be at least 1".into(),
            ));
        }
        if self.pagination.stagnation_threshold == 0 {
            return Err(HarvestError::InvalidConfig(
                "pagination.stagnationThreshold must be at least 1".into(),
            ));
        }
        if !(self.fallback_target_ratio > 0.0 && self.fallback_target_ratio <= 1.0) {
            return Err(HarvestError::InvalidConfig(format!(
                "fallbackTargetRatio must be in (0, 1], got {}",
                self.fallback_target_ratio
            )));
        }
        if self.session_prefix.is_empty() || self.session_prefix.contains('_') {
            return Err(HarvestError::InvalidConfig(
                "sessionPrefix must be non-empty and contain no '_'".into(),
            ));
        }
        Ok(())
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.total_collection)
    }

    /// Reduced target for the unsorted fallback pass, at least 1.
    pub fn fallback_target(&self, target: usize) -> usize {
        ((target as f64 * self.fallback_target_ratio).floor() as usize).max(1)
    }

    pub fn sort_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retries.sorting_attempts,
            base_delay: Duration::from_millis(self.sorting.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.sorting.retry_max_delay_ms),
            multiplier: 2.0,
            attempt_timeout: Some(Duration::from_millis(self.timeouts.sort_navigation)),
        }
    }

    /// Navigator settings; `profile_hint` applies unless the config carries
    /// its own address hint.
    pub fn sort_config(&self, profile_hint: Option<&AddressHint>) -> SortConfig {
        let address_hint = self
            .sorting
            .address_hint
            .clone()
            .or_else(|| profile_hint.cloned())
            .unwrap_or_default();
        SortConfig {
            address_hint,
            settle_delay: Duration::from_millis(self.sorting.settle_delay_ms),
            verify_sample: self.sorting.verify_sample,
            strategy_timeout: Duration::from_millis(self.sorting.strategy_timeout_ms),
        }
    }

    pub fn pagination_config(
        &self,
        target: usize,
        already_collected: usize,
        deadline: Option<Instant>,
    ) -> PaginationConfig {
        let tuning = &self.pagination;
        PaginationConfig {
            target,
            max_attempts: self.retries.pagination_attempts,
            timeout: Duration::from_millis(self.timeouts.pagination),
            stagnation_threshold: tuning.stagnation_threshold,
            progressive_timeout: tuning.progressive_timeout,
            cleanup_every: (self.performance.enable_memory_management
                && self.performance.batch_size > 0)
                .then_some(self.performance.batch_size),
            stabilize_timeout: Duration::from_millis(tuning.stabilize_timeout_ms),
            poll_interval: Duration::from_millis(tuning.poll_interval_ms),
            action_timeout: Duration::from_millis(tuning.action_timeout_ms),
            max_consecutive_errors: tuning.max_consecutive_errors,
            initial_params: ScrollParams {
                distance_px: tuning.scroll_distance_px,
                delay: Duration::from_millis(tuning.scroll_delay_ms),
                repetitions: tuning.scroll_repetitions.max(1),
            },
            already_collected,
            deadline,
        }
    }

    pub fn governor_config(&self) -> GovernorConfig {
        let mut config = GovernorConfig::from_threshold_mb(
            self.performance.memory_threshold_mb,
            Duration::from_millis(self.performance.cleanup_interval_ms),
        );
        config.enabled = self.performance.enable_memory_management;
        config
    }
}

fn read_env_u64(name: &str, default_value: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_value)
}

fn read_env_u32(name: &str, default_value: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default_value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = CollectionConfig::default();
        config.validate().unwrap();
        assert_eq!(config.targets.total(), 300);
        assert_eq!(config.governor_config().critical_bytes, 512 * 1024 * 1024);
    }

    #[test]
    fn test_camel_case_document() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "targets": {{"recent": 10, "worst": 20}},
                "timeouts": {{"sortNavigation": 5000, "totalCollection": 60000}},
                "retries": {{"sortingAttempts": 2}},
                "performance": {{"enableMemoryManagement": false, "memoryThresholdMB": 256,
                                 "batchSize": 4, "cleanupIntervalMs": 1000}},
                "fallbackTargetRatio": 0.25
            }}"#
        )
        .unwrap();

        let config = CollectionConfig::from_file(file.path()).unwrap();
        assert_eq!(config.targets.recent, 10);
        assert_eq!(config.targets.worst, 20);
        assert_eq!(config.targets.best, 100);
        assert_eq!(config.timeouts.sort_navigation, 5_000);
        assert_eq!(config.timeouts.pagination, 120_000);
        assert_eq!(config.retries.sorting_attempts, 2);
        assert!(!config.performance.enable_memory_management);
        assert_eq!(config.performance.memory_threshold_mb, 256);
        assert!(!config.governor_config().enabled);
        assert_eq!(config.fallback_target(10), 2);
    }

    #[test]
    fn test_bad_json_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = CollectionConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, HarvestError::ConfigParse { .. }));
    }

    #[test]
    fn test_zero_target_is_rejected() {
        let mut config = CollectionConfig::default();
        config.targets.worst = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("worst"));
    }

    #[test]
    fn test_fallback_ratio_bounds() {
        let mut config = CollectionConfig::default();
        config.fallback_target_ratio = 0.0;
        assert!(config.validate().is_err());
        config.fallback_target_ratio = 1.5;
        assert!(config.validate().is_err());
        config.fallback_target_ratio = 0.5;
        assert_eq!(config.fallback_target(1), 1);
        assert_eq!(config.fallback_target(9), 4);
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("HARVEST_SORTING_ATTEMPTS", "7");
        std::env::set_var("HARVEST_PAGINATION_TIMEOUT_MS", "not-a-number");
        let mut config = CollectionConfig::default();
        config.apply_env_overrides();
        std::env::remove_var("HARVEST_SORTING_ATTEMPTS");
        std::env::remove_var("HARVEST_PAGINATION_TIMEOUT_MS");

        assert_eq!(config.retries.sorting_attempts, 7);
        assert_eq!(config.timeouts.pagination, 120_000);
    }

    #[test]
    fn test_derived_pagination_config() {
        let mut config = CollectionConfig::default();
        config.performance.batch_size = 4;
        let cfg = config.pagination_config(25, 300, None);
        assert_eq!(cfg.target, 25);
        assert_eq!(cfg.cleanup_every, Some(4));
        assert_eq!(cfg.already_collected, 300);
        assert_eq!(cfg.max_attempts, 50);

        config.performance.enable_memory_management = false;
        assert_eq!(config.pagination_config(25, 0, None).cleanup_every, None);
    }

    #[test]
    fn test_sort_retry_uses_navigation_timeout() {
        let config = CollectionConfig::default();
        let retry = config.sort_retry();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.attempt_timeout, Some(Duration::from_millis(15_000)));
    }
}
