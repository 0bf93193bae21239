// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Resource governor for a collection run.
//!
//! A background task samples process memory into a bounded ring buffer.
//! Crossing the warning level is logged and counted; crossing the critical
//! level forces [`MemoryGovernor::perform_cleanup`], at most once per
//! cooldown window. Every failure here is logged and swallowed.

pub mod diagnostics;

use crate::error::AttemptError;
use crate::memory::diagnostics::DiagnosticStore;
use crate::resilience::race;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const MIB: u64 = 1024 * 1024;

/// How long `stop_monitoring` waits for the sampling loop to wind down.
pub const MONITOR_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Assumed page size for `/proc/self/statm`.
const PAGE_SIZE: u64 = 4096;

/// A point-in-time resource reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
}

/// Source of resource readings.
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> Result<ResourceUsage>;

    /// Ask the runtime behind the probe to release what it can.
    fn hint_collect(&self) {}
}

/// Reads the current process from `/proc/self/statm`.
pub struct ProcessProbe;

impl ResourceProbe for ProcessProbe {
    fn sample(&self) -> Result<ResourceUsage> {
        let raw = std::fs::read_to_string("/proc/self/statm")
            .context("failed to read /proc/self/statm")?;
        parse_statm(&raw)
    }
}

fn parse_statm(raw: &str) -> Result<ResourceUsage> {
    let mut fields = raw.split_whitespace().map(str::parse::<u64>);
    let size = fields
        .next()
        .context("statm: missing size")?
        .context("statm: bad size")?;
    let resident = fields
        .next()
        .context("statm: missing resident")?
        .context("statm: bad resident")?;
    Ok(ResourceUsage {
        resident_bytes: resident * PAGE_SIZE,
        virtual_bytes: size * PAGE_SIZE,
    })
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MemorySample {
    pub taken_at: chrono::DateTime<chrono::Utc>,
    pub usage: ResourceUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryLevel {
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// When false, monitoring never starts. Explicit cleanup still works.
    pub enabled: bool,
    pub sample_interval: Duration,
    pub warning_bytes: u64,
    pub critical_bytes: u64,
    /// Minimum spacing between forced cleanups.
    pub cleanup_cooldown: Duration,
    pub history_capacity: usize,
    /// Samples kept after a cleanup trims the history.
    pub history_keep_after_trim: usize,
    /// Pause before the post-cleanup sample.
    pub settle_delay: Duration,
    /// Longest a single cleanup callback may run before it is abandoned.
    pub callback_timeout: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self::from_threshold_mb(512, Duration::from_secs(5))
    }
}

impl GovernorConfig {
    /// Critical at `threshold_mb`, warning at 80% of it.
    pub fn from_threshold_mb(threshold_mb: u64, sample_interval: Duration) -> Self {
        let critical_bytes = threshold_mb.max(1) * MIB;
        Self {
            enabled: true,
            sample_interval,
            warning_bytes: critical_bytes / 5 * 4,
            critical_bytes,
            cleanup_cooldown: Duration::from_secs(30),
            history_capacity: 120,
            history_keep_after_trim: 20,
            settle_delay: Duration::from_millis(100),
            callback_timeout: Duration::from_secs(5),
        }
    }

    pub fn level_for(&self, bytes: u64) -> MemoryLevel {
        if bytes >= self.critical_bytes {
            MemoryLevel::Critical
        } else if bytes >= self.warning_bytes {
            MemoryLevel::Warning
        } else {
            MemoryLevel::Normal
        }
    }
}

/// An idempotent, externally registered cleanup step.
pub type CleanupCallback = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Cleanup always runs to completion; callback failures are listed.
    pub success: bool,
    pub callbacks_run: usize,
    pub callback_errors: Vec<String>,
    pub diagnostics_expired: usize,
    pub history_trimmed: usize,
    pub before_bytes: u64,
    pub after_bytes: u64,
    pub freed_bytes: u64,
    pub forced: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub monitoring: bool,
    pub samples: usize,
    pub current_bytes: Option<u64>,
    pub peak_bytes: u64,
    pub warnings: u64,
    pub critical_events: u64,
    pub cleanups: u64,
    pub forced_cleanups: u64,
    pub skipped_by_cooldown: u64,
    pub probe_failures: u64,
    pub last_cleanup: Option<CleanupReport>,
}

#[derive(Default)]
struct GovernorState {
    history: VecDeque<MemorySample>,
    peak_bytes: u64,
    warnings: u64,
    critical_events: u64,
    cleanups: u64,
    forced_cleanups: u64,
    skipped_by_cooldown: u64,
    probe_failures: u64,
    last_forced: Option<Instant>,
    last_cleanup: Option<CleanupReport>,
}

pub struct MemoryGovernor {
    config: GovernorConfig,
    probe: Arc<dyn ResourceProbe>,
    diagnostics: Arc<DiagnosticStore>,
    state: Mutex<GovernorState>,
    callbacks: Mutex<Vec<(String, CleanupCallback)>>,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryGovernor {
    pub fn new(
        config: GovernorConfig,
        probe: Arc<dyn ResourceProbe>,
        diagnostics: Arc<DiagnosticStore>,
    ) -> Self {
        Self {
            config,
            probe,
            diagnostics,
            state: Mutex::new(GovernorState::default()),
            callbacks: Mutex::new(Vec::new()),
            shutdown: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &Arc<DiagnosticStore> {
        &self.diagnostics
    }

    pub async fn register_cleanup(&self, name: impl Into<String>, callback: CleanupCallback) {
        self.callbacks.lock().await.push((name.into(), callback));
    }

    /// Take one sample into the ring buffer.
    pub async fn sample_once(&self) -> Option<MemorySample> {
        let usage = match self.probe.sample() {
            Ok(usage) => usage,
            Err(e) => {
                tracing::debug!("memory probe failed: {e:#}");
                self.state.lock().await.probe_failures += 1;
                return None;
            }
        };
        let sample = MemorySample {
            taken_at: chrono::Utc::now(),
            usage,
        };
        let mut state = self.state.lock().await;
        if state.history.len() >= self.config.history_capacity.max(1) {
            state.history.pop_front();
        }
        state.history.push_back(sample);
        state.peak_bytes = state.peak_bytes.max(usage.resident_bytes);
        Some(sample)
    }

    /// Sample and react to the level reached.
    pub async fn check(&self) -> MemoryLevel {
        let Some(sample) = self.sample_once().await else {
            return MemoryLevel::Normal;
        };
        let bytes = sample.usage.resident_bytes;
        let level = self.config.level_for(bytes);
        match level {
            MemoryLevel::Normal => {}
            MemoryLevel::Warning => {
                self.state.lock().await.warnings += 1;
                tracing::warn!(
                    "memory usage {} MiB above warning level {} MiB",
                    bytes / MIB,
                    self.config.warning_bytes / MIB
                );
            }
            MemoryLevel::Critical => {
                let allowed = {
                    let mut state = self.state.lock().await;
                    state.critical_events += 1;
                    let allowed = state
                        .last_forced
                        .map_or(true, |at| at.elapsed() >= self.config.cleanup_cooldown);
                    if allowed {
                        state.last_forced = Some(Instant::now());
                    } else {
                        state.skipped_by_cooldown += 1;
                    }
                    allowed
                };
                if allowed {
                    tracing::warn!(
                        "memory usage {} MiB reached critical level {} MiB; forcing cleanup",
                        bytes / MIB,
                        self.config.critical_bytes / MIB
                    );
                    self.run_cleanup(true).await;
                } else {
                    tracing::debug!("critical memory level; cleanup cooling down");
                }
            }
        }
        level
    }

    /// Run every cleanup step in order and report what was freed.
    pub async fn perform_cleanup(&self) -> CleanupReport {
        self.run_cleanup(false).await
    }

    async fn run_cleanup(&self, forced: bool) -> CleanupReport {
        let before_bytes = self.current_bytes().await;

        let callbacks: Vec<(String, CleanupCallback)> = self.callbacks.lock().await.clone();
        let mut callback_errors = Vec::new();
        for (name, callback) in &callbacks {
            match race(callback(), Some(self.config.callback_timeout), None).await {
                Ok(()) => {}
                Err(AttemptError::Timeout(limit)) => {
                    tracing::warn!("cleanup callback '{name}' abandoned after {}ms", limit.as_millis());
                    callback_errors.push(format!("{name}: timed out after {}ms", limit.as_millis()));
                }
                Err(e) => {
                    tracing::warn!("cleanup callback '{name}' failed: {e:#}");
                    callback_errors.push(format!("{name}: {e:#}"));
                }
            }
        }

        self.probe.hint_collect();
        let diagnostics_expired = self.diagnostics.expire().await;

        let history_trimmed = {
            let mut state = self.state.lock().await;
            let keep = self.config.history_keep_after_trim;
            let excess = state.history.len().saturating_sub(keep);
            state.history.drain(..excess);
            excess
        };

        tokio::time::sleep(self.config.settle_delay).await;
        let after_bytes = match self.sample_once().await {
            Some(s) => s.usage.resident_bytes,
            None => before_bytes,
        };

        let report = CleanupReport {
            success: true,
            callbacks_run: callbacks.len(),
            callback_errors,
            diagnostics_expired,
            history_trimmed,
            before_bytes,
            after_bytes,
            freed_bytes: before_bytes.saturating_sub(after_bytes),
            forced,
        };

        let mut state = self.state.lock().await;
        state.cleanups += 1;
        if forced {
            state.forced_cleanups += 1;
        }
        state.last_cleanup = Some(report.clone());
        tracing::info!(
            "memory cleanup freed {} KiB ({} callback error(s))",
            report.freed_bytes / 1024,
            report.callback_errors.len()
        );
        report
    }

    async fn current_bytes(&self) -> u64 {
        match self.probe.sample() {
            Ok(u) => u.resident_bytes,
            Err(_) => self
                .state
                .lock()
                .await
                .history
                .back()
                .map(|s| s.usage.resident_bytes)
                .unwrap_or(0),
        }
    }

    /// Spawn the sampling loop. No-op when disabled or already running.
    pub async fn start_monitoring(self: &Arc<Self>) {
        if !self.config.enabled {
            tracing::debug!("memory management disabled; not monitoring");
            return;
        }
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let governor = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);
        *task = Some(tokio::spawn(async move {
            tracing::debug!(
                "memory monitor started: every {}ms, warning {} MiB, critical {} MiB",
                governor.config.sample_interval.as_millis(),
                governor.config.warning_bytes / MIB,
                governor.config.critical_bytes / MIB
            );
            let mut ticker = tokio::time::interval(governor.config.sample_interval);
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        tracing::debug!("memory monitor stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        governor.check().await;
                    }
                }
            }
        }));
    }

    /// Stop the sampling loop. A loop that does not exit within
    /// [`MONITOR_STOP_TIMEOUT`] is aborted.
    pub async fn stop_monitoring(&self) {
        let Some(mut handle) = self.task.lock().await.take() else {
            return;
        };
        self.shutdown.notify_one();
        match tokio::time::timeout(MONITOR_STOP_TIMEOUT, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("memory monitor ended abnormally: {e}"),
            Err(_) => {
                tracing::warn!(
                    "memory monitor did not stop within {}ms; aborting it",
                    MONITOR_STOP_TIMEOUT.as_millis()
                );
                handle.abort();
            }
        }
    }

    pub async fn is_monitoring(&self) -> bool {
        self.task.lock().await.is_some()
    }

    pub async fn history(&self) -> Vec<MemorySample> {
        self.state.lock().await.history.iter().copied().collect()
    }

    pub async fn stats(&self) -> MemoryStats {
        let monitoring = self.is_monitoring().await;
        let state = self.state.lock().await;
        MemoryStats {
            monitoring,
            samples: state.history.len(),
            current_bytes: state.history.back().map(|s| s.usage.resident_bytes),
            peak_bytes: state.peak_bytes,
            warnings: state.warnings,
            critical_events: state.critical_events,
            cleanups: state.cleanups,
            forced_cleanups: state.forced_cleanups,
            skipped_by_cooldown: state.skipped_by_cooldown,
            probe_failures: state.probe_failures,
            last_cleanup: state.last_cleanup.clone(),
        }
    }
}
