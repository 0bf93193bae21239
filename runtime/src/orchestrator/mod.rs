// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Multi-phase collection runs.
//!
//! A run visits the `recent`, `worst` and `best` orderings in turn. Each
//! phase navigates to its ordering (falling back to an unsorted pass at a
//! reduced target when that fails) and then paginates into its own buffer.
//! One deadline is checked at every phase boundary and also caps the work
//! inside a phase. Whatever finished phases gathered is kept: deduplication
//! always runs, and every exit path goes through finalization.

pub mod result;
pub mod session;

pub use result::{CollectionResult, PhaseResult};
pub use session::{CollectionSession, CollectionState, SessionProgress};

use crate::config::CollectionConfig;
use crate::error::HarvestError;
use crate::item::{deduplicate, ContentFingerprinter, Fingerprinter, Item, ItemBuffer, SortKey};
use crate::memory::diagnostics::{DiagnosticStats, DiagnosticStore, Priority};
use crate::memory::{CleanupCallback, MemoryGovernor, MemoryStats, ProcessProbe, ResourceProbe};
use crate::pagination::{PaginationEngine, StopReason};
use crate::progress::{ProgressEventKind, ProgressHub, ProgressReceiver};
use crate::resilience::race;
use crate::sort::{AddressHint, NavigationResult, SortNavigator};
use crate::surface::{ContentHandle, ItemExtractor};
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::json;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Budget for reading the surface address at the start of a run.
const URL_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for releasing the surface during finalization.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(10);

/// A validated, registered session that has not run yet. Subscribe to its
/// progress before handing it to [`CollectionOrchestrator::run`].
#[derive(Debug)]
pub struct PreparedSession {
    id: String,
    config: CollectionConfig,
}

impl PreparedSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }
}

/// Per-run collaborators shared by every phase.
struct PhaseContext<'a> {
    session_id: &'a str,
    url: &'a str,
    config: &'a CollectionConfig,
    navigator: &'a SortNavigator,
    engine: &'a PaginationEngine,
    deadline: Instant,
}

pub struct CollectionOrchestrator {
    sessions: Arc<DashMap<String, CollectionSession>>,
    governors: DashMap<String, Arc<MemoryGovernor>>,
    progress: ProgressHub,
    diagnostics: Arc<DiagnosticStore>,
    probe: Arc<dyn ResourceProbe>,
    fingerprinter: Arc<dyn Fingerprinter>,
    cleanup_callbacks: Vec<(String, CleanupCallback)>,
    address_hint: Option<AddressHint>,
    cancel: Option<CancellationToken>,
}

impl Default for CollectionOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectionOrchestrator {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            governors: DashMap::new(),
            progress: ProgressHub::new(),
            diagnostics: Arc::new(DiagnosticStore::default()),
            probe: Arc::new(ProcessProbe),
            fingerprinter: Arc::new(ContentFingerprinter),
            cleanup_callbacks: Vec::new(),
            address_hint: None,
            cancel: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_fingerprinter(mut self, fingerprinter: Arc<dyn Fingerprinter>) -> Self {
        self.fingerprinter = fingerprinter;
        self
    }

    pub fn with_diagnostics(mut self, store: Arc<DiagnosticStore>) -> Self {
        self.diagnostics = store;
        self
    }

    /// Address hint from the surface profile; the config's own hint wins.
    pub fn with_address_hint(mut self, hint: AddressHint) -> Self {
        self.address_hint = Some(hint);
        self
    }

    /// Register a cleanup step on the memory governor of every run.
    pub fn with_cleanup_callback(mut self, name: impl Into<String>, callback: CleanupCallback) -> Self {
        self.cleanup_callbacks.push((name.into(), callback));
        self
    }

    /// Joins every race and is checked at phase boundaries.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Validate the configuration and register a session.
    pub fn begin(&self, config: CollectionConfig) -> Result<PreparedSession, HarvestError> {
        config.validate()?;
        let session = CollectionSession::new(&config);
        let id = session.id.clone();
        self.sessions.insert(id.clone(), session);
        self.progress.open(&id);
        debug!("session {id} registered");
        Ok(PreparedSession { id, config })
    }

    pub fn subscribe(&self, session_id: &str) -> ProgressReceiver {
        self.progress.subscribe(session_id)
    }

    /// Validate, register and run in one call. Only configuration problems
    /// produce an `Err`.
    pub async fn collect(
        &self,
        handle: &mut dyn ContentHandle,
        extractor: &dyn ItemExtractor,
        config: CollectionConfig,
    ) -> Result<CollectionResult, HarvestError> {
        let session = self.begin(config)?;
        Ok(self.run(session, handle, extractor).await)
    }

    /// Run every phase, deduplicate and finalize. Never fails: run-time
    /// problems are reported inside the result.
    pub async fn run(
        &self,
        session: PreparedSession,
        handle: &mut dyn ContentHandle,
        extractor: &dyn ItemExtractor,
    ) -> CollectionResult {
        let PreparedSession { id, config } = session;
        let started_at = Utc::now();
        let start = Instant::now();
        let deadline = start + config.total_timeout();

        let url_budget = URL_LOOKUP_TIMEOUT.min(config.total_timeout());
        let url = race(handle.current_url(), Some(url_budget), None)
            .await
            .ok();
        info!(
            "session {id} started: targets recent={} worst={} best={}, budget {}ms",
            config.targets.recent,
            config.targets.worst,
            config.targets.best,
            config.timeouts.total_collection
        );

        let governor = Arc::new(MemoryGovernor::new(
            config.governor_config(),
            Arc::clone(&self.probe),
            Arc::clone(&self.diagnostics),
        ));
        for (name, callback) in &self.cleanup_callbacks {
            governor.register_cleanup(name.clone(), Arc::clone(callback)).await;
        }
        governor.start_monitoring().await;
        self.governors.insert(id.clone(), Arc::clone(&governor));

        let mut navigator = SortNavigator::new(config.sort_config(self.address_hint.as_ref()));
        let mut engine = PaginationEngine::new(Some(Arc::clone(&governor)));
        if let Some(token) = &self.cancel {
            navigator = navigator.with_cancellation(token.clone());
            engine = engine.with_cancellation(token.clone());
        }
        let ctx = PhaseContext {
            session_id: &id,
            url: url.as_deref().unwrap_or_default(),
            config: &config,
            navigator: &navigator,
            engine: &engine,
            deadline,
        };

        let mut state = CollectionState::Pending.next();
        let mut phases: Vec<PhaseResult> = Vec::new();
        let mut skipped_phases: Vec<SortKey> = Vec::new();
        let mut collected: Vec<Item> = Vec::new();
        let mut deadline_hit = false;
        let mut cancelled = false;
        let mut run_error: Option<String> = None;

        while let CollectionState::Phase(key) = state {
            if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                cancelled = true;
            } else if Instant::now() >= deadline {
                deadline_hit = true;
            }
            if cancelled || deadline_hit {
                skipped_phases = state.remaining_phases();
                let reason = if cancelled { "cancelled" } else { "deadline reached" };
                warn!("session {id}: {reason}; skipping {skipped_phases:?}, keeping {} item(s)", collected.len());
                for phase in &skipped_phases {
                    self.progress.emit(
                        &id,
                        ProgressEventKind::PhaseSkipped {
                            phase: *phase,
                            reason: reason.to_string(),
                        },
                    );
                }
                state = CollectionState::Deduplicating;
                break;
            }

            self.set_state(&id, state, collected.len());
            let mut buffer = ItemBuffer::new(Arc::clone(&self.fingerprinter));
            let outcome = AssertUnwindSafe(self.run_phase(
                &ctx,
                key,
                &mut *handle,
                extractor,
                &mut buffer,
                collected.len(),
            ))
            .catch_unwind()
            .await;
            let phase_items = buffer.into_items();

            match outcome {
                Ok(result) => {
                    phases.push(result);
                    state = state.next();
                }
                Err(payload) => {
                    let message = format!("phase {key} panicked: {}", panic_message(payload.as_ref()));
                    error!(
                        "session {id}: {message}; keeping {} item(s) from it and moving on",
                        phase_items.len()
                    );
                    phases.push(PhaseResult::failed(
                        key,
                        config.targets.get(key),
                        phase_items.len(),
                        message.clone(),
                    ));
                    self.diagnostics
                        .record(&id, ctx.url, json!({ "event": "phase_panic", "phase": key, "message": message }), Priority::Critical)
                        .await;
                    run_error = Some(match run_error.take() {
                        Some(earlier) => format!("{earlier}; {message}"),
                        None => message,
                    });
                    state = state.next();
                }
            }
            collected.extend(phase_items.into_iter().map(|item| item.with_phase(key)));
        }

        if state == CollectionState::Deduplicating {
            self.set_state(&id, state, collected.len());
        }
        let raw_collected = collected.len();
        let dedup = deduplicate(collected, self.fingerprinter.as_ref());
        if dedup.degraded {
            warn!("session {id}: deduplication failed; keeping {raw_collected} raw item(s)");
            self.progress.emit(
                &id,
                ProgressEventKind::Warning {
                    message: "deduplication failed; results may contain duplicates".into(),
                },
            );
        }
        if state == CollectionState::Deduplicating {
            // a panicked phase still marks the run, after its items are kept
            state = if run_error.is_some() {
                CollectionState::Error
            } else {
                state.next()
            };
        }

        let mut result = CollectionResult {
            session_id: id.clone(),
            url: url.clone(),
            total_collected: dedup.items.len(),
            items: dedup.items,
            raw_collected,
            duplicates_removed: dedup.duplicates_removed,
            dedup_degraded: dedup.degraded,
            phases,
            skipped_phases,
            final_state: state,
            deadline_hit,
            cancelled,
            started_at,
            elapsed_ms: 0,
            memory: None,
            error: run_error,
        };
        self.finalize(&mut result, start, handle, &governor).await;
        result
    }

    async fn run_phase(
        &self,
        ctx: &PhaseContext<'_>,
        key: SortKey,
        handle: &mut dyn ContentHandle,
        extractor: &dyn ItemExtractor,
        buffer: &mut ItemBuffer,
        already_collected: usize,
    ) -> PhaseResult {
        let phase_start = Instant::now();
        let requested = ctx.config.targets.get(key);
        info!("phase {key} started (target {requested})");
        self.progress.emit(
            ctx.session_id,
            ProgressEventKind::PhaseStarted {
                phase: key,
                target: requested,
            },
        );

        let retry = ctx.config.sort_retry();
        let remaining = ctx.deadline.saturating_duration_since(Instant::now());
        let nav = match race(
            async { Ok(ctx.navigator.navigate_to_sort_with_retry(&mut *handle, key, &retry).await) },
            Some(remaining),
            None,
        )
        .await
        {
            Ok(nav) => nav,
            Err(e) => NavigationResult::failed(
                key,
                phase_start.elapsed(),
                format!("navigation abandoned: {e}"),
            ),
        };

        let (sorted, target) = if nav.success {
            (true, requested)
        } else {
            let reduced = ctx.config.fallback_target(requested);
            let reason = nav.error.clone().unwrap_or_else(|| "unknown error".into());
            warn!("ordering {key} unavailable ({reason}); unsorted pass with target {reduced}");
            self.progress.emit(
                ctx.session_id,
                ProgressEventKind::Warning {
                    message: format!("could not apply ordering {key}; collecting unsorted"),
                },
            );
            self.diagnostics
                .record(
                    ctx.session_id,
                    ctx.url,
                    json!({
                        "event": "navigation_failed",
                        "phase": key,
                        "attempts": nav.attempts,
                        "error": reason,
                    }),
                    Priority::High,
                )
                .await;
            (false, reduced)
        };

        let mut result = PhaseResult {
            phase: key,
            collected: buffer.len(),
            target,
            requested_target: requested,
            success: false,
            elapsed_ms: 0,
            stopped_reason: StopReason::Timeout,
            sorted,
            navigation_method: nav.method,
            navigation_confidence: nav.confidence,
            navigation_attempts: nav.attempts,
            navigation_error: if nav.success { None } else { nav.error.clone() },
            load_mode: None,
            pagination_attempts: 0,
            error: None,
        };

        if Instant::now() < ctx.deadline {
            let pagination = ctx.config.pagination_config(target, already_collected, Some(ctx.deadline));
            let report = |current: usize, target: usize| {
                self.report_progress(ctx.session_id, key, current, target);
            };
            let outcome = ctx
                .engine
                .paginate_for_target(handle, &pagination, extractor, buffer, &report)
                .await;
            result.stopped_reason = outcome.stopped_reason;
            result.load_mode = outcome.method;
            result.pagination_attempts = outcome.attempts.len();
            result.error = outcome.error;
        } else {
            debug!("phase {key}: deadline passed during navigation");
        }

        result.collected = buffer.len();
        result.success = result.stopped_reason != StopReason::Error && result.collected > 0;
        result.elapsed_ms = phase_start.elapsed().as_millis() as u64;

        if result.stopped_reason == StopReason::Error {
            self.diagnostics
                .record(
                    ctx.session_id,
                    ctx.url,
                    json!({
                        "event": "phase_error",
                        "phase": key,
                        "collected": result.collected,
                        "error": result.error,
                    }),
                    Priority::High,
                )
                .await;
        }

        info!(
            "phase {key} finished: {}/{} item(s), {} in {}ms",
            result.collected, result.target, result.stopped_reason, result.elapsed_ms
        );
        self.progress.emit(
            ctx.session_id,
            ProgressEventKind::PhaseCompleted {
                phase: key,
                collected: result.collected,
                stopped_reason: result.stopped_reason,
                elapsed_ms: result.elapsed_ms,
            },
        );
        result
    }

    /// Release everything the run holds. Runs on every exit path.
    async fn finalize(
        &self,
        result: &mut CollectionResult,
        start: Instant,
        handle: &mut dyn ContentHandle,
        governor: &Arc<MemoryGovernor>,
    ) {
        let id = result.session_id.clone();

        governor.stop_monitoring().await;
        result.memory = Some(governor.stats().await);

        let release = AssertUnwindSafe(handle.release()).catch_unwind();
        match tokio::time::timeout(RELEASE_TIMEOUT, release).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!("session {id}: releasing the surface failed: {e:#}"),
            Ok(Err(payload)) => warn!(
                "session {id}: releasing the surface panicked: {}",
                panic_message(payload.as_ref())
            ),
            Err(_) => warn!(
                "session {id}: releasing the surface did not finish within {}ms",
                RELEASE_TIMEOUT.as_millis()
            ),
        }

        result.elapsed_ms = start.elapsed().as_millis() as u64;
        self.diagnostics
            .record(
                &id,
                result.url.as_deref().unwrap_or_default(),
                json!({
                    "event": "session_summary",
                    "finalState": result.final_state,
                    "totalCollected": result.total_collected,
                    "duplicatesRemoved": result.duplicates_removed,
                    "skippedPhases": result.skipped_phases,
                    "deadlineHit": result.deadline_hit,
                    "elapsedMs": result.elapsed_ms,
                }),
                Priority::Medium,
            )
            .await;

        self.progress.emit(
            &id,
            ProgressEventKind::CollectionComplete {
                total_collected: result.total_collected,
                duplicates_removed: result.duplicates_removed,
                elapsed_ms: result.elapsed_ms,
            },
        );
        self.progress.close(&id);
        self.governors.remove(&id);
        self.sessions.remove(&id);

        info!(
            "session {id} finished ({}): {} item(s), {} duplicate(s) removed in {}ms",
            result.final_state, result.total_collected, result.duplicates_removed, result.elapsed_ms
        );
    }

    fn set_state(&self, session_id: &str, state: CollectionState, collected_so_far: usize) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.state = state;
            session.progress.collected_so_far = collected_so_far;
        }
    }

    fn report_progress(&self, session_id: &str, phase: SortKey, current: usize, target: usize) {
        let event = ProgressEventKind::progress(phase, current, target);
        if let ProgressEventKind::PhaseProgress { percentage, .. } = &event {
            if let Some(mut session) = self.sessions.get_mut(session_id) {
                session.progress.phase = Some(phase);
                session.progress.current = current;
                session.progress.target = target;
                session.progress.percentage = *percentage;
            }
        }
        self.progress.emit(session_id, event);
    }

    /// Snapshots of every registered session.
    pub fn active_sessions(&self) -> Vec<CollectionSession> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn session(&self, session_id: &str) -> Option<CollectionSession> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    pub fn diagnostics(&self) -> &Arc<DiagnosticStore> {
        &self.diagnostics
    }

    pub async fn diagnostic_stats(&self) -> DiagnosticStats {
        self.diagnostics.stats().await
    }

    /// Memory statistics of a running session.
    pub async fn memory_stats(&self, session_id: &str) -> Option<MemoryStats> {
        let governor = self.governors.get(session_id).map(|g| Arc::clone(g.value()))?;
        Some(governor.stats().await)
    }

    pub fn progress_hub(&self) -> &ProgressHub {
        &self.progress
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
