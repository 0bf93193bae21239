// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end collection runs against a scripted review page.
//!
//! The page keeps one item list per ordering, reveals items as it is
//! scrolled, and can be told to fail, ignore, or panic on specific actions.

use anyhow::Result;
use assert_json_diff::assert_json_include;
use async_trait::async_trait;
use futures::future::BoxFuture;
use harvest_runtime::config::{CollectionConfig, Targets};
use harvest_runtime::item::{Item, SortKey};
use harvest_runtime::memory::diagnostics::Priority;
use harvest_runtime::memory::{ResourceProbe, ResourceUsage};
use harvest_runtime::orchestrator::{CollectionOrchestrator, CollectionState};
use harvest_runtime::pagination::StopReason;
use harvest_runtime::progress::ProgressEventKind;
use harvest_runtime::sort::SortMethod;
use harvest_runtime::surface::{
    ActionOutcome, ContentHandle, ItemExtractor, LoadAffordance, Locator, SurfaceAction,
};
use harvest_runtime::HarvestError;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio_util::sync::CancellationToken;

const MIB: u64 = 1024 * 1024;

// ── Scripted page ──

struct PageState {
    url: String,
    pools: HashMap<SortKey, Vec<Item>>,
    ordering: Option<SortKey>,
    visible: usize,
    initial_visible: usize,
    per_load: usize,
    /// Loads claim to act but reveal nothing.
    stuck: bool,
    load_delay: Duration,
    extract_delay: Duration,
    failing: HashSet<&'static str>,
    inert: HashSet<&'static str>,
    panic_on_sort: Option<SortKey>,
    released: u32,
}

#[derive(Clone)]
struct ReviewPage(Arc<Mutex<PageState>>);

const SORT_ACTIONS: [&str; 6] = [
    "activate_sort_control",
    "navigate",
    "keyboard_sort",
    "reveal_sort_control",
    "expand_sort_menu",
    "scan_sort_candidates",
];

fn reviews(prefix: &str, n: usize) -> Vec<Item> {
    (0..n)
        .map(|i| {
            Item::new(
                format!("{prefix}-author-{i}"),
                format!("{prefix} review number {i}, shipping was fine"),
                Some((i % 5 + 1) as f32),
            )
        })
        .collect()
}

impl ReviewPage {
    /// Distinct pools of `per_phase` items, all rendered at once.
    fn distinct(per_phase: usize) -> Self {
        Self::with_pools(
            SortKey::ALL
                .iter()
                .map(|key| (*key, reviews(key.as_str(), per_phase)))
                .collect(),
            per_phase,
        )
    }

    fn with_pools(pools: HashMap<SortKey, Vec<Item>>, initial_visible: usize) -> Self {
        Self(Arc::new(Mutex::new(PageState {
            url: "https://shop.example.com/p/42/reviews".into(),
            pools,
            ordering: None,
            visible: initial_visible,
            initial_visible,
            per_load: 5,
            stuck: false,
            load_delay: Duration::ZERO,
            extract_delay: Duration::ZERO,
            failing: HashSet::new(),
            inert: HashSet::new(),
            panic_on_sort: None,
            released: 0,
        })))
    }

    fn with(self, f: impl FnOnce(&mut PageState)) -> Self {
        f(&mut self.0.lock().unwrap());
        self
    }

    fn released(&self) -> u32 {
        self.0.lock().unwrap().released
    }

    fn act(&self, action: &SurfaceAction) -> Result<ActionOutcome> {
        let mut s = self.0.lock().unwrap();
        let name = action.name();
        if s.failing.contains(name) {
            anyhow::bail!("{name}: element detached from document");
        }
        if s.inert.contains(name) {
            return Ok(ActionOutcome::Applied(false));
        }
        match action {
            SurfaceAction::ActivateSortControl { key }
            | SurfaceAction::KeyboardSort { key }
            | SurfaceAction::ScanSortCandidates { key } => {
                if s.panic_on_sort == Some(*key) {
                    drop(s);
                    panic!("sort control for {key} vanished mid-click");
                }
                s.ordering = Some(*key);
                s.visible = s.initial_visible;
                Ok(ActionOutcome::Applied(true))
            }
            SurfaceAction::Navigate { url } => {
                s.url = url.clone();
                Ok(ActionOutcome::Applied(true))
            }
            SurfaceAction::InspectOrdering { key, .. } => {
                Ok(ActionOutcome::Ordering(Some(s.ordering == Some(*key))))
            }
            SurfaceAction::ProbeLoadMore => Ok(ActionOutcome::Affordance(LoadAffordance {
                scrollable: true,
                clickable: false,
            })),
            SurfaceAction::Scroll { .. } | SurfaceAction::ClickLoadMore => {
                if s.stuck {
                    return Ok(ActionOutcome::Applied(true));
                }
                let len = s.pool().len();
                if s.visible >= len {
                    return Ok(ActionOutcome::Applied(false));
                }
                s.visible = (s.visible + s.per_load).min(len);
                Ok(ActionOutcome::Applied(true))
            }
            _ => Ok(ActionOutcome::Applied(false)),
        }
    }
}

impl PageState {
    /// Unsorted pages show the recent list.
    fn pool(&self) -> &[Item] {
        let key = self.ordering.unwrap_or(SortKey::Recent);
        self.pools.get(&key).map(Vec::as_slice).unwrap_or_default()
    }
}

#[async_trait]
impl ContentHandle for ReviewPage {
    async fn current_url(&self) -> Result<String> {
        Ok(self.0.lock().unwrap().url.clone())
    }

    async fn perform(&mut self, action: &SurfaceAction) -> Result<ActionOutcome> {
        if matches!(action, SurfaceAction::Scroll { .. } | SurfaceAction::ClickLoadMore) {
            let delay = self.0.lock().unwrap().load_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        self.act(action)
    }

    async fn count(&self, _locator: &Locator) -> Result<usize> {
        let s = self.0.lock().unwrap();
        Ok(s.visible.min(s.pool().len()))
    }

    async fn release(&mut self) -> Result<()> {
        self.0.lock().unwrap().released += 1;
        Ok(())
    }
}

#[async_trait]
impl ItemExtractor for ReviewPage {
    async fn extract(&self) -> Result<Vec<Item>> {
        let delay = self.0.lock().unwrap().extract_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let s = self.0.lock().unwrap();
        let pool = s.pool();
        Ok(pool[..s.visible.min(pool.len())].to_vec())
    }

    fn item_locator(&self) -> Locator {
        Locator::new("[data-review-id]")
    }
}

// ── Helpers ──

struct FixedProbe(AtomicU64);

impl FixedProbe {
    fn mib(n: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(n * MIB)))
    }
}

impl ResourceProbe for FixedProbe {
    fn sample(&self) -> Result<ResourceUsage> {
        Ok(ResourceUsage {
            resident_bytes: self.0.load(Ordering::SeqCst),
            virtual_bytes: 0,
        })
    }
}

fn config(target: usize) -> CollectionConfig {
    CollectionConfig {
        targets: Targets {
            recent: target,
            worst: target,
            best: target,
        },
        ..CollectionConfig::default()
    }
}

fn orchestrator() -> CollectionOrchestrator {
    CollectionOrchestrator::new().with_probe(FixedProbe::mib(64))
}

// ── Scenarios ──

#[tokio::test(start_paused = true)]
async fn test_distinct_items_reach_every_target() {
    let page = ReviewPage::distinct(10);
    let mut handle = page.clone();
    let result = orchestrator()
        .collect(&mut handle, &page, config(10))
        .await
        .unwrap();

    assert_eq!(result.total_collected, 30);
    assert_eq!(result.duplicates_removed, 0);
    assert_eq!(result.final_state, CollectionState::Complete);
    assert!(result.fully_successful());
    for phase in &result.phases {
        assert_eq!(phase.stopped_reason, StopReason::TargetReached);
        assert!(phase.sorted);
        assert!(phase.success);
        assert_eq!(phase.navigation_method, Some(SortMethod::DirectInteraction));
    }
    assert_eq!(result.url.as_deref(), Some("https://shop.example.com/p/42/reviews"));
    assert_eq!(page.released(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_items_stop_on_stagnation() {
    let same = reviews("same", 3);
    let pools = SortKey::ALL.iter().map(|k| (*k, same.clone())).collect();
    let page = ReviewPage::with_pools(pools, 3).with(|s| s.stuck = true);
    let mut handle = page.clone();
    let cfg = config(10);
    let threshold = cfg.pagination.stagnation_threshold as usize;

    let result = orchestrator().collect(&mut handle, &page, cfg).await.unwrap();

    assert_eq!(result.phases.len(), 3);
    for phase in &result.phases {
        assert_eq!(phase.stopped_reason, StopReason::Stagnation);
        assert_eq!(phase.collected, 3);
        assert_eq!(phase.pagination_attempts, threshold);
    }
    assert_eq!(result.raw_collected, 9);
    assert_eq!(result.total_collected, 3);
    assert_eq!(result.duplicates_removed, 6);
}

#[tokio::test(start_paused = true)]
async fn test_third_strategy_applies_ordering() {
    let page = ReviewPage::distinct(10).with(|s| {
        s.failing.insert("activate_sort_control");
        s.failing.insert("navigate");
    });
    let mut handle = page.clone();
    let result = orchestrator()
        .collect(&mut handle, &page, config(10))
        .await
        .unwrap();

    for phase in &result.phases {
        assert!(phase.sorted, "{:?} fell back", phase.phase);
        assert_eq!(phase.navigation_method, Some(SortMethod::Keyboard));
        assert_eq!(phase.navigation_attempts, 1);
    }
    assert_eq!(result.total_collected, 30);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_ordering_falls_back_to_unsorted_pass() {
    let page = ReviewPage::distinct(10).with(|s| s.inert.extend(SORT_ACTIONS));
    let mut handle = page.clone();
    let orchestrator = orchestrator();
    let result = orchestrator
        .collect(&mut handle, &page, config(10))
        .await
        .unwrap();

    assert_eq!(result.phases.len(), 3);
    for phase in &result.phases {
        assert!(!phase.sorted);
        assert_eq!(phase.requested_target, 10);
        assert_eq!(phase.target, 5);
        assert_eq!(phase.navigation_attempts, 3);
        assert!(phase.navigation_error.is_some());
        assert_eq!(phase.stopped_reason, StopReason::TargetReached);
        assert!(phase.success);
    }
    // Every unsorted pass sees the same list.
    assert_eq!(result.total_collected, 10);
    assert_eq!(result.duplicates_removed, 20);

    let entries = orchestrator.diagnostics().entries_for(&result.session_id).await;
    let failures = entries
        .iter()
        .filter(|e| e.payload["event"] == "navigation_failed")
        .count();
    assert_eq!(failures, 3);
    assert!(entries
        .iter()
        .filter(|e| e.payload["event"] == "navigation_failed")
        .all(|e| e.priority == Priority::High));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_keeps_completed_work() {
    let page = ReviewPage::distinct(40).with(|s| {
        s.initial_visible = 4;
        s.per_load = 2;
        s.load_delay = Duration::from_secs(2);
    });
    let mut handle = page.clone();
    let mut cfg = config(40);
    cfg.timeouts.total_collection = 3_000;

    let result = orchestrator().collect(&mut handle, &page, cfg).await.unwrap();

    assert!(result.deadline_hit);
    assert_eq!(result.skipped_phases, vec![SortKey::Worst, SortKey::Best]);
    assert_eq!(result.phases.len(), 1);
    let recent = &result.phases[0];
    assert_eq!(recent.stopped_reason, StopReason::Timeout);
    assert!(recent.collected >= 4);
    assert_eq!(result.total_collected, recent.collected);
    assert_eq!(result.final_state, CollectionState::Complete);
    assert!(!result.fully_successful());
    assert_eq!(page.released(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_total_is_sum_of_phases_minus_duplicates() {
    let recent = reviews("recent", 10);
    let mut best = reviews("best", 5);
    best.extend(recent[..5].iter().cloned());
    let pools = HashMap::from([
        (SortKey::Recent, recent),
        (SortKey::Worst, reviews("worst", 10)),
        (SortKey::Best, best),
    ]);
    let page = ReviewPage::with_pools(pools, 10);
    let mut handle = page.clone();

    let result = orchestrator()
        .collect(&mut handle, &page, config(10))
        .await
        .unwrap();

    let phase_sum: usize = result.phases.iter().map(|p| p.collected).sum();
    assert_eq!(result.raw_collected, phase_sum);
    assert_eq!(result.total_collected + result.duplicates_removed, phase_sum);
    assert_eq!(result.total_collected, 25);
    assert_eq!(result.duplicates_removed, 5);
    // First sighting wins.
    assert!(result
        .items
        .iter()
        .filter(|i| i.author.starts_with("recent"))
        .all(|i| i.phase == Some(SortKey::Recent)));
}

#[tokio::test(start_paused = true)]
async fn test_critical_memory_cleanup_survives_failing_callback() {
    let page = ReviewPage::distinct(10);
    let mut handle = page.clone();
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);

    let orchestrator = CollectionOrchestrator::new()
        .with_probe(FixedProbe::mib(600))
        .with_cleanup_callback(
            "flaky",
            Arc::new(|| -> BoxFuture<'static, Result<()>> {
                Box::pin(async { anyhow::bail!("cache handle already closed") })
            }),
        )
        .with_cleanup_callback(
            "counter",
            Arc::new(move || -> BoxFuture<'static, Result<()>> {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

    let result = orchestrator
        .collect(&mut handle, &page, config(10))
        .await
        .unwrap();

    let memory = result.memory.expect("memory stats");
    assert!(memory.critical_events >= 1);
    assert!(memory.forced_cleanups >= 1);
    assert!(!memory.monitoring);
    let report = memory.last_cleanup.expect("cleanup report");
    assert!(report.success);
    assert_eq!(report.callbacks_run, 2);
    assert!(report.callback_errors.iter().any(|e| e.starts_with("flaky")));
    assert!(ran.load(Ordering::SeqCst) >= 1);
    // The run itself is unaffected.
    assert_eq!(result.total_collected, 30);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_phase_keeps_earlier_items() {
    let page = ReviewPage::distinct(10).with(|s| s.panic_on_sort = Some(SortKey::Worst));
    let mut handle = page.clone();
    let orchestrator = orchestrator();

    let result = orchestrator
        .collect(&mut handle, &page, config(10))
        .await
        .unwrap();

    assert_eq!(result.final_state, CollectionState::Error);
    assert_eq!(result.phases.len(), 3);
    assert_eq!(result.phases[0].stopped_reason, StopReason::TargetReached);
    assert_eq!(result.phases[1].phase, SortKey::Worst);
    assert_eq!(result.phases[1].stopped_reason, StopReason::Error);
    // later phases still run after a panic
    assert_eq!(result.phases[2].phase, SortKey::Best);
    assert_eq!(result.phases[2].stopped_reason, StopReason::TargetReached);
    assert!(result.skipped_phases.is_empty());
    assert_eq!(result.total_collected, 20);
    assert!(result.error.as_deref().unwrap_or_default().contains("vanished"));
    assert_eq!(page.released(), 1);

    let entries = orchestrator.diagnostics().entries_for(&result.session_id).await;
    assert!(entries
        .iter()
        .any(|e| e.priority == Priority::Critical && e.payload["event"] == "phase_panic"));
}

#[tokio::test(start_paused = true)]
async fn test_slow_extraction_is_cut_at_the_total_deadline() {
    let page = ReviewPage::distinct(10).with(|s| s.extract_delay = Duration::from_secs(15));
    let mut handle = page.clone();
    let mut cfg = config(10);
    cfg.timeouts.total_collection = 3_000;

    let result = orchestrator().collect(&mut handle, &page, cfg).await.unwrap();

    assert!(result.deadline_hit);
    assert!(result.elapsed_ms <= 3_100, "ran {}ms", result.elapsed_ms);
    assert_eq!(result.phases.len(), 1);
    assert_eq!(result.phases[0].stopped_reason, StopReason::Timeout);
    assert_eq!(result.skipped_phases, vec![SortKey::Worst, SortKey::Best]);
    assert_eq!(page.released(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stuck_cleanup_callback_does_not_hang_the_run() {
    let page = ReviewPage::distinct(20).with(|s| s.initial_visible = 10);
    let mut handle = page.clone();
    let mut cfg = config(20);
    cfg.performance.batch_size = 1;

    let orchestrator = orchestrator().with_cleanup_callback(
        "stuck",
        Arc::new(|| -> BoxFuture<'static, Result<()>> {
            Box::pin(futures::future::pending::<Result<()>>())
        }),
    );
    let result = tokio::time::timeout(
        Duration::from_secs(300),
        orchestrator.collect(&mut handle, &page, cfg),
    )
    .await
    .expect("run finishes")
    .unwrap();

    assert_eq!(result.final_state, CollectionState::Complete);
    assert_eq!(result.total_collected, 60);
    let memory = result.memory.expect("memory stats");
    assert!(memory.cleanups >= 3);
    assert!(!memory.monitoring);
    let report = memory.last_cleanup.expect("cleanup report");
    assert!(report.callback_errors[0].starts_with("stuck: timed out"));
    assert_eq!(page.released(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_run_skips_phases_and_releases() {
    let page = ReviewPage::distinct(10);
    let mut handle = page.clone();
    let token = CancellationToken::new();
    token.cancel();

    let result = orchestrator()
        .with_cancellation(token)
        .collect(&mut handle, &page, config(10))
        .await
        .unwrap();

    assert!(result.cancelled);
    assert!(result.phases.is_empty());
    assert_eq!(result.skipped_phases, SortKey::ALL.to_vec());
    assert_eq!(result.total_collected, 0);
    assert_eq!(result.final_state, CollectionState::Complete);
    assert_eq!(page.released(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_config_is_rejected_before_running() {
    let page = ReviewPage::distinct(10);
    let mut handle = page.clone();
    let orchestrator = orchestrator();
    let mut cfg = config(10);
    cfg.targets.worst = 0;

    let err = orchestrator.collect(&mut handle, &page, cfg).await.unwrap_err();

    assert!(matches!(err, HarvestError::InvalidConfig(_)));
    assert!(orchestrator.active_sessions().is_empty());
    assert_eq!(page.released(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_progress_stream_and_session_cleanup() {
    let page = ReviewPage::distinct(10);
    let mut handle = page.clone();
    let orchestrator = orchestrator();

    let session = orchestrator.begin(config(10)).unwrap();
    let id = session.id().to_string();
    assert!(id.starts_with("collect_"));
    assert_eq!(orchestrator.active_sessions().len(), 1);
    let mut rx = orchestrator.subscribe(&id);

    let result = orchestrator.run(session, &mut handle, &page).await;

    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
    assert!(matches!(
        events.first().map(|e| &e.event),
        Some(ProgressEventKind::PhaseStarted {
            phase: SortKey::Recent,
            target: 10
        })
    ));
    assert!(matches!(
        events.last().map(|e| &e.event),
        Some(ProgressEventKind::CollectionComplete {
            total_collected: 30,
            ..
        })
    ));
    let completed: Vec<SortKey> = events
        .iter()
        .filter_map(|e| match e.event {
            ProgressEventKind::PhaseCompleted { phase, .. } => Some(phase),
            _ => None,
        })
        .collect();
    assert_eq!(completed, SortKey::ALL.to_vec());

    assert_eq!(result.session_id, id);
    assert!(orchestrator.active_sessions().is_empty());
    assert!(orchestrator.session(&id).is_none());
    assert_eq!(orchestrator.progress_hub().open_channels(), 0);
    assert!(orchestrator.memory_stats(&id).await.is_none());
    // Diagnostics outlive the session until their TTL expires.
    assert!(!orchestrator.diagnostics().entries_for(&id).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_result_serializes_in_camel_case() {
    let page = ReviewPage::distinct(10);
    let mut handle = page.clone();
    let result = orchestrator()
        .collect(&mut handle, &page, config(10))
        .await
        .unwrap();

    let value = serde_json::to_value(&result).unwrap();
    assert_json_include!(
        actual: value,
        expected: json!({
            "totalCollected": 30,
            "rawCollected": 30,
            "duplicatesRemoved": 0,
            "dedupDegraded": false,
            "deadlineHit": false,
            "cancelled": false,
            "skippedPhases": [],
            "finalState": { "state": "complete" },
            "phases": [
                {
                    "phase": "recent",
                    "stoppedReason": "target-reached",
                    "sorted": true,
                    "navigationMethod": "direct_interaction",
                    "navigationConfidence": "confirmed"
                },
                { "phase": "worst" },
                { "phase": "best" }
            ]
        })
    );
}
