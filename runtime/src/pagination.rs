// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Incremental loading until a target count is reached.
//!
//! Each attempt performs a load action, waits for the item count to settle,
//! extracts, and merges into the caller's [`ItemBuffer`]. Scroll distance,
//! pause and repetitions adapt to the last [`ADAPTIVE_WINDOW`] attempts;
//! once the run is large, conservative parameters are forced regardless.

use crate::item::ItemBuffer;
use crate::memory::MemoryGovernor;
use crate::resilience::race;
use crate::surface::{ActionOutcome, ContentHandle, ItemExtractor, Locator, SurfaceAction};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Attempts considered by adaptive tuning.
pub const ADAPTIVE_WINDOW: usize = 5;

/// Total collected items above which conservative parameters are forced.
pub const LARGE_SCALE_THRESHOLD: usize = 500;

/// Consecutive "nothing to act on" attempts without growth before the
/// surface is considered exhausted.
const EXHAUSTED_STREAK: u32 = 2;

const MIN_DISTANCE_PX: u32 = 300;
const MAX_DISTANCE_PX: u32 = 3_000;
const MIN_DELAY: Duration = Duration::from_millis(250);
const MAX_DELAY: Duration = Duration::from_millis(4_000);
const MAX_REPETITIONS: u32 = 5;

const SLOW_RESPONSE: Duration = Duration::from_millis(3_000);
const FAST_RESPONSE: Duration = Duration::from_millis(1_000);

/// Why a pagination loop (and therefore a phase) stopped.
///
/// When several conditions hold at once the earliest variant wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    TargetReached,
    NoMoreContent,
    Timeout,
    Error,
    Stagnation,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::TargetReached => "target-reached",
            Self::NoMoreContent => "no-more-content",
            Self::Timeout => "timeout",
            Self::Error => "error",
            Self::Stagnation => "stagnation",
        })
    }
}

/// Conditions observed when a loop ends.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopFlags {
    pub target_reached: bool,
    pub no_more_content: bool,
    pub timed_out: bool,
    pub errored: bool,
    pub stagnated: bool,
}

impl StopFlags {
    /// Resolve to exactly one reason in fixed priority. With no flag set the
    /// attempt budget ran out, which counts as no more content.
    pub fn resolve(&self) -> StopReason {
        if self.target_reached {
            StopReason::TargetReached
        } else if self.no_more_content {
            StopReason::NoMoreContent
        } else if self.timed_out {
            StopReason::Timeout
        } else if self.errored {
            StopReason::Error
        } else if self.stagnated {
            StopReason::Stagnation
        } else {
            StopReason::NoMoreContent
        }
    }
}

/// The load affordance a surface offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadMode {
    ScrollOnly,
    ClickOnly,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Adjustment {
    SpeedUp,
    SlowDown,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrollParams {
    pub distance_px: u32,
    pub delay: Duration,
    pub repetitions: u32,
}

impl Default for ScrollParams {
    fn default() -> Self {
        Self {
            distance_px: 1_200,
            delay: Duration::from_millis(800),
            repetitions: 2,
        }
    }
}

impl ScrollParams {
    /// Parameters used unconditionally past [`LARGE_SCALE_THRESHOLD`].
    pub const CONSERVATIVE: ScrollParams = ScrollParams {
        distance_px: 600,
        delay: Duration::from_millis(2_500),
        repetitions: 1,
    };

    /// The same parameters pulled into the tuner's bounds.
    pub fn clamped(self) -> Self {
        Self {
            distance_px: self.distance_px.clamp(MIN_DISTANCE_PX, MAX_DISTANCE_PX),
            delay: self.delay.clamp(MIN_DELAY, MAX_DELAY),
            repetitions: self.repetitions.clamp(1, MAX_REPETITIONS),
        }
    }
}

/// `px * num / den` without overflow, clamped to the distance bounds.
fn scale_distance(px: u32, num: u64, den: u64) -> u32 {
    let scaled = u64::from(px) * num / den;
    scaled.clamp(u64::from(MIN_DISTANCE_PX), u64::from(MAX_DISTANCE_PX)) as u32
}

/// One load-and-extract cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationAttempt {
    pub number: u32,
    pub method: LoadMode,
    pub items_before: usize,
    pub items_after: usize,
    pub response_time: Duration,
    pub success: bool,
    pub adjustment: Adjustment,
}

/// Rolling-window tuner for scroll parameters.
#[derive(Debug, Clone)]
pub struct AdaptiveTuner {
    window: VecDeque<(Duration, bool)>,
    params: ScrollParams,
}

impl AdaptiveTuner {
    pub fn new(initial: ScrollParams) -> Self {
        Self {
            window: VecDeque::with_capacity(ADAPTIVE_WINDOW),
            params: initial.clamped(),
        }
    }

    pub fn params(&self) -> ScrollParams {
        self.params
    }

    pub fn record(&mut self, response_time: Duration, success: bool) {
        if self.window.len() == ADAPTIVE_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back((response_time, success));
    }

    fn average_response(&self) -> Duration {
        if self.window.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.window.iter().map(|(d, _)| *d).sum();
        total / self.window.len() as u32
    }

    fn success_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let ok = self.window.iter().filter(|(_, s)| *s).count();
        ok as f64 / self.window.len() as f64
    }

    /// Adjust parameters for the next attempt given the total number of
    /// items collected so far in the run.
    pub fn adjust(&mut self, total_collected: usize) -> Adjustment {
        if total_collected > LARGE_SCALE_THRESHOLD {
            if self.params == ScrollParams::CONSERVATIVE {
                return Adjustment::None;
            }
            debug!("large collection ({total_collected} items); forcing conservative scrolling");
            self.params = ScrollParams::CONSERVATIVE;
            return Adjustment::SlowDown;
        }

        if self.window.len() < 2 {
            return Adjustment::None;
        }

        let avg = self.average_response();
        let rate = self.success_rate();
        let p = self.params;

        if rate < 0.5 || avg > SLOW_RESPONSE {
            self.params = ScrollParams {
                distance_px: scale_distance(p.distance_px, 3, 4),
                delay: p.delay.mul_f64(1.5).min(MAX_DELAY),
                repetitions: p.repetitions.saturating_sub(1).clamp(1, MAX_REPETITIONS),
            };
            Adjustment::SlowDown
        } else if rate >= 0.8 && avg < FAST_RESPONSE {
            self.params = ScrollParams {
                distance_px: scale_distance(p.distance_px, 5, 4),
                delay: p.delay.mul_f64(0.8).max(MIN_DELAY),
                repetitions: p.repetitions.saturating_add(1).min(MAX_REPETITIONS),
            };
            Adjustment::SpeedUp
        } else {
            Adjustment::None
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaginationConfig {
    pub target: usize,
    pub max_attempts: u32,
    /// Base time budget for the loop.
    pub timeout: Duration,
    /// Attempts without growth before giving up.
    pub stagnation_threshold: u32,
    /// Stretch the budget as the target gets close.
    pub progressive_timeout: bool,
    /// Run the memory cleanup hook every N attempts.
    pub cleanup_every: Option<u32>,
    /// Upper bound on waiting for the item count to settle.
    pub stabilize_timeout: Duration,
    pub poll_interval: Duration,
    /// Budget for a single load action or extraction.
    pub action_timeout: Duration,
    pub max_consecutive_errors: u32,
    pub initial_params: ScrollParams,
    /// Items gathered by earlier phases, for the large-scale rule.
    pub already_collected: usize,
    /// Hard stop shared with the rest of the run.
    pub deadline: Option<Instant>,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            target: 100,
            max_attempts: 50,
            timeout: Duration::from_secs(120),
            stagnation_threshold: 5,
            progressive_timeout: true,
            cleanup_every: None,
            stabilize_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(250),
            action_timeout: Duration::from_secs(20),
            max_consecutive_errors: 3,
            initial_params: ScrollParams::default(),
            already_collected: 0,
            deadline: None,
        }
    }
}

impl PaginationConfig {
    /// Loop budget for the current progress: ×1.2 past 50%, ×1.5 past 80%.
    pub fn dynamic_timeout(&self, collected: usize) -> Duration {
        if !self.progressive_timeout || self.target == 0 {
            return self.timeout;
        }
        let progress = collected as f64 / self.target as f64;
        if progress > 0.8 {
            self.timeout.mul_f64(1.5)
        } else if progress > 0.5 {
            self.timeout.mul_f64(1.2)
        } else {
            self.timeout
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationResult {
    pub stopped_reason: StopReason,
    /// Unique items in the buffer when the loop stopped.
    pub collected: usize,
    pub target: usize,
    pub attempts: Vec<PaginationAttempt>,
    pub method: Option<LoadMode>,
    pub elapsed: Duration,
    /// Budget in force when the loop stopped.
    pub timeout_used: Duration,
    pub final_params: ScrollParams,
    pub error: Option<String>,
}

/// Progress callback: `(collected, target)`.
pub type ProgressFn<'a> = &'a (dyn Fn(usize, usize) + Send + Sync);

pub struct PaginationEngine {
    governor: Option<Arc<MemoryGovernor>>,
    cancel: Option<CancellationToken>,
}

impl PaginationEngine {
    pub fn new(governor: Option<Arc<MemoryGovernor>>) -> Self {
        Self {
            governor,
            cancel: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Load and extract until the target, stagnation, exhaustion, an error
    /// streak, or the time budget stops the loop. Items accumulate in
    /// `buffer`, which the caller keeps regardless of outcome.
    pub async fn paginate_for_target(
        &self,
        handle: &mut dyn ContentHandle,
        config: &PaginationConfig,
        extractor: &dyn ItemExtractor,
        buffer: &mut ItemBuffer,
        progress: ProgressFn<'_>,
    ) -> PaginationResult {
        let start = Instant::now();
        let locator = extractor.item_locator();
        let mut flags = StopFlags::default();
        let mut attempts: Vec<PaginationAttempt> = Vec::new();
        let mut last_error: Option<String> = None;
        let mut consecutive_errors = 0u32;
        let mut stagnation = 0u32;
        let mut exhausted_streak = 0u32;
        let mut tuner = AdaptiveTuner::new(config.initial_params);

        match self.step_budget(start, config, 0, config.action_timeout) {
            Some(budget) => match self.extract_into(extractor, buffer, budget).await {
                Ok(added) => debug!("initial extraction found {added} item(s)"),
                Err(e) => {
                    warn!("initial extraction failed: {e:#}");
                    consecutive_errors += 1;
                    last_error = Some(format!("{e:#}"));
                }
            },
            None => flags.timed_out = true,
        }
        progress(buffer.len(), config.target);

        let detected = match self.step_budget(start, config, buffer.len(), config.action_timeout) {
            Some(budget) => Some(self.detect_mode(handle, budget).await),
            None => {
                flags.timed_out = true;
                None
            }
        };
        let mut timeout_used = config.dynamic_timeout(buffer.len());

        loop {
            let Some(mode) = detected else {
                break;
            };
            let collected = buffer.len();
            timeout_used = config.dynamic_timeout(collected);

            if collected >= config.target {
                flags.target_reached = true;
                break;
            }
            if exhausted_streak >= EXHAUSTED_STREAK {
                flags.no_more_content = true;
                break;
            }
            if consecutive_errors >= config.max_consecutive_errors.max(1) {
                flags.errored = true;
                break;
            }
            if stagnation >= config.stagnation_threshold.max(1) {
                flags.stagnated = true;
                break;
            }
            if attempts.len() as u32 >= config.max_attempts {
                break;
            }
            let Some(remaining) = self.remaining(start, timeout_used, config.deadline) else {
                flags.timed_out = true;
                break;
            };
            if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                info!("pagination cancelled with {collected} item(s)");
                flags.timed_out = true;
                break;
            }

            let number = attempts.len() as u32 + 1;
            if let (Some(every), Some(governor)) = (config.cleanup_every, &self.governor) {
                if every > 0 && number % every == 0 {
                    let cleanup = async { Ok::<_, anyhow::Error>(governor.perform_cleanup().await) };
                    match race(cleanup, Some(remaining), self.cancel.as_ref()).await {
                        Ok(report) => debug!(
                            "pagination cleanup hook freed {} byte(s)",
                            report.freed_bytes
                        ),
                        Err(e) => warn!("pagination cleanup hook abandoned: {e:#}"),
                    }
                }
            }

            let Some(action_budget) = self.step_budget(start, config, collected, config.action_timeout)
            else {
                flags.timed_out = true;
                break;
            };
            let adjustment = tuner.adjust(config.already_collected + collected);
            let params = tuner.params();
            let action_start = Instant::now();

            let applied = match race(self.load(handle, mode, params), Some(action_budget), self.cancel.as_ref()).await {
                Ok(applied) => applied,
                Err(e) => {
                    consecutive_errors += 1;
                    last_error = Some(format!("{} failed: {e:#}", load_name(mode)));
                    warn!("pagination attempt {number} load failed: {e:#}");
                    tuner.record(action_start.elapsed(), false);
                    attempts.push(PaginationAttempt {
                        number,
                        method: mode,
                        items_before: collected,
                        items_after: collected,
                        response_time: action_start.elapsed(),
                        success: false,
                        adjustment,
                    });
                    continue;
                }
            };

            let Some(settle_budget) = self.step_budget(start, config, collected, config.stabilize_timeout)
            else {
                flags.timed_out = true;
                break;
            };
            self.wait_for_stable(handle, &locator, config.poll_interval, settle_budget)
                .await;
            let response_time = action_start.elapsed();

            let Some(extract_budget) = self.step_budget(start, config, collected, config.action_timeout)
            else {
                flags.timed_out = true;
                break;
            };
            match self.extract_into(extractor, buffer, extract_budget).await {
                Ok(_) => consecutive_errors = 0,
                Err(e) => {
                    consecutive_errors += 1;
                    last_error = Some(format!("extraction failed: {e:#}"));
                    warn!("pagination attempt {number} extraction failed: {e:#}");
                }
            }

            let after = buffer.len();
            let success = after > collected;
            if success {
                stagnation = 0;
                exhausted_streak = 0;
            } else {
                stagnation += 1;
                if !applied {
                    exhausted_streak += 1;
                }
            }
            tuner.record(response_time, success);

            debug!(
                "pagination attempt {number}: {collected} -> {after} in {}ms ({adjustment:?})",
                response_time.as_millis()
            );
            attempts.push(PaginationAttempt {
                number,
                method: mode,
                items_before: collected,
                items_after: after,
                response_time,
                success,
                adjustment,
            });
            progress(after, config.target);
        }

        if buffer.len() >= config.target {
            flags.target_reached = true;
        }
        let stopped_reason = flags.resolve();
        info!(
            "pagination stopped ({stopped_reason}) with {}/{} item(s) after {} attempt(s)",
            buffer.len(),
            config.target,
            attempts.len()
        );

        PaginationResult {
            stopped_reason,
            collected: buffer.len(),
            target: config.target,
            attempts,
            method: detected,
            elapsed: start.elapsed(),
            timeout_used,
            final_params: tuner.params(),
            error: if stopped_reason == StopReason::Error {
                last_error
            } else {
                None
            },
        }
    }

    /// `cap` trimmed to what the loop budget and the shared deadline leave.
    /// `None` once nothing is left.
    fn step_budget(
        &self,
        start: Instant,
        config: &PaginationConfig,
        collected: usize,
        cap: Duration,
    ) -> Option<Duration> {
        self.remaining(start, config.dynamic_timeout(collected), config.deadline)
            .map(|left| left.min(cap))
    }

    /// Time left before either the loop budget or the shared deadline.
    fn remaining(
        &self,
        start: Instant,
        budget: Duration,
        deadline: Option<Instant>,
    ) -> Option<Duration> {
        let now = Instant::now();
        let mut end = start + budget;
        if let Some(deadline) = deadline {
            end = end.min(deadline);
        }
        let left = end.saturating_duration_since(now);
        (!left.is_zero()).then_some(left)
    }

    async fn extract_into(
        &self,
        extractor: &dyn ItemExtractor,
        buffer: &mut ItemBuffer,
        budget: Duration,
    ) -> Result<usize> {
        let items = race(extractor.extract(), Some(budget), self.cancel.as_ref()).await?;
        Ok(buffer.merge(items))
    }

    async fn detect_mode(&self, handle: &mut dyn ContentHandle, budget: Duration) -> LoadMode {
        let probe = race(
            handle.perform(&SurfaceAction::ProbeLoadMore),
            Some(budget),
            self.cancel.as_ref(),
        )
        .await;
        let mode = match probe {
            Ok(ActionOutcome::Affordance(a)) => match (a.scrollable, a.clickable) {
                (true, true) => LoadMode::Hybrid,
                (false, true) => LoadMode::ClickOnly,
                _ => LoadMode::ScrollOnly,
            },
            Ok(other) => {
                debug!("unexpected probe answer {other:?}; defaulting to scrolling");
                LoadMode::ScrollOnly
            }
            Err(e) => {
                debug!("load affordance probe failed ({e:#}); defaulting to scrolling");
                LoadMode::ScrollOnly
            }
        };
        debug!("load affordance detected: {mode:?}");
        mode
    }

    /// Perform the load action for `mode`. Returns whether anything was
    /// there to act on.
    async fn load(
        &self,
        handle: &mut dyn ContentHandle,
        mode: LoadMode,
        params: ScrollParams,
    ) -> Result<bool> {
        let scroll = SurfaceAction::Scroll {
            distance_px: params.distance_px,
            repetitions: params.repetitions,
            pause: params.delay,
        };
        match mode {
            LoadMode::ScrollOnly => Ok(handle.perform(&scroll).await?.applied()),
            LoadMode::ClickOnly => {
                let clicked = handle.perform(&SurfaceAction::ClickLoadMore).await?.applied();
                tokio::time::sleep(params.delay).await;
                Ok(clicked)
            }
            LoadMode::Hybrid => {
                let scrolled = handle.perform(&scroll).await?.applied();
                let clicked = handle.perform(&SurfaceAction::ClickLoadMore).await?.applied();
                if clicked {
                    tokio::time::sleep(params.delay).await;
                }
                Ok(scrolled || clicked)
            }
        }
    }

    /// Poll the item count until two consecutive polls agree or `budget`
    /// runs out.
    async fn wait_for_stable(
        &self,
        handle: &mut dyn ContentHandle,
        locator: &Locator,
        poll_interval: Duration,
        budget: Duration,
    ) {
        let until = Instant::now() + budget;
        let mut last: Option<usize> = None;
        loop {
            let left = until.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return;
            }
            tokio::time::sleep(poll_interval.min(left)).await;
            let left = until.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return;
            }
            match race(handle.count(locator), Some(left), self.cancel.as_ref()).await {
                Ok(n) if last == Some(n) => return,
                Ok(n) => last = Some(n),
                Err(e) => {
                    debug!("count poll failed: {e:#}");
                    return;
                }
            }
        }
    }
}

fn load_name(mode: LoadMode) -> &'static str {
    match mode {
        LoadMode::ScrollOnly => "scroll",
        LoadMode::ClickOnly => "load-more click",
        LoadMode::Hybrid => "scroll + click",
    }
}
