// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Drives the surface to a named ordering.
//!
//! Strategies are tried in fixed priority, first success wins:
//!
//! 1. direct interaction with the ordering control
//! 2. address rewrite with a query-parameter hint
//! 3. heuristics: keyboard, scroll-to-reveal, menu expansion, candidate scan
//!
//! After a strategy reports it acted, the ordering is verified. A positive
//! address or item-order signal gives [`Confidence::Confirmed`]; an
//! inconclusive check is accepted as [`Confidence::Assumed`]; a contradicting
//! item order rejects the strategy and the cascade moves on.

use crate::error::{classify, AttemptError, ErrorClass, SurfaceError};
use crate::item::SortKey;
use crate::resilience::{execute_with_retry, execute_with_retry_cancellable, race, RetryConfig};
use crate::surface::{ActionOutcome, ContentHandle, SurfaceAction};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Query-parameter hint used by the address-rewrite strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AddressHint {
    pub param: String,
    pub values: BTreeMap<SortKey, String>,
}

impl Default for AddressHint {
    fn default() -> Self {
        let values = BTreeMap::from([
            (SortKey::Recent, "newest".to_string()),
            (SortKey::Worst, "lowest_rating".to_string()),
            (SortKey::Best, "highest_rating".to_string()),
        ]);
        Self {
            param: "sort".to_string(),
            values,
        }
    }
}

impl AddressHint {
    /// `url` with the ordering parameter set for `key`, or `None` when the
    /// address cannot be parsed or no value is configured.
    pub fn rewrite(&self, url: &str, key: SortKey) -> Option<String> {
        let value = self.values.get(&key)?;
        let mut parsed = Url::parse(url).ok()?;
        let pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .filter(|(k, _)| k != self.param.as_str())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        parsed
            .query_pairs_mut()
            .clear()
            .extend_pairs(pairs)
            .append_pair(&self.param, value);
        Some(parsed.into())
    }

    /// Whether `url` already carries the ordering parameter for `key`.
    pub fn indicates(&self, url: &str, key: SortKey) -> bool {
        let Some(value) = self.values.get(&key) else {
            return false;
        };
        Url::parse(url)
            .map(|u| {
                u.query_pairs()
                    .any(|(k, v)| k == self.param.as_str() && v == value.as_str())
            })
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SortConfig {
    pub address_hint: AddressHint,
    /// Pause after a strategy acts, before verification.
    pub settle_delay: Duration,
    /// Items inspected for structural verification.
    pub verify_sample: usize,
    /// Budget for a single strategy action.
    pub strategy_timeout: Duration,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            address_hint: AddressHint::default(),
            settle_delay: Duration::from_millis(800),
            verify_sample: 5,
            strategy_timeout: Duration::from_secs(10),
        }
    }
}

/// Broad strategy family, used to rank successful attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyTier {
    Heuristic,
    AddressRewrite,
    DirectInteraction,
}

/// The concrete strategy that produced an ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortMethod {
    DirectInteraction,
    AddressRewrite,
    Keyboard,
    ScrollReveal,
    TriggerExpansion,
    CandidateScan,
}

impl SortMethod {
    /// Cascade order.
    pub const CASCADE: [SortMethod; 6] = [
        SortMethod::DirectInteraction,
        SortMethod::AddressRewrite,
        SortMethod::Keyboard,
        SortMethod::ScrollReveal,
        SortMethod::TriggerExpansion,
        SortMethod::CandidateScan,
    ];

    pub fn tier(self) -> StrategyTier {
        match self {
            Self::DirectInteraction => StrategyTier::DirectInteraction,
            Self::AddressRewrite => StrategyTier::AddressRewrite,
            Self::Keyboard | Self::ScrollReveal | Self::TriggerExpansion | Self::CandidateScan => {
                StrategyTier::Heuristic
            }
        }
    }
}

/// How sure the navigator is that the ordering took effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Address or item order positively matched.
    Confirmed,
    /// Nothing contradicted the change, nothing confirmed it either.
    Assumed,
    /// Item order contradicted the requested ordering.
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationResult {
    pub key: SortKey,
    pub success: bool,
    pub method: Option<SortMethod>,
    pub confidence: Option<Confidence>,
    pub elapsed: Duration,
    pub error: Option<String>,
    /// Attempts made by [`SortNavigator::navigate_to_sort_with_retry`].
    pub attempts: u32,
}

impl NavigationResult {
    pub(crate) fn failed(key: SortKey, elapsed: Duration, error: String) -> Self {
        Self {
            key,
            success: false,
            method: None,
            confidence: None,
            elapsed,
            error: Some(error),
            attempts: 1,
        }
    }
}

/// Rank two attempts; `Greater` means `a` is the better one.
///
/// Success beats failure. Among failures the faster one wins (least wasted
/// time). Among successes the more specific strategy wins.
pub fn compare_attempts(a: &NavigationResult, b: &NavigationResult) -> Ordering {
    match (a.success, b.success) {
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.elapsed.cmp(&a.elapsed),
        (true, true) => {
            let tier = |r: &NavigationResult| r.method.map(SortMethod::tier);
            tier(a).cmp(&tier(b))
        }
    }
}

/// Best of a set of attempts per [`compare_attempts`]. Ties keep the earliest.
pub fn best_attempt(attempts: Vec<NavigationResult>) -> Option<NavigationResult> {
    attempts.into_iter().reduce(|best, next| {
        if compare_attempts(&next, &best) == Ordering::Greater {
            next
        } else {
            best
        }
    })
}

pub struct SortNavigator {
    config: SortConfig,
    cancel: Option<CancellationToken>,
}

impl SortNavigator {
    pub fn new(config: SortConfig) -> Self {
        Self {
            config,
            cancel: None,
        }
    }

    /// Add a cancellation branch to every strategy race.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn config(&self) -> &SortConfig {
        &self.config
    }

    /// Run the strategy cascade once.
    pub async fn navigate_to_sort(
        &self,
        handle: &mut dyn ContentHandle,
        key: SortKey,
    ) -> NavigationResult {
        self.run_cascade(handle, key).await.0
    }

    /// One pass over the cascade. A failed pass is [`ErrorClass::Permanent`]
    /// when some strategy errored, every error was permanent, and no
    /// strategy got as far as verification.
    async fn run_cascade(
        &self,
        handle: &mut dyn ContentHandle,
        key: SortKey,
    ) -> (NavigationResult, ErrorClass) {
        let start = Instant::now();
        let mut errors: Vec<String> = Vec::new();
        let mut permanent_only = true;
        let mut acted = false;

        for method in SortMethod::CASCADE {
            match self.try_strategy(handle, key, method).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("sort strategy {method:?} found nothing for {key}");
                    continue;
                }
                Err(e) => {
                    debug!("sort strategy {method:?} failed for {key}: {e:#}");
                    if classify(&e) == ErrorClass::Transient {
                        permanent_only = false;
                    }
                    errors.push(format!("{method:?}: {e:#}"));
                    continue;
                }
            }

            acted = true;
            tokio::time::sleep(self.config.settle_delay).await;

            let confidence = self.verify(handle, key).await;
            if confidence == Confidence::Rejected {
                debug!("sort strategy {method:?} acted but ordering does not match {key}");
                errors.push(format!("{method:?}: ordering rejected by verification"));
                continue;
            }
            if confidence == Confidence::Assumed {
                debug!("ordering {key} via {method:?} could not be confirmed; assuming success");
            }

            let result = NavigationResult {
                key,
                success: true,
                method: Some(method),
                confidence: Some(confidence),
                elapsed: start.elapsed(),
                error: None,
                attempts: 1,
            };
            return (result, ErrorClass::Transient);
        }

        let class = if !errors.is_empty() && permanent_only && !acted {
            ErrorClass::Permanent
        } else {
            ErrorClass::Transient
        };
        let error = if errors.is_empty() {
            format!("no strategy could apply ordering {key}")
        } else {
            errors.join("; ")
        };
        (NavigationResult::failed(key, start.elapsed(), error), class)
    }

    /// Run the cascade through the retry executor, up to
    /// `retry.max_attempts` times, with backoff and recovery between
    /// attempts. Each attempt is raced against `retry.attempt_timeout`; a
    /// timed-out attempt is retried. A pass that failed only on permanent
    /// errors stops the loop. When every attempt fails the best one is
    /// returned.
    pub async fn navigate_to_sort_with_retry(
        &self,
        handle: &mut dyn ContentHandle,
        key: SortKey,
        retry: &RetryConfig,
    ) -> NavigationResult {
        let start = Instant::now();
        let max_attempts = retry.max_attempts.max(1);
        let surface = Mutex::new(handle);
        let history: Mutex<Vec<NavigationResult>> = Mutex::new(Vec::new());
        // Per-attempt timeouts are terminal inside the executor, so the
        // race happens here instead.
        let policy = RetryConfig {
            attempt_timeout: None,
            ..retry.clone()
        };

        let operation = |attempt: u32| {
            let surface = &surface;
            let history = &history;
            async move {
                let mut handle = surface.lock().await;
                if attempt > 1 {
                    self.recover(&mut **handle).await;
                }
                let attempt_start = Instant::now();
                let cascade = async { Ok::<_, anyhow::Error>(self.run_cascade(&mut **handle, key).await) };
                let (result, class) = match race(cascade, retry.attempt_timeout, None).await {
                    Ok(outcome) => outcome,
                    Err(e) => (
                        NavigationResult::failed(key, attempt_start.elapsed(), e.to_string()),
                        ErrorClass::Transient,
                    ),
                };
                if result.success {
                    return Ok(result);
                }

                let message = result
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("ordering {key} not applied"));
                match class {
                    ErrorClass::Transient => {
                        warn!("ordering {key} attempt {attempt}/{max_attempts} failed: {message}")
                    }
                    ErrorClass::Permanent => warn!(
                        "ordering {key} attempt {attempt}/{max_attempts} failed permanently; not retrying: {message}"
                    ),
                }
                history.lock().await.push(result);
                Err(anyhow::Error::new(SurfaceError { class, message }))
            }
        };

        let outcome = match &self.cancel {
            Some(token) => execute_with_retry_cancellable(operation, &policy, token).await,
            None => execute_with_retry(operation, &policy).await,
        };
        let attempts = outcome.attempts;

        match outcome.result {
            Ok(result) => {
                info!(
                    "ordering {key} applied via {:?} on attempt {attempts} ({}ms)",
                    result.method,
                    start.elapsed().as_millis()
                );
                NavigationResult {
                    attempts,
                    elapsed: start.elapsed(),
                    ..result
                }
            }
            Err(err) => {
                let mut best = best_attempt(history.into_inner()).unwrap_or_else(|| {
                    NavigationResult::failed(key, start.elapsed(), err.to_string())
                });
                best.attempts = attempts;
                best
            }
        }
    }

    /// Reset scroll position and dismiss overlays. Failures are ignored.
    async fn recover(&self, handle: &mut dyn ContentHandle) {
        for action in [SurfaceAction::ResetScroll, SurfaceAction::DismissOverlays] {
            if let Err(e) = self.act(handle, &action).await {
                debug!("recovery step {} failed: {e:#}", action.name());
            }
        }
    }

    async fn act(
        &self,
        handle: &mut dyn ContentHandle,
        action: &SurfaceAction,
    ) -> Result<ActionOutcome> {
        race(
            handle.perform(action),
            Some(self.config.strategy_timeout),
            self.cancel.as_ref(),
        )
        .await
        .map_err(AttemptError::into_error)
    }

    async fn try_strategy(
        &self,
        handle: &mut dyn ContentHandle,
        key: SortKey,
        method: SortMethod,
    ) -> Result<bool> {
        match method {
            SortMethod::DirectInteraction => Ok(self
                .act(handle, &SurfaceAction::ActivateSortControl { key })
                .await?
                .applied()),
            SortMethod::AddressRewrite => {
                let current = handle.current_url().await?;
                let Some(target) = self.config.address_hint.rewrite(&current, key) else {
                    return Ok(false);
                };
                if target == current {
                    return Ok(false);
                }
                Ok(self
                    .act(handle, &SurfaceAction::Navigate { url: target })
                    .await?
                    .applied())
            }
            SortMethod::Keyboard => Ok(self
                .act(handle, &SurfaceAction::KeyboardSort { key })
                .await?
                .applied()),
            SortMethod::ScrollReveal => {
                if !self
                    .act(handle, &SurfaceAction::RevealSortControl)
                    .await?
                    .applied()
                {
                    return Ok(false);
                }
                Ok(self
                    .act(handle, &SurfaceAction::ActivateSortControl { key })
                    .await?
                    .applied())
            }
            SortMethod::TriggerExpansion => {
                if !self
                    .act(handle, &SurfaceAction::ExpandSortMenu)
                    .await?
                    .applied()
                {
                    return Ok(false);
                }
                Ok(self
                    .act(handle, &SurfaceAction::ActivateSortControl { key })
                    .await?
                    .applied())
            }
            SortMethod::CandidateScan => Ok(self
                .act(handle, &SurfaceAction::ScanSortCandidates { key })
                .await?
                .applied()),
        }
    }

    async fn verify(&self, handle: &mut dyn ContentHandle, key: SortKey) -> Confidence {
        if let Ok(url) = handle.current_url().await {
            if self.config.address_hint.indicates(&url, key) {
                return Confidence::Confirmed;
            }
        }

        let inspect = SurfaceAction::InspectOrdering {
            key,
            sample: self.config.verify_sample,
        };
        match self.act(handle, &inspect).await {
            Ok(ActionOutcome::Ordering(Some(true))) => Confidence::Confirmed,
            Ok(ActionOutcome::Ordering(Some(false))) => Confidence::Rejected,
            Ok(_) => Confidence::Assumed,
            Err(e) => {
                debug!("ordering inspection failed: {e:#}");
                Confidence::Assumed
            }
        }
    }
}
