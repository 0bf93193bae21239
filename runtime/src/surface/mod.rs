// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Content surface abstraction.
//!
//! Defines the `ContentHandle` and `ItemExtractor` traits the engine drives.
//! The engine never knows how a control is located or clicked; it asks the
//! handle to perform a named [`SurfaceAction`] and reads the outcome.

pub mod chromium;
pub mod profile;

use crate::item::{Item, SortKey};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A query selecting items on the surface (a CSS selector for browsers).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator(pub String);

impl Locator {
    pub fn new(selector: impl Into<String>) -> Self {
        Self(selector.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A surface-mutating (or probing) action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SurfaceAction {
    /// Find and activate the control for an ordering.
    ActivateSortControl { key: SortKey },
    /// Load a different address in the same surface.
    Navigate { url: String },
    /// Reach the ordering control with keyboard focus and key presses.
    KeyboardSort { key: SortKey },
    /// Scroll until the ordering control is in view.
    RevealSortControl,
    /// Open whatever menu or disclosure hides the ordering options.
    ExpandSortMenu,
    /// Try every plausible clickable candidate for the ordering.
    ScanSortCandidates { key: SortKey },
    /// Inspect the first `sample` items for signs of the ordering.
    /// Answers with [`ActionOutcome::Ordering`].
    InspectOrdering { key: SortKey, sample: usize },
    /// Report which load-more affordances exist.
    /// Answers with [`ActionOutcome::Affordance`].
    ProbeLoadMore,
    /// Scroll the item container.
    Scroll {
        distance_px: u32,
        repetitions: u32,
        pause: Duration,
    },
    /// Click the "load more" control.
    ClickLoadMore,
    /// Return the item container to its top.
    ResetScroll,
    /// Close popups, consent banners and other overlays.
    DismissOverlays,
}

impl SurfaceAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ActivateSortControl { .. } => "activate_sort_control",
            Self::Navigate { .. } => "navigate",
            Self::KeyboardSort { .. } => "keyboard_sort",
            Self::RevealSortControl => "reveal_sort_control",
            Self::ExpandSortMenu => "expand_sort_menu",
            Self::ScanSortCandidates { .. } => "scan_sort_candidates",
            Self::InspectOrdering { .. } => "inspect_ordering",
            Self::ProbeLoadMore => "probe_load_more",
            Self::Scroll { .. } => "scroll",
            Self::ClickLoadMore => "click_load_more",
            Self::ResetScroll => "reset_scroll",
            Self::DismissOverlays => "dismiss_overlays",
        }
    }
}

/// Which load-more affordances the surface currently offers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadAffordance {
    pub scrollable: bool,
    pub clickable: bool,
}

/// Result of [`ContentHandle::perform`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionOutcome {
    /// The action ran; `true` when it found something to act on.
    Applied(bool),
    /// Answer to [`SurfaceAction::ProbeLoadMore`].
    Affordance(LoadAffordance),
    /// Answer to [`SurfaceAction::InspectOrdering`]; `None` is inconclusive.
    Ordering(Option<bool>),
}

impl ActionOutcome {
    /// Whether the action found its target.
    pub fn applied(&self) -> bool {
        match self {
            Self::Applied(applied) => *applied,
            Self::Affordance(a) => a.scrollable || a.clickable,
            Self::Ordering(v) => v.unwrap_or(false),
        }
    }
}

/// A single automated content surface. Single-writer: the engine holds it
/// mutably for the whole run.
#[async_trait]
pub trait ContentHandle: Send + Sync {
    /// Current address of the surface.
    async fn current_url(&self) -> Result<String>;
    /// Perform a named action.
    async fn perform(&mut self, action: &SurfaceAction) -> Result<ActionOutcome>;
    /// Number of elements currently matching `locator`.
    async fn count(&self, locator: &Locator) -> Result<usize>;
    /// Release the underlying surface. Called exactly once, at finalization.
    async fn release(&mut self) -> Result<()>;
}

/// Reads the records currently present on the surface.
#[async_trait]
pub trait ItemExtractor: Send + Sync {
    /// Every item currently rendered, in surface order.
    async fn extract(&self) -> Result<Vec<Item>>;
    /// Locator matching one element per item, used for count polling.
    fn item_locator(&self) -> Locator;
}
