// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Harvest runtime library: resilient multi-phase review collection.
//!
//! A collection run walks a live content surface through the `recent`,
//! `worst` and `best` sort orders, loads items incrementally under each,
//! and merges everything into one deduplicated result. Failures degrade
//! the run instead of aborting it.

pub mod cli;
pub mod config;
pub mod error;
pub mod item;
pub mod logging;
pub mod memory;
pub mod orchestrator;
pub mod pagination;
pub mod progress;
pub mod resilience;
pub mod sort;
pub mod surface;

pub use config::CollectionConfig;
pub use error::HarvestError;
pub use item::{Item, SortKey};
pub use orchestrator::{CollectionOrchestrator, CollectionResult, PhaseResult};
