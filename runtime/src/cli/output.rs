// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Terminal output helpers shared by the subcommands.
//!
//! Global flags are exported by `main` as `HARVEST_*` environment variables
//! so every command can check them without threading arguments through.

use crate::orchestrator::CollectionResult;
use crate::pagination::StopReason;
use serde::Serialize;
use std::io::IsTerminal;

pub fn is_json() -> bool {
    flag("HARVEST_JSON")
}

pub fn is_quiet() -> bool {
    flag("HARVEST_QUIET")
}

fn flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "1").unwrap_or(false)
}

/// Print a value as pretty JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("  failed to serialize output: {e}"),
    }
}

/// Status symbols, colored when stderr is a terminal.
pub struct Styled {
    color: bool,
}

impl Default for Styled {
    fn default() -> Self {
        Self::new()
    }
}

impl Styled {
    pub fn new() -> Self {
        let color = !flag("HARVEST_NO_COLOR")
            && std::env::var_os("NO_COLOR").is_none()
            && std::io::stderr().is_terminal();
        Self { color }
    }

    fn paint(&self, code: &str, text: &str) -> String {
        if self.color {
            format!("\x1b[{code}m{text}\x1b[0m")
        } else {
            text.to_string()
        }
    }

    pub fn ok_sym(&self) -> String {
        self.paint("32", "[OK]")
    }

    pub fn warn_sym(&self) -> String {
        self.paint("33", "[!!]")
    }

    pub fn fail_sym(&self) -> String {
        self.paint("31", "[XX]")
    }

    pub fn bold(&self, text: &str) -> String {
        self.paint("1", text)
    }
}

/// Human-readable run summary on stderr.
pub fn print_summary(result: &CollectionResult) {
    let s = Styled::new();
    eprintln!();
    eprintln!(
        "  {} {} item(s) collected ({} duplicate(s) removed) in {:.1}s",
        s.bold("Harvest"),
        result.total_collected,
        result.duplicates_removed,
        result.elapsed_ms as f64 / 1000.0
    );
    for phase in &result.phases {
        let sym = match phase.stopped_reason {
            StopReason::TargetReached => s.ok_sym(),
            StopReason::Error => s.fail_sym(),
            _ => s.warn_sym(),
        };
        let ordering = if phase.sorted { "sorted" } else { "unsorted" };
        eprintln!(
            "  {sym} {:<7} {:>4}/{:<4} {:<16} {ordering}",
            phase.phase.as_str(),
            phase.collected,
            phase.target,
            phase.stopped_reason.to_string()
        );
        if let Some(err) = &phase.error {
            eprintln!("           {err}");
        }
    }
    for phase in &result.skipped_phases {
        eprintln!("  {} {:<7} skipped", s.warn_sym(), phase.as_str());
    }
    if result.deadline_hit {
        eprintln!("  {} total time budget exhausted", s.warn_sym());
    }
    if result.dedup_degraded {
        eprintln!("  {} deduplication failed; output may contain duplicates", s.warn_sym());
    }
    if let Some(err) = &result.error {
        eprintln!("  {} {err}", s.fail_sym());
    }
}
