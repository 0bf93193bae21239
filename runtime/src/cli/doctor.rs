// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Environment readiness check.

use crate::cli::output::{self, Styled};
use crate::config::CollectionConfig;
use crate::memory::{ProcessProbe, ResourceProbe};
use crate::surface::chromium::find_chromium;
use anyhow::Result;
use std::path::PathBuf;

/// Check Chromium availability, memory probing, and the configuration.
pub async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let chromium = find_chromium();
    let usage = ProcessProbe.sample();
    let config = CollectionConfig::load(config_path.as_deref());

    if output::is_json() {
        output::print_json(&serde_json::json!({
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "chromium": chromium.as_ref().map(|p| p.display().to_string()),
            "residentBytes": usage.as_ref().ok().map(|u| u.resident_bytes),
            "config": match &config {
                Ok(_) => serde_json::Value::String("ok".into()),
                Err(e) => serde_json::Value::String(e.to_string()),
            },
            "ready": chromium.is_some() && config.is_ok(),
        }));
        return Ok(());
    }

    let s = Styled::new();
    println!("Harvest Doctor");
    println!("==============");
    println!();
    println!("OS:   {}", std::env::consts::OS);
    println!("Arch: {}", std::env::consts::ARCH);
    println!();

    match &chromium {
        Some(path) => println!("{} Chromium found: {}", s.ok_sym(), path.display()),
        None => println!(
            "{} Chromium NOT found. Install Chrome or set HARVEST_CHROMIUM_PATH.",
            s.warn_sym()
        ),
    }

    match &usage {
        Ok(u) => println!(
            "{} Memory probe: {}MB resident",
            s.ok_sym(),
            u.resident_bytes / 1_048_576
        ),
        Err(e) => println!(
            "{} Memory probe unavailable ({e}); memory management will only react to explicit cleanup",
            s.warn_sym()
        ),
    }

    match &config {
        Ok(c) => println!(
            "{} Config valid: targets {}/{}/{}, budget {}ms",
            s.ok_sym(),
            c.targets.recent,
            c.targets.worst,
            c.targets.best,
            c.timeouts.total_collection
        ),
        Err(e) => println!("{} Config invalid: {e}", s.fail_sym()),
    }

    println!();
    if chromium.is_some() && config.is_ok() {
        println!("Status: READY");
    } else {
        println!("Status: NOT READY");
    }
    Ok(())
}
