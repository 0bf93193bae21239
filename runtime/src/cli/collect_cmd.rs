// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! `harvest collect <url>`: run a full collection against a live page.

use crate::cli::output;
use crate::config::CollectionConfig;
use crate::error::AttemptError;
use crate::item::SortKey;
use crate::memory::diagnostics::DiagnosticStore;
use crate::orchestrator::CollectionOrchestrator;
use crate::progress::{ProgressEventKind, ProgressReceiver};
use crate::resilience::execute_with_progressive_timeout;
use crate::surface::chromium::ChromiumBrowser;
use crate::surface::profile::SurfaceProfile;
use anyhow::{Context, Result};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Growing budgets for opening the page before the run starts.
const OPEN_BUDGETS: [Duration; 3] = [
    Duration::from_secs(15),
    Duration::from_secs(30),
    Duration::from_secs(45),
];

#[derive(Debug, Clone, Default)]
pub struct CollectArgs {
    pub url: String,
    pub config: Option<PathBuf>,
    pub profile: Option<PathBuf>,
    pub recent: Option<usize>,
    pub worst: Option<usize>,
    pub best: Option<usize>,
    /// Total budget in milliseconds.
    pub timeout: Option<u64>,
    pub output: Option<PathBuf>,
    pub no_memory_management: bool,
}

/// Flags override the config file and environment.
fn build_config(args: &CollectArgs) -> Result<CollectionConfig> {
    let mut config = CollectionConfig::load(args.config.as_deref())?;
    if let Some(n) = args.recent {
        config.targets.recent = n;
    }
    if let Some(n) = args.worst {
        config.targets.worst = n;
    }
    if let Some(n) = args.best {
        config.targets.best = n;
    }
    if let Some(ms) = args.timeout {
        config.timeouts.total_collection = ms;
    }
    if args.no_memory_management {
        config.performance.enable_memory_management = false;
    }
    config.validate()?;
    Ok(config)
}

pub async fn run(args: CollectArgs) -> Result<()> {
    let config = build_config(&args)?;
    let profile = match &args.profile {
        Some(path) => SurfaceProfile::from_file(path)?,
        None => SurfaceProfile::default(),
    };
    let profile = Arc::new(profile);

    let browser = ChromiumBrowser::launch().await?;
    let (mut handle, extractor) = execute_with_progressive_timeout(
        |budget| browser.open(&args.url, Arc::clone(&profile), budget),
        &OPEN_BUDGETS,
    )
    .await
    .map_err(AttemptError::into_error)?;

    let cancel = CancellationToken::new();
    let orchestrator = CollectionOrchestrator::new()
        .with_diagnostics(Arc::new(DiagnosticStore::new(config.diagnostics.clone())))
        .with_address_hint(profile.address_hint.clone())
        .with_cancellation(cancel.clone());

    let session = orchestrator.begin(config)?;
    let show_progress = !output::is_json() && !output::is_quiet();
    let renderer = show_progress.then(|| {
        tokio::spawn(render_progress(
            orchestrator.subscribe(session.id()),
            session.config().targets.total(),
        ))
    });

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("  interrupted; finishing with what was collected");
            interrupt.cancel();
        }
    });

    let result = orchestrator.run(session, &mut handle, &extractor).await;

    if let Some(renderer) = renderer {
        let _ = renderer.await;
    }
    if let Err(e) = browser.close().await {
        warn!("closing the browser failed: {e:#}");
    }

    if let Some(path) = &args.output {
        let json = serde_json::to_vec_pretty(&result)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write {}", path.display()))?;
        if !output::is_quiet() && !output::is_json() {
            eprintln!("  wrote {} item(s) to {}", result.total_collected, path.display());
        }
    }

    if output::is_json() {
        output::print_json(&result);
    } else if !output::is_quiet() {
        output::print_summary(&result);
    }
    Ok(())
}

/// One progress bar per phase, driven by the session's event stream.
async fn render_progress(mut rx: ProgressReceiver, total_target: usize) {
    let multi = MultiProgress::new();
    let style = ProgressStyle::with_template("  {prefix:>7} [{bar:30}] {pos:>4}/{len:4} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    let mut bars: HashMap<SortKey, ProgressBar> = HashMap::new();
    let bar_for = |bars: &mut HashMap<SortKey, ProgressBar>, phase: SortKey, len: usize| {
        bars.entry(phase)
            .or_insert_with(|| {
                let bar = multi.add(ProgressBar::new(len as u64));
                bar.set_style(style.clone());
                bar.set_prefix(phase.as_str());
                bar
            })
            .clone()
    };

    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };
        match event.event {
            ProgressEventKind::PhaseStarted { phase, target } => {
                bar_for(&mut bars, phase, target).set_message("navigating");
            }
            ProgressEventKind::PhaseProgress {
                phase,
                current,
                target,
                ..
            } => {
                let bar = bar_for(&mut bars, phase, target);
                bar.set_length(target as u64);
                bar.set_position(current.min(target) as u64);
                bar.set_message("collecting");
            }
            ProgressEventKind::PhaseCompleted {
                phase,
                collected,
                stopped_reason,
                ..
            } => {
                let bar = bar_for(&mut bars, phase, collected);
                bar.set_position(collected.min(bar.length().unwrap_or(0) as usize) as u64);
                bar.finish_with_message(stopped_reason.to_string());
            }
            ProgressEventKind::PhaseSkipped { phase, reason } => {
                bar_for(&mut bars, phase, 0).abandon_with_message(format!("skipped ({reason})"));
            }
            ProgressEventKind::Warning { message } => {
                let _ = multi.println(format!("  warning: {message}"));
            }
            ProgressEventKind::CollectionComplete {
                total_collected, ..
            } => {
                let _ = multi.println(format!(
                    "  {total_collected} unique item(s) of {total_target} requested"
                ));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = CollectArgs {
            url: "https://example.com".into(),
            recent: Some(5),
            best: Some(7),
            timeout: Some(30_000),
            no_memory_management: true,
            ..CollectArgs::default()
        };
        let config = build_config(&args).unwrap();
        assert_eq!(config.targets.recent, 5);
        assert_eq!(config.targets.worst, 100);
        assert_eq!(config.targets.best, 7);
        assert_eq!(config.timeouts.total_collection, 30_000);
        assert!(!config.performance.enable_memory_management);
    }

    #[test]
    fn test_zero_target_flag_is_rejected() {
        let args = CollectArgs {
            worst: Some(0),
            ..CollectArgs::default()
        };
        assert!(build_config(&args).is_err());
    }
}
