// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Tracing subscriber setup for the `harvest` binary.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins over both flags; logs go
/// to stderr so stdout stays clean for results.
pub fn init(verbose: bool, json: bool) {
    let default_directive = if verbose {
        "harvest_runtime=debug,harvest=debug"
    } else {
        "harvest_runtime=info,harvest=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose);

    // A second init (tests, embedding) keeps the first subscriber.
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        tracing::debug!("tracing subscriber already installed: {e}");
    }
}
