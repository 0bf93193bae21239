// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! CLI subcommand implementations for the `harvest` binary.

pub mod collect_cmd;
pub mod doctor;
pub mod output;
