// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! `tracing` output for unit and end-to-end tests.

#![forbid(unsafe_code)]

use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

/// Routes `tracing` events to the test harness's captured output, once per
/// process.
///
/// Honors `RUST_LOG` when set, otherwise logs at debug level.
pub fn init() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let targets = if let Ok(var) = std::env::var("RUST_LOG") {
            var.parse().unwrap()
        } else {
            Targets::new().with_default(LevelFilter::DEBUG)
        };
        tracing_subscriber::fmt()
            .with_ansi(false)
            .log_internal_errors(true)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .finish()
            .with(targets)
            .init();
    });
}
