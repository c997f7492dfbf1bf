// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::Layer;

/// The configuration for the logger.
///
/// The console layer writes to stderr and is suppressed by `--quiet`; the
/// file layer appends to the given log file. Both default to `INFO` and
/// honour `RUST_LOG`.
pub struct LoggingConfig {
    pub log_file: Option<PathBuf>,
    pub quiet: bool,
}

impl LoggingConfig {
    pub fn new(log_file: Option<PathBuf>, quiet: bool) -> Self {
        Self { log_file, quiet }
    }

    /// Sets up the global tracing subscriber in accordance with the config.
    pub fn setup(self) -> Result<()> {
        let mut layers = Vec::new();

        if !self.quiet {
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_ansi(true)
                    .with_writer(std::io::stderr)
                    .with_filter(env_filter()?)
                    .boxed(),
            );
        }

        if let Some(log_file) = self.log_file {
            let f = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
                .with_context(|| format!("Failed to open log file {log_file:?}"))?;
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(f)
                    .with_filter(env_filter()?)
                    .boxed(),
            );
        }

        tracing_subscriber::registry().with(layers).try_init().context(
            "Failed to start logging. You probably already have a log \
                subscriber running.",
        )?;
        Ok(())
    }
}

fn env_filter() -> Result<EnvFilter> {
    Ok(EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Only one test may install the global subscriber, so file logging and
    // quiet mode are exercised together.
    #[test]
    fn setup_logging_writes_to_the_log_file() -> Result<()> {
        const INFO_MESSAGE: &str = "log at level info";
        const DEBUG_MESSAGE: &str = "log at level debug";

        let dir = tempfile::tempdir()?;
        let log_file = dir.path().join("out.log");
        std::env::set_var("RUST_LOG", "INFO");

        LoggingConfig::new(Some(log_file.clone()), true).setup()?;
        tracing::info!("{}", INFO_MESSAGE);
        tracing::debug!("{}", DEBUG_MESSAGE);

        let log_content = std::fs::read_to_string(&log_file)?;
        assert!(
            log_content.contains(INFO_MESSAGE),
            "Unable to find info message in {}",
            log_content
        );
        assert!(
            !log_content.contains(DEBUG_MESSAGE),
            "Found unexpected debug message in {}",
            log_content
        );
        Ok(())
    }
}
