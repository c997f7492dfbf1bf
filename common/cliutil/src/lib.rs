// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Provides functions common to the backup CLI programs.

use itertools::Itertools;
use std::{
    ffi::OsStr,
    fmt::Debug,
    process::{ExitCode, Termination},
};

use anyhow::Result;

mod logging;

pub use crate::logging::LoggingConfig;

/// Wraps a CLI main function to provide the common startup/cleanup logic:
/// logging setup, interrupt registration, startup reporting and mapping the
/// top-level [`Result`] onto the process exit code.
pub fn cli_main<F, T, E>(main: F, logging: LoggingConfig) -> ExitCode
where
    F: FnOnce() -> Result<T, E>,
    T: Termination,
    E: Debug,
{
    if let Err(error) = logging.setup() {
        eprintln!("FATAL: {}: {:?}", get_current_process_name(), error);
        return ExitCode::FAILURE;
    }
    if let Err(error) = machine::register_interrupt_flag() {
        eprintln!("FATAL: {}: {:?}", get_current_process_name(), error);
        return ExitCode::FAILURE;
    }
    log_current_command_line();
    log_current_user();

    handle_top_level_result(main())
}

/// Logs the command line of the current process.
///
/// You don't need this function if you use [`cli_main`] because it calls
/// this function for you.
pub fn log_current_command_line() {
    let escaped_command = std::env::args()
        .map(|s| shell_escape::escape(s.into()))
        .join(" ");
    tracing::info!("COMMAND: {}", escaped_command);
}

/// Logs the invoking user's name and uid.
pub fn log_current_user() {
    let name = users::get_current_username()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "__unknown__".to_string());
    tracing::debug!(
        "current user of this process is: '{} ({})'",
        name,
        users::get_current_uid()
    );
}

/// Handles the top-level [`Result`] and returns the [`ExitCode`] to report.
///
/// You don't need this function if you use [`cli_main`].
pub fn handle_top_level_result<T: Termination, E: Debug>(result: Result<T, E>) -> ExitCode {
    match result {
        Err(error) => {
            eprintln!("FATAL: {}: {:?}", get_current_process_name(), error);
            ExitCode::FAILURE
        }
        Ok(value) => value.report(),
    }
}

/// Returns the current process name, or `__unknown__` if it failed to get
/// one.
fn get_current_process_name() -> String {
    let current_exe = std::env::current_exe().unwrap_or_default();
    current_exe
        .file_name()
        .unwrap_or(OsStr::new("__unknown__"))
        .to_string_lossy()
        .into_owned()
}
