// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Thin wrappers around the LXC administration commands.

use anyhow::Result;
use machine::ExecContext;
use std::str::FromStr;
use strum_macros::EnumString;

/// Stop timeout in seconds. Containers get a long graceful shutdown window
/// before the backup is abandoned.
const STOP_TIMEOUT_SECS: &str = "18000";

/// State of a container as reported by `lxc-info`. The `???` state is
/// opaque: it is neither running nor stopped and never actionable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, strum_macros::Display)]
pub enum ContainerState {
    #[strum(serialize = "RUNNING")]
    Running,
    #[strum(serialize = "STOPPED")]
    Stopped,
    #[strum(serialize = "???")]
    Indeterminate,
    #[strum(serialize = "UNKNOWN")]
    Unknown,
}

/// Queries the state of a container.
pub fn state(base_dir: &str, name: &str) -> Result<ContainerState> {
    let result = machine::run(
        &ExecContext::Local,
        &["lxc-info", "-P", base_dir, "-s", "-H", "-n", name],
    )?;
    let reported = result.stdout.trim();
    Ok(ContainerState::from_str(reported).unwrap_or_else(|_| {
        tracing::warn!("unknown container state returned by lxc-info: '{}'", reported);
        ContainerState::Unknown
    }))
}

/// Gracefully stops a container, waiting up to the stop timeout.
pub fn stop(base_dir: &str, name: &str) -> Result<i32> {
    if machine::dry_run() {
        tracing::info!("dry-run: would stop container '{}'", name);
        return Ok(0);
    }
    Ok(machine::run(
        &ExecContext::Local,
        &[
            "lxc-stop",
            "--nokill",
            "-t",
            STOP_TIMEOUT_SECS,
            "-P",
            base_dir,
            "-n",
            name,
        ],
    )?
    .code)
}

/// Starts a container.
pub fn start(base_dir: &str, name: &str) -> Result<i32> {
    if machine::dry_run() {
        tracing::info!("dry-run: would start container '{}'", name);
        return Ok(0);
    }
    Ok(machine::run(&ExecContext::Local, &["lxc-start", "-P", base_dir, "-n", name])?.code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reported_states() {
        assert_eq!(
            ContainerState::from_str("RUNNING").unwrap(),
            ContainerState::Running
        );
        assert_eq!(
            ContainerState::from_str("STOPPED").unwrap(),
            ContainerState::Stopped
        );
        assert_eq!(
            ContainerState::from_str("???").unwrap(),
            ContainerState::Indeterminate
        );
        assert!(ContainerState::from_str("FROZEN?").is_err());
    }

    #[test]
    fn states_render_as_reported() {
        assert_eq!(ContainerState::Running.to_string(), "RUNNING");
        assert_eq!(ContainerState::Indeterminate.to_string(), "???");
    }
}
