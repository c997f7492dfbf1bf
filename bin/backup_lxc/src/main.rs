// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Lifecycle wrapper around the backup engine for LXC containers: stop the
//! container, back it up, start it again.

mod lxc;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use backup::{BackupRequest, Strategy};
use clap::Parser;
use cliutil::{cli_main, LoggingConfig};
use hostpath::HostPath;
use regex::Regex;

use crate::lxc::ContainerState;

#[derive(Parser, Debug)]
#[command(
    name = "backup_lxc",
    version,
    about = "Backup of LXC containers through the backup engine."
)]
struct Cli {
    /// The base directory holding the LXC containers.
    #[arg(long = "base-dir", short = 'b', required = true, value_name = "PATH")]
    base_dir: String,

    /// The destination directory the backups are written to.
    #[arg(long = "dest-dir", short = 'd', default_value = ".", value_name = "PATH")]
    dest_dir: String,

    /// The name of a single container to back up.
    #[arg(long, short = 'n', value_name = "NAME")]
    name: Option<String>,

    /// Back up all containers in the base directory.
    #[arg(long = "all-containers")]
    all_containers: bool,

    /// Back up only containers that are currently running.
    #[arg(long = "only-running-containers")]
    only_running_containers: bool,

    /// Back up only containers that are currently stopped.
    #[arg(long = "only-stopped-containers")]
    only_stopped_containers: bool,

    /// Container names to exclude, as anchored shell wildcards. Can be
    /// given multiple times.
    #[arg(long, short = 'e', value_name = "PATTERN")]
    exclude: Vec<String>,

    /// Do not stop running containers before backing them up.
    #[arg(long = "no-enforce-stop", short = 's')]
    no_enforce_stop: bool,

    /// The backup strategy to use. Supported values are 1, 2, 3 and 4.
    #[arg(long, default_value_t = 1, value_name = "NUM")]
    strategy: u8,

    /// Writes the log to this file in addition to the console.
    #[arg(long = "log-file", short = 'l', value_name = "FILENAME")]
    log_file: Option<PathBuf>,

    /// Suppresses all console output.
    #[arg(long)]
    quiet: bool,

    /// Only log the actions this run would take.
    #[arg(long = "dry-run")]
    dry_run: bool,
}

struct WrapperConfig {
    base_dir: String,
    dest_dir: String,
    strategy: Strategy,
    excludes: Vec<Regex>,
    only_running: bool,
    only_stopped: bool,
    enforce_stop: bool,
}

/// Translates an anchored shell wildcard into a regular expression; a
/// container is excluded when any pattern matches its whole name.
fn compile_excludes(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            let anchored = format!("^{}$", regex::escape(pattern).replace("\\*", ".*"));
            Regex::new(&anchored).with_context(|| format!("bad exclude pattern {:?}", pattern))
        })
        .collect()
}

fn is_excluded(excludes: &[Regex], name: &str) -> bool {
    excludes.iter().any(|pattern| pattern.is_match(name))
}

/// Carries one container through the stop, backup, restart cycle. Returns
/// whether the container counts as successfully backed up; errors from the
/// engine are contained here so the restart duty is preserved.
fn backup_container(config: &WrapperConfig, name: &str) -> Result<bool> {
    tracing::info!("backing up LXC container '{}'", name);

    if is_excluded(&config.excludes, name) {
        tracing::info!("container '{}' is excluded from the backup", name);
        return Ok(true);
    }

    let state = lxc::state(&config.base_dir, name)?;
    tracing::info!("the current state of container '{}' is '{}'", name, state);

    if config.only_running && state != ContainerState::Running {
        tracing::error!(
            "only running containers are backed up; skipping container '{}'",
            name
        );
        return Ok(false);
    }
    if config.only_stopped && state != ContainerState::Stopped {
        tracing::error!(
            "only stopped containers are backed up; skipping container '{}'",
            name
        );
        return Ok(false);
    }

    let mut stopped_by_us = false;
    if config.enforce_stop && state == ContainerState::Running {
        let code = lxc::stop(&config.base_dir, name)?;
        if code != 0 {
            tracing::error!(
                "stopping container '{}' failed with exit code {}",
                name,
                code
            );
            return Ok(false);
        }
        stopped_by_us = true;
    }

    // Check the state once more: the backup only runs against a container
    // that really is stopped.
    let state = lxc::state(&config.base_dir, name)?;
    if config.enforce_stop && state != ContainerState::Stopped {
        tracing::error!(
            "container '{}' is not in the correct state for a backup (current state '{}')",
            name,
            state
        );
        return Ok(false);
    }

    let mut succeeded = true;
    let source = HostPath::local(config.base_dir.as_str()).join(name);
    let request = BackupRequest {
        host_name: name.to_string(),
        sources: vec![source.as_str().to_string()],
        destination: config.dest_dir.clone(),
        strategy: config.strategy,
        excludes: vec![],
        one_fs: true,
        ignore_errors: false,
        days_off: 1,
        prune_snapshots: false,
    };
    if let Err(error) = backup::backup(&request) {
        tracing::error!("backing up container '{}' failed: {:?}", name, error);
        succeeded = false;
    }

    if stopped_by_us {
        let code = lxc::start(&config.base_dir, name)?;
        if code != 0 {
            tracing::error!(
                "starting container '{}' failed with exit code {}",
                name,
                code
            );
            succeeded = false;
        }
    }

    Ok(succeeded)
}

fn backup_all_containers(config: &WrapperConfig) -> Result<bool> {
    let base = HostPath::local(config.base_dir.as_str());
    let mut succeeded = true;
    for container in base.glob(Some("*/"))? {
        succeeded &= backup_container(config, container.file_name())?;
    }
    Ok(succeeded)
}

fn do_main(args: Cli) -> Result<()> {
    machine::set_dry_run(args.dry_run);

    if args.name.is_none()
        && !(args.all_containers || args.only_running_containers || args.only_stopped_containers)
    {
        bail!("either --name or one of the --all-containers options is required");
    }

    // --only-stopped-containers wins over --only-running-containers, and a
    // stopped-only run never needs to stop anything itself.
    let only_stopped = args.only_stopped_containers;
    let only_running = args.only_running_containers && !only_stopped;
    let enforce_stop = !args.no_enforce_stop && !only_stopped;

    let config = WrapperConfig {
        base_dir: args.base_dir,
        dest_dir: args.dest_dir,
        strategy: Strategy::try_from(args.strategy)?,
        excludes: compile_excludes(&args.exclude)?,
        only_running,
        only_stopped,
        enforce_stop,
    };

    let succeeded = match &args.name {
        Some(name) => backup_container(&config, name)?,
        None => backup_all_containers(&config)?,
    };
    if !succeeded {
        bail!("the backup failed for at least one container");
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Cli::parse();
    let logging = LoggingConfig::new(args.log_file.clone(), args.quiet);
    cli_main(move || do_main(args), logging)
}
