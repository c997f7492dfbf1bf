// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use backup::{BackupRequest, Strategy};
use clap::Parser;
use cliutil::{cli_main, LoggingConfig};

#[derive(Parser, Debug)]
#[command(name = "btrbak", version, about = "Backup utility for btrfs-backed destinations.")]
struct Cli {
    /// A source directory to back up. Can be given multiple times.
    #[arg(long = "source-dir", short = 's', required = true, value_name = "PATH")]
    source_dirs: Vec<String>,

    /// A directory to exclude from the backup. Can be given multiple times.
    #[arg(long = "exclude-dir", short = 'e', value_name = "PATH")]
    exclude_dirs: Vec<String>,

    /// The destination directory the backups are written to.
    #[arg(long = "dest-dir", short = 'd', default_value = ".", value_name = "PATH")]
    dest_dir: String,

    /// An alternate host name to use instead of the local machine's own.
    #[arg(long, value_name = "NAME")]
    hostname: Option<String>,

    /// The backup strategy to use. Supported values are 1, 2, 3 and 4.
    #[arg(long, default_value_t = 2, value_name = "NUM")]
    strategy: u8,

    /// Days to offset the retention schedule; deletion of backups only
    /// starts after this many days.
    #[arg(long = "days-off", default_value_t = 1, value_name = "NUM")]
    days_off: i64,

    /// Do not let the mirror pass cross filesystem boundaries.
    #[arg(long = "stay-on-fs")]
    stay_on_fs: bool,

    /// Tells the mirror pass to ignore read errors.
    #[arg(long = "ignore-errors")]
    ignore_errors: bool,

    /// Runs the retention pass over snapshot-strategy destinations.
    #[arg(long = "prune-snapshots")]
    prune_snapshots: bool,

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

fn do_main(args: Cli) -> Result<()> {
    machine::set_dry_run(args.dry_run);

    let strategy = Strategy::try_from(args.strategy)?;
    let host_name = match args.hostname {
        Some(name) => name,
        None => fsops::hostname()?,
    };

    backup::backup(&BackupRequest {
        host_name,
        sources: args.source_dirs,
        destination: args.dest_dir,
        strategy,
        excludes: args.exclude_dirs,
        one_fs: args.stay_on_fs,
        ignore_errors: args.ignore_errors,
        days_off: args.days_off,
        prune_snapshots: args.prune_snapshots,
    })
}

fn main() -> ExitCode {
    let args = Cli::parse();
    let logging = LoggingConfig::new(args.log_file.clone(), args.quiet);
    cli_main(move || do_main(args), logging)
}
