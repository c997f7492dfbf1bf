// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The strategy orchestrator: carries one backup run for one host to
//! completion and invokes the retention planner where the strategy keeps a
//! time-indexed history.

mod strategies;

use anyhow::Result;
use chrono::Local;
use hostpath::HostPath;

#[derive(thiserror::Error, Debug)]
pub enum BackupError {
    #[error("unknown backup strategy {0}")]
    BadStrategy(u8),
    #[error("backup strategy {0} is not implemented")]
    Unsupported(Strategy),
    #[error("{0}")]
    FsPrecondition(String),
    #[error("{command} failed with exit code {code}")]
    ProcessFailed { command: String, code: i32 },
}

/// The closed set of archival strategies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// One gzipped archive file per run.
    Tarball,
    /// Differential mirror of the sources, overwritten in place.
    Mirror,
    /// Writable btrfs snapshot chained off the previous run, refreshed by a
    /// mirror pass.
    Snapshot,
    /// Reserved: send the delta between read-only snapshots.
    DeltaSend,
}

impl TryFrom<u8> for Strategy {
    type Error = BackupError;

    fn try_from(number: u8) -> Result<Self, BackupError> {
        match number {
            1 => Ok(Strategy::Tarball),
            2 => Ok(Strategy::Mirror),
            3 => Ok(Strategy::Snapshot),
            4 => Ok(Strategy::DeltaSend),
            other => Err(BackupError::BadStrategy(other)),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let number = match self {
            Strategy::Tarball => 1,
            Strategy::Mirror => 2,
            Strategy::Snapshot => 3,
            Strategy::DeltaSend => 4,
        };
        write!(f, "{}", number)
    }
}

/// One backup run for one host.
#[derive(Clone, Debug)]
pub struct BackupRequest {
    pub host_name: String,
    pub sources: Vec<String>,
    pub destination: String,
    pub strategy: Strategy,
    pub excludes: Vec<String>,
    pub one_fs: bool,
    pub ignore_errors: bool,
    pub days_off: i64,
    /// Opt-in retention pass over snapshot-strategy destinations.
    pub prune_snapshots: bool,
}

/// Runs one backup to completion. Strategy-internal failures propagate to
/// the caller; the container wrapper catches them per container.
pub fn backup(request: &BackupRequest) -> Result<()> {
    tracing::info!(
        "starting backup with strategy '{}' for host '{}'",
        request.strategy,
        request.host_name
    );

    let sources = request
        .sources
        .iter()
        .map(|spec| HostPath::parse(spec))
        .collect::<Result<Vec<_>, _>>()?;
    let destination = HostPath::parse(&request.destination)?;
    let excludes = request
        .excludes
        .iter()
        .map(|spec| HostPath::parse(spec))
        .collect::<Result<Vec<_>, _>>()?;

    // Captured once so every entry the run writes shares one timestamp and
    // the retention planner sees the same clock.
    let stamp = Local::now().naive_local();

    match request.strategy {
        Strategy::Tarball => strategies::tarball(request, &sources, &destination, &excludes, stamp),
        Strategy::Mirror => strategies::mirror(request, &sources, &destination, &excludes),
        Strategy::Snapshot => {
            strategies::snapshot(request, &sources, &destination, &excludes, stamp)
        }
        Strategy::DeltaSend => Err(BackupError::Unsupported(Strategy::DeltaSend).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_numbers_round_trip() {
        assert_eq!(Strategy::try_from(1).unwrap(), Strategy::Tarball);
        assert_eq!(Strategy::try_from(2).unwrap(), Strategy::Mirror);
        assert_eq!(Strategy::try_from(3).unwrap(), Strategy::Snapshot);
        assert_eq!(Strategy::try_from(4).unwrap(), Strategy::DeltaSend);
        assert!(matches!(
            Strategy::try_from(0),
            Err(BackupError::BadStrategy(0))
        ));
        assert!(matches!(
            Strategy::try_from(9),
            Err(BackupError::BadStrategy(9))
        ));
    }

    #[test]
    fn delta_send_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let request = BackupRequest {
            host_name: "web".to_string(),
            sources: vec![dir.path().display().to_string()],
            destination: dir.path().display().to_string(),
            strategy: Strategy::DeltaSend,
            excludes: vec![],
            one_fs: false,
            ignore_errors: false,
            days_off: 1,
            prune_snapshots: false,
        };
        let error = backup(&request).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<BackupError>(),
            Some(BackupError::Unsupported(Strategy::DeltaSend))
        ));
    }
}
