// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decides which timestamped snapshots to keep and which to remove.
//!
//! Snapshots are partitioned into tiered buckets walking back from
//! `now - days_off`. Within a bucket, entries collapsing to the same
//! fingerprint keep exactly one representative: the oldest, which stays
//! stable across future runs until it ages out of its bucket. The planner
//! only selects; the orchestrator performs the deletions.

use anyhow::Result;
use chrono::{Duration, NaiveDateTime};
use hostpath::HostPath;
use itertools::Itertools;

/// Timestamp format giving every backup run its unique name. The name is
/// the authoritative creation time; file mtimes are not trusted because
/// transfers can rewrite them.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M";

/// Shell glob matching [`TIMESTAMP_FORMAT`] names.
pub const TIMESTAMP_GLOB: &str =
    "[0-9][0-9][0-9][0-9]-[0-9][0-9]-[0-9][0-9]-[0-9][0-9]-[0-9][0-9]";

/// Suffix carried by archive snapshots.
pub const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// Fingerprint used for entries older than the deepest tier.
const FINAL_FINGERPRINT: &str = "%Y-%m-%d-%H-%S";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl Tier {
    /// Nominal tier width. Month and year are fixed multiples of days so
    /// bucket boundaries stay deterministic.
    fn width(self, count: u32) -> Duration {
        match self {
            Tier::Hour => Duration::hours(count as i64),
            Tier::Day => Duration::days(count as i64),
            Tier::Week => Duration::days(7 * count as i64),
            Tier::Month => Duration::days(30 * count as i64),
            Tier::Year => Duration::days(365 * count as i64),
        }
    }

    /// Format string collapsing timestamps into equivalence classes within
    /// this tier.
    fn fingerprint_format(self) -> &'static str {
        match self {
            Tier::Hour => "%Y-%m-%d-%H",
            Tier::Day => "%Y-%m-%d",
            Tier::Week => "%Y-%W",
            Tier::Month => "%Y-%m",
            Tier::Year => "%Y",
        }
    }
}

/// Ordered list of `(tier, count)` pairs, finest first.
#[derive(Clone, Debug)]
pub struct Schedule(pub Vec<(Tier, u32)>);

impl Default for Schedule {
    fn default() -> Self {
        Schedule(vec![
            (Tier::Day, 14),
            (Tier::Week, 6),
            (Tier::Month, 10),
            (Tier::Year, 10),
        ])
    }
}

/// Parses a snapshot time from a directory or archive basename. Returns
/// `None` for names that do not follow [`TIMESTAMP_FORMAT`].
pub fn parse_entry_time(name: &str) -> Option<NaiveDateTime> {
    let name = name.trim_end_matches('/');
    let name = name.strip_suffix(ARCHIVE_SUFFIX).unwrap_or(name);
    NaiveDateTime::parse_from_str(name, TIMESTAMP_FORMAT).ok()
}

struct Bucket {
    tier: Option<Tier>,
    /// `None` marks the final bucket, unbounded below.
    lower: Option<NaiveDateTime>,
}

fn bucket_bounds(anchor: NaiveDateTime, schedule: &Schedule) -> Vec<Bucket> {
    let mut cursor = anchor;
    let mut buckets = Vec::new();
    for (tier, count) in &schedule.0 {
        cursor -= tier.width(*count);
        buckets.push(Bucket {
            tier: Some(*tier),
            lower: Some(cursor),
        });
    }
    buckets.push(Bucket {
        tier: None,
        lower: None,
    });
    buckets
}

fn fingerprint(tier: Option<Tier>, time: &NaiveDateTime) -> String {
    let format = match tier {
        Some(tier) => tier.fingerprint_format(),
        None => FINAL_FINGERPRINT,
    };
    time.format(format).to_string()
}

/// Selects the entries the schedule no longer retains. Entries newer than
/// `now - days_off` lie inside the grace window and are never selected.
pub fn plan_deletions<T>(
    entries: Vec<(T, NaiveDateTime)>,
    now: NaiveDateTime,
    days_off: i64,
    schedule: &Schedule,
) -> Vec<T> {
    let anchor = now - Duration::days(days_off);
    let mut entries: Vec<(T, NaiveDateTime)> =
        entries.into_iter().filter(|(_, time)| *time < anchor).collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1));

    let buckets = bucket_bounds(anchor, schedule);

    // Walk the descending entries once, advancing the bucket cursor and
    // retrying the same entry whenever it falls below the current lower
    // bound.
    let mut groups: Vec<Vec<(T, NaiveDateTime)>> = Vec::new();
    groups.resize_with(buckets.len(), Vec::new);
    let mut cur = 0;
    for entry in entries {
        while let Some(lower) = buckets[cur].lower {
            if entry.1 >= lower {
                break;
            }
            cur += 1;
        }
        groups[cur].push(entry);
    }

    let mut doomed = Vec::new();
    for (bucket, group) in buckets.iter().zip(groups) {
        let grouped = group
            .into_iter()
            .group_by(|(_, time)| fingerprint(bucket.tier, time));
        for (_, members) in &grouped {
            let members: Vec<(T, NaiveDateTime)> = members.collect();
            let keep = members
                .iter()
                .enumerate()
                .min_by_key(|(_, entry)| entry.1)
                .map(|(i, _)| i);
            for (i, (payload, _)) in members.into_iter().enumerate() {
                if Some(i) != keep {
                    doomed.push(payload);
                }
            }
        }
    }
    doomed
}

/// Globs `dir` for `pattern`, parses snapshot times from basenames and
/// returns the paths the schedule no longer retains. Names that fail to
/// parse are left in place and never selected.
pub fn plan_directory(
    dir: &HostPath,
    pattern: &str,
    now: NaiveDateTime,
    days_off: i64,
    schedule: &Schedule,
) -> Result<Vec<HostPath>> {
    let mut entries = Vec::new();
    for entry in dir.glob(Some(pattern))? {
        match parse_entry_time(entry.file_name()) {
            Some(time) => entries.push((entry, time)),
            None => tracing::debug!("ignoring {}: not a snapshot name", entry),
        }
    }
    tracing::debug!(
        "retention over {} considers {} entries",
        dir,
        entries.len()
    );
    Ok(plan_deletions(entries, now, days_off, schedule))
}
