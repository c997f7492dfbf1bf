// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Filesystem primitives composed from system utilities.
//!
//! Each primitive takes [`HostPath`]s, runs a single utility on the owning
//! context and reports the utility's exit code. Mutating primitives honour
//! the process-wide dry-run flag; read-only probes always execute.

use anyhow::{bail, Result};
use hostpath::HostPath;
use machine::ExecContext;

/// Inode numbers that mark the root of a btrfs subvolume.
const SUBVOLUME_INODES: [u64; 2] = [2, 256];

fn run_mutating<S: AsRef<str>>(ctx: &ExecContext, argv: &[S]) -> Result<i32> {
    if machine::dry_run() {
        let rendered: Vec<&str> = argv.iter().map(AsRef::as_ref).collect();
        tracing::info!("dry-run: would execute '{}' on {}", rendered.join(" "), ctx);
        return Ok(0);
    }
    Ok(machine::run(ctx, argv)?.code)
}

/// Creates a directory and all of its parents.
pub fn mkdir_p(path: &HostPath) -> Result<i32> {
    run_mutating(path.context().as_ref(), &["mkdir", "-p", path.as_str()])
}

/// Moves a filesystem entity. Both paths must be owned by the same context.
pub fn mv(old: &HostPath, new: &HostPath) -> Result<i32> {
    if !std::sync::Arc::ptr_eq(old.context(), new.context()) {
        bail!(
            "cannot move {} to {}: a cross-context move requires an explicit transport",
            old,
            new
        );
    }
    run_mutating(old.context().as_ref(), &["mv", old.as_str(), new.as_str()])
}

/// Removes a file, or a directory tree when `recursive` is set.
pub fn rm(path: &HostPath, recursive: bool) -> Result<i32> {
    if recursive {
        run_mutating(path.context().as_ref(), &["rm", "-r", path.as_str()])
    } else {
        run_mutating(path.context().as_ref(), &["rm", path.as_str()])
    }
}

/// Human-readable aggregate size of a path, for logging only.
pub fn du_short(path: &HostPath) -> Result<Option<String>> {
    let result = machine::run(path.context().as_ref(), &["du", "-shx", path.as_str()])?;
    if !result.success() {
        return Ok(None);
    }
    Ok(result
        .stdout
        .split_whitespace()
        .next()
        .map(str::to_string))
}

/// The local machine's host name.
pub fn hostname() -> Result<String> {
    let result = machine::run(&ExecContext::Local, &["hostname"])?;
    if !result.success() {
        bail!("hostname failed with exit code {}", result.code);
    }
    Ok(result.stdout.trim().to_string())
}

/// The mount point containing `path`, or `None` when stat cannot resolve it.
pub fn mount_point(path: &HostPath) -> Result<Option<HostPath>> {
    let result = machine::run(path.context().as_ref(), &["stat", "-c", "%m", path.as_str()])?;
    if !result.success() {
        return Ok(None);
    }
    Ok(Some(path.with_path(result.stdout.trim_end())))
}

/// Resolves the mount point of `path`, walking towards the root until stat
/// succeeds on an ancestor.
pub fn nearest_mount_point(path: &HostPath) -> Result<HostPath> {
    let mut cur = path.clone();
    loop {
        if let Some(mount) = mount_point(&cur)? {
            return Ok(mount);
        }
        let parent = parent_of(cur.as_str());
        if parent == cur.as_str() {
            break;
        }
        cur = path.with_path(parent);
    }
    bail!("could not resolve a mount point for {}", path);
}

fn parent_of(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    match trimmed.rfind('/') {
        Some(0) => "/",
        Some(i) => &trimmed[..i],
        None => ".",
    }
}

/// True iff `path` is the root of a btrfs subvolume: the filesystem type
/// probe reports btrfs and the directory's inode number is one of the fixed
/// subvolume root inodes. Paths deeper inside a subvolume report false.
pub fn is_btrfs_subvolume(path: &HostPath) -> Result<bool> {
    let fstype = machine::run(
        path.context().as_ref(),
        &["stat", "-f", "--format=%T", path.as_str()],
    )?;
    if !fstype.success() || fstype.stdout.trim() != "btrfs" {
        return Ok(false);
    }
    let inode = machine::run(path.context().as_ref(), &["stat", "--format=%i", path.as_str()])?;
    if !inode.success() {
        return Ok(false);
    }
    match inode.stdout.trim().parse::<u64>() {
        Ok(inode) => Ok(SUBVOLUME_INODES.contains(&inode)),
        Err(_) => Ok(false),
    }
}

/// Creates a new btrfs subvolume at `path`.
pub fn create_subvolume(path: &HostPath) -> Result<i32> {
    run_mutating(
        path.context().as_ref(),
        &["btrfs", "subvolume", "create", path.as_str()],
    )
}

/// Snapshots subvolume `src` at `dst`, writable unless `read_only` is set.
pub fn create_snapshot(src: &HostPath, dst: &HostPath, read_only: bool) -> Result<i32> {
    run_mutating(src.context().as_ref(), &snapshot_argv(src.as_str(), dst.as_str(), read_only))
}

fn snapshot_argv(src: &str, dst: &str, read_only: bool) -> Vec<String> {
    let mut argv: Vec<String> = ["btrfs", "subvolume", "snapshot"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if read_only {
        argv.push("-r".to_string());
    }
    argv.push(src.to_string());
    argv.push(dst.to_string());
    argv
}

/// Recursive archival copy of `src` into `dst`, deleting files absent from
/// the source. A directory source is addressed with a trailing separator so
/// its contents are copied rather than the directory itself; a file source
/// must not carry one.
pub fn mirror_copy(
    src: &HostPath,
    dst: &HostPath,
    excludes: &[HostPath],
    one_fs: bool,
    ignore_errors: bool,
) -> Result<i32> {
    let src_spec = if src.is_file()? {
        src.remote_spec()
    } else {
        src.join("").remote_spec()
    };
    let exclude_args: Vec<&str> = excludes.iter().map(|e| e.as_str()).collect();
    let argv = rsync_argv(
        &src_spec,
        &dst.remote_spec(),
        &exclude_args,
        one_fs,
        ignore_errors,
    );
    run_mutating(&ExecContext::Local, &argv)
}

fn rsync_argv(
    src: &str,
    dst: &str,
    excludes: &[&str],
    one_fs: bool,
    ignore_errors: bool,
) -> Vec<String> {
    let mut argv: Vec<String> = ["rsync", "-a", "-A", "--delete"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if one_fs {
        argv.push("-x".to_string());
    }
    if ignore_errors {
        argv.push("--ignore-errors".to_string());
    }
    for exclude in excludes {
        argv.push("--exclude".to_string());
        argv.push(exclude.to_string());
    }
    argv.push(src.to_string());
    argv.push(dst.to_string());
    argv
}

/// Creates a gzipped archive of `files` at `dst`. When the destination is
/// remote, a local `tar` stage writing to stdout is piped into a `tee` stage
/// on the destination context.
pub fn archive(dst: &HostPath, files: &[HostPath], excludes: &[HostPath]) -> Result<i32> {
    let file_args: Vec<&str> = files.iter().map(|f| f.as_str()).collect();
    let exclude_args: Vec<&str> = excludes.iter().map(|e| e.as_str()).collect();
    if dst.is_remote() {
        let tar = tar_argv(None, &file_args, &exclude_args);
        let tee = ["tee", dst.as_str()];
        if machine::dry_run() {
            tracing::info!(
                "dry-run: would execute '{} | {}'",
                tar.join(" "),
                tee.join(" ")
            );
            return Ok(0);
        }
        Ok(machine::run_piped(&ExecContext::Local, &tar, dst.context().as_ref(), &tee)?.code)
    } else {
        run_mutating(
            &ExecContext::Local,
            &tar_argv(Some(dst.as_str()), &file_args, &exclude_args),
        )
    }
}

fn tar_argv(dst: Option<&str>, files: &[&str], excludes: &[&str]) -> Vec<String> {
    let mut argv: Vec<String> = ["tar", "--numeric-owner", "-czf", dst.unwrap_or("-")]
        .iter()
        .map(|s| s.to_string())
        .collect();
    for exclude in excludes {
        argv.push("--exclude".to_string());
        argv.push(exclude.to_string());
    }
    argv.extend(files.iter().map(|f| f.to_string()));
    argv
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_path(path: &std::path::Path) -> HostPath {
        HostPath::local(path.display().to_string())
    }

    #[test]
    fn mkdir_mv_rm_round() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let nested = local_path(&dir.path().join("a/b/c"));
        assert_eq!(mkdir_p(&nested)?, 0);
        assert!(nested.is_dir()?);
        // mkdir -p succeeds when the directory already exists.
        assert_eq!(mkdir_p(&nested)?, 0);

        let moved = local_path(&dir.path().join("a/b/d"));
        assert_eq!(mv(&nested, &moved)?, 0);
        assert!(!nested.exists()?);
        assert!(moved.is_dir()?);

        assert_eq!(rm(&moved, true)?, 0);
        assert!(!moved.exists()?);
        Ok(())
    }

    #[test]
    fn rm_of_file_is_not_recursive() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("victim.txt");
        std::fs::write(&file, "x")?;
        assert_eq!(rm(&local_path(&file), false)?, 0);
        assert!(!file.exists());
        Ok(())
    }

    #[test]
    fn du_short_reports_a_size() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("payload"), vec![0u8; 4096])?;
        let size = du_short(&local_path(dir.path()))?;
        assert!(size.is_some());
        assert!(du_short(&local_path(&dir.path().join("absent")))?.is_none());
        Ok(())
    }

    #[test]
    fn nearest_mount_point_walks_to_an_ancestor() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let deep = local_path(&dir.path().join("not/yet/created"));
        let mount = nearest_mount_point(&deep)?;
        assert!(mount.as_str().starts_with('/'));
        Ok(())
    }

    #[test]
    fn fresh_directory_is_no_subvolume() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(!is_btrfs_subvolume(&local_path(dir.path()))?);
        Ok(())
    }

    #[test]
    fn archive_writes_local_tarball() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("src");
        std::fs::create_dir(&src)?;
        std::fs::write(src.join("data.txt"), "payload")?;

        let out = local_path(&dir.path().join("out.tar.gz"));
        let code = archive(&out, &[local_path(&src)], &[])?;
        assert_eq!(code, 0);
        assert!(out.is_file()?);
        Ok(())
    }

    #[test]
    fn rsync_argv_orders_flags_and_excludes() {
        assert_eq!(
            rsync_argv("/src/", "host:/dst", &["/src/tmp"], true, true),
            vec![
                "rsync",
                "-a",
                "-A",
                "--delete",
                "-x",
                "--ignore-errors",
                "--exclude",
                "/src/tmp",
                "/src/",
                "host:/dst"
            ]
        );
        assert_eq!(
            rsync_argv("/src/file", "/dst", &[], false, false),
            vec!["rsync", "-a", "-A", "--delete", "/src/file", "/dst"]
        );
    }

    #[test]
    fn tar_argv_writes_to_stdout_without_destination() {
        assert_eq!(
            tar_argv(None, &["/etc", "/srv"], &["/srv/cache"]),
            vec![
                "tar",
                "--numeric-owner",
                "-czf",
                "-",
                "--exclude",
                "/srv/cache",
                "/etc",
                "/srv"
            ]
        );
    }

    #[test]
    fn snapshot_argv_marks_read_only() {
        assert_eq!(
            snapshot_argv("/mnt/prev", "/mnt/next", true),
            vec!["btrfs", "subvolume", "snapshot", "-r", "/mnt/prev", "/mnt/next"]
        );
        assert_eq!(
            snapshot_argv("/mnt/prev", "/mnt/next", false),
            vec!["btrfs", "subvolume", "snapshot", "/mnt/prev", "/mnt/next"]
        );
    }

    #[test]
    fn parent_of_walks_towards_root() {
        assert_eq!(parent_of("/a/b/c"), "/a/b");
        assert_eq!(parent_of("/a"), "/");
        assert_eq!(parent_of("/"), "/");
        assert_eq!(parent_of("relative"), ".");
    }
}
