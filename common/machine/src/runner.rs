// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::{Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus, Output, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use signal_hook::consts::signal::{SIGINT, SIGTERM};

use crate::ExecContext;

/// The operator interrupted the run. Raised before launching the next
/// subprocess; partially written outputs are left on disk for inspection.
#[derive(thiserror::Error, Debug)]
#[error("interrupted by operator")]
pub struct Interrupted;

static INTERRUPTED: Lazy<Arc<AtomicBool>> = Lazy::new(|| Arc::new(AtomicBool::new(false)));

static DRY_RUN: AtomicBool = AtomicBool::new(false);

/// Registers SIGINT/SIGTERM handlers that abort the run at the next
/// subprocess boundary.
pub fn register_interrupt_flag() -> Result<()> {
    signal_hook::flag::register(SIGINT, INTERRUPTED.clone())?;
    signal_hook::flag::register(SIGTERM, INTERRUPTED.clone())?;
    Ok(())
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// When dry-run is enabled, mutating primitives log the command they would
/// execute and report success without running it.
pub fn set_dry_run(enabled: bool) {
    DRY_RUN.store(enabled, Ordering::SeqCst);
}

pub fn dry_run() -> bool {
    DRY_RUN.load(Ordering::SeqCst)
}

/// Outcome of one command execution.
#[derive(Clone, Debug)]
pub struct RunResult {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    fn from_output(output: Output) -> Self {
        RunResult {
            code: exit_code(&output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Converts an [`ExitStatus`] to a plain code following the POSIX shell
/// convention for signal deaths.
fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        code
    } else if let Some(signal) = status.signal() {
        128 + signal
    } else {
        -1
    }
}

fn log_output(result: &RunResult) {
    if !result.stdout.trim().is_empty() {
        tracing::info!("{}", result.stdout.trim_end());
    }
    if !result.stderr.trim().is_empty() {
        tracing::warn!("{}", result.stderr.trim_end());
    }
}

fn owned_argv<S: AsRef<str>>(argv: &[S]) -> Vec<String> {
    argv.iter().map(|s| s.as_ref().to_string()).collect()
}

/// Runs an argv on the given context and captures its exit code and output.
pub fn run<S: AsRef<str>>(ctx: &ExecContext, argv: &[S]) -> Result<RunResult> {
    run_with_stdin(ctx, argv, None)
}

/// Like [`run`], with bytes fed to the command's stdin.
pub fn run_with_stdin<S: AsRef<str>>(
    ctx: &ExecContext,
    argv: &[S],
    stdin: Option<&[u8]>,
) -> Result<RunResult> {
    if interrupted() {
        return Err(Interrupted.into());
    }

    let argv = owned_argv(argv);
    let local_argv = ctx.local_argv(&argv);
    tracing::info!("executing command '{}' on {}", local_argv.join(" "), ctx);

    let mut cmd = Command::new(&local_argv[0]);
    cmd.args(&local_argv[1..])
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {:?}", local_argv[0]))?;
    if let Some(bytes) = stdin {
        let mut pipe = child.stdin.take().context("stdin must be piped")?;
        pipe.write_all(bytes)?;
    }
    let result = RunResult::from_output(child.wait_with_output()?);
    log_output(&result);
    Ok(result)
}

/// Runs `src_argv` on `src_ctx` with its stdout streamed into `sink_argv` on
/// `sink_ctx` through this process's stdio. The pipeline's exit code is the
/// first non-zero stage code. The sink's stdout is discarded, since sink
/// stages such as `tee` would otherwise echo the whole byte stream back.
pub fn run_piped<S: AsRef<str>, T: AsRef<str>>(
    src_ctx: &ExecContext,
    src_argv: &[S],
    sink_ctx: &ExecContext,
    sink_argv: &[T],
) -> Result<RunResult> {
    if interrupted() {
        return Err(Interrupted.into());
    }

    let src_local = src_ctx.local_argv(&owned_argv(src_argv));
    let sink_local = sink_ctx.local_argv(&owned_argv(sink_argv));
    tracing::info!(
        "executing pipeline '{} | {}'",
        src_local.join(" "),
        sink_local.join(" ")
    );

    let mut src_child = Command::new(&src_local[0])
        .args(&src_local[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {:?}", src_local[0]))?;
    let src_stdout = src_child.stdout.take().context("stdout must be piped")?;

    let sink_child = Command::new(&sink_local[0])
        .args(&sink_local[1..])
        .stdin(Stdio::from(src_stdout))
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {:?}", sink_local[0]))?;

    // Drain the source's stderr while its stdout streams into the sink
    // through the kernel pipe.
    let mut src_stderr = String::new();
    if let Some(mut err) = src_child.stderr.take() {
        err.read_to_string(&mut src_stderr)?;
    }
    let src_status = src_child.wait()?;
    let sink_output = sink_child.wait_with_output()?;

    let src_code = exit_code(&src_status);
    let sink = RunResult::from_output(sink_output);
    let result = RunResult {
        code: if src_code != 0 { src_code } else { sink.code },
        stdout: sink.stdout,
        stderr: format!("{}{}", src_stderr, sink.stderr),
    };
    log_output(&result);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_process_and_captures_code() -> Result<()> {
        assert_eq!(run(&ExecContext::Local, &["true"])?.code, 0);
        assert_eq!(run(&ExecContext::Local, &["false"])?.code, 1);
        Ok(())
    }

    #[test]
    fn captures_stdout_and_stderr() -> Result<()> {
        let result = run(
            &ExecContext::Local,
            &["sh", "-c", "echo out; echo err >&2; exit 7"],
        )?;
        assert_eq!(result.code, 7);
        assert!(!result.success());
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        Ok(())
    }

    #[test]
    fn feeds_stdin() -> Result<()> {
        let result = run_with_stdin(&ExecContext::Local, &["cat"], Some(b"ping"))?;
        assert_eq!(result.stdout, "ping");
        Ok(())
    }

    #[test]
    fn pipeline_propagates_first_failing_stage() -> Result<()> {
        let result = run_piped(
            &ExecContext::Local,
            &["sh", "-c", "echo payload; exit 3"],
            &ExecContext::Local,
            &["cat"],
        )?;
        assert_eq!(result.code, 3);

        let result = run_piped(
            &ExecContext::Local,
            &["true"],
            &ExecContext::Local,
            &["sh", "-c", "cat >/dev/null; exit 5"],
        )?;
        assert_eq!(result.code, 5);
        Ok(())
    }

    #[test]
    fn pipeline_streams_bytes_to_sink() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sink_file = dir.path().join("sink.txt");
        let result = run_piped(
            &ExecContext::Local,
            &["sh", "-c", "printf payload"],
            &ExecContext::Local,
            &["tee".to_string(), sink_file.display().to_string()],
        )?;
        assert!(result.success());
        assert_eq!(std::fs::read_to_string(&sink_file)?, "payload");
        Ok(())
    }
}
