// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A filesystem path bound to the execution context that owns it.
//!
//! Paths are immutable value objects: all derivation (`join`, `strip_base`,
//! `expanduser`) returns new values while the context is shared by
//! reference. Remote paths are written `[user@]host[:port]:path` and are
//! promoted internally to `ssh://` URLs for parsing.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use machine::{ExecContext, SshIdentity};

#[derive(thiserror::Error, Debug)]
pub enum PathError {
    #[error("cannot parse path spec {spec:?}: {reason}")]
    Parse { spec: String, reason: String },
    #[error("path {path:?} does not lie under {base:?}")]
    UnrelatedPath { path: String, base: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostPath {
    path: String,
    context: Arc<ExecContext>,
}

impl HostPath {
    /// Parses a path spec. Anything containing a colon is treated as a
    /// remote spec and promoted to an `ssh://` URL; everything else is a
    /// path on the local machine.
    pub fn parse(spec: &str) -> Result<HostPath, PathError> {
        Self::parse_with_known_hosts(spec, None)
    }

    /// Like [`HostPath::parse`], with a per-machine known-hosts override
    /// applied to the remote context.
    pub fn parse_with_known_hosts(
        spec: &str,
        known_hosts_file: Option<PathBuf>,
    ) -> Result<HostPath, PathError> {
        if !spec.contains(':') {
            return Ok(HostPath::local(spec));
        }

        let promoted = if spec.contains("://") {
            spec.to_string()
        } else {
            format!("ssh://{}", spec)
        };
        let url = url::Url::parse(&promoted).map_err(|e| PathError::Parse {
            spec: spec.to_string(),
            reason: e.to_string(),
        })?;
        let host = match url.host_str() {
            Some(host) => host.to_string(),
            None => {
                return Err(PathError::Parse {
                    spec: spec.to_string(),
                    reason: "missing host".to_string(),
                })
            }
        };
        let user = match url.username() {
            "" => None,
            user => Some(user.to_string()),
        };
        let context = machine::context_for(SshIdentity {
            user,
            host,
            port: url.port(),
            known_hosts_file,
        });
        Ok(HostPath {
            path: url.path().to_string(),
            context,
        })
    }

    /// A path on the local machine.
    pub fn local(path: impl Into<String>) -> HostPath {
        HostPath {
            path: path.into(),
            context: machine::local(),
        }
    }

    /// A different path owned by the same context.
    pub fn with_path(&self, path: impl Into<String>) -> HostPath {
        HostPath {
            path: path.into(),
            context: self.context.clone(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    pub fn context(&self) -> &Arc<ExecContext> {
        &self.context
    }

    pub fn is_remote(&self) -> bool {
        !self.context.is_local()
    }

    /// Purely textual root check.
    pub fn is_root(&self) -> bool {
        self.path == "/"
    }

    /// The last path component, ignoring trailing separators.
    pub fn file_name(&self) -> &str {
        let trimmed = self.path.trim_end_matches('/');
        match trimmed.rfind('/') {
            Some(i) => &trimmed[i + 1..],
            None => trimmed,
        }
    }

    /// Joins a fragment onto this path. An absolute fragment replaces the
    /// path; an empty fragment appends a trailing separator, which transfer
    /// tools use to address a directory's contents.
    pub fn join(&self, part: &str) -> HostPath {
        let joined = if part.starts_with('/') {
            part.to_string()
        } else if part.is_empty() {
            if self.path.ends_with('/') {
                self.path.clone()
            } else {
                format!("{}/", self.path)
            }
        } else if self.path.is_empty() || self.path.ends_with('/') {
            format!("{}{}", self.path, part)
        } else {
            format!("{}/{}", self.path, part)
        };
        self.with_path(joined)
    }

    /// Returns the relative remainder of this path under `base`, without a
    /// leading separator.
    pub fn strip_base(&self, base: &HostPath) -> Result<String, PathError> {
        match self.path.strip_prefix(&base.path) {
            Some(rest) => Ok(rest.strip_prefix('/').unwrap_or(rest).to_string()),
            None => Err(PathError::UnrelatedPath {
                path: self.path.clone(),
                base: base.path.clone(),
            }),
        }
    }

    /// Expands a leading `~` into the owning context's home directory.
    pub fn expanduser(&self) -> Result<HostPath> {
        let rest = match self.path.strip_prefix('~') {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
            _ => return Ok(self.clone()),
        };
        let home = if self.context.is_local() {
            std::env::var("HOME")?
        } else {
            let result = machine::run(self.context.as_ref(), &["sh", "-c", "echo $HOME"])?;
            if !result.success() {
                bail!("failed to resolve the home directory on {}", self.context);
            }
            result.stdout.trim().to_string()
        };
        Ok(self.with_path(format!("{}{}", home, rest)))
    }

    pub fn exists(&self) -> Result<bool> {
        if self.context.is_local() {
            Ok(std::path::Path::new(&self.path).exists())
        } else {
            Ok(machine::run(self.context.as_ref(), &["test", "-e", self.path.as_str()])?.success())
        }
    }

    pub fn is_dir(&self) -> Result<bool> {
        if self.context.is_local() {
            Ok(std::path::Path::new(&self.path).is_dir())
        } else {
            Ok(machine::run(self.context.as_ref(), &["test", "-d", self.path.as_str()])?.success())
        }
    }

    pub fn is_file(&self) -> Result<bool> {
        if self.context.is_local() {
            Ok(std::path::Path::new(&self.path).is_file())
        } else {
            Ok(machine::run(self.context.as_ref(), &["test", "-f", self.path.as_str()])?.success())
        }
    }

    /// Enumerates entries of this directory matching a shell glob pattern
    /// (`*` when none is given). The enumeration runs as a `sh` loop on the
    /// owning context so local and remote directories share one code path.
    /// A pattern ending in `/` matches directories only.
    pub fn glob(&self, pattern: Option<&str>) -> Result<Vec<HostPath>> {
        let pattern = pattern.unwrap_or("*");
        let script = format!(
            "cd {} || exit 1; for f in {}; do if [ -e \"$f\" ] || [ -L \"$f\" ]; then printf '%s\\n' \"$f\"; fi; done",
            shell_escape::escape(self.path.as_str().into()),
            pattern
        );
        let result = machine::run(self.context.as_ref(), &["sh", "-c", script.as_str()])?;
        if !result.success() {
            bail!(
                "failed to enumerate {} with pattern {:?}: {}",
                self,
                pattern,
                result.stderr.trim()
            );
        }
        Ok(result
            .stdout
            .lines()
            .map(|line| self.join(line.trim_end_matches('/')))
            .collect())
    }

    /// The spec transfer tools use to address this path:
    /// `[user@]host:path` for remote paths, the bare path otherwise.
    pub fn remote_spec(&self) -> String {
        match self.context.login_spec() {
            Some(login) => format!("{}:{}", login, self.path),
            None => self.path.clone(),
        }
    }
}

impl fmt::Display for HostPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}
