// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

/// Identity of a remote machine reached over ssh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshIdentity {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    /// Passed to ssh as `-o UserKnownHostsFile=...` when set.
    pub known_hosts_file: Option<PathBuf>,
}

impl SshIdentity {
    /// The `user@host` form understood by ssh and rsync.
    pub fn login_spec(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    fn pool_key(&self) -> String {
        format!(
            "{}@{}:{}|{}",
            self.user.as_deref().unwrap_or(""),
            self.host,
            self.port.map(|p| p.to_string()).unwrap_or_default(),
            self.known_hosts_file
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        )
    }
}

/// A machine commands can be executed on. Every filesystem entity the engine
/// touches is addressed together with the context that owns it.
#[derive(Debug, PartialEq, Eq)]
pub enum ExecContext {
    Local,
    Ssh(SshIdentity),
}

impl ExecContext {
    pub fn is_local(&self) -> bool {
        matches!(self, ExecContext::Local)
    }

    /// The `user@host` login spec for remote contexts.
    pub fn login_spec(&self) -> Option<String> {
        match self {
            ExecContext::Local => None,
            ExecContext::Ssh(identity) => Some(identity.login_spec()),
        }
    }

    /// Maps an argv addressed to this machine onto the argv that is actually
    /// spawned on the local machine. Remote argv elements are escaped because
    /// the remote shell re-splits the command line into words.
    pub(crate) fn local_argv(&self, argv: &[String]) -> Vec<String> {
        match self {
            ExecContext::Local => argv.to_vec(),
            ExecContext::Ssh(identity) => {
                let mut cmd = vec!["ssh".to_string()];
                if let Some(port) = identity.port {
                    cmd.push("-p".to_string());
                    cmd.push(port.to_string());
                }
                if let Some(known_hosts) = &identity.known_hosts_file {
                    cmd.push("-o".to_string());
                    cmd.push(format!("UserKnownHostsFile={}", known_hosts.display()));
                }
                cmd.push(identity.login_spec());
                cmd.push("--".to_string());
                cmd.extend(
                    argv.iter()
                        .map(|arg| shell_escape::escape(arg.as_str().into()).into_owned()),
                );
                cmd
            }
        }
    }
}

impl fmt::Display for ExecContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecContext::Local => write!(f, "local"),
            ExecContext::Ssh(identity) => write!(f, "{}", identity.login_spec()),
        }
    }
}

static LOCAL_CONTEXT: Lazy<Arc<ExecContext>> = Lazy::new(|| Arc::new(ExecContext::Local));

static CONTEXT_POOL: Lazy<Mutex<HashMap<String, Arc<ExecContext>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// The context of the machine this process runs on.
pub fn local() -> Arc<ExecContext> {
    LOCAL_CONTEXT.clone()
}

/// Returns the pooled context for the given identity, creating it on first
/// use. The engine is single-threaded; the mutex only exists to satisfy the
/// static.
pub fn context_for(identity: SshIdentity) -> Arc<ExecContext> {
    let key = identity.pool_key();
    let mut pool = CONTEXT_POOL.lock().unwrap();
    pool.entry(key)
        .or_insert_with(move || Arc::new(ExecContext::Ssh(identity)))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(user: Option<&str>, host: &str, port: Option<u16>) -> SshIdentity {
        SshIdentity {
            user: user.map(str::to_string),
            host: host.to_string(),
            port,
            known_hosts_file: None,
        }
    }

    #[test]
    fn local_argv_passes_through_on_local() {
        let argv = vec!["mkdir".to_string(), "-p".to_string(), "/a b".to_string()];
        assert_eq!(ExecContext::Local.local_argv(&argv), argv);
    }

    #[test]
    fn local_argv_escapes_remote_words() {
        let ctx = ExecContext::Ssh(identity(Some("backup"), "filer", Some(2222)));
        let argv = vec!["rm".to_string(), "-r".to_string(), "/srv/a b".to_string()];
        assert_eq!(
            ctx.local_argv(&argv),
            vec![
                "ssh",
                "-p",
                "2222",
                "backup@filer",
                "--",
                "rm",
                "-r",
                "'/srv/a b'"
            ]
        );
    }

    #[test]
    fn pool_returns_shared_context_for_repeated_key() {
        let a = context_for(identity(Some("u"), "pool-host", None));
        let b = context_for(identity(Some("u"), "pool-host", None));
        assert!(Arc::ptr_eq(&a, &b));

        let c = context_for(identity(Some("u"), "pool-host", Some(22)));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn login_spec_omits_missing_user() {
        assert_eq!(identity(None, "filer", None).login_spec(), "filer");
        assert_eq!(identity(Some("u"), "filer", None).login_spec(), "u@filer");
    }
}
