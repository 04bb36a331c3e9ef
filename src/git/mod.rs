//! Git transport layer shared by the remote ref prober and the clone
//! executor. Both drive the `git` CLI so that a revision the prober can see
//! is always one the executor can clone: same transport, same auth, same
//! TLS configuration.

use std::ffi::OsStr;
use std::process::{Command, Stdio};

use thiserror::Error;

pub mod auth;
pub mod clone;
pub mod probe;

pub use auth::{AuthSnapshot, GitCredential};
pub use clone::{clone_repo, CloneOptions, DEFAULT_BRANCH};
pub use probe::{probe, ProbeError, RefSelector};

/// Classified failure from a git invocation. The clone executor maps these
/// onto its exit diagnostics; the poll manager uses the classification to
/// decide between backoff and a sticky pause.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("auth configuration rejected: {0}")]
    AuthConfig(String),
    #[error("i/o failure running git: {0}")]
    Io(#[from] std::io::Error),
    #[error("network failure: {0}")]
    Network(String),
    #[error("tls failure: {0}")]
    Tls(String),
    #[error("git protocol failure: {0}")]
    GitProtocol(String),
}

impl GitError {
    /// Sticky errors pause a poll watch until the spec or credentials change.
    pub fn is_auth(&self) -> bool {
        matches!(self, GitError::AuthConfig(_))
    }
}

/// Run `git` with the given arguments plus `-c` configuration pairs and
/// environment variables, capturing output. Terminal prompting is always
/// disabled; a failing exit status is classified from stderr.
pub(crate) fn run_git<I, S>(
    args: I,
    config: &[String],
    env: &[(String, String)],
) -> Result<std::process::Output, GitError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new("git");
    for pair in config {
        cmd.arg("-c").arg(pair);
    }
    cmd.args(args);
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    for (k, v) in env {
        cmd.env(k, v);
    }
    cmd.stdin(Stdio::null());
    let output = cmd.output()?;
    if output.status.success() {
        Ok(output)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_stderr(stderr.trim()))
    }
}

/// Map a failed git invocation onto an error class by inspecting stderr.
/// The patterns cover the messages git emits for the transports we use
/// (https via libcurl, ssh via the ssh client).
pub(crate) fn classify_stderr(stderr: &str) -> GitError {
    let lower = stderr.to_lowercase();
    if lower.contains("authentication failed")
        || lower.contains("could not read username")
        || lower.contains("could not read password")
        || lower.contains("permission denied")
        || lower.contains("invalid credentials")
        || lower.contains("terminal prompts disabled")
        || lower.contains("access denied")
    {
        GitError::AuthConfig(stderr.to_string())
    } else if lower.contains("ssl") || lower.contains("tls") || lower.contains("certificate") {
        GitError::Tls(stderr.to_string())
    } else if lower.contains("could not resolve host")
        || lower.contains("failed to connect")
        || lower.contains("connection refused")
        || lower.contains("connection timed out")
        || lower.contains("network is unreachable")
        || lower.contains("operation timed out")
        || lower.contains("early eof")
    {
        GitError::Network(stderr.to_string())
    } else {
        GitError::GitProtocol(stderr.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_classification() {
        assert!(matches!(
            classify_stderr("fatal: Authentication failed for 'https://example.com/'"),
            GitError::AuthConfig(_)
        ));
        assert!(matches!(
            classify_stderr("git@example.com: Permission denied (publickey)."),
            GitError::AuthConfig(_)
        ));
        assert!(matches!(
            classify_stderr("fatal: unable to access 'x': SSL certificate problem"),
            GitError::Tls(_)
        ));
        assert!(matches!(
            classify_stderr("fatal: unable to access 'x': Could not resolve host: nope"),
            GitError::Network(_)
        ));
        assert!(matches!(
            classify_stderr("fatal: not a git repository"),
            GitError::GitProtocol(_)
        ));
    }
}
