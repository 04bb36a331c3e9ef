//! The clone executor: one authenticated single-branch clone into a local
//! directory, optionally detached at a specific revision afterwards. Runs
//! inside the child workload's init container; no retries at this layer.

use std::path::PathBuf;

use super::auth::AuthSnapshot;
use super::{run_git, GitError};

/// Branch cloned when the GitJob does not name one.
pub const DEFAULT_BRANCH: &str = "master";

pub struct CloneOptions {
    pub repo: String,
    pub path: PathBuf,
    pub branch: Option<String>,
    pub revision: Option<String>,
    pub auth: AuthSnapshot,
}

/// Clone the single requested branch of `repo` into `path`.
///
/// When a revision is given the checkout is detached at it afterwards; the
/// reconciler only ever passes commits that are on the cloned branch.
pub fn clone_repo(opts: &CloneOptions) -> Result<(), GitError> {
    let branch = opts
        .branch
        .as_deref()
        .filter(|b| !b.is_empty())
        .unwrap_or(DEFAULT_BRANCH);
    let materialised = opts
        .auth
        .materialise(&opts.repo)
        .map_err(|e| GitError::AuthConfig(format!("failed to materialise credentials: {e}")))?;

    let path = opts.path.display().to_string();
    run_git(
        [
            "clone",
            "--single-branch",
            "--branch",
            branch,
            "--",
            materialised.url.as_str(),
            path.as_str(),
        ],
        &materialised.config,
        &materialised.env,
    )?;

    if let Some(revision) = opts.revision.as_deref().filter(|r| !r.is_empty()) {
        run_git(
            ["-C", path.as_str(), "checkout", "--detach", revision],
            &materialised.config,
            &materialised.env,
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_from_local_repository() {
        let source = tempfile::tempdir().unwrap();
        let run = |args: &[&str]| {
            let status = std::process::Command::new("git")
                .args(args)
                .current_dir(source.path())
                .env("GIT_AUTHOR_NAME", "test")
                .env("GIT_AUTHOR_EMAIL", "test@example.com")
                .env("GIT_COMMITTER_NAME", "test")
                .env("GIT_COMMITTER_EMAIL", "test@example.com")
                .status()
                .unwrap();
            assert!(status.success(), "git {args:?} failed");
        };
        run(&["init", "-q", "-b", "main"]);
        std::fs::write(source.path().join("file"), "contents").unwrap();
        run(&["add", "file"]);
        run(&["commit", "-q", "-m", "initial"]);

        let target = tempfile::tempdir().unwrap();
        let dest = target.path().join("checkout");
        clone_repo(&CloneOptions {
            repo: source.path().display().to_string(),
            path: dest.clone(),
            branch: Some("main".into()),
            revision: None,
            auth: AuthSnapshot::default(),
        })
        .unwrap();
        assert!(dest.join("file").exists());
    }

    #[test]
    fn clone_of_missing_branch_fails() {
        let source = tempfile::tempdir().unwrap();
        let status = std::process::Command::new("git")
            .args(["init", "-q", "-b", "main"])
            .current_dir(source.path())
            .status()
            .unwrap();
        assert!(status.success());

        let target = tempfile::tempdir().unwrap();
        let result = clone_repo(&CloneOptions {
            repo: source.path().display().to_string(),
            path: target.path().join("checkout"),
            branch: Some("does-not-exist".into()),
            revision: None,
            auth: AuthSnapshot::default(),
        });
        assert!(result.is_err());
    }
}
