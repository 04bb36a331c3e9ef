//! Remote ref probing.
//!
//! A probe asks the remote for its advertised refs (`git ls-remote`) and
//! resolves the tracked selector to a commit id without transferring any
//! objects. Tag selectors keep only names that parse as semantic versions
//! and satisfy the constraint, then take the version-wise maximum.

use std::collections::HashMap;

use thiserror::Error;

use crate::crd::GitInfo;

use super::auth::AuthSnapshot;
use super::{run_git, GitError, DEFAULT_BRANCH};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("ref refs/heads/{0} not found on remote")]
    RefNotFound(String),
    #[error("no tag on the remote satisfies {0}")]
    NoMatchingTag(String),
    #[error("invalid semver constraint {0:?}: {1}")]
    BadConstraint(String, semver::Error),
    #[error(transparent)]
    Git(#[from] GitError),
}

impl ProbeError {
    /// True for errors that will not heal without a spec or credential
    /// change; the poll manager pauses the watch instead of backing off.
    pub fn is_sticky(&self) -> bool {
        match self {
            ProbeError::BadConstraint(..) => true,
            ProbeError::Git(e) => e.is_auth(),
            _ => false,
        }
    }
}

/// What a watch tracks: a branch head or the newest tag satisfying a
/// semver constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefSelector {
    Branch(String),
    Tag(String),
}

impl RefSelector {
    pub fn from_git(git: &GitInfo) -> Self {
        match git.on_tag.as_deref().filter(|c| !c.is_empty()) {
            Some(constraint) => RefSelector::Tag(constraint.to_string()),
            None => RefSelector::Branch(
                git.branch
                    .as_deref()
                    .filter(|b| !b.is_empty())
                    .unwrap_or(DEFAULT_BRANCH)
                    .to_string(),
            ),
        }
    }
}

/// Resolve the selector against the remote's advertised refs.
///
/// This is a blocking call (it runs the git CLI); async callers go through
/// `spawn_blocking`.
pub fn probe(repo: &str, auth: &AuthSnapshot, selector: &RefSelector) -> Result<String, ProbeError> {
    let materialised = auth.materialise(repo).map_err(|e| {
        GitError::AuthConfig(format!("failed to materialise credentials: {e}"))
    })?;
    match selector {
        RefSelector::Branch(branch) => {
            let refname = format!("refs/heads/{branch}");
            let output = run_git(
                ["ls-remote", "--heads", "--", materialised.url.as_str(), refname.as_str()],
                &materialised.config,
                &materialised.env,
            )?;
            let listing = parse_ls_remote(&String::from_utf8_lossy(&output.stdout));
            listing
                .into_iter()
                .find(|(name, _)| name == &refname)
                .map(|(_, oid)| oid)
                .ok_or_else(|| ProbeError::RefNotFound(branch.clone()))
        }
        RefSelector::Tag(constraint) => {
            let req = semver::VersionReq::parse(constraint)
                .map_err(|e| ProbeError::BadConstraint(constraint.clone(), e))?;
            let output = run_git(
                ["ls-remote", "--tags", "--", materialised.url.as_str()],
                &materialised.config,
                &materialised.env,
            )?;
            let listing = parse_ls_remote(&String::from_utf8_lossy(&output.stdout));
            select_tag(&listing, &req).ok_or_else(|| ProbeError::NoMatchingTag(constraint.clone()))
        }
    }
}

/// Parse `ls-remote` output lines of the form `<oid>\t<refname>`.
pub(crate) fn parse_ls_remote(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let (oid, name) = line.split_once('\t')?;
            if oid.is_empty() || name.is_empty() {
                return None;
            }
            Some((name.trim().to_string(), oid.trim().to_string()))
        })
        .collect()
}

/// Pick the commit of the highest semver tag satisfying the constraint.
///
/// Annotated tags advertise both the tag object and a peeled `^{}` entry
/// pointing at the commit; the peeled id wins when present. A leading `v`
/// on the tag name is tolerated.
pub(crate) fn select_tag(refs: &[(String, String)], req: &semver::VersionReq) -> Option<String> {
    let mut peeled: HashMap<&str, &str> = HashMap::new();
    for (name, oid) in refs {
        if let Some(base) = name.strip_suffix("^{}") {
            peeled.insert(base, oid);
        }
    }

    let mut best: Option<(semver::Version, String)> = None;
    for (name, oid) in refs {
        if name.ends_with("^{}") {
            continue;
        }
        let Some(tag) = name.strip_prefix("refs/tags/") else {
            continue;
        };
        let Ok(version) = semver::Version::parse(tag.trim_start_matches('v')) else {
            continue;
        };
        if !req.matches(&version) {
            continue;
        }
        let commit = peeled.get(name.as_str()).copied().unwrap_or(oid.as_str());
        match &best {
            Some((current, _)) if *current >= version => {}
            _ => best = Some((version, commit.to_string())),
        }
    }
    best.map(|(_, oid)| oid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_defaults_to_master() {
        let git = GitInfo {
            repo: "https://example.com/x/y".into(),
            ..Default::default()
        };
        assert_eq!(
            RefSelector::from_git(&git),
            RefSelector::Branch("master".into())
        );
    }

    #[test]
    fn selector_prefers_tag_constraint() {
        let git = GitInfo {
            repo: "https://example.com/x/y".into(),
            branch: Some("main".into()),
            on_tag: Some(">=1.0.0".into()),
            ..Default::default()
        };
        assert_eq!(
            RefSelector::from_git(&git),
            RefSelector::Tag(">=1.0.0".into())
        );
    }

    #[test]
    fn ls_remote_parsing() {
        let listing = parse_ls_remote(
            "aaaa\trefs/heads/main\nbbbb\trefs/tags/v1.0.0\n\ncccc\trefs/tags/v1.0.0^{}\n",
        );
        assert_eq!(
            listing,
            vec![
                ("refs/heads/main".to_string(), "aaaa".to_string()),
                ("refs/tags/v1.0.0".to_string(), "bbbb".to_string()),
                ("refs/tags/v1.0.0^{}".to_string(), "cccc".to_string()),
            ]
        );
    }

    #[test]
    fn tag_selection_takes_version_maximum() {
        let refs = vec![
            ("refs/tags/v1.0.0".to_string(), "a".to_string()),
            ("refs/tags/v1.2.0".to_string(), "b".to_string()),
            ("refs/tags/v1.1.0".to_string(), "c".to_string()),
            ("refs/tags/not-a-version".to_string(), "d".to_string()),
        ];
        let req = semver::VersionReq::parse(">=1.0.0").unwrap();
        assert_eq!(select_tag(&refs, &req), Some("b".to_string()));
    }

    #[test]
    fn tag_selection_prefers_peeled_commit() {
        let refs = vec![
            ("refs/tags/v2.0.0".to_string(), "tagobject".to_string()),
            ("refs/tags/v2.0.0^{}".to_string(), "commit".to_string()),
        ];
        let req = semver::VersionReq::parse(">=1.0.0").unwrap();
        assert_eq!(select_tag(&refs, &req), Some("commit".to_string()));
    }

    #[test]
    fn tag_selection_honours_constraint() {
        let refs = vec![
            ("refs/tags/v0.9.0".to_string(), "a".to_string()),
            ("refs/tags/v1.5.0".to_string(), "b".to_string()),
        ];
        let req = semver::VersionReq::parse("<1.0.0").unwrap();
        assert_eq!(select_tag(&refs, &req), Some("a".to_string()));
        let req = semver::VersionReq::parse(">=2.0.0").unwrap();
        assert_eq!(select_tag(&refs, &req), None);
    }
}
