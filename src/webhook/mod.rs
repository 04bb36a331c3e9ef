//! # Webhook Dispatcher
//!
//! Single HTTP endpoint that short-circuits polling with provider push
//! notifications. Requests are routed by header to a provider parser,
//! normalised, matched against every GitJob in the shared cache, and the
//! matching resources get their observed commit written through the status
//! sub-resource.
//!
//! Unknown traffic is answered `200` with no side effect so that webhook
//! infrastructure (which retries on non-2xx) never builds a retry storm out
//! of unrelated requests. Parse and API errors are answered `500` so the
//! provider retries.

use std::sync::{Arc, RwLock};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use kube_runtime::reflector::Store;
use kube_runtime::{watcher, WatchStreamExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crd::{GitJob, WEBHOOK_DEFAULT_SYNC_INTERVAL_SECS};
use crate::metrics;

pub mod providers;

use providers::{NormalizedEvent, ProviderSecrets, WEBHOOK_SECRET_NAME};

pub struct WebhookState {
    pub client: Client,
    pub store: Store<GitJob>,
    secrets: RwLock<Arc<ProviderSecrets>>,
}

impl WebhookState {
    pub fn new(client: Client, store: Store<GitJob>) -> Self {
        Self {
            client,
            store,
            secrets: RwLock::new(Arc::new(ProviderSecrets::default())),
        }
    }

    fn secrets_snapshot(&self) -> Arc<ProviderSecrets> {
        self.secrets
            .read()
            .expect("webhook secrets lock poisoned")
            .clone()
    }

    fn swap_secrets(&self, next: ProviderSecrets) {
        let mut guard = self.secrets.write().expect("webhook secrets lock poisoned");
        if **guard != next {
            info!("webhook provider secrets reloaded");
            *guard = Arc::new(next);
        }
    }
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new().route("/", any(handle)).with_state(state)
}

/// Serve the webhook endpoint until the token is cancelled, then drain
/// in-flight requests.
pub async fn serve(
    addr: &str,
    state: Arc<WebhookState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("webhook listener on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Keep provider secrets in sync with the `gitjob-webhook` Secret in the
/// controller namespace. Parser configuration is swapped atomically;
/// request handlers work on a snapshot.
pub async fn watch_webhook_secret(
    state: Arc<WebhookState>,
    namespace: String,
    shutdown: CancellationToken,
) {
    let api: Api<Secret> = Api::namespaced(state.client.clone(), &namespace);
    let config = watcher::Config::default().fields(&format!("metadata.name={WEBHOOK_SECRET_NAME}"));
    let mut stream = std::pin::pin!(watcher(api, config).default_backoff());
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = stream.next() => match event {
                Some(e) => e,
                None => break,
            },
        };
        match event {
            Ok(watcher::Event::Apply(secret)) | Ok(watcher::Event::InitApply(secret)) => {
                state.swap_secrets(ProviderSecrets::from_secret(&secret));
            }
            Ok(watcher::Event::Delete(_)) => {
                state.swap_secrets(ProviderSecrets::default());
            }
            Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => {}
            Err(e) => warn!(error = %e, "webhook secret watch failed; retrying"),
        }
    }
}

async fn handle(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(provider) = providers::detect(&headers) else {
        debug!("ignoring unknown webhook event");
        return StatusCode::OK.into_response();
    };
    metrics::increment_webhook_requests(provider.name());

    let secrets = state.secrets_snapshot();
    let event = match providers::parse(provider, &headers, &body, &secrets) {
        Ok(event) => event,
        Err(e) => return error_response(e.to_string()),
    };
    debug!(provider = provider.name(), ?event, "webhook event normalised");

    let gitjobs = state.store.state();
    let updates = match match_gitjobs(&event, &gitjobs) {
        Ok(updates) => updates,
        Err(e) => return error_response(format!("repo pattern: {e}")),
    };

    for update in &updates {
        if let Err(e) = apply_update(&state.client, update).await {
            return error_response(format!("updating {}/{}: {e}", update.namespace, update.name));
        }
        info!(
            namespace = %update.namespace,
            name = %update.name,
            commit = %update.commit,
            "observed commit updated from webhook"
        );
    }

    (StatusCode::OK, "succeeded").into_response()
}

fn error_response(message: String) -> Response {
    warn!("webhook processing failed: {}", message);
    metrics::increment_webhook_errors();
    (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
}

/// A status write owed to one matched GitJob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommitUpdate {
    pub namespace: String,
    pub name: String,
    pub resource_version: Option<String>,
    pub commit: String,
    /// `spec.syncInterval == 0` at match time: set it to the webhook
    /// default so the tracker keeps a slow poll running.
    pub coerce_sync_interval: bool,
}

/// Evaluate a normalised event against the known GitJobs.
///
/// For every repo URL in the payload a case-insensitive pattern is derived
/// from the URL's host and path and tested against each GitJob's configured
/// repo, reconciling the different URL shapes a provider may emit for the
/// same logical repository.
pub(crate) fn match_gitjobs(
    event: &NormalizedEvent,
    gitjobs: &[Arc<GitJob>],
) -> Result<Vec<CommitUpdate>, regex::Error> {
    let mut updates: Vec<CommitUpdate> = Vec::new();
    for repo_url in &event.repo_urls {
        let Some((host, path)) = host_and_path(repo_url) else {
            debug!(url = %repo_url, "payload repo url has no parseable host; skipping");
            continue;
        };
        let pattern = format!(
            r"(?i)(http://|https://|\w+@|ssh://(\w+@)?){host}(:[0-9]+|)[:/]{path}(\.git)?"
        );
        let repo_regex = regex::Regex::new(&pattern)?;

        for gitjob in gitjobs {
            if gitjob.spec.is_pinned() {
                continue;
            }
            if !repo_regex.is_match(&gitjob.spec.git.repo) {
                continue;
            }

            // A tag tracker only reacts to tag events, which can come from
            // any branch.
            if let Some(constraint) = gitjob.spec.git.on_tag.as_deref().filter(|c| !c.is_empty()) {
                if event.tag.is_empty() {
                    continue;
                }
                let req = match semver::VersionReq::parse(constraint) {
                    Ok(req) => req,
                    Err(e) => {
                        warn!(
                            key = %gitjob.watch_key(),
                            error = %e,
                            "failed to parse onTag semver constraint, skipping"
                        );
                        continue;
                    }
                };
                let version = match semver::Version::parse(event.tag.trim_start_matches('v')) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "failed to parse semver on incoming tag, skipping");
                        continue;
                    }
                };
                if !req.matches(&version) {
                    continue;
                }
            } else if let Some(branch) = gitjob.spec.git.branch.as_deref().filter(|b| !b.is_empty())
            {
                if event.branch.is_empty() || event.branch != branch {
                    continue;
                }
            }

            if event.revision.is_empty() || gitjob.observed_commit() == event.revision {
                continue;
            }
            let key = gitjob.watch_key();
            if updates.iter().any(|u| format!("{}/{}", u.namespace, u.name) == key) {
                continue;
            }
            updates.push(CommitUpdate {
                namespace: gitjob.namespace().unwrap_or_default(),
                name: gitjob.name_any(),
                resource_version: gitjob.resource_version(),
                commit: event.revision.clone(),
                coerce_sync_interval: gitjob.spec.sync_interval == 0,
            });
        }
    }
    Ok(updates)
}

/// Host (without port or userinfo) and path (without the leading slash) of
/// a scheme-qualified URL.
fn host_and_path(url: &str) -> Option<(String, String)> {
    let (_, rest) = url.split_once("://")?;
    let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
    let host_port = authority.rsplit('@').next().unwrap_or(authority);
    let host = host_port.split(':').next().unwrap_or(host_port);
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), path.trim_end_matches('/').to_string()))
}

async fn apply_update(client: &Client, update: &CommitUpdate) -> Result<(), kube::Error> {
    let api: Api<GitJob> = Api::namespaced(client.clone(), &update.namespace);
    let mut status_patch = serde_json::json!({
        "status": { "commit": update.commit }
    });
    if let Some(rv) = &update.resource_version {
        status_patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
    }
    api.patch_status(&update.name, &PatchParams::default(), &Patch::Merge(status_patch))
        .await?;

    if update.coerce_sync_interval {
        let spec_patch = serde_json::json!({
            "spec": { "syncInterval": WEBHOOK_DEFAULT_SYNC_INTERVAL_SECS }
        });
        api.patch(&update.name, &PatchParams::default(), &Patch::Merge(spec_patch))
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{GitInfo, GitJobSpec, GitJobStatus};

    fn gitjob(name: &str, git: GitInfo, sync_interval: i32, commit: &str) -> Arc<GitJob> {
        let mut job = GitJob::new(
            name,
            GitJobSpec {
                git,
                sync_interval,
                job_template: Default::default(),
                sync_policy: None,
            },
        );
        job.metadata.namespace = Some("default".to_string());
        job.status = Some(GitJobStatus {
            commit: commit.to_string(),
            ..Default::default()
        });
        Arc::new(job)
    }

    fn push_event(repo: &str, branch: &str, revision: &str) -> NormalizedEvent {
        NormalizedEvent {
            repo_urls: vec![repo.to_string()],
            branch: branch.to_string(),
            tag: String::new(),
            revision: revision.to_string(),
        }
    }

    #[test]
    fn github_push_updates_matching_branch() {
        let jobs = vec![gitjob(
            "test",
            GitInfo {
                repo: "https://github.com/x/y".into(),
                branch: Some("main".into()),
                ..Default::default()
            },
            0,
            "",
        )];
        let updates =
            match_gitjobs(&push_event("https://github.com/x/y", "main", "abc"), &jobs).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].commit, "abc");
        assert_eq!(updates[0].name, "test");
        assert!(updates[0].coerce_sync_interval);
    }

    #[test]
    fn branch_mismatch_is_skipped() {
        let jobs = vec![gitjob(
            "test",
            GitInfo {
                repo: "https://github.com/x/y".into(),
                branch: Some("main".into()),
                ..Default::default()
            },
            30,
            "",
        )];
        let updates =
            match_gitjobs(&push_event("https://github.com/x/y", "develop", "abc"), &jobs).unwrap();
        assert!(updates.is_empty());
    }

    #[test]
    fn azure_https_repo_matches() {
        const COMMIT: &str = "f00c3a181697bb3829a6462e931c7456bbed557b";
        let jobs = vec![gitjob(
            "test",
            GitInfo {
                repo: "https://dev.azure.com/fleet/git-test/_git/git-test".into(),
                branch: Some("main".into()),
                ..Default::default()
            },
            60,
            "",
        )];
        let event = push_event(
            "https://dev.azure.com/fleet/git-test/_git/git-test",
            "main",
            COMMIT,
        );
        let updates = match_gitjobs(&event, &jobs).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].commit, COMMIT);
        assert!(!updates[0].coerce_sync_interval);
    }

    #[test]
    fn azure_ssh_form_repo_matches_derived_url() {
        const COMMIT: &str = "f00c3a181697bb3829a6462e931c7456bbed557b";
        let jobs = vec![gitjob(
            "test",
            GitInfo {
                repo: "git@ssh.dev.azure.com:v3/fleet/git-test/git-test".into(),
                branch: Some("main".into()),
                ..Default::default()
            },
            60,
            "",
        )];
        // The dispatcher derives the ssh form next to the https remote URL
        let event = NormalizedEvent {
            repo_urls: vec![
                "ssh://git@ssh.dev.azure.com/v3/fleet/git-test/git-test".to_string(),
                "https://dev.azure.com/fleet/git-test/_git/git-test".to_string(),
            ],
            branch: "main".to_string(),
            tag: String::new(),
            revision: COMMIT.to_string(),
        };
        let updates = match_gitjobs(&event, &jobs).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].commit, COMMIT);
    }

    #[test]
    fn pinned_gitjobs_are_skipped() {
        let jobs = vec![gitjob(
            "test",
            GitInfo {
                repo: "https://github.com/x/y".into(),
                branch: Some("main".into()),
                revision: Some("pinned".into()),
                ..Default::default()
            },
            0,
            "",
        )];
        let updates =
            match_gitjobs(&push_event("https://github.com/x/y", "main", "abc"), &jobs).unwrap();
        assert!(updates.is_empty());
    }

    #[test]
    fn tag_tracker_skips_branch_push() {
        let jobs = vec![gitjob(
            "test",
            GitInfo {
                repo: "https://github.com/x/y".into(),
                on_tag: Some(">=1.0.0".into()),
                ..Default::default()
            },
            0,
            "",
        )];
        // Branch push carries no tag: skipped
        let updates =
            match_gitjobs(&push_event("https://github.com/x/y", "main", "abc"), &jobs).unwrap();
        assert!(updates.is_empty());
    }

    #[test]
    fn tag_tracker_applies_constraint() {
        let jobs = vec![gitjob(
            "test",
            GitInfo {
                repo: "https://github.com/x/y".into(),
                on_tag: Some(">=1.0.0".into()),
                ..Default::default()
            },
            0,
            "",
        )];
        let mut event = push_event("https://github.com/x/y", "", "abc");
        event.tag = "v0.9.0".to_string();
        assert!(match_gitjobs(&event, &jobs).unwrap().is_empty());

        event.tag = "v1.1.0".to_string();
        let updates = match_gitjobs(&event, &jobs).unwrap();
        assert_eq!(updates.len(), 1);
    }

    #[test]
    fn matching_is_idempotent() {
        let event = push_event("https://github.com/x/y", "main", "abc");
        let before = vec![gitjob(
            "test",
            GitInfo {
                repo: "https://github.com/x/y".into(),
                branch: Some("main".into()),
                ..Default::default()
            },
            0,
            "",
        )];
        assert_eq!(match_gitjobs(&event, &before).unwrap().len(), 1);

        // Same payload after the status write: no further update
        let after = vec![gitjob(
            "test",
            GitInfo {
                repo: "https://github.com/x/y".into(),
                branch: Some("main".into()),
                ..Default::default()
            },
            0,
            "abc",
        )];
        assert!(match_gitjobs(&event, &after).unwrap().is_empty());
    }

    #[test]
    fn duplicate_repo_urls_produce_one_update() {
        let event = NormalizedEvent {
            repo_urls: vec![
                "https://stash.example.com/scm/x/y.git".to_string(),
                "ssh://git@stash.example.com:7999/scm/x/y.git".to_string(),
            ],
            branch: "main".to_string(),
            tag: String::new(),
            revision: "abc".to_string(),
        };
        let jobs = vec![gitjob(
            "test",
            GitInfo {
                repo: "https://stash.example.com/scm/x/y.git".into(),
                branch: Some("main".into()),
                ..Default::default()
            },
            0,
            "",
        )];
        assert_eq!(match_gitjobs(&event, &jobs).unwrap().len(), 1);
    }

    #[test]
    fn host_and_path_parsing() {
        assert_eq!(
            host_and_path("https://github.com/x/y"),
            Some(("github.com".to_string(), "x/y".to_string()))
        );
        assert_eq!(
            host_and_path("ssh://git@stash.example.com:7999/scm/x/y.git"),
            Some(("stash.example.com".to_string(), "scm/x/y.git".to_string()))
        );
        assert_eq!(
            host_and_path("https://org@dev.azure.com/org/proj/_git/repo"),
            Some(("dev.azure.com".to_string(), "org/proj/_git/repo".to_string()))
        );
        assert_eq!(host_and_path("not-a-url"), None);
    }
}
