//! # Reconciler
//!
//! Core reconciliation for `GitJob` resources.
//!
//! Per resource, one pass runs the state machine:
//!
//! 1. Fetch by key; a deleted resource tears its poll watch down.
//! 2. Track (register a poll watch) or untrack (pinned revision).
//! 3. Resolve the target commit from observed status.
//! 4. Reconcile the child job for `(owner UID, commit)`, superseding stale
//!    children per the sync policy.
//! 5. Project the child phase and observed generation into status.
//!
//! Errors never abort the controller: they are recorded as a `Ready=False`
//! condition on the resource and requeued with exponential backoff.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::Action;
use kube_runtime::reflector::Store;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::crd::{Condition, GitJob, SyncPolicy};
use crate::git::auth::{AuthError, AuthSnapshot};
use crate::job::{self, JobError, ANNOTATION_GENERATION, LABEL_GITJOB};
use crate::metrics;
use crate::poller::GitPoller;

/// Requeue while the poller has not yet discovered the first commit.
const COMMIT_PENDING_REQUEUE: Duration = Duration::from_secs(5);
/// Requeue while waiting for a superseded child to finish.
const SUPERSEDED_REQUEUE: Duration = Duration::from_secs(10);
/// Periodic resync even when nothing appears to change.
const RESYNC_REQUEUE: Duration = Duration::from_secs(300);

const ANNOTATION_SUPERSEDED: &str = "gitjob.dev/superseded";

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("resource has no namespace")]
    MissingNamespace,
}

pub struct GitJobReconciler {
    pub client: Client,
    /// Image used for the clone init container of materialised children.
    pub image: String,
    pub poller: Arc<GitPoller>,
    pub store: Store<GitJob>,
    requeue_backoff: Mutex<HashMap<String, ExponentialBackoff>>,
}

impl GitJobReconciler {
    pub fn new(client: Client, image: String, poller: Arc<GitPoller>, store: Store<GitJob>) -> Self {
        Self {
            client,
            image,
            poller,
            store,
            requeue_backoff: Mutex::new(HashMap::new()),
        }
    }

    pub async fn reconcile(gitjob: Arc<GitJob>, ctx: Arc<GitJobReconciler>) -> Result<Action, Error> {
        let start = Instant::now();
        metrics::increment_reconciliations();

        let name = gitjob.name_any();
        let namespace = gitjob.namespace().ok_or(Error::MissingNamespace)?;
        let key = format!("{namespace}/{name}");
        let api: Api<GitJob> = Api::namespaced(ctx.client.clone(), &namespace);

        // The triggering object may be stale; read the latest by key.
        let gitjob = match api.get(&name).await {
            Ok(gitjob) => gitjob,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                info!(key = %key, "resource gone; dropping poll watch");
                ctx.poller.remove(&key);
                ctx.poller.purge(&ctx.store);
                ctx.clear_backoff(&key);
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e.into()),
        };

        let result = ctx.reconcile_live(&api, &gitjob, &namespace, &key).await;
        match &result {
            Ok(_) => {
                ctx.clear_backoff(&key);
                metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());
            }
            Err(e) => {
                // Best effort; the requeue will retry regardless.
                if let Err(status_err) = record_failure(&api, &gitjob, e).await {
                    debug!(key = %key, error = %status_err, "failed to record failure condition");
                }
            }
        }
        result
    }

    async fn reconcile_live(
        &self,
        api: &Api<GitJob>,
        gitjob: &GitJob,
        namespace: &str,
        key: &str,
    ) -> Result<Action, Error> {
        let name = gitjob.name_any();
        let mut gitjob = gitjob.clone();
        let auth = AuthSnapshot::load(&self.client, namespace, &gitjob.spec.git).await?;

        // Track or untrack. The poll manager op happens before any child
        // workload handling for this key.
        let commit = if gitjob.spec.is_pinned() {
            self.poller.remove(key);
            let revision = gitjob.spec.git.revision.clone().unwrap_or_default();
            if gitjob.observed_commit() != revision {
                gitjob = patch_commit(api, &gitjob, &revision).await?;
            }
            revision
        } else {
            self.poller.add_or_modify(&gitjob, auth.clone());
            gitjob.observed_commit().to_string()
        };
        let gitjob = &gitjob;

        // Nothing to run until a probe or webhook discovers the commit.
        if commit.is_empty() {
            debug!(key = %key, "no observed commit yet; requeueing");
            return Ok(Action::requeue(COMMIT_PENDING_REQUEUE));
        }

        if let Some(bundle_secret) = job::ca_bundle_secret(gitjob)? {
            self.ensure_ca_bundle_secret(namespace, bundle_secret).await?;
        }

        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let desired_name = job::child_job_name(gitjob, &commit);
        let generation = gitjob.metadata.generation.unwrap_or_default().to_string();

        let (phase, requeue) = match jobs.get_opt(&desired_name).await? {
            Some(existing) => {
                let stale_template = existing
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(ANNOTATION_GENERATION))
                    .is_some_and(|g| g != &generation);
                if stale_template {
                    info!(key = %key, job = %desired_name, "job template changed; replacing child");
                    jobs.delete(&desired_name, &DeleteParams::background()).await?;
                    return Ok(Action::requeue(Duration::from_secs(2)));
                }
                (job::job_phase(&existing), None)
            }
            None => {
                let owned = jobs
                    .list(&ListParams::default().labels(&format!("{LABEL_GITJOB}={name}")))
                    .await?;
                let active_old = owned
                    .items
                    .iter()
                    .find(|j| j.name_any() != desired_name && !job::job_is_finished(j));
                match active_old {
                    Some(old) if gitjob.spec.sync_policy() == SyncPolicy::Replace => {
                        info!(key = %key, job = %old.name_any(), "replacing superseded child");
                        jobs.delete(&old.name_any(), &DeleteParams::background()).await?;
                        return Ok(Action::requeue(Duration::from_secs(2)));
                    }
                    Some(old) => {
                        // Let the old child complete; mark it superseded so
                        // operators can see why nothing new is running yet.
                        mark_superseded(&jobs, old).await?;
                        (job::job_phase(old), Some(SUPERSEDED_REQUEUE))
                    }
                    None => {
                        let child = job::materialise(gitjob, &commit, &auth, &self.image)?;
                        match jobs.create(&PostParams::default(), &child).await {
                            Ok(_) => {
                                info!(key = %key, job = %desired_name, commit = %commit, "child job created");
                                metrics::increment_jobs_created();
                            }
                            // Lost a race against a concurrent resync; the
                            // job exists, which is all we wanted.
                            Err(kube::Error::Api(ae)) if ae.code == 409 => {}
                            Err(e) => return Err(e.into()),
                        }
                        ("Active", None)
                    }
                }
            }
        };

        match update_status(api, gitjob, &commit, phase).await {
            Ok(()) => {}
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                // Someone else (poller, webhook, user) moved the resource;
                // re-run promptly against the fresh version.
                return Ok(Action::requeue(Duration::from_secs(1)));
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Action::requeue(requeue.unwrap_or(RESYNC_REQUEUE)))
    }

    async fn ensure_ca_bundle_secret(&self, namespace: &str, secret: Secret) -> Result<(), Error> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let name = secret.metadata.name.clone().unwrap_or_default();
        match secrets.get_opt(&name).await? {
            None => {
                secrets.create(&PostParams::default(), &secret).await?;
            }
            Some(existing) if existing.data != secret.data => {
                let patch = serde_json::json!({ "data": secret.data });
                secrets
                    .patch(&name, &PatchParams::default(), &Patch::Merge(patch))
                    .await?;
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn clear_backoff(&self, key: &str) {
        self.requeue_backoff
            .lock()
            .expect("backoff map poisoned")
            .remove(key);
    }

    /// Error policy for the controller runtime: per-key exponential backoff,
    /// reset by the next successful reconcile.
    pub fn error_policy(gitjob: Arc<GitJob>, error: &Error, ctx: Arc<GitJobReconciler>) -> Action {
        metrics::increment_reconciliation_errors();
        let key = gitjob.watch_key();
        warn!(key = %key, error = %error, "reconciliation failed");
        let mut map = ctx.requeue_backoff.lock().expect("backoff map poisoned");
        let backoff = map
            .entry(key)
            .or_insert_with(|| ExponentialBackoff::new(5, 300));
        Action::requeue(backoff.next_backoff())
    }
}

async fn mark_superseded(jobs: &Api<Job>, old: &Job) -> Result<(), kube::Error> {
    let already = old
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(ANNOTATION_SUPERSEDED));
    if already {
        return Ok(());
    }
    let patch = serde_json::json!({
        "metadata": { "annotations": { ANNOTATION_SUPERSEDED: "true" } }
    });
    jobs.patch(&old.name_any(), &PatchParams::default(), &Patch::Merge(patch))
        .await?;
    Ok(())
}

/// Write the pinned revision into the observed commit, conditional on the
/// resource version we just read. Returns the updated resource so later
/// writes in the same pass carry the fresh version.
async fn patch_commit(
    api: &Api<GitJob>,
    gitjob: &GitJob,
    revision: &str,
) -> Result<GitJob, kube::Error> {
    let patch = serde_json::json!({
        "metadata": { "resourceVersion": gitjob.resource_version() },
        "status": { "commit": revision }
    });
    api.patch_status(
        &gitjob.name_any(),
        &PatchParams::default(),
        &Patch::Merge(patch),
    )
    .await
}

async fn update_status(
    api: &Api<GitJob>,
    gitjob: &GitJob,
    commit: &str,
    phase: &str,
) -> Result<(), kube::Error> {
    let ready = phase != "Failed";
    let condition = if ready {
        Condition::ready(true, "Reconciled", &format!("child job {phase}"))
    } else {
        Condition::ready(false, "JobFailed", "child job failed")
    };
    let patch = serde_json::json!({
        "metadata": { "resourceVersion": gitjob.resource_version() },
        "status": {
            "commit": commit,
            "jobStatus": phase,
            "observedGeneration": gitjob.metadata.generation,
            "conditions": [condition],
        }
    });
    api.patch_status(
        &gitjob.name_any(),
        &PatchParams::default(),
        &Patch::Merge(patch),
    )
    .await?;
    Ok(())
}

async fn record_failure(api: &Api<GitJob>, gitjob: &GitJob, error: &Error) -> Result<(), kube::Error> {
    let condition = Condition::ready(false, "ReconcileFailed", &error.to_string());
    let patch = serde_json::json!({
        "status": { "conditions": [condition] }
    });
    api.patch_status(
        &gitjob.name_any(),
        &PatchParams::default(),
        &Patch::Merge(patch),
    )
    .await?;
    Ok(())
}
