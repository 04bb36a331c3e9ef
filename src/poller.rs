//! # Poll Manager
//!
//! Registry of poll watches, one per GitJob that tracks a moving ref. A
//! single cooperative scheduler wakes at the earliest `next_due`, probes the
//! due entries (parallel across entries, strictly serial per entry) and
//! publishes changed commits through the status sub-resource.
//!
//! Failures back off exponentially, capped at the entry's own interval;
//! auth failures pause the watch until the spec or credential secret
//! changes. All scheduling carries ±10% jitter so a large fleet of watches
//! does not synchronise its probes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use kube_runtime::reflector::Store;
use rand::Rng;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::backoff_for_attempt;
use crate::crd::GitJob;
use crate::git::{probe, AuthSnapshot, RefSelector};
use crate::metrics;

/// Poll period applied when `spec.syncInterval` is unset.
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 15;

/// First backoff step after a failed probe.
const MIN_BACKOFF_SECS: u64 = 10;

/// Probes running at once across all entries.
const MAX_CONCURRENT_PROBES: usize = 4;

/// Everything a probe needs, snapshotted at registration time so a Secret
/// rotation mid-flight cannot produce a half-updated probe.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchSpec {
    pub repo: String,
    pub selector: RefSelector,
    pub auth: AuthSnapshot,
    pub interval: Duration,
}

impl WatchSpec {
    pub fn new(gitjob: &GitJob, auth: AuthSnapshot) -> Self {
        let secs = if gitjob.spec.sync_interval > 0 {
            gitjob.spec.sync_interval as u64
        } else {
            DEFAULT_SYNC_INTERVAL_SECS
        };
        Self {
            repo: gitjob.spec.git.repo.clone(),
            selector: RefSelector::from_git(&gitjob.spec.git),
            auth,
            interval: Duration::from_secs(secs),
        }
    }
}

struct WatchEntry {
    spec: WatchSpec,
    last_probed_commit: Option<String>,
    next_due: Instant,
    consecutive_errors: u32,
    in_flight: bool,
    paused: bool,
}

enum ProbeOutcome {
    /// Probe resolved a commit (whether or not a write was needed)
    Success(String),
    /// Retry with backoff
    Transient,
    /// Pause until the spec or credentials change
    Sticky,
    /// The resource is gone; drop the entry
    Gone,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<String, WatchEntry>,
}

impl Registry {
    /// Idempotent upsert. An identical spec is a no-op; any change replaces
    /// the entry, resets the error counter and unpauses, preserving the
    /// last probed commit.
    fn upsert(&mut self, key: &str, spec: WatchSpec, now: Instant) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) if entry.spec == spec => false,
            Some(entry) => {
                entry.spec = spec;
                entry.consecutive_errors = 0;
                entry.paused = false;
                entry.next_due = now;
                true
            }
            None => {
                self.entries.insert(
                    key.to_string(),
                    WatchEntry {
                        spec,
                        last_probed_commit: None,
                        next_due: now,
                        consecutive_errors: 0,
                        in_flight: false,
                        paused: false,
                    },
                );
                true
            }
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Earliest wakeup among schedulable entries.
    fn next_wakeup(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter(|e| !e.in_flight && !e.paused)
            .map(|e| e.next_due)
            .min()
    }

    /// Pop every due entry, marking it in-flight so a slow probe is never
    /// overlapped by the next tick.
    fn take_due(&mut self, now: Instant) -> Vec<(String, WatchSpec)> {
        let mut due = Vec::new();
        for (key, entry) in &mut self.entries {
            if !entry.in_flight && !entry.paused && entry.next_due <= now {
                entry.in_flight = true;
                due.push((key.clone(), entry.spec.clone()));
            }
        }
        due
    }

    fn complete(&mut self, key: &str, outcome: &ProbeOutcome, now: Instant) {
        if matches!(outcome, ProbeOutcome::Gone) {
            self.entries.remove(key);
            return;
        }
        // The entry may have been removed or replaced while the probe ran.
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        entry.in_flight = false;
        match outcome {
            ProbeOutcome::Success(commit) => {
                entry.consecutive_errors = 0;
                entry.last_probed_commit = Some(commit.clone());
                entry.next_due = now + jitter(entry.spec.interval);
            }
            ProbeOutcome::Transient => {
                entry.consecutive_errors += 1;
                let backoff = backoff_for_attempt(
                    MIN_BACKOFF_SECS,
                    entry.spec.interval.as_secs(),
                    entry.consecutive_errors,
                );
                entry.next_due = now + jitter(backoff);
            }
            ProbeOutcome::Sticky => {
                entry.consecutive_errors += 1;
                entry.paused = true;
            }
            ProbeOutcome::Gone => unreachable!(),
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Apply ±10% jitter to a scheduling interval.
fn jitter(duration: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    duration.mul_f64(factor)
}

pub struct GitPoller {
    client: Client,
    registry: Mutex<Registry>,
    notify: Notify,
    probe_limit: Arc<Semaphore>,
}

impl GitPoller {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            registry: Mutex::new(Registry::default()),
            notify: Notify::new(),
            probe_limit: Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES)),
        }
    }

    /// Register or refresh the watch for a tracking GitJob with an already
    /// snapshotted credential. Re-registering with an unchanged spec is a
    /// no-op; a changed credential or spec replaces the entry.
    pub fn add_or_modify(&self, gitjob: &GitJob, auth: AuthSnapshot) {
        let spec = WatchSpec::new(gitjob, auth);
        let key = gitjob.watch_key();
        let changed = {
            let mut registry = self.registry.lock().expect("poller registry poisoned");
            registry.upsert(&key, spec, Instant::now())
        };
        if changed {
            debug!(key = %key, "poll watch registered");
            self.notify.notify_one();
        }
        self.update_gauge();
    }

    /// Cancel the watch for a key, if present.
    pub fn remove(&self, key: &str) {
        let removed = {
            let mut registry = self.registry.lock().expect("poller registry poisoned");
            registry.remove(key)
        };
        if removed {
            debug!(key = %key, "poll watch removed");
            self.notify.notify_one();
        }
        self.update_gauge();
    }

    /// Drop every watch whose GitJob no longer exists in the shared cache.
    pub fn purge(&self, store: &Store<GitJob>) {
        let live: Vec<String> = store.state().iter().map(|g| g.watch_key()).collect();
        let mut removed = 0;
        {
            let mut registry = self.registry.lock().expect("poller registry poisoned");
            let stale: Vec<String> = registry
                .entries
                .keys()
                .filter(|k| !live.contains(k))
                .cloned()
                .collect();
            for key in stale {
                registry.remove(&key);
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "purged poll watches for deleted resources");
            self.notify.notify_one();
        }
        self.update_gauge();
    }

    pub fn contains(&self, key: &str) -> bool {
        self.registry
            .lock()
            .expect("poller registry poisoned")
            .entries
            .contains_key(key)
    }

    pub fn watch_count(&self) -> usize {
        self.registry.lock().expect("poller registry poisoned").len()
    }

    fn update_gauge(&self) {
        metrics::set_poll_watches(self.watch_count() as i64);
    }

    /// Scheduler loop. Runs until the token is cancelled, then drains the
    /// registry.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("poll manager started");
        loop {
            let wakeup = {
                self.registry
                    .lock()
                    .expect("poller registry poisoned")
                    .next_wakeup()
            };
            let sleep = async {
                match wakeup {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.notify.notified() => continue,
                _ = sleep => {}
            }

            let due = {
                self.registry
                    .lock()
                    .expect("poller registry poisoned")
                    .take_due(Instant::now())
            };
            for (key, spec) in due {
                let poller = Arc::clone(&self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let _permit = poller.probe_limit.acquire().await;
                    let outcome = if shutdown.is_cancelled() {
                        ProbeOutcome::Transient
                    } else {
                        poller.probe_and_publish(&key, &spec).await
                    };
                    poller
                        .registry
                        .lock()
                        .expect("poller registry poisoned")
                        .complete(&key, &outcome, Instant::now());
                    poller.update_gauge();
                    poller.notify.notify_one();
                });
            }
        }
        self.registry
            .lock()
            .expect("poller registry poisoned")
            .entries
            .clear();
        self.update_gauge();
        info!("poll manager stopped");
    }

    /// Probe the remote and, when the resolved commit differs from the
    /// resource's observed commit, write it through the status sub-resource
    /// with a resource-version precondition. A conflict triggers one full
    /// re-read + re-probe.
    async fn probe_and_publish(&self, key: &str, spec: &WatchSpec) -> ProbeOutcome {
        let Some((namespace, name)) = key.split_once('/') else {
            warn!(key = %key, "malformed watch key");
            return ProbeOutcome::Gone;
        };
        let api: Api<GitJob> = Api::namespaced(self.client.clone(), namespace);

        for attempt in 0..2 {
            let gitjob = match api.get(name).await {
                Ok(g) => g,
                Err(kube::Error::Api(ae)) if ae.code == 404 => return ProbeOutcome::Gone,
                Err(e) => {
                    warn!(key = %key, error = %e, "failed to read resource before probe");
                    return ProbeOutcome::Transient;
                }
            };
            let resource_version = gitjob.resource_version().unwrap_or_default();

            metrics::increment_probes();
            let probe_spec = spec.clone();
            let probed = tokio::task::spawn_blocking(move || {
                probe(&probe_spec.repo, &probe_spec.auth, &probe_spec.selector)
            })
            .await;
            let commit = match probed {
                Ok(Ok(commit)) => commit,
                Ok(Err(e)) => {
                    metrics::increment_probe_errors();
                    if e.is_sticky() {
                        warn!(key = %key, error = %e, "probe failed; pausing watch until spec changes");
                        return ProbeOutcome::Sticky;
                    }
                    debug!(key = %key, error = %e, "probe failed");
                    return ProbeOutcome::Transient;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "probe task aborted");
                    return ProbeOutcome::Transient;
                }
            };

            if gitjob.observed_commit() == commit {
                return ProbeOutcome::Success(commit);
            }

            let patch = serde_json::json!({
                "metadata": { "resourceVersion": resource_version },
                "status": { "commit": commit }
            });
            match api
                .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
                .await
            {
                Ok(_) => {
                    info!(key = %key, commit = %commit, "observed commit updated from poll");
                    return ProbeOutcome::Success(commit);
                }
                Err(kube::Error::Api(ae)) if ae.code == 409 && attempt == 0 => {
                    debug!(key = %key, "status write conflicted; re-reading and re-probing");
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "failed to publish probed commit");
                    return ProbeOutcome::Transient;
                }
            }
        }
        ProbeOutcome::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::GitInfo;

    fn spec(repo: &str, branch: &str, interval: Duration) -> WatchSpec {
        WatchSpec {
            repo: repo.to_string(),
            selector: RefSelector::Branch(branch.to_string()),
            auth: AuthSnapshot::default(),
            interval,
        }
    }

    #[test]
    fn upsert_is_idempotent_for_identical_specs() {
        let mut registry = Registry::default();
        let now = Instant::now();
        assert!(registry.upsert("ns/a", spec("r", "main", Duration::from_secs(15)), now));
        registry.entries.get_mut("ns/a").unwrap().consecutive_errors = 3;
        registry.entries.get_mut("ns/a").unwrap().last_probed_commit = Some("abc".into());

        // Identical spec: no-op, counters untouched
        assert!(!registry.upsert("ns/a", spec("r", "main", Duration::from_secs(15)), now));
        let entry = &registry.entries["ns/a"];
        assert_eq!(entry.consecutive_errors, 3);
        assert_eq!(entry.last_probed_commit.as_deref(), Some("abc"));
    }

    #[test]
    fn upsert_replaces_on_spec_change_and_resets_errors() {
        let mut registry = Registry::default();
        let now = Instant::now();
        registry.upsert("ns/a", spec("r", "main", Duration::from_secs(15)), now);
        {
            let entry = registry.entries.get_mut("ns/a").unwrap();
            entry.consecutive_errors = 5;
            entry.paused = true;
            entry.last_probed_commit = Some("abc".into());
        }

        assert!(registry.upsert("ns/a", spec("r", "release", Duration::from_secs(15)), now));
        let entry = &registry.entries["ns/a"];
        assert_eq!(entry.consecutive_errors, 0);
        assert!(!entry.paused);
        // Last probed commit survives the replacement
        assert_eq!(entry.last_probed_commit.as_deref(), Some("abc"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn due_entries_are_serial_per_key() {
        let mut registry = Registry::default();
        let now = Instant::now();
        registry.upsert("ns/a", spec("r", "main", Duration::from_secs(15)), now);

        let due = registry.take_due(now);
        assert_eq!(due.len(), 1);
        // Still in flight: not due again until completed
        assert!(registry.take_due(now + Duration::from_secs(60)).is_empty());

        registry.complete("ns/a", &ProbeOutcome::Success("abc".into()), now);
        assert!(!registry.take_due(now).is_empty() || registry.next_wakeup().unwrap() > now);
    }

    #[test]
    fn success_schedules_at_interval_with_jitter_bounds() {
        let mut registry = Registry::default();
        let now = Instant::now();
        let interval = Duration::from_secs(100);
        registry.upsert("ns/a", spec("r", "main", interval), now);
        registry.take_due(now);
        registry.complete("ns/a", &ProbeOutcome::Success("abc".into()), now);

        let entry = &registry.entries["ns/a"];
        let delta = entry.next_due - now;
        assert!(delta >= Duration::from_secs(90), "delta {delta:?}");
        assert!(delta <= Duration::from_secs(110), "delta {delta:?}");
        assert_eq!(entry.last_probed_commit.as_deref(), Some("abc"));
    }

    #[test]
    fn failures_back_off_capped_at_interval() {
        let mut registry = Registry::default();
        let now = Instant::now();
        let interval = Duration::from_secs(40);
        registry.upsert("ns/a", spec("r", "main", interval), now);

        for expected in [10u64, 20, 40, 40] {
            registry.take_due(registry.entries["ns/a"].next_due);
            let at = Instant::now();
            registry.complete("ns/a", &ProbeOutcome::Transient, at);
            let delta = registry.entries["ns/a"].next_due - at;
            let expected = Duration::from_secs(expected);
            assert!(delta >= expected.mul_f64(0.9), "delta {delta:?} vs {expected:?}");
            assert!(delta <= expected.mul_f64(1.1), "delta {delta:?} vs {expected:?}");
        }
    }

    #[test]
    fn sticky_errors_pause_the_watch() {
        let mut registry = Registry::default();
        let now = Instant::now();
        registry.upsert("ns/a", spec("r", "main", Duration::from_secs(15)), now);
        registry.take_due(now);
        registry.complete("ns/a", &ProbeOutcome::Sticky, now);

        assert!(registry.entries["ns/a"].paused);
        assert_eq!(registry.next_wakeup(), None);
        assert!(registry.take_due(now + Duration::from_secs(3600)).is_empty());

        // A spec change (e.g. rotated credentials) unpauses
        registry.upsert("ns/a", spec("r", "release", Duration::from_secs(15)), now);
        assert!(!registry.entries["ns/a"].paused);
        assert_eq!(registry.take_due(now).len(), 1);
    }

    #[test]
    fn gone_outcome_drops_the_entry() {
        let mut registry = Registry::default();
        let now = Instant::now();
        registry.upsert("ns/a", spec("r", "main", Duration::from_secs(15)), now);
        registry.take_due(now);
        registry.complete("ns/a", &ProbeOutcome::Gone, now);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn watch_spec_defaults_interval() {
        let gitjob = GitJob::new(
            "a",
            crate::crd::GitJobSpec {
                git: GitInfo {
                    repo: "https://example.com/x/y".into(),
                    branch: Some("main".into()),
                    ..Default::default()
                },
                sync_interval: 0,
                job_template: Default::default(),
                sync_policy: None,
            },
        );
        let spec = WatchSpec::new(&gitjob, AuthSnapshot::default());
        assert_eq!(spec.interval, Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS));
        assert_eq!(spec.selector, RefSelector::Branch("main".into()));
    }
}
