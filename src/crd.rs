//! # GitJob CRD
//!
//! The `GitJob` custom resource: a declarative description of a Git
//! repository target plus a job template. The controller keeps
//! `status.commit` synchronised with the tracked ref and materialises a
//! one-shot job per observed commit.

use k8s_openapi::api::batch::v1::JobTemplateSpec;
use k8s_openapi::ByteString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Sync interval applied when a webhook delivers a commit to a GitJob whose
/// `syncInterval` is 0, so the tracker keeps a slow poll as a safety net.
pub const WEBHOOK_DEFAULT_SYNC_INTERVAL_SECS: i32 = 3600;

/// GitJob Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: gitjob.dev/v1
/// kind: GitJob
/// metadata:
///   name: sync-manifests
///   namespace: default
/// spec:
///   git:
///     repo: https://github.com/example/manifests
///     branch: main
///   syncInterval: 15
///   jobTemplate:
///     spec:
///       template:
///         spec:
///           containers:
///             - name: apply
///               image: registry.example.com/kubectl:latest
///               command: ["kubectl", "apply", "-f", "/workspace/deploy"]
/// ```
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "GitJob",
    group = "gitjob.dev",
    version = "v1",
    namespaced,
    status = "GitJobStatus",
    printcolumn = r#"{"name":"Repo", "type":"string", "jsonPath":".spec.git.repo"}"#,
    printcolumn = r#"{"name":"Commit", "type":"string", "jsonPath":".status.commit"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GitJobSpec {
    /// Repository target and tracking mode
    pub git: GitInfo,
    /// Poll period in seconds. 0 means unset; a webhook-delivered commit
    /// coerces it to 3600 so the tracker is never left without a poll.
    #[serde(default)]
    pub sync_interval: i32,
    /// Opaque batch/v1 job template the controller materialises per commit.
    /// The cloned checkout is mounted at /workspace in every container.
    #[schemars(schema_with = "job_template_schema")]
    pub job_template: JobTemplateSpec,
    /// What to do with a still-running child when the target commit moves on
    #[serde(default)]
    pub sync_policy: Option<SyncPolicy>,
}

/// Git repository coordinates and credentials
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitInfo {
    /// Repository URL; http(s), ssh:// or scp-like git@host:path forms
    pub repo: String,
    /// Branch to track (without the refs/heads/ prefix)
    #[serde(default)]
    pub branch: Option<String>,
    /// Exact commit to run at. Setting this pins the GitJob and disables
    /// both polling and webhook tracking.
    #[serde(default)]
    pub revision: Option<String>,
    /// Semver constraint; when set, only tag events are considered and the
    /// newest satisfying tag wins
    #[serde(default)]
    pub on_tag: Option<String>,
    /// Name of a Secret in the GitJob's namespace holding basic-auth
    /// (`username`/`password`) or SSH (`ssh-privatekey`, optional
    /// `known_hosts`) material
    #[serde(default)]
    pub credential_secret: Option<String>,
    /// PEM bundle for the remote's TLS certificate chain
    #[serde(default)]
    #[schemars(schema_with = "byte_string_schema")]
    pub ca_bundle: Option<ByteString>,
    /// Skip TLS certificate verification when talking to the remote
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

/// Supersession policy for a running child whose commit is stale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum SyncPolicy {
    /// Let the old child run to completion before creating the next one
    Finish,
    /// Delete the old child immediately and create the new one
    Replace,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self::Finish
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitJobStatus {
    /// Last observed upstream commit for the tracked ref. Written only by
    /// the poller, the webhook dispatcher or the reconciler.
    #[serde(default)]
    pub commit: String,
    /// Phase of the current child job (Active, Succeeded or Failed)
    #[serde(default)]
    pub job_status: Option<String>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Condition represents a status condition for the resource
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of condition (True, False, Unknown)
    pub status: String,
    #[serde(default)]
    pub last_transition_time: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Condition {
    pub fn ready(status: bool, reason: &str, message: &str) -> Self {
        Self {
            r#type: "Ready".to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }
    }
}

impl GitJobSpec {
    /// A GitJob with an explicit revision is pinned: the poll manager
    /// carries no watch for it and webhooks skip it.
    pub fn is_pinned(&self) -> bool {
        self.git
            .revision
            .as_deref()
            .is_some_and(|r| !r.is_empty())
    }

    pub fn sync_policy(&self) -> SyncPolicy {
        self.sync_policy.unwrap_or_default()
    }
}

impl GitJob {
    /// `<namespace>/<name>` key used by the poll manager registry
    pub fn watch_key(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }

    pub fn observed_commit(&self) -> &str {
        self.status.as_ref().map_or("", |s| s.commit.as_str())
    }
}

/// The job template is deliberately schemaless: whatever batch/v1 template
/// the user writes is preserved and consumed verbatim by the reconciler.
fn job_template_schema(_gen: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}

fn byte_string_schema(_gen: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "string",
        "format": "byte"
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_spec() -> GitJobSpec {
        serde_json::from_value(serde_json::json!({
            "git": {"repo": "https://github.com/x/y", "branch": "main"},
            "jobTemplate": {"spec": {"template": {"spec": {"containers": []}}}}
        }))
        .unwrap()
    }

    #[test]
    fn minimal_spec_defaults() {
        let spec = minimal_spec();
        assert_eq!(spec.git.repo, "https://github.com/x/y");
        assert_eq!(spec.git.branch.as_deref(), Some("main"));
        assert_eq!(spec.sync_interval, 0);
        assert!(!spec.is_pinned());
        assert_eq!(spec.sync_policy(), SyncPolicy::Finish);
        assert!(!spec.git.insecure_skip_tls_verify);
    }

    #[test]
    fn empty_revision_does_not_pin() {
        let mut spec = minimal_spec();
        spec.git.revision = Some(String::new());
        assert!(!spec.is_pinned());
        spec.git.revision = Some("abc123".to_string());
        assert!(spec.is_pinned());
    }

    #[test]
    fn ready_condition_shape() {
        let cond = Condition::ready(false, "ProbeFailed", "remote unreachable");
        assert_eq!(cond.r#type, "Ready");
        assert_eq!(cond.status, "False");
        assert_eq!(cond.reason.as_deref(), Some("ProbeFailed"));
        assert!(cond.last_transition_time.is_some());
    }
}
