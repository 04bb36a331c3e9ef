//! Child workload materialisation.
//!
//! A child job's identity is pinned by `(owner UID, commit)`: the same
//! GitJob at the same commit always produces the same job name, so creation
//! is naturally idempotent. The user's template is preserved; the
//! reconciler injects a clone init container, a shared scratch volume and
//! owner references.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, Secret, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::crd::GitJob;
use crate::git::auth::{AuthSnapshot, GitCredential};

/// Where the checkout lands inside every container of the child pod.
pub const WORKSPACE_PATH: &str = "/workspace";

pub const LABEL_GITJOB: &str = "gitjob.dev/gitjob";
pub const LABEL_COMMIT: &str = "gitjob.dev/commit";
/// Spec generation the child was materialised from; a template edit bumps
/// the generation and supersedes the running child.
pub const ANNOTATION_GENERATION: &str = "gitjob.dev/generation";

const WORKSPACE_VOLUME: &str = "workspace";
const CREDENTIALS_VOLUME: &str = "git-credentials";
const CREDENTIALS_PATH: &str = "/gitjob/credentials";
const CA_BUNDLE_VOLUME: &str = "git-cabundle";
const CA_BUNDLE_PATH: &str = "/gitjob/cabundle";
const CA_BUNDLE_KEY: &str = "cabundle";

#[derive(Debug, Error)]
pub enum JobError {
    #[error("jobTemplate has no pod spec")]
    MissingPodSpec,
    #[error("resource has no uid; cannot own a child job")]
    MissingUid,
}

/// Deterministic child name: the owner's name plus a short hash of
/// `(owner UID, commit)`.
pub fn child_job_name(gitjob: &GitJob, commit: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(gitjob.uid().unwrap_or_default().as_bytes());
    hasher.update(commit.as_bytes());
    let digest = hex::encode(hasher.finalize());
    let name = gitjob.name_any();
    let name = &name[..name.len().min(50)];
    format!("{}-{}", name, &digest[..8])
}

/// Name of the controller-owned Secret carrying the spec's CA bundle into
/// the child pod.
pub fn ca_bundle_secret_name(gitjob: &GitJob) -> String {
    format!("{}-cabundle", gitjob.name_any())
}

/// The Secret holding `spec.git.caBundle`, when one is needed. Owned by the
/// GitJob so it is garbage-collected with it.
pub fn ca_bundle_secret(gitjob: &GitJob) -> Result<Option<Secret>, JobError> {
    let Some(bundle) = &gitjob.spec.git.ca_bundle else {
        return Ok(None);
    };
    let owner = gitjob.controller_owner_ref(&()).ok_or(JobError::MissingUid)?;
    Ok(Some(Secret {
        metadata: ObjectMeta {
            name: Some(ca_bundle_secret_name(gitjob)),
            namespace: gitjob.namespace(),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        data: Some([(CA_BUNDLE_KEY.to_string(), ByteString(bundle.0.clone()))].into()),
        ..Default::default()
    }))
}

/// Build the child job for `commit` from the GitJob's template, injecting
/// the clone init container and the shared scratch volume.
pub fn materialise(
    gitjob: &GitJob,
    commit: &str,
    auth: &AuthSnapshot,
    cloner_image: &str,
) -> Result<Job, JobError> {
    let owner = gitjob.controller_owner_ref(&()).ok_or(JobError::MissingUid)?;
    let template = &gitjob.spec.job_template;
    let mut job_spec = template.spec.clone().unwrap_or_default();
    let pod_template = &mut job_spec.template;
    let pod_spec = pod_template.spec.as_mut().ok_or(JobError::MissingPodSpec)?;

    let workspace_mount = VolumeMount {
        name: WORKSPACE_VOLUME.to_string(),
        mount_path: WORKSPACE_PATH.to_string(),
        ..Default::default()
    };

    let mut volumes = pod_spec.volumes.take().unwrap_or_default();
    volumes.push(Volume {
        name: WORKSPACE_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    });

    let mut init = Container {
        name: "gitcloner".to_string(),
        image: Some(cloner_image.to_string()),
        args: Some(cloner_args(gitjob, commit, auth)),
        volume_mounts: Some(vec![workspace_mount.clone()]),
        ..Default::default()
    };
    let init_mounts = init.volume_mounts.get_or_insert_with(Vec::new);

    if gitjob.spec.git.credential_secret.is_some() {
        volumes.push(Volume {
            name: CREDENTIALS_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: gitjob.spec.git.credential_secret.clone(),
                default_mode: Some(0o400),
                ..Default::default()
            }),
            ..Default::default()
        });
        init_mounts.push(VolumeMount {
            name: CREDENTIALS_VOLUME.to_string(),
            mount_path: CREDENTIALS_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }
    if gitjob.spec.git.ca_bundle.is_some() {
        volumes.push(Volume {
            name: CA_BUNDLE_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(ca_bundle_secret_name(gitjob)),
                ..Default::default()
            }),
            ..Default::default()
        });
        init_mounts.push(VolumeMount {
            name: CA_BUNDLE_VOLUME.to_string(),
            mount_path: CA_BUNDLE_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    pod_spec.volumes = Some(volumes);
    pod_spec
        .init_containers
        .get_or_insert_with(Vec::new)
        .push(init);
    for container in &mut pod_spec.containers {
        container
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(workspace_mount.clone());
    }
    if pod_spec.restart_policy.is_none() {
        pod_spec.restart_policy = Some("Never".to_string());
    }

    let mut metadata = template.metadata.clone().unwrap_or_default();
    metadata.name = Some(child_job_name(gitjob, commit));
    metadata.namespace = gitjob.namespace();
    metadata.owner_references = Some(vec![owner]);
    let labels = metadata.labels.get_or_insert_with(Default::default);
    labels.insert(LABEL_GITJOB.to_string(), gitjob.name_any());
    labels.insert(LABEL_COMMIT.to_string(), commit.to_string());
    let annotations = metadata.annotations.get_or_insert_with(Default::default);
    annotations.insert(
        ANNOTATION_GENERATION.to_string(),
        gitjob.metadata.generation.unwrap_or_default().to_string(),
    );

    Ok(Job {
        metadata,
        spec: Some(job_spec),
        status: None,
    })
}

/// Arguments for the clone executor, mirroring how the credential secret
/// and CA bundle are mounted into the init container.
fn cloner_args(gitjob: &GitJob, commit: &str, auth: &AuthSnapshot) -> Vec<String> {
    let git = &gitjob.spec.git;
    let mut args = vec![git.repo.clone(), WORKSPACE_PATH.to_string()];
    if let Some(branch) = git.branch.as_deref().filter(|b| !b.is_empty()) {
        args.push("--branch".to_string());
        args.push(branch.to_string());
    }
    if !commit.is_empty() {
        args.push("--revision".to_string());
        args.push(commit.to_string());
    }
    match &auth.credential {
        GitCredential::Anonymous => {}
        GitCredential::Basic { username, .. } => {
            args.push("--username".to_string());
            args.push(username.clone());
            args.push("--password-file".to_string());
            args.push(format!("{CREDENTIALS_PATH}/password"));
        }
        GitCredential::Ssh { known_hosts, .. } => {
            args.push("--ssh-private-key-file".to_string());
            args.push(format!("{CREDENTIALS_PATH}/ssh-privatekey"));
            if known_hosts.is_some() {
                args.push("--known-hosts-file".to_string());
                args.push(format!("{CREDENTIALS_PATH}/known_hosts"));
            }
        }
    }
    if git.ca_bundle.is_some() {
        args.push("--ca-bundle-file".to_string());
        args.push(format!("{CA_BUNDLE_PATH}/{CA_BUNDLE_KEY}"));
    }
    if git.insecure_skip_tls_verify {
        args.push("--insecure-skip-tls".to_string());
    }
    args
}

/// Project a child job's status into a phase string.
pub fn job_phase(job: &Job) -> &'static str {
    let Some(status) = &job.status else {
        return "Active";
    };
    if let Some(conditions) = &status.conditions {
        for condition in conditions {
            if condition.status == "True" {
                match condition.type_.as_str() {
                    "Complete" => return "Succeeded",
                    "Failed" => return "Failed",
                    _ => {}
                }
            }
        }
    }
    if status.succeeded.unwrap_or_default() > 0 {
        "Succeeded"
    } else if status.failed.unwrap_or_default() > 0 && status.active.unwrap_or_default() == 0 {
        "Failed"
    } else {
        "Active"
    }
}

pub fn job_is_finished(job: &Job) -> bool {
    matches!(job_phase(job), "Succeeded" | "Failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{GitInfo, GitJobSpec};
    use k8s_openapi::api::batch::v1::JobTemplateSpec;
    use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec};

    fn gitjob(git: GitInfo) -> GitJob {
        let mut job = GitJob::new(
            "sync-manifests",
            GitJobSpec {
                git,
                sync_interval: 15,
                job_template: JobTemplateSpec {
                    metadata: None,
                    spec: Some(k8s_openapi::api::batch::v1::JobSpec {
                        template: PodTemplateSpec {
                            metadata: None,
                            spec: Some(PodSpec {
                                containers: vec![Container {
                                    name: "apply".to_string(),
                                    image: Some("kubectl:latest".to_string()),
                                    ..Default::default()
                                }],
                                ..Default::default()
                            }),
                        },
                        ..Default::default()
                    }),
                },
                sync_policy: None,
            },
        );
        job.metadata.namespace = Some("default".to_string());
        job.metadata.uid = Some("uid-1234".to_string());
        job.metadata.generation = Some(3);
        job
    }

    fn plain_git() -> GitInfo {
        GitInfo {
            repo: "https://github.com/x/y".into(),
            branch: Some("main".into()),
            ..Default::default()
        }
    }

    #[test]
    fn child_name_is_deterministic_and_commit_scoped() {
        let gitjob = gitjob(plain_git());
        let a = child_job_name(&gitjob, "abc");
        let b = child_job_name(&gitjob, "abc");
        let c = child_job_name(&gitjob, "def");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("sync-manifests-"));
        assert!(a.len() <= 63);
    }

    #[test]
    fn materialise_injects_clone_step() {
        let gitjob = gitjob(plain_git());
        let job = materialise(&gitjob, "abc", &AuthSnapshot::default(), "gitjob:dev").unwrap();

        let pod_spec = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        let init = &pod_spec.init_containers.as_ref().unwrap()[0];
        assert_eq!(init.name, "gitcloner");
        assert_eq!(init.image.as_deref(), Some("gitjob:dev"));
        let args = init.args.as_ref().unwrap();
        assert_eq!(args[0], "https://github.com/x/y");
        assert_eq!(args[1], WORKSPACE_PATH);
        assert!(args.windows(2).any(|w| w == ["--branch", "main"]));
        assert!(args.windows(2).any(|w| w == ["--revision", "abc"]));

        // Scratch volume shared with the user container
        assert!(pod_spec
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .any(|v| v.name == WORKSPACE_VOLUME && v.empty_dir.is_some()));
        let user = &pod_spec.containers[0];
        assert!(user
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .any(|m| m.mount_path == WORKSPACE_PATH));
        assert_eq!(pod_spec.restart_policy.as_deref(), Some("Never"));

        // Ownership and bookkeeping
        let owner = &job.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "GitJob");
        assert_eq!(owner.uid, "uid-1234");
        assert_eq!(
            job.metadata.annotations.as_ref().unwrap()[ANNOTATION_GENERATION],
            "3"
        );
        assert_eq!(
            job.metadata.labels.as_ref().unwrap()[LABEL_COMMIT],
            "abc"
        );
    }

    #[test]
    fn basic_auth_flags_reference_mounted_secret() {
        let mut git = plain_git();
        git.credential_secret = Some("repo-creds".into());
        let gitjob = gitjob(git);
        let auth = AuthSnapshot {
            credential: GitCredential::Basic {
                username: "bot".into(),
                password: "unused-here".into(),
            },
            ca_bundle: None,
            insecure_skip_tls: false,
        };
        let job = materialise(&gitjob, "abc", &auth, "gitjob:dev").unwrap();
        let pod_spec = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        let args = pod_spec.init_containers.as_ref().unwrap()[0]
            .args
            .as_ref()
            .unwrap();
        assert!(args.windows(2).any(|w| w == ["--username", "bot"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["--password-file", "/gitjob/credentials/password"]));
        assert!(pod_spec
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .any(|v| v.secret.as_ref().is_some_and(|s| s.secret_name.as_deref()
                == Some("repo-creds"))));
    }

    #[test]
    fn ssh_auth_flags_and_known_hosts() {
        let mut git = plain_git();
        git.credential_secret = Some("repo-creds".into());
        let gitjob = gitjob(git);
        let auth = AuthSnapshot {
            credential: GitCredential::Ssh {
                private_key: b"KEY".to_vec(),
                known_hosts: Some(b"HOSTS".to_vec()),
            },
            ca_bundle: None,
            insecure_skip_tls: false,
        };
        let job = materialise(&gitjob, "abc", &auth, "gitjob:dev").unwrap();
        let args = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap()
            .init_containers
            .as_ref()
            .unwrap()[0]
            .args
            .clone()
            .unwrap();
        assert!(args
            .windows(2)
            .any(|w| w == ["--ssh-private-key-file", "/gitjob/credentials/ssh-privatekey"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["--known-hosts-file", "/gitjob/credentials/known_hosts"]));
    }

    #[test]
    fn ca_bundle_produces_owned_secret_and_flag() {
        let mut git = plain_git();
        git.ca_bundle = Some(ByteString(b"PEM".to_vec()));
        git.insecure_skip_tls_verify = true;
        let gitjob = gitjob(git);

        let secret = ca_bundle_secret(&gitjob).unwrap().unwrap();
        assert_eq!(secret.metadata.name.as_deref(), Some("sync-manifests-cabundle"));
        assert!(secret.metadata.owner_references.is_some());

        let job = materialise(&gitjob, "abc", &AuthSnapshot::default(), "gitjob:dev").unwrap();
        let args = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap()
            .init_containers
            .as_ref()
            .unwrap()[0]
            .args
            .clone()
            .unwrap();
        assert!(args
            .windows(2)
            .any(|w| w == ["--ca-bundle-file", "/gitjob/cabundle/cabundle"]));
        assert!(args.iter().any(|a| a == "--insecure-skip-tls"));
    }

    #[test]
    fn job_phase_projection() {
        use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
        let mut job = Job::default();
        assert_eq!(job_phase(&job), "Active");

        job.status = Some(JobStatus {
            active: Some(1),
            ..Default::default()
        });
        assert_eq!(job_phase(&job), "Active");
        assert!(!job_is_finished(&job));

        job.status = Some(JobStatus {
            succeeded: Some(1),
            conditions: Some(vec![JobCondition {
                type_: "Complete".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(job_phase(&job), "Succeeded");
        assert!(job_is_finished(&job));

        job.status = Some(JobStatus {
            failed: Some(2),
            conditions: Some(vec![JobCondition {
                type_: "Failed".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(job_phase(&job), "Failed");
    }
}
