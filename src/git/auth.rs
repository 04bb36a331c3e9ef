//! Credential snapshots for git transports.
//!
//! Auth material is copied out of the referenced Secret when a watch is
//! registered (or when the clone executor starts), so in-flight probes stay
//! consistent while a Secret rotation lands. A snapshot is materialised into
//! `git` CLI configuration just before each invocation.

use std::fmt;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use thiserror::Error;

use crate::crd::GitInfo;

const USERNAME_KEY: &str = "username";
const PASSWORD_KEY: &str = "password";
const SSH_PRIVATE_KEY_KEY: &str = "ssh-privatekey";
const KNOWN_HOSTS_KEY: &str = "known_hosts";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credential secret {0} not found")]
    SecretNotFound(String),
    #[error("credential secret {0} holds neither basic-auth nor ssh material")]
    Malformed(String),
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error("failed to materialise credentials: {0}")]
    Io(#[from] std::io::Error),
}

/// Selected credential, already resolved to raw material
#[derive(Clone, PartialEq, Eq)]
pub enum GitCredential {
    Anonymous,
    Basic {
        username: String,
        password: String,
    },
    Ssh {
        private_key: Vec<u8>,
        known_hosts: Option<Vec<u8>>,
    },
}

/// Everything a single git invocation needs to authenticate and trust the
/// remote. One snapshot per watch entry or clone invocation.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthSnapshot {
    pub credential: GitCredential,
    pub ca_bundle: Option<Vec<u8>>,
    pub insecure_skip_tls: bool,
}

impl Default for AuthSnapshot {
    fn default() -> Self {
        Self {
            credential: GitCredential::Anonymous,
            ca_bundle: None,
            insecure_skip_tls: false,
        }
    }
}

impl fmt::Debug for AuthSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.credential {
            GitCredential::Anonymous => "anonymous",
            GitCredential::Basic { .. } => "basic",
            GitCredential::Ssh { .. } => "ssh",
        };
        f.debug_struct("AuthSnapshot")
            .field("credential", &kind)
            .field("ca_bundle", &self.ca_bundle.as_ref().map(|b| b.len()))
            .field("insecure_skip_tls", &self.insecure_skip_tls)
            .finish()
    }
}

impl AuthSnapshot {
    /// Snapshot the GitJob's credential secret (if any) plus the TLS options
    /// carried on the spec itself.
    ///
    /// Selection precedence inside the secret: an SSH private key wins over
    /// basic-auth material; a secret with neither is rejected.
    pub async fn load(client: &Client, namespace: &str, git: &GitInfo) -> Result<Self, AuthError> {
        let credential = match git.credential_secret.as_deref().filter(|s| !s.is_empty()) {
            None => GitCredential::Anonymous,
            Some(name) => {
                let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
                let secret = match secrets.get(name).await {
                    Ok(s) => s,
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {
                        return Err(AuthError::SecretNotFound(name.to_string()));
                    }
                    Err(e) => return Err(e.into()),
                };
                credential_from_secret(name, &secret)?
            }
        };
        Ok(Self {
            credential,
            ca_bundle: git.ca_bundle.as_ref().map(|b| b.0.clone()),
            insecure_skip_tls: git.insecure_skip_tls_verify,
        })
    }

    /// Build a snapshot from files on disk, as the clone executor CLI does.
    /// The same precedence applies: SSH key beats basic auth.
    pub fn from_files(
        username: Option<&str>,
        password_file: Option<&Path>,
        ssh_private_key_file: Option<&Path>,
        known_hosts_file: Option<&Path>,
        ca_bundle_file: Option<&Path>,
        insecure_skip_tls: bool,
    ) -> Result<Self, AuthError> {
        let credential = if let Some(key_file) = ssh_private_key_file {
            let private_key = std::fs::read(key_file)?;
            let known_hosts = known_hosts_file.map(std::fs::read).transpose()?;
            GitCredential::Ssh {
                private_key,
                known_hosts,
            }
        } else if let (Some(username), Some(password_file)) = (username, password_file) {
            let password = String::from_utf8_lossy(&std::fs::read(password_file)?)
                .trim_end_matches(['\r', '\n'])
                .to_string();
            GitCredential::Basic {
                username: username.to_string(),
                password,
            }
        } else {
            GitCredential::Anonymous
        };
        let ca_bundle = ca_bundle_file.map(std::fs::read).transpose()?;
        Ok(Self {
            credential,
            ca_bundle,
            insecure_skip_tls,
        })
    }

    /// Write the snapshot out as git CLI configuration: `-c` pairs, process
    /// environment and the (possibly rewritten) remote URL. The returned
    /// value owns a temp directory holding key material; it must outlive the
    /// git invocation.
    pub fn materialise(&self, repo: &str) -> Result<MaterialisedAuth, AuthError> {
        let dir = tempfile::tempdir()?;
        // No inherited credential helpers: everything git needs is explicit.
        let mut config = vec!["credential.helper=".to_string()];
        let mut env = Vec::new();
        let mut url = repo.to_string();

        match &self.credential {
            GitCredential::Anonymous => {}
            GitCredential::Basic { username, password } => {
                let password_path = dir.path().join("password");
                write_private(&password_path, password.as_bytes())?;
                let askpass_path = dir.path().join("askpass.sh");
                write_executable(
                    &askpass_path,
                    format!("#!/bin/sh\ncat {}\n", password_path.display()).as_bytes(),
                )?;
                env.push(("GIT_ASKPASS".to_string(), askpass_path.display().to_string()));
                url = inject_username(repo, username);
            }
            GitCredential::Ssh {
                private_key,
                known_hosts,
            } => {
                let key_path = dir.path().join("id");
                write_private(&key_path, private_key)?;
                let mut ssh_command = format!(
                    "ssh -i {} -o IdentitiesOnly=yes -o BatchMode=yes",
                    key_path.display()
                );
                match known_hosts {
                    Some(hosts) => {
                        let hosts_path = dir.path().join("known_hosts");
                        write_private(&hosts_path, hosts)?;
                        ssh_command.push_str(&format!(
                            " -o StrictHostKeyChecking=yes -o UserKnownHostsFile={}",
                            hosts_path.display()
                        ));
                    }
                    // The executor is ephemeral and has no persistent trust
                    // store; without known_hosts, host keys are accepted.
                    None => ssh_command.push_str(
                        " -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null",
                    ),
                }
                env.push(("GIT_SSH_COMMAND".to_string(), ssh_command));
            }
        }

        if let Some(bundle) = &self.ca_bundle {
            let bundle_path = dir.path().join("ca-bundle.pem");
            write_private(&bundle_path, bundle)?;
            config.push(format!("http.sslCAInfo={}", bundle_path.display()));
        }
        if self.insecure_skip_tls {
            config.push("http.sslVerify=false".to_string());
        }

        Ok(MaterialisedAuth {
            _dir: dir,
            config,
            env,
            url,
        })
    }
}

/// Auth rendered for one git invocation. Dropping this removes the key
/// material from disk.
pub struct MaterialisedAuth {
    _dir: tempfile::TempDir,
    pub config: Vec<String>,
    pub env: Vec<(String, String)>,
    pub url: String,
}

fn credential_from_secret(name: &str, secret: &Secret) -> Result<GitCredential, AuthError> {
    let data = secret.data.as_ref();
    let get = |key: &str| data.and_then(|d| d.get(key)).map(|b| b.0.clone());

    if let Some(private_key) = get(SSH_PRIVATE_KEY_KEY) {
        return Ok(GitCredential::Ssh {
            private_key,
            known_hosts: get(KNOWN_HOSTS_KEY),
        });
    }
    if let (Some(username), Some(password)) = (get(USERNAME_KEY), get(PASSWORD_KEY)) {
        return Ok(GitCredential::Basic {
            username: String::from_utf8_lossy(&username).trim().to_string(),
            password: String::from_utf8_lossy(&password)
                .trim_end_matches(['\r', '\n'])
                .to_string(),
        });
    }
    Err(AuthError::Malformed(name.to_string()))
}

fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    write_with_mode(path, contents, 0o600)
}

fn write_executable(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    write_with_mode(path, contents, 0o700)
}

fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(contents)?;
    let mut perms = file.metadata()?.permissions();
    perms.set_mode(mode);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

/// Place the basic-auth username into an http(s) URL's authority, replacing
/// any userinfo already present. Non-http URLs are left alone.
fn inject_username(repo: &str, username: &str) -> String {
    for scheme in ["https://", "http://"] {
        if let Some(rest) = repo.strip_prefix(scheme) {
            let split = rest.find('/').unwrap_or(rest.len());
            let (authority, tail) = rest.split_at(split);
            let host = authority.rsplit('@').next().unwrap_or(authority);
            return format!("{scheme}{}@{host}{tail}", encode_userinfo(username));
        }
    }
    repo.to_string()
}

fn encode_userinfo(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '@' => out.push_str("%40"),
            ':' => out.push_str("%3A"),
            '/' => out.push_str("%2F"),
            _ => out.push(c),
        }
    }
    out
}
