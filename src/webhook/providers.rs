//! Webhook provider dispatch.
//!
//! Each supported provider is detected from request headers through a
//! dispatch table, verified against its configured secret, and parsed into
//! a provider-agnostic [`NormalizedEvent`]. The dispatcher itself stays
//! agnostic to the provider set.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use k8s_openapi::api::core::v1::Secret;
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

/// Secret holding the per-provider webhook verification material.
pub const WEBHOOK_SECRET_NAME: &str = "gitjob-webhook";

const GITHUB_KEY: &str = "github";
const GITLAB_KEY: &str = "gitlab";
const BITBUCKET_KEY: &str = "bitbucket";
const BITBUCKET_SERVER_KEY: &str = "bitbucket-server";
const GOGS_KEY: &str = "gogs";

const BRANCH_REF_PREFIX: &str = "refs/heads/";
const TAG_REF_PREFIX: &str = "refs/tags/";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unsupported {0} event type {1:?}")]
    UnsupportedEvent(&'static str, String),
    #[error("missing webhook signature")]
    SignatureMissing,
    #[error("webhook signature verification failed")]
    SignatureMismatch,
    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Gogs,
    GitHub,
    GitLab,
    BitbucketCloud,
    BitbucketServer,
    AzureDevops,
}

impl Provider {
    pub fn name(self) -> &'static str {
        match self {
            Provider::Gogs => "gogs",
            Provider::GitHub => "github",
            Provider::GitLab => "gitlab",
            Provider::BitbucketCloud => "bitbucket",
            Provider::BitbucketServer => "bitbucket-server",
            Provider::AzureDevops => "azure-devops",
        }
    }
}

type HeaderPredicate = fn(&HeaderMap) -> bool;

/// Detection order matters: Gogs requests carry both Gogs and
/// (incompatible) GitHub headers, so Gogs is checked first.
const DETECTION_TABLE: &[(HeaderPredicate, Provider)] = &[
    (|h| h.contains_key("x-gogs-event"), Provider::Gogs),
    (|h| h.contains_key("x-github-event"), Provider::GitHub),
    (|h| h.contains_key("x-gitlab-event"), Provider::GitLab),
    (|h| h.contains_key("x-hook-uuid"), Provider::BitbucketCloud),
    (|h| h.contains_key("x-event-key"), Provider::BitbucketServer),
    (
        |h| h.contains_key("x-vss-activityid") || h.contains_key("x-vss-subscriptionid"),
        Provider::AzureDevops,
    ),
];

/// Identify the sending provider, or `None` for unrelated traffic.
pub fn detect(headers: &HeaderMap) -> Option<Provider> {
    DETECTION_TABLE
        .iter()
        .find(|(predicate, _)| predicate(headers))
        .map(|&(_, provider)| provider)
}

/// Per-provider verification material, hot-reloaded from the
/// `gitjob-webhook` Secret. An absent key disables verification for that
/// provider without disabling the endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderSecrets {
    pub github: Option<String>,
    pub gitlab: Option<String>,
    pub bitbucket: Option<String>,
    pub bitbucket_server: Option<String>,
    pub gogs: Option<String>,
}

impl ProviderSecrets {
    pub fn from_secret(secret: &Secret) -> Self {
        let get = |key: &str| {
            secret
                .data
                .as_ref()
                .and_then(|d| d.get(key))
                .map(|b| String::from_utf8_lossy(&b.0).trim().to_string())
                .filter(|s| !s.is_empty())
        };
        Self {
            github: get(GITHUB_KEY),
            gitlab: get(GITLAB_KEY),
            bitbucket: get(BITBUCKET_KEY),
            bitbucket_server: get(BITBUCKET_SERVER_KEY),
            gogs: get(GOGS_KEY),
        }
    }
}

/// Provider-agnostic shape of a push or tag event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedEvent {
    pub repo_urls: Vec<String>,
    pub branch: String,
    pub tag: String,
    pub revision: String,
}

/// Verify and parse a provider request body into a normalized event.
pub fn parse(
    provider: Provider,
    headers: &HeaderMap,
    body: &[u8],
    secrets: &ProviderSecrets,
) -> Result<NormalizedEvent, ParseError> {
    match provider {
        Provider::Gogs => parse_gogs(headers, body, secrets),
        Provider::GitHub => parse_github(headers, body, secrets),
        Provider::GitLab => parse_gitlab(headers, body, secrets),
        Provider::BitbucketCloud => parse_bitbucket(headers, body, secrets),
        Provider::BitbucketServer => parse_bitbucket_server(headers, body, secrets),
        Provider::AzureDevops => parse_azure_devops(body),
    }
}

/// `refs/heads/X` → `(X, "")`, `refs/tags/X` → `("", X)`, anything else →
/// `("", "")`.
pub fn branch_tag_from_ref(ref_name: &str) -> (String, String) {
    if let Some(branch) = ref_name.strip_prefix(BRANCH_REF_PREFIX) {
        return (branch.to_string(), String::new());
    }
    if let Some(tag) = ref_name.strip_prefix(TAG_REF_PREFIX) {
        return (String::new(), tag.to_string());
    }
    (String::new(), String::new())
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Constant-time HMAC-SHA256 check of `signature_hex` over `body`.
fn verify_hmac_sha256(secret: &str, body: &[u8], signature_hex: &str) -> Result<(), ParseError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| ParseError::SignatureMismatch)?;
    mac.update(body);
    let expected = hex::decode(signature_hex.trim()).map_err(|_| ParseError::SignatureMismatch)?;
    mac.verify_slice(&expected)
        .map_err(|_| ParseError::SignatureMismatch)
}

#[derive(Deserialize)]
struct GitHubPush {
    #[serde(rename = "ref")]
    ref_name: String,
    #[serde(default)]
    after: String,
    repository: GitHubRepository,
}

#[derive(Deserialize)]
struct GitHubRepository {
    html_url: String,
}

fn parse_github(
    headers: &HeaderMap,
    body: &[u8],
    secrets: &ProviderSecrets,
) -> Result<NormalizedEvent, ParseError> {
    if let Some(secret) = &secrets.github {
        let signature = header(headers, "x-hub-signature-256")
            .and_then(|s| s.strip_prefix("sha256="))
            .ok_or(ParseError::SignatureMissing)?;
        verify_hmac_sha256(secret, body, signature)?;
    }
    let event = header(headers, "x-github-event").unwrap_or_default();
    if event != "push" {
        return Err(ParseError::UnsupportedEvent("github", event.to_string()));
    }
    let payload: GitHubPush = serde_json::from_slice(body)?;
    let (branch, tag) = branch_tag_from_ref(&payload.ref_name);
    Ok(NormalizedEvent {
        repo_urls: vec![payload.repository.html_url],
        branch,
        tag,
        revision: payload.after,
    })
}

#[derive(Deserialize)]
struct GitLabPush {
    #[serde(rename = "ref")]
    ref_name: String,
    #[serde(default)]
    checkout_sha: Option<String>,
    project: GitLabProject,
}

#[derive(Deserialize)]
struct GitLabProject {
    web_url: String,
}

fn parse_gitlab(
    headers: &HeaderMap,
    body: &[u8],
    secrets: &ProviderSecrets,
) -> Result<NormalizedEvent, ParseError> {
    if let Some(secret) = &secrets.gitlab {
        let token = header(headers, "x-gitlab-token").ok_or(ParseError::SignatureMissing)?;
        if token != secret {
            return Err(ParseError::SignatureMismatch);
        }
    }
    let event = header(headers, "x-gitlab-event").unwrap_or_default();
    if event != "Push Hook" && event != "Tag Push Hook" {
        return Err(ParseError::UnsupportedEvent("gitlab", event.to_string()));
    }
    let payload: GitLabPush = serde_json::from_slice(body)?;
    let (branch, tag) = branch_tag_from_ref(&payload.ref_name);
    Ok(NormalizedEvent {
        repo_urls: vec![payload.project.web_url],
        branch,
        tag,
        revision: payload.checkout_sha.unwrap_or_default(),
    })
}

#[derive(Deserialize)]
struct BitbucketPush {
    push: BitbucketChanges,
    repository: BitbucketRepository,
}

#[derive(Deserialize)]
struct BitbucketChanges {
    #[serde(default)]
    changes: Vec<BitbucketChange>,
}

#[derive(Deserialize)]
struct BitbucketChange {
    new: Option<BitbucketRefState>,
}

#[derive(Deserialize)]
struct BitbucketRefState {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    target: BitbucketTarget,
}

#[derive(Deserialize)]
struct BitbucketTarget {
    hash: String,
}

#[derive(Deserialize)]
struct BitbucketRepository {
    links: BitbucketLinks,
}

#[derive(Deserialize)]
struct BitbucketLinks {
    html: BitbucketHref,
}

#[derive(Deserialize)]
struct BitbucketHref {
    href: String,
}

fn parse_bitbucket(
    headers: &HeaderMap,
    body: &[u8],
    secrets: &ProviderSecrets,
) -> Result<NormalizedEvent, ParseError> {
    if let Some(uuid) = &secrets.bitbucket {
        let hook_uuid = header(headers, "x-hook-uuid").ok_or(ParseError::SignatureMissing)?;
        if hook_uuid != uuid {
            return Err(ParseError::SignatureMismatch);
        }
    }
    let event = header(headers, "x-event-key").unwrap_or_default();
    if event != "repo:push" {
        return Err(ParseError::UnsupportedEvent("bitbucket", event.to_string()));
    }
    let payload: BitbucketPush = serde_json::from_slice(body)?;
    let mut event = NormalizedEvent {
        repo_urls: vec![payload.repository.links.html.href],
        ..Default::default()
    };
    // Only the first change is inspected.
    if let Some(state) = payload.push.changes.into_iter().next().and_then(|c| c.new) {
        event.revision = state.target.hash;
        match state.kind.as_str() {
            "branch" => event.branch = state.name,
            "tag" => event.tag = state.name,
            _ => {}
        }
    }
    Ok(event)
}

#[derive(Deserialize)]
struct BitbucketServerPush {
    #[serde(default)]
    changes: Vec<BitbucketServerChange>,
    repository: BitbucketServerRepository,
}

#[derive(Deserialize)]
struct BitbucketServerChange {
    #[serde(rename = "refId")]
    ref_id: String,
    #[serde(rename = "toHash")]
    to_hash: String,
}

#[derive(Deserialize)]
struct BitbucketServerRepository {
    links: BitbucketServerLinks,
}

#[derive(Deserialize)]
struct BitbucketServerLinks {
    #[serde(default)]
    clone: Vec<BitbucketServerCloneLink>,
}

#[derive(Deserialize)]
struct BitbucketServerCloneLink {
    name: String,
    href: String,
}

fn parse_bitbucket_server(
    headers: &HeaderMap,
    body: &[u8],
    secrets: &ProviderSecrets,
) -> Result<NormalizedEvent, ParseError> {
    if let Some(secret) = &secrets.bitbucket_server {
        let signature = header(headers, "x-hub-signature")
            .and_then(|s| s.strip_prefix("sha256="))
            .ok_or(ParseError::SignatureMissing)?;
        verify_hmac_sha256(secret, body, signature)?;
    }
    let event = header(headers, "x-event-key").unwrap_or_default();
    if event != "repo:refs_changed" {
        return Err(ParseError::UnsupportedEvent(
            "bitbucket-server",
            event.to_string(),
        ));
    }
    let payload: BitbucketServerPush = serde_json::from_slice(body)?;
    let repo_urls = payload
        .repository
        .links
        .clone
        .into_iter()
        .filter(|link| link.name == "http" || link.name == "ssh")
        .map(|link| link.href)
        .collect();
    let mut event = NormalizedEvent {
        repo_urls,
        ..Default::default()
    };
    if let Some(change) = payload.changes.into_iter().next() {
        let (branch, tag) = branch_tag_from_ref(&change.ref_id);
        event.branch = branch;
        event.tag = tag;
        event.revision = change.to_hash;
    }
    Ok(event)
}

#[derive(Deserialize)]
struct GogsPush {
    #[serde(rename = "ref")]
    ref_name: String,
    #[serde(default)]
    after: String,
    repository: GogsRepository,
}

#[derive(Deserialize)]
struct GogsRepository {
    html_url: String,
}

fn parse_gogs(
    headers: &HeaderMap,
    body: &[u8],
    secrets: &ProviderSecrets,
) -> Result<NormalizedEvent, ParseError> {
    if let Some(secret) = &secrets.gogs {
        let signature = header(headers, "x-gogs-signature").ok_or(ParseError::SignatureMissing)?;
        verify_hmac_sha256(secret, body, signature)?;
    }
    let event = header(headers, "x-gogs-event").unwrap_or_default();
    if event != "push" {
        return Err(ParseError::UnsupportedEvent("gogs", event.to_string()));
    }
    let payload: GogsPush = serde_json::from_slice(body)?;
    let (branch, tag) = branch_tag_from_ref(&payload.ref_name);
    Ok(NormalizedEvent {
        repo_urls: vec![payload.repository.html_url],
        branch,
        tag,
        revision: payload.after,
    })
}

#[derive(Deserialize)]
struct AzurePush {
    #[serde(rename = "eventType")]
    event_type: String,
    resource: AzureResource,
}

#[derive(Deserialize)]
struct AzureResource {
    #[serde(rename = "refUpdates", default)]
    ref_updates: Vec<AzureRefUpdate>,
    #[serde(default)]
    commits: Vec<AzureCommit>,
    repository: Option<AzureRepository>,
}

#[derive(Deserialize)]
struct AzureRefUpdate {
    name: String,
    #[serde(rename = "newObjectId", default)]
    new_object_id: String,
}

#[derive(Deserialize)]
struct AzureCommit {
    #[serde(rename = "commitId")]
    commit_id: String,
}

#[derive(Deserialize)]
struct AzureRepository {
    #[serde(rename = "remoteUrl")]
    remote_url: String,
}

/// Azure DevOps service hooks carry no signature; the activity headers only
/// route the request here.
fn parse_azure_devops(body: &[u8]) -> Result<NormalizedEvent, ParseError> {
    let payload: AzurePush = serde_json::from_slice(body)?;
    if payload.event_type != "git.push" {
        return Err(ParseError::UnsupportedEvent("azure", payload.event_type));
    }
    let mut event = NormalizedEvent::default();
    if let Some(repository) = payload.resource.repository {
        // Declared repos may use the ssh form of the same repository, which
        // shares neither host nor path shape with the https remote URL.
        if let Some(ssh_url) = azure_ssh_url(&repository.remote_url) {
            event.repo_urls.push(ssh_url);
        }
        event.repo_urls.push(repository.remote_url);
    }
    // Only the first ref update is inspected.
    if let Some(update) = payload.resource.ref_updates.first() {
        let (branch, tag) = branch_tag_from_ref(&update.name);
        event.branch = branch;
        event.tag = tag;
        event.revision = update.new_object_id.clone();
    }
    if let Some(commit) = payload.resource.commits.first() {
        event.revision = commit.commit_id.clone();
    }
    Ok(event)
}

/// Derive the ssh clone URL for an Azure DevOps https remote URL
/// (`https://dev.azure.com/{org}/{project}/_git/{repo}` →
/// `ssh://git@ssh.dev.azure.com/v3/{org}/{project}/{repo}`).
fn azure_ssh_url(remote_url: &str) -> Option<String> {
    let rest = remote_url.strip_prefix("https://")?;
    let (authority, path) = rest.split_once('/')?;
    let host = authority.rsplit('@').next().unwrap_or(authority);
    if host != "dev.azure.com" {
        return None;
    }
    let mut segments = path.trim_end_matches('/').split('/');
    let org = segments.next()?;
    let project = segments.next()?;
    let marker = segments.next()?;
    let repo = segments.next()?;
    if marker != "_git" || segments.next().is_some() {
        return None;
    }
    Some(format!("ssh://git@ssh.dev.azure.com/v3/{org}/{project}/{repo}"))
}
