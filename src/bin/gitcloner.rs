//! Clone executor CLI.
//!
//! Runs inside the child workload's init container: one authenticated
//! single-branch clone into the shared scratch volume, then exit. Failures
//! surface as exit code 1 with a single classified line on stderr; retries
//! are the reconciler's business, not this process's.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;

use gitjob_controller::git::auth::AuthSnapshot;
use gitjob_controller::git::{clone_repo, CloneOptions, GitError};

#[derive(Parser, Debug)]
#[command(name = "gitcloner", about = "Clones a git repository")]
struct Cli {
    /// Repository URL
    repo: String,
    /// Directory to clone into
    path: PathBuf,
    /// Git branch
    #[arg(short, long)]
    branch: Option<String>,
    /// Git revision to detach to after the clone
    #[arg(long)]
    revision: Option<String>,
    /// CA bundle file
    #[arg(long)]
    ca_bundle_file: Option<PathBuf>,
    /// User name for basic auth
    #[arg(short, long)]
    username: Option<String>,
    /// Password file for basic auth
    #[arg(long)]
    password_file: Option<PathBuf>,
    /// SSH private key file path
    #[arg(long)]
    ssh_private_key_file: Option<PathBuf>,
    /// Known hosts file
    #[arg(long)]
    known_hosts_file: Option<PathBuf>,
    /// Do not verify TLS certificates
    #[arg(long)]
    insecure_skip_tls: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gitcloner=info".into()),
        )
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("ArgUsage: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(repo = %cli.repo, "starting to clone git repository");
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {e}", error_class(&e));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), GitError> {
    let auth = AuthSnapshot::from_files(
        cli.username.as_deref(),
        cli.password_file.as_deref(),
        cli.ssh_private_key_file.as_deref(),
        cli.known_hosts_file.as_deref(),
        cli.ca_bundle_file.as_deref(),
        cli.insecure_skip_tls,
    )
    .map_err(|e| GitError::AuthConfig(e.to_string()))?;

    clone_repo(&CloneOptions {
        repo: cli.repo.clone(),
        path: cli.path.clone(),
        branch: cli.branch.clone(),
        revision: cli.revision.clone(),
        auth,
    })
}

fn error_class(error: &GitError) -> &'static str {
    match error {
        GitError::AuthConfig(_) => "AuthConfig",
        GitError::Io(_) => "IO",
        GitError::Network(_) => "Network",
        GitError::Tls(_) => "TLS",
        GitError::GitProtocol(_) => "GitProtocol",
    }
}
