//! # GitJob Controller
//!
//! Controller process wiring: flags, logging, metrics, leader election, the
//! shared GitJob cache, the poll manager, the webhook listener and the
//! reconcile loop. One root cancellation token reaches every worker so a
//! signal drains probes, webhook requests, lease renewal and the controller
//! queue.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::{Api, Client};
use kube_runtime::{reflector, watcher, Controller, WatchStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use gitjob_controller::crd::GitJob;
use gitjob_controller::leader::LeaderElector;
use gitjob_controller::metrics;
use gitjob_controller::poller::GitPoller;
use gitjob_controller::reconciler::GitJobReconciler;
use gitjob_controller::server::{serve_probes, Readiness};
use gitjob_controller::webhook::{self, WebhookState};

#[derive(Parser, Debug)]
#[command(name = "gitjob-controller", version, about = "GitJob controller")]
struct Flags {
    /// The address the metric endpoint binds to
    #[arg(long, default_value = ":8081")]
    metrics_bind_address: String,
    /// The image that will be used for the clone step of generated jobs
    #[arg(long, default_value = "gitjob:dev")]
    gitjob_image: String,
    /// The address the webhook listens on
    #[arg(long, default_value = ":8080")]
    listen: String,
    /// Enable leader election for the controller manager. Enabling this
    /// ensures there is only one active controller manager.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    leader_elect: bool,
    /// Debug mode
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let flags = Flags::parse();

    let default_filter = if flags.debug {
        "gitjob_controller=debug,info"
    } else {
        "gitjob_controller=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting gitjob controller");

    metrics::register_metrics().context("Failed to register metrics")?;
    let namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    // Every worker spawned below shares this token; cancelling it drains
    // probes, webhook requests and lease renewal.
    let shutdown = CancellationToken::new();
    let poller = Arc::new(GitPoller::new(client.clone()));

    // Probes come up before leader acquisition so a standby replica answers
    // /healthz while it waits; /readyz stays 503 until startup finishes.
    let readiness = Arc::new(Readiness::new(Arc::clone(&poller)));
    let metrics_addr = bind_addr(&flags.metrics_bind_address);
    {
        let readiness = Arc::clone(&readiness);
        tokio::spawn(async move {
            if let Err(e) = serve_probes(&metrics_addr, readiness).await {
                error!("metrics server error: {}", e);
            }
        });
    }

    if flags.leader_elect {
        let elector = Arc::new(LeaderElector::new(client.clone(), &namespace));
        elector
            .acquire()
            .await
            .context("Failed to acquire leader lease")?;
        let renew = Arc::clone(&elector);
        let renew_shutdown = shutdown.clone();
        // Lease loss is fatal: exit and let the supervisor restart us.
        tokio::spawn(async move {
            if let Err(e) = renew.keep_renewed(renew_shutdown).await {
                error!("leader lease lost: {}", e);
                std::process::exit(1);
            }
        });
    }

    // One watch feeds the shared cache used by the webhook dispatcher and
    // the poll manager's purge; the controller runtime drives its own.
    let gitjobs: Api<GitJob> = Api::all(client.clone());
    let (reader, writer) = reflector::store();
    let cache_stream = reflector(
        writer,
        watcher(gitjobs.clone(), watcher::Config::default()).default_backoff(),
    );
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut stream = std::pin::pin!(cache_stream.touched_objects());
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    item = stream.next() => match item {
                        Some(Ok(_)) => {}
                        Some(Err(e)) => warn!("gitjob cache watch failed: {}", e),
                        None => break,
                    },
                }
            }
        });
    }

    tokio::spawn(Arc::clone(&poller).run(shutdown.clone()));

    let webhook_state = Arc::new(WebhookState::new(client.clone(), reader.clone()));
    tokio::spawn(webhook::watch_webhook_secret(
        Arc::clone(&webhook_state),
        namespace.clone(),
        shutdown.clone(),
    ));
    let listen_addr = bind_addr(&flags.listen);
    {
        let state = Arc::clone(&webhook_state);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = webhook::serve(&listen_addr, state, shutdown).await {
                error!("webhook server error: {}", e);
            }
        });
    }

    readiness.mark_ready();

    let reconciler = Arc::new(GitJobReconciler::new(
        client,
        flags.gitjob_image,
        Arc::clone(&poller),
        reader,
    ));
    info!("starting reconcile loop");
    let child_jobs: Api<Job> = Api::all(reconciler.client.clone());
    Controller::new(gitjobs, watcher::Config::default())
        // Child completion flows back into status projection.
        .owns(child_jobs, watcher::Config::default())
        .shutdown_on_signal()
        .run(
            GitJobReconciler::reconcile,
            GitJobReconciler::error_policy,
            reconciler,
        )
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(name = %object.name, "reconciled"),
                Err(e) => warn!("reconcile loop error: {}", e),
            }
        })
        .await;

    info!("controller stopped; draining workers");
    shutdown.cancel();
    // Grace window for in-flight webhook responses and probe teardown.
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    Ok(())
}

/// `:8080` style listen flags bind on all interfaces.
fn bind_addr(flag: &str) -> String {
    if let Some(port) = flag.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        flag.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_defaults() {
        let flags = Flags::try_parse_from(["gitjob-controller"]).unwrap();
        assert_eq!(flags.metrics_bind_address, ":8081");
        assert_eq!(flags.listen, ":8080");
        assert_eq!(flags.gitjob_image, "gitjob:dev");
        assert!(flags.leader_elect);
        assert!(!flags.debug);
    }

    #[test]
    fn leader_election_can_be_disabled() {
        let flags =
            Flags::try_parse_from(["gitjob-controller", "--leader-elect", "false"]).unwrap();
        assert!(!flags.leader_elect);
    }

    #[test]
    fn bind_addr_expands_bare_ports() {
        assert_eq!(bind_addr(":8080"), "0.0.0.0:8080");
        assert_eq!(bind_addr("127.0.0.1:9000"), "127.0.0.1:9000");
    }
}
