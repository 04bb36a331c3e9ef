//! GitJob Controller Library
//!
//! Core of a Kubernetes controller that turns a declarative `GitJob`
//! resource into a one-shot batch workload pinned to the tracked revision
//! of a Git repository. Revision tracking converges from three directions:
//! a periodic remote ref poller, an inbound multi-provider webhook
//! receiver, and the reconcile loop that trades "observed commit changed"
//! for a fresh child job.

pub mod backoff;
pub mod crd;
pub mod git;
pub mod job;
pub mod leader;
pub mod metrics;
pub mod poller;
pub mod reconciler;
pub mod server;
pub mod webhook;

pub use crd::{Condition, GitInfo, GitJob, GitJobSpec, GitJobStatus, SyncPolicy};
