//! Kubernetes integration for podtail
//!
//! This crate owns everything that talks to (or stands in for) the cluster:
//! kubeconfig loading, the pod watch and log stream seams, selector
//! evaluation and the target watcher that turns pod churn into
//! added/removed notifications.

mod client;
mod cluster;
mod selector;
mod source;
mod watcher;

pub use client::KubeClient;
pub use cluster::KubeCluster;
pub use selector::{
    ContainerStateFilter, LabelSelector, Selector, SelectorError, compile_patterns,
};
pub use source::{
    ClusterError, LineStream, LogSource, LogStreamOptions, PodEvent, PodEventStream, PodSource,
    WatchRequest,
};
pub use watcher::{TargetEvent, TargetWatcher};

// Re-export types that are used in our public API
pub use podtail_types::{ContainerInfo, ContainerKind, ContainerState, PodInfo, Target};
