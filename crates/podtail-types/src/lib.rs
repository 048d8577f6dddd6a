//! Shared types for podtail
//!
//! This crate contains data structures used across multiple podtail crates:
//! pod snapshots as seen by the watcher, the tail targets derived from them,
//! the resume watermark bookkeeping and the log lines handed to sinks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Kubernetes Resource Types
// ============================================================================

/// Pod snapshot
#[derive(Clone, Debug, PartialEq)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub uid: Option<String>,
    pub containers: Vec<ContainerInfo>,
    pub node_name: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl PodInfo {
    pub fn new(name: String, namespace: String) -> Self {
        Self {
            name,
            namespace,
            uid: None,
            containers: Vec::new(),
            node_name: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }
}

/// Which list of the pod spec a container was declared in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    Init,
    Regular,
    Ephemeral,
}

/// Runtime state reported in the container status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Waiting,
    Terminated,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ContainerInfo {
    pub name: String,
    pub kind: ContainerKind,
    /// `None` until the kubelet has reported a status for the container
    pub state: Option<ContainerState>,
    /// Runtime instance ID; changes whenever the container is restarted
    pub container_id: Option<String>,
}

impl ContainerInfo {
    pub fn new(name: String, kind: ContainerKind) -> Self {
        Self {
            name,
            kind,
            state: None,
            container_id: None,
        }
    }
}

// ============================================================================
// Tail Targets
// ============================================================================

/// Identity of a tailable container: namespace, pod and container name
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetKey {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

/// One container eligible for tailing.
///
/// Taken as a snapshot when the container is discovered; labels and
/// annotations are not refreshed while the tail is running.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub node_name: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub pod_uid: Option<String>,
    pub container_id: Option<String>,
}

impl Target {
    /// Build a target for one container of a pod snapshot
    pub fn from_pod(pod: &PodInfo, container: &ContainerInfo) -> Self {
        Self {
            namespace: pod.namespace.clone(),
            pod: pod.name.clone(),
            container: container.name.clone(),
            node_name: pod.node_name.clone(),
            labels: pod.labels.clone(),
            annotations: pod.annotations.clone(),
            pod_uid: pod.uid.clone(),
            container_id: container.container_id.clone(),
        }
    }

    pub fn key(&self) -> TargetKey {
        TargetKey {
            namespace: self.namespace.clone(),
            pod: self.pod.clone(),
            container: self.container.clone(),
        }
    }

    /// Whether both snapshots describe the same pod and container instance
    pub fn same_instance(&self, other: &Target) -> bool {
        self.pod_uid == other.pod_uid && self.container_id == other.container_id
    }
}

// ============================================================================
// Resume Bookkeeping
// ============================================================================

/// How far a tail has progressed: the last second-precision timestamp seen
/// and how many lines carried it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub timestamp: String,
    pub lines_at_timestamp: usize,
}

/// Carried from a faulted tail to its restart
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeRequest {
    /// Second-precision RFC3339 timestamp
    pub timestamp: String,
    /// Lines at `timestamp` that were already delivered
    pub lines_to_skip: usize,
}

impl From<Watermark> for ResumeRequest {
    fn from(watermark: Watermark) -> Self {
        Self {
            timestamp: watermark.timestamp,
            lines_to_skip: watermark.lines_at_timestamp,
        }
    }
}

// ============================================================================
// Log Types
// ============================================================================

/// Log severity level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
    Unknown,
}

impl LogLevel {
    /// Parse log level from common formats
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" | "trc" | "trce" => Self::Trace,
            "debug" | "dbg" | "debg" => Self::Debug,
            "info" | "inf" | "information" => Self::Info,
            "warn" | "warning" | "wrn" => Self::Warn,
            "error" | "err" | "erro" => Self::Error,
            "fatal" | "panic" | "critical" | "crit" | "ftl" => Self::Fatal,
            _ => Self::Unknown,
        }
    }

    /// OpenTelemetry severity number (`None` when undefined)
    pub fn severity_number(&self) -> Option<u8> {
        match self {
            Self::Trace => Some(1),
            Self::Debug => Some(5),
            Self::Info => Some(9),
            Self::Warn => Some(13),
            Self::Error => Some(17),
            Self::Fatal => Some(21),
            Self::Unknown => None,
        }
    }
}

/// A single accepted log line, ready for the sinks
#[derive(Clone, Debug)]
pub struct LogLine {
    /// Container the line came from
    pub target: Arc<Target>,

    /// Parsed source timestamp (if the line carried a valid one)
    pub timestamp: Option<DateTime<Utc>>,

    /// Timestamp exactly as the log source sent it (empty when malformed)
    pub raw_timestamp: String,

    /// Message content after the timestamp prefix
    pub content: String,

    /// The line could not be split; `content` holds it annotated with the error
    pub malformed: bool,
}

impl LogLine {
    pub fn new(target: Arc<Target>, raw_timestamp: String, content: String) -> Self {
        let timestamp = DateTime::parse_from_rfc3339(&raw_timestamp)
            .ok()
            .map(|ts| ts.with_timezone(&Utc));
        Self {
            target,
            timestamp,
            raw_timestamp,
            content,
            malformed: false,
        }
    }

    /// A line that failed to parse, surfaced with an error marker
    pub fn malformed(target: Arc<Target>, error: impl fmt::Display, raw: &str) -> Self {
        Self {
            target,
            timestamp: None,
            raw_timestamp: String::new(),
            content: format!("[{}] {}", error, raw),
            malformed: true,
        }
    }
}
