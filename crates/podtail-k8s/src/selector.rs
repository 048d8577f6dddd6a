//! Pod and container selection

use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::source::WatchRequest;
use podtail_types::{ContainerInfo, ContainerKind, ContainerState, PodInfo, Target};

#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid label selector '{0}'")]
    InvalidLabelSelector(String),

    #[error("invalid container state '{0}' (expected running, waiting, terminated or all)")]
    InvalidContainerState(String),
}

/// Compile a list of patterns
pub fn compile_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Regex>, SelectorError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p.as_ref()).map_err(|source| SelectorError::InvalidPattern {
                pattern: p.as_ref().to_string(),
                source,
            })
        })
        .collect()
}

// ============================================================================
// Label selector
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    NotExists(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Equals(k, v) => labels.get(k) == Some(v),
            Self::NotEquals(k, v) => labels.get(k) != Some(v),
            Self::In(k, values) => labels.get(k).is_some_and(|v| values.contains(v)),
            Self::NotIn(k, values) => labels.get(k).is_none_or(|v| !values.contains(v)),
            Self::Exists(k) => labels.contains_key(k),
            Self::NotExists(k) => !labels.contains_key(k),
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        if let Some(open) = raw.find('(') {
            let inner = raw[open + 1..].strip_suffix(')')?;
            let (key, op) = raw[..open].trim().rsplit_once(char::is_whitespace)?;
            let key = valid_key(key)?;
            let values: Vec<String> = inner
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect();
            return match op {
                "in" => Some(Self::In(key, values)),
                "notin" => Some(Self::NotIn(key, values)),
                _ => None,
            };
        }

        if let Some((k, v)) = raw.split_once("!=") {
            return Some(Self::NotEquals(valid_key(k)?, v.trim().to_string()));
        }
        if let Some((k, v)) = raw.split_once("==") {
            return Some(Self::Equals(valid_key(k)?, v.trim().to_string()));
        }
        if let Some((k, v)) = raw.split_once('=') {
            return Some(Self::Equals(valid_key(k)?, v.trim().to_string()));
        }
        if let Some(k) = raw.strip_prefix('!') {
            return Some(Self::NotExists(valid_key(k)?));
        }
        Some(Self::Exists(valid_key(raw)?))
    }
}

fn valid_key(key: &str) -> Option<String> {
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some(key.to_string())
}

/// Kubernetes label selector (`app=x,tier!=db,env in (a,b),!legacy`).
///
/// Evaluated locally and also forwarded verbatim to the API server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelSelector {
    raw: String,
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for LabelSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut requirements = Vec::new();
        let mut depth = 0usize;
        let mut start = 0;

        // Commas inside `in (...)` do not separate requirements
        for (i, ch) in s.char_indices() {
            match ch {
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                ',' if depth == 0 => {
                    requirements.push(&s[start..i]);
                    start = i + 1;
                }
                _ => {}
            }
        }
        requirements.push(&s[start..]);

        let requirements = requirements
            .into_iter()
            .filter(|r| !r.trim().is_empty())
            .map(|r| {
                Requirement::parse(r).ok_or_else(|| SelectorError::InvalidLabelSelector(s.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            raw: s.trim().to_string(),
            requirements,
        })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// ============================================================================
// Container state filter
// ============================================================================

/// Container states eligible for tailing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContainerStateFilter {
    pub running: bool,
    pub waiting: bool,
    pub terminated: bool,
}

impl ContainerStateFilter {
    pub fn all() -> Self {
        Self {
            running: true,
            waiting: true,
            terminated: true,
        }
    }

    /// Build from names like `running`, `waiting`, `terminated`, `all`
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self, SelectorError> {
        if names.is_empty() {
            return Ok(Self::default());
        }
        let mut filter = Self {
            running: false,
            waiting: false,
            terminated: false,
        };
        for name in names {
            match name.as_ref().trim().to_lowercase().as_str() {
                "running" => filter.running = true,
                "waiting" => filter.waiting = true,
                "terminated" => filter.terminated = true,
                "all" => filter = Self::all(),
                other => return Err(SelectorError::InvalidContainerState(other.to_string())),
            }
        }
        Ok(filter)
    }

    /// A container without a reported state counts as waiting
    pub fn allows(&self, state: Option<ContainerState>) -> bool {
        match state {
            Some(ContainerState::Running) => self.running,
            Some(ContainerState::Terminated) => self.terminated,
            Some(ContainerState::Waiting) | None => self.waiting,
        }
    }
}

impl Default for ContainerStateFilter {
    fn default() -> Self {
        Self {
            running: true,
            waiting: false,
            terminated: false,
        }
    }
}

// ============================================================================
// Selector
// ============================================================================

/// Decides which containers of which pods are tailed.
///
/// A container matches iff its pod passes the namespace, name, label and
/// node filters and the container name matches an include pattern but no
/// exclude pattern.
#[derive(Clone, Debug)]
pub struct Selector {
    pub namespaces: Vec<String>,
    pub all_namespaces: bool,
    pub pod_query: Vec<Regex>,
    pub exclude_pod: Vec<Regex>,
    pub label_selector: Option<LabelSelector>,
    pub field_selector: Option<String>,
    pub node_name: Option<String>,
    pub container_include: Vec<Regex>,
    pub container_exclude: Vec<Regex>,
    pub container_states: ContainerStateFilter,
    pub init_containers: bool,
    pub ephemeral_containers: bool,
}

impl Default for Selector {
    fn default() -> Self {
        Self {
            namespaces: Vec::new(),
            all_namespaces: false,
            pod_query: Vec::new(),
            exclude_pod: Vec::new(),
            label_selector: None,
            field_selector: None,
            node_name: None,
            container_include: Vec::new(),
            container_exclude: Vec::new(),
            container_states: ContainerStateFilter::default(),
            init_containers: true,
            ephemeral_containers: true,
        }
    }
}

impl Selector {
    pub fn pod_matches(&self, pod: &PodInfo) -> bool {
        if !self.all_namespaces
            && !self.namespaces.is_empty()
            && !self.namespaces.iter().any(|ns| ns == &pod.namespace)
        {
            return false;
        }
        if !self.pod_query.is_empty() && !self.pod_query.iter().any(|re| re.is_match(&pod.name)) {
            return false;
        }
        if self.exclude_pod.iter().any(|re| re.is_match(&pod.name)) {
            return false;
        }
        if let Some(selector) = &self.label_selector {
            if !selector.matches(&pod.labels) {
                return false;
            }
        }
        if let Some(node) = &self.node_name {
            if pod.node_name.as_ref() != Some(node) {
                return false;
            }
        }
        true
    }

    pub fn container_matches(&self, container: &ContainerInfo) -> bool {
        let kind_enabled = match container.kind {
            ContainerKind::Regular => true,
            ContainerKind::Init => self.init_containers,
            ContainerKind::Ephemeral => self.ephemeral_containers,
        };
        if !kind_enabled || !self.container_states.allows(container.state) {
            return false;
        }
        if !self.container_include.is_empty()
            && !self
                .container_include
                .iter()
                .any(|re| re.is_match(&container.name))
        {
            return false;
        }
        !self
            .container_exclude
            .iter()
            .any(|re| re.is_match(&container.name))
    }

    /// Targets for every matching container of the pod
    pub fn matching_targets(&self, pod: &PodInfo) -> Vec<Target> {
        if !self.pod_matches(pod) {
            return Vec::new();
        }
        pod.containers
            .iter()
            .filter(|c| self.container_matches(c))
            .map(|c| Target::from_pod(pod, c))
            .collect()
    }

    /// The server-side part of the selection
    pub fn watch_request(&self, follow: bool) -> WatchRequest {
        let mut field_selectors: Vec<String> = self.field_selector.iter().cloned().collect();
        if let Some(node) = &self.node_name {
            field_selectors.push(format!("spec.nodeName={}", node));
        }

        WatchRequest {
            namespaces: if self.all_namespaces {
                Vec::new()
            } else {
                self.namespaces.clone()
            },
            label_selector: self.label_selector.as_ref().map(|s| s.to_string()),
            field_selector: if field_selectors.is_empty() {
                None
            } else {
                Some(field_selectors.join(","))
            },
            follow,
        }
    }
}
