//! Export sink: OpenTelemetry-shaped log records, batched by a background
//! worker and written as one OTLP/JSON request per line.
//!
//! `emit` never waits. Records go into a bounded queue; when it is full
//! the record is dropped and counted.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::{Sink, SinkError, SinkKind};
use crate::parser::Payload;
use podtail_types::{LogLine, Target};

const SCOPE_NAME: &str = "podtail";

/// Labels consulted, in order, for `service.name`
const SERVICE_NAME_LABELS: [&str; 3] = ["app.kubernetes.io/name", "app", "k8s-app"];

#[derive(Clone, Debug)]
pub struct ExportConfig {
    /// Records per written request
    pub batch_size: usize,
    /// Records buffered before `emit` starts dropping
    pub queue_size: usize,
    /// Partial batches are written at least this often
    pub flush_interval: Duration,
    /// Reported as `k8s.cluster.name` when set
    pub cluster_name: Option<String>,
}

impl ExportConfig {
    pub fn with_batch_size(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            queue_size: batch_size * 2,
            ..Default::default()
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            batch_size: 512,
            queue_size: 1024,
            flush_interval: Duration::from_secs(1),
            cluster_name: None,
        }
    }
}

// ============================================================================
// Record model
// ============================================================================

/// OTLP `AnyValue`; 64-bit integers are strings in OTLP/JSON
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
enum AnyValue {
    StringValue(String),
    BoolValue(bool),
    IntValue(String),
    DoubleValue(f64),
}

impl From<Value> for AnyValue {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => Self::StringValue(s),
            Value::Bool(b) => Self::BoolValue(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::IntValue(i.to_string()),
                None => Self::DoubleValue(n.as_f64().unwrap_or_default()),
            },
            Value::Null => Self::StringValue(String::new()),
            // Nested objects and arrays are flattened to their JSON text
            nested => Self::StringValue(nested.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
struct KeyValue {
    key: String,
    value: AnyValue,
}

impl KeyValue {
    fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: AnyValue::StringValue(value.into()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LogRecord {
    time_unix_nano: String,
    observed_time_unix_nano: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    severity_number: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    severity_text: Option<String>,
    body: AnyValue,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attributes: Vec<KeyValue>,
}

/// A queued record together with the resource it belongs to
#[derive(Debug)]
struct ExportRecord {
    resource: Vec<KeyValue>,
    record: LogRecord,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportRequest<'a> {
    resource_logs: Vec<ResourceLogs<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourceLogs<'a> {
    resource: Resource<'a>,
    scope_logs: [ScopeLogs<'a>; 1],
}

#[derive(Serialize)]
struct Resource<'a> {
    attributes: &'a [KeyValue],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ScopeLogs<'a> {
    scope: Scope,
    log_records: Vec<&'a LogRecord>,
}

#[derive(Serialize)]
struct Scope {
    name: &'static str,
    version: &'static str,
}

// ============================================================================
// Transformation
// ============================================================================

/// `service.name` for a target: the first well-known app label, else the
/// pod name
fn service_name(target: &Target) -> &str {
    SERVICE_NAME_LABELS
        .iter()
        .filter_map(|label| target.labels.get(*label))
        .find(|value| !value.is_empty())
        .map(String::as_str)
        .unwrap_or(&target.pod)
}

fn resource_attributes(target: &Target, cluster_name: Option<&str>) -> Vec<KeyValue> {
    let mut attributes = vec![
        KeyValue::string("service.name", service_name(target)),
        KeyValue::string("k8s.namespace.name", &target.namespace),
        KeyValue::string("k8s.pod.name", &target.pod),
        KeyValue::string("k8s.container.name", &target.container),
    ];
    if let Some(uid) = &target.pod_uid {
        attributes.push(KeyValue::string("k8s.pod.uid", uid));
    }
    if let Some(node) = &target.node_name {
        attributes.push(KeyValue::string("k8s.node.name", node));
        attributes.push(KeyValue::string("host.name", node));
    }
    if let Some(cluster) = cluster_name {
        attributes.push(KeyValue::string("k8s.cluster.name", cluster));
    }
    for (key, value) in &target.labels {
        attributes.push(KeyValue::string(format!("k8s.pod.label.{}", key), value));
    }
    for (key, value) in &target.annotations {
        attributes.push(KeyValue::string(format!("k8s.pod.annotation.{}", key), value));
    }
    attributes
}

fn unix_nanos(ts: Option<DateTime<Utc>>) -> String {
    ts.and_then(|ts| ts.timestamp_nanos_opt())
        .unwrap_or_default()
        .to_string()
}

impl ExportRecord {
    fn from_line(line: &LogLine, cluster_name: Option<&str>) -> Self {
        let observed = unix_nanos(Some(Utc::now()));
        let resource = resource_attributes(&line.target, cluster_name);

        let record = if line.malformed {
            LogRecord {
                time_unix_nano: observed.clone(),
                observed_time_unix_nano: observed,
                severity_number: None,
                severity_text: None,
                body: AnyValue::StringValue(line.content.clone()),
                attributes: Vec::new(),
            }
        } else {
            let payload = Payload::parse(&line.content);
            let severity_number = payload.level().severity_number();
            match payload {
                Payload::PlainText(text) => LogRecord {
                    time_unix_nano: unix_nanos(line.timestamp),
                    observed_time_unix_nano: observed,
                    severity_number,
                    severity_text: None,
                    body: AnyValue::StringValue(text),
                    attributes: Vec::new(),
                },
                Payload::Structured {
                    message,
                    severity,
                    fields,
                } => LogRecord {
                    time_unix_nano: unix_nanos(line.timestamp),
                    observed_time_unix_nano: observed,
                    severity_number,
                    severity_text: severity,
                    body: AnyValue::StringValue(message),
                    attributes: fields
                        .into_iter()
                        .map(|(key, value)| KeyValue {
                            key,
                            value: value.into(),
                        })
                        .collect(),
                },
            }
        };

        Self { resource, record }
    }
}

/// Group records by resource, keeping first-seen order
fn encode_batch(batch: &[ExportRecord]) -> Result<String, SinkError> {
    let mut groups: Vec<(&[KeyValue], Vec<&LogRecord>)> = Vec::new();
    for entry in batch {
        match groups
            .iter_mut()
            .find(|(resource, _)| *resource == entry.resource.as_slice())
        {
            Some((_, records)) => records.push(&entry.record),
            None => groups.push((&entry.resource, vec![&entry.record])),
        }
    }

    let request = ExportRequest {
        resource_logs: groups
            .into_iter()
            .map(|(attributes, log_records)| ResourceLogs {
                resource: Resource { attributes },
                scope_logs: [ScopeLogs {
                    scope: Scope {
                        name: SCOPE_NAME,
                        version: env!("CARGO_PKG_VERSION"),
                    },
                    log_records,
                }],
            })
            .collect(),
    };
    Ok(serde_json::to_string(&request)?)
}

// ============================================================================
// Sink
// ============================================================================

type ExportWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct ExportSink {
    cluster_name: Option<String>,
    tx: Mutex<Option<mpsc::Sender<ExportRecord>>>,
    worker: Mutex<Option<JoinHandle<Result<u64, SinkError>>>>,
    dropped: AtomicU64,
}

impl ExportSink {
    /// Start the batching worker. Must be called inside a Tokio runtime.
    pub fn spawn(config: ExportConfig, writer: ExportWriter) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let cluster_name = config.cluster_name.clone();
        let worker = tokio::spawn(run_worker(rx, writer, config));
        Self {
            cluster_name,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Records dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<ExportRecord>,
    mut writer: ExportWriter,
    config: ExportConfig,
) -> Result<u64, SinkError> {
    let batch_size = config.batch_size.max(1);
    let mut batch = Vec::with_capacity(batch_size);
    let mut exported = 0u64;
    let mut ticker = tokio::time::interval_at(
        Instant::now() + config.flush_interval,
        config.flush_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            record = rx.recv() => match record {
                Some(record) => {
                    batch.push(record);
                    if batch.len() >= batch_size {
                        exported += write_batch(&mut writer, &mut batch).await;
                    }
                }
                // Every sender is gone: drain and exit
                None => break,
            },
            _ = ticker.tick() => {
                exported += write_batch(&mut writer, &mut batch).await;
            }
        }
    }

    exported += write_batch(&mut writer, &mut batch).await;
    writer.flush().await?;
    tracing::debug!(exported, "export worker finished");
    Ok(exported)
}

/// Write and clear `batch`, returning how many records were written.
/// A failed batch is logged and discarded.
async fn write_batch(writer: &mut ExportWriter, batch: &mut Vec<ExportRecord>) -> u64 {
    if batch.is_empty() {
        return 0;
    }
    let count = batch.len() as u64;
    let result = match encode_batch(batch) {
        Ok(mut encoded) => {
            encoded.push('\n');
            writer
                .write_all(encoded.as_bytes())
                .await
                .map_err(SinkError::from)
        }
        Err(e) => Err(e),
    };
    batch.clear();

    match result {
        Ok(()) => count,
        Err(e) => {
            tracing::warn!(error = %e, records = count, "failed to export batch");
            0
        }
    }
}

impl Sink for ExportSink {
    fn name(&self) -> &str {
        "export"
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Export
    }

    fn emit(&self, line: &LogLine) -> Result<(), SinkError> {
        let record = ExportRecord::from_line(line, self.cluster_name.as_deref());

        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(SinkError::Closed);
        };

        match tx.try_send(record) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    tracing::warn!(dropped, "export queue full, dropping log records");
                }
                Err(SinkError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(SinkError::Closed),
        }
    }

    fn shutdown(&self, deadline: Duration) -> BoxFuture<'_, Result<(), SinkError>> {
        // Dropping the sender lets the worker drain the queue and exit
        self.tx.lock().take();
        let worker = self.worker.lock().take();

        Box::pin(async move {
            let Some(mut worker) = worker else {
                return Ok(());
            };
            match tokio::time::timeout(deadline, &mut worker).await {
                Ok(Ok(result)) => {
                    let exported = result?;
                    tracing::debug!(exported, dropped = self.dropped(), "export sink shut down");
                    Ok(())
                }
                Ok(Err(e)) => Err(SinkError::Io(std::io::Error::other(e))),
                Err(_) => {
                    worker.abort();
                    Err(SinkError::ShutdownTimeout(deadline))
                }
            }
        })
    }
}
