//! Console output: colored `pod container message` lines on stdout,
//! target lifecycle markers on stderr.

use chrono::{DateTime, Local, SecondsFormat, Utc};
use crossterm::style::{Color, Stylize};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::str::FromStr;
use std::time::Duration;

use super::{Sink, SinkError, SinkKind};
use crate::color::colors_for;
use podtail_types::{LogLine, Target};

/// Line layout
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// `pod container message`
    #[default]
    Default,
    /// Message only
    Raw,
    /// Message plus pod metadata as a JSON object
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "raw" => Ok(Self::Raw),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown output format '{}' (default, raw, json)", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampFormat {
    /// RFC3339 with nanoseconds, trailing zeros kept
    #[default]
    Default,
    /// `MM-DD HH:MM:SS`
    Short,
}

impl FromStr for TimestampFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "short" => Ok(Self::Short),
            other => Err(format!("unknown timestamp format '{}' (default, short)", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timezone {
    #[default]
    Local,
    Utc,
}

impl FromStr for Timezone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "utc" => Ok(Self::Utc),
            other => Err(format!("unknown timezone '{}' (local, utc)", other)),
        }
    }
}

/// Configuration for the console sink
#[derive(Clone, Debug)]
pub struct ConsoleConfig {
    pub format: OutputFormat,

    /// Prefix messages with the source timestamp
    pub timestamps: Option<TimestampFormat>,

    pub timezone: Timezone,

    /// Enable colored output
    pub color: bool,

    /// Show the namespace before the pod name
    pub show_namespace: bool,

    /// Color containers by their own name
    pub diff_container: bool,

    /// Suppress the `+`/`-` target markers
    pub only_log_lines: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Default,
            timestamps: None,
            timezone: Timezone::Local,
            color: true,
            show_namespace: false,
            diff_container: false,
            only_log_lines: false,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonLine<'a> {
    message: &'a str,
    node_name: &'a str,
    namespace: &'a str,
    pod_name: &'a str,
    container_name: &'a str,
    labels: &'a BTreeMap<String, String>,
    annotations: &'a BTreeMap<String, String>,
}

/// Display sink writing to stdout/stderr (or any writers)
pub struct ConsoleSink {
    config: ConsoleConfig,
    out: Mutex<Box<dyn Write + Send>>,
    err: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleSink {
    pub fn stdout(config: ConsoleConfig) -> Self {
        Self::with_writers(
            config,
            Box::new(std::io::stdout()),
            Box::new(std::io::stderr()),
        )
    }

    pub fn with_writers(
        config: ConsoleConfig,
        out: Box<dyn Write + Send>,
        err: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            config,
            out: Mutex::new(out),
            err: Mutex::new(err),
        }
    }

    fn paint(&self, text: &str, color: Color) -> String {
        if self.config.color {
            text.with(color).to_string()
        } else {
            text.to_string()
        }
    }

    fn format_timestamp(&self, ts: DateTime<Utc>, format: TimestampFormat) -> String {
        match (format, self.config.timezone) {
            (TimestampFormat::Default, Timezone::Utc) => {
                ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
            }
            (TimestampFormat::Default, Timezone::Local) => ts
                .with_timezone(&Local)
                .to_rfc3339_opts(SecondsFormat::Nanos, true),
            (TimestampFormat::Short, Timezone::Utc) => ts.format("%m-%d %H:%M:%S").to_string(),
            (TimestampFormat::Short, Timezone::Local) => ts
                .with_timezone(&Local)
                .format("%m-%d %H:%M:%S")
                .to_string(),
        }
    }

    fn message(&self, line: &LogLine) -> String {
        // Malformed lines are shown exactly as annotated
        if line.malformed {
            return line.content.clone();
        }
        match self.config.timestamps {
            Some(format) => {
                let ts = match line.timestamp {
                    Some(ts) => self.format_timestamp(ts, format),
                    None => line.raw_timestamp.clone(),
                };
                format!("{} {}", ts, line.content)
            }
            None => line.content.clone(),
        }
    }

    fn render(&self, line: &LogLine) -> Result<String, SinkError> {
        let message = self.message(line);
        let target = &line.target;

        match self.config.format {
            OutputFormat::Raw => Ok(message),
            OutputFormat::Json => Ok(serde_json::to_string(&JsonLine {
                message: &message,
                node_name: target.node_name.as_deref().unwrap_or_default(),
                namespace: &target.namespace,
                pod_name: &target.pod,
                container_name: &target.container,
                labels: &target.labels,
                annotations: &target.annotations,
            })?),
            OutputFormat::Default => {
                let (pod_color, container_color) =
                    colors_for(&target.pod, &target.container, self.config.diff_container);
                let mut rendered = String::new();
                if self.config.show_namespace {
                    rendered.push_str(&self.paint(&target.namespace, pod_color));
                    rendered.push(' ');
                }
                rendered.push_str(&self.paint(&target.pod, pod_color));
                rendered.push(' ');
                rendered.push_str(&self.paint(&target.container, container_color));
                rendered.push(' ');
                rendered.push_str(&message);
                Ok(rendered)
            }
        }
    }

    fn lifecycle(&self, marker: &str, marker_color: Color, target: &Target) {
        if self.config.only_log_lines {
            return;
        }
        let (pod_color, container_color) =
            colors_for(&target.pod, &target.container, self.config.diff_container);
        let marker = if self.config.color {
            marker.with(marker_color).bold().to_string()
        } else {
            marker.to_string()
        };

        let mut text = format!("{} ", marker);
        if self.config.show_namespace {
            text.push_str(&self.paint(&target.namespace, pod_color));
            text.push(' ');
        }
        text.push_str(&format!(
            "{} › {}",
            self.paint(&target.pod, pod_color),
            self.paint(&target.container, container_color)
        ));

        if let Err(e) = writeln!(self.err.lock(), "{}", text) {
            tracing::warn!(error = %e, "failed to write target marker");
        }
    }

    fn flush(&self) -> Result<(), SinkError> {
        self.out.lock().flush()?;
        self.err.lock().flush()?;
        Ok(())
    }
}

impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Display
    }

    fn emit(&self, line: &LogLine) -> Result<(), SinkError> {
        let rendered = self.render(line)?;
        writeln!(self.out.lock(), "{}", rendered)?;
        Ok(())
    }

    fn target_started(&self, target: &Target) {
        self.lifecycle("+", Color::Green, target);
    }

    fn target_stopped(&self, target: &Target) {
        self.lifecycle("-", Color::Red, target);
    }

    fn shutdown(&self, _deadline: Duration) -> BoxFuture<'_, Result<(), SinkError>> {
        Box::pin(futures::future::ready(self.flush()))
    }
}
