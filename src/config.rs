//! Command-line flags, the optional TOML config file, and the settings
//! resolved from both. Flags given on the command line win over the file.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Deserialize;

use podtail_k8s::{
    ContainerStateFilter, LabelSelector, LogStreamOptions, Selector, compile_patterns,
};
use podtail_logs::{
    ConsoleConfig, ContentFilter, ExportConfig, ManagerConfig, OutputFormat, TimestampFormat,
    Timezone,
};

/// Podtail - tail logs from every matching container in a Kubernetes cluster
#[derive(Parser, Debug, Default)]
#[command(name = "podtail")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Pod name regex
    #[arg(value_name = "POD_QUERY")]
    pub pod_query: Option<String>,

    /// Namespace to watch (repeatable; defaults to the context's namespace)
    #[arg(short, long)]
    pub namespace: Vec<String>,

    /// Watch pods in every namespace
    #[arg(short = 'A', long)]
    pub all_namespaces: bool,

    /// Label selector, e.g. `app=web,tier!=cache`
    #[arg(short = 'l', long)]
    pub selector: Option<String>,

    /// Field selector passed to the API server
    #[arg(long)]
    pub field_selector: Option<String>,

    /// Only pods scheduled on this node
    #[arg(long)]
    pub node: Option<String>,

    /// Pod name regex to exclude (repeatable)
    #[arg(long)]
    pub exclude_pod: Vec<String>,

    /// Container name regex (repeatable)
    #[arg(short, long)]
    pub container: Vec<String>,

    /// Container name regex to exclude (repeatable)
    #[arg(short = 'E', long)]
    pub exclude_container: Vec<String>,

    /// Container states to tail: running, waiting, terminated or all
    #[arg(long)]
    pub container_state: Vec<String>,

    /// Include init containers
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub init_containers: Option<bool>,

    /// Include ephemeral containers
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub ephemeral_containers: Option<bool>,

    /// Only show lines matching this regex (repeatable)
    #[arg(short, long)]
    pub include: Vec<String>,

    /// Hide lines matching this regex (repeatable)
    #[arg(short, long)]
    pub exclude: Vec<String>,

    /// Match include/exclude patterns case-insensitively
    #[arg(long)]
    pub ignore_case: bool,

    /// Maximum number of log streams open at once
    #[arg(long)]
    pub max_log_requests: Option<usize>,

    /// Lines of history per container (-1 for all)
    #[arg(long, allow_negative_numbers = true)]
    pub tail: Option<i64>,

    /// Only logs newer than this, e.g. `5m` or `48h`
    #[arg(long)]
    pub since: Option<String>,

    /// Print existing logs and exit
    #[arg(long)]
    pub no_follow: bool,

    /// Do not resume interrupted streams
    #[arg(long)]
    pub no_resume: bool,

    /// How faulted streams are restarted
    #[arg(long, value_enum)]
    pub restart_policy: Option<RestartPolicyKind>,

    /// Prefix lines with timestamps (default or short)
    #[arg(short, long, num_args = 0..=1, default_missing_value = "default")]
    pub timestamps: Option<TimestampFormat>,

    /// Timezone for timestamps (local or utc)
    #[arg(long)]
    pub timezone: Option<Timezone>,

    /// Output format (default, raw or json)
    #[arg(short, long)]
    pub output: Option<OutputFormat>,

    /// When to color output
    #[arg(long, value_enum)]
    pub color: Option<ColorMode>,

    /// Color each container by its own name
    #[arg(long)]
    pub diff_container: bool,

    /// Do not print target added/removed markers
    #[arg(long)]
    pub only_log_lines: bool,

    /// Also write OpenTelemetry log records as JSON lines to this file (`-` for stdout)
    #[arg(long, value_name = "PATH")]
    pub export_file: Option<String>,

    /// Only write exported records, no console output
    #[arg(long)]
    pub export_only: bool,

    /// Kubernetes context (defaults to the current context)
    #[arg(long)]
    pub context: Option<String>,

    /// How long sinks get to flush on exit
    #[arg(long)]
    pub shutdown_timeout: Option<String>,

    /// TOML file with default settings
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicyKind {
    /// Restart right away, without limit
    #[default]
    Immediate,
    /// Exponential backoff between restarts
    Backoff,
}

/// Backoff tuning, only read from the config file
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct BackoffConfig {
    #[serde(with = "humantime_serde")]
    pub initial: Duration,
    #[serde(with = "humantime_serde")]
    pub max: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

/// Contents of the `--config` file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileConfig {
    pub pod_query: Option<String>,
    pub namespace: Vec<String>,
    pub all_namespaces: Option<bool>,
    pub selector: Option<String>,
    pub field_selector: Option<String>,
    pub node: Option<String>,
    pub exclude_pod: Vec<String>,
    pub container: Vec<String>,
    pub exclude_container: Vec<String>,
    pub container_state: Vec<String>,
    pub init_containers: Option<bool>,
    pub ephemeral_containers: Option<bool>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub ignore_case: Option<bool>,
    pub max_log_requests: Option<usize>,
    pub tail: Option<i64>,
    #[serde(with = "humantime_serde")]
    pub since: Option<Duration>,
    pub follow: Option<bool>,
    pub resume: Option<bool>,
    pub restart_policy: Option<RestartPolicyKind>,
    pub backoff: BackoffConfig,
    pub timestamps: Option<TimestampFormat>,
    pub timezone: Option<Timezone>,
    pub output: Option<OutputFormat>,
    pub color: Option<ColorMode>,
    pub diff_container: Option<bool>,
    pub only_log_lines: Option<bool>,
    pub export_file: Option<String>,
    pub export_only: Option<bool>,
    pub export_batch_size: Option<usize>,
    #[serde(with = "humantime_serde")]
    pub export_flush_interval: Option<Duration>,
    pub context: Option<String>,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Option<Duration>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// Where exported records go
#[derive(Clone, Debug, PartialEq)]
pub enum ExportTarget {
    Stdout,
    File(PathBuf),
}

#[derive(Clone, Debug)]
pub struct ExportSettings {
    pub target: ExportTarget,
    pub config: ExportConfig,
}

/// Everything resolved at startup; not changed afterwards
#[derive(Debug)]
pub struct Settings {
    pub context: Option<String>,
    pub selector: Selector,
    pub filter: ContentFilter,
    pub manager: ManagerConfig,
    pub restart_policy: RestartPolicyKind,
    pub backoff: BackoffConfig,
    /// `None` with `--export-only`
    pub console: Option<ConsoleConfig>,
    pub export: Option<ExportSettings>,
    pub shutdown_timeout: Duration,
}

const DEFAULT_MAX_LOG_REQUESTS: usize = 50;
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Command-line list if given, else the file's
fn pick_list(cli: Vec<String>, file: Vec<String>) -> Vec<String> {
    if cli.is_empty() { file } else { cli }
}

/// A set command-line flag wins; an unset one defers to the file
fn pick_flag(cli: bool, file: Option<bool>) -> bool {
    cli || file.unwrap_or(false)
}

fn parse_duration(flag: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .with_context(|| format!("Invalid duration '{}' for --{}", value, flag))
}

impl Settings {
    pub fn resolve(args: Args, file: FileConfig) -> Result<Self> {
        let selector = Selector {
            namespaces: pick_list(args.namespace, file.namespace),
            all_namespaces: pick_flag(args.all_namespaces, file.all_namespaces),
            pod_query: compile_patterns(
                &args.pod_query.or(file.pod_query).into_iter().collect::<Vec<_>>(),
            )?,
            exclude_pod: compile_patterns(&pick_list(args.exclude_pod, file.exclude_pod))?,
            label_selector: args
                .selector
                .or(file.selector)
                .map(|s| s.parse::<LabelSelector>())
                .transpose()?,
            field_selector: args.field_selector.or(file.field_selector),
            node_name: args.node.or(file.node),
            container_include: compile_patterns(&pick_list(args.container, file.container))?,
            container_exclude: compile_patterns(&pick_list(
                args.exclude_container,
                file.exclude_container,
            ))?,
            container_states: {
                let states = pick_list(args.container_state, file.container_state);
                if states.is_empty() {
                    ContainerStateFilter::default()
                } else {
                    ContainerStateFilter::parse(&states)?
                }
            },
            init_containers: args.init_containers.or(file.init_containers).unwrap_or(true),
            ephemeral_containers: args
                .ephemeral_containers
                .or(file.ephemeral_containers)
                .unwrap_or(true),
        };

        let include = pick_list(args.include, file.include);
        let exclude = pick_list(args.exclude, file.exclude);
        let filter = if pick_flag(args.ignore_case, file.ignore_case) {
            ContentFilter::new_case_insensitive(&include, &exclude)
        } else {
            ContentFilter::new(&include, &exclude)
        }
        .context("Invalid --include/--exclude pattern")?;

        let since = match args.since {
            Some(since) => Some(parse_duration("since", &since)?),
            None => file.since,
        };
        let follow = !args.no_follow && file.follow.unwrap_or(true);
        let tail = args.tail.or(file.tail).filter(|lines| *lines >= 0);
        let manager = ManagerConfig {
            max_concurrent_tails: args
                .max_log_requests
                .or(file.max_log_requests)
                .unwrap_or(DEFAULT_MAX_LOG_REQUESTS),
            resume: !args.no_resume && file.resume.unwrap_or(true),
            options: LogStreamOptions {
                follow,
                since_seconds: since.map(|d| d.as_secs() as i64),
                since_time: None,
                tail_lines: tail,
            },
        };

        let color = match args.color.or(file.color).unwrap_or_default() {
            ColorMode::Always => true,
            ColorMode::Never => false,
            ColorMode::Auto => std::io::stdout().is_terminal(),
        };
        let export_only = pick_flag(args.export_only, file.export_only);
        let console = (!export_only).then(|| ConsoleConfig {
            format: args.output.or(file.output).unwrap_or_default(),
            timestamps: args.timestamps.or(file.timestamps),
            timezone: args.timezone.or(file.timezone).unwrap_or_default(),
            color,
            show_namespace: selector.all_namespaces || selector.namespaces.len() > 1,
            diff_container: pick_flag(args.diff_container, file.diff_container),
            only_log_lines: pick_flag(args.only_log_lines, file.only_log_lines),
        });

        let export = match args.export_file.or(file.export_file) {
            Some(path) => {
                let mut config = file
                    .export_batch_size
                    .map(ExportConfig::with_batch_size)
                    .unwrap_or_default();
                if let Some(interval) = file.export_flush_interval {
                    config.flush_interval = interval;
                }
                let target = if path == "-" {
                    ExportTarget::Stdout
                } else {
                    ExportTarget::File(PathBuf::from(path))
                };
                Some(ExportSettings { target, config })
            }
            None if export_only => anyhow::bail!("--export-only requires --export-file"),
            None => None,
        };
        let export_to_stdout = export
            .as_ref()
            .is_some_and(|e| e.target == ExportTarget::Stdout);
        if console.is_some() && export_to_stdout {
            anyhow::bail!("--export-file - writes to stdout and needs --export-only");
        }

        let shutdown_timeout = match args.shutdown_timeout {
            Some(timeout) => parse_duration("shutdown-timeout", &timeout)?,
            None => file.shutdown_timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT),
        };

        Ok(Self {
            context: args.context.or(file.context),
            selector,
            filter,
            manager,
            restart_policy: args.restart_policy.or(file.restart_policy).unwrap_or_default(),
            backoff: file.backoff,
            console,
            export,
            shutdown_timeout,
        })
    }
}
