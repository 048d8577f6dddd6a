mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use config::{Args, ExportTarget, FileConfig, RestartPolicyKind, Settings};
use podtail_k8s::{KubeClient, KubeCluster, PodSource, TargetWatcher};
use podtail_logs::{
    ConsoleSink, ExponentialBackoff, ExportSink, Immediate, RestartPolicy, Sink, SinkSet,
    TailManager,
};

/// Buffered target notifications between the watcher and the manager
const TARGET_CHANNEL_SIZE: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Diagnostics go to stderr; stdout carries log lines
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(rust_log.as_deref()))
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

/// `RUST_LOG` directives when set and valid, otherwise warnings only
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("warn"))
}

async fn run(args: Args) -> Result<()> {
    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let mut settings = Settings::resolve(args, file)?;

    let kube_client = KubeClient::new();
    let context = settings
        .context
        .clone()
        .or_else(|| kube_client.current_context().map(str::to_string));
    if settings.selector.namespaces.is_empty() && !settings.selector.all_namespaces {
        let namespace = kube_client
            .context_namespace(settings.context.as_deref())
            .unwrap_or_else(|| "default".to_string());
        settings.selector.namespaces.push(namespace);
    }

    let client = kube_client.client(settings.context.as_deref()).await?;
    let cluster = Arc::new(KubeCluster::new(client));
    let sinks = build_sinks(&settings, context.as_deref()).await?;
    let restart_policy = build_restart_policy(&settings);
    let shutdown_timeout = settings.shutdown_timeout;

    tracing::debug!(
        context = ?context,
        namespaces = ?settings.selector.namespaces,
        all_namespaces = settings.selector.all_namespaces,
        sinks = sinks.len(),
        "starting"
    );

    let cancel = CancellationToken::new();
    let (target_tx, target_rx) = mpsc::channel(TARGET_CHANNEL_SIZE);

    let events = cluster.watch_pods(
        &settings
            .selector
            .watch_request(settings.manager.options.follow),
    );
    let watcher = TargetWatcher::new(settings.selector);
    let mut watcher_task = tokio::spawn(watcher.run(events, target_tx, cancel.clone()));

    let manager = TailManager::new(cluster, settings.manager, settings.filter, sinks.clone())
        .with_restart_policy(restart_policy);
    let mut manager_task = tokio::spawn(manager.run(target_rx, cancel.clone()));

    let mut watcher_done = false;
    let mut failure = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                tracing::info!("interrupted, shutting down");
                cancel.cancel();
            }
            result = &mut watcher_task, if !watcher_done => {
                watcher_done = true;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        failure = Some(anyhow::Error::new(e).context("Pod watch failed"));
                        cancel.cancel();
                    }
                    Err(e) => {
                        failure = Some(anyhow::anyhow!("Pod watcher task failed: {}", e));
                        cancel.cancel();
                    }
                }
            }
            result = &mut manager_task => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "tail manager task failed");
                }
                break;
            }
        }
    }

    sinks.shutdown(shutdown_timeout).await;

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn build_sinks(settings: &Settings, cluster_name: Option<&str>) -> Result<SinkSet> {
    let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();

    if let Some(console) = &settings.console {
        sinks.push(Arc::new(ConsoleSink::stdout(console.clone())));
    }

    if let Some(export) = &settings.export {
        let mut config = export.config.clone();
        config.cluster_name = cluster_name.map(str::to_string);

        let writer: Box<dyn AsyncWrite + Send + Unpin> = match &export.target {
            ExportTarget::Stdout => Box::new(tokio::io::stdout()),
            ExportTarget::File(path) => Box::new(
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .with_context(|| format!("Failed to open export file {}", path.display()))?,
            ),
        };
        sinks.push(Arc::new(ExportSink::spawn(config, writer)));
    }

    Ok(SinkSet::new(sinks))
}

fn build_restart_policy(settings: &Settings) -> Arc<dyn RestartPolicy> {
    match settings.restart_policy {
        RestartPolicyKind::Immediate => Arc::new(Immediate),
        RestartPolicyKind::Backoff => Arc::new(ExponentialBackoff {
            initial: settings.backoff.initial,
            max: settings.backoff.max,
            max_attempts: settings.backoff.max_attempts,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn test_log_filter_honours_rust_log_level() {
        assert_eq!(
            log_filter(Some("debug")).max_level_hint(),
            Some(LevelFilter::DEBUG)
        );
        assert_eq!(
            log_filter(Some("podtail_logs=trace")).max_level_hint(),
            Some(LevelFilter::TRACE)
        );
        assert_eq!(log_filter(None).max_level_hint(), Some(LevelFilter::WARN));
    }
}
