//! `kube`-backed implementation of the cluster seams

use futures::{AsyncBufRead, AsyncBufReadExt, FutureExt, StreamExt, future, stream};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::Api;
use kube::api::{ListParams, LogParams};
use kube::runtime::{WatchStreamExt, watcher};

use crate::source::{
    ClusterError, LineStream, LogSource, LogStreamOptions, PodEvent, PodEventStream, PodSource,
    WatchRequest,
};
use podtail_types::{ContainerInfo, ContainerKind, ContainerState, PodInfo, Target};

/// Cluster access through a `kube::Client`
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
}

impl KubeCluster {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn pods_api(&self, namespace: Option<&str>) -> Api<Pod> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn watch_scope(&self, namespace: Option<&str>, request: &WatchRequest) -> PodEventStream {
        let api = self.pods_api(namespace);
        let scope = namespace.map(str::to_string);

        if request.follow {
            let mut config = watcher::Config::default();
            if let Some(labels) = &request.label_selector {
                config = config.labels(labels);
            }
            if let Some(fields) = &request.field_selector {
                config = config.fields(fields);
            }

            return watcher(api, config)
                .default_backoff()
                .filter_map(move |event| future::ready(translate_watch_event(event, &scope)))
                .boxed();
        }

        let mut params = ListParams::default();
        if let Some(labels) = &request.label_selector {
            params = params.labels(labels);
        }
        if let Some(fields) = &request.field_selector {
            params = params.fields(fields);
        }

        stream::once(async move { api.list(&params).await })
            .flat_map(move |result| {
                let events = match result {
                    Ok(list) => {
                        let mut events = Vec::with_capacity(list.items.len() + 2);
                        events.push(Ok(PodEvent::ResyncStarted {
                            scope: scope.clone(),
                        }));
                        events.extend(
                            list.items
                                .into_iter()
                                .map(|pod| Ok(PodEvent::Applied(pod_info(pod)))),
                        );
                        events.push(Ok(PodEvent::ResyncDone {
                            scope: scope.clone(),
                        }));
                        events
                    }
                    Err(e) => vec![Err(ClusterError::WatchChannel(format!(
                        "failed to list pods: {}",
                        e
                    )))],
                };
                stream::iter(events)
            })
            .boxed()
    }
}

impl LogSource for KubeCluster {
    fn open_log_stream(
        &self,
        target: &Target,
        options: &LogStreamOptions,
    ) -> futures::future::BoxFuture<'static, Result<LineStream, ClusterError>> {
        let api = self.pods_api(Some(&target.namespace));
        let pod_name = target.pod.clone();
        let params = LogParams {
            follow: options.follow,
            container: Some(target.container.clone()),
            tail_lines: options.tail_lines,
            since_seconds: options.since_seconds,
            since_time: options.since_time,
            timestamps: true,
            ..Default::default()
        };

        async move {
            let reader = api
                .log_stream(&pod_name, &params)
                .await
                .map_err(classify_open_error)?;

            Ok(byte_lines(reader))
        }
        .boxed()
    }
}

impl PodSource for KubeCluster {
    fn watch_pods(&self, request: &WatchRequest) -> PodEventStream {
        if request.namespaces.is_empty() {
            return self.watch_scope(None, request);
        }

        let streams = request
            .namespaces
            .iter()
            .map(|ns| self.watch_scope(Some(ns), request));
        stream::select_all(streams).boxed()
    }
}

/// Split a log body into lines without requiring valid UTF-8.
///
/// Invalid bytes are replaced rather than failing the stream, so only real
/// I/O errors surface as `StreamTransport`.
pub(crate) fn byte_lines<R>(reader: R) -> LineStream
where
    R: AsyncBufRead + Send + 'static,
{
    stream::try_unfold(Box::pin(reader), |mut reader| async move {
        let mut buf = Vec::new();
        let read = reader
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| ClusterError::StreamTransport(e.to_string()))?;
        if read == 0 {
            return Ok(None);
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        Ok(Some((String::from_utf8_lossy(&buf).into_owned(), reader)))
    })
    .boxed()
}

/// Missing pods/containers and bad requests will not heal by retrying
fn classify_open_error(err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(resp) if matches!(resp.code, 400 | 403 | 404) => {
            ClusterError::StreamTerminal(resp.message)
        }
        other => ClusterError::StreamTransport(other.to_string()),
    }
}

fn is_auth_failure(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 401 || resp.code == 403)
}

fn translate_watch_event(
    event: Result<watcher::Event<Pod>, watcher::Error>,
    scope: &Option<String>,
) -> Option<Result<PodEvent, ClusterError>> {
    match event {
        Ok(watcher::Event::Init) => Some(Ok(PodEvent::ResyncStarted {
            scope: scope.clone(),
        })),
        Ok(watcher::Event::InitApply(pod)) | Ok(watcher::Event::Apply(pod)) => {
            Some(Ok(PodEvent::Applied(pod_info(pod))))
        }
        Ok(watcher::Event::Delete(pod)) => Some(Ok(PodEvent::Deleted(pod_info(pod)))),
        Ok(watcher::Event::InitDone) => Some(Ok(PodEvent::ResyncDone {
            scope: scope.clone(),
        })),
        Err(e) => {
            let fatal = match &e {
                watcher::Error::InitialListFailed(err)
                | watcher::Error::WatchStartFailed(err)
                | watcher::Error::WatchFailed(err) => is_auth_failure(err),
                watcher::Error::WatchError(resp) => resp.code == 401 || resp.code == 403,
                #[allow(unreachable_patterns)]
                _ => false,
            };
            if fatal {
                return Some(Err(ClusterError::WatchChannel(e.to_string())));
            }
            // The backoff wrapper reconnects on the next poll
            tracing::warn!(error = %e, scope = ?scope, "pod watch interrupted, reconnecting");
            None
        }
    }
}

/// Convert a k8s Pod to PodInfo
pub(crate) fn pod_info(pod: Pod) -> PodInfo {
    let metadata = pod.metadata;
    let mut info = PodInfo::new(
        metadata.name.unwrap_or_default(),
        metadata.namespace.unwrap_or_default(),
    );
    info.uid = metadata.uid;
    info.labels = metadata.labels.unwrap_or_default();
    info.annotations = metadata.annotations.unwrap_or_default();

    let status = pod.status.unwrap_or_default();

    let Some(spec) = pod.spec else {
        return info;
    };
    info.node_name = spec.node_name;

    let init_statuses = status.init_container_statuses.unwrap_or_default();
    let statuses = status.container_statuses.unwrap_or_default();
    let ephemeral_statuses = status.ephemeral_container_statuses.unwrap_or_default();

    for container in spec.init_containers.unwrap_or_default() {
        info.containers.push(container_info(
            container.name,
            ContainerKind::Init,
            &init_statuses,
        ));
    }
    for container in spec.containers {
        info.containers.push(container_info(
            container.name,
            ContainerKind::Regular,
            &statuses,
        ));
    }
    for container in spec.ephemeral_containers.unwrap_or_default() {
        info.containers.push(container_info(
            container.name,
            ContainerKind::Ephemeral,
            &ephemeral_statuses,
        ));
    }

    info
}

fn container_info(name: String, kind: ContainerKind, statuses: &[ContainerStatus]) -> ContainerInfo {
    let mut container = ContainerInfo::new(name, kind);
    let Some(status) = statuses.iter().find(|s| s.name == container.name) else {
        return container;
    };

    container.container_id = status.container_id.clone();
    container.state = status.state.as_ref().and_then(|state| {
        if state.running.is_some() {
            Some(ContainerState::Running)
        } else if state.terminated.is_some() {
            Some(ContainerState::Terminated)
        } else if state.waiting.is_some() {
            Some(ContainerState::Waiting)
        } else {
            None
        }
    });
    container
}
