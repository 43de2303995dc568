//! Watcher engine: one long-lived stream task per watchable kind, plus the
//! timed pollers for kinds the API cannot stream (component status, the
//! node-proxy PVC stats).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ComponentStatus, Node, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, ListParams};
use kube_runtime::watcher;
use kube_runtime::watcher::Config as WatcherConfig;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::daemon::Daemon;
use crate::errors::K8sError;
use crate::k8s::objects::pvc;
use crate::k8s::ResourceKind;
use crate::scheduler::spawn_timed;

/// How often the reaper looks for dead watcher tasks.
const REAP_INTERVAL: Duration = Duration::from_secs(60);
/// Pause after a watch stream error before reading on.
const WATCH_ERROR_BACKOFF: Duration = Duration::from_secs(5);
/// Bounded join per task at shutdown.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Owns the watcher and poller tasks and respawns watchers that died.
pub struct WatcherSet {
    client: kube::Client,
    daemon: Arc<Daemon>,
    handles: Mutex<HashMap<ResourceKind, JoinHandle<()>>>,
    pollers: Mutex<Vec<JoinHandle<()>>>,
}

impl WatcherSet {
    pub fn new(client: kube::Client, daemon: Arc<Daemon>) -> Arc<Self> {
        Arc::new(Self {
            client,
            daemon,
            handles: Mutex::new(HashMap::new()),
            pollers: Mutex::new(Vec::new()),
        })
    }

    /// Spawns one watcher per watchable enabled kind, the pollers, and the
    /// reaper that respawns watchers which died.
    pub async fn start(self: &Arc<Self>) {
        let kinds: Vec<ResourceKind> = self.daemon.enabled_kinds().to_vec();

        {
            let mut handles = self.handles.lock().await;
            for kind in kinds.iter().filter(|k| k.is_watchable()) {
                handles.insert(*kind, self.spawn_watch(*kind));
            }
        }

        let mut pollers = self.pollers.lock().await;
        if kinds.contains(&ResourceKind::Components) {
            pollers.push(self.spawn_components_poller());
        }
        if kinds.contains(&ResourceKind::Pvcs) {
            pollers.push(self.spawn_pvc_poller());
        }
        pollers.push(self.spawn_reaper());
    }

    fn spawn_watch(&self, kind: ResourceKind) -> JoinHandle<()> {
        let client = self.client.clone();
        let daemon = Arc::clone(&self.daemon);
        let timeout = daemon.config.k8s_watch_timeout;

        match kind {
            ResourceKind::Nodes => {
                tokio::spawn(watch_resource(Api::<Node>::all(client), daemon, kind, timeout))
            }
            ResourceKind::Services => tokio::spawn(watch_resource(
                Api::<Service>::all(client),
                daemon,
                kind,
                timeout,
            )),
            ResourceKind::Deployments => tokio::spawn(watch_resource(
                Api::<Deployment>::all(client),
                daemon,
                kind,
                timeout,
            )),
            ResourceKind::Statefulsets => tokio::spawn(watch_resource(
                Api::<StatefulSet>::all(client),
                daemon,
                kind,
                timeout,
            )),
            ResourceKind::Daemonsets => tokio::spawn(watch_resource(
                Api::<DaemonSet>::all(client),
                daemon,
                kind,
                timeout,
            )),
            ResourceKind::Pods => {
                tokio::spawn(watch_resource(Api::<Pod>::all(client), daemon, kind, timeout))
            }
            ResourceKind::Ingresses => tokio::spawn(watch_resource(
                Api::<Ingress>::all(client),
                daemon,
                kind,
                timeout,
            )),
            // tls objects are cluster secrets carrying a certificate
            ResourceKind::Tls => tokio::spawn(watch_resource(
                Api::<Secret>::all(client),
                daemon,
                kind,
                timeout,
            )),
            ResourceKind::Components | ResourceKind::Containers | ResourceKind::Pvcs => {
                // not watchable; handled by pollers or derived by the scheduler
                tokio::spawn(async {})
            }
        }
    }

    /// The component status endpoint does not support watches; list it every
    /// resend interval instead. No delete events are synthesized.
    fn spawn_components_poller(&self) -> JoinHandle<()> {
        let client = self.client.clone();
        let daemon = Arc::clone(&self.daemon);
        let interval = daemon.config.resend_interval(ResourceKind::Components);
        let token = daemon.shutdown_token();

        spawn_timed(
            "components.poll".to_string(),
            interval,
            None,
            token,
            move || {
                let client = client.clone();
                let daemon = Arc::clone(&daemon);
                async move {
                    let api: Api<ComponentStatus> = Api::all(client);
                    let list = api.list(&ListParams::default()).await.map_err(|e| {
                        K8sError::watch_failed(ResourceKind::Components, e.to_string())
                    })?;
                    for item in list.items {
                        match serde_json::to_value(&item) {
                            Ok(raw) => daemon.ingest(ResourceKind::Components, raw).await,
                            Err(e) => warn!(error = %e, "unserializable component status"),
                        }
                    }
                    Ok::<(), K8sError>(())
                }
            },
        )
    }

    /// PVC usage comes from each node's proxied kubelet stats summary.
    fn spawn_pvc_poller(&self) -> JoinHandle<()> {
        let client = self.client.clone();
        let daemon = Arc::clone(&self.daemon);
        let interval = daemon.config.resend_interval(ResourceKind::Pvcs);
        let token = daemon.shutdown_token();

        spawn_timed("pvcs.poll".to_string(), interval, None, token, move || {
            let client = client.clone();
            let daemon = Arc::clone(&daemon);
            async move {
                let nodes = known_node_names(&client, &daemon).await?;
                for node in nodes {
                    let summary = match node_stats_summary(&client, &node).await {
                        Ok(summary) => summary,
                        Err(e) => {
                            warn!(%node, error = %e, "failed to fetch node stats summary");
                            continue;
                        }
                    };
                    for pod_stats in summary["pods"].as_array().into_iter().flatten() {
                        for volume in pod_stats["volume"].as_array().into_iter().flatten() {
                            if let Some(raw) = pvc::raw_from_volume(&node, volume) {
                                daemon.ingest(ResourceKind::Pvcs, raw).await;
                            }
                        }
                    }
                }
                Ok::<(), K8sError>(())
            }
        })
    }

    /// Teardown-and-respawn pass: a watcher task that died (panic, fatal
    /// protocol error) is detected here and started again.
    fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let set = Arc::clone(self);
        let token = set.daemon.shutdown_token();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(REAP_INTERVAL) => {}
                }

                let mut handles = set.handles.lock().await;
                let dead: Vec<ResourceKind> = handles
                    .iter()
                    .filter(|(_, handle)| handle.is_finished())
                    .map(|(kind, _)| *kind)
                    .collect();
                for kind in dead {
                    warn!(%kind, "watcher task died, respawning");
                    handles.insert(kind, set.spawn_watch(kind));
                }
                if !handles.is_empty() {
                    debug!(active = handles.len(), "active watchers");
                }
            }
        })
    }

    /// Cancels every task and joins each with a bounded timeout.
    pub async fn shutdown(&self) {
        let mut handles = self.handles.lock().await;
        for (kind, handle) in handles.drain() {
            if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, handle).await.is_err() {
                warn!(%kind, "watcher did not stop in time");
            }
        }
        let mut pollers = self.pollers.lock().await;
        for handle in pollers.drain(..) {
            if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("poller did not stop in time");
            }
        }
    }
}

/// One streaming watch: translate events into coordinator dispatch, reopen
/// the stream when it ends, back off briefly on errors, stop on shutdown.
async fn watch_resource<K>(api: Api<K>, daemon: Arc<Daemon>, kind: ResourceKind, timeout: u64)
where
    K: kube::Resource<DynamicType = ()> + Clone + std::fmt::Debug + Send + 'static,
    K: serde::de::DeserializeOwned + serde::Serialize,
{
    let shutdown = daemon.shutdown_token();
    let mut config = WatcherConfig::default().any_semantic();
    if timeout > 0 {
        config = config.timeout(timeout as u32);
    }
    info!(%kind, timeout_secs = timeout, "watching resource");

    let mut stream = watcher(api.clone(), config.clone()).boxed();
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = stream.next() => event,
        };

        match event {
            Some(Ok(watcher::Event::Apply(obj))) | Some(Ok(watcher::Event::InitApply(obj))) => {
                match serde_json::to_value(&obj) {
                    Ok(raw) => daemon.dispatch_apply(kind, raw).await,
                    Err(e) => warn!(%kind, error = %e, "unserializable watch object"),
                }
            }
            Some(Ok(watcher::Event::Delete(obj))) => match serde_json::to_value(&obj) {
                Ok(raw) => daemon.dispatch_delete(kind, raw).await,
                Err(e) => warn!(%kind, error = %e, "unserializable watch object"),
            },
            Some(Ok(watcher::Event::Init)) | Some(Ok(watcher::Event::InitDone)) => {}
            Some(Err(e)) => {
                warn!(%kind, error = %e, "watch stream error, backing off");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(WATCH_ERROR_BACKOFF) => {}
                }
            }
            None => {
                debug!(%kind, "watch stream ended, restarting");
                stream = watcher(api.clone(), config.clone()).boxed();
            }
        }
    }
    info!(%kind, "watcher stopped");
}

async fn known_node_names(client: &kube::Client, daemon: &Daemon) -> Result<Vec<String>, K8sError> {
    let from_store: Vec<String> = {
        let state = daemon.lock_state().await;
        state
            .stores
            .get(&ResourceKind::Nodes)
            .map(|store| store.snapshot().map(|obj| obj.name.clone()).collect())
            .unwrap_or_default()
    };
    if !from_store.is_empty() {
        return Ok(from_store);
    }

    let api: Api<Node> = Api::all(client.clone());
    let list = api
        .list(&ListParams::default())
        .await
        .map_err(|e| K8sError::watch_failed(ResourceKind::Pvcs, e.to_string()))?;
    Ok(list
        .items
        .into_iter()
        .filter_map(|node| node.metadata.name)
        .collect())
}

async fn node_stats_summary(client: &kube::Client, node: &str) -> Result<Value, K8sError> {
    let path = format!("/api/v1/nodes/{node}/proxy/stats/summary");
    let request = http::Request::get(path)
        .body(Vec::new())
        .map_err(|e| K8sError::ApiError {
            message: e.to_string(),
        })?;
    client
        .request::<Value>(request)
        .await
        .map_err(|e| K8sError::ApiError {
            message: e.to_string(),
        })
}
