//! The coordinator: owns the per-kind stores and the discovery bookkeeping
//! behind a single lock, turns watch events into store mutations and
//! immediate sends, and drives the timed discovery/resend/aggregate jobs.
//!
//! Lock discipline: values to transmit are collected under one guard, the
//! network I/O happens outside it, and failures re-arm the dirty flags under
//! a fresh acquisition.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{Mutex, MutexGuard, OnceCell};
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::errors::AgentResult;
use crate::errors::SinkResult;
use crate::k8s::objects::container::ContainerStat;
use crate::k8s::objects::{pod, K8sObject};
use crate::k8s::store::{ObjectChange, ResourceStore};
use crate::k8s::ResourceKind;
use crate::sinks::web::{WebAction, WebApi};
use crate::sinks::zabbix::{ZabbixMetric, ZabbixSender};
use tokio_util::sync::CancellationToken;

/// Minimum gap between two immediate sends for the same object and sink.
pub const RATE_LIMIT: Duration = Duration::from_secs(30);

/// Fixed cadence of the API heartbeat item.
pub const API_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// First-run delays of the timed jobs.
pub const DISCOVERY_FIRST_DELAY: Duration = Duration::from_secs(30);
pub const RESEND_FIRST_DELAY: Duration = Duration::from_secs(60);

/// Everything guarded by the coordinator lock.
pub struct SharedState {
    pub stores: HashMap<ResourceKind, ResourceStore>,
    pub discovery_sent: HashMap<ResourceKind, DateTime<Utc>>,
}

pub struct Daemon {
    pub config: AgentConfig,
    kinds: Vec<ResourceKind>,
    zabbix_kinds: Vec<ResourceKind>,
    web_kinds: Vec<ResourceKind>,
    namespace_exclude: Option<regex::Regex>,
    zabbix: ZabbixSender,
    web: OnceCell<WebApi>,
    state: Mutex<SharedState>,
    shutdown: CancellationToken,
    pub rate_limit: Duration,
}

impl Daemon {
    pub fn new(config: AgentConfig) -> Arc<Self> {
        let kinds = config.enabled_kinds();
        let zabbix_kinds = config.zabbix_kinds();
        let web_kinds = config.web_kinds();
        let namespace_exclude = config.namespace_exclude();

        let mut stores = HashMap::new();
        for kind in &kinds {
            // the derived containers view only exists when pods are mirrored
            if *kind == ResourceKind::Containers && !kinds.contains(&ResourceKind::Pods) {
                continue;
            }
            stores.insert(*kind, ResourceStore::new(*kind));
        }

        let zabbix = ZabbixSender::new(
            config.zabbix_server.clone(),
            config.zabbix_port,
            config.zabbix_dry_run,
            config.zabbix_single_debug,
        );

        info!(
            api = %config.k8s_api_host,
            zabbix_server = %config.zabbix_server,
            zabbix_host = %config.zabbix_host,
            resources = %kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(","),
            web_api_enable = config.web_api_enable,
            web_api_host = %config.web_api_host,
            "agent initialized"
        );

        Arc::new(Self {
            config,
            kinds,
            zabbix_kinds,
            web_kinds,
            namespace_exclude,
            zabbix,
            web: OnceCell::new(),
            state: Mutex::new(SharedState {
                stores,
                discovery_sent: HashMap::new(),
            }),
            shutdown: CancellationToken::new(),
            rate_limit: RATE_LIMIT,
        })
    }

    pub fn enabled_kinds(&self) -> &[ResourceKind] {
        &self.kinds
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// The coordinator lock. Exposed for the signal dumps and tests; all
    /// pipeline code paths acquire it through the methods below.
    pub async fn lock_state(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().await
    }

    fn excluded_namespace(&self, raw: &Value) -> bool {
        let Some(re) = &self.namespace_exclude else {
            return false;
        };
        raw.pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .is_some_and(|ns| re.is_match(ns))
    }

    fn rate_limited(&self, sent_at: Option<Instant>, now: Instant) -> bool {
        sent_at.is_some_and(|at| now.duration_since(at) < self.rate_limit)
    }

    fn web_payload(&self, obj: &K8sObject) -> Value {
        let mut payload = obj.canonical();
        payload.insert(
            "cluster".to_string(),
            json!(self.config.web_api_cluster),
        );
        Value::Object(payload)
    }

    async fn web_api(&self) -> SinkResult<&WebApi> {
        self.web
            .get_or_try_init(|| {
                WebApi::connect(
                    &self.config.web_api_host,
                    &self.config.web_api_token,
                    self.config.web_api_verify_ssl,
                )
            })
            .await
    }

    /// An ADDED or MODIFIED watch event: mirror the object and, when its
    /// content changed, attempt an immediate send per sink.
    pub async fn dispatch_apply(&self, kind: ResourceKind, raw: Value) {
        if self.excluded_namespace(&raw) {
            return;
        }
        if self.config.debug_k8s_events {
            debug!(%kind, name = raw.pointer("/metadata/name").and_then(serde_json::Value::as_str).unwrap_or("?"),
                   "apply event");
        }

        let now = Utc::now();
        let mono = Instant::now();
        let mut zabbix_batch: Option<Vec<ZabbixMetric>> = None;
        let mut web_send: Option<(Value, WebAction)> = None;
        let uid;

        {
            let mut state = self.state.lock().await;
            let discovery_ready = state.discovery_sent.contains_key(&kind);
            let Some(store) = state.stores.get_mut(&kind) else {
                error!(%kind, "no store for dispatched event, discarding");
                return;
            };
            let change = match store.add(raw) {
                Ok((added_uid, change)) => {
                    uid = added_uid;
                    change
                }
                Err(e) => {
                    warn!(%kind, error = %e, "skipping malformed object");
                    return;
                }
            };
            if change == ObjectChange::Unchanged {
                return;
            }
            let Some(obj) = store.get_mut(&uid) else {
                return;
            };

            if self.zabbix_kinds.contains(&kind) && obj.state.is_dirty_zabbix {
                if !discovery_ready {
                    debug!(%kind, %uid, "discovery not sent yet, deferring zabbix data");
                } else if self.rate_limited(obj.state.sent_zabbix_at, mono) {
                    info!(%kind, %uid, limit_secs = self.rate_limit.as_secs(),
                          "not sending to zabbix, rate limited");
                } else {
                    let metrics = obj.zabbix_metrics(&self.config.zabbix_host);
                    obj.state.last_sent_zabbix = now;
                    obj.state.sent_zabbix_at = Some(mono);
                    obj.state.is_dirty_zabbix = false;
                    if !metrics.is_empty() {
                        zabbix_batch = Some(metrics);
                    }
                }
            }

            if self.config.web_api_enable
                && self.web_kinds.contains(&kind)
                && obj.state.is_dirty_web
            {
                if self.rate_limited(obj.state.sent_web_at, mono) {
                    info!(%kind, %uid, limit_secs = self.rate_limit.as_secs(),
                          "not sending to web api, rate limited");
                } else {
                    let action = if change == ObjectChange::New {
                        WebAction::Added
                    } else {
                        WebAction::Modified
                    };
                    let payload = self.web_payload(obj);
                    obj.state.last_sent_web = now;
                    obj.state.sent_web_at = Some(mono);
                    obj.state.is_dirty_web = false;
                    web_send = Some((payload, action));
                }
            }
        }

        if let Some(metrics) = zabbix_batch {
            let result = self.zabbix.send(&metrics).await;
            if result.failed > 0 {
                warn!(%kind, %uid, failed = result.failed, "zabbix send failed, keeping object dirty");
                self.rearm_zabbix(kind, std::slice::from_ref(&uid)).await;
            }
        }
        if let Some((payload, action)) = web_send {
            if let Err(e) = self.submit_web(kind, &payload, action).await {
                warn!(%kind, %uid, error = %e, "web submission failed, keeping object dirty");
                self.rearm_web(kind, std::slice::from_ref(&uid)).await;
            }
        }
    }

    /// A DELETED watch event: drop the mirror entry and tell the web API.
    /// Deletions are not propagated to Zabbix.
    pub async fn dispatch_delete(&self, kind: ResourceKind, raw: Value) {
        if self.excluded_namespace(&raw) {
            return;
        }

        let removed = {
            let mut state = self.state.lock().await;
            let Some(store) = state.stores.get_mut(&kind) else {
                error!(%kind, "no store for dispatched delete, discarding");
                return;
            };
            match store.delete(raw) {
                Ok(removed) => removed,
                Err(e) => {
                    warn!(%kind, error = %e, "skipping malformed delete");
                    return;
                }
            }
        };

        let Some(obj) = removed else {
            return;
        };
        if self.config.web_api_enable && self.web_kinds.contains(&kind) {
            let payload = self.web_payload(&obj);
            if let Err(e) = self.submit_web(kind, &payload, WebAction::Deleted).await {
                warn!(%kind, uid = %obj.uid(), error = %e, "web delete failed");
            }
        }
    }

    /// List-driven ingestion (component status, PVC stats): mirrors the
    /// object without an immediate send; the resend pass publishes it.
    pub async fn ingest(&self, kind: ResourceKind, raw: Value) {
        if self.excluded_namespace(&raw) {
            return;
        }
        let mut state = self.state.lock().await;
        let Some(store) = state.stores.get_mut(&kind) else {
            error!(%kind, "no store for listed object, discarding");
            return;
        };
        if let Err(e) = store.add(raw) {
            warn!(%kind, error = %e, "skipping malformed object");
        }
    }

    async fn submit_web(
        &self,
        kind: ResourceKind,
        payload: &Value,
        action: WebAction,
    ) -> SinkResult<()> {
        let api = self.web_api().await?;
        api.send_data(kind, payload, action).await
    }

    async fn rearm_zabbix(&self, kind: ResourceKind, uids: &[String]) {
        let mut state = self.state.lock().await;
        if let Some(store) = state.stores.get_mut(&kind) {
            for uid in uids {
                if let Some(obj) = store.get_mut(uid) {
                    obj.state.is_dirty_zabbix = true;
                }
            }
        }
    }

    async fn rearm_web(&self, kind: ResourceKind, uids: &[String]) {
        let mut state = self.state.lock().await;
        if let Some(store) = state.stores.get_mut(&kind) {
            for uid in uids {
                if let Some(obj) = store.get_mut(uid) {
                    obj.state.is_dirty_web = true;
                }
            }
        }
    }

    /// Discovery announcement pass for one kind: concatenate every object's
    /// tuples into a single low-level discovery item. The per-kind
    /// discovery timestamp is only recorded once the sink accepted the item.
    pub async fn send_discovery(&self, kind: ResourceKind) -> AgentResult<()> {
        if !self.zabbix_kinds.contains(&kind) {
            return Ok(());
        }

        let tuples: Vec<Value> = {
            let state = self.state.lock().await;
            let Some(store) = state.stores.get(&kind) else {
                return Ok(());
            };
            store
                .snapshot()
                .flat_map(|obj| obj.discovery_tuples())
                .collect()
        };
        if tuples.is_empty() {
            debug!(%kind, "no discovery data");
            return Ok(());
        }

        let metric = ZabbixMetric::new(
            &self.config.zabbix_host,
            format!("check_kubernetesd[discover,{kind}]"),
            json!({ "data": tuples }).to_string(),
        );
        debug!(%kind, tuples = tuples.len(), "sending discovery");
        let result = self.zabbix.send(std::slice::from_ref(&metric)).await;
        if result.failed > 0 {
            error!(%kind, "failed to send zabbix discovery");
            return Ok(());
        }
        if self.config.zabbix_debug {
            info!(%kind, value = %metric.value, "sent zabbix discovery");
        }

        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.discovery_sent.insert(kind, now);
        if let Some(store) = state.stores.get_mut(&kind) {
            for (_, obj) in store.iter_mut() {
                obj.state.last_sent_zabbix_discovery = now;
            }
        }
        Ok(())
    }

    /// Periodic resend pass for one kind.
    ///
    /// Zabbix: skipped until discovery went out; collects objects that are
    /// dirty or stale into one batch. Web: unsubmitted objects go out as
    /// ADDED, dirty or stale ones as MODIFIED.
    pub async fn resend_data(&self, kind: ResourceKind) -> AgentResult<()> {
        let interval = self.config.resend_interval(kind);
        let now = Utc::now();
        let mono = Instant::now();
        let cutoff = now - chrono::Duration::seconds(interval.as_secs() as i64);

        let mut zabbix_batch: Vec<ZabbixMetric> = Vec::new();
        let mut zabbix_uids: Vec<String> = Vec::new();
        let mut web_batch: Vec<(String, Value, WebAction)> = Vec::new();

        {
            let mut state = self.state.lock().await;
            let discovery_ready = state.discovery_sent.contains_key(&kind);
            let Some(store) = state.stores.get_mut(&kind) else {
                return Ok(());
            };
            if store.is_empty() {
                debug!(%kind, "no resource data available, stop delivery");
                return Ok(());
            }

            if self.zabbix_kinds.contains(&kind) {
                if !discovery_ready {
                    debug!(%kind, "skipping zabbix resend, discovery not sent yet");
                } else {
                    for (uid, obj) in store.iter_mut() {
                        if obj.state.is_dirty_zabbix || obj.state.last_sent_zabbix < cutoff {
                            zabbix_batch.extend(obj.zabbix_metrics(&self.config.zabbix_host));
                            obj.state.last_sent_zabbix = now;
                            obj.state.sent_zabbix_at = Some(mono);
                            obj.state.is_dirty_zabbix = false;
                            zabbix_uids.push(uid.clone());
                        }
                    }
                }
            }

            if self.config.web_api_enable && self.web_kinds.contains(&kind) {
                for (uid, obj) in store.iter_mut() {
                    let action = if obj.state.is_unsubmitted_web() {
                        Some(WebAction::Added)
                    } else if obj.state.is_dirty_web || obj.state.last_sent_web < cutoff {
                        Some(WebAction::Modified)
                    } else {
                        None
                    };
                    let Some(action) = action else { continue };
                    let payload = self.web_payload(obj);
                    obj.state.last_sent_web = now;
                    obj.state.sent_web_at = Some(mono);
                    obj.state.is_dirty_web = false;
                    web_batch.push((uid.clone(), payload, action));
                }
            }
        }

        if !zabbix_batch.is_empty() {
            debug!(%kind, items = zabbix_batch.len(), "resending zabbix data");
            let result = self.zabbix.send(&zabbix_batch).await;
            if result.failed > 0 {
                warn!(%kind, failed = result.failed, "zabbix resend failed, keeping objects dirty");
                self.rearm_zabbix(kind, &zabbix_uids).await;
            }
        }
        for (uid, payload, action) in web_batch {
            if let Err(e) = self.submit_web(kind, &payload, action).await {
                warn!(%kind, %uid, error = %e, "web resend failed, keeping object dirty");
                self.rearm_web(kind, std::slice::from_ref(&uid)).await;
            }
        }
        Ok(())
    }

    /// Per-cluster service counts.
    pub async fn report_services_global(&self) -> AgentResult<()> {
        if !self.zabbix_kinds.contains(&ResourceKind::Services) {
            return Ok(());
        }

        let metrics = {
            let state = self.state.lock().await;
            if !state.discovery_sent.contains_key(&ResourceKind::Services) {
                debug!("skipping services aggregate, discovery not sent yet");
                return Ok(());
            }
            let Some(store) = state.stores.get(&ResourceKind::Services) else {
                return Ok(());
            };

            let num_services = store.len();
            let num_ingress = store
                .snapshot()
                .filter(|obj| crate::k8s::objects::service::is_ingress(obj))
                .count();
            vec![
                ZabbixMetric::new(
                    &self.config.zabbix_host,
                    "check_kubernetes[get,services,num_services]",
                    num_services.to_string(),
                ),
                ZabbixMetric::new(
                    &self.config.zabbix_host,
                    "check_kubernetes[get,services,num_ingress_services]",
                    num_ingress.to_string(),
                ),
            ]
        };

        let result = self.zabbix.send(&metrics).await;
        if result.failed > 0 {
            warn!("failed to send services aggregate");
        }
        Ok(())
    }

    /// Container rollup: group the pod mirror by (namespace, pod base name,
    /// container), sum the counters, promote errors, and emit four items per
    /// group.
    ///
    /// The groups are also materialized into the containers store so the
    /// discovery job has tuples to announce; emission itself stays gated on
    /// the containers discovery having gone out.
    pub async fn report_containers_global(&self) -> AgentResult<()> {
        if !self.zabbix_kinds.contains(&ResourceKind::Containers) {
            return Ok(());
        }

        let metrics = {
            let mut state = self.state.lock().await;
            let Some(pods) = state.stores.get(&ResourceKind::Pods) else {
                return Ok(());
            };

            let mut groups: BTreeMap<(String, String, String), ContainerStat> = BTreeMap::new();
            for obj in pods.snapshot() {
                let namespace = obj.namespace.clone().unwrap_or_default();
                let base_name = pod::base_name(obj);
                for (container_name, stat) in pod::container_stats(obj) {
                    groups
                        .entry((namespace.clone(), base_name.clone(), container_name))
                        .and_modify(|group| group.merge(&stat))
                        .or_insert(stat);
                }
            }

            if let Some(containers) = state.stores.get_mut(&ResourceKind::Containers) {
                for ((namespace, base_name, container_name), stat) in &groups {
                    let raw = json!({
                        "metadata": {"name": container_name, "namespace": namespace},
                        "pod_base_name": base_name,
                        "stats": stat,
                    });
                    if let Err(e) = containers.add(raw) {
                        warn!(error = %e, "failed to record container rollup entry");
                    }
                }
            }

            if !state.discovery_sent.contains_key(&ResourceKind::Containers) {
                debug!("skipping containers aggregate, discovery not sent yet");
                return Ok(());
            }

            let mut metrics = Vec::with_capacity(groups.len() * 4);
            for ((namespace, base_name, container_name), stat) in &groups {
                metrics.extend(crate::k8s::objects::container::zabbix_metrics(
                    &self.config.zabbix_host,
                    namespace,
                    base_name,
                    container_name,
                    stat,
                ));
            }
            metrics
        };

        if metrics.is_empty() {
            return Ok(());
        }
        let result = self.zabbix.send(&metrics).await;
        if result.failed > 0 {
            warn!("failed to send containers aggregate");
        }
        Ok(())
    }

    /// Heartbeat item proving the agent is alive and watching.
    pub async fn send_api_heartbeat(&self) -> AgentResult<()> {
        let metric = ZabbixMetric::new(
            &self.config.zabbix_host,
            "check_kubernetesd[discover,api]",
            Utc::now().timestamp().to_string(),
        );
        let result = self.zabbix.send(std::slice::from_ref(&metric)).await;
        if result.failed > 0 {
            error!("failed to send heartbeat to zabbix");
        } else {
            debug!("sent heartbeat to zabbix");
        }
        Ok(())
    }

    /// SIGUSR1: per-object send-state summary.
    pub async fn dump_summary(&self) {
        let state = self.state.lock().await;
        info!("=== per-object send state ===");
        for (kind, store) in &state.stores {
            for obj in store.snapshot() {
                info!(
                    %kind,
                    uid = %obj.uid(),
                    last_sent_zabbix = %obj.state.last_sent_zabbix,
                    last_sent_web = %obj.state.last_sent_web,
                    is_dirty_zabbix = obj.state.is_dirty_zabbix,
                    is_dirty_web = obj.state.is_dirty_web,
                );
            }
            info!(%kind, objects = store.len(), discovery_sent = ?state.discovery_sent.get(kind));
        }
    }

    /// SIGUSR2: full raw snapshot.
    pub async fn dump_full(&self) {
        let state = self.state.lock().await;
        info!("=== full object state ===");
        for (kind, store) in &state.stores {
            for obj in store.snapshot() {
                info!(%kind, uid = %obj.uid(), raw = %obj.raw);
            }
        }
    }

    /// Spawns the timed jobs: discovery per kind, resend per kind, the two
    /// global aggregates and the API heartbeat.
    pub fn spawn_scheduler_jobs(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        let token = self.shutdown_token();

        for kind in self.kinds.clone() {
            let daemon = Arc::clone(self);
            handles.push(crate::scheduler::spawn_timed(
                format!("{kind}.send_discovery"),
                self.config.discovery_interval(kind),
                Some(DISCOVERY_FIRST_DELAY),
                token.clone(),
                move || {
                    let daemon = Arc::clone(&daemon);
                    async move { daemon.send_discovery(kind).await }
                },
            ));
        }

        for kind in self.kinds.clone() {
            // the derived containers view is flushed by the rollup job
            if kind == ResourceKind::Containers {
                continue;
            }
            let daemon = Arc::clone(self);
            handles.push(crate::scheduler::spawn_timed(
                format!("{kind}.resend_data"),
                self.config.resend_interval(kind),
                Some(RESEND_FIRST_DELAY),
                token.clone(),
                move || {
                    let daemon = Arc::clone(&daemon);
                    async move { daemon.resend_data(kind).await }
                },
            ));
        }

        if self.kinds.contains(&ResourceKind::Services) {
            let daemon = Arc::clone(self);
            handles.push(crate::scheduler::spawn_timed(
                "services.report_global".to_string(),
                self.config.resend_interval(ResourceKind::Services),
                Some(self.config.discovery_interval(ResourceKind::Services) + Duration::from_secs(5)),
                token.clone(),
                move || {
                    let daemon = Arc::clone(&daemon);
                    async move { daemon.report_services_global().await }
                },
            ));
        }

        if self.kinds.contains(&ResourceKind::Pods) && self.kinds.contains(&ResourceKind::Containers)
        {
            let daemon = Arc::clone(self);
            handles.push(crate::scheduler::spawn_timed(
                "containers.report_global".to_string(),
                self.config.resend_interval(ResourceKind::Containers),
                Some(
                    self.config.discovery_interval(ResourceKind::Containers)
                        + Duration::from_secs(5),
                ),
                token.clone(),
                move || {
                    let daemon = Arc::clone(&daemon);
                    async move { daemon.report_containers_global().await }
                },
            ));
        }

        if self.kinds.contains(&ResourceKind::Nodes) {
            let daemon = Arc::clone(self);
            handles.push(crate::scheduler::spawn_timed(
                "api_info.heartbeat".to_string(),
                API_HEARTBEAT_INTERVAL,
                None,
                token,
                move || {
                    let daemon = Arc::clone(&daemon);
                    async move { daemon.send_api_heartbeat().await }
                },
            ));
        }

        handles
    }
}
