//! End-to-end pipeline tests: watch events are dispatched straight into the
//! coordinator and the resulting trapper traffic is captured by a fake
//! Zabbix server.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use k8s_zabbix::config::AgentConfig;
use k8s_zabbix::daemon::Daemon;
use k8s_zabbix::k8s::ResourceKind;

/// Minimal trapper endpoint: records every sender-data request body and
/// acknowledges all items.
struct FakeZabbix {
    port: u16,
    received: Arc<Mutex<Vec<Value>>>,
    server: tokio::task::JoinHandle<()>,
}

impl FakeZabbix {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));

        let sink = received.clone();
        let server = tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let mut header = [0u8; 13];
                if socket.read_exact(&mut header).await.is_err() {
                    continue;
                }
                let len = u64::from_le_bytes(header[5..13].try_into().unwrap());
                let mut body = vec![0u8; len as usize];
                if socket.read_exact(&mut body).await.is_err() {
                    continue;
                }
                let request: Value = serde_json::from_slice(&body).unwrap();
                let total = request["data"].as_array().map(Vec::len).unwrap_or(0);
                sink.lock().await.push(request);

                let info = format!(
                    r#"{{"response":"success","info":"processed: {total}; failed: 0; total: {total}; seconds spent: 0.000042"}}"#
                );
                let mut response = Vec::new();
                response.extend_from_slice(b"ZBXD\x01");
                response.extend_from_slice(&(info.len() as u64).to_le_bytes());
                response.extend_from_slice(info.as_bytes());
                let _ = socket.write_all(&response).await;
            }
        });

        Self {
            port,
            received,
            server,
        }
    }

    async fn requests(&self) -> Vec<Value> {
        self.received.lock().await.clone()
    }

    /// Flattens every recorded request into (key, value) items.
    async fn items(&self) -> Vec<(String, String)> {
        self.requests()
            .await
            .iter()
            .flat_map(|req| req["data"].as_array().cloned().unwrap_or_default())
            .map(|item| {
                (
                    item["key"].as_str().unwrap_or_default().to_string(),
                    item["value"].as_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }
}

impl Drop for FakeZabbix {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn test_daemon(zabbix: &FakeZabbix) -> Arc<Daemon> {
    let config = AgentConfig {
        zabbix_server: "127.0.0.1".to_string(),
        zabbix_port: zabbix.port,
        zabbix_host: "k8s-agent".to_string(),
        ..Default::default()
    };
    Daemon::new(config)
}

fn node_raw() -> Value {
    json!({
        "metadata": {"name": "n1"},
        "status": {
            "conditions": [{"type": "Ready", "status": "True"}],
            "allocatable": {"cpu": "4", "ephemeral-storage": "0", "memory": "2048Ki", "pods": "110"},
            "capacity": {"cpu": "4", "ephemeral-storage": "0", "memory": "4096Ki", "pods": "110"},
        },
    })
}

fn deployment_raw(available: &str, generation: i64) -> Value {
    json!({
        "metadata": {"name": "app", "namespace": "ns1"},
        "status": {
            "replicas": 3,
            "observedGeneration": generation,
            "conditions": [{"type": "Available", "status": available}],
        },
    })
}

fn pod_raw(name: &str) -> Value {
    json!({
        "metadata": {"name": name, "namespace": "ns"},
        "spec": {"containers": [{"name": "app"}]},
        "status": {"containerStatuses": [
            {"name": "app", "ready": true, "restartCount": 0,
             "state": {"running": {"startedAt": "2024-01-01T00:00:00Z"}}},
        ]},
    })
}

#[tokio::test]
async fn node_ready_announcement() {
    let zabbix = FakeZabbix::start().await;
    let daemon = test_daemon(&zabbix);

    daemon.dispatch_apply(ResourceKind::Nodes, node_raw()).await;

    // no data may leave before the discovery announcement
    daemon.resend_data(ResourceKind::Nodes).await.unwrap();
    assert!(zabbix.requests().await.is_empty());

    daemon.send_discovery(ResourceKind::Nodes).await.unwrap();
    let requests = zabbix.requests().await;
    assert_eq!(requests.len(), 1);
    let discovery = &requests[0]["data"][0];
    assert_eq!(discovery["key"], "check_kubernetesd[discover,nodes]");
    let payload: Value =
        serde_json::from_str(discovery["value"].as_str().unwrap()).unwrap();
    assert_eq!(
        payload,
        json!({"data": [{"{#NAME}": "n1", "{#NAMESPACE}": null, "{#SLUG}": "n1"}]})
    );

    daemon.resend_data(ResourceKind::Nodes).await.unwrap();
    let items = zabbix.items().await;
    assert!(items.contains(&(
        "check_kubernetesd[get,nodes,n1,available_status]".to_string(),
        "OK".to_string()
    )));
    assert!(items.contains(&(
        "check_kubernetesd[get,nodes,n1,capacity.memory]".to_string(),
        "4194304".to_string()
    )));

    // the object is clean now
    let state = daemon.lock_state().await;
    let obj = state.stores[&ResourceKind::Nodes].get("node_n1").unwrap();
    assert!(!obj.state.is_dirty_zabbix);
}

#[tokio::test]
async fn deployment_degradation_is_sent_immediately() {
    let zabbix = FakeZabbix::start().await;
    let daemon = test_daemon(&zabbix);

    daemon
        .dispatch_apply(ResourceKind::Deployments, deployment_raw("True", 1))
        .await;
    daemon
        .send_discovery(ResourceKind::Deployments)
        .await
        .unwrap();

    daemon
        .dispatch_apply(ResourceKind::Deployments, deployment_raw("False", 2))
        .await;

    let items = zabbix.items().await;
    assert!(items.contains(&(
        "check_kubernetesd[get,deployments,ns1,app,available_status]".to_string(),
        "ERROR: Available".to_string()
    )));
}

#[tokio::test]
async fn rate_limit_defers_to_resend_cycle() {
    let zabbix = FakeZabbix::start().await;
    let daemon = test_daemon(&zabbix);

    daemon
        .dispatch_apply(ResourceKind::Deployments, deployment_raw("True", 1))
        .await;
    daemon
        .send_discovery(ResourceKind::Deployments)
        .await
        .unwrap();
    let baseline = zabbix.requests().await.len();

    // first modification sends immediately
    daemon
        .dispatch_apply(ResourceKind::Deployments, deployment_raw("True", 2))
        .await;
    assert_eq!(zabbix.requests().await.len(), baseline + 1);

    // second modification inside the window is deferred, dirty stays set
    daemon
        .dispatch_apply(ResourceKind::Deployments, deployment_raw("True", 3))
        .await;
    assert_eq!(zabbix.requests().await.len(), baseline + 1);
    {
        let state = daemon.lock_state().await;
        let obj = state.stores[&ResourceKind::Deployments]
            .get("deployment_ns1_app")
            .unwrap();
        assert!(obj.state.is_dirty_zabbix);
    }

    // the next resend pass flushes exactly one batch with the object once
    daemon.resend_data(ResourceKind::Deployments).await.unwrap();
    let requests = zabbix.requests().await;
    assert_eq!(requests.len(), baseline + 2);
    let flush = requests.last().unwrap()["data"].as_array().unwrap().clone();
    let status_items: Vec<&Value> = flush
        .iter()
        .filter(|item| {
            item["key"] == "check_kubernetesd[get,deployments,ns1,app,available_status]"
        })
        .collect();
    assert_eq!(status_items.len(), 1);

    let state = daemon.lock_state().await;
    let obj = state.stores[&ResourceKind::Deployments]
        .get("deployment_ns1_app")
        .unwrap();
    assert!(!obj.state.is_dirty_zabbix);
}

#[tokio::test]
async fn container_rollup_aggregates_pods() {
    let zabbix = FakeZabbix::start().await;
    let daemon = test_daemon(&zabbix);

    daemon
        .dispatch_apply(ResourceKind::Pods, pod_raw("app-abc"))
        .await;
    daemon
        .dispatch_apply(ResourceKind::Pods, pod_raw("app-def"))
        .await;

    // first pass materializes the rollup but stays gated on discovery
    daemon.report_containers_global().await.unwrap();
    assert!(zabbix.requests().await.is_empty());

    daemon
        .send_discovery(ResourceKind::Containers)
        .await
        .unwrap();
    daemon.report_containers_global().await.unwrap();

    let items = zabbix.items().await;
    let expect = |field: &str, value: &str| {
        assert!(
            items.contains(&(
                format!("check_kubernetesd[get,containers,ns,app,app,{field}]"),
                value.to_string()
            )),
            "missing containers item {field}={value} in {items:?}"
        );
    };
    expect("ready", "2");
    expect("not_ready", "0");
    expect("restart_count", "0");
    expect("status", "OK");
}

#[tokio::test]
async fn services_global_counts() {
    let zabbix = FakeZabbix::start().await;
    let daemon = test_daemon(&zabbix);

    let service = |name: &str, ingress: Value| {
        json!({
            "metadata": {"name": name, "namespace": "ns"},
            "status": {"loadBalancer": {"ingress": ingress}},
        })
    };
    daemon
        .dispatch_apply(ResourceKind::Services, service("a", json!([{"ip": "1.2.3.4"}])))
        .await;
    daemon
        .dispatch_apply(ResourceKind::Services, service("b", Value::Null))
        .await;

    daemon.send_discovery(ResourceKind::Services).await.unwrap();
    daemon.report_services_global().await.unwrap();

    let items = zabbix.items().await;
    assert!(items.contains(&(
        "check_kubernetes[get,services,num_services]".to_string(),
        "2".to_string()
    )));
    assert!(items.contains(&(
        "check_kubernetes[get,services,num_ingress_services]".to_string(),
        "1".to_string()
    )));
}

#[tokio::test]
async fn secret_without_certificate_announces_nothing() {
    let zabbix = FakeZabbix::start().await;
    let daemon = test_daemon(&zabbix);

    daemon
        .dispatch_apply(
            ResourceKind::Tls,
            json!({
                "metadata": {"name": "opaque", "namespace": "ns"},
                "data": {"password": "aHVudGVyMg=="},
            }),
        )
        .await;

    daemon.send_discovery(ResourceKind::Tls).await.unwrap();
    assert!(zabbix.requests().await.is_empty());
}

#[tokio::test]
async fn deleted_objects_leave_the_store() {
    let zabbix = FakeZabbix::start().await;
    let daemon = test_daemon(&zabbix);

    daemon
        .dispatch_apply(ResourceKind::Deployments, deployment_raw("True", 1))
        .await;
    daemon
        .dispatch_delete(ResourceKind::Deployments, deployment_raw("True", 1))
        .await;

    let state = daemon.lock_state().await;
    assert!(state.stores[&ResourceKind::Deployments].is_empty());
    // deletions are not propagated to zabbix
    drop(state);
    assert!(zabbix.requests().await.is_empty());
}

#[tokio::test]
async fn repeated_events_are_idempotent() {
    let zabbix = FakeZabbix::start().await;
    let daemon = test_daemon(&zabbix);

    daemon.dispatch_apply(ResourceKind::Nodes, node_raw()).await;
    daemon.dispatch_apply(ResourceKind::Nodes, node_raw()).await;

    {
        let state = daemon.lock_state().await;
        assert_eq!(state.stores[&ResourceKind::Nodes].len(), 1);
    }

    daemon.send_discovery(ResourceKind::Nodes).await.unwrap();
    daemon.send_discovery(ResourceKind::Nodes).await.unwrap();
    let requests = zabbix.requests().await;
    // both passes announce the same single tuple
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0]["data"], requests[1]["data"]);
}

#[tokio::test]
async fn failed_web_submission_rearms_dirty_flag() {
    // web API that answers HEAD with 200 and everything else with 500
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let web = tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buffer = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    let Ok(n) = socket.read(&mut chunk).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    buffer.extend_from_slice(&chunk[..n]);
                    if buffer.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let status = if buffer.starts_with(b"HEAD") {
                    "HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                } else {
                    "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                };
                let _ = socket.write_all(status.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    let zabbix = FakeZabbix::start().await;
    let config = AgentConfig {
        zabbix_server: "127.0.0.1".to_string(),
        zabbix_port: zabbix.port,
        web_api_enable: true,
        web_api_host: format!("http://{addr}/"),
        web_api_cluster: "c1".to_string(),
        ..Default::default()
    };
    let daemon = Daemon::new(config);

    daemon
        .dispatch_apply(ResourceKind::Pods, pod_raw("app-abc"))
        .await;

    let state = daemon.lock_state().await;
    let obj = state.stores[&ResourceKind::Pods].get("pod_ns_app-abc").unwrap();
    assert!(obj.state.is_dirty_web, "failed POST must re-arm the dirty flag");
    web.abort();
}
