//! Node transform: readiness conditions and capacity values.

use serde_json::{json, Map, Value};

use super::{metric_value, transform_value, K8sObject};
use crate::sinks::zabbix::ZabbixMetric;

/// Capacity values monitored per node, looked up by dotted path in `status`.
pub const MONITOR_VALUES: [&str; 8] = [
    "allocatable.cpu",
    "allocatable.ephemeral-storage",
    "allocatable.memory",
    "allocatable.pods",
    "capacity.cpu",
    "capacity.ephemeral-storage",
    "capacity.memory",
    "capacity.pods",
];

fn lookup(status: &Value, dotted: &str) -> Value {
    let mut current = status;
    for part in dotted.split('.') {
        current = &current[part];
    }
    current.clone()
}

pub(super) fn extend_canonical(obj: &K8sObject, data: &mut Map<String, Value>) {
    let mut condition_ready = false;
    let mut failed_conds: Vec<String> = Vec::new();

    if let Some(conditions) = obj.raw.pointer("/status/conditions").and_then(Value::as_array) {
        for cond in conditions {
            let cond_type = cond["type"].as_str().unwrap_or_default();
            let status = cond["status"].as_str().unwrap_or_default();
            if cond_type.eq_ignore_ascii_case("ready") {
                if status == "True" {
                    condition_ready = true;
                }
            } else if status == "True" {
                failed_conds.push(cond_type.to_string());
            }
        }
    }

    data.insert("condition_ready".to_string(), json!(condition_ready));
    data.insert("failed_conds".to_string(), json!(failed_conds));

    let status = &obj.raw["status"];
    for monitor_value in MONITOR_VALUES {
        data.insert(
            monitor_value.to_string(),
            transform_value(&lookup(status, monitor_value)),
        );
    }
}

pub(super) fn zabbix_metrics(obj: &K8sObject, host: &str) -> Vec<ZabbixMetric> {
    let data = obj.canonical();
    let mut out = Vec::new();

    let available = if data["condition_ready"] == json!(true) {
        "OK".to_string()
    } else {
        "not available".to_string()
    };
    out.push(ZabbixMetric::new(
        host,
        format!("check_kubernetesd[get,nodes,{},available_status]", obj.name),
        available,
    ));

    let failed: Vec<&str> = data["failed_conds"]
        .as_array()
        .map(|conds| conds.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    out.push(ZabbixMetric::new(
        host,
        format!(
            "check_kubernetesd[get,nodes,{},condition_status_failed]",
            obj.name
        ),
        if failed.is_empty() {
            "OK".to_string()
        } else {
            failed.join(",")
        },
    ));

    for monitor_value in MONITOR_VALUES {
        out.push(ZabbixMetric::new(
            host,
            format!(
                "check_kubernetesd[get,nodes,{},{}]",
                obj.name, monitor_value
            ),
            metric_value(&data[monitor_value]),
        ));
    }
    out
}
