//! Deployment transform: status counters plus the Available condition.

use serde_json::{json, Map, Value};

use super::{metric_value, snake_key, transform_value, K8sObject};
use crate::sinks::zabbix::ZabbixMetric;

/// Types of `Available` conditions whose status is not `True`.
fn failed_conditions(obj: &K8sObject) -> Vec<String> {
    obj.raw
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .map(|conditions| {
            conditions
                .iter()
                .filter(|cond| {
                    cond["type"]
                        .as_str()
                        .is_some_and(|t| t.eq_ignore_ascii_case("available"))
                        && cond["status"].as_str() != Some("True")
                })
                .filter_map(|cond| cond["type"].as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn availability(failed: &[String]) -> String {
    if failed.is_empty() {
        "OK".to_string()
    } else {
        format!("ERROR: {}", failed.join(","))
    }
}

pub(super) fn extend_canonical(obj: &K8sObject, data: &mut Map<String, Value>) {
    if let Some(status) = obj.raw["status"].as_object() {
        for (key, value) in status {
            if key == "conditions" {
                continue;
            }
            data.insert(snake_key(key), transform_value(value));
        }
    }

    let failed = failed_conditions(obj);
    data.insert("status".to_string(), json!(availability(&failed)));
    data.insert("failed_conds".to_string(), json!(failed));
}

pub(super) fn zabbix_metrics(obj: &K8sObject, host: &str) -> Vec<ZabbixMetric> {
    let namespace = obj.namespace.as_deref().unwrap_or_default();
    let mut out = Vec::new();

    if let Some(status) = obj.raw["status"].as_object() {
        for (key, value) in status {
            if key == "conditions" {
                continue;
            }
            out.push(ZabbixMetric::new(
                host,
                format!(
                    "check_kubernetesd[get,deployments,{},{},{}]",
                    namespace,
                    obj.name,
                    snake_key(key)
                ),
                metric_value(&transform_value(value)),
            ));
        }
    }

    out.push(ZabbixMetric::new(
        host,
        format!(
            "check_kubernetesd[get,deployments,{},{},available_status]",
            namespace, obj.name
        ),
        availability(&failed_conditions(obj)),
    ));
    out
}
