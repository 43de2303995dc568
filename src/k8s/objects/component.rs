//! Component status transform: Healthy conditions of the control plane
//! components.

use serde_json::{json, Map, Value};

use super::K8sObject;
use crate::sinks::zabbix::ZabbixMetric;

fn failed_conditions(obj: &K8sObject) -> Vec<String> {
    obj.raw["conditions"]
        .as_array()
        .map(|conditions| {
            conditions
                .iter()
                .filter(|cond| {
                    cond["type"]
                        .as_str()
                        .is_some_and(|t| t.eq_ignore_ascii_case("healthy"))
                        && cond["status"].as_str() != Some("True")
                })
                .filter_map(|cond| cond["type"].as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub(super) fn extend_canonical(obj: &K8sObject, data: &mut Map<String, Value>) {
    let failed = failed_conditions(obj);
    let healthy = if failed.is_empty() {
        "OK".to_string()
    } else {
        format!("ERROR: {}", failed.join(","))
    };
    data.insert("failed_conds".to_string(), json!(failed));
    data.insert("healthy".to_string(), json!(healthy));
}

pub(super) fn zabbix_metrics(obj: &K8sObject, host: &str) -> Vec<ZabbixMetric> {
    let data = obj.canonical();
    vec![ZabbixMetric::new(
        host,
        format!(
            "check_kubernetesd[get,components,{},available_status]",
            obj.name
        ),
        data["healthy"].as_str().unwrap_or("OK").to_string(),
    )]
}
