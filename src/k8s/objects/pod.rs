//! Pod transform: container multiset, per-container status counters and the
//! base name used to group pods of one workload.
//!
//! Pods emit no data items of their own; their counters feed the containers
//! rollup.

use serde_json::{json, Map, Value};

use super::container::ContainerStat;
use super::K8sObject;

/// Container names from the pod spec, in spec order.
fn spec_container_names(obj: &K8sObject) -> Vec<String> {
    obj.raw
        .pointer("/spec/containers")
        .and_then(Value::as_array)
        .map(|containers| {
            containers
                .iter()
                .filter_map(|c| c["name"].as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// The first container name appearing as a substring of the pod name; the
/// pod name itself otherwise. Groups replicated pods under one identity.
pub fn base_name(obj: &K8sObject) -> String {
    spec_container_names(obj)
        .into_iter()
        .find(|name| obj.name.contains(name.as_str()))
        .unwrap_or_else(|| obj.name.clone())
}

/// Counters for each entry of `status.containerStatuses`.
pub fn container_stats(obj: &K8sObject) -> Vec<(String, ContainerStat)> {
    obj.raw
        .pointer("/status/containerStatuses")
        .and_then(Value::as_array)
        .map(|statuses| {
            statuses
                .iter()
                .filter_map(|cs| {
                    let name = cs["name"].as_str()?;
                    Some((name.to_string(), ContainerStat::from_status(cs)))
                })
                .collect()
        })
        .unwrap_or_default()
}

pub(super) fn extend_canonical(obj: &K8sObject, data: &mut Map<String, Value>) {
    let mut containers = Map::new();
    for name in spec_container_names(obj) {
        let count = containers.get(&name).and_then(Value::as_i64).unwrap_or(0);
        containers.insert(name, json!(count + 1));
    }
    data.insert("containers".to_string(), Value::Object(containers));
    data.insert("base_name".to_string(), json!(base_name(obj)));

    let mut container_status = Map::new();
    let mut ready = true;
    for (name, stat) in container_stats(obj) {
        if stat.has_error() {
            ready = false;
        }
        container_status.insert(name, json!(stat));
    }
    data.insert("container_status".to_string(), Value::Object(container_status));
    data.insert("ready".to_string(), json!(ready));
}

pub(super) fn discovery_tuples(obj: &K8sObject) -> Vec<Value> {
    let mut seen: Vec<String> = Vec::new();
    let mut tuples = Vec::new();
    for name in spec_container_names(obj) {
        if seen.contains(&name) {
            continue;
        }
        let mut tuple = obj.base_discovery_tuple();
        if let Some(map) = tuple.as_object_mut() {
            map.insert("{#CONTAINER}".to_string(), json!(name));
        }
        tuples.push(tuple);
        seen.push(name);
    }
    tuples
}
