//! Persistent volume claim transform. PVC objects are assembled by the
//! node-proxy stats poller; `item` holds the per-volume usage figures.

use serde_json::Value;

use super::{metric_value, K8sObject};
use crate::sinks::zabbix::ZabbixMetric;

pub(super) fn zabbix_metrics(obj: &K8sObject, host: &str) -> Vec<ZabbixMetric> {
    let namespace = obj.namespace.as_deref().unwrap_or_default();
    obj.raw["item"]
        .as_object()
        .map(|item| {
            item.iter()
                .map(|(key, value)| {
                    ZabbixMetric::new(
                        host,
                        format!(
                            "check_kubernetesd[get,pvc,{},{},{}]",
                            namespace, obj.name, key
                        ),
                        metric_value(value),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Builds the raw PVC object for one volume entry of the node stats summary.
///
/// The volume's bookkeeping fields are dropped, the node name and usage
/// percentages are added.
pub fn raw_from_volume(node: &str, volume: &Value) -> Option<Value> {
    let pvc_ref = volume.get("pvcRef")?;
    let name = pvc_ref["name"].as_str()?;
    let namespace = pvc_ref["namespace"].as_str()?;

    let mut item = volume.as_object()?.clone();
    for dropped in ["name", "pvcRef", "time", "availableBytes", "inodesFree"] {
        item.remove(dropped);
    }
    item.insert("nodename".to_string(), Value::String(node.to_string()));

    if let (Some(used), Some(capacity)) = (
        volume["usedBytes"].as_f64(),
        volume["capacityBytes"].as_f64(),
    ) {
        if capacity > 0.0 {
            item.insert(
                "usedBytesPercentage".to_string(),
                serde_json::json!(used / capacity * 100.0),
            );
        }
    }
    if let (Some(used), Some(total)) = (volume["inodesUsed"].as_f64(), volume["inodes"].as_f64()) {
        if total > 0.0 {
            item.insert(
                "inodesUsedPercentage".to_string(),
                serde_json::json!(used / total * 100.0),
            );
        }
    }

    Some(serde_json::json!({
        "metadata": {"name": name, "namespace": namespace},
        "item": item,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::ResourceKind;
    use serde_json::json;

    fn volume() -> Value {
        json!({
            "name": "data",
            "pvcRef": {"name": "data-db-0", "namespace": "db"},
            "time": "2024-01-01T00:00:00Z",
            "usedBytes": 500,
            "capacityBytes": 1000,
            "availableBytes": 500,
            "inodes": 200,
            "inodesUsed": 50,
            "inodesFree": 150,
        })
    }

    #[test]
    fn test_raw_from_volume() {
        let raw = raw_from_volume("node-1", &volume()).unwrap();
        assert_eq!(raw["metadata"]["name"], json!("data-db-0"));
        assert_eq!(raw["metadata"]["namespace"], json!("db"));

        let item = raw["item"].as_object().unwrap();
        assert_eq!(item["nodename"], json!("node-1"));
        assert_eq!(item["usedBytesPercentage"], json!(50.0));
        assert_eq!(item["inodesUsedPercentage"], json!(25.0));
        assert!(!item.contains_key("pvcRef"));
        assert!(!item.contains_key("availableBytes"));
        assert!(!item.contains_key("inodesFree"));
        assert!(!item.contains_key("time"));
    }

    #[test]
    fn test_volume_without_claim_is_ignored() {
        assert!(raw_from_volume("node-1", &json!({"name": "scratch"})).is_none());
    }

    #[test]
    fn test_pvc_metrics_one_item_per_key() {
        let raw = raw_from_volume("node-1", &volume()).unwrap();
        let obj = K8sObject::from_raw(ResourceKind::Pvcs, raw).unwrap();
        let metrics = obj.zabbix_metrics("zbx");

        let used = metrics
            .iter()
            .find(|m| m.key == "check_kubernetesd[get,pvc,db,data-db-0,usedBytes]")
            .unwrap();
        assert_eq!(used.value, "500");
        assert!(metrics
            .iter()
            .any(|m| m.key == "check_kubernetesd[get,pvc,db,data-db-0,nodename]"));
        // dropped keys emit nothing
        assert!(!metrics.iter().any(|m| m.key.contains("pvcRef")));
    }
}
