//! Service transform. Individual services emit no items; `is_ingress` feeds
//! the per-cluster service counts.

use serde_json::{json, Map, Value};

use super::K8sObject;

pub(super) fn extend_canonical(obj: &K8sObject, data: &mut Map<String, Value>) {
    let is_ingress = !obj.raw
        .pointer("/status/loadBalancer/ingress")
        .unwrap_or(&Value::Null)
        .is_null();
    data.insert("is_ingress".to_string(), json!(is_ingress));
}

/// Whether this service is exposed through a load balancer.
pub fn is_ingress(obj: &K8sObject) -> bool {
    obj.canonical()["is_ingress"] == json!(true)
}
