//! Per-kind in-memory store, keyed by the stable object UID.
//!
//! The store carries no lock of its own; the coordinator serializes every
//! access.

use std::collections::HashMap;

use serde_json::Value;

use crate::errors::K8sResult;
use crate::k8s::objects::K8sObject;
use crate::k8s::ResourceKind;

/// How an `add` changed the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectChange {
    /// First sighting of this UID.
    New,
    /// Same UID, different content checksum; send state was inherited and
    /// both dirty flags set.
    Updated,
    /// Same UID, same checksum; the store kept the existing entry.
    Unchanged,
}

/// Live mirror of one resource kind.
#[derive(Debug)]
pub struct ResourceStore {
    kind: ResourceKind,
    objects: HashMap<String, K8sObject>,
}

impl ResourceStore {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            objects: HashMap::new(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Inserts or replaces the object described by `raw`.
    ///
    /// A replace copies the displaced entry's send timestamps into the new
    /// object and marks both sinks dirty; an unchanged checksum leaves the
    /// store untouched.
    pub fn add(&mut self, raw: Value) -> K8sResult<(String, ObjectChange)> {
        let mut incoming = K8sObject::from_raw(self.kind, raw)?;
        let uid = incoming.uid();

        let change = match self.objects.get(&uid) {
            None => {
                self.objects.insert(uid.clone(), incoming);
                ObjectChange::New
            }
            Some(existing) if existing.checksum == incoming.checksum => ObjectChange::Unchanged,
            Some(existing) => {
                incoming.state.inherit(&existing.state);
                self.objects.insert(uid.clone(), incoming);
                ObjectChange::Updated
            }
        };
        Ok((uid, change))
    }

    /// Removes the object described by `raw`, returning it if it was known.
    pub fn delete(&mut self, raw: Value) -> K8sResult<Option<K8sObject>> {
        let incoming = K8sObject::from_raw(self.kind, raw)?;
        Ok(self.objects.remove(&incoming.uid()))
    }

    pub fn get(&self, uid: &str) -> Option<&K8sObject> {
        self.objects.get(uid)
    }

    pub fn get_mut(&mut self, uid: &str) -> Option<&mut K8sObject> {
        self.objects.get_mut(uid)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Read-only pass over all live objects.
    pub fn snapshot(&self) -> impl Iterator<Item = &K8sObject> {
        self.objects.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut K8sObject)> {
        self.objects.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn pod_raw(name: &str, phase: &str) -> Value {
        json!({
            "metadata": {"name": name, "namespace": "ns"},
            "status": {"phase": phase},
        })
    }

    #[test]
    fn test_add_classifies_new_then_unchanged() {
        let mut store = ResourceStore::new(ResourceKind::Pods);

        let (uid, change) = store.add(pod_raw("web-1", "Running")).unwrap();
        assert_eq!(change, ObjectChange::New);
        assert_eq!(uid, "pod_ns_web-1");
        assert_eq!(store.len(), 1);

        // identical payloads leave the store alone, repeatedly
        for _ in 0..3 {
            let (_, change) = store.add(pod_raw("web-1", "Running")).unwrap();
            assert_eq!(change, ObjectChange::Unchanged);
            assert_eq!(store.len(), 1);
        }
    }

    #[test]
    fn test_update_inherits_send_state_and_marks_dirty() {
        let mut store = ResourceStore::new(ResourceKind::Pods);
        let (uid, _) = store.add(pod_raw("web-1", "Pending")).unwrap();

        let sent_at = Utc::now();
        {
            let obj = store.get_mut(&uid).unwrap();
            obj.state.last_sent_zabbix = sent_at;
            obj.state.last_sent_web = sent_at;
            obj.state.is_dirty_zabbix = false;
            obj.state.is_dirty_web = false;
        }

        let (_, change) = store.add(pod_raw("web-1", "Running")).unwrap();
        assert_eq!(change, ObjectChange::Updated);

        let obj = store.get(&uid).unwrap();
        assert_eq!(obj.state.last_sent_zabbix, sent_at);
        assert_eq!(obj.state.last_sent_web, sent_at);
        assert!(obj.state.is_dirty_zabbix);
        assert!(obj.state.is_dirty_web);
        assert_eq!(obj.raw["status"]["phase"], json!("Running"));
    }

    #[test]
    fn test_checksum_matches_content() {
        let mut store = ResourceStore::new(ResourceKind::Pods);
        let (uid, _) = store.add(pod_raw("web-1", "Running")).unwrap();
        let obj = store.get(&uid).unwrap();
        assert_eq!(obj.checksum, crate::k8s::objects::checksum_of(&obj.raw));
    }

    #[test]
    fn test_delete_returns_removed_object() {
        let mut store = ResourceStore::new(ResourceKind::Pods);
        store.add(pod_raw("web-1", "Running")).unwrap();

        let removed = store.delete(pod_raw("web-1", "Running")).unwrap();
        assert_eq!(removed.unwrap().name, "web-1");
        assert!(store.is_empty());

        // deleting an unknown object is not an error
        let removed = store.delete(pod_raw("web-1", "Running")).unwrap();
        assert!(removed.is_none());
    }

    #[test]
    fn test_malformed_raw_is_rejected() {
        let mut store = ResourceStore::new(ResourceKind::Pods);
        assert!(store.add(json!({"metadata": {}})).is_err());
        assert!(store.is_empty());
    }
}
