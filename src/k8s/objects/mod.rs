//! Per-kind object model: canonical records, content checksums, Zabbix
//! metric tuples and low-level discovery tuples.
//!
//! `raw` keeps the field names exactly as the cluster API emits them; the
//! canonical record carries the agent's outward names.

pub mod component;
pub mod container;
pub mod deployment;
pub mod node;
pub mod pod;
pub mod pvc;
pub mod service;
pub mod tls;

use std::time::Instant;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

use crate::errors::{K8sError, K8sResult};
use crate::k8s::ResourceKind;
use crate::sinks::zabbix::ZabbixMetric;

/// Sentinel for "never sent to this sink".
pub const NEVER_SENT: DateTime<Utc> = DateTime::UNIX_EPOCH;

/// Maximum length of a `{#SLUG}` discovery macro.
pub const SLUG_MAX_LEN: usize = 40;

/// Per-sink send bookkeeping, preserved across object replacement.
///
/// Wall-clock timestamps drive resend decisions and operator dumps; the
/// monotonic instants drive the rate-limit comparison.
#[derive(Debug, Clone)]
pub struct SendState {
    pub last_sent_zabbix: DateTime<Utc>,
    pub last_sent_web: DateTime<Utc>,
    pub last_sent_zabbix_discovery: DateTime<Utc>,
    pub is_dirty_zabbix: bool,
    pub is_dirty_web: bool,
    pub sent_zabbix_at: Option<Instant>,
    pub sent_web_at: Option<Instant>,
}

impl Default for SendState {
    fn default() -> Self {
        Self {
            last_sent_zabbix: NEVER_SENT,
            last_sent_web: NEVER_SENT,
            last_sent_zabbix_discovery: NEVER_SENT,
            is_dirty_zabbix: true,
            is_dirty_web: true,
            sent_zabbix_at: None,
            sent_web_at: None,
        }
    }
}

impl SendState {
    pub fn is_unsubmitted_web(&self) -> bool {
        self.last_sent_web == NEVER_SENT
    }

    pub fn is_unsubmitted_zabbix(&self) -> bool {
        self.last_sent_zabbix == NEVER_SENT
    }

    /// Carries the send history of a replaced object into its successor and
    /// marks both sinks dirty.
    pub fn inherit(&mut self, previous: &SendState) {
        self.last_sent_zabbix = previous.last_sent_zabbix;
        self.last_sent_web = previous.last_sent_web;
        self.last_sent_zabbix_discovery = previous.last_sent_zabbix_discovery;
        self.sent_zabbix_at = previous.sent_zabbix_at;
        self.sent_web_at = previous.sent_web_at;
        self.is_dirty_zabbix = true;
        self.is_dirty_web = true;
    }
}

/// One live cluster object, as held in a resource store.
#[derive(Debug, Clone)]
pub struct K8sObject {
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: Option<String>,
    pub raw: Value,
    pub checksum: String,
    pub state: SendState,
}

impl K8sObject {
    /// Builds an object from a raw cluster payload. Fails when the metadata
    /// misses a required field; the caller logs and skips the event.
    pub fn from_raw(kind: ResourceKind, raw: Value) -> K8sResult<Self> {
        let name = raw
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or_else(|| K8sError::malformed(kind, "missing metadata.name"))?
            .to_string();

        let namespace = if kind.is_cluster_scoped() {
            None
        } else {
            Some(
                raw.pointer("/metadata/namespace")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        K8sError::malformed(kind, format!("missing metadata.namespace for {name}"))
                    })?
                    .to_string(),
            )
        };

        let checksum = checksum_of(&raw);
        Ok(Self {
            kind,
            name,
            namespace,
            raw,
            checksum,
            state: SendState::default(),
        })
    }

    /// Stable identity within the kind's store.
    pub fn uid(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}_{}_{}", self.kind.singular(), ns, self.name),
            None => format!("{}_{}", self.kind.singular(), self.name),
        }
    }

    pub fn slug(&self) -> String {
        slugit(self.namespace.as_deref(), &self.name, SLUG_MAX_LEN)
    }

    /// Canonical data record: derived fields keyed by the agent's outward
    /// names, also the web API payload body.
    pub fn canonical(&self) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("name".to_string(), json!(self.name));
        data.insert("name_space".to_string(), json!(self.namespace));

        match self.kind {
            ResourceKind::Nodes => node::extend_canonical(self, &mut data),
            ResourceKind::Pods => pod::extend_canonical(self, &mut data),
            ResourceKind::Deployments => deployment::extend_canonical(self, &mut data),
            ResourceKind::Services => service::extend_canonical(self, &mut data),
            ResourceKind::Components => component::extend_canonical(self, &mut data),
            ResourceKind::Tls => tls::extend_canonical(self, &mut data),
            // identity only: statefulsets, daemonsets, ingresses, pvcs,
            // containers (derived)
            _ => {}
        }
        data
    }

    /// Zabbix item tuples for this object. Pods feed the containers rollup
    /// instead, services only the global count.
    pub fn zabbix_metrics(&self, host: &str) -> Vec<ZabbixMetric> {
        match self.kind {
            ResourceKind::Nodes => node::zabbix_metrics(self, host),
            ResourceKind::Deployments => deployment::zabbix_metrics(self, host),
            ResourceKind::Components => component::zabbix_metrics(self, host),
            ResourceKind::Tls => tls::zabbix_metrics(self, host),
            ResourceKind::Pvcs => pvc::zabbix_metrics(self, host),
            _ => Vec::new(),
        }
    }

    /// Low-level discovery tuples for this object.
    pub fn discovery_tuples(&self) -> Vec<Value> {
        match self.kind {
            ResourceKind::Pods => pod::discovery_tuples(self),
            ResourceKind::Tls => tls::discovery_tuples(self),
            _ => vec![self.base_discovery_tuple()],
        }
    }

    pub(crate) fn base_discovery_tuple(&self) -> Value {
        json!({
            "{#NAME}": self.name,
            "{#NAMESPACE}": self.namespace,
            "{#SLUG}": self.slug(),
        })
    }
}

/// Normalizes cluster quantity values: `null` becomes 0, `<n>Ki` the byte
/// count, `<n>m` the fractional core count; anything else passes through.
pub fn transform_value(value: &Value) -> Value {
    static KI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)Ki$").unwrap());
    static MILLI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)m$").unwrap());

    match value {
        Value::Null => json!(0),
        Value::String(s) => {
            if let Some(caps) = KI_RE.captures(s) {
                if let Ok(n) = caps[1].parse::<i64>() {
                    return json!(n * 1024);
                }
            }
            if let Some(caps) = MILLI_RE.captures(s) {
                if let Ok(n) = caps[1].parse::<f64>() {
                    return json!(n / 1000.0);
                }
            }
            value.clone()
        }
        _ => value.clone(),
    }
}

/// `namespace/name`, middle-truncated with `~` when longer than `maxlen`.
pub fn slugit(namespace: Option<&str>, name: &str, maxlen: usize) -> String {
    let slug = match namespace {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    };
    if slug.len() <= maxlen {
        return slug;
    }

    let prefix_len = maxlen / 2 - 1;
    let suffix_len = maxlen - prefix_len - 1;
    format!(
        "{}~{}",
        &slug[..prefix_len],
        &slug[slug.len() - suffix_len..]
    )
}

/// MD5 hex over the raw tree serialized with recursively sorted keys.
/// Timestamps are ISO-8601 strings in the API JSON already.
pub fn checksum_of(raw: &Value) -> String {
    let mut buf = String::new();
    write_canonical_json(raw, &mut buf);
    let digest = Md5::digest(buf.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn write_canonical_json(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical_json(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical_json(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Renders a derived value as the string sent to Zabbix.
pub fn metric_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Converts an API camelCase field name to the agent's snake_case outward
/// spelling (`availableReplicas` -> `available_replicas`).
pub fn snake_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}
