//! Per-container status counters and the rollup metric tuples emitted under
//! the derived `containers` kind.

use serde::Serialize;
use serde_json::Value;

use crate::sinks::zabbix::ZabbixMetric;

/// Counters tracked for one container, summable across the pods that run it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerStat {
    pub restart_count: i64,
    pub ready: i64,
    pub not_ready: i64,
    pub status: String,
}

impl ContainerStat {
    /// Derives the counters from one `status.containerStatuses` entry.
    ///
    /// A state entry other than `running` with a non-empty value marks the
    /// container as errored.
    pub fn from_status(container_status: &Value) -> Self {
        let restart_count = container_status["restartCount"].as_i64().unwrap_or(0);
        let is_ready = container_status["ready"].as_bool().unwrap_or(false);

        let mut error_states: Vec<&str> = Vec::new();
        if let Some(states) = container_status["state"].as_object() {
            for (state, detail) in states {
                if state != "running" && is_truthy(detail) {
                    error_states.push(state);
                }
            }
        }

        let status = if error_states.is_empty() {
            "OK".to_string()
        } else {
            format!("ERROR: {}", error_states.join(","))
        };

        Self {
            restart_count,
            ready: i64::from(is_ready),
            not_ready: i64::from(!is_ready),
            status,
        }
    }

    /// Folds another pod's counters for the same container into this one.
    /// Integer counters are summed; an error status wins over OK.
    pub fn merge(&mut self, other: &ContainerStat) {
        self.restart_count += other.restart_count;
        self.ready += other.ready;
        self.not_ready += other.not_ready;
        if other.status.starts_with("ERROR") {
            self.status = other.status.clone();
        }
    }

    pub fn has_error(&self) -> bool {
        self.status.starts_with("ERROR")
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        _ => true,
    }
}

/// The four rollup items for one (namespace, pod base name, container) group.
pub fn zabbix_metrics(
    host: &str,
    namespace: &str,
    pod_base_name: &str,
    container_name: &str,
    stat: &ContainerStat,
) -> Vec<ZabbixMetric> {
    let item = |field: &str, value: String| {
        ZabbixMetric::new(
            host,
            format!(
                "check_kubernetesd[get,containers,{namespace},{pod_base_name},{container_name},{field}]"
            ),
            value,
        )
    };

    vec![
        item("ready", stat.ready.to_string()),
        item("not_ready", stat.not_ready.to_string()),
        item("restart_count", stat.restart_count.to_string()),
        item("status", stat.status.clone()),
    ]
}
