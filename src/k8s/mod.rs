//! Kubernetes-facing layer: the closed kind enumeration, cluster client
//! bootstrap, resource stores, per-kind transforms and the watcher engine.

pub mod client;
pub mod objects;
pub mod store;
pub mod watch;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The closed set of resource kinds this agent observes.
///
/// `Containers` is derived from pod data by the scheduler and never received
/// from the cluster; `Tls` is backed by cluster secrets carrying a TLS
/// certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Nodes,
    Components,
    Services,
    Deployments,
    Statefulsets,
    Daemonsets,
    Pods,
    Containers,
    Ingresses,
    Tls,
    Pvcs,
}

/// Refresh cadence group: rarely-changing kinds run on the slow
/// discovery/resend intervals, everything else on the fast ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Fast,
    Slow,
}

impl ResourceKind {
    /// Every kind the agent can be configured to observe, in a stable order.
    pub const ALL: [ResourceKind; 11] = [
        ResourceKind::Nodes,
        ResourceKind::Components,
        ResourceKind::Services,
        ResourceKind::Deployments,
        ResourceKind::Statefulsets,
        ResourceKind::Daemonsets,
        ResourceKind::Pods,
        ResourceKind::Containers,
        ResourceKind::Ingresses,
        ResourceKind::Tls,
        ResourceKind::Pvcs,
    ];

    /// Plural identifier as it appears in configuration and Zabbix item keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Nodes => "nodes",
            ResourceKind::Components => "components",
            ResourceKind::Services => "services",
            ResourceKind::Deployments => "deployments",
            ResourceKind::Statefulsets => "statefulsets",
            ResourceKind::Daemonsets => "daemonsets",
            ResourceKind::Pods => "pods",
            ResourceKind::Containers => "containers",
            ResourceKind::Ingresses => "ingresses",
            ResourceKind::Tls => "tls",
            ResourceKind::Pvcs => "pvcs",
        }
    }

    /// Singular identifier, used as the UID class tag and web API path element.
    pub fn singular(&self) -> &'static str {
        match self {
            ResourceKind::Nodes => "node",
            ResourceKind::Components => "component",
            ResourceKind::Services => "service",
            ResourceKind::Deployments => "deployment",
            ResourceKind::Statefulsets => "statefulset",
            ResourceKind::Daemonsets => "daemonset",
            ResourceKind::Pods => "pod",
            ResourceKind::Containers => "container",
            ResourceKind::Ingresses => "ingress",
            ResourceKind::Tls => "tls",
            ResourceKind::Pvcs => "pvc",
        }
    }

    /// Cluster-scoped kinds carry no namespace.
    pub fn is_cluster_scoped(&self) -> bool {
        matches!(self, ResourceKind::Nodes | ResourceKind::Components)
    }

    /// Kinds served by a streaming watch. Components can only be listed,
    /// pvcs come from the node-proxy stats summary and containers are
    /// derived, so none of the three has a watch endpoint.
    pub fn is_watchable(&self) -> bool {
        !matches!(
            self,
            ResourceKind::Components | ResourceKind::Containers | ResourceKind::Pvcs
        )
    }

    pub fn cadence(&self) -> Cadence {
        match self {
            ResourceKind::Tls | ResourceKind::Ingresses => Cadence::Slow,
            _ => Cadence::Fast,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown resource kind '{s}'"))
    }
}
