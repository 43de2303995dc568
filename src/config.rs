//! Agent configuration.
//!
//! Values come from an INI file (path given on the command line) and are
//! overridden by environment variables carrying the upper-cased field name,
//! e.g. `ZABBIX_SERVER` overrides `zabbix_server`.

use std::time::Duration;

use config::{Environment, File, FileFormat};
use serde::{Deserialize, Deserializer};

use crate::errors::{ConfigError, ConfigResult};
use crate::k8s::{Cadence, ResourceKind};

/// How the agent reaches the cluster API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterAccessKind {
    Incluster,
    Kubeconfig,
    Token,
}

/// Centralized configuration for the monitoring agent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub k8s_config_type: ClusterAccessKind,
    pub k8s_api_host: String,
    pub k8s_api_token: String,
    pub verify_ssl: bool,
    /// Per-attempt watch timeout in seconds; 0 disables the timeout.
    pub k8s_watch_timeout: u64,
    pub debug: bool,
    pub debug_k8s_events: bool,
    pub namespace_exclude_re: String,
    #[serde(deserialize_with = "string_list")]
    pub resources_exclude: Vec<String>,

    pub zabbix_server: String,
    pub zabbix_port: u16,
    pub zabbix_host: String,
    #[serde(deserialize_with = "string_list")]
    pub zabbix_resources_exclude: Vec<String>,
    pub zabbix_debug: bool,
    pub zabbix_single_debug: bool,
    pub zabbix_dry_run: bool,

    pub web_api_enable: bool,
    pub web_api_host: String,
    pub web_api_token: String,
    pub web_api_cluster: String,
    pub web_api_verify_ssl: bool,
    #[serde(deserialize_with = "string_list")]
    pub web_api_resources_exclude: Vec<String>,

    pub discovery_interval_fast: u64,
    pub resend_data_interval_fast: u64,
    pub discovery_interval_slow: u64,
    pub resend_data_interval_slow: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            k8s_config_type: ClusterAccessKind::Incluster,
            k8s_api_host: "https://example.kube-apiserver.com".to_string(),
            k8s_api_token: String::new(),
            verify_ssl: true,
            k8s_watch_timeout: 240,
            debug: false,
            debug_k8s_events: false,
            namespace_exclude_re: String::new(),
            resources_exclude: Vec::new(),
            zabbix_server: "example.zabbix-server.com".to_string(),
            zabbix_port: 10051,
            zabbix_host: "k8s-example-host".to_string(),
            zabbix_resources_exclude: vec![
                "components".to_string(),
                "statefulsets".to_string(),
                "daemonsets".to_string(),
            ],
            zabbix_debug: false,
            zabbix_single_debug: false,
            zabbix_dry_run: false,
            web_api_enable: false,
            web_api_host: "https://example.api.com/api/v1/k8s".to_string(),
            web_api_token: String::new(),
            web_api_cluster: "k8s-test-cluster".to_string(),
            web_api_verify_ssl: true,
            web_api_resources_exclude: vec![
                "daemonsets".to_string(),
                "components".to_string(),
                "services".to_string(),
                "statefulsets".to_string(),
            ],
            discovery_interval_fast: 60 * 15,
            resend_data_interval_fast: 60 * 2,
            discovery_interval_slow: 60 * 60 * 2,
            resend_data_interval_slow: 60 * 30,
        }
    }
}

/// Accepts either a comma/whitespace separated string (INI, environment) or a
/// proper sequence.
fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListRepr {
        Joined(String),
        Items(Vec<String>),
    }

    Ok(match ListRepr::deserialize(deserializer)? {
        ListRepr::Joined(s) => s
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect(),
        ListRepr::Items(items) => items,
    })
}

fn parse_kinds(field: &'static str, values: &[String]) -> ConfigResult<Vec<ResourceKind>> {
    values
        .iter()
        .map(|value| {
            value.parse().map_err(|_| ConfigError::UnknownKind {
                field,
                value: value.clone(),
            })
        })
        .collect()
}

impl AgentConfig {
    /// Loads the INI file at `path` over the defaults, then applies
    /// environment variable overrides, then validates.
    pub fn load(path: &str) -> ConfigResult<Self> {
        let cfg: AgentConfig = config::Config::builder()
            .add_source(File::new(path, FileFormat::Ini))
            .add_source(Environment::default().ignore_empty(true))
            .build()
            .and_then(|raw| raw.try_deserialize())
            .map_err(|e| ConfigError::LoadFailed {
                path: path.to_string(),
                message: e.to_string(),
            })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Surfaces configuration mistakes before any worker starts.
    pub fn validate(&self) -> ConfigResult<()> {
        parse_kinds("resources_exclude", &self.resources_exclude)?;
        parse_kinds("zabbix_resources_exclude", &self.zabbix_resources_exclude)?;
        parse_kinds("web_api_resources_exclude", &self.web_api_resources_exclude)?;

        if !self.namespace_exclude_re.is_empty() {
            regex::Regex::new(&self.namespace_exclude_re).map_err(|e| {
                ConfigError::InvalidValue {
                    field: "namespace_exclude_re",
                    message: e.to_string(),
                }
            })?;
        }
        if self.web_api_enable {
            reqwest::Url::parse(&self.web_api_host).map_err(|e| ConfigError::InvalidValue {
                field: "web_api_host",
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Kinds this agent observes: the closed enumeration minus
    /// `resources_exclude`.
    pub fn enabled_kinds(&self) -> Vec<ResourceKind> {
        self.filtered_kinds(&self.resources_exclude)
    }

    /// Kinds published to the Zabbix sink.
    pub fn zabbix_kinds(&self) -> Vec<ResourceKind> {
        let mut excluded = self.resources_exclude.clone();
        excluded.extend(self.zabbix_resources_exclude.iter().cloned());
        self.filtered_kinds(&excluded)
    }

    /// Kinds published to the web API sink.
    pub fn web_kinds(&self) -> Vec<ResourceKind> {
        let mut excluded = self.resources_exclude.clone();
        excluded.extend(self.web_api_resources_exclude.iter().cloned());
        self.filtered_kinds(&excluded)
    }

    fn filtered_kinds(&self, excluded: &[String]) -> Vec<ResourceKind> {
        ResourceKind::ALL
            .into_iter()
            .filter(|kind| !excluded.iter().any(|e| e == kind.as_str()))
            .collect()
    }

    pub fn discovery_interval(&self, kind: ResourceKind) -> Duration {
        Duration::from_secs(match kind.cadence() {
            Cadence::Fast => self.discovery_interval_fast,
            Cadence::Slow => self.discovery_interval_slow,
        })
    }

    pub fn resend_interval(&self, kind: ResourceKind) -> Duration {
        Duration::from_secs(match kind.cadence() {
            Cadence::Fast => self.resend_data_interval_fast,
            Cadence::Slow => self.resend_data_interval_slow,
        })
    }

    /// Compiled namespace exclusion filter, if configured.
    pub fn namespace_exclude(&self) -> Option<regex::Regex> {
        if self.namespace_exclude_re.is_empty() {
            return None;
        }
        regex::Regex::new(&self.namespace_exclude_re).ok()
    }
}
