//! Error types for the agent.
//!
//! Each component gets its own structured error enum; `AgentError` is the
//! umbrella used at the binary boundary.

use thiserror::Error;

use crate::k8s::ResourceKind;

/// Main application error type encompassing all possible failures.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Kubernetes-related errors
    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] K8sError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Sink delivery errors
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kubernetes-specific error types.
#[derive(Error, Debug)]
pub enum K8sError {
    /// Failed to create the Kubernetes client
    #[error("Failed to create Kubernetes client: {source}")]
    ClientCreationFailed {
        #[from]
        source: kube::Error,
    },

    /// Failed to build client configuration for the selected access type
    #[error("Failed to infer cluster configuration: {source}")]
    ConfigInferFailed {
        #[from]
        source: kube::config::InferConfigError,
    },

    /// In-cluster service-account environment is missing or incomplete
    #[error("In-cluster configuration unavailable: {source}")]
    InClusterConfig {
        #[from]
        source: kube::config::InClusterError,
    },

    /// Kubeconfig could not be loaded or interpreted
    #[error("Kubeconfig error: {source}")]
    Kubeconfig {
        #[from]
        source: kube::config::KubeconfigError,
    },

    /// Watch stream failed for a resource kind
    #[error("Watch failed for {kind}: {message}")]
    WatchFailed { kind: ResourceKind, message: String },

    /// A streamed or listed object is missing a required field
    #[error("Malformed {kind} object: {message}")]
    MalformedObject { kind: ResourceKind, message: String },

    /// API server communication error
    #[error("API server communication error: {message}")]
    ApiError { message: String },
}

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file missing or unparseable
    #[error("Failed to load configuration {path}: {message}")]
    LoadFailed { path: String, message: String },

    /// A resource list names a kind outside the closed enumeration
    #[error("Unknown resource kind '{value}' in {field}")]
    UnknownKind { field: &'static str, value: String },

    /// Invalid configuration value
    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}

/// Sink delivery error types.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Zabbix trapper transport failure
    #[error("Zabbix send to {server} failed: {message}")]
    ZabbixTransport { server: String, message: String },

    /// Zabbix trapper returned an unparseable response
    #[error("Unexpected Zabbix response: {message}")]
    ZabbixProtocol { message: String },

    /// Web API request failed at the transport level
    #[error("Web API request failed: {source}")]
    WebTransport {
        #[from]
        source: reqwest::Error,
    },

    /// Web API answered with an error status
    #[error("Web API {url} answered {status}")]
    WebStatus { url: String, status: u16 },
}

pub type AgentResult<T> = Result<T, AgentError>;
pub type K8sResult<T> = Result<T, K8sError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type SinkResult<T> = Result<T, SinkError>;

impl K8sError {
    pub fn malformed(kind: ResourceKind, message: impl Into<String>) -> Self {
        Self::MalformedObject {
            kind,
            message: message.into(),
        }
    }

    pub fn watch_failed(kind: ResourceKind, message: impl Into<String>) -> Self {
        Self::WatchFailed {
            kind,
            message: message.into(),
        }
    }
}

impl From<String> for K8sError {
    fn from(message: String) -> Self {
        K8sError::ApiError { message }
    }
}
