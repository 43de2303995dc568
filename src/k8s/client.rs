//! Cluster client bootstrap.

use kube::config::{
    AuthInfo, Cluster, Context, KubeConfigOptions, Kubeconfig, NamedAuthInfo, NamedCluster,
    NamedContext,
};
use kube::{Client, Config};

use crate::config::{AgentConfig, ClusterAccessKind};
use crate::errors::K8sResult;

/// Builds the kube client for the configured access type.
///
/// `incluster` uses the service-account environment, `kubeconfig` the local
/// kubeconfig (honoring `KUBECONFIG`), and `token` talks directly to
/// `k8s_api_host` with the configured bearer token.
pub async fn build_client(cfg: &AgentConfig) -> K8sResult<Client> {
    let mut config = match cfg.k8s_config_type {
        ClusterAccessKind::Incluster => Config::incluster()?,
        ClusterAccessKind::Kubeconfig => Config::infer().await?,
        ClusterAccessKind::Token => token_config(cfg).await?,
    };

    config.accept_invalid_certs = !cfg.verify_ssl;
    Ok(Client::try_from(config)?)
}

/// Token access is expressed as a minimal in-memory kubeconfig so that kube
/// handles TLS and auth exactly as it would for a file-based one.
async fn token_config(cfg: &AgentConfig) -> K8sResult<Config> {
    let kubeconfig = Kubeconfig {
        clusters: vec![NamedCluster {
            name: "default".to_string(),
            cluster: Some(Cluster {
                server: Some(cfg.k8s_api_host.clone()),
                insecure_skip_tls_verify: Some(!cfg.verify_ssl),
                ..Default::default()
            }),
        }],
        auth_infos: vec![NamedAuthInfo {
            name: "default".to_string(),
            auth_info: Some(AuthInfo {
                token: Some(cfg.k8s_api_token.clone().into()),
                ..Default::default()
            }),
        }],
        contexts: vec![NamedContext {
            name: "default".to_string(),
            context: Some(Context {
                cluster: "default".to_string(),
                user: Some("default".to_string()),
                ..Default::default()
            }),
        }],
        current_context: Some("default".to_string()),
        ..Default::default()
    };

    Ok(Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    #[tokio::test]
    async fn test_token_config_uses_api_host() {
        let cfg = AgentConfig {
            k8s_config_type: ClusterAccessKind::Token,
            k8s_api_host: "https://kube.example.org:6443".to_string(),
            k8s_api_token: "secret-token".to_string(),
            ..Default::default()
        };
        let config = token_config(&cfg).await.unwrap();
        assert!(config
            .cluster_url
            .to_string()
            .starts_with("https://kube.example.org:6443"));
    }

    #[tokio::test]
    async fn test_token_config_respects_verify_ssl() {
        let cfg = AgentConfig {
            k8s_config_type: ClusterAccessKind::Token,
            k8s_api_host: "https://kube.example.org".to_string(),
            verify_ssl: false,
            ..Default::default()
        };
        let config = token_config(&cfg).await.unwrap();
        assert!(config.accept_invalid_certs);
    }
}
