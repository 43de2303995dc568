//! Web API sink: JSON mirror of the canonical records.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, LOCATION, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::errors::{SinkError, SinkResult};
use crate::k8s::ResourceKind;

const AGENT_USER_AGENT: &str = "k8s-zabbix agent";

/// Watch-event verb as seen by the web API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebAction {
    Added,
    Modified,
    Deleted,
}

impl WebAction {
    fn method(self) -> Method {
        match self {
            WebAction::Added => Method::POST,
            WebAction::Modified => Method::PUT,
            WebAction::Deleted => Method::DELETE,
        }
    }
}

/// Client for the configured web API endpoint.
#[derive(Debug, Clone)]
pub struct WebApi {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl WebApi {
    /// Builds the client and resolves the base URL once: a 301/302 on a HEAD
    /// request permanently replaces the base with the Location target.
    pub async fn connect(host: &str, token: &str, verify_ssl: bool) -> SinkResult<Self> {
        let probe = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_ssl)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let mut base_url = host.to_string();
        let response = probe.head(host).send().await?;
        if matches!(
            response.status(),
            StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND
        ) {
            if let Some(location) = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
            {
                info!(from = %host, to = %location, "web api base moved");
                base_url = location.to_string();
            }
        }
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_ssl)
            .build()?;

        Ok(Self {
            base_url,
            token: token.to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, kind: ResourceKind, path_append: &str) -> String {
        format!("{}{}/{}", self.base_url, kind.singular(), path_append)
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(token) = HeaderValue::from_str(&self.token) {
            headers.insert(AUTHORIZATION, token);
        }
        headers.insert(USER_AGENT, HeaderValue::from_static(AGENT_USER_AGENT));
        headers
    }

    /// Submits one object. Deletes address the object path and carry no
    /// body; adds and modifications carry the payload.
    pub async fn send_data(
        &self,
        kind: ResourceKind,
        payload: &Value,
        action: WebAction,
    ) -> SinkResult<()> {
        let url = match action {
            WebAction::Deleted => {
                let cluster = payload["cluster"].as_str().unwrap_or_default();
                let name = payload["name"].as_str().unwrap_or_default();
                let path = match payload["name_space"].as_str() {
                    Some(namespace) => format!("{cluster}/{namespace}/{name}/"),
                    None => format!("{cluster}/{name}/"),
                };
                self.url(kind, &path)
            }
            _ => self.url(kind, ""),
        };

        let mut request = self
            .client
            .request(action.method(), &url)
            .headers(self.headers());
        if action != WebAction::Deleted {
            request = request.json(payload);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() >= 400 {
            warn!(%url, %status, kind = %kind, ?action, "web api submission failed");
            return Err(SinkError::WebStatus {
                url,
                status: status.as_u16(),
            });
        }
        debug!(%url, %status, kind = %kind, ?action, "web api submission ok");
        Ok(())
    }
}
