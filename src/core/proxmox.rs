use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::ProxmoxSettings;
use crate::errors::{KaminoError, KaminoResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
            HttpMethod::Put => write!(f, "PUT"),
            HttpMethod::Delete => write!(f, "DELETE"),
        }
    }
}

/// Raw answer from the cluster. The status is not interpreted here.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The only way the crate talks to the hypervisor.
///
/// `path` is relative to the API root, e.g. `nodes/pve1/qemu/120/status/current`.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn request(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<&Value>,
    ) -> KaminoResult<ApiResponse>;
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

/// Issues a call and unwraps the `data` member of a 2xx answer.
pub async fn call<T: DeserializeOwned>(
    api: &dyn ClusterApi,
    method: HttpMethod,
    path: &str,
    body: Option<&Value>,
) -> KaminoResult<T> {
    let response = api.request(method, path, body).await?;
    if !response.is_success() {
        return Err(KaminoError::Remote {
            status: response.status,
            path: path.to_string(),
            message: response.body.trim().to_string(),
        });
    }
    let envelope: Envelope<T> = serde_json::from_str(&response.body)
        .map_err(|e| KaminoError::Decode(format!("{} {}: {}", method, path, e)))?;
    Ok(envelope.data)
}

/// Same as [`call`] for endpoints whose payload we do not need (task ids, nulls).
pub async fn call_unit(
    api: &dyn ClusterApi,
    method: HttpMethod,
    path: &str,
    body: Option<&Value>,
) -> KaminoResult<()> {
    call::<Value>(api, method, path, body).await.map(|_| ())
}

/// reqwest-backed gateway authenticated with a Proxmox API token.
pub struct ProxmoxClient {
    http: reqwest::Client,
    base_url: String,
    auth_header: String,
}

impl ProxmoxClient {
    pub fn new(settings: &ProxmoxSettings) -> KaminoResult<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!settings.verify_tls)
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| KaminoError::Config(format!("building http client: {}", e)))?;

        info!(
            host = %settings.host,
            verify_tls = settings.verify_tls,
            "Cluster client ready"
        );

        Ok(Self {
            http,
            base_url: settings.base_url(),
            auth_header: settings.auth_header(),
        })
    }
}

#[async_trait]
impl ClusterApi for ProxmoxClient {
    async fn request(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<&Value>,
    ) -> KaminoResult<ApiResponse> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let builder = match method {
            HttpMethod::Get => self.http.get(&url),
            HttpMethod::Post => self.http.post(&url),
            HttpMethod::Put => self.http.put(&url),
            HttpMethod::Delete => self.http.delete(&url),
        };
        let mut builder = builder.header("Authorization", &self.auth_header);
        if let Some(body) = body {
            if matches!(method, HttpMethod::Post | HttpMethod::Put) {
                builder = builder.json(body);
            }
        }

        debug!(%method, path, "cluster request");
        let response = builder
            .send()
            .await
            .map_err(|e| KaminoError::Transient(format!("{} {}: {}", method, path, e)))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| KaminoError::Transient(format!("reading {} {}: {}", method, path, e)))?;

        Ok(ApiResponse { status, body })
    }
}
