//! HTTP client for the Consul agent API

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, warn};

use super::{ConfigEntry, ConsulClient, ConsulError, Namespace, RequestOptions};

/// Connection settings for [`ConsulHttpClient`].
#[derive(Clone, Debug)]
pub struct ConsulClientConfig {
    /// Base URL of the agent, e.g. `http://consul-server.consul:8500`
    pub address: String,
    /// ACL token sent as `X-Consul-Token`
    pub token: Option<String>,
    pub timeout: Duration,
}

impl Default for ConsulClientConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8500".to_string(),
            token: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// [`ConsulClient`] backed by the Consul HTTP API.
#[derive(Clone)]
pub struct ConsulHttpClient {
    http_client: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AssignServiceManualVipsRequest<'a> {
    service: &'a str,
    #[serde(rename = "ManualVIPs")]
    manual_vips: &'a [String],
}

impl ConsulHttpClient {
    pub fn new(config: ConsulClientConfig) -> Result<Self, ConsulError> {
        let http_client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http_client,
            base_url: config.address.trim_end_matches('/').to_string(),
            token: config.token.filter(|t| !t.is_empty()),
        })
    }

    fn request(&self, method: Method, path: &str, opts: &RequestOptions) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!("Consul request {} {}", method, url);

        let mut query: Vec<(&str, &str)> = Vec::new();
        if !opts.namespace.is_empty() {
            query.push(("ns", opts.namespace.as_str()));
        }
        if !opts.partition.is_empty() {
            query.push(("partition", opts.partition.as_str()));
        }

        let mut builder = self.http_client.request(method, url).query(&query);
        if let Some(token) = &self.token {
            builder = builder.header("X-Consul-Token", token);
        }
        builder
    }

    /// Turn non-2xx responses into [`ConsulError::UnexpectedStatus`].
    async fn check(response: Response) -> Result<Response, ConsulError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status != StatusCode::NOT_FOUND {
            warn!("Consul returned {}: {}", status, body.trim());
        }
        Err(ConsulError::UnexpectedStatus {
            status: status.as_u16(),
            body: body.trim().to_string(),
        })
    }
}

#[async_trait]
impl ConsulClient for ConsulHttpClient {
    async fn get_config_entry(
        &self,
        kind: &str,
        name: &str,
        opts: &RequestOptions,
    ) -> Result<Option<ConfigEntry>, ConsulError> {
        let path = format!("/v1/config/{}/{}", kind, name);
        let response = self.request(Method::GET, &path, opts).send().await?;
        match Self::check(response).await {
            Ok(response) => {
                let bytes = response.bytes().await?;
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set_config_entry(
        &self,
        entry: &ConfigEntry,
        opts: &RequestOptions,
    ) -> Result<bool, ConsulError> {
        let response = self
            .request(Method::PUT, "/v1/config", opts)
            .json(entry)
            .send()
            .await?;
        let bytes = Self::check(response).await?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn delete_config_entry(
        &self,
        kind: &str,
        name: &str,
        opts: &RequestOptions,
    ) -> Result<(), ConsulError> {
        let path = format!("/v1/config/{}/{}", kind, name);
        let response = self.request(Method::DELETE, &path, opts).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn read_namespace(
        &self,
        name: &str,
        opts: &RequestOptions,
    ) -> Result<Option<Namespace>, ConsulError> {
        let path = format!("/v1/namespace/{}", name);
        let response = self.request(Method::GET, &path, opts).send().await?;
        match Self::check(response).await {
            Ok(response) => {
                let bytes = response.bytes().await?;
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_namespace(
        &self,
        namespace: &Namespace,
        opts: &RequestOptions,
    ) -> Result<Namespace, ConsulError> {
        let response = self
            .request(Method::PUT, "/v1/namespace", opts)
            .json(namespace)
            .send()
            .await?;
        let bytes = Self::check(response).await?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn assign_service_virtual_ip(
        &self,
        service: &str,
        manual_ips: &[String],
        opts: &RequestOptions,
    ) -> Result<(), ConsulError> {
        let body = AssignServiceManualVipsRequest {
            service,
            manual_vips: manual_ips,
        };
        let response = self
            .request(Method::PUT, "/v1/internal/service-virtual-ip", opts)
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}
