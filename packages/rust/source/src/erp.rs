//! ERP source adapter.
//!
//! Logs in with username/password (session cookie), then reads a resource
//! listing: `GET {base}/api/resource/{name}?fields=["*"]&limit_page_length=N`.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use url::Url;

use warehouse_shared::{PipelineMapping, Result, Row, SourceCredentials, WarehouseError};

use crate::SourceAdapter;

/// User-Agent string for ERP requests.
const USER_AGENT: &str = concat!("warehouse/", env!("CARGO_PKG_VERSION"));

/// Body of a resource listing response.
#[derive(Debug, Deserialize)]
struct ResourceResponse {
    #[serde(default)]
    data: Vec<Row>,
}

/// Pulls datasets from an ERP instance over its REST API.
pub struct ErpSource {
    client: Client,
    credentials: SourceCredentials,
    mapping: PipelineMapping,
}

impl ErpSource {
    /// Create an adapter. The HTTP client keeps the login session cookie.
    pub fn new(credentials: SourceCredentials, mapping: PipelineMapping) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .cookie_store(true)
            .timeout(credentials.request_timeout)
            .build()
            .map_err(|e| {
                WarehouseError::UpstreamTransport(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            credentials,
            mapping,
        })
    }

    /// Build `{base}/seg/seg/...`, percent-encoding each segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.credentials.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                WarehouseError::config(format!(
                    "source base URL '{}' cannot carry a path",
                    self.credentials.base_url
                ))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn login(&self) -> Result<()> {
        let url = self.endpoint(&["api", "method", "login"])?;
        debug!(%url, user = %self.credentials.username, "logging in to ERP");

        let response = self
            .client
            .post(url.as_str())
            .form(&[
                ("usr", self.credentials.username.as_str()),
                ("pwd", self.credentials.password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| WarehouseError::UpstreamTransport(format!("login request failed: {e}")))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(WarehouseError::UpstreamAuth(
                format!("ERP login rejected with HTTP {}", response.status()),
            )),
            status => Err(WarehouseError::UpstreamTransport(format!(
                "ERP login failed with HTTP {status}"
            ))),
        }
    }

    async fn fetch_resource(&self, upstream_name: &str) -> Result<Vec<Row>> {
        let url = self.endpoint(&["api", "resource", upstream_name])?;
        let page_limit = self.credentials.page_limit.to_string();

        let response = self
            .client
            .get(url.as_str())
            .query(&[
                ("fields", r#"["*"]"#),
                ("limit_page_length", page_limit.as_str()),
            ])
            .send()
            .await
            .map_err(|e| WarehouseError::UpstreamTransport(format!("{url}: {e}")))?;

        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => {
                return Err(WarehouseError::UpstreamNotFound(upstream_name.to_string()));
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(WarehouseError::UpstreamAuth(format!(
                    "{upstream_name}: HTTP {status}"
                )));
            }
            s if !s.is_success() => {
                return Err(WarehouseError::UpstreamTransport(format!(
                    "{upstream_name}: HTTP {status}"
                )));
            }
            _ => {}
        }

        let body: ResourceResponse = response.json().await.map_err(|e| {
            WarehouseError::UpstreamTransport(format!("{upstream_name}: malformed body: {e}"))
        })?;
        Ok(body.data)
    }
}

#[async_trait]
impl SourceAdapter for ErpSource {
    #[instrument(skip_all, fields(identifier = %identifier))]
    async fn pull(&self, identifier: &str) -> Result<Vec<Row>> {
        let upstream_name = self.mapping.upstream_name(identifier);
        info!(upstream = %upstream_name, "pulling dataset from ERP");

        self.login().await?;

        match self.fetch_resource(upstream_name).await {
            Ok(rows) => {
                info!(upstream = %upstream_name, rows = rows.len(), "pulled dataset");
                Ok(rows)
            }
            Err(e @ WarehouseError::UpstreamNotFound(_)) => {
                warn!(upstream = %upstream_name, "dataset not found in ERP");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn upstream_name(&self, identifier: &str) -> String {
        self.mapping.upstream_name(identifier).to_string()
    }

    fn name(&self) -> &str {
        "erp"
    }
}
