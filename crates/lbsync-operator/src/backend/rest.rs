//! reqwest implementation of [`BackendClient`]
//!
//! # Endpoints used
//!
//! - `GET /api/{type}?created_by=..&include_name=true` - paginated collection read
//! - `GET /api/{type}/{uuid}` - single object read
//! - `GET /api/{type}?name={name}` - lookup by name
//! - `POST /api/{type}` - create
//! - `PUT /api/{type}/{uuid}` - replace
//! - `DELETE /api/{type}/{uuid}` - delete (404 is treated as success)
//! - `GET /api/cluster/runtime` - readiness probe

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::models::{ErrorBody, Page};
use super::{BackendClient, BackendError, ObjectType};
use crate::metrics::BackendTimer;

const TENANT_HEADER: &str = "x-avi-tenant";
const VERSION_HEADER: &str = "x-avi-version";

/// Objects per page on collection reads
const PAGE_SIZE: usize = 100;

/// Upper bound on followed `next` links, guards against a backend that
/// never stops paginating
const MAX_PAGES: usize = 1000;

/// Connection settings for [`RestBackendClient`]
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Backend API version sent with every request
    pub api_version: String,
    /// Cloud that virtual services, VIPs and pools are placed in
    pub cloud_name: String,
    /// Ownership marker written on created objects and used to filter reads
    pub created_by: String,
    pub timeout: Duration,
}

/// Backend controller client
#[derive(Debug)]
pub struct RestBackendClient {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
    settings: ClientSettings,
}

impl RestBackendClient {
    /// Create a new client
    ///
    /// `base_url` is the controller endpoint (`https://ctrl.example.com`); a
    /// bare host gets an `https://` scheme. `ca_cert` is an optional PEM bundle
    /// trusted in addition to the system roots.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built, the CA bundle is
    /// invalid, or the token contains invalid header characters.
    pub fn new(
        base_url: impl Into<String>,
        api_token: String,
        ca_cert: Option<&[u8]>,
        settings: ClientSettings,
    ) -> Result<Self, BackendError> {
        let mut builder = reqwest::Client::builder().timeout(settings.timeout);
        if let Some(pem) = ca_cert {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| BackendError::Config(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| BackendError::Config(format!("failed to build HTTP client: {e}")))?;

        // Validate API token can be used in headers (fail early)
        HeaderValue::from_str(&format!("Bearer {api_token}")).map_err(|_| {
            BackendError::Config("API token contains invalid characters".to_string())
        })?;
        HeaderValue::from_str(&settings.api_version).map_err(|_| {
            BackendError::Config("API version contains invalid characters".to_string())
        })?;

        let mut base_url = base_url.into();
        if !base_url.contains("://") {
            base_url = format!("https://{base_url}");
        }
        let base_url = base_url.trim_end_matches('/').to_string();

        Ok(Self {
            client,
            base_url,
            api_token,
            settings,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn headers(&self, tenant: &str) -> Result<HeaderMap, BackendError> {
        let mut headers = HeaderMap::new();
        // Token and version were validated in the constructor
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", self.api_token)) {
            headers.insert(AUTHORIZATION, value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.settings.api_version) {
            headers.insert(VERSION_HEADER, value);
        }
        let tenant = HeaderValue::from_str(tenant)
            .map_err(|_| BackendError::Config(format!("invalid tenant name '{tenant}'")))?;
        headers.insert(TENANT_HEADER, tenant);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn collection_url(&self, object_type: ObjectType) -> String {
        format!("{}/api/{}", self.base_url, object_type.path())
    }

    fn object_url(&self, object_type: ObjectType, uuid: &str) -> String {
        format!("{}/api/{}/{}", self.base_url, object_type.path(), uuid)
    }

    /// Query parameters shared by collection reads
    fn collection_query(&self, object_type: ObjectType) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("include_name", "true".to_string()),
            ("page_size", PAGE_SIZE.to_string()),
        ];
        if object_type.is_managed() {
            query.push(("created_by", self.settings.created_by.clone()));
        }
        if object_type.is_cloud_scoped() {
            query.push(("cloud_ref.name", self.settings.cloud_name.clone()));
        }
        query
    }

    /// Stamp ownership and placement on a body before it is written
    fn stamp(&self, object_type: ObjectType, mut body: Value) -> Value {
        if let Some(object) = body.as_object_mut() {
            if object_type.is_managed() {
                object.insert(
                    "created_by".to_string(),
                    Value::String(self.settings.created_by.clone()),
                );
            }
            if object_type.is_cloud_scoped() && !object.contains_key("cloud_ref") {
                object.insert(
                    "cloud_ref".to_string(),
                    Value::String(format!("/api/cloud/?name={}", self.settings.cloud_name)),
                );
            }
        }
        body
    }

    async fn fetch_page(&self, url: &str, query: &[(&str, String)], tenant: &str) -> Result<Page, BackendError> {
        let response = self
            .client
            .get(url)
            .headers(self.headers(tenant)?)
            .query(query)
            .send()
            .await?;
        let response = check_status(response).await?;
        response
            .json::<Page>()
            .await
            .map_err(|e| BackendError::Parse(format!("invalid collection response: {e}")))
    }
}

/// Convert a non-success response into [`BackendError::Api`]
async fn check_status(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(|body| body.error)
        .unwrap_or(text);
    Err(BackendError::Api {
        status: status.as_u16(),
        message,
    })
}

async fn read_object(response: Response, object_type: ObjectType) -> Result<Value, BackendError> {
    response
        .json::<Value>()
        .await
        .map_err(|e| BackendError::Parse(format!("invalid {object_type} response: {e}")))
}

fn status_label<T>(result: &Result<T, BackendError>) -> String {
    match result {
        Ok(_) => "ok".to_string(),
        Err(e) => e
            .status()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "error".to_string()),
    }
}

#[async_trait]
impl BackendClient for RestBackendClient {
    #[instrument(skip(self), fields(object_type = %object_type))]
    async fn list(&self, object_type: ObjectType, tenant: &str) -> Result<Vec<Value>, BackendError> {
        let timer = BackendTimer::start(object_type.path(), "list");
        let result = async {
            let mut objects = Vec::new();
            let mut page = self
                .fetch_page(&self.collection_url(object_type), &self.collection_query(object_type), tenant)
                .await?;
            let expected = page.count;
            let mut pages = 1;
            loop {
                objects.append(&mut page.results);
                let Some(next) = page.next.take().filter(|next| !next.is_empty()) else {
                    break;
                };
                if pages >= MAX_PAGES {
                    warn!(object_type = %object_type, pages, "Stopping pagination at page limit");
                    break;
                }
                // `next` already carries the full query
                page = self.fetch_page(&next, &[], tenant).await?;
                pages += 1;
            }
            debug!(object_type = %object_type, count = objects.len(), expected, "Listed objects");
            Ok(objects)
        }
        .await;
        timer.finish(&status_label(&result));
        result
    }

    #[instrument(skip(self), fields(object_type = %object_type))]
    async fn get(
        &self,
        object_type: ObjectType,
        tenant: &str,
        uuid: &str,
    ) -> Result<Option<Value>, BackendError> {
        let timer = BackendTimer::start(object_type.path(), "get");
        let result = async {
            let response = self
                .client
                .get(self.object_url(object_type, uuid))
                .headers(self.headers(tenant)?)
                .query(&[("include_name", "true")])
                .send()
                .await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let response = check_status(response).await?;
            read_object(response, object_type).await.map(Some)
        }
        .await;
        timer.finish(&status_label(&result));
        result
    }

    #[instrument(skip(self), fields(object_type = %object_type))]
    async fn get_by_name(
        &self,
        object_type: ObjectType,
        tenant: &str,
        name: &str,
    ) -> Result<Option<Value>, BackendError> {
        let timer = BackendTimer::start(object_type.path(), "get_by_name");
        let result = async {
            let query = [("name", name.to_string()), ("include_name", "true".to_string())];
            let page = self
                .fetch_page(&self.collection_url(object_type), &query, tenant)
                .await?;
            Ok(page
                .results
                .into_iter()
                .find(|object| object.get("name").and_then(Value::as_str) == Some(name)))
        }
        .await;
        timer.finish(&status_label(&result));
        result
    }

    #[instrument(skip(self, body), fields(object_type = %object_type))]
    async fn create(
        &self,
        object_type: ObjectType,
        tenant: &str,
        body: Value,
    ) -> Result<Value, BackendError> {
        let timer = BackendTimer::start(object_type.path(), "create");
        let result = async {
            let response = self
                .client
                .post(self.collection_url(object_type))
                .headers(self.headers(tenant)?)
                .json(&self.stamp(object_type, body))
                .send()
                .await?;
            let response = check_status(response).await?;
            read_object(response, object_type).await
        }
        .await;
        timer.finish(&status_label(&result));
        result
    }

    #[instrument(skip(self, body), fields(object_type = %object_type))]
    async fn update(
        &self,
        object_type: ObjectType,
        tenant: &str,
        uuid: &str,
        body: Value,
    ) -> Result<Value, BackendError> {
        let timer = BackendTimer::start(object_type.path(), "update");
        let result = async {
            let response = self
                .client
                .put(self.object_url(object_type, uuid))
                .headers(self.headers(tenant)?)
                .json(&self.stamp(object_type, body))
                .send()
                .await?;
            let response = check_status(response).await?;
            read_object(response, object_type).await
        }
        .await;
        timer.finish(&status_label(&result));
        result
    }

    #[instrument(skip(self), fields(object_type = %object_type))]
    async fn delete(
        &self,
        object_type: ObjectType,
        tenant: &str,
        uuid: &str,
    ) -> Result<(), BackendError> {
        let timer = BackendTimer::start(object_type.path(), "delete");
        let result = async {
            let response = self
                .client
                .delete(self.object_url(object_type, uuid))
                .headers(self.headers(tenant)?)
                .send()
                .await?;

            // 404 is acceptable - object may have been removed already
            if response.status() == StatusCode::NOT_FOUND {
                debug!(object_type = %object_type, uuid = %uuid, "Object already deleted");
                return Ok(());
            }
            check_status(response).await?;
            Ok(())
        }
        .await;
        timer.finish(&status_label(&result));
        result
    }

    #[instrument(skip(self))]
    async fn check_readiness(&self) -> Result<bool, BackendError> {
        let response = self
            .client
            .get(format!("{}/api/cluster/runtime", self.base_url))
            .headers(self.headers("admin")?)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        warn!(status = status.as_u16(), "Backend controller not ready");
        Ok(false)
    }
}
