use std::sync::Arc;

use reqwest::Method;
use serde_json::Value;
use tracing::{debug, warn};

use crate::auth::CredentialManager;
use crate::config::RuntimeConfig;
use crate::error::ApiError;
use crate::util::parse_error_body;

/// Thin wrapper over `reqwest` that speaks to one Metabase instance.
///
/// Cloning is cheap; clones share the HTTP connection pool and the
/// credential cache.
#[derive(Clone)]
pub struct MetabaseClient {
    base_url: String,
    http: reqwest::Client,
    credentials: Arc<CredentialManager>,
}

impl MetabaseClient {
    pub fn new(config: &RuntimeConfig) -> Self {
        let http = reqwest::Client::new();
        let credentials = Arc::new(CredentialManager::new(
            config.base_url.clone(),
            config.auth.clone(),
            http.clone(),
        ));
        Self {
            base_url: config.base_url.clone(),
            http,
            credentials,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn credentials(&self) -> &CredentialManager {
        &self.credentials
    }

    pub async fn get(&self, path: &str) -> Result<Value, ApiError> {
        self.send(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        self.send(Method::POST, path, Some(body)).await
    }

    /// Issues one call against `{base_url}{path}` with the active credential
    /// and returns the decoded JSON body. Non-2xx statuses become
    /// [`ApiError::Upstream`].
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, ApiError> {
        let path = normalize_api_path(path)?;
        let url = reqwest::Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| ApiError::InvalidUrl(format!("{path}: {e}")))?;

        let credential = self.credentials.credential().await?;
        debug!(method = %method, path = %path, "Calling Metabase API");

        let mut request = self
            .http
            .request(method.clone(), url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(credential.header_name(), credential.secret());
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|source| ApiError::Connection {
            url: self.base_url.clone(),
            source,
        })?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ApiError::MalformedResponse(format!("failed to read body: {e}")))?;

        if !status.is_success() {
            let body = parse_error_body(&bytes);
            warn!(
                method = %method,
                path = %path,
                status = status.as_u16(),
                "Metabase API request failed"
            );
            return Err(ApiError::Upstream {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
                body,
            });
        }

        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| ApiError::MalformedResponse(e.to_string()))
    }
}

fn normalize_api_path(raw: &str) -> Result<String, ApiError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ApiError::InvalidUrl("API path must not be empty".to_string()));
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Err(ApiError::InvalidUrl(format!(
            "pass an API path like /api/card, not a full URL: {trimmed}"
        )));
    }
    if trimmed.starts_with('/') {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("/{trimmed}"))
    }
}
