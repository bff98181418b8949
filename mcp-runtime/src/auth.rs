use std::sync::Mutex;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::AuthMethod;
use crate::error::ApiError;
use crate::util::parse_response_body;

pub const API_KEY_HEADER: &str = "X-API-KEY";
pub const SESSION_HEADER: &str = "X-Metabase-Session";

/// A usable upstream credential. Knows which header it travels in.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    ApiKey(String),
    SessionToken(String),
}

impl Credential {
    pub fn header_name(&self) -> &'static str {
        match self {
            Credential::ApiKey(_) => API_KEY_HEADER,
            Credential::SessionToken(_) => SESSION_HEADER,
        }
    }

    pub fn secret(&self) -> &str {
        match self {
            Credential::ApiKey(value) | Credential::SessionToken(value) => value,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            Credential::SessionToken(_) => f.write_str("SessionToken(<redacted>)"),
        }
    }
}

#[derive(Deserialize)]
struct SessionResponse {
    id: String,
}

/// Owns the configured auth method and, in session mode, the cached token.
///
/// The session token is fetched on first use and kept for the life of the
/// process. There is no expiry handling: a 401 from Metabase is reported to the
/// caller like any other upstream failure. Two concurrent first calls may both
/// log in; the later token simply overwrites the earlier one.
pub struct CredentialManager {
    base_url: String,
    method: AuthMethod,
    http: reqwest::Client,
    session_token: Mutex<Option<String>>,
}

impl CredentialManager {
    pub fn new(base_url: impl Into<String>, method: AuthMethod, http: reqwest::Client) -> Self {
        let base_url = base_url.into();
        match &method {
            AuthMethod::ApiKey(_) => {
                info!(auth_method = "api_key", "Using Metabase API key authentication")
            }
            AuthMethod::Session { username, .. } => info!(
                auth_method = "session",
                username = %username,
                "Using Metabase session authentication"
            ),
        }
        Self {
            base_url,
            method,
            http,
            session_token: Mutex::new(None),
        }
    }

    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Returns a credential ready to attach to an upstream request, logging in
    /// first when session mode has no cached token yet.
    pub async fn credential(&self) -> Result<Credential, ApiError> {
        let (username, password) = match &self.method {
            AuthMethod::ApiKey(key) => return Ok(Credential::ApiKey(key.clone())),
            AuthMethod::Session { username, password } => (username, password),
        };

        if let Some(token) = self.cached_token() {
            debug!("Reusing cached Metabase session token");
            return Ok(Credential::SessionToken(token));
        }

        let token = self.login(username, password).await?;
        *self
            .session_token
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(token.clone());
        Ok(Credential::SessionToken(token))
    }

    fn cached_token(&self) -> Option<String> {
        self.session_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn login(&self, username: &str, password: &str) -> Result<String, ApiError> {
        let url = format!("{}/api/session", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&json!({
                "username": username,
                "password": password
            }))
            .send()
            .await
            .map_err(|e| ApiError::Authentication(format!("login request to {url} failed: {e}")))?;

        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ApiError::Authentication(format!("failed to read login response: {e}")))?;

        if !status.is_success() {
            let body = parse_response_body(&bytes);
            return Err(ApiError::Authentication(format!(
                "Metabase rejected login with {}: {}",
                status.as_u16(),
                body
            )));
        }

        let session: SessionResponse = serde_json::from_slice(&bytes).map_err(|e| {
            ApiError::Authentication(format!("login response did not contain a session id: {e}"))
        })?;

        info!(username = %username, "Obtained new Metabase session token");
        Ok(session.id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session_method() -> AuthMethod {
        AuthMethod::Session {
            username: "ops@example.com".to_string(),
            password: "secret".to_string(),
        }
    }

    #[tokio::test]
    async fn api_key_mode_never_logs_in() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "tok" })))
            .expect(0)
            .mount(&server)
            .await;

        let manager = CredentialManager::new(
            server.uri(),
            AuthMethod::ApiKey("mb_key".to_string()),
            reqwest::Client::new(),
        );
        for _ in 0..5 {
            let credential = manager.credential().await.unwrap();
            assert_eq!(credential, Credential::ApiKey("mb_key".to_string()));
            assert_eq!(credential.header_name(), API_KEY_HEADER);
        }
    }

    #[tokio::test]
    async fn session_token_is_fetched_once_and_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/session"))
            .and(body_json(json!({
                "username": "ops@example.com",
                "password": "secret"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "session-1" })))
            .expect(1)
            .mount(&server)
            .await;

        let manager =
            CredentialManager::new(server.uri(), session_method(), reqwest::Client::new());
        for _ in 0..3 {
            let credential = manager.credential().await.unwrap();
            assert_eq!(credential, Credential::SessionToken("session-1".to_string()));
            assert_eq!(credential.header_name(), SESSION_HEADER);
        }
    }

    #[tokio::test]
    async fn concurrent_first_use_logs_in_at_most_once_per_caller() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "session-1" })))
            .expect(1..=2)
            .mount(&server)
            .await;

        let manager = Arc::new(CredentialManager::new(
            server.uri(),
            session_method(),
            reqwest::Client::new(),
        ));
        let (first, second) = tokio::join!(manager.credential(), manager.credential());
        assert!(first.is_ok());
        assert!(second.is_ok());

        let logins_after_race = server.received_requests().await.unwrap().len();
        for _ in 0..4 {
            manager.credential().await.unwrap();
        }
        let logins_after_reuse = server.received_requests().await.unwrap().len();
        assert_eq!(logins_after_race, logins_after_reuse);
    }

    #[tokio::test]
    async fn failed_login_is_an_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/session"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "errors": { "password": "did not match" }
            })))
            .mount(&server)
            .await;

        let manager =
            CredentialManager::new(server.uri(), session_method(), reqwest::Client::new());
        let err = manager.credential().await.unwrap_err();
        assert!(matches!(err, ApiError::Authentication(_)));
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn login_response_without_id_is_an_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .mount(&server)
            .await;

        let manager =
            CredentialManager::new(server.uri(), session_method(), reqwest::Client::new());
        let err = manager.credential().await.unwrap_err();
        assert!(matches!(err, ApiError::Authentication(_)));
    }
}
