use clap::Args;

use crate::error::ConfigError;

/// Connection and logging options. Every flag falls back to its environment
/// variable, so the server can be configured entirely from the MCP client's
/// `env` block.
#[derive(Args, Clone, Debug, Default)]
pub struct MetabaseArgs {
    /// Metabase base URL, e.g. https://metabase.example.com
    #[arg(long, env = "METABASE_URL")]
    pub metabase_url: Option<String>,
    /// Metabase API key (takes precedence over username/password)
    #[arg(long, env = "METABASE_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
    /// Metabase user email for session login
    #[arg(long, env = "METABASE_USER_EMAIL")]
    pub username: Option<String>,
    /// Metabase password for session login
    #[arg(long, env = "METABASE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
    /// Log level or tracing filter directive (logs go to stderr)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    ApiKey(String),
    Session { username: String, password: String },
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::ApiKey(_) => "api_key",
            AuthMethod::Session { .. } => "session",
        }
    }
}

// Secrets stay out of debug output and therefore out of logs.
impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            AuthMethod::Session { username, .. } => f
                .debug_struct("Session")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub base_url: String,
    pub auth: AuthMethod,
}

impl RuntimeConfig {
    pub fn from_args(args: &MetabaseArgs) -> Result<Self, ConfigError> {
        let base_url = non_empty(args.metabase_url.as_deref()).ok_or(ConfigError::MissingBaseUrl)?;
        let parsed = reqwest::Url::parse(base_url)
            .map_err(|e| ConfigError::InvalidBaseUrl(format!("{base_url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidBaseUrl(base_url.to_string()));
        }

        let auth = match (
            non_empty(args.api_key.as_deref()),
            non_empty(args.username.as_deref()),
            non_empty(args.password.as_deref()),
        ) {
            (Some(key), _, _) => AuthMethod::ApiKey(key.to_string()),
            (None, Some(username), Some(password)) => AuthMethod::Session {
                username: username.to_string(),
                password: password.to_string(),
            },
            _ => return Err(ConfigError::MissingCredentials),
        };

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
        })
    }
}

fn non_empty(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(
        url: Option<&str>,
        key: Option<&str>,
        user: Option<&str>,
        pass: Option<&str>,
    ) -> MetabaseArgs {
        MetabaseArgs {
            metabase_url: url.map(str::to_string),
            api_key: key.map(str::to_string),
            username: user.map(str::to_string),
            password: pass.map(str::to_string),
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn api_key_takes_precedence_over_session_credentials() {
        let config = RuntimeConfig::from_args(&args(
            Some("http://metabase.local/"),
            Some("mb_key"),
            Some("ops@example.com"),
            Some("secret"),
        ))
        .unwrap();
        assert_eq!(config.base_url, "http://metabase.local");
        assert_eq!(config.auth, AuthMethod::ApiKey("mb_key".to_string()));
    }

    #[test]
    fn username_and_password_select_session_auth() {
        let config = RuntimeConfig::from_args(&args(
            Some("https://metabase.local"),
            Some("   "),
            Some("ops@example.com"),
            Some("secret"),
        ))
        .unwrap();
        assert_eq!(config.auth.as_str(), "session");
    }

    #[test]
    fn missing_base_url_is_rejected() {
        let err = RuntimeConfig::from_args(&args(None, Some("k"), None, None)).unwrap_err();
        assert_eq!(err, ConfigError::MissingBaseUrl);
    }

    #[test]
    fn non_http_base_url_is_rejected() {
        let err =
            RuntimeConfig::from_args(&args(Some("ftp://metabase.local"), Some("k"), None, None))
                .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBaseUrl(_)));
    }

    #[test]
    fn username_without_password_is_rejected() {
        let err = RuntimeConfig::from_args(&args(
            Some("http://metabase.local"),
            None,
            Some("ops@example.com"),
            None,
        ))
        .unwrap_err();
        assert_eq!(err, ConfigError::MissingCredentials);
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let auth = AuthMethod::Session {
            username: "ops@example.com".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{auth:?}");
        assert!(rendered.contains("ops@example.com"));
        assert!(!rendered.contains("hunter2"));
    }
}
