//! Static configuration: the public base URL, the database location, the
//! GitHub device-flow provider, and the tool endpoints.
//!
//! Loaded from TOML, then overridden from the environment.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AuthError, Result};
use crate::types::ClientCredentials;

pub const DEFAULT_CONFIG_PATH: &str = "config/keyward.toml";

const ENV_BASE_URL: &str = "KEYWARD_BASE_URL";
const ENV_DATABASE: &str = "KEYWARD_DATABASE";
const ENV_GITHUB_CLIENT_ID: &str = "GITHUB_CLIENT_ID";
const ENV_GITHUB_CLIENT_SECRET: &str = "GITHUB_CLIENT_SECRET";

fn default_base_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/keyward.db")
}

fn default_session_ttl_secs() -> u64 {
    600
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Public URL the browser reaches this server at. Redirect URIs and
    /// the postMessage target origin derive from it.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// How long an authorization-code `state` stays redeemable.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    #[serde(default)]
    pub github: Option<GitHubProviderConfig>,

    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            database_path: default_database_path(),
            session_ttl_secs: default_session_ttl_secs(),
            github: None,
            endpoints: Vec::new(),
        }
    }
}

impl AuthConfig {
    /// Parse `path` and apply environment overrides. A missing file yields
    /// the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| {
                AuthError::config(format!("failed to read {}: {e}", path.display()))
            })?;
            Self::from_toml(&content)?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| AuthError::config(format!("invalid config: {e}")))
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok().filter(|v| !v.is_empty()));
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(base_url) = lookup(ENV_BASE_URL) {
            self.base_url = base_url;
        }
        if let Some(path) = lookup(ENV_DATABASE) {
            self.database_path = PathBuf::from(path);
        }

        let client_id = lookup(ENV_GITHUB_CLIENT_ID);
        let client_secret = lookup(ENV_GITHUB_CLIENT_SECRET);
        if client_id.is_some() || client_secret.is_some() {
            let github = self.github.get_or_insert_with(GitHubProviderConfig::default);
            if client_id.is_some() {
                github.client_id = client_id;
            }
            if client_secret.is_some() {
                github.client_secret = client_secret;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(AuthError::config("base_url must not be empty"));
        }
        url::Url::parse(&self.base_url)
            .map_err(|e| AuthError::config(format!("invalid base_url {:?}: {e}", self.base_url)))?;

        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.id.trim().is_empty() {
                return Err(AuthError::config("endpoint id must not be empty"));
            }
            if !seen.insert(endpoint.id.as_str()) {
                return Err(AuthError::config(format!(
                    "duplicate endpoint id {:?}",
                    endpoint.id
                )));
            }
            let has_urls = endpoint.authorization_url.is_some() && endpoint.token_url.is_some();
            if endpoint.issuer.is_none() && !has_urls {
                return Err(AuthError::config(format!(
                    "endpoint {:?} needs an issuer or both authorization_url and token_url",
                    endpoint.id
                )));
            }
        }
        Ok(())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn endpoint(&self, id: &str) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|e| e.id == id)
    }

    /// `{base_url}/oauth/callback`
    pub fn shared_redirect_url(&self) -> String {
        format!("{}/oauth/callback", self.base_url.trim_end_matches('/'))
    }

    /// `{base_url}/oauth/user/callback`
    pub fn user_redirect_url(&self) -> String {
        format!("{}/oauth/user/callback", self.base_url.trim_end_matches('/'))
    }

    /// Origin of `base_url`, used as the postMessage target origin.
    pub fn origin(&self) -> Result<String> {
        let url = url::Url::parse(&self.base_url)?;
        Ok(url.origin().ascii_serialization())
    }
}

/// A tool-serving endpoint authenticated with authorization code + PKCE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub id: String,
    pub name: String,
    /// Used for RFC 8414 discovery when explicit URLs are absent.
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub authorization_url: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub registration_url: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    /// RFC 8707 resource indicator.
    #[serde(default)]
    pub resource: Option<String>,
}

impl EndpointConfig {
    pub fn credentials(&self) -> Option<ClientCredentials> {
        self.client_id.as_ref().map(|client_id| ClientCredentials {
            client_id: client_id.clone(),
            client_secret: self.client_secret.clone(),
        })
    }
}

fn default_github_scope() -> String {
    "repo read:user".to_string()
}

fn default_device_code_url() -> String {
    "https://github.com/login/device/code".to_string()
}

fn default_github_token_url() -> String {
    "https://github.com/login/oauth/access_token".to_string()
}

fn default_userinfo_url() -> String {
    "https://api.github.com/user".to_string()
}

/// GitHub device-flow provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitHubProviderConfig {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_github_scope")]
    pub scope: String,
    #[serde(default = "default_device_code_url")]
    pub device_code_url: String,
    #[serde(default = "default_github_token_url")]
    pub token_url: String,
    #[serde(default = "default_userinfo_url")]
    pub userinfo_url: String,
}

impl Default for GitHubProviderConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            scope: default_github_scope(),
            device_code_url: default_device_code_url(),
            token_url: default_github_token_url(),
            userinfo_url: default_userinfo_url(),
        }
    }
}

impl GitHubProviderConfig {
    /// Fails with [`AuthError::Configuration`] when no client id is set.
    pub fn credentials(&self) -> Result<ClientCredentials> {
        let client_id = self
            .client_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AuthError::config("no GitHub client id configured"))?;
        Ok(ClientCredentials {
            client_id,
            client_secret: self.client_secret.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const SAMPLE: &str = r#"
        base_url = "https://keyward.example.com/"
        session_ttl_secs = 300

        [github]
        client_id = "gh-client"

        [[endpoints]]
        id = "linear"
        name = "Linear"
        issuer = "https://mcp.linear.app"

        [[endpoints]]
        id = "notion"
        name = "Notion"
        authorization_url = "https://notion.example.com/authorize"
        token_url = "https://notion.example.com/token"
        client_id = "notion-client"
    "#;

    #[test]
    fn parses_sample() {
        let config = AuthConfig::from_toml(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.session_ttl(), Duration::from_secs(300));
        assert_eq!(config.endpoints.len(), 2);

        let github = config.github.as_ref().unwrap();
        assert_eq!(github.scope, "repo read:user");
        assert_eq!(github.device_code_url, "https://github.com/login/device/code");

        let notion = config.endpoint("notion").unwrap();
        assert_eq!(notion.credentials().unwrap().client_id, "notion-client");
        assert!(config.endpoint("linear").unwrap().credentials().is_none());
    }

    #[test]
    fn redirect_urls_and_origin() {
        let config = AuthConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(
            config.shared_redirect_url(),
            "https://keyward.example.com/oauth/callback"
        );
        assert_eq!(
            config.user_redirect_url(),
            "https://keyward.example.com/oauth/user/callback"
        );
        assert_eq!(config.origin().unwrap(), "https://keyward.example.com");
    }

    #[test]
    fn defaults_when_empty() {
        let config = AuthConfig::from_toml("").unwrap();
        assert_eq!(config.session_ttl_secs, 600);
        assert!(config.github.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut config = AuthConfig::from_toml(SAMPLE).unwrap();
        let vars: HashMap<&str, &str> = HashMap::from([
            ("KEYWARD_BASE_URL", "http://localhost:9000"),
            ("GITHUB_CLIENT_SECRET", "shh"),
        ]);
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.base_url, "http://localhost:9000");
        let github = config.github.unwrap();
        assert_eq!(github.client_id.as_deref(), Some("gh-client"));
        assert_eq!(github.client_secret.as_deref(), Some("shh"));
    }

    #[test]
    fn github_override_creates_section() {
        let mut config = AuthConfig::default();
        config.apply_overrides(|name| (name == "GITHUB_CLIENT_ID").then(|| "id".to_string()));
        assert_eq!(config.github.unwrap().credentials().unwrap().client_id, "id");
    }

    #[test]
    fn rejects_duplicate_endpoint_ids() {
        let mut config = AuthConfig::from_toml(SAMPLE).unwrap();
        let dup = config.endpoints[0].clone();
        config.endpoints.push(dup);
        assert!(matches!(
            config.validate(),
            Err(AuthError::Configuration { .. })
        ));
    }

    #[test]
    fn rejects_endpoint_without_urls() {
        let config = AuthConfig::from_toml(
            r#"
            [[endpoints]]
            id = "bare"
            name = "Bare"
            token_url = "https://example.com/token"
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(AuthError::Configuration { .. })
        ));
    }

    #[test]
    fn rejects_empty_base_url() {
        let config = AuthConfig {
            base_url: " ".to_string(),
            ..AuthConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn github_credentials_require_client_id() {
        let github = GitHubProviderConfig::default();
        assert!(matches!(
            github.credentials(),
            Err(AuthError::Configuration { .. })
        ));
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuthConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.session_ttl_secs, 600);
    }
}
