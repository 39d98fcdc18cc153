use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use crate::config::{GwAuthConfig, endpoints};
use crate::credentials::{DEFAULT_TOKEN_TYPE, OAuthToken};
use crate::errors::{GwAuthError, Result};

/// Token set installed on a [`GwOAuthClient`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Epoch millis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<i64>,
}

impl ClientCredentials {
    /// Convert to the persisted token schema
    pub fn to_token(&self) -> Result<OAuthToken> {
        OAuthToken::new(
            self.access_token.clone(),
            self.refresh_token.clone(),
            self.token_type
                .clone()
                .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string()),
            self.scope.clone(),
            self.expiry_date,
        )
    }
}

impl From<&OAuthToken> for ClientCredentials {
    fn from(token: &OAuthToken) -> Self {
        Self {
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone(),
            scope: token.scope.clone(),
            token_type: Some(token.token_type.clone()),
            expiry_date: token.expires_at,
        }
    }
}

/// Response of the proxy's refresh endpoint
#[derive(Debug, Clone, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expiry_date: Option<i64>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// OAuth2 client holding only the public client ID
///
/// The client secret lives in the trusted proxy, so the code exchange and
/// token refresh both go through it.
#[derive(Debug, Clone)]
pub struct GwOAuthClient {
    client_id: String,
    refresh_url: Url,
    credentials: ClientCredentials,
    http: Client,
}

impl GwOAuthClient {
    /// Create a new client shell without credentials
    pub fn new(config: &GwAuthConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(config.http_timeouts.connect)
            .timeout(config.http_timeouts.request)
            .user_agent(config.user_agent.as_deref().unwrap_or("gw-auth"))
            .build()?;

        Ok(Self {
            client_id: config.client_id.clone(),
            refresh_url: config.proxy_refresh_url()?,
            credentials: ClientCredentials::default(),
            http,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn credentials(&self) -> &ClientCredentials {
        &self.credentials
    }

    pub fn set_credentials(&mut self, credentials: ClientCredentials) {
        self.credentials = credentials;
    }

    pub fn has_refresh_token(&self) -> bool {
        self.credentials
            .refresh_token
            .as_deref()
            .is_some_and(|t| !t.is_empty())
    }

    /// `Authorization` header value for API calls
    pub fn authorization_header(&self) -> Option<String> {
        let token = self.credentials.access_token.as_deref()?;
        let token_type = self
            .credentials
            .token_type
            .as_deref()
            .unwrap_or(DEFAULT_TOKEN_TYPE);
        Some(format!("{} {}", token_type, token))
    }

    /// Build the authorization URL for the user to visit
    #[instrument(skip(self, state))]
    pub fn generate_auth_url(
        &self,
        redirect_uri: &Url,
        scopes: &[String],
        state: &str,
    ) -> Result<Url> {
        let mut url = Url::parse(endpoints::GOOGLE_AUTHORIZE)?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", redirect_uri.as_str())
            .append_pair("response_type", "code")
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("scope", &scopes.join(" "))
            .append_pair("state", state);

        debug!("Built authorization URL for {} scope(s)", scopes.len());
        Ok(url)
    }

    /// Exchange the refresh token for a new access token via the proxy.
    ///
    /// The returned set keeps the current refresh token and scope when the
    /// proxy does not send new ones. The client itself is not modified.
    #[instrument(skip(self))]
    pub async fn refresh_access_token(&self) -> Result<ClientCredentials> {
        let refresh_token = self
            .credentials
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(GwAuthError::MissingRefreshToken)?;

        debug!("Refreshing access token");
        let response = self
            .http
            .post(self.refresh_url.clone())
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GwAuthError::Http {
                status,
                body_snippet: body.chars().take(200).collect(),
            });
        }

        let refreshed: RefreshResponse = response.json().await?;
        let expiry_date = refreshed.expiry_date.or_else(|| {
            refreshed
                .expires_in
                .map(|secs| Utc::now().timestamp_millis() + secs * 1000)
        });

        Ok(ClientCredentials {
            access_token: Some(refreshed.access_token),
            refresh_token: refreshed
                .refresh_token
                .or_else(|| self.credentials.refresh_token.clone()),
            scope: refreshed.scope.or_else(|| self.credentials.scope.clone()),
            token_type: refreshed
                .token_type
                .or_else(|| self.credentials.token_type.clone()),
            expiry_date,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(proxy: &str) -> GwAuthConfig {
        let mut config = GwAuthConfig::from_lookup(|_| None).unwrap();
        config.proxy_base = Url::parse(proxy).unwrap();
        config.client_id = "client-123".to_string();
        config
    }

    fn client_with_refresh(proxy: &str, refresh: Option<&str>) -> GwOAuthClient {
        let mut client = GwOAuthClient::new(&test_config(proxy)).unwrap();
        client.set_credentials(ClientCredentials {
            access_token: Some("old-access".to_string()),
            refresh_token: refresh.map(str::to_string),
            scope: Some("scope.a".to_string()),
            token_type: Some("Bearer".to_string()),
            expiry_date: Some(0),
        });
        client
    }

    #[test]
    fn test_generate_auth_url() {
        let client = GwOAuthClient::new(&test_config("https://proxy.test")).unwrap();
        let redirect = Url::parse("https://proxy.test/callback").unwrap();
        let scopes = vec!["scope.a".to_string(), "scope.b".to_string()];

        let url = client.generate_auth_url(&redirect, &scopes, "c3RhdGU=").unwrap();
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert!(url.as_str().starts_with(endpoints::GOOGLE_AUTHORIZE));
        assert_eq!(params["client_id"], "client-123");
        assert_eq!(params["redirect_uri"], "https://proxy.test/callback");
        assert_eq!(params["access_type"], "offline");
        assert_eq!(params["prompt"], "consent");
        assert_eq!(params["scope"], "scope.a scope.b");
        assert_eq!(params["state"], "c3RhdGU=");
        assert!(!params.contains_key("client_secret"));
    }

    #[test]
    fn test_credentials_token_conversion() {
        let credentials = ClientCredentials {
            access_token: Some("tok".to_string()),
            refresh_token: None,
            scope: Some("scope.a".to_string()),
            token_type: None,
            expiry_date: Some(42),
        };

        let token = credentials.to_token().unwrap();
        assert_eq!(token.token_type, DEFAULT_TOKEN_TYPE);
        assert_eq!(token.expires_at, Some(42));

        let back = ClientCredentials::from(&token);
        assert_eq!(back.access_token.as_deref(), Some("tok"));
        assert_eq!(back.token_type.as_deref(), Some(DEFAULT_TOKEN_TYPE));

        assert!(ClientCredentials::default().to_token().is_err());
    }

    #[test]
    fn test_authorization_header() {
        let client = client_with_refresh("https://proxy.test", None);
        assert_eq!(
            client.authorization_header().as_deref(),
            Some("Bearer old-access")
        );
        assert!(!client.has_refresh_token());
    }

    #[tokio::test]
    async fn test_refresh_keeps_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/refreshToken"))
            .and(body_json(serde_json::json!({ "refresh_token": "refresh-1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access",
                "expiry_date": 1_900_000_000_000i64,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_with_refresh(&server.uri(), Some("refresh-1"));
        let refreshed = client.refresh_access_token().await.unwrap();

        assert_eq!(refreshed.access_token.as_deref(), Some("new-access"));
        assert_eq!(refreshed.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(refreshed.scope.as_deref(), Some("scope.a"));
        assert_eq!(refreshed.expiry_date, Some(1_900_000_000_000));
    }

    #[tokio::test]
    async fn test_refresh_with_expires_in() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/refreshToken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access",
                "expires_in": 3600,
                "refresh_token": "refresh-2"
            })))
            .mount(&server)
            .await;

        let before = Utc::now().timestamp_millis();
        let client = client_with_refresh(&server.uri(), Some("refresh-1"));
        let refreshed = client.refresh_access_token().await.unwrap();

        assert_eq!(refreshed.refresh_token.as_deref(), Some("refresh-2"));
        let expiry = refreshed.expiry_date.unwrap();
        assert!(expiry >= before + 3_600_000);
    }

    #[tokio::test]
    async fn test_refresh_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/refreshToken"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let client = client_with_refresh(&server.uri(), Some("refresh-1"));
        let result = client.refresh_access_token().await;

        match result {
            Err(GwAuthError::Http {
                status,
                body_snippet,
            }) => {
                assert_eq!(status.as_u16(), 400);
                assert_eq!(body_snippet, "invalid_grant");
            }
            other => panic!("Expected Http error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token() {
        let client = client_with_refresh("https://proxy.test", None);
        let result = client.refresh_access_token().await;
        assert!(matches!(result, Err(GwAuthError::MissingRefreshToken)));
    }
}
