use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::TOKEN_EXPIRY_SKEW;
use crate::errors::{GwAuthError, Result};

pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// OAuth token as persisted by the credential stores
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OAuthToken {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_type: String,
    /// Space separated list of granted scopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Epoch millis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl OAuthToken {
    /// Build a token, enforcing that at least one token value is present
    pub fn new(
        access_token: Option<String>,
        refresh_token: Option<String>,
        token_type: impl Into<String>,
        scope: Option<String>,
        expires_at: Option<i64>,
    ) -> Result<Self> {
        let token = Self {
            access_token,
            refresh_token,
            token_type: token_type.into(),
            scope,
            expires_at,
        };
        token.validate()?;
        Ok(token)
    }

    pub fn validate(&self) -> Result<()> {
        let present = |t: &Option<String>| t.as_deref().is_some_and(|t| !t.is_empty());
        if !present(&self.access_token) && !present(&self.refresh_token) {
            return Err(GwAuthError::InvalidCredentials(
                "token must contain an access token or a refresh token".to_string(),
            ));
        }
        if self.token_type.trim().is_empty() {
            return Err(GwAuthError::InvalidCredentials(
                "token type is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the access token is missing or expires within the skew window.
    /// Tokens without an expiry are treated as still valid.
    pub fn is_expired(&self) -> bool {
        if self.access_token.is_none() {
            return true;
        }
        match self.expires_at {
            Some(expires_at) => {
                let skew = TOKEN_EXPIRY_SKEW.as_millis() as i64;
                Utc::now().timestamp_millis() + skew >= expires_at
            }
            None => false,
        }
    }

    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scope.as_deref().unwrap_or_default().split_whitespace()
    }

    /// Required scopes that this token was not granted
    pub fn missing_scopes<'a, S: AsRef<str>>(&self, required: &'a [S]) -> Vec<&'a str> {
        required
            .iter()
            .map(AsRef::as_ref)
            .filter(|needed| !self.scopes().any(|granted| granted == *needed))
            .collect()
    }
}

/// One authorization record per logical server/account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub server_name: String,
    pub token: OAuthToken,
    /// Epoch millis of the last write
    pub updated_at: i64,
}

impl Credential {
    /// Create a validated credential stamped with the current time
    pub fn new(server_name: impl Into<String>, token: OAuthToken) -> Result<Self> {
        let credential = Self {
            server_name: server_name.into(),
            token,
            updated_at: Utc::now().timestamp_millis(),
        };
        credential.validate()?;
        Ok(credential)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_name.trim().is_empty() {
            return Err(GwAuthError::InvalidCredentials(
                "server name is required".to_string(),
            ));
        }
        self.token.validate()
    }
}

/// Replace characters that storage backends may reject with `_`
pub fn sanitize_server_name(server_name: &str) -> String {
    server_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
