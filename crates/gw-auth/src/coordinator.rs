use std::fmt;
use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::callback::{self, CallbackServer};
use crate::client::{ClientCredentials, GwOAuthClient};
use crate::config::GwAuthConfig;
use crate::credentials::Credential;
use crate::errors::{GwAuthError, Result};
use crate::hybrid_store::HybridCredentialStore;
use crate::launcher::{BrowserLauncher, UrlOpener};
use crate::store::CredentialStore;

const CSRF_TOKEN_BYTES: usize = 32;

/// Position in the authorization state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    NoClient,
    CheckingCache,
    CheckingPersisted,
    AwaitingUserAuth,
    Persisting,
    Ready,
    Failed,
}

/// Payload carried in the `state` parameter of the authorization URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatePayload {
    /// Loopback URI, only when a browser on this machine will finish the flow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    pub manual: bool,
    pub csrf_token: String,
}

impl StatePayload {
    pub fn encode(&self) -> Result<String> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(state: &str) -> Result<Self> {
        let json = STANDARD
            .decode(state)
            .map_err(|e| GwAuthError::InvalidResponse(format!("Invalid state payload: {}", e)))?;
        Ok(serde_json::from_slice(&json)?)
    }
}

/// 32 random bytes, hex encoded
pub fn generate_csrf_token() -> Result<String> {
    let mut bytes = [0u8; CSRF_TOKEN_BYTES];
    getrandom::fill(&mut bytes)
        .map_err(|e| GwAuthError::Crypto(format!("Failed to generate CSRF token: {}", e)))?;
    Ok(hex::encode(bytes))
}

/// Produces authenticated clients for the Workspace API tools
///
/// Lookup order: in-memory client, persisted credentials, interactive
/// browser flow. The in-memory client lives as long as the coordinator and
/// the check-then-set runs under one lock, so concurrent callers share a
/// single interactive flow.
pub struct AuthCoordinator {
    config: GwAuthConfig,
    store: Arc<dyn CredentialStore>,
    opener: Arc<dyn UrlOpener>,
    cached: Mutex<Option<GwOAuthClient>>,
    phase: std::sync::Mutex<AuthPhase>,
}

impl fmt::Debug for AuthCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCoordinator")
            .field("config", &self.config)
            .field("phase", &self.phase())
            .finish()
    }
}

impl AuthCoordinator {
    pub fn new(
        config: GwAuthConfig,
        store: Arc<dyn CredentialStore>,
        opener: Arc<dyn UrlOpener>,
    ) -> Self {
        Self {
            config,
            store,
            opener,
            cached: Mutex::new(None),
            phase: std::sync::Mutex::new(AuthPhase::NoClient),
        }
    }

    /// Hybrid keychain/file storage and the system browser
    pub fn from_config(config: GwAuthConfig) -> Self {
        let store = Arc::new(HybridCredentialStore::from_config(&config));
        Self::new(config, store, Arc::new(BrowserLauncher::default()))
    }

    pub fn config(&self) -> &GwAuthConfig {
        &self.config
    }

    pub fn phase(&self) -> AuthPhase {
        self.phase
            .lock()
            .map(|phase| *phase)
            .unwrap_or(AuthPhase::Failed)
    }

    fn set_phase(&self, next: AuthPhase) {
        if let Ok(mut phase) = self.phase.lock() {
            debug!("Auth phase {:?} -> {:?}", *phase, next);
            *phase = next;
        }
    }

    /// Return a client with usable credentials, authenticating if needed
    #[instrument(skip(self))]
    pub async fn get_authenticated_client(&self) -> Result<GwOAuthClient> {
        let mut cached = self.cached.lock().await;

        self.set_phase(AuthPhase::CheckingCache);
        if let Some(client) = cached.as_ref()
            && client.has_refresh_token()
        {
            debug!("Using cached OAuth client");
            self.set_phase(AuthPhase::Ready);
            return Ok(client.clone());
        }

        self.set_phase(AuthPhase::CheckingPersisted);
        if let Some(client) = self.load_persisted().await? {
            *cached = Some(client.clone());
            self.set_phase(AuthPhase::Ready);
            return Ok(client);
        }

        self.set_phase(AuthPhase::AwaitingUserAuth);
        let credentials = match self.authenticate_interactively().await {
            Ok(credentials) => credentials,
            Err(e) => {
                self.set_phase(AuthPhase::Failed);
                return Err(e);
            }
        };

        self.set_phase(AuthPhase::Persisting);
        let mut client = GwOAuthClient::new(&self.config)?;
        if let Err(e) = self.persist(&credentials).await {
            self.set_phase(AuthPhase::Failed);
            return Err(e);
        }
        client.set_credentials(credentials);

        info!("OAuth authentication complete");
        *cached = Some(client.clone());
        self.set_phase(AuthPhase::Ready);
        Ok(client)
    }

    /// Current access token, refreshed through the proxy when expired
    #[instrument(skip(self))]
    pub async fn access_token(&self) -> Result<String> {
        let client = self.get_authenticated_client().await?;
        let token = client.credentials().to_token()?;

        if !token.is_expired()
            && let Some(access_token) = token.access_token
        {
            return Ok(access_token);
        }

        let refreshed = client.refresh_access_token().await?;
        self.persist(&refreshed).await?;

        let access_token = refreshed
            .access_token
            .clone()
            .ok_or_else(|| {
                GwAuthError::InvalidResponse("Refresh returned no access token".to_string())
            })?;

        let mut updated = client;
        updated.set_credentials(refreshed);
        *self.cached.lock().await = Some(updated);

        debug!("Access token refreshed");
        Ok(access_token)
    }

    /// Forget the in-memory client and delete the stored credentials
    #[instrument(skip(self))]
    pub async fn clear_auth(&self) -> Result<()> {
        let mut cached = self.cached.lock().await;
        *cached = None;

        match self.store.delete_credentials(&self.config.server_name).await {
            Ok(()) | Err(GwAuthError::CredentialsNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        self.set_phase(AuthPhase::NoClient);
        info!("Cleared stored OAuth credentials");
        Ok(())
    }

    /// Load stored credentials that cover every required scope.
    ///
    /// Read failures are treated as "no credentials". Credentials missing a
    /// required scope fail the check and are deleted so the caller
    /// re-authenticates.
    async fn load_persisted(&self) -> Result<Option<GwOAuthClient>> {
        let server_name = &self.config.server_name;

        let stored = match self.store.get_credentials(server_name).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                debug!("No stored credentials");
                return Ok(None);
            }
            Err(e) => {
                warn!("Failed to load stored credentials: {}", e);
                return Ok(None);
            }
        };

        let missing = stored.token.missing_scopes(&self.config.scopes);
        if !missing.is_empty() {
            info!(
                "Stored credentials lack {} required scope(s), re-authenticating",
                missing.len()
            );
            debug!("Missing scopes: {:?}", missing);
            self.set_phase(AuthPhase::Failed);
            if let Err(e) = self.store.delete_credentials(server_name).await {
                warn!("Failed to delete under-scoped credentials: {}", e);
            }
            return Ok(None);
        }

        let mut client = GwOAuthClient::new(&self.config)?;
        client.set_credentials(ClientCredentials::from(&stored.token));
        debug!("Loaded stored credentials");
        Ok(Some(client))
    }

    /// Run the browser flow and wait for the loopback callback
    async fn authenticate_interactively(&self) -> Result<ClientCredentials> {
        let host = &self.config.callback_host;
        let port = match self.config.callback_port {
            Some(port) => port,
            None => callback::find_available_port(host).await?,
        };

        let csrf_token = generate_csrf_token()?;

        // Bound before the browser is launched
        let server = CallbackServer::bind(host, port).await?;

        let launch_browser = self.config.launch_browser;
        let state = StatePayload {
            redirect_uri: launch_browser.then(|| server.redirect_uri()),
            manual: !launch_browser,
            csrf_token: csrf_token.clone(),
        };

        let client = GwOAuthClient::new(&self.config)?;
        let auth_url = client.generate_auth_url(
            &self.config.proxy_callback_url()?,
            &self.config.scopes,
            &state.encode()?,
        )?;

        let mut callback = tokio::spawn(server.wait_for_tokens(csrf_token));

        if launch_browser {
            info!("Opening browser for Google sign-in");
            if let Err(e) = self.opener.open(auth_url.as_str()).await {
                warn!(url = %auth_url, "{}. Visit the URL to sign in", e);
            }
        } else {
            info!(url = %auth_url, "No graphical browser available. Visit the URL to sign in");
        }

        match tokio::time::timeout(self.config.auth_timeout, &mut callback).await {
            Ok(joined) => joined.map_err(|e| GwAuthError::CallbackServer(e.to_string()))?,
            Err(_) => {
                // Dropping the task drops the listener
                callback.abort();
                Err(GwAuthError::AuthTimeout {
                    timeout: self.config.auth_timeout,
                })
            }
        }
    }

    async fn persist(&self, credentials: &ClientCredentials) -> Result<()> {
        let credential = Credential::new(&self.config.server_name, credentials.to_token()?)?;
        self.store.set_credentials(&credential).await
    }
}
