use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

use crate::errors::{GwAuthError, Result};

/// Google and proxy endpoints
pub mod endpoints {
    pub const GOOGLE_AUTHORIZE: &str = "https://accounts.google.com/o/oauth2/v2/auth";

    /// Trusted intermediary that holds the client secret. Google redirects to
    /// it, and it forwards the final tokens to the loopback listener.
    pub const DEFAULT_PROXY_BASE: &str = "https://google-workspace-extension.geminicli.com";
    pub const PROXY_CALLBACK: &str = "callback";
    pub const PROXY_REFRESH: &str = "refreshToken";

    /// Path served by the local loopback listener
    pub const LOOPBACK_CALLBACK_PATH: &str = "/oauth2callback";
}

/// Environment variable names
pub mod env {
    pub const CALLBACK_PORT: &str = "OAUTH_CALLBACK_PORT";
    pub const CALLBACK_HOST: &str = "OAUTH_CALLBACK_HOST";
    pub const FORCE_FILE_STORAGE: &str = "WORKSPACE_FORCE_FILE_STORAGE";
    pub const CLIENT_ID: &str = "WORKSPACE_CLIENT_ID";
    pub const PROXY_URL: &str = "WORKSPACE_OAUTH_PROXY_URL";
}

/// Public OAuth client ID. No client secret is ever embedded.
pub const DEFAULT_CLIENT_ID: &str = "PLACEHOLDER_CLIENT_ID.apps.googleusercontent.com";

pub const DEFAULT_CALLBACK_HOST: &str = "localhost";

/// Key under which the workspace account is stored
pub const DEFAULT_SERVER_NAME: &str = "google-workspace-oauth";

pub const TOKEN_FILE_NAME: &str = "credentials.enc";
pub const MASTER_KEY_FILE_NAME: &str = "master.key";

/// How long the user has to finish the consent screen
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Time skew for token expiration (refresh 5 minutes early)
pub const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(300);

/// Scopes requested for the Workspace tools
pub const DEFAULT_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/documents",
    "https://www.googleapis.com/auth/drive",
    "https://www.googleapis.com/auth/calendar",
    "https://www.googleapis.com/auth/chat.spaces",
    "https://www.googleapis.com/auth/chat.messages",
    "https://www.googleapis.com/auth/chat.memberships",
    "https://www.googleapis.com/auth/userinfo.profile",
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/directory.readonly",
    "https://www.googleapis.com/auth/presentations.readonly",
    "https://www.googleapis.com/auth/spreadsheets.readonly",
];

/// Browsers that cannot complete a graphical consent screen
const TEXT_ONLY_BROWSERS: &[&str] = &["www-browser"];

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpTimeouts {
    pub connect: Duration,
    pub request: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            request: Duration::from_secs(30),
        }
    }
}

/// Configuration for the credential stores and the authorization flow
#[derive(Debug, Clone)]
pub struct GwAuthConfig {
    /// Public OAuth client ID
    pub client_id: String,

    /// Scopes every session must hold
    pub scopes: Vec<String>,

    /// Storage key for the account credentials
    pub server_name: String,

    /// Host the loopback listener binds to
    pub callback_host: String,

    /// Fixed loopback port, `None` picks an ephemeral one
    pub callback_port: Option<u16>,

    /// Skip the keychain check and always use the encrypted file
    pub force_file_storage: bool,

    /// Whether a graphical browser can be launched
    pub launch_browser: bool,

    /// Base URL of the trusted token proxy
    pub proxy_base: Url,

    /// Encrypted credential map
    pub token_path: PathBuf,

    /// Master key used to encrypt the credential map
    pub master_key_path: PathBuf,

    /// Upper bound for the interactive flow
    pub auth_timeout: Duration,

    pub http_timeouts: HttpTimeouts,

    pub user_agent: Option<String>,
}

impl GwAuthConfig {
    /// Build a config from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let storage_dir = default_storage_dir()?;

        let callback_port = match lookup(env::CALLBACK_PORT) {
            Some(raw) => Some(parse_callback_port(&raw)?),
            None => None,
        };

        let callback_host = lookup(env::CALLBACK_HOST)
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CALLBACK_HOST.to_string());

        let proxy_base = match lookup(env::PROXY_URL) {
            Some(raw) => Url::parse(&raw).map_err(|e| {
                GwAuthError::InvalidConfig(format!("{} is not a valid URL: {}", env::PROXY_URL, e))
            })?,
            None => Url::parse(endpoints::DEFAULT_PROXY_BASE)?,
        };

        Ok(Self {
            client_id: lookup(env::CLIENT_ID).unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            server_name: DEFAULT_SERVER_NAME.to_string(),
            callback_host,
            callback_port,
            force_file_storage: lookup(env::FORCE_FILE_STORAGE).as_deref() == Some("true"),
            launch_browser: should_launch_browser(&lookup, std::env::consts::OS),
            proxy_base,
            token_path: storage_dir.join(TOKEN_FILE_NAME),
            master_key_path: storage_dir.join(MASTER_KEY_FILE_NAME),
            auth_timeout: AUTH_TIMEOUT,
            http_timeouts: HttpTimeouts::default(),
            user_agent: Some("gw-auth".to_string()),
        })
    }

    /// Point both persisted files at `dir`
    pub fn with_storage_dir(mut self, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        self.token_path = dir.join(TOKEN_FILE_NAME);
        self.master_key_path = dir.join(MASTER_KEY_FILE_NAME);
        self
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Redirect URI registered with Google (the proxy, never the loopback)
    pub fn proxy_callback_url(&self) -> Result<Url> {
        proxy_url(&self.proxy_base, endpoints::PROXY_CALLBACK)
    }

    pub fn proxy_refresh_url(&self) -> Result<Url> {
        proxy_url(&self.proxy_base, endpoints::PROXY_REFRESH)
    }
}

fn proxy_url(base: &Url, path: &str) -> Result<Url> {
    let base = base.as_str().trim_end_matches('/');
    Ok(Url::parse(&format!("{}/{}", base, path))?)
}

/// Get default storage directory for the current platform
pub fn default_storage_dir() -> Result<PathBuf> {
    let project_dirs = directories::ProjectDirs::from("", "", "google-workspace-extension")
        .ok_or_else(|| {
            GwAuthError::InvalidConfig("Could not determine data directory".to_string())
        })?;

    Ok(project_dirs.data_dir().to_path_buf())
}

/// Validate an `OAUTH_CALLBACK_PORT` value
pub fn parse_callback_port(raw: &str) -> Result<u16> {
    let invalid = || {
        GwAuthError::InvalidConfig(format!(
            "{} must be an integer between 1 and 65535, got '{}'",
            env::CALLBACK_PORT,
            raw
        ))
    };

    let port: u32 = raw.trim().parse().map_err(|_| invalid())?;
    if port == 0 || port > u16::MAX as u32 {
        return Err(invalid());
    }

    Ok(port as u16)
}

/// Decide whether a graphical browser is likely to be usable
pub fn should_launch_browser<F>(lookup: &F, os: &str) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(browser) = lookup("BROWSER")
        && TEXT_ONLY_BROWSERS.contains(&browser.as_str())
    {
        return false;
    }

    if lookup("CI").is_some() || lookup("DEBIAN_FRONTEND").as_deref() == Some("noninteractive") {
        return false;
    }

    let is_ssh = lookup("SSH_CONNECTION").is_some();

    if os == "linux" {
        return ["DISPLAY", "WAYLAND_DISPLAY", "MIR_SOCKET"]
            .iter()
            .any(|var| lookup(var).is_some());
    }

    !is_ssh
}
