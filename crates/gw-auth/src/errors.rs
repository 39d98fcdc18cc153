use thiserror::Error;

/// Google Workspace credential and OAuth flow error types
#[derive(Error, Debug)]
pub enum GwAuthError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unsupported platform for opening a browser: {0}")]
    UnsupportedPlatform(String),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("No credentials found for server '{0}'")]
    CredentialsNotFound(String),

    #[error("Invalid encrypted data format")]
    InvalidFormat,

    #[error("Decryption failed - authentication tag mismatch (tampered data or wrong key)")]
    DecryptionFailed,

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Master key file is corrupted: {0}")]
    CorruptedMasterKey(String),

    #[error("Keychain error: {0}")]
    Keychain(String),

    #[error("Keychain is not available on this system")]
    KeychainUnavailable,

    #[error("OAuth state mismatch - possible CSRF attack")]
    CsrfMismatch,

    #[error("Google OAuth error: {code}. {description}")]
    Provider { code: String, description: String },

    #[error("OAuth callback did not include an access token and expiry date")]
    MissingTokens,

    #[error("Unexpected request to OAuth callback server: {0}")]
    UnexpectedRequest(String),

    #[error(
        "Authorization timed out after {timeout:?}. If the browser tab is stuck, close it and try again"
    )]
    AuthTimeout { timeout: std::time::Duration },

    #[error("Unsafe protocol '{0}' - only http and https URLs can be opened")]
    UnsafeProtocol(String),

    #[error("URL contains invalid characters")]
    InvalidUrlCharacters,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to open browser: {0}")]
    BrowserLaunch(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP error {status}: {body_snippet}")]
    Http {
        status: reqwest::StatusCode,
        body_snippet: String,
    },

    #[error("Missing refresh token - cannot refresh access token")]
    MissingRefreshToken,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("OAuth callback server failed: {0}")]
    CallbackServer(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

pub type Result<T> = std::result::Result<T, GwAuthError>;
