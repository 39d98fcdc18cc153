//! OAuth credential lifecycle for the Google Workspace extension
//!
//! This crate obtains, persists and refreshes Google OAuth2 credentials for a
//! local tool server. The client secret never ships with the binary: a
//! trusted proxy performs the code exchange and token refresh, while this
//! crate runs the browser flow and stores the results.
//!
//! # Authentication Flow
//!
//! [`AuthCoordinator::get_authenticated_client`] looks for credentials in
//! this order:
//!
//! 1. The client cached in memory
//! 2. Credentials persisted in the OS keychain or the encrypted file
//! 3. An interactive browser flow that ends on a loopback listener
//!
//! # Example
//!
//! ```no_run
//! use gw_auth::{AuthCoordinator, GwAuthConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GwAuthConfig::from_env()?;
//!     let coordinator = AuthCoordinator::from_config(config);
//!
//!     // Opens the browser the first time, then reuses stored credentials
//!     let client = coordinator.get_authenticated_client().await?;
//!     println!("{:?}", client.authorization_header());
//!
//!     // Refreshes through the proxy when the token has expired
//!     let _token = coordinator.access_token().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Credential Storage
//!
//! All backends implement [`CredentialStore`].
//!
//! ```
//! use gw_auth::{Credential, CredentialStore, MemoryCredentialStore, OAuthToken};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = MemoryCredentialStore::new();
//! let token = OAuthToken::new(Some("access".to_string()), None, "Bearer", None, None)?;
//! store.set_credentials(&Credential::new("google-workspace-oauth", token)?).await?;
//!
//! assert!(store.get_credentials("google-workspace-oauth").await?.is_some());
//! # Ok(())
//! # }
//! # tokio_test::block_on(example()).unwrap();
//! ```
//!
//! [`HybridCredentialStore`] checks the keychain once and falls back to
//! [`FileCredentialStore`], which encrypts everything with AES-256-GCM under
//! a master key kept next to the token file with owner-only permissions.
//!
//! # Important Notes
//!
//! - Set `WORKSPACE_FORCE_FILE_STORAGE=true` to skip the keychain
//! - Tokens are never logged
//! - Concurrent processes writing the same token file are not coordinated

pub mod callback;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod crypto;
pub mod errors;
pub mod file_store;
pub mod hybrid_store;
pub mod key_manager;
pub mod keychain_store;
pub mod launcher;
pub mod store;

// Re-export main types
pub use callback::CallbackServer;
pub use client::{ClientCredentials, GwOAuthClient};
pub use config::GwAuthConfig;
pub use coordinator::{AuthCoordinator, AuthPhase, StatePayload};
pub use credentials::{Credential, OAuthToken};
pub use errors::{GwAuthError, Result};
pub use file_store::FileCredentialStore;
pub use hybrid_store::{HybridCredentialStore, StorageType};
pub use keychain_store::{KeychainBackend, KeychainCredentialStore, OsKeychain};
pub use launcher::{BrowserLauncher, Platform, ProcessSpawner, UrlOpener};
pub use store::{CredentialStore, MemoryCredentialStore, SecureCredentialStore};
