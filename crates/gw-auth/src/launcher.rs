//! Opens URLs in the user's default browser without going through a shell.
//!
//! Every launch strategy produces an argument vector. The only string that
//! is ever interpreted is the PowerShell `Start-Process` literal on Windows.
//! Commands are built from the serialized [`Url`], which is percent-encoded
//! ASCII, so the ASCII `'` is the only quote that can reach the literal and
//! it is doubled.

use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::errors::{GwAuthError, Result};

const ALLOWED_SCHEMES: &[&str] = &["http", "https"];

/// Anything that can show a URL to the user
#[async_trait::async_trait]
pub trait UrlOpener: Send + Sync {
    async fn open(&self, url: &str) -> Result<()>;
}

/// One program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchCommand {
    fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Runs a [`LaunchCommand`] to completion
#[async_trait::async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Fails on spawn errors and on a non-zero exit status
    async fn run(&self, command: &LaunchCommand) -> Result<()>;
}

/// Spawns real processes with `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSpawner;

#[async_trait::async_trait]
impl ProcessSpawner for SystemSpawner {
    async fn run(&self, command: &LaunchCommand) -> Result<()> {
        let status = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| GwAuthError::BrowserLaunch(format!("{}: {}", command.program, e)))?;

        if !status.success() {
            return Err(GwAuthError::BrowserLaunch(format!(
                "{} exited with {}",
                command.program, status
            )));
        }
        Ok(())
    }
}

/// Launch strategy per host platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Platform {
    MacOs,
    Windows,
    Linux,
    Unsupported(String),
}

impl Platform {
    pub fn current() -> Self {
        Self::from_os(std::env::consts::OS)
    }

    pub fn from_os(os: &str) -> Self {
        match os {
            "macos" => Platform::MacOs,
            "windows" => Platform::Windows,
            "linux" => Platform::Linux,
            other => Platform::Unsupported(other.to_string()),
        }
    }

    /// Commands to try in order until one succeeds
    pub fn launch_commands(&self, url: &str) -> Result<Vec<LaunchCommand>> {
        match self {
            Platform::MacOs => Ok(vec![LaunchCommand::new("open", [url])]),
            Platform::Windows => Ok(vec![LaunchCommand::new(
                "powershell.exe",
                [
                    "-NoProfile".to_string(),
                    "-NonInteractive".to_string(),
                    "-WindowStyle".to_string(),
                    "Hidden".to_string(),
                    "-Command".to_string(),
                    format!("Start-Process '{}'", url.replace('\'', "''")),
                ],
            )]),
            Platform::Linux => Ok(vec![
                LaunchCommand::new("xdg-open", [url]),
                LaunchCommand::new("gnome-open", [url]),
            ]),
            Platform::Unsupported(os) => Err(GwAuthError::UnsupportedPlatform(os.clone())),
        }
    }
}

/// Reject anything but a plain http(s) URL.
///
/// Control characters are checked on the raw input because URL parsing
/// silently strips tabs and newlines.
pub fn validate_url(url: &str) -> Result<Url> {
    if url.chars().any(char::is_control) {
        return Err(GwAuthError::InvalidUrlCharacters);
    }

    let parsed = Url::parse(url).map_err(|e| GwAuthError::InvalidUrl(e.to_string()))?;

    if !ALLOWED_SCHEMES.contains(&parsed.scheme()) {
        return Err(GwAuthError::UnsafeProtocol(format!("{}:", parsed.scheme())));
    }

    Ok(parsed)
}

/// Opens URLs in the default browser
#[derive(Clone)]
pub struct BrowserLauncher {
    platform: Platform,
    spawner: Arc<dyn ProcessSpawner>,
}

impl Default for BrowserLauncher {
    fn default() -> Self {
        Self::new(Platform::current(), Arc::new(SystemSpawner))
    }
}

impl std::fmt::Debug for BrowserLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserLauncher")
            .field("platform", &self.platform)
            .finish()
    }
}

impl BrowserLauncher {
    pub fn new(platform: Platform, spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self { platform, spawner }
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }
}

#[async_trait::async_trait]
impl UrlOpener for BrowserLauncher {
    #[instrument(skip(self, url))]
    async fn open(&self, url: &str) -> Result<()> {
        let parsed = validate_url(url)?;
        let commands = self.platform.launch_commands(parsed.as_str())?;

        let mut failures = Vec::new();
        for command in &commands {
            match self.spawner.run(command).await {
                Ok(()) => {
                    debug!("Opened browser with {}", command.program);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Browser launcher {} failed: {}", command.program, e);
                    failures.push(e.to_string());
                }
            }
        }

        Err(GwAuthError::BrowserLaunch(failures.join("; ")))
    }
}
