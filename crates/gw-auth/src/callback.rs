use std::collections::HashMap;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, instrument, warn};

use crate::client::ClientCredentials;
use crate::config::endpoints::LOOPBACK_CALLBACK_PATH;
use crate::errors::{GwAuthError, Result};

const MAX_REQUEST_BYTES: usize = 16 * 1024;

const SUCCESS_PAGE: &str = "<html><body><h1>Authentication successful</h1><p>You can close this window and return to your terminal.</p></body></html>";
const FAILURE_PAGE: &str = "<html><body><h1>Authentication failed</h1><p>You can close this window and check your terminal for details.</p></body></html>";

/// Ask the OS for a free port by binding port 0 and releasing it
pub async fn find_available_port(host: &str) -> Result<u16> {
    let listener = TcpListener::bind((host, 0)).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Loopback listener that serves exactly one OAuth callback
///
/// The listener is bound on construction, so it accepts connections before
/// any browser is pointed at it. [`CallbackServer::wait_for_tokens`]
/// consumes the server and the port is released when it returns, whatever
/// the outcome.
#[derive(Debug)]
pub struct CallbackServer {
    listener: TcpListener,
    host: String,
    port: u16,
}

impl CallbackServer {
    #[instrument]
    pub async fn bind(host: &str, port: u16) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).await.map_err(|e| {
            GwAuthError::CallbackServer(format!("Failed to listen on {}:{}: {}", host, port, e))
        })?;
        let port = listener.local_addr()?.port();
        debug!("OAuth callback server listening on {}:{}", host, port);

        Ok(Self {
            listener,
            host: host.to_string(),
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Where the proxy should forward the final tokens
    pub fn redirect_uri(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, LOOPBACK_CALLBACK_PATH)
    }

    /// Accept one request and turn it into credentials.
    ///
    /// The `state` parameter must equal `csrf_token` exactly.
    pub async fn wait_for_tokens(self, csrf_token: String) -> Result<ClientCredentials> {
        let (mut stream, peer) = self.listener.accept().await.map_err(|e| {
            GwAuthError::CallbackServer(format!("Failed to accept connection: {}", e))
        })?;
        debug!("OAuth callback connection from {}", peer);

        let outcome = match read_request_target(&mut stream).await {
            Ok(target) => handle_callback(&target, &csrf_token),
            Err(e) => Err(e),
        };

        let page = if outcome.is_ok() { SUCCESS_PAGE } else { FAILURE_PAGE };
        let status = if outcome.is_ok() { "200 OK" } else { "400 Bad Request" };
        if let Err(e) = respond(&mut stream, status, page).await {
            warn!("Failed to answer OAuth callback request: {}", e);
        }

        outcome
    }
}

/// Read up to the end of the headers and return the request target
async fn read_request_target(stream: &mut TcpStream) -> Result<String> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
        if buffer.windows(4).any(|w| w == b"\r\n\r\n") || buffer.len() >= MAX_REQUEST_BYTES {
            break;
        }
    }

    let request = String::from_utf8_lossy(&buffer);
    let request_line = request
        .lines()
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| GwAuthError::UnexpectedRequest("empty request".to_string()))?;

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();

    if method != "GET" {
        return Err(GwAuthError::UnexpectedRequest(format!(
            "{} {}",
            method, target
        )));
    }

    Ok(target.to_string())
}

fn handle_callback(target: &str, csrf_token: &str) -> Result<ClientCredentials> {
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    if path != LOOPBACK_CALLBACK_PATH {
        return Err(GwAuthError::UnexpectedRequest(path.to_string()));
    }

    let params: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();

    if params.get("state").map(String::as_str) != Some(csrf_token) {
        return Err(GwAuthError::CsrfMismatch);
    }

    if let Some(code) = params.get("error") {
        return Err(GwAuthError::Provider {
            code: code.clone(),
            description: params
                .get("error_description")
                .cloned()
                .unwrap_or_else(|| "No additional details provided".to_string()),
        });
    }

    let non_empty = |key: &str| params.get(key).filter(|v| !v.is_empty()).cloned();

    let (Some(access_token), Some(expiry_raw)) =
        (non_empty("access_token"), non_empty("expiry_date"))
    else {
        return Err(GwAuthError::MissingTokens);
    };

    let expiry_date: i64 = expiry_raw.parse().map_err(|_| {
        GwAuthError::InvalidResponse(format!("expiry_date is not a number: {}", expiry_raw))
    })?;

    Ok(ClientCredentials {
        access_token: Some(access_token),
        refresh_token: non_empty("refresh_token"),
        scope: non_empty("scope"),
        token_type: non_empty("token_type"),
        expiry_date: Some(expiry_date),
    })
}

async fn respond(stream: &mut TcpStream, status: &str, body: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
