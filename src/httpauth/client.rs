//! HTTP client that signs every request with the visor key.
//!
//! Each request carries `SW-Public`, `SW-Nonce` and `SW-Sig` headers. The
//! signature covers the body followed by the decimal nonce. The nonce is
//! fetched from `/security/nonces/{pk}` and advances after every successful
//! call; when the service reports a stale nonce it is refetched and the
//! request is retried once.

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::{AuthError, NONCE_MISMATCH_MESSAGE};
use crate::crypto::{Keypair, PubKey};

/// Header carrying the caller's public key.
pub const HEADER_PUBLIC: &str = "SW-Public";
/// Header carrying the request nonce.
pub const HEADER_NONCE: &str = "SW-Nonce";
/// Header carrying the request signature.
pub const HEADER_SIG: &str = "SW-Sig";

#[derive(Debug, Deserialize)]
struct NextNonce {
    #[allow(dead_code)]
    edge: PubKey,
    next_nonce: u64,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: u16,
}

/// A fully read response.
#[derive(Debug, Clone)]
pub struct AuthResponse {
    /// HTTP status.
    pub status: StatusCode,
    /// Response body.
    pub body: Vec<u8>,
}

impl AuthResponse {
    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Decode the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, AuthError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Error message carried in the body, or the raw body text.
    pub fn error_message(&self) -> String {
        #[derive(Deserialize)]
        struct Plain {
            message: String,
        }
        if let Ok(ErrorBody {
            error: Some(detail),
        }) = serde_json::from_slice(&self.body)
        {
            return detail.message;
        }
        if let Ok(plain) = serde_json::from_slice::<Plain>(&self.body) {
            return plain.message;
        }
        String::from_utf8_lossy(&self.body).trim().to_string()
    }

    fn nonce_rejected(&self) -> bool {
        if self.status == StatusCode::UNAUTHORIZED {
            return true;
        }
        match serde_json::from_slice::<ErrorBody>(&self.body) {
            Ok(ErrorBody {
                error: Some(detail),
            }) => detail.code == 401 || detail.message == NONCE_MISMATCH_MESSAGE,
            _ => false,
        }
    }
}

/// Nonce-authenticated HTTP client bound to one service.
pub struct AuthClient {
    http: reqwest::Client,
    addr: String,
    keys: Keypair,
    // Held for the whole request so nonces are used in order.
    nonce: Mutex<Option<u64>>,
}

impl AuthClient {
    /// Create a client for the service at `addr`. The nonce is fetched on
    /// first use.
    pub fn new(addr: impl Into<String>, keys: Keypair) -> Self {
        Self::with_http(reqwest::Client::new(), addr, keys)
    }

    /// Create a client sharing an existing `reqwest` client.
    pub fn with_http(http: reqwest::Client, addr: impl Into<String>, keys: Keypair) -> Self {
        let mut addr = addr.into().trim_end_matches('/').to_string();
        if !addr.contains("://") {
            addr = format!("http://{addr}");
        }
        Self {
            http,
            addr,
            keys,
            nonce: Mutex::new(None),
        }
    }

    /// Service address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Public key requests are signed with.
    pub fn pk(&self) -> PubKey {
        self.keys.pk()
    }

    /// Nonce the next request will use, if known.
    pub async fn nonce(&self) -> Option<u64> {
        *self.nonce.lock().await
    }

    /// Override the cached nonce.
    pub async fn set_nonce(&self, nonce: u64) {
        *self.nonce.lock().await = Some(nonce);
    }

    /// Ask the service for the next nonce of this key.
    pub async fn fetch_nonce(&self) -> Result<u64, AuthError> {
        let url = format!("{}/security/nonces/{}", self.addr, self.keys.pk());
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        let body = resp.bytes().await?.to_vec();
        if status != StatusCode::OK {
            let message = AuthResponse { status, body }.error_message();
            return Err(AuthError::Nonce {
                status: status.as_u16(),
                message,
            });
        }
        let next: NextNonce = serde_json::from_slice(&body)?;
        trace!(nonce = next.next_nonce, "Fetched nonce");
        Ok(next.next_nonce)
    }

    /// Send a signed request.
    ///
    /// Non-2xx responses other than nonce rejections are returned for the
    /// caller to interpret.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<AuthResponse, AuthError> {
        let body = body.unwrap_or_default();
        let mut nonce = self.nonce.lock().await;
        let current = match *nonce {
            Some(n) => n,
            None => self.fetch_nonce().await?,
        };

        let mut resp = self.do_request(&method, path, &body, current).await?;
        let mut used = current;
        if resp.nonce_rejected() {
            used = self.fetch_nonce().await?;
            debug!(stale = current, fresh = used, path, "Nonce rejected, retrying");
            resp = self.do_request(&method, path, &body, used).await?;
            if resp.nonce_rejected() {
                *nonce = Some(used);
                return Err(AuthError::Unauthorized(resp.error_message()));
            }
        }

        *nonce = Some(if resp.is_success() { used + 1 } else { used });
        Ok(resp)
    }

    async fn do_request(
        &self,
        method: &Method,
        path: &str,
        body: &[u8],
        nonce: u64,
    ) -> Result<AuthResponse, AuthError> {
        let sig = self.keys.sign(&signed_payload(body, nonce));
        let url = format!("{}{}", self.addr, path);
        let mut req = self
            .http
            .request(method.clone(), &url)
            .header(HEADER_PUBLIC, self.keys.pk().to_string())
            .header(HEADER_NONCE, nonce.to_string())
            .header(HEADER_SIG, sig.to_string());
        if !body.is_empty() {
            req = req
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.to_vec());
        }
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?.to_vec();
        Ok(AuthResponse { status, body })
    }
}

/// Bytes covered by `SW-Sig`: the body followed by the decimal nonce.
pub fn signed_payload(body: &[u8], nonce: u64) -> Vec<u8> {
    let mut payload = body.to_vec();
    payload.extend_from_slice(nonce.to_string().as_bytes());
    payload
}

impl std::fmt::Debug for AuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthClient")
            .field("addr", &self.addr)
            .field("pk", &self.keys.pk())
            .finish()
    }
}
