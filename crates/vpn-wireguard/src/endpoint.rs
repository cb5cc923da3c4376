//! Client for the peer-management endpoint running beside the WireGuard
//! server.
//!
//! | Call | Request |
//! |------|---------|
//! | add peer | `POST /peer` with `{"jwt", "pubkey"}` |
//! | remove peer | `DELETE /peer?pubkey=…&token=…` |
//! | server info | `GET /info` |
//! | health | `GET /health` |

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EndpointError, EndpointResult};
use crate::token::PeerTokenIssuer;

/// Per-request deadline.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Boxed future returned by [`PeerEndpoint`] methods.
pub type EndpointFuture<'a, T> = Pin<Box<dyn Future<Output = EndpointResult<T>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddPeerResponse {
    pub success: bool,
    #[serde(default)]
    pub server_pubkey: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub allowed_ips: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_pubkey: String,
    pub endpoint: String,
}

#[derive(Serialize)]
struct AddPeerRequest<'a> {
    jwt: &'a str,
    pubkey: &'a str,
}

/// The live WireGuard server's peer table.
pub trait PeerEndpoint: Send + Sync {
    fn add_peer<'a>(&'a self, pubkey: &'a str, allowed_ip: &'a str)
    -> EndpointFuture<'a, AddPeerResponse>;

    fn remove_peer<'a>(&'a self, pubkey: &'a str, allowed_ip: &'a str) -> EndpointFuture<'a, ()>;

    fn info(&self) -> EndpointFuture<'_, ServerInfo>;

    fn health(&self) -> EndpointFuture<'_, ()>;
}

/// HTTP/1 implementation of [`PeerEndpoint`].
pub struct HttpPeerEndpoint {
    /// `host:port`
    authority: String,
    /// Path prefix without trailing slash.
    base_path: String,
    issuer: PeerTokenIssuer,
    timeout: Duration,
}

impl HttpPeerEndpoint {
    /// `base_url` must be a plain `http://host[:port][/prefix]` URL.
    pub fn new(base_url: &str, issuer: PeerTokenIssuer) -> EndpointResult<Self> {
        let uri: Uri = base_url
            .parse()
            .map_err(|e| EndpointError::InvalidUrl(format!("{base_url}: {e}")))?;
        if uri.scheme_str() != Some("http") {
            return Err(EndpointError::InvalidUrl(format!(
                "{base_url}: only http:// is supported"
            )));
        }
        let authority = uri
            .authority()
            .ok_or_else(|| EndpointError::InvalidUrl(format!("{base_url}: missing host")))?;
        let authority = match authority.port_u16() {
            Some(_) => authority.to_string(),
            None => format!("{}:80", authority.host()),
        };
        Ok(Self {
            authority,
            base_path: uri.path().trim_end_matches('/').to_string(),
            issuer,
            timeout: REQUEST_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    async fn send(
        &self,
        method: Method,
        path_and_query: String,
        body: Option<Vec<u8>>,
    ) -> EndpointResult<(StatusCode, Bytes)> {
        let uri = format!("http://{}{}{}", self.authority, self.base_path, path_and_query);
        let result = tokio::time::timeout(self.timeout, async {
            let stream = tokio::net::TcpStream::connect(&self.authority)
                .await
                .map_err(|e| EndpointError::Connect {
                    address: self.authority.clone(),
                    reason: e.to_string(),
                })?;
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| EndpointError::Http(e.to_string()))?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let mut builder = Request::builder()
                .method(method)
                .uri(&uri)
                .header(http::header::HOST, &self.authority)
                .header(http::header::USER_AGENT, "vpn-indexer/0.1");
            if body.is_some() {
                builder = builder.header(http::header::CONTENT_TYPE, "application/json");
            }
            let req = builder
                .body(Full::new(Bytes::from(body.unwrap_or_default())))
                .map_err(|e| EndpointError::Http(e.to_string()))?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| EndpointError::Http(e.to_string()))?;
            let status = resp.status();
            let bytes = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| EndpointError::Http(e.to_string()))?
                .to_bytes();
            Ok((status, bytes))
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => {
                debug!(%uri, "peer endpoint request timed out");
                Err(EndpointError::Timeout(self.timeout))
            }
        }
    }

    async fn expect_ok(
        &self,
        method: Method,
        path: &str,
        query: Option<String>,
        body: Option<Vec<u8>>,
    ) -> EndpointResult<Bytes> {
        let path_and_query = match query {
            Some(q) => format!("{path}?{q}"),
            None => path.to_string(),
        };
        let (status, bytes) = self.send(method, path_and_query, body).await?;
        if status != StatusCode::OK {
            return Err(EndpointError::Status {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(bytes)
    }
}

impl PeerEndpoint for HttpPeerEndpoint {
    fn add_peer<'a>(
        &'a self,
        pubkey: &'a str,
        allowed_ip: &'a str,
    ) -> EndpointFuture<'a, AddPeerResponse> {
        Box::pin(async move {
            let jwt = self.issuer.issue(pubkey, allowed_ip)?;
            let body = serde_json::to_vec(&AddPeerRequest { jwt: &jwt, pubkey })
                .map_err(|e| EndpointError::Http(e.to_string()))?;
            let bytes = self
                .expect_ok(Method::POST, "/peer", None, Some(body))
                .await?;
            let response: AddPeerResponse = serde_json::from_slice(&bytes)
                .map_err(|e| EndpointError::Decode(e.to_string()))?;
            if !response.success {
                return Err(EndpointError::Rejected(
                    "server returned success=false".to_string(),
                ));
            }
            Ok(response)
        })
    }

    fn remove_peer<'a>(&'a self, pubkey: &'a str, allowed_ip: &'a str) -> EndpointFuture<'a, ()> {
        Box::pin(async move {
            let token = self.issuer.issue(pubkey, allowed_ip)?;
            let query = remove_peer_query(pubkey, &token);
            self.expect_ok(Method::DELETE, "/peer", Some(query), None)
                .await?;
            Ok(())
        })
    }

    fn info(&self) -> EndpointFuture<'_, ServerInfo> {
        Box::pin(async move {
            let bytes = self.expect_ok(Method::GET, "/info", None, None).await?;
            serde_json::from_slice(&bytes).map_err(|e| EndpointError::Decode(e.to_string()))
        })
    }

    fn health(&self) -> EndpointFuture<'_, ()> {
        Box::pin(async move {
            self.expect_ok(Method::GET, "/health", None, None).await?;
            Ok(())
        })
    }
}

/// `pubkey=…&token=…`, form-urlencoded.
fn remove_peer_query(pubkey: &str, token: &str) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .append_pair("pubkey", pubkey)
        .append_pair("token", token)
        .finish()
}
