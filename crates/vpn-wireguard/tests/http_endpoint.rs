use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::SigningKey;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::{Value, json};
use vpn_wireguard::token::PeerClaims;
use vpn_wireguard::{EndpointError, HttpPeerEndpoint, PeerEndpoint, PeerTokenIssuer};

#[derive(Default)]
struct Seen {
    added: Mutex<Vec<Value>>,
    removed: Mutex<Vec<HashMap<String, String>>>,
}

async fn add_peer(State(seen): State<Arc<Seen>>, Json(body): Json<Value>) -> Json<Value> {
    let reject = body["pubkey"] == "reject";
    seen.added.lock().unwrap().push(body);
    Json(json!({
        "success": !reject,
        "server_pubkey": "server-key",
        "endpoint": "vpn.example:51820",
        "allowed_ips": "10.8.0.2/32",
    }))
}

async fn remove_peer(
    State(seen): State<Arc<Seen>>,
    Query(params): Query<HashMap<String, String>>,
) -> StatusCode {
    let missing = params.get("pubkey").is_some_and(|p| p == "missing");
    seen.removed.lock().unwrap().push(params);
    if missing {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::OK
    }
}

async fn serve() -> (SocketAddr, Arc<Seen>) {
    let seen = Arc::new(Seen::default());
    let app = Router::new()
        .route("/wg/peer", post(add_peer).delete(remove_peer))
        .route(
            "/wg/info",
            get(|| async { Json(json!({"server_pubkey": "server-key", "endpoint": "vpn.example:51820"})) }),
        )
        .route("/wg/health", get(|| async { "ok" }))
        .with_state(seen.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, seen)
}

fn client_for(addr: SocketAddr) -> HttpPeerEndpoint {
    let issuer = PeerTokenIssuer::new(signing_key()).unwrap();
    HttpPeerEndpoint::new(&format!("http://{addr}/wg/"), issuer).unwrap()
}

fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[5u8; 32])
}

/// Verify `token` against the client's key and return its claims.
fn claims(token: &str) -> PeerClaims {
    let key = DecodingKey::from_ed_der(signing_key().verifying_key().as_bytes());
    jsonwebtoken::decode::<PeerClaims>(token, &key, &Validation::new(Algorithm::EdDSA))
        .unwrap()
        .claims
}

#[tokio::test]
async fn add_peer_posts_signed_token() {
    let (addr, seen) = serve().await;
    let endpoint = client_for(addr);
    let pubkey = STANDARD.encode([1u8; 32]);

    let response = endpoint.add_peer(&pubkey, "10.8.0.2").await.unwrap();
    assert!(response.success);
    assert_eq!(response.server_pubkey, "server-key");

    let added = seen.added.lock().unwrap();
    assert_eq!(added.len(), 1);
    assert_eq!(added[0]["pubkey"], pubkey.as_str());
    let claims = claims(added[0]["jwt"].as_str().unwrap());
    assert_eq!(claims.sub, "wg_peer");
    assert_eq!(claims.pubkey, pubkey);
    assert_eq!(claims.allowed_ip, "10.8.0.2");
}

#[tokio::test]
async fn add_peer_rejected_by_server() {
    let (addr, _seen) = serve().await;
    let endpoint = client_for(addr);
    assert!(matches!(
        endpoint.add_peer("reject", "10.8.0.2").await,
        Err(EndpointError::Rejected(_))
    ));
}

#[tokio::test]
async fn remove_peer_sends_encoded_query() {
    let (addr, seen) = serve().await;
    let endpoint = client_for(addr);
    let pubkey = "ab+/cd==";

    endpoint.remove_peer(pubkey, "10.8.0.7").await.unwrap();
    let removed = seen.removed.lock().unwrap();
    assert_eq!(removed[0]["pubkey"], pubkey);
    assert_eq!(claims(&removed[0]["token"]).allowed_ip, "10.8.0.7");
}

#[tokio::test]
async fn non_ok_status_is_an_error() {
    let (addr, _seen) = serve().await;
    let endpoint = client_for(addr);
    assert!(matches!(
        endpoint.remove_peer("missing", "10.8.0.7").await,
        Err(EndpointError::Status { status: 404, .. })
    ));
}

#[tokio::test]
async fn info_and_health() {
    let (addr, _seen) = serve().await;
    let endpoint = client_for(addr);
    endpoint.health().await.unwrap();
    let info = endpoint.info().await.unwrap();
    assert_eq!(info.server_pubkey, "server-key");
    assert_eq!(info.endpoint, "vpn.example:51820");
}
