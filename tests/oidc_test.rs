//! OIDC flow tests against a stub identity provider.
//!
//! The stub serves only the token endpoint; the nonce it embeds in the
//! ID token is controlled by each test, which is enough to exercise the
//! state single-use and nonce-binding guarantees end to end.

use std::collections::HashMap;
use std::sync::{Arc, Once};

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;

use snigate::config::OidcConfig;
use snigate::metrics::Events;
use snigate::oidc::{Provider, SessionStore};

/// What the stub token endpoint will claim in the next ID token.
#[derive(Clone, Default)]
struct StubClaims {
    nonce: Arc<Mutex<String>>,
    email_verified: Arc<Mutex<Option<bool>>>,
}

fn make_id_token(claims: &StubClaims) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256"}"#);
    let mut payload = serde_json::json!({
        "email": "user@example.com",
        "nonce": *claims.nonce.lock(),
        "iss": "https://stub.example.com",
    });
    if let Some(v) = *claims.email_verified.lock() {
        payload["email_verified"] = serde_json::Value::Bool(v);
    }
    let payload = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{header}.{payload}.unchecked")
}

async fn token_endpoint(State(claims): State<StubClaims>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "id_token": make_id_token(&claims) }))
}

async fn spawn_stub_idp() -> (String, StubClaims) {
    let claims = StubClaims::default();
    let router = Router::new()
        .route("/token", post(token_endpoint))
        .with_state(claims.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    (format!("http://{addr}"), claims)
}

static INIT_CRYPTO: Once = Once::new();

fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

async fn make_provider(base: &str, events: Arc<Events>) -> Arc<Provider> {
    init_crypto_provider();
    let cfg = OidcConfig {
        discovery_url: None,
        auth_endpoint: Some(format!("{base}/auth")),
        token_endpoint: Some(format!("{base}/token")),
        redirect_url: "https://login.example.com/oauth2/callback".to_string(),
        client_id: "test-client".to_string(),
        client_secret: "test-secret".to_string(),
    };
    Provider::new(&cfg, events, Arc::new(SessionStore::default()))
        .await
        .unwrap()
}

/// Run a login and return the state nonce from the redirect.
fn login_state(provider: &Provider, original_url: &str) -> String {
    let resp = provider.request_login(original_url.to_string());
    let location = resp
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let query = location.split_once('?').unwrap().1;
    let params: HashMap<String, String> = serde_urlencoded_from(query);
    params.get("state").cloned().unwrap()
}

fn serde_urlencoded_from(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

fn callback_params(state: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    params.insert("state".to_string(), state.to_string());
    params.insert("code".to_string(), "authcode123".to_string());
    params
}

#[tokio::test]
async fn callback_completes_once_and_rejects_replay() {
    let (base, claims) = spawn_stub_idp().await;
    let events = Arc::new(Events::default());
    let provider = make_provider(&base, Arc::clone(&events)).await;

    let state = login_state(&provider, "https://app.example.com/dashboard");
    *claims.nonce.lock() = state.clone();

    let resp = provider.handle_callback(&callback_params(&state)).await;
    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(
        resp.headers().get(header::LOCATION).unwrap(),
        "https://app.example.com/dashboard"
    );
    assert!(resp.headers().contains_key(header::SET_COOKIE));

    // Replaying the consumed state never reaches the token endpoint.
    let resp = provider.handle_callback(&callback_params(&state)).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(events.count("invalid state"), 1);
}

#[tokio::test]
async fn id_token_nonce_must_match_a_pending_state() {
    let (base, claims) = spawn_stub_idp().await;
    let events = Arc::new(Events::default());
    let provider = make_provider(&base, Arc::clone(&events)).await;

    let state = login_state(&provider, "https://app.example.com/");
    *claims.nonce.lock() = "somebody-elses-nonce".to_string();

    let resp = provider.handle_callback(&callback_params(&state)).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(events.count("invalid nonce"), 1);
}

#[tokio::test]
async fn unverified_email_is_rejected() {
    let (base, claims) = spawn_stub_idp().await;
    let events = Arc::new(Events::default());
    let provider = make_provider(&base, Arc::clone(&events)).await;

    let state = login_state(&provider, "https://app.example.com/");
    *claims.nonce.lock() = state.clone();
    *claims.email_verified.lock() = Some(false);

    let resp = provider.handle_callback(&callback_params(&state)).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(events.count("email not verified"), 1);
}

#[tokio::test]
async fn verified_email_true_is_accepted() {
    let (base, claims) = spawn_stub_idp().await;
    let events = Arc::new(Events::default());
    let provider = make_provider(&base, Arc::clone(&events)).await;

    let state = login_state(&provider, "https://app.example.com/ok");
    *claims.nonce.lock() = state.clone();
    *claims.email_verified.lock() = Some(true);

    let resp = provider.handle_callback(&callback_params(&state)).await;
    assert_eq!(resp.status(), StatusCode::FOUND);
}
