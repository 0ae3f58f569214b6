//! OIDC authorization-code flow with PKCE
//!
//! Provides identity for HTTP-family backends that require it. The flow
//! is the manual one: a login request issues a random state nonce and a
//! PKCE code verifier, the callback exchanges the code at the token
//! endpoint, and the ID token's claims are read without signature
//! verification because the token arrives over TLS directly from the
//! IdP. Each state is usable at most once and expires after five
//! minutes; the nonce claim in the ID token must match a pending state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::OidcConfig;
use crate::errors::Error;
use crate::metrics::Events;

/// States older than this are garbage-collected and unusable.
const STATE_TTL: Duration = Duration::from_secs(5 * 60);

/// Session cookie name.
const SESSION_COOKIE: &str = "snigate-session";

/// Session lifetime.
const SESSION_TTL: Duration = Duration::from_secs(12 * 3600);

type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Issues and validates browser sessions.
///
/// HTTP-mode backends consume identity through this trait; the provider
/// calls it after a successful callback.
pub trait CookieManager: Send + Sync {
    /// `Set-Cookie` value binding a new session to `email`.
    fn set_auth_token_cookie(&self, email: &str, session_id: &str) -> HeaderValue;
    /// `Set-Cookie` values that clear the session.
    fn clear_cookies(&self) -> Vec<HeaderValue>;
    /// Email of the session carried by a `Cookie` header, if any.
    fn authenticated_email(&self, cookie_header: Option<&str>) -> Option<String>;
}

/// Server-side session store keyed by a random cookie token.
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<String, (String, Instant)>,
}

impl CookieManager for SessionStore {
    fn set_auth_token_cookie(&self, email: &str, _session_id: &str) -> HeaderValue {
        let mut raw = [0u8; 24];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        let token = hex_encode(&raw);
        self.sessions
            .insert(token.clone(), (email.to_string(), Instant::now()));
        HeaderValue::from_str(&format!(
            "{SESSION_COOKIE}={token}; Path=/; Secure; HttpOnly; SameSite=Lax"
        ))
        .expect("cookie header")
    }

    fn clear_cookies(&self) -> Vec<HeaderValue> {
        vec![HeaderValue::from_static(
            "snigate-session=; Path=/; Max-Age=0; Secure; HttpOnly",
        )]
    }

    fn authenticated_email(&self, cookie_header: Option<&str>) -> Option<String> {
        let header = cookie_header?;
        let token = header.split(';').find_map(|part| {
            part.trim()
                .strip_prefix(SESSION_COOKIE)
                .and_then(|rest| rest.strip_prefix('='))
        })?;
        let entry = self.sessions.get(token)?;
        let (email, created) = entry.value();
        if created.elapsed() > SESSION_TTL {
            drop(entry);
            self.sessions.remove(token);
            return None;
        }
        Some(email.clone())
    }
}

struct AuthState {
    created: Instant,
    original_url: String,
    code_verifier: String,
    seen: bool,
}

/// One OIDC provider, shared by all server names of a backend.
pub struct Provider {
    auth_endpoint: String,
    token_endpoint: String,
    redirect_url: String,
    redirect_path: String,
    client_id: String,
    client_secret: String,
    states: Mutex<HashMap<String, AuthState>>,
    events: Arc<Events>,
    cookies: Arc<dyn CookieManager>,
    client: HttpsClient,
}

#[derive(Deserialize)]
struct DiscoveryDoc {
    authorization_endpoint: String,
    token_endpoint: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    id_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct IdTokenClaims {
    #[serde(default)]
    pub email: String,
    pub email_verified: Option<bool>,
    #[serde(default)]
    pub nonce: String,
}

impl Provider {
    /// Build a provider, fetching the discovery document when configured.
    pub async fn new(
        cfg: &OidcConfig,
        events: Arc<Events>,
        cookies: Arc<dyn CookieManager>,
    ) -> Result<Arc<Self>, Error> {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| Error::Config(format!("root certificates: {e}")))?
            .https_or_http()
            .enable_http1()
            .build();
        let client: HttpsClient = Client::builder(TokioExecutor::new()).build(connector);

        let (auth_endpoint, token_endpoint) = match &cfg.discovery_url {
            Some(url) => {
                let doc = fetch_discovery(&client, url).await?;
                (doc.authorization_endpoint, doc.token_endpoint)
            }
            None => (
                cfg.auth_endpoint.clone().unwrap_or_default(),
                cfg.token_endpoint.clone().unwrap_or_default(),
            ),
        };
        if auth_endpoint.is_empty() || token_endpoint.is_empty() {
            return Err(Error::Config("oidc endpoints unresolved".into()));
        }

        let redirect_path = cfg
            .redirect_url
            .splitn(4, '/')
            .nth(3)
            .map(|p| format!("/{p}"))
            .unwrap_or_else(|| "/".to_string());

        Ok(Arc::new(Self {
            auth_endpoint,
            token_endpoint,
            redirect_url: cfg.redirect_url.clone(),
            redirect_path,
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
            states: Mutex::new(HashMap::new()),
            events,
            cookies,
            client,
        }))
    }

    /// Path component of the redirect URL, served by the proxy.
    pub fn redirect_path(&self) -> &str {
        &self.redirect_path
    }

    /// Begin a login: mint state and PKCE material, redirect to the
    /// authorization endpoint.
    pub fn request_login(&self, original_url: String) -> Response {
        let mut nonce = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let nonce = hex_encode(&nonce);

        let mut verifier = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut verifier);
        let code_verifier = URL_SAFE_NO_PAD.encode(verifier);
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(code_verifier.as_bytes()));

        self.states.lock().insert(
            nonce.clone(),
            AuthState {
                created: Instant::now(),
                original_url,
                code_verifier,
                seen: false,
            },
        );

        let query = serde_urlencoded::to_string([
            ("response_type", "code"),
            ("client_id", self.client_id.as_str()),
            ("scope", "openid email"),
            ("redirect_uri", self.redirect_url.as_str()),
            ("state", nonce.as_str()),
            ("nonce", nonce.as_str()),
            ("code_challenge", challenge.as_str()),
            ("code_challenge_method", "S256"),
        ])
        .expect("static query pairs");
        self.events.record("oidc auth request");
        found_redirect(&format!("{}?{query}", self.auth_endpoint))
    }

    /// Handle the IdP redirect back to the proxy.
    pub async fn handle_callback(&self, params: &HashMap<String, String>) -> Response {
        self.events.record("oidc auth callback");

        if params.get("logout").map(|v| !v.is_empty()).unwrap_or(false) {
            let mut resp = (StatusCode::OK, "logout successful").into_response();
            for cookie in self.cookies.clear_cookies() {
                resp.headers_mut().append(header::SET_COOKIE, cookie);
            }
            return resp;
        }

        let state_param = params.get("state").cloned().unwrap_or_default();
        let code_verifier = {
            let mut states = self.states.lock();
            states.retain(|_, s| s.created.elapsed() <= STATE_TTL);
            match states.get_mut(&state_param) {
                Some(state) if !state.seen => {
                    state.seen = true;
                    state.code_verifier.clone()
                }
                _ => {
                    self.events.record("invalid state");
                    return (StatusCode::BAD_REQUEST, "invalid state").into_response();
                }
            }
        };

        let code = params.get("code").cloned().unwrap_or_default();
        let id_token = match self.exchange_code(&code, &code_verifier).await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "token exchange failed");
                return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
            }
        };

        let claims = match parse_id_token_claims(&id_token) {
            Ok(claims) => claims,
            Err(e) => {
                warn!(error = %e, "unreadable id token");
                return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
            }
        };

        // The nonce binds the token to a pending request, exactly once.
        let original_url = {
            let mut states = self.states.lock();
            match states.remove(&claims.nonce) {
                Some(state) => state.original_url,
                None => {
                    self.events.record("invalid nonce");
                    return (StatusCode::FORBIDDEN, "timeout").into_response();
                }
            }
        };

        if claims.email_verified == Some(false) {
            self.events.record("email not verified");
            return (StatusCode::FORBIDDEN, "email not verified").into_response();
        }

        let cookie = self
            .cookies
            .set_auth_token_cookie(&claims.email, &claims.nonce);
        let mut resp = found_redirect(&original_url);
        resp.headers_mut().append(header::SET_COOKIE, cookie);
        resp
    }

    async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<String, Error> {
        let form = serde_urlencoded::to_string([
            ("code", code),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("redirect_uri", self.redirect_url.as_str()),
            ("grant_type", "authorization_code"),
            ("code_verifier", code_verifier),
        ])
        .expect("static form pairs");

        let req = hyper::Request::builder()
            .method(hyper::Method::POST)
            .uri(&self.token_endpoint)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            )
            .body(Full::new(Bytes::from(form)))
            .map_err(|e| Error::Config(e.to_string()))?;

        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| Error::Acme(format!("token endpoint: {e}")))?;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Acme(format!("token endpoint: {e}")))?
            .to_bytes();
        if !status.is_success() {
            return Err(Error::Acme(format!("token endpoint: {status}")));
        }
        let token: TokenResponse =
            serde_json::from_slice(&body).map_err(|e| Error::Acme(format!("token response: {e}")))?;
        token
            .id_token
            .ok_or_else(|| Error::Acme("token response without id_token".into()))
    }
}

async fn fetch_discovery(client: &HttpsClient, url: &str) -> Result<DiscoveryDoc, Error> {
    let req = hyper::Request::builder()
        .uri(url)
        .body(Full::new(Bytes::new()))
        .map_err(|e| Error::Config(e.to_string()))?;
    let resp = client
        .request(req)
        .await
        .map_err(|e| Error::Config(format!("discovery: {e}")))?;
    if !resp.status().is_success() {
        return Err(Error::Config(format!("discovery: {}", resp.status())));
    }
    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| Error::Config(format!("discovery: {e}")))?
        .to_bytes();
    serde_json::from_slice(&body).map_err(|e| Error::Config(format!("discovery document: {e}")))
}

/// Read the claims of a JWT without verifying its signature. The token
/// was received over TLS straight from the identity provider.
pub(crate) fn parse_id_token_claims(token: &str) -> Result<IdTokenClaims, Error> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::Acme("malformed id token".into()))?;
    let raw = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| Error::Acme(format!("id token payload: {e}")))?;
    serde_json::from_slice(&raw).map_err(|e| Error::Acme(format!("id token claims: {e}")))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// 302 Found redirect, the status the OAuth2 round-trips use.
fn found_redirect(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(loc) => (StatusCode::FOUND, [(header::LOCATION, loc)]).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Wrap a router so every request requires an authenticated session.
///
/// The callback path is handled by the provider; all other paths either
/// carry a valid session cookie (the email travels to the inner handler
/// in `x-forwarded-email`) or are redirected into the login flow.
pub fn protect(router: Router, provider: Arc<Provider>) -> Router {
    router.layer(axum::middleware::from_fn_with_state(provider, enforce))
}

async fn enforce(
    State(provider): State<Arc<Provider>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    if req.uri().path() == provider.redirect_path() {
        let params: HashMap<String, String> = req
            .uri()
            .query()
            .map(|q| serde_urlencoded::from_str(q).unwrap_or_default())
            .unwrap_or_default();
        return provider.handle_callback(&params).await;
    }

    let cookie_header = req
        .headers()
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    match provider.cookies.authenticated_email(cookie_header.as_deref()) {
        Some(email) => {
            debug!(%email, "authenticated request");
            if let Ok(v) = HeaderValue::from_str(&email) {
                req.headers_mut().insert("x-forwarded-email", v);
            }
            next.run(req).await
        }
        None => {
            let host = req
                .headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            let original_url = format!("https://{host}{}", req.uri());
            provider.request_login(original_url)
        }
    }
}
