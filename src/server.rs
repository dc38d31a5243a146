//! HTTP surface: the batch sync endpoint and the Gmail connect flow.
//!
//! Credentials live in the admin's `psync_gmail_tokens` cookie. Each request
//! gets its own cookie-backed credential store; any change made to it
//! (connect, refresh during a sync, logout) is sent back as `Set-Cookie`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::credentials::{
    cookie_value, CookieChange, CookieCredentialStore, CredentialStore, CREDENTIAL_COOKIE_NAME,
};
use crate::db::models::Partner;
use crate::db::{PartnerStore, SharedDatabase};
use crate::oauth::{GoogleOAuthClient, OAuthClient, TokenManager};
use crate::sync::{SyncError, SyncOrchestrator};

const COOKIE_MAX_AGE_SECS: u64 = 7 * 24 * 60 * 60;
const OAUTH_STATE_COOKIE_NAME: &str = "psync_oauth_state";
const OAUTH_STATE_MAX_AGE_SECS: u64 = 10 * 60;

pub struct AppState {
    pub config: AppConfig,
    pub http: Client,
    /// `None` runs syncs without write-back.
    pub store: Option<SharedDatabase>,
}

impl AppState {
    pub fn new(config: AppConfig, store: Option<SharedDatabase>) -> Self {
        Self {
            config,
            http: Client::new(),
            store,
        }
    }

    fn cookie_store(&self, headers: &HeaderMap) -> CookieCredentialStore {
        let header = headers.get(COOKIE).and_then(|value| value.to_str().ok());
        CookieCredentialStore::from_cookie_header(self.config.credential_codec(), header)
    }

    fn oauth_client(&self) -> Result<GoogleOAuthClient, SyncError> {
        Ok(GoogleOAuthClient::new(
            self.http.clone(),
            self.config.oauth_app()?,
        ))
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/auth/google", get(auth_start))
        .route("/auth/google/callback", get(auth_callback))
        .route("/auth/logout", post(auth_logout))
        .route("/auth/status", get(auth_status))
        .route("/api/gmail/sync", post(sync_partners))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("partner sync service listening on {addr}");
    axum::serve(listener, router(state))
        .await
        .context("serve http")
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status = match &self {
            SyncError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SyncError::NotConnected => StatusCode::UNAUTHORIZED,
            SyncError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SyncError::Upstream(_) => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            error!("request failed: {self}");
        }
        (
            status,
            Json(json!({ "success": false, "error": self.to_string() })),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
struct SyncRequest {
    partners: Vec<Partner>,
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// GET /auth/google
async fn auth_start(State(state): State<Arc<AppState>>) -> Result<Response, SyncError> {
    let nonce = Uuid::new_v4().simple().to_string();
    let url = state
        .oauth_client()?
        .consent_url(Some(&nonce))
        .map_err(|e| SyncError::Config(format!("{e:#}")))?;

    let mut response = Redirect::temporary(url.as_str()).into_response();
    let cookie = oauth_state_cookie(&nonce, OAUTH_STATE_MAX_AGE_SECS, state.config.secure_cookies);
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response.headers_mut().append(SET_COOKIE, value);
    }
    Ok(response)
}

/// GET /auth/google/callback?code=...&state=...
async fn auth_callback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Result<Response, SyncError> {
    if let Some(error) = params.error {
        return Err(SyncError::InvalidRequest(format!("oauth error: {error}")));
    }
    let code = params
        .code
        .filter(|code| !code.trim().is_empty())
        .ok_or_else(|| SyncError::InvalidRequest("missing oauth code".to_string()))?;

    let expected = headers
        .get(COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| cookie_value(raw, OAUTH_STATE_COOKIE_NAME));
    if expected.is_none() || expected != params.state {
        return Err(SyncError::InvalidRequest("oauth state mismatch".to_string()));
    }

    let tokens = state
        .oauth_client()?
        .exchange_code(&code)
        .await
        .map_err(|e| SyncError::Upstream(format!("{e:#}")))?;

    let store = CookieCredentialStore::new(state.config.credential_codec(), None);
    store
        .save(&tokens.into_pair(Utc::now()))
        .map_err(|e| SyncError::Config(e.to_string()))?;
    info!("gmail account connected");

    let mut response = Redirect::to("/").into_response();
    apply_cookie_change(&mut response, store.take_change(), state.config.secure_cookies);
    // the nonce is single-use
    let expired = oauth_state_cookie("", 0, state.config.secure_cookies);
    if let Ok(value) = HeaderValue::from_str(&expired) {
        response.headers_mut().append(SET_COOKIE, value);
    }
    Ok(response)
}

/// POST /auth/logout
async fn auth_logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let store = state.cookie_store(&headers);
    if let Err(error) = store.clear() {
        warn!("failed to clear gmail credentials: {error}");
    }
    let mut response = Json(json!({ "success": true })).into_response();
    apply_cookie_change(&mut response, store.take_change(), state.config.secure_cookies);
    response
}

/// GET /auth/status
async fn auth_status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let connected = matches!(state.cookie_store(&headers).load(), Ok(Some(_)));
    Json(json!({ "connected": connected })).into_response()
}

/// POST /api/gmail/sync with `{"partners": [...]}`
async fn sync_partners(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, SyncError> {
    let oauth = state.oauth_client()?;
    let classifier = state.config.classifier(state.http.clone())?;

    let cookies = Arc::new(state.cookie_store(&headers));
    if !matches!(cookies.load(), Ok(Some(_))) {
        return Err(SyncError::NotConnected);
    }

    let request: SyncRequest = serde_json::from_slice(&body)
        .map_err(|e| SyncError::InvalidRequest(format!("expected {{\"partners\": [...]}}: {e}")))?;

    let manager = TokenManager::new(
        cookies.clone(),
        Arc::new(oauth),
        state.http.clone(),
        state.config.gmail_api_base.clone(),
    );
    let gmail = manager.acquire().await.ok_or(SyncError::NotConnected)?;

    let store = state.store.as_ref().map(|db| db as &dyn PartnerStore);
    let report = SyncOrchestrator::new(&gmail, &classifier, store, state.config.sync)
        .sync(&request.partners)
        .await;

    let mut response = Json(report.response()).into_response();
    apply_cookie_change(&mut response, cookies.take_change(), state.config.secure_cookies);
    Ok(response)
}

fn apply_cookie_change(response: &mut Response, change: Option<CookieChange>, secure: bool) {
    let Some(change) = change else {
        return;
    };
    match HeaderValue::from_str(&set_cookie_value(&change, secure)) {
        Ok(value) => {
            response.headers_mut().append(SET_COOKIE, value);
        }
        Err(error) => warn!("credential cookie not set: {error}"),
    }
}

fn oauth_state_cookie(nonce: &str, max_age: u64, secure: bool) -> String {
    let mut cookie = format!(
        "{OAUTH_STATE_COOKIE_NAME}={nonce}; Path=/auth; HttpOnly; SameSite=Lax; Max-Age={max_age}"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

fn set_cookie_value(change: &CookieChange, secure: bool) -> String {
    let (value, max_age) = match change {
        CookieChange::Set(value) => (value.as_str(), COOKIE_MAX_AGE_SECS),
        CookieChange::Clear => ("", 0),
    };
    let mut cookie = format!(
        "{CREDENTIAL_COOKIE_NAME}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::{router, set_cookie_value, AppState};
    use crate::config::AppConfig;
    use crate::credentials::{CookieChange, CredentialCodec, CredentialPair};

    fn state(vars: &[(&str, &str)]) -> Arc<AppState> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let config = AppConfig::from_lookup(|key| vars.get(key).cloned()).expect("config");
        Arc::new(AppState::new(config, None))
    }

    fn configured() -> Arc<AppState> {
        state(&[
            ("PSYNC_GMAIL_CLIENT_ID", "client"),
            ("PSYNC_GMAIL_CLIENT_SECRET", "secret"),
            ("PSYNC_OPENAI_API_KEY", "sk-test"),
        ])
    }

    fn credential_cookie() -> String {
        let encoded = CredentialCodec::default()
            .encode(&CredentialPair::new("ya29.token"))
            .expect("encode");
        format!("theme=dark; psync_gmail_tokens={encoded}")
    }

    fn sync_request(cookie: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::post("/api/gmail/sync").header(header::CONTENT_TYPE, "application/json");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::from(body.to_string())).expect("request")
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn health_is_ok() {
        let response = router(state(&[]))
            .oneshot(Request::get("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn sync_without_app_credentials_is_a_server_error() {
        let response = router(state(&[]))
            .oneshot(sync_request(Some(&credential_cookie()), r#"{"partners":[]}"#))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await["success"], false);
    }

    #[tokio::test]
    async fn sync_without_cookie_is_unauthorized() {
        let response = router(configured())
            .oneshot(sync_request(None, r#"{"partners":[]}"#))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn sync_with_garbled_cookie_is_unauthorized() {
        let response = router(configured())
            .oneshot(sync_request(Some("psync_gmail_tokens=%%%"), r#"{"partners":[]}"#))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn sync_with_malformed_body_is_bad_request() {
        for body in ["not json", r#"{"partners": 3}"#, "{}"] {
            let response = router(configured())
                .oneshot(sync_request(Some(&credential_cookie()), body))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {body}");
        }
    }

    #[tokio::test]
    async fn empty_batch_succeeds_without_touching_gmail() {
        let response = router(configured())
            .oneshot(sync_request(Some(&credential_cookie()), r#"{"partners":[]}"#))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["processedCount"], 0);
        assert_eq!(body["results"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn auth_status_reports_connection() {
        let app = router(configured());
        let connected = app
            .clone()
            .oneshot(
                Request::get("/auth/status")
                    .header(header::COOKIE, credential_cookie())
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(json_body(connected).await["connected"], true);

        let anonymous = app
            .oneshot(Request::get("/auth/status").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(json_body(anonymous).await["connected"], false);
    }

    #[tokio::test]
    async fn logout_expires_the_cookie() {
        let response = router(configured())
            .oneshot(
                Request::post("/auth/logout")
                    .header(header::COOKIE, credential_cookie())
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .expect("set-cookie");
        assert!(cookie.starts_with("psync_gmail_tokens=;"));
        assert!(cookie.contains("Max-Age=0"));
    }

    #[tokio::test]
    async fn connect_redirects_to_consent_screen_with_state() {
        let response = router(configured())
            .oneshot(Request::get("/auth/google").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .expect("location");
        assert!(location.starts_with("https://accounts.google.com/o/oauth2/v2/auth?"));
        assert!(location.contains("access_type=offline"));

        let state_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .expect("state cookie");
        let nonce = state_cookie
            .split(';')
            .next()
            .and_then(|pair| pair.strip_prefix("psync_oauth_state="))
            .expect("nonce");
        assert!(location.contains(&format!("state={nonce}")));
    }

    #[tokio::test]
    async fn callback_rejects_provider_errors_and_missing_state() {
        let denied = router(configured())
            .oneshot(
                Request::get("/auth/google/callback?error=access_denied")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(denied.status(), StatusCode::BAD_REQUEST);

        let forged = router(configured())
            .oneshot(
                Request::get("/auth/google/callback?code=abc&state=guess")
                    .header(header::COOKIE, "psync_oauth_state=expected")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(forged.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(forged).await["error"], "invalid request: oauth state mismatch");
    }

    #[test]
    fn cookie_attributes() {
        let cookie = set_cookie_value(&CookieChange::Set("abc".to_string()), true);
        assert_eq!(
            cookie,
            "psync_gmail_tokens=abc; Path=/; HttpOnly; SameSite=Lax; Max-Age=604800; Secure"
        );
    }
}
