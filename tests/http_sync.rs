use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{Form, Path, Query};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use psync::config::AppConfig;
use psync::credentials::{CredentialCodec, CredentialPair};
use psync::db::models::{Partner, PartnerStatus};
use psync::db::{Database, SharedDatabase};
use psync::server::{router, AppState};

async fn token(Form(form): Form<HashMap<String, String>>) -> Response {
    let field = |name: &str| form.get(name).map(String::as_str);
    match (field("grant_type"), field("refresh_token"), field("code")) {
        (Some("refresh_token"), Some("R"), _) => Json(json!({
            "access_token": "ya29.fresh",
            "expires_in": 3599,
            "token_type": "Bearer"
        }))
        .into_response(),
        (Some("authorization_code"), _, Some("C")) => Json(json!({
            "access_token": "ya29.first",
            "refresh_token": "R",
            "expires_in": 3599,
            "token_type": "Bearer"
        }))
        .into_response(),
        _ => (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid_grant" }))).into_response(),
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers.get("authorization").and_then(|v| v.to_str().ok()) == Some("Bearer ya29.fresh")
}

async fn list_messages(headers: HeaderMap, Query(query): Query<HashMap<String, String>>) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match query.get("q").map(String::as_str) {
        Some("a@x.com") => Json(json!({
            "messages": [{ "id": "m2", "threadId": "t" }, { "id": "m1", "threadId": "t" }]
        }))
        .into_response(),
        Some("down@x.com") => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        _ => Json(json!({ "resultSizeEstimate": 0 })).into_response(),
    }
}

async fn get_message(headers: HeaderMap, Path(id): Path<String>) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let (from, date) = match id.as_str() {
        "m1" => ("Registrar <a@x.com>", "Mon, 2 Mar 2026 09:00:00 +0000"),
        _ => ("Agency <team@agency.com>", "Tue, 3 Mar 2026 09:00:00 +0000"),
    };
    Json(json!({
        "id": id,
        "snippet": "Looking forward to working together",
        "payload": { "headers": [
            { "name": "Subject", "value": "Partnership" },
            { "name": "From", "value": from },
            { "name": "Date", "value": date }
        ]}
    }))
    .into_response()
}

async fn completions(Json(body): Json<Value>) -> Response {
    assert_eq!(body["response_format"]["type"], "json_object");
    let verdict = json!({
        "status": "interested",
        "summary": "Registrar wants the commission terms",
        "nextAction": "Send terms",
        "proposedReply": "Dear Registrar, attached are our terms."
    });
    Json(json!({ "choices": [{ "message": { "content": verdict.to_string() } }] })).into_response()
}

async fn spawn_providers() -> String {
    let app = Router::new()
        .route("/token", post(token))
        .route("/gmail/v1/users/me/messages", get(list_messages))
        .route("/gmail/v1/users/me/messages/:id", get(get_message))
        .route("/v1/chat/completions", post(completions));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

fn config(base: &str) -> AppConfig {
    let vars: HashMap<String, String> = [
        ("PSYNC_GMAIL_CLIENT_ID", "client".to_string()),
        ("PSYNC_GMAIL_CLIENT_SECRET", "secret".to_string()),
        ("PSYNC_GMAIL_TOKEN_URL", format!("{base}/token")),
        ("PSYNC_GMAIL_API_BASE", format!("{base}/gmail/v1")),
        ("PSYNC_OPENAI_API_KEY", "sk-test".to_string()),
        ("PSYNC_OPENAI_BASE_URL", format!("{base}/v1")),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    AppConfig::from_lookup(|key| vars.get(key).cloned()).expect("config")
}

fn expired_cookie() -> String {
    let mut pair = CredentialPair::new("ya29.stale");
    pair.refresh_token = Some("R".to_string());
    pair.expiry = Some(Utc::now() - Duration::minutes(10));
    let value = CredentialCodec::default().encode(&pair).expect("encode");
    format!("psync_gmail_tokens={value}")
}

fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("psync-http-it-{}.db", Uuid::new_v4()))
}

#[tokio::test]
async fn sync_endpoint_refreshes_token_classifies_and_persists() {
    let base = spawn_providers().await;
    let path = temp_db_path();
    let db = Database::open(&path).expect("open db");
    db.upsert_partner(&Partner::new("p-1", "Maple College", "a@x.com"))
        .expect("insert partner");
    let store = SharedDatabase::new(db);
    let app = router(Arc::new(AppState::new(config(&base), Some(store.clone()))));

    let body = json!({
        "partners": [
            { "id": "p-1", "name": "Maple College", "contactEmail": "a@x.com", "status": "contacted" },
            { "id": 2, "name": "No Contact Inc" },
            { "id": 3, "name": "Down University", "contactEmail": "down@x.com" },
            { "id": 4, "name": "Quiet Institute", "contactEmail": "quiet@x.com" }
        ]
    });
    let response = app
        .oneshot(
            Request::post("/api/gmail/sync")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::COOKIE, expired_cookie())
                .body(Body::from(body.to_string()))
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let set_cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .expect("refreshed credential cookie")
        .to_string();
    assert!(set_cookie.contains("HttpOnly"));
    assert!(set_cookie.contains("Max-Age=604800"));
    let cookie_value = set_cookie
        .split(';')
        .next()
        .and_then(|pair| pair.strip_prefix("psync_gmail_tokens="))
        .expect("cookie value");
    let refreshed = CredentialCodec::default()
        .decode(cookie_value)
        .expect("decode cookie");
    assert_eq!(refreshed.access_token, "ya29.fresh");
    assert_eq!(refreshed.refresh_token.as_deref(), Some("R"));

    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let result: Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(result["success"], true);
    assert_eq!(result["processedCount"], 1);
    let results = result["results"].as_array().expect("results");
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["partnerId"], "p-1");
    assert_eq!(results[0]["emailsCount"], 2);
    assert_eq!(results[0]["status"], "interested");
    assert_eq!(
        results[0]["proposedReply"],
        "Dear Registrar, attached are our terms."
    );
    assert_eq!(results[1]["partnerId"], 3);
    assert_eq!(results[1]["success"], false);
    assert!(results[1]["error"].as_str().expect("error").contains("503"));

    let saved = store
        .with(|db| db.get_partner("p-1"))
        .expect("get partner")
        .expect("partner");
    assert_eq!(saved.status, PartnerStatus::Interested);
    assert_eq!(
        saved.last_update_note.as_deref(),
        Some("Registrar wants the commission terms\nNext: Send terms")
    );
    let ids: Vec<_> = saved.emails.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["m2", "m1"]);
    assert!(saved.emails[1].is_inbound);
    assert!(!saved.emails[0].is_inbound);

    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn revoked_refresh_token_surfaces_as_partner_failures() {
    let base = spawn_providers().await;
    let app = router(Arc::new(AppState::new(config(&base), None)));

    let mut pair = CredentialPair::new("ya29.stale");
    pair.refresh_token = Some("revoked".to_string());
    pair.expiry = Some(Utc::now() - Duration::minutes(10));
    let cookie = format!(
        "psync_gmail_tokens={}",
        CredentialCodec::default().encode(&pair).expect("encode")
    );

    let response = app
        .oneshot(
            Request::post("/api/gmail/sync")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::COOKIE, cookie)
                .body(Body::from(
                    json!({ "partners": [{ "id": 1, "name": "Maple", "contactEmail": "a@x.com" }] })
                        .to_string(),
                ))
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(header::SET_COOKIE).is_none());
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let result: Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(result["processedCount"], 0);
    assert_eq!(result["results"][0]["success"], false);
    assert!(result["results"][0]["error"]
        .as_str()
        .expect("error")
        .contains("401"));
}

#[tokio::test]
async fn callback_stores_tokens_and_expires_state_nonce() {
    let base = spawn_providers().await;
    let app = router(Arc::new(AppState::new(config(&base), None)));

    let response = app
        .oneshot(
            Request::get("/auth/google/callback?code=C&state=n0nce")
                .header(header::COOKIE, "psync_oauth_state=n0nce")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let cookies: Vec<String> = response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect();
    assert_eq!(cookies.len(), 2);

    let tokens = cookies
        .iter()
        .find_map(|c| c.split(';').next().and_then(|p| p.strip_prefix("psync_gmail_tokens=")))
        .expect("credential cookie");
    let pair = CredentialCodec::default().decode(tokens).expect("decode cookie");
    assert_eq!(pair.access_token, "ya29.first");
    assert_eq!(pair.refresh_token.as_deref(), Some("R"));

    let state = cookies
        .iter()
        .find(|c| c.starts_with("psync_oauth_state="))
        .expect("state cookie");
    assert!(state.starts_with("psync_oauth_state=;"));
    assert!(state.contains("Path=/auth"));
    assert!(state.contains("Max-Age=0"));
}
