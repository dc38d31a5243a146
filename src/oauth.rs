//! OAuth 2.0 for the mail provider: authorization-code exchange, refresh, and
//! the token manager that turns stored credentials into a mail handle.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::credentials::{CredentialPair, CredentialStore};
use crate::mailbox::gmail::GmailClient;

pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const GMAIL_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.readonly",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
];
const EXPIRY_SKEW_SECONDS: i64 = 60;
const REDACTED_BODY_MAX_LEN: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

impl TokenResponse {
    /// Credentials from an authorization-code exchange.
    pub fn into_pair(self, now: DateTime<Utc>) -> CredentialPair {
        merge_token_response(&CredentialPair::new(String::new()), self, now)
    }
}

/// Lays a token response over stored credentials. Fields the provider omits
/// keep their stored value; in particular a refresh response usually carries
/// no `refresh_token`, and the stored one must survive.
pub fn merge_token_response(
    stored: &CredentialPair,
    response: TokenResponse,
    now: DateTime<Utc>,
) -> CredentialPair {
    let mut merged = stored.clone();
    merged.access_token = response.access_token;
    if let Some(refresh_token) = response.refresh_token.filter(|token| !token.is_empty()) {
        merged.refresh_token = Some(refresh_token);
    }
    if let Some(expires_in) = response.expires_in {
        merged.expiry = Some(now + Duration::seconds(expires_in));
    }
    // id_token is dropped; the pair has to fit in a cookie
    for (key, value) in [
        ("token_type", response.token_type),
        ("scope", response.scope),
    ] {
        if let Some(value) = value {
            merged
                .extra
                .insert(key.to_string(), serde_json::Value::String(value));
        }
    }
    merged
}

#[async_trait]
pub trait OAuthClient: Send + Sync {
    async fn exchange_code(&self, code: &str) -> Result<TokenResponse>;
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse>;
}

/// OAuth application registered with the mail provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthApp {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub token_url: String,
}

#[derive(Debug, Clone)]
pub struct GoogleOAuthClient {
    client: Client,
    app: OAuthApp,
}

impl GoogleOAuthClient {
    pub fn new(client: Client, app: OAuthApp) -> Self {
        Self { client, app }
    }

    /// Consent screen URL requesting offline access so a refresh token is issued.
    pub fn consent_url(&self, state: Option<&str>) -> Result<Url> {
        let scope = GMAIL_SCOPES.join(" ");
        let mut params = vec![
            ("client_id", self.app.client_id.as_str()),
            ("redirect_uri", self.app.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", scope.as_str()),
            ("access_type", "offline"),
            ("prompt", "consent"),
        ];
        if let Some(state) = state {
            params.push(("state", state));
        }
        Url::parse_with_params(GOOGLE_AUTH_URL, &params).context("build google consent url")
    }

    async fn post_token_request(&self, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self
            .client
            .post(&self.app.token_url)
            .form(form)
            .send()
            .await
            .with_context(|| format!("request oauth token from {}", self.app.token_url))?;

        let status = response.status();
        let body = response.text().await.context("read oauth token response")?;
        if !status.is_success() {
            return Err(anyhow!(
                "oauth token request failed: status={} body={}",
                status,
                redact_response_body(&body)
            ));
        }

        serde_json::from_str(&body).context("decode oauth token JSON response")
    }
}

#[async_trait]
impl OAuthClient for GoogleOAuthClient {
    async fn exchange_code(&self, code: &str) -> Result<TokenResponse> {
        self.post_token_request(&[
            ("client_id", self.app.client_id.as_str()),
            ("client_secret", self.app.client_secret.as_str()),
            ("redirect_uri", self.app.redirect_uri.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        self.post_token_request(&[
            ("client_id", self.app.client_id.as_str()),
            ("client_secret", self.app.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ])
        .await
    }
}

/// Produces an authenticated mail handle from the credential store,
/// refreshing expired access tokens on the way.
pub struct TokenManager {
    store: Arc<dyn CredentialStore>,
    oauth: Arc<dyn OAuthClient>,
    http: Client,
    api_base: String,
    refresh_lock: Mutex<()>,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        oauth: Arc<dyn OAuthClient>,
        http: Client,
        api_base: impl Into<String>,
    ) -> Self {
        Self {
            store,
            oauth,
            http,
            api_base: api_base.into(),
            refresh_lock: Mutex::new(()),
        }
    }

    /// `None` means "not connected"; callers treat every failure to read
    /// usable credentials the same way.
    pub async fn acquire(&self) -> Option<GmailClient> {
        let pair = self.acquire_credentials().await?;
        Some(GmailClient::new(
            self.http.clone(),
            self.api_base.clone(),
            pair.access_token,
        ))
    }

    pub async fn acquire_credentials(&self) -> Option<CredentialPair> {
        let skew = Duration::seconds(EXPIRY_SKEW_SECONDS);
        let pair = self.load_or_none()?;
        if !pair.is_expired_at(Utc::now(), skew) {
            return Some(pair);
        }

        let _guard = self.refresh_lock.lock().await;
        // another caller may have refreshed while we waited
        let pair = self.load_or_none()?;
        if !pair.is_expired_at(Utc::now(), skew) {
            return Some(pair);
        }

        let Some(refresh_token) = pair.refresh_token.clone() else {
            warn!("gmail access token expired and no refresh token is stored; using stale token");
            return Some(pair);
        };

        match self.oauth.refresh(&refresh_token).await {
            Ok(response) => {
                let merged = merge_token_response(&pair, response, Utc::now());
                if let Err(error) = self.store.save(&merged) {
                    warn!("failed to persist refreshed gmail credentials: {error}");
                }
                info!(expiry = ?merged.expiry, "refreshed gmail access token");
                Some(merged)
            }
            Err(error) => {
                warn!("gmail token refresh failed, continuing with stale token: {error:#}");
                Some(pair)
            }
        }
    }

    fn load_or_none(&self) -> Option<CredentialPair> {
        match self.store.load() {
            Ok(Some(pair)) => Some(pair),
            Ok(None) => {
                debug!("no gmail credentials stored");
                None
            }
            Err(error) => {
                warn!("discarding unreadable gmail credentials: {error}");
                None
            }
        }
    }
}

pub(crate) fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        return trimmed.to_string();
    }

    let mut cut = REDACTED_BODY_MAX_LEN;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}…[truncated {} bytes]",
        &trimmed[..cut],
        trimmed.len()
    )
}
