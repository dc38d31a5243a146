use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::Client;

use crate::classifier::openai::{OpenAiChatClient, DEFAULT_MODEL, OPENAI_BASE_URL};
use crate::classifier::{Classifier, DEFAULT_SUMMARY_LANGUAGE};
use crate::credentials::CredentialCodec;
use crate::crypto::{self, SealingKey};
use crate::mailbox::gmail::GMAIL_API_BASE;
use crate::oauth::{OAuthApp, GOOGLE_TOKEN_URL};
use crate::sync::{SyncError, SyncOptions};

pub const ENV_PREFIX: &str = "PSYNC_";
pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:8787/auth/google/callback";
pub const DEFAULT_BIND: &str = "127.0.0.1:8787";

/// Runtime settings, read from `PSYNC_*` environment variables.
#[derive(Clone)]
pub struct AppConfig {
    pub gmail_client_id: Option<String>,
    pub gmail_client_secret: Option<String>,
    pub gmail_redirect_uri: String,
    pub gmail_token_url: String,
    pub gmail_api_base: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub summary_language: String,
    pub sync: SyncOptions,
    pub token_key: Option<SealingKey>,
    pub db_path: Option<PathBuf>,
    pub bind: SocketAddr,
    pub secure_cookies: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `lookup` receives full variable names; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(&format!("{ENV_PREFIX}{key}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = SyncOptions::default();

        let max_messages = match get("MAX_MESSAGES") {
            Some(raw) => parse_positive("MAX_MESSAGES", &raw)? as usize,
            None => defaults.max_messages,
        };
        let partner_timeout = match get("PARTNER_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(parse_positive("PARTNER_TIMEOUT_SECS", &raw)?),
            None => defaults.partner_timeout,
        };
        let batch_deadline = match get("BATCH_DEADLINE_SECS") {
            Some(raw) => Duration::from_secs(parse_positive("BATCH_DEADLINE_SECS", &raw)?),
            None => defaults.batch_deadline,
        };

        let token_key = get("TOKEN_KEY")
            .map(|raw| crypto::parse_key_hex(&raw))
            .transpose()
            .context("invalid PSYNC_TOKEN_KEY (expected 64 hex characters)")?;

        let bind_raw = get("BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind_raw
            .parse()
            .with_context(|| format!("invalid PSYNC_BIND address: {bind_raw}"))?;

        let secure_cookies = match get("SECURE_COOKIES").as_deref() {
            None => false,
            Some(raw) => parse_bool(raw)
                .ok_or_else(|| anyhow!("invalid PSYNC_SECURE_COOKIES value: {raw}"))?,
        };

        Ok(Self {
            gmail_client_id: get("GMAIL_CLIENT_ID"),
            gmail_client_secret: get("GMAIL_CLIENT_SECRET"),
            gmail_redirect_uri: get("GMAIL_REDIRECT_URI")
                .unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string()),
            gmail_token_url: get("GMAIL_TOKEN_URL").unwrap_or_else(|| GOOGLE_TOKEN_URL.to_string()),
            gmail_api_base: get("GMAIL_API_BASE").unwrap_or_else(|| GMAIL_API_BASE.to_string()),
            openai_api_key: get("OPENAI_API_KEY"),
            openai_base_url: get("OPENAI_BASE_URL").unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            openai_model: get("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            summary_language: get("SUMMARY_LANGUAGE")
                .unwrap_or_else(|| DEFAULT_SUMMARY_LANGUAGE.to_string()),
            sync: SyncOptions {
                max_messages,
                partner_timeout,
                batch_deadline,
            },
            token_key,
            db_path: get("DB_PATH").map(PathBuf::from),
            bind,
            secure_cookies,
        })
    }

    pub fn oauth_app(&self) -> Result<OAuthApp, SyncError> {
        let (Some(client_id), Some(client_secret)) =
            (&self.gmail_client_id, &self.gmail_client_secret)
        else {
            return Err(SyncError::Config(
                "missing gmail client id/secret (PSYNC_GMAIL_CLIENT_ID/PSYNC_GMAIL_CLIENT_SECRET)"
                    .to_string(),
            ));
        };

        Ok(OAuthApp {
            client_id: client_id.clone(),
            client_secret: client_secret.clone(),
            redirect_uri: self.gmail_redirect_uri.clone(),
            token_url: self.gmail_token_url.clone(),
        })
    }

    pub fn credential_codec(&self) -> CredentialCodec {
        CredentialCodec::new(self.token_key)
    }

    pub fn classifier(&self, http: Client) -> Result<Classifier, SyncError> {
        let api_key = self.openai_api_key.clone().ok_or_else(|| {
            SyncError::Config("missing language model API key (PSYNC_OPENAI_API_KEY)".to_string())
        })?;
        let chat = OpenAiChatClient::new(
            http,
            self.openai_base_url.clone(),
            Some(api_key),
            self.openai_model.clone(),
        );
        Ok(Classifier::new(Arc::new(chat), self.summary_language.clone()))
    }
}

fn parse_positive(key: &str, raw: &str) -> Result<u64> {
    match raw.parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(anyhow!("invalid {ENV_PREFIX}{key} value: {raw} (expected a positive integer)")),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::AppConfig;
    use crate::sync::SyncError;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<AppConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_preserve_ten_message_window() {
        let config = config(&[]).expect("config");
        assert_eq!(config.sync.max_messages, 10);
        assert_eq!(config.sync.partner_timeout, Duration::from_secs(120));
        assert_eq!(config.openai_model, "gpt-4o-mini");
        assert_eq!(config.bind.to_string(), "127.0.0.1:8787");
        assert!(!config.secure_cookies);
        assert!(!config.credential_codec().is_sealed());
    }

    #[test]
    fn missing_app_credentials_is_a_config_error() {
        let config = config(&[("PSYNC_GMAIL_CLIENT_ID", "id"), ("PSYNC_GMAIL_CLIENT_SECRET", "  ")])
            .expect("config");
        assert!(matches!(config.oauth_app(), Err(SyncError::Config(_))));
        assert!(matches!(
            config.classifier(reqwest::Client::new()),
            Err(SyncError::Config(_))
        ));
    }

    #[test]
    fn overrides_are_applied() {
        let config = config(&[
            ("PSYNC_GMAIL_CLIENT_ID", "id"),
            ("PSYNC_GMAIL_CLIENT_SECRET", "secret"),
            ("PSYNC_MAX_MESSAGES", "25"),
            ("PSYNC_SECURE_COOKIES", "true"),
            (
                "PSYNC_TOKEN_KEY",
                "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff",
            ),
        ])
        .expect("config");

        let app = config.oauth_app().expect("oauth app");
        assert_eq!(app.client_secret, "secret");
        assert_eq!(config.sync.max_messages, 25);
        assert!(config.secure_cookies);
        assert!(config.credential_codec().is_sealed());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(config(&[("PSYNC_MAX_MESSAGES", "0")]).is_err());
        assert!(config(&[("PSYNC_TOKEN_KEY", "abc")]).is_err());
        assert!(config(&[("PSYNC_BIND", "nowhere")]).is_err());
        assert!(config(&[("PSYNC_SECURE_COOKIES", "maybe")]).is_err());
    }
}
