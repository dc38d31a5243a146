use std::time::Duration as StdDuration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::warn;

use super::{MailApi, MessageMetadata};
use crate::oauth::redact_response_body;

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const MAX_PAGE_SIZE: usize = 100;
const MAX_RATE_LIMIT_RETRIES: usize = 5;
const METADATA_HEADERS: &[&str] = &["Subject", "From", "Date"];

/// Authenticated Gmail handle for one batch.
#[derive(Debug, Clone)]
pub struct GmailClient {
    client: Client,
    api_base: String,
    access_token: String,
}

impl GmailClient {
    pub fn new(client: Client, api_base: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    async fn fetch_with_retry(&self, url: &str, query: &[(&str, String)]) -> Result<String> {
        let mut backoff_seconds = 1u64;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let response = self
                .client
                .get(url)
                .query(query)
                .bearer_auth(&self.access_token)
                .header("accept", "application/json")
                .send()
                .await
                .with_context(|| format!("gmail api request: {url}"))?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt == MAX_RATE_LIMIT_RETRIES {
                    let body = response
                        .text()
                        .await
                        .context("read gmail 429 response body")?;
                    return Err(anyhow!(
                        "gmail api request exhausted retries: {}",
                        redact_response_body(&body)
                    ));
                }

                let retry_after_seconds = response
                    .headers()
                    .get("retry-after")
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(backoff_seconds);

                warn!(attempt, retry_after_seconds, "gmail rate limited");
                sleep(StdDuration::from_secs(retry_after_seconds)).await;
                backoff_seconds = (backoff_seconds * 2).min(32);
                continue;
            }

            let status = response.status();
            let body = response
                .text()
                .await
                .context("read gmail api response body")?;
            if !status.is_success() {
                return Err(anyhow!(
                    "gmail api request failed: status={} body={}",
                    status,
                    redact_response_body(&body)
                ));
            }

            return Ok(body);
        }

        Err(anyhow!("gmail api request failed without response"))
    }
}

#[async_trait]
impl MailApi for GmailClient {
    async fn search_message_ids(&self, query: &str, max: usize) -> Result<Vec<String>> {
        let url = format!("{}/users/me/messages", self.api_base);
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        while ids.len() < max {
            let mut params = vec![
                ("q", query.to_string()),
                ("maxResults", (max - ids.len()).min(MAX_PAGE_SIZE).to_string()),
            ];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }

            let body = self.fetch_with_retry(&url, &params).await?;
            let page: GmailMessageList =
                serde_json::from_str(&body).context("decode gmail message list")?;
            ids.extend(page.messages.unwrap_or_default().into_iter().map(|m| m.id));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        ids.truncate(max);
        Ok(ids)
    }

    async fn message_metadata(&self, id: &str) -> Result<MessageMetadata> {
        let url = format!("{}/users/me/messages/{id}", self.api_base);
        let mut params = vec![("format", "metadata".to_string())];
        params.extend(
            METADATA_HEADERS
                .iter()
                .map(|header| ("metadataHeaders", header.to_string())),
        );

        let body = self.fetch_with_retry(&url, &params).await?;
        let message: GmailMessage =
            serde_json::from_str(&body).context("decode gmail message metadata")?;
        Ok(message.into_metadata())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GmailMessageList {
    messages: Option<Vec<GmailMessageStub>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailMessageStub {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailMessage {
    id: String,
    snippet: Option<String>,
    payload: Option<GmailPayload>,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailPayload {
    headers: Option<Vec<GmailHeader>>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

impl GmailMessage {
    fn into_metadata(self) -> MessageMetadata {
        let header = |name: &str| {
            self.payload
                .as_ref()
                .and_then(|payload| payload.headers.as_deref())
                .unwrap_or_default()
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| h.value.clone())
        };

        MessageMetadata {
            subject: header("Subject"),
            from: header("From"),
            date_header: header("Date"),
            internal_date: self
                .internal_date
                .as_deref()
                .and_then(|raw| raw.parse::<i64>().ok()),
            snippet: self.snippet.clone(),
            id: self.id.clone(),
        }
    }
}
