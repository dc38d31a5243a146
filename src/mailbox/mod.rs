//! Per-partner mailbox scan: search by contact address, fetch header
//! metadata, and flatten the hits into a transcript for classification.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use crate::db::models::EmailRecord;

pub mod gmail;

/// Default number of messages looked at per partner.
pub const DEFAULT_MAX_MESSAGES: usize = 10;

/// Header metadata and preview snippet of one message. Bodies are never fetched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMetadata {
    pub id: String,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub date_header: Option<String>,
    /// Provider receive time in epoch milliseconds.
    pub internal_date: Option<i64>,
    pub snippet: Option<String>,
}

#[async_trait]
pub trait MailApi: Send + Sync {
    /// Ids of the most recent messages matching `query`, newest first, at most `max`.
    async fn search_message_ids(&self, query: &str, max: usize) -> Result<Vec<String>>;
    async fn message_metadata(&self, id: &str) -> Result<MessageMetadata>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanResult {
    /// Records in retrieval order.
    pub records: Vec<EmailRecord>,
    pub transcript: String,
}

impl ScanResult {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub async fn scan_partner(
    api: &dyn MailApi,
    contact_email: &str,
    max_messages: usize,
) -> Result<ScanResult> {
    let ids = api
        .search_message_ids(contact_email, max_messages)
        .await
        .with_context(|| format!("search messages for {contact_email}"))?;
    if ids.is_empty() {
        debug!(contact = contact_email, "no messages found");
        return Ok(ScanResult::default());
    }

    let mut messages = Vec::with_capacity(ids.len());
    for id in ids.iter().take(max_messages) {
        let metadata = api
            .message_metadata(id)
            .await
            .with_context(|| format!("fetch metadata for message {id}"))?;
        messages.push(metadata);
    }

    let transcript = build_transcript(&messages);
    let records = messages
        .into_iter()
        .map(|message| to_email_record(message, contact_email))
        .collect();

    Ok(ScanResult {
        records,
        transcript,
    })
}

/// Heuristic: the sender string mentions the partner's address. Shared
/// mailboxes and display-name collisions can misclassify.
pub fn is_inbound(from: &str, contact_email: &str) -> bool {
    let needle = contact_email.trim().to_lowercase();
    !needle.is_empty() && from.to_lowercase().contains(&needle)
}

/// `Date` header first (RFC 2822, then RFC 3339), then the provider's
/// receive time. Unparseable input yields `None`.
pub fn parse_message_date(
    date_header: Option<&str>,
    internal_date_millis: Option<i64>,
) -> Option<DateTime<Utc>> {
    let from_header = date_header.map(str::trim).and_then(|raw| {
        DateTime::parse_from_rfc2822(raw)
            .or_else(|_| DateTime::parse_from_rfc3339(raw))
            .ok()
            .map(|value| value.with_timezone(&Utc))
    });

    from_header.or_else(|| {
        internal_date_millis.and_then(|millis| Utc.timestamp_millis_opt(millis).single())
    })
}

/// One `From / Date / Content` block per message, in the order given.
pub fn build_transcript(messages: &[MessageMetadata]) -> String {
    messages
        .iter()
        .map(|message| {
            let date = message.date_header.clone().unwrap_or_else(|| {
                parse_message_date(None, message.internal_date)
                    .map(|value| value.to_rfc3339())
                    .unwrap_or_default()
            });
            format!(
                "From: {}\nDate: {}\nContent: {}",
                message.from.as_deref().unwrap_or_default(),
                date,
                html_entity_decode(message.snippet.as_deref().unwrap_or_default())
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn to_email_record(message: MessageMetadata, contact_email: &str) -> EmailRecord {
    let date = parse_message_date(message.date_header.as_deref(), message.internal_date);
    let from = message.from.unwrap_or_default();
    EmailRecord {
        is_inbound: is_inbound(&from, contact_email),
        id: message.id,
        subject: message.subject.unwrap_or_default(),
        snippet: html_entity_decode(message.snippet.as_deref().unwrap_or_default()),
        from,
        date,
    }
}

// Gmail snippets arrive HTML-escaped. `&amp;` goes last so escaped entities
// like `&amp;lt;` decode once.
pub(crate) fn html_entity_decode(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&#x27;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}
