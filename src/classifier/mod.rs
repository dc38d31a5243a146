//! Relationship-status classification of a partner conversation by a
//! chat-completion model in JSON-object mode.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::db::models::PartnerStatus;

pub mod openai;

pub const DEFAULT_SUMMARY_LANGUAGE: &str = "English";

#[async_trait]
pub trait ChatCompletion: Send + Sync {
    /// One system + user exchange; returns the raw text of the first choice.
    async fn complete_json(&self, system: &str, user: &str) -> Result<String>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub status: String,
    pub summary: String,
    pub next_action: String,
    pub proposed_reply: String,
}

impl Verdict {
    pub fn is_empty(&self) -> bool {
        self.status.is_empty()
            && self.summary.is_empty()
            && self.next_action.is_empty()
            && self.proposed_reply.is_empty()
    }

    /// The status keyword, if it names a known status.
    pub fn status(&self) -> Option<PartnerStatus> {
        self.status.parse().ok()
    }

    /// Summary followed by the next action, blank when the model gave neither.
    pub fn update_note(&self) -> String {
        match (self.summary.trim(), self.next_action.trim()) {
            ("", "") => String::new(),
            (summary, "") => summary.to_string(),
            ("", next) => format!("Next: {next}"),
            (summary, next) => format!("{summary}\nNext: {next}"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerdictError {
    #[error("model output is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("model output is not a JSON object")]
    NotAnObject,
}

/// Strict parse of a model response. Fields of the wrong type are treated as
/// absent; only a non-object payload is an error.
pub fn parse_verdict(raw: &str) -> Result<Verdict, VerdictError> {
    let value: Value =
        serde_json::from_str(raw.trim()).map_err(|e| VerdictError::InvalidJson(e.to_string()))?;
    let object = value.as_object().ok_or(VerdictError::NotAnObject)?;

    let field = |name: &str| {
        object
            .get(name)
            .and_then(Value::as_str)
            .map(|value| value.trim().to_string())
            .unwrap_or_default()
    };

    Ok(Verdict {
        status: field("status"),
        summary: field("summary"),
        next_action: field("nextAction"),
        proposed_reply: field("proposedReply"),
    })
}

pub struct Classifier {
    chat: Arc<dyn ChatCompletion>,
    summary_language: String,
}

impl Classifier {
    pub fn new(chat: Arc<dyn ChatCompletion>, summary_language: impl Into<String>) -> Self {
        Self {
            chat,
            summary_language: summary_language.into(),
        }
    }

    /// A request failure is an error; an unusable response is an empty verdict.
    pub async fn classify(&self, transcript: &str, partner_name: &str) -> Result<Verdict> {
        let system = system_prompt(&self.summary_language);
        let user = user_prompt(transcript, partner_name);
        let raw = self.chat.complete_json(&system, &user).await?;

        match parse_verdict(&raw) {
            Ok(verdict) => Ok(verdict),
            Err(error) => {
                warn!(partner = partner_name, "ignoring unusable classifier output: {error}");
                Ok(Verdict::default())
            }
        }
    }
}

fn system_prompt(summary_language: &str) -> String {
    let statuses = PartnerStatus::ALL
        .iter()
        .map(PartnerStatus::as_str)
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "You track partnerships between an education agency and partner institutions. \
Read the email conversation with one partner and decide where the relationship stands.\n\
Choose status from exactly one of: {statuses}.\n\
Write summary and nextAction in {summary_language}. \
Write proposedReply in the language the partner uses in the conversation.\n\
Respond with a single JSON object and nothing else:\n\
{{\"status\": \"...\", \"summary\": \"...\", \"nextAction\": \"...\", \"proposedReply\": \"...\"}}"
    )
}

fn user_prompt(transcript: &str, partner_name: &str) -> String {
    format!("Partner: {partner_name}\n\nConversation (most recent first):\n\n{transcript}")
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;

    use super::{parse_verdict, system_prompt, ChatCompletion, Classifier, Verdict, VerdictError};
    use crate::db::models::PartnerStatus;

    struct CannedChat {
        reply: Result<String, String>,
        prompts: Mutex<Vec<(String, String)>>,
    }

    impl CannedChat {
        fn new(reply: Result<&str, &str>) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.map(str::to_string).map_err(str::to_string),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatCompletion for CannedChat {
        async fn complete_json(&self, system: &str, user: &str) -> Result<String> {
            self.prompts
                .lock()
                .expect("lock")
                .push((system.to_string(), user.to_string()));
            self.reply.clone().map_err(|e| anyhow!(e))
        }
    }

    #[test]
    fn parse_reads_all_fields() {
        let verdict = parse_verdict(
            r#"{"status":"negotiation","summary":"Terms under discussion","nextAction":"Send contract","proposedReply":"Dear team"}"#,
        )
        .expect("parse");
        assert_eq!(verdict.status(), Some(PartnerStatus::Negotiation));
        assert_eq!(verdict.next_action, "Send contract");
        assert_eq!(verdict.update_note(), "Terms under discussion\nNext: Send contract");
    }

    #[test]
    fn parse_rejects_non_objects_and_ignores_wrong_types() {
        assert!(matches!(
            parse_verdict("Sure! Here is the JSON"),
            Err(VerdictError::InvalidJson(_))
        ));
        assert_eq!(parse_verdict("[1,2]"), Err(VerdictError::NotAnObject));

        let verdict = parse_verdict(r#"{"status": 3, "summary": "ok"}"#).expect("parse");
        assert_eq!(verdict.status, "");
        assert_eq!(verdict.summary, "ok");
    }

    #[test]
    fn unknown_status_keyword_is_none() {
        let verdict = Verdict {
            status: "ghosted".to_string(),
            ..Verdict::default()
        };
        assert!(verdict.status().is_none());
        assert_eq!(Verdict::default().update_note(), "");
    }

    #[test]
    fn system_prompt_lists_every_status() {
        let prompt = system_prompt("Spanish");
        for status in PartnerStatus::ALL {
            assert!(prompt.contains(status.as_str()));
        }
        assert!(prompt.contains("in Spanish"));
        assert!(prompt.contains("\"proposedReply\""));
    }

    #[tokio::test]
    async fn malformed_output_degrades_to_empty_verdict() {
        let chat = CannedChat::new(Ok("{not json"));
        let classifier = Classifier::new(chat.clone(), "English");

        let verdict = classifier
            .classify("From: a@x.com", "Maple College")
            .await
            .expect("classify");
        assert!(verdict.is_empty());

        let prompts = chat.prompts.lock().expect("lock");
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].1.contains("Maple College"));
        assert!(prompts[0].1.contains("From: a@x.com"));
    }

    #[tokio::test]
    async fn transport_failure_is_an_error() {
        let classifier = Classifier::new(CannedChat::new(Err("connection reset")), "English");
        let error = classifier
            .classify("From: a@x.com", "Maple College")
            .await
            .expect_err("transport");
        assert!(error.to_string().contains("connection reset"));
    }
}
