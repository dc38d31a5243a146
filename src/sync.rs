//! Batch sync: scan, classify and write back each partner in turn.
//!
//! Partners are processed sequentially against one mail handle. A failure
//! while handling one partner is recorded in that partner's outcome and never
//! stops the batch.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::classifier::{Classifier, Verdict};
use crate::db::models::{sort_newest_first, EmailRecord, Partner, PartnerId, PartnerStatus, SyncUpdate};
use crate::db::PartnerStore;
use crate::mailbox::{scan_partner, MailApi, DEFAULT_MAX_MESSAGES};

pub const DEFAULT_PARTNER_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_BATCH_DEADLINE_SECS: u64 = 900;

/// Conditions that stop a batch before any partner is looked at.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("gmail account not connected")]
    NotConnected,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("upstream error: {0}")]
    Upstream(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub max_messages: usize,
    pub partner_timeout: Duration,
    pub batch_deadline: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            partner_timeout: Duration::from_secs(DEFAULT_PARTNER_TIMEOUT_SECS),
            batch_deadline: Duration::from_secs(DEFAULT_BATCH_DEADLINE_SECS),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub partner_id: PartnerId,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emails_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PartnerStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposed_reply: Option<String>,
}

impl SyncOutcome {
    fn failed(partner_id: PartnerId, error: String) -> Self {
        Self {
            partner_id,
            success: false,
            emails_count: None,
            error: Some(error),
            status: None,
            proposed_reply: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingContact,
    NoMessages,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SkippedPartner {
    pub partner_id: PartnerId,
    pub reason: SkipReason,
}

/// Outcomes in input order. Skipped partners are kept apart and are neither
/// successes nor failures.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub outcomes: Vec<SyncOutcome>,
    pub skipped: Vec<SkippedPartner>,
}

impl SyncReport {
    pub fn processed_count(&self) -> usize {
        self.outcomes.iter().filter(|outcome| outcome.success).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.processed_count()
    }

    pub fn response(&self) -> SyncResponse<'_> {
        SyncResponse {
            success: true,
            results: &self.outcomes,
            processed_count: self.processed_count(),
        }
    }
}

/// Wire shape of a completed batch.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse<'a> {
    pub success: bool,
    pub results: &'a [SyncOutcome],
    pub processed_count: usize,
}

enum PartnerState {
    Skipped(SkipReason),
    Synced {
        emails_count: usize,
        status: Option<PartnerStatus>,
        proposed_reply: Option<String>,
    },
    Failed(String),
}

pub struct SyncOrchestrator<'a> {
    mail: &'a dyn MailApi,
    classifier: &'a Classifier,
    store: Option<&'a dyn PartnerStore>,
    options: SyncOptions,
}

impl<'a> SyncOrchestrator<'a> {
    pub fn new(
        mail: &'a dyn MailApi,
        classifier: &'a Classifier,
        store: Option<&'a dyn PartnerStore>,
        options: SyncOptions,
    ) -> Self {
        Self {
            mail,
            classifier,
            store,
            options,
        }
    }

    pub async fn sync(&self, partners: &[Partner]) -> SyncReport {
        let started = Instant::now();
        let mut report = SyncReport::default();

        for partner in partners {
            let state = self.run_partner(partner, started).await;
            let partner_id = partner.id.clone();

            match state {
                PartnerState::Skipped(reason) => {
                    debug!(partner_id = %partner_id, ?reason, "partner skipped");
                    report.skipped.push(SkippedPartner { partner_id, reason });
                }
                PartnerState::Synced {
                    emails_count,
                    status,
                    proposed_reply,
                } => {
                    info!(partner_id = %partner_id, emails = emails_count, ?status, "partner synced");
                    report.outcomes.push(SyncOutcome {
                        partner_id,
                        success: true,
                        emails_count: Some(emails_count),
                        error: None,
                        status,
                        proposed_reply,
                    });
                }
                PartnerState::Failed(error) => {
                    warn!(partner_id = %partner_id, "partner sync failed: {error}");
                    report.outcomes.push(SyncOutcome::failed(partner_id, error));
                }
            }
        }

        info!(
            processed = report.processed_count(),
            failed = report.failed_count(),
            skipped = report.skipped.len(),
            "sync batch finished"
        );
        report
    }

    async fn run_partner(&self, partner: &Partner, started: Instant) -> PartnerState {
        let Some(contact) = partner.contact_email() else {
            return PartnerState::Skipped(SkipReason::MissingContact);
        };

        let remaining = self
            .options
            .batch_deadline
            .saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return PartnerState::Failed("batch deadline exceeded".to_string());
        }

        let limit = self.options.partner_timeout.min(remaining);
        match timeout(limit, self.sync_partner(partner, contact)).await {
            Ok(Ok(state)) => state,
            Ok(Err(error)) => PartnerState::Failed(format!("{error:#}")),
            Err(_) => PartnerState::Failed(format!(
                "timed out after {}ms",
                limit.as_millis()
            )),
        }
    }

    async fn sync_partner(&self, partner: &Partner, contact: &str) -> Result<PartnerState> {
        let scan = scan_partner(self.mail, contact, self.options.max_messages).await?;
        if scan.is_empty() {
            return Ok(PartnerState::Skipped(SkipReason::NoMessages));
        }

        let verdict = self
            .classifier
            .classify(&scan.transcript, &partner.name)
            .await
            .context("classify conversation")?;
        let update = build_sync_update(&verdict, scan.records, Utc::now());

        match self.store {
            Some(store) => store
                .apply_sync_update(&partner.id, &update)
                .context("write partner record")?,
            None => warn!(
                partner_id = %partner.id,
                "partner store unavailable, skipping write-back"
            ),
        }

        Ok(PartnerState::Synced {
            emails_count: update.emails.len(),
            status: update.status,
            proposed_reply: Some(verdict.proposed_reply).filter(|reply| !reply.is_empty()),
        })
    }
}

/// Record fields written after classification. An unrecognised or missing
/// status is left out so the stored one survives the write.
pub fn build_sync_update(
    verdict: &Verdict,
    mut emails: Vec<EmailRecord>,
    now: DateTime<Utc>,
) -> SyncUpdate {
    sort_newest_first(&mut emails);
    SyncUpdate {
        status: verdict.status(),
        last_update_note: verdict.update_note(),
        updated_at: now,
        emails,
    }
}
