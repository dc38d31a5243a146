use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{Result as SqlResult, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PartnerStatus {
    #[default]
    Prospect,
    Contacted,
    Interested,
    Applying,
    Submitted,
    UnderReview,
    Negotiation,
    ContractSent,
    Active,
    Rejected,
    Dormant,
    OnHold,
}

impl PartnerStatus {
    pub const ALL: [PartnerStatus; 12] = [
        Self::Prospect,
        Self::Contacted,
        Self::Interested,
        Self::Applying,
        Self::Submitted,
        Self::UnderReview,
        Self::Negotiation,
        Self::ContractSent,
        Self::Active,
        Self::Rejected,
        Self::Dormant,
        Self::OnHold,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prospect => "prospect",
            Self::Contacted => "contacted",
            Self::Interested => "interested",
            Self::Applying => "applying",
            Self::Submitted => "submitted",
            Self::UnderReview => "under_review",
            Self::Negotiation => "negotiation",
            Self::ContractSent => "contract_sent",
            Self::Active => "active",
            Self::Rejected => "rejected",
            Self::Dormant => "dormant",
            Self::OnHold => "on_hold",
        }
    }
}

impl Display for PartnerStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PartnerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| format!("invalid partner status: {}", s.trim()))
    }
}

/// Partner identity as supplied by the caller. Numeric and string ids are both
/// accepted and echoed back in the same shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum PartnerId {
    Number(i64),
    Text(String),
}

impl Display for PartnerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl From<&str> for PartnerId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for PartnerId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EmailRecord {
    pub id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_inbound: bool,
}

/// Newest first; records without a timestamp go last.
pub fn sort_newest_first(records: &mut [EmailRecord]) {
    records.sort_by(|a, b| match (a.date, b.date) {
        (Some(left), Some(right)) => right.cmp(&left),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Partner {
    pub id: PartnerId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub status: PartnerStatus,
    #[serde(default)]
    pub last_update_note: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient")]
    pub emails: Vec<EmailRecord>,
}

impl Partner {
    pub fn new(id: impl Into<PartnerId>, name: impl Into<String>, contact_email: &str) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            contact_email: Some(contact_email.to_string()),
            status: PartnerStatus::default(),
            last_update_note: None,
            updated_at: None,
            emails: Vec::new(),
        }
    }

    /// Trimmed contact address, or `None` when the partner is not eligible for sync.
    pub fn contact_email(&self) -> Option<&str> {
        self.contact_email
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let status_raw: String = row.get("status")?;
        let updated_at: Option<String> = row.get("updated_at")?;
        let emails_raw: Option<String> = row.get("emails")?;

        Ok(Self {
            id: PartnerId::Text(row.get("id")?),
            name: row.get("name")?,
            contact_email: row.get("contact_email")?,
            status: status_raw.parse().unwrap_or_default(),
            last_update_note: row.get("last_update_note")?,
            updated_at: updated_at.and_then(|raw| {
                DateTime::parse_from_rfc3339(&raw)
                    .ok()
                    .map(|value| value.with_timezone(&Utc))
            }),
            emails: emails_raw
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_default(),
        })
    }
}

/// Fields written back to a partner record after a successful scan.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncUpdate {
    /// `None` leaves the stored status untouched.
    pub status: Option<PartnerStatus>,
    pub last_update_note: String,
    pub updated_at: DateTime<Utc>,
    pub emails: Vec<EmailRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KvState {
    pub key: String,
    pub value: Option<String>,
    pub updated_at: Option<String>,
}

impl KvState {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            key: row.get("key")?,
            value: row.get("value")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

// Caller-supplied records come from an admin UI of varying vintage; a field
// with an unexpected shape falls back to its default instead of rejecting
// the whole batch.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}
