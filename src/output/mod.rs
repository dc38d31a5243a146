pub mod json;
pub mod table;

use anyhow::Result;

use crate::db::models::Partner;
use crate::db::DatabaseStats;
use crate::sync::SyncReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Table
        }
    }
}

pub fn format_sync_report(format: OutputFormat, report: &SyncReport) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_sync_report(report)),
        OutputFormat::Json => json::format_sync_report(report),
    }
}

pub fn format_partners(format: OutputFormat, partners: &[Partner]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_partners(partners)),
        OutputFormat::Json => json::format_partners(partners),
    }
}

pub fn format_partner(format: OutputFormat, partner: &Partner) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_partner(partner)),
        OutputFormat::Json => json::format_partner(partner),
    }
}

pub fn format_stats(format: OutputFormat, stats: &DatabaseStats) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_stats(stats)),
        OutputFormat::Json => json::format_stats(stats),
    }
}
