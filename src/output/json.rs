use anyhow::Result;

use crate::db::models::Partner;
use crate::db::DatabaseStats;
use crate::sync::SyncReport;

pub fn format_sync_report(report: &SyncReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(&report.response())?)
}

pub fn format_partners(partners: &[Partner]) -> Result<String> {
    Ok(serde_json::to_string_pretty(partners)?)
}

pub fn format_partner(partner: &Partner) -> Result<String> {
    Ok(serde_json::to_string_pretty(partner)?)
}

pub fn format_stats(stats: &DatabaseStats) -> Result<String> {
    Ok(serde_json::to_string_pretty(stats)?)
}
