use chrono::{DateTime, Utc};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::db::models::{EmailRecord, Partner};
use crate::db::DatabaseStats;
use crate::sync::SyncReport;

const ID_WIDTH: usize = 10;
const NAME_WIDTH: usize = 28;
const CONTACT_WIDTH: usize = 28;
const STATUS_WIDTH: usize = 14;
const UPDATED_WIDTH: usize = 12;
const FROM_WIDTH: usize = 26;
const SUBJECT_WIDTH: usize = 48;
const RESULT_WIDTH: usize = 48;

pub fn format_sync_report(report: &SyncReport) -> String {
    if report.outcomes.is_empty() && report.skipped.is_empty() {
        return "No partners to sync.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:<id$}  {:<7}  {:>6}  {:<status$}  {}\n",
        "Partner",
        "Result",
        "Emails",
        "Status",
        "Detail",
        id = ID_WIDTH,
        status = STATUS_WIDTH
    ));
    out.push_str(&format!(
        "{}  {}  {}  {}  {}\n",
        "-".repeat(ID_WIDTH),
        "-".repeat(7),
        "-".repeat(6),
        "-".repeat(STATUS_WIDTH),
        "-".repeat(RESULT_WIDTH)
    ));

    for outcome in &report.outcomes {
        let result = if outcome.success { "ok" } else { "failed" };
        let detail = outcome
            .error
            .as_deref()
            .or(outcome.proposed_reply.as_deref().map(|_| "reply drafted"))
            .unwrap_or("");

        out.push_str(&format!(
            "{:<id$}  {:<7}  {:>6}  {:<status$}  {}\n",
            truncate_for_width(&outcome.partner_id.to_string(), ID_WIDTH),
            result,
            outcome
                .emails_count
                .map(|count| count.to_string())
                .unwrap_or_else(|| "-".to_string()),
            outcome.status.map(|s| s.as_str()).unwrap_or("-"),
            truncate_for_width(detail, RESULT_WIDTH),
            id = ID_WIDTH,
            status = STATUS_WIDTH
        ));
    }

    out.push('\n');
    out.push_str(&format!(
        "Processed: {}  Failed: {}  Skipped: {}\n",
        report.processed_count(),
        report.failed_count(),
        report.skipped.len()
    ));
    out
}

pub fn format_partners(partners: &[Partner]) -> String {
    if partners.is_empty() {
        return "No partners found.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:<id$}  {:<name$}  {:<contact$}  {:<status$}  {:<updated$}\n",
        "ID",
        "Name",
        "Contact",
        "Status",
        "Updated",
        id = ID_WIDTH,
        name = NAME_WIDTH,
        contact = CONTACT_WIDTH,
        status = STATUS_WIDTH,
        updated = UPDATED_WIDTH
    ));
    out.push_str(&format!(
        "{}  {}  {}  {}  {}\n",
        "-".repeat(ID_WIDTH),
        "-".repeat(NAME_WIDTH),
        "-".repeat(CONTACT_WIDTH),
        "-".repeat(STATUS_WIDTH),
        "-".repeat(UPDATED_WIDTH)
    ));

    for partner in partners {
        out.push_str(&format!(
            "{:<id$}  {:<name$}  {:<contact$}  {:<status$}  {:<updated$}\n",
            truncate_for_width(&partner.id.to_string(), ID_WIDTH),
            truncate_for_width(&partner.name, NAME_WIDTH),
            truncate_for_width(partner.contact_email().unwrap_or("-"), CONTACT_WIDTH),
            partner.status.as_str(),
            partner
                .updated_at
                .map(relative_date)
                .unwrap_or_else(|| "never".to_string()),
            id = ID_WIDTH,
            name = NAME_WIDTH,
            contact = CONTACT_WIDTH,
            status = STATUS_WIDTH,
            updated = UPDATED_WIDTH
        ));
    }

    out
}

pub fn format_partner(partner: &Partner) -> String {
    let mut out = String::new();
    out.push_str(&format!("ID: {}\n", partner.id));
    out.push_str(&format!("Name: {}\n", partner.name));
    out.push_str(&format!(
        "Contact: {}\n",
        partner.contact_email().unwrap_or("(none)")
    ));
    out.push_str(&format!("Status: {}\n", partner.status));
    match partner.updated_at {
        Some(updated_at) => out.push_str(&format!(
            "Updated: {} ({})\n",
            updated_at.to_rfc3339(),
            relative_date(updated_at)
        )),
        None => out.push_str("Updated: never\n"),
    }

    out.push('\n');
    out.push_str("Last update\n");
    out.push_str("-----------\n");
    out.push_str(
        partner
            .last_update_note
            .as_deref()
            .filter(|note| !note.trim().is_empty())
            .unwrap_or("(empty)"),
    );
    out.push('\n');

    if !partner.emails.is_empty() {
        out.push('\n');
        out.push_str(&format_emails(&partner.emails));
    }
    out
}

fn format_emails(emails: &[EmailRecord]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:<2}  {:<from$}  {:<subject$}  {}\n",
        "",
        "From",
        "Subject",
        "Date",
        from = FROM_WIDTH,
        subject = SUBJECT_WIDTH
    ));
    for email in emails {
        let direction = if email.is_inbound { "<-" } else { "->" };
        out.push_str(&format!(
            "{:<2}  {:<from$}  {:<subject$}  {}\n",
            direction,
            truncate_for_width(&email.from, FROM_WIDTH),
            truncate_for_width(
                if email.subject.is_empty() {
                    "(no subject)"
                } else {
                    &email.subject
                },
                SUBJECT_WIDTH
            ),
            email
                .date
                .map(relative_date)
                .unwrap_or_else(|| "-".to_string()),
            from = FROM_WIDTH,
            subject = SUBJECT_WIDTH
        ));
    }
    out
}

pub fn format_stats(stats: &DatabaseStats) -> String {
    let mut out = String::new();
    out.push_str("Partner Sync Stats\n");
    out.push_str("==================\n");
    out.push_str(&format!("Partners:     {}\n", stats.total_partners));
    out.push_str(&format!("With contact: {}\n", stats.partners_with_contact));

    if !stats.partners_by_status.is_empty() {
        out.push('\n');
        out.push_str("Partners by status\n");
        out.push_str("------------------\n");
        for row in &stats.partners_by_status {
            out.push_str(&format!("{:<16} {:>8}\n", row.status, row.count));
        }
    }

    out
}

fn relative_date(value: DateTime<Utc>) -> String {
    let delta = Utc::now().signed_duration_since(value);
    if delta.num_seconds() < 0 {
        return "in future".to_string();
    }
    if delta.num_minutes() < 1 {
        return "just now".to_string();
    }
    if delta.num_hours() < 1 {
        return format!("{}m ago", delta.num_minutes());
    }
    if delta.num_hours() < 24 {
        return format!("{}h ago", delta.num_hours());
    }
    if delta.num_days() == 1 {
        return "yesterday".to_string();
    }
    if delta.num_days() < 7 {
        return format!("{}d ago", delta.num_days());
    }
    value.format("%Y-%m-%d").to_string()
}

fn truncate_for_width(value: &str, max_width: usize) -> String {
    if UnicodeWidthStr::width(value) <= max_width {
        return value.to_string();
    }

    if max_width <= 1 {
        return "…".to_string();
    }

    let mut out = String::new();
    let mut width = 0usize;
    for c in value.chars() {
        let cw = UnicodeWidthChar::width(c).unwrap_or(0);
        if width + cw + 1 > max_width {
            break;
        }
        out.push(c);
        width += cw;
    }
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::db::models::{EmailRecord, Partner, PartnerId, PartnerStatus};
    use crate::sync::{SkipReason, SkippedPartner, SyncOutcome, SyncReport};

    use super::{format_partner, format_partners, format_sync_report, truncate_for_width};

    fn sample_partner() -> Partner {
        let mut partner = Partner::new(
            "p-1",
            "Universidad Autónoma de un nombre muy largo para la tabla",
            "intl@uam.es",
        );
        partner.status = PartnerStatus::Negotiation;
        partner.updated_at = Some(Utc::now() - Duration::hours(3));
        partner.last_update_note = Some("Commission agreed\nNext: send contract".to_string());
        partner.emails = vec![EmailRecord {
            id: "m-1".to_string(),
            subject: "Contrato".to_string(),
            snippet: "Adjunto".to_string(),
            from: "Oficina <intl@uam.es>".to_string(),
            date: Some(Utc::now() - Duration::days(2)),
            is_inbound: true,
        }];
        partner
    }

    #[test]
    fn partner_table_truncates_long_names() {
        let rendered = format_partners(&[sample_partner()]);
        assert!(rendered.contains("Contact"));
        assert!(rendered.contains("negotiation"));
        assert!(rendered.contains("3h ago"));
        assert!(rendered.contains('…'));
    }

    #[test]
    fn partner_detail_lists_emails_with_direction() {
        let rendered = format_partner(&sample_partner());
        assert!(rendered.contains("Next: send contract"));
        assert!(rendered.contains("<-"));
        assert!(rendered.contains("2d ago"));
    }

    #[test]
    fn sync_report_shows_failures_and_totals() {
        let report = SyncReport {
            outcomes: vec![
                SyncOutcome {
                    partner_id: PartnerId::Number(1),
                    success: true,
                    emails_count: Some(2),
                    error: None,
                    status: Some(PartnerStatus::Active),
                    proposed_reply: None,
                },
                SyncOutcome {
                    partner_id: PartnerId::Number(3),
                    success: false,
                    emails_count: None,
                    error: Some("search messages for c@x.com: connection refused".to_string()),
                    status: None,
                    proposed_reply: None,
                },
            ],
            skipped: vec![SkippedPartner {
                partner_id: PartnerId::Number(2),
                reason: SkipReason::MissingContact,
            }],
        };

        let rendered = format_sync_report(&report);
        assert!(rendered.contains("connection refused"));
        assert!(rendered.contains("Processed: 1  Failed: 1  Skipped: 1"));
    }

    #[test]
    fn truncation_respects_display_width() {
        assert_eq!(truncate_for_width("short", 10), "short");
        assert_eq!(truncate_for_width("abcdefghij", 5), "abcd…");
    }
}
