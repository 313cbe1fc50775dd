//! Response templates (C8 support): named, placeholder-substituted reply
//! bodies, plus the markdown loan-table/summary rendering they embed.
//!
//! Grounded on `original_source/src/loan_format_helper.py` (table and
//! narrative summary rendering) and the `get_response(itgs, name, **kwargs)`
//! call sites across `summons/*.py`, whose template names this store keys
//! its entries by.

use std::collections::HashMap;

use chrono::{TimeZone, Utc};

use crate::model::UserSummary;
use crate::money::Money;

/// The out-of-scope response-template table (spec §1, §3): keyed by name,
/// returns a format string with named placeholders.
pub trait TemplateStore: Send + Sync {
    fn get(&self, name: &str) -> Option<&str>;
}

/// Substitutes every `{key}` occurrence in the named template with its
/// value from `params`. Missing keys are left as-is (surfaces authoring
/// mistakes loudly rather than silently dropping text).
pub fn render(store: &dyn TemplateStore, name: &str, params: &HashMap<&str, String>) -> Option<String> {
    let mut out = store.get(name)?.to_string();
    for (key, value) in params {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    Some(out)
}

/// `get_letter_response`'s counterpart: a "letter" is a PM/modmail that
/// needs a subject and a body, stored as the two templates `{name}_title`
/// and `{name}_body`. Distinct from [`render`]'s single-string convention
/// because comment replies never carry a subject line.
pub fn render_letter(store: &dyn TemplateStore, name: &str, params: &HashMap<&str, String>) -> Option<(String, String)> {
    let title = render(store, &format!("{name}_title"), params)?;
    let body = render(store, &format!("{name}_body"), params)?;
    Some((title, body))
}

pub struct StaticTemplateStore {
    templates: HashMap<&'static str, &'static str>,
}

impl StaticTemplateStore {
    pub fn new() -> Self {
        let templates = HashMap::from([
            ("pong", "Pong!"),
            (
                "successful_loan",
                "/u/{lender_username} has extended a loan of {principal} to /u/{borrower_username}. \
                 I'll track it as loan #{loan_id}. (processed in {processing_time}s)",
            ),
            ("check_summary", "Loan summary for /u/{target_username}:\n\n{report}"),
            (
                "confirm",
                "Detected that /u/{borrower_username} confirms /u/{lender_username} sent them {amount}.",
            ),
            ("confirm_no_match", "I couldn't find an open loan from /u/{lender_username} to /u/{borrower_username} matching {amount}."),
            (
                "paid",
                "/u/{lender_username} was repaid by /u/{borrower_username}: {amount} applied across {num_loans_affected} loan(s), \
                 {remaining} left unapplied.\n\n**Before:**\n{loans_before}\n\n**After:**\n{loans_after}",
            ),
            (
                "paid_with_id",
                "/u/{lender_username} marked loan #{loan_id} repaid by /u/{borrower_username}: {applied} applied, {remaining} ignored.\n\n\
                 **Before:**\n{loan_before}\n\n**After:**\n{loan_after}",
            ),
            (
                "paid_with_id_not_found",
                "/u/{lender_username}, I couldn't find loan #{loan_id}. Did you mean one of these?\n\n{suggested_loans}",
            ),
            (
                "paid_with_id_wrong_lender",
                "/u/{lender_username}, loan #{loan_id} isn't one you lent. Here's what I have on it:\n\n{loan}\n\nYour loans:\n\n{suggested_loans}",
            ),
            (
                "paid_with_id_already_repaid",
                "/u/{lender_username}, loan #{loan_id} is already fully repaid.\n\n{loan}",
            ),
            (
                "unpaid",
                "/u/{lender_username} marked /u/{borrower_username}'s loan(s) unpaid.\n\n**Before:**\n{loans_before}\n\n**After:**\n{loans_after}\n\n{borrower_summary}",
            ),
            ("unpaid_no_loans", "/u/{lender_username}, /u/{borrower_username} has no open loans from you to mark unpaid."),
            ("paid_no_loans", "/u/{lender_username}, /u/{borrower_username} has no open loans from you to apply a repayment to."),
            (
                "new_lender",
                "/u/{lender_username} just made their first loan, lending {amount} to /u/{borrower_username}. [Link]({permalink})",
            ),
            (
                "borrower_request",
                "/u/{borrower_username}, who you've lent to before, made a loan request: {thread}\n\nTheir loan history with you:\n\n{loans}",
            ),
            ("unpaid_ban_message", "You were banned from /r/borrow for defaulting on a loan from /u/{lender_username} without marking it paid."),
            ("unpaid_ban_note", "Automated ban: unpaid loan from /u/{lender_username}"),
            (
                "lender_received_loan_modmail_pm_title",
                "You lent money on /r/borrow",
            ),
            (
                "lender_received_loan_modmail_pm_body",
                "/u/{lender_username}, we noticed you just lent money to /u/{borrower_username} for loan #{loan_id} despite never having \
                 borrowed money yourself. New lenders are removed from /r/borrow as a precaution against scams; a moderator will review your \
                 history shortly.\n\n{loans_table}",
            ),
            (
                "approved_lender_received_loan_modmail_pm_title",
                "You lent money on /r/borrow",
            ),
            (
                "approved_lender_received_loan_modmail_pm_body",
                "/u/{lender_username}, we noticed you just lent money to /u/{borrower_username} for loan #{loan_id}. Since you're an approved \
                 submitter we haven't removed you, but please reach out if anything looks wrong.\n\n{loans_table}",
            ),
            (
                "queue_trust_pm_title",
                "Your lending history is being reviewed",
            ),
            (
                "queue_trust_pm_body",
                "/u/{username}, you've completed enough loans as a lender that a moderator will review your history and vouch for you if it \
                 looks good. No action is needed on your part.",
            ),
            (
                "user_granted_recheck_pm_title",
                "You can now request a permission recheck",
            ),
            (
                "user_granted_recheck_pm_body",
                "/u/{username}, thanks for lending responsibly. You've been granted the ability to request a recheck of your account \
                 permissions on the website.",
            ),
            (
                "mod_onboarding_unclaimed_title",
                "Please claim your account",
            ),
            (
                "mod_onboarding_unclaimed_body",
                "/u/{username}, we noticed you're now a moderator of /r/borrow. To grant you moderator tools on the website, please claim \
                 your account by signing up with a password there first.",
            ),
            (
                "mod_onboarding_greeting_title",
                "Welcome to the moderator team",
            ),
            (
                "mod_onboarding_greeting_body",
                "/u/{username}, you've been granted full moderator permissions on the website. Welcome to the team!",
            ),
            (
                "mod_onboarding_claim_greeting_title",
                "Welcome to the moderator team",
            ),
            (
                "mod_onboarding_claim_greeting_body",
                "/u/{username}, now that you've claimed your account you've been granted full moderator permissions on the website.",
            ),
            (
                "mod_offboarding_farewell_title",
                "Thanks for moderating /r/borrow",
            ),
            (
                "mod_offboarding_farewell_body",
                "/u/{username}, we noticed you're no longer a moderator of /r/borrow, so we've removed your moderator permissions on the \
                 website. Thank you for your service!",
            ),
            (
                "mod_onboarding_msg1_title",
                "Getting started as a /r/borrow moderator (1/2)",
            ),
            (
                "mod_onboarding_msg1_body",
                "/u/{username}, the first tool worth knowing about is the moderator dashboard, which surfaces flagged loans and pending \
                 trust reviews in one place.",
            ),
            (
                "mod_onboarding_msg2_title",
                "Getting started as a /r/borrow moderator (2/2)",
            ),
            (
                "mod_onboarding_msg2_body",
                "/u/{username}, the second tool worth knowing about is the permission recheck queue, where you can grant members additional \
                 permissions once they've proven themselves.",
            ),
            (
                "deprecated_alerts_reminder_title",
                "Deprecated endpoint usage: /u/{username}",
            ),
            (
                "deprecated_alerts_reminder_body",
                "/u/{username}, you're using one or more endpoints that are scheduled for removal:\n\n{endpoints_table}\n\nPlease migrate \
                 before the listed sunset date.",
            ),
        ]);
        Self { templates }
    }
}

impl Default for StaticTemplateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateStore for StaticTemplateStore {
    fn get(&self, name: &str) -> Option<&str> {
        self.templates.get(name).copied()
    }
}

/// A loan already joined with the display strings `format_loan_table` needs
/// (lender/borrower handles, rendered amounts, permalink).
pub struct LoanView {
    pub id: Option<i64>,
    pub lender: String,
    pub borrower: String,
    pub principal: String,
    pub principal_repayment: String,
    pub permalink: String,
    pub created_at: i64,
    pub repaid_at: Option<i64>,
    pub unpaid_at: Option<i64>,
}

fn pretty_date(epoch: i64) -> String {
    Utc.timestamp_opt(epoch, 0).single().map(|dt| dt.format("%b %d, %Y").to_string()).unwrap_or_default()
}

/// A markdown pipe table, one row per loan — matches
/// `loan_format_helper.py::format_loan_table`.
pub fn format_loan_table(loans: &[LoanView], include_id: bool) -> String {
    if loans.is_empty() {
        return String::new();
    }
    let mut header = String::new();
    if include_id {
        header.push_str("Id|");
    }
    header.push_str("Lender|Borrower|Amount Given|Amount Repaid|Unpaid?|Original Thread|Date Given|Date Paid Back");
    let mut sep = String::new();
    if include_id {
        sep.push_str(":--|");
    }
    sep.push_str(":--|:--|:--|:--|:--|:--|:--|:--");

    let mut lines = vec![header, sep];
    for loan in loans {
        let unpaid_bool = if loan.unpaid_at.is_some() { "***UNPAID***" } else { "" };
        let repaid_pretty = loan.repaid_at.map(pretty_date).unwrap_or_default();
        let mut row = String::new();
        if include_id {
            row.push_str(&loan.id.map(|i| i.to_string()).unwrap_or_default());
            row.push('|');
        }
        row.push_str(&format!(
            "{}|{}|{}|{}|{}|{}|{}|{}",
            loan.lender,
            loan.borrower,
            loan.principal,
            loan.principal_repayment,
            unpaid_bool,
            loan.permalink,
            pretty_date(loan.created_at),
            repaid_pretty,
        ));
        lines.push(row);
    }
    lines.join("\n")
}

/// The narrative summary for a user over their six buckets — matches
/// `loan_format_helper.py::format_loan_summary`'s shape, condensed to the
/// counts-only form (per-bucket loan tables come from `format_loan_table`
/// called by the caller when representative rows are wanted).
pub fn format_summary(username: &str, summary: &UserSummary) -> String {
    let usd = |minor: i64| Money::new(minor, "USD").unwrap().with_display(Some("$".to_string()), true).display();
    let plural = |n: i64| if n != 1 { "s" } else { "" };

    format!(
        "/u/{username} has taken out and paid back {} loan{}, for a total of {}\n\
         /u/{username} has given out and gotten returned {} loan{}, for a total of {}\n\
         /u/{username} has {} loan{} unpaid as a borrower, for a total of {}\n\
         /u/{username} has {} loan{} unpaid as a lender, for a total of {}\n\
         /u/{username} has {} outstanding loan{} as a borrower, for a total of {}\n\
         /u/{username} has {} outstanding loan{} as a lender, for a total of {}",
        summary.paid_as_borrower.count,
        plural(summary.paid_as_borrower.count),
        usd(summary.paid_as_borrower.total_usd_minor),
        summary.paid_as_lender.count,
        plural(summary.paid_as_lender.count),
        usd(summary.paid_as_lender.total_usd_minor),
        summary.unpaid_as_borrower.count,
        plural(summary.unpaid_as_borrower.count),
        usd(summary.unpaid_as_borrower.total_usd_minor),
        summary.unpaid_as_lender.count,
        plural(summary.unpaid_as_lender.count),
        usd(summary.unpaid_as_lender.total_usd_minor),
        summary.inprogress_as_borrower.count,
        plural(summary.inprogress_as_borrower.count),
        usd(summary.inprogress_as_borrower.total_usd_minor),
        summary.inprogress_as_lender.count,
        plural(summary.inprogress_as_lender.count),
        usd(summary.inprogress_as_lender.total_usd_minor),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SummaryBucket;

    #[test]
    fn render_substitutes_named_placeholders() {
        let store = StaticTemplateStore::new();
        let mut params = HashMap::new();
        params.insert("lender_username", "alice".to_string());
        params.insert("borrower_username", "bob".to_string());
        params.insert("amount", "$10.00".to_string());
        let out = render(&store, "confirm", &params).unwrap();
        assert!(out.contains("/u/bob confirms /u/alice"));
    }

    #[test]
    fn unknown_template_name_is_none() {
        let store = StaticTemplateStore::new();
        assert!(store.get("does_not_exist").is_none());
    }

    #[test]
    fn render_letter_returns_title_and_body() {
        let store = StaticTemplateStore::new();
        let mut params = HashMap::new();
        params.insert("username", "alice".to_string());
        let (title, body) = render_letter(&store, "mod_onboarding_greeting", &params).unwrap();
        assert!(title.contains("Welcome"));
        assert!(body.contains("/u/alice"));
    }

    #[test]
    fn render_letter_missing_template_is_none() {
        let store = StaticTemplateStore::new();
        assert!(render_letter(&store, "does_not_exist", &HashMap::new()).is_none());
    }

    #[test]
    fn loan_table_marks_unpaid_rows() {
        let loans = vec![LoanView {
            id: Some(7),
            lender: "alice".into(),
            borrower: "bob".into(),
            principal: "$10.00".into(),
            principal_repayment: "$0.00".into(),
            permalink: "https://example/1".into(),
            created_at: 0,
            repaid_at: None,
            unpaid_at: Some(10),
        }];
        let table = format_loan_table(&loans, true);
        assert!(table.contains("***UNPAID***"));
        assert!(table.starts_with("Id|Lender"));
    }

    #[test]
    fn empty_loan_list_renders_empty_table() {
        assert_eq!(format_loan_table(&[], false), "");
    }

    #[test]
    fn format_summary_pluralizes_single_loan_counts() {
        let bucket = |count, total| SummaryBucket { count, total_usd_minor: total, representative: vec![] };
        let summary = UserSummary {
            paid_as_lender: bucket(1, 1000),
            paid_as_borrower: bucket(0, 0),
            unpaid_as_lender: bucket(0, 0),
            unpaid_as_borrower: bucket(0, 0),
            inprogress_as_lender: bucket(0, 0),
            inprogress_as_borrower: bucket(0, 0),
        };
        let text = format_summary("alice", &summary);
        assert!(text.contains("1 loan, for a total of $10.00"));
        assert!(!text.contains("1 loans"));
    }
}
