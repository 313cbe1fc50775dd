//! Command handlers (C8): one [`Summon`] per entry in the command table
//! (§4.8), tried in registration order against a comment's body.
//!
//! Grounded on `original_source/src/summons/summon.py` (the `Summon`
//! interface and ordered-registry dispatch) and one file per command:
//! `ping.py`, `check.py`, `confirm.py`, `loan.py`, `paid.py`,
//! `paid_with_id.py`, `unpaid.py`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::ledger::Ledger;
use crate::model::{Loan, LoanId, UserId};
use crate::money::fx::FxCache;
use crate::money::Money;
use crate::parsing::ext_tokens::{as_currency_token, money_token, uint_token, user_token};
use crate::parsing::{Parser, TokenSpec, TokenValue};
use crate::store::Store;
use crate::templates::{self, LoanView, StaticTemplateStore, TemplateStore};

/// Everything a comment carries that a summon might need: who wrote it,
/// where it lives, and who authored the thread it's replying within.
#[derive(Debug, Clone)]
pub struct CommentContext {
    pub author: String,
    pub fullname: String,
    pub link_fullname: String,
    pub link_author: String,
    pub permalink: String,
    pub created_at: i64,
}

pub struct SummonServices {
    pub store: Arc<dyn Store>,
    pub ledger: Arc<Ledger>,
    pub fx: Arc<FxCache>,
    pub templates: Arc<dyn TemplateStore>,
}

impl SummonServices {
    pub fn new(store: Arc<dyn Store>, ledger: Arc<Ledger>, fx: Arc<FxCache>) -> Self {
        Self { store, ledger, fx, templates: Arc::new(StaticTemplateStore::new()) }
    }
}

#[async_trait]
pub trait Summon: Send + Sync {
    fn name(&self) -> &'static str;
    fn parser(&self) -> &Parser;
    async fn handle(&self, svc: &SummonServices, comment: &CommentContext, values: Vec<Option<TokenValue>>) -> anyhow::Result<String>;
}

/// Tried in order (§4.6): the first summon whose parser matches the body
/// handles the comment.
pub struct SummonRegistry {
    summons: Vec<Box<dyn Summon>>,
}

impl SummonRegistry {
    pub fn new() -> Self {
        Self {
            summons: vec![
                Box::new(PingSummon::new()),
                Box::new(CheckSummon::new()),
                Box::new(ConfirmSummon::new()),
                Box::new(LoanSummon::new()),
                Box::new(PaidWithIdSummon::new()),
                Box::new(PaidSummon::new()),
                Box::new(UnpaidSummon::new()),
            ],
        }
    }

    /// Cheap, side-effect-free pre-check (§4.6 "might_apply"): whether any
    /// summon's anchor/token grammar matches this body at all.
    pub fn might_apply(&self, body: &str) -> bool {
        self.summons.iter().any(|s| s.parser().parse(body).is_some())
    }

    pub async fn dispatch(&self, svc: &SummonServices, comment: &CommentContext, body: &str) -> anyhow::Result<Option<String>> {
        for summon in &self.summons {
            if let Some(values) = summon.parser().parse(body) {
                let reply = summon.handle(svc, comment, values).await?;
                return Ok(Some(reply));
            }
        }
        Ok(None)
    }
}

impl Default for SummonRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn render(svc: &SummonServices, name: &str, params: Vec<(&'static str, String)>) -> String {
    let map = params.into_iter().collect();
    templates::render(svc.templates.as_ref(), name, &map)
        .unwrap_or_else(|| format!("(missing template `{name}`)"))
}

pub(crate) async fn build_loan_views(store: &dyn Store, loans: &[Loan]) -> anyhow::Result<Vec<LoanView>> {
    let mut views = Vec::with_capacity(loans.len());
    for loan in loans {
        let lender = store.get_user(loan.lender_id).await?;
        let borrower = store.get_user(loan.borrower_id).await?;
        let principal = store.get_money(loan.principal_id).await?;
        let repaid = store.get_money(loan.principal_repaid_id).await?;
        let currency = match &principal {
            Some(p) => store.get_currency(p.currency_id).await?,
            None => None,
        };
        let (symbol, left) = currency.as_ref().map(|c| (c.symbol.clone(), c.symbol_on_left)).unwrap_or((None, false));
        let code = currency.map(|c| c.code).unwrap_or_else(|| "USD".to_string());

        let render_amount = |minor: i64| -> String {
            Money::new(minor, &code).map(|m| m.with_display(symbol.clone(), left).display()).unwrap_or_default()
        };

        views.push(LoanView {
            id: Some(loan.id),
            lender: lender.map(|u| u.username).unwrap_or_default(),
            borrower: borrower.map(|u| u.username).unwrap_or_default(),
            principal: principal.map(|p| render_amount(p.amount_minor)).unwrap_or_default(),
            principal_repayment: repaid.map(|r| render_amount(r.amount_minor)).unwrap_or_default(),
            permalink: String::new(),
            created_at: loan.created_at,
            repaid_at: loan.repaid_at,
            unpaid_at: loan.unpaid_at,
        });
    }
    Ok(views)
}

fn anchors(primary: &'static str, escaped: &'static str) -> Vec<&'static str> {
    vec![primary, escaped]
}

// ---------------------------------------------------------------- $ping ---

pub struct PingSummon {
    parser: Parser,
}

impl PingSummon {
    pub fn new() -> Self {
        Self { parser: Parser::new(vec!["$ping"], vec![]) }
    }
}

impl Default for PingSummon {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Summon for PingSummon {
    fn name(&self) -> &'static str {
        "ping"
    }
    fn parser(&self) -> &Parser {
        &self.parser
    }
    async fn handle(&self, svc: &SummonServices, _comment: &CommentContext, _values: Vec<Option<TokenValue>>) -> anyhow::Result<String> {
        Ok(render(svc, "pong", vec![]))
    }
}

// --------------------------------------------------------------- $check ---

pub(crate) const SUMMARY_TABLE_THRESHOLD: usize = 5;
const REPRESENTATIVE_LIMIT: usize = 7;

pub struct CheckSummon {
    parser: Parser,
}

impl CheckSummon {
    pub fn new() -> Self {
        Self { parser: Parser::new(vec!["$check"], vec![TokenSpec::required(user_token())]) }
    }
}

impl Default for CheckSummon {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Summon for CheckSummon {
    fn name(&self) -> &'static str {
        "check"
    }
    fn parser(&self) -> &Parser {
        &self.parser
    }
    async fn handle(&self, svc: &SummonServices, comment: &CommentContext, values: Vec<Option<TokenValue>>) -> anyhow::Result<String> {
        let target = values[0].as_ref().and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let user = svc.store.get_user_by_name(&target).await?;

        let report = match user {
            None => "This user has no loan history.".to_string(),
            Some(user) => {
                let (loans, summary) = svc.ledger.get_and_format_all_or_summary(user.id, SUMMARY_TABLE_THRESHOLD, comment.created_at).await?;
                match summary {
                    None => {
                        let views = build_loan_views(svc.store.as_ref(), &loans).await?;
                        templates::format_loan_table(&views, true)
                    }
                    Some(summary) => templates::format_summary(&target, &summary),
                }
            }
        };

        Ok(render(svc, "check_summary", vec![("target_username", target), ("report", report)]))
    }
}

// ------------------------------------------------------------- $confirm ---

pub struct ConfirmSummon {
    parser: Parser,
}

impl ConfirmSummon {
    pub fn new() -> Self {
        Self {
            parser: Parser::new(vec!["$confirm"], vec![TokenSpec::required(user_token()), TokenSpec::required(money_token())]),
        }
    }
}

impl Default for ConfirmSummon {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfirmSummon {
    /// §4.8: most recent non-repaid, non-unpaid, non-deleted loan from
    /// `lender` to `borrower` whose principal matches `amount` exactly in
    /// its native currency, or whose USD total is within 1 USD of the
    /// confirming amount's USD-equivalent when currencies differ.
    async fn find_match(&self, svc: &SummonServices, lender_id: UserId, borrower_id: UserId, amount: &Money) -> anyhow::Result<Option<Loan>> {
        let mut open = svc.store.list_open_loans_for_pair(lender_id, borrower_id).await?;
        open.retain(|l| l.unpaid_at.is_none());
        open.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        for loan in open {
            let Some(principal) = svc.store.get_money(loan.principal_id).await? else { continue };
            let Some(currency) = svc.store.get_currency(principal.currency_id).await? else { continue };

            if currency.code == amount.currency {
                if principal.amount_minor == amount.minor {
                    return Ok(Some(loan));
                }
                continue;
            }

            let rate = svc.fx.convert(&amount.currency, "USD").await?;
            let confirm_usd_minor = (amount.minor as f64 * rate).round() as i64;
            if (principal.amount_usd_minor - confirm_usd_minor).abs() <= 100 {
                return Ok(Some(loan));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Summon for ConfirmSummon {
    fn name(&self) -> &'static str {
        "confirm"
    }
    fn parser(&self) -> &Parser {
        &self.parser
    }
    async fn handle(&self, svc: &SummonServices, comment: &CommentContext, values: Vec<Option<TokenValue>>) -> anyhow::Result<String> {
        let lender_handle = values[0].as_ref().and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let amount = values[1].as_ref().and_then(|v| v.as_money()).unwrap().clone();

        let lender = svc.store.get_user_by_name(&lender_handle).await?;
        let borrower = svc.store.get_user_by_name(&comment.author).await?;

        let matched = match (lender.as_ref(), borrower.as_ref()) {
            (Some(l), Some(b)) => self.find_match(svc, l.id, b.id, &amount).await?,
            _ => None,
        };

        match matched {
            Some(_loan) => Ok(render(
                svc,
                "confirm",
                vec![
                    ("lender_username", lender_handle),
                    ("borrower_username", comment.author.clone()),
                    ("amount", amount.with_display(Some("$".into()), true).display()),
                ],
            )),
            None => Ok(render(
                svc,
                "confirm_no_match",
                vec![
                    ("lender_username", lender_handle),
                    ("borrower_username", comment.author.clone()),
                    ("amount", amount.display()),
                ],
            )),
        }
    }
}

// ---------------------------------------------------------------- $loan ---

pub struct LoanSummon {
    parser: Parser,
}

impl LoanSummon {
    pub fn new() -> Self {
        Self {
            parser: Parser::new(vec!["$loan"], vec![TokenSpec::required(money_token()), TokenSpec::optional(as_currency_token())]),
        }
    }
}

impl Default for LoanSummon {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Summon for LoanSummon {
    fn name(&self) -> &'static str {
        "loan"
    }
    fn parser(&self) -> &Parser {
        &self.parser
    }
    async fn handle(&self, svc: &SummonServices, comment: &CommentContext, values: Vec<Option<TokenValue>>) -> anyhow::Result<String> {
        let amount = values[0].as_ref().and_then(|v| v.as_money()).unwrap().clone();
        let store_currency = values[1].as_ref().and_then(|v| v.as_str()).map(str::to_string).unwrap_or_else(|| amount.currency.clone());

        let created = svc
            .ledger
            .create_loan(
                &comment.author,
                &comment.link_author,
                amount.minor,
                &amount.currency,
                &store_currency,
                comment.created_at,
                &comment.link_fullname,
                &comment.fullname,
                &comment.permalink,
            )
            .await?;

        let principal_display = Money::new(created.principal.amount_minor, created.currency.code.clone())
            .map(|m| m.with_display(created.currency.symbol.clone(), created.currency.symbol_on_left).display())
            .unwrap_or_default();

        Ok(render(
            svc,
            "successful_loan",
            vec![
                ("lender_username", comment.author.clone()),
                ("borrower_username", comment.link_author.clone()),
                ("principal", principal_display),
                ("loan_id", created.loan.id.to_string()),
                ("processing_time", "0".to_string()),
            ],
        ))
    }
}

// --------------------------------------------------------- $paid_with_id --

pub struct PaidWithIdSummon {
    parser: Parser,
}

impl PaidWithIdSummon {
    pub fn new() -> Self {
        Self {
            parser: Parser::new(anchors("$paid_with_id", "$paid\\_with\\_id"), vec![TokenSpec::required(uint_token()), TokenSpec::required(money_token())]),
        }
    }
}

impl Default for PaidWithIdSummon {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Summon for PaidWithIdSummon {
    fn name(&self) -> &'static str {
        "paid_with_id"
    }
    fn parser(&self) -> &Parser {
        &self.parser
    }
    async fn handle(&self, svc: &SummonServices, comment: &CommentContext, values: Vec<Option<TokenValue>>) -> anyhow::Result<String> {
        let loan_id: LoanId = values[0].as_ref().and_then(|v| v.as_int()).unwrap();
        let amount = values[1].as_ref().and_then(|v| v.as_money()).unwrap().clone();

        let lender = svc.store.get_user_by_name(&comment.author).await?;
        let loan = svc.store.get_loan(loan_id).await?;

        let Some(loan) = loan else {
            let suggested = match &lender {
                Some(l) => build_loan_views(svc.store.as_ref(), &svc.store.list_loans_as_lender(l.id).await?).await?,
                None => Vec::new(),
            };
            return Ok(render(
                svc,
                "paid_with_id_not_found",
                vec![
                    ("lender_username", comment.author.clone()),
                    ("loan_id", loan_id.to_string()),
                    ("suggested_loans", templates::format_loan_table(&suggested, true)),
                ],
            ));
        };

        let caller_is_lender = lender.as_ref().is_some_and(|l| l.id == loan.lender_id);
        if !caller_is_lender {
            let suggested = match &lender {
                Some(l) => build_loan_views(svc.store.as_ref(), &svc.store.list_loans_as_lender(l.id).await?).await?,
                None => Vec::new(),
            };
            let view = build_loan_views(svc.store.as_ref(), std::slice::from_ref(&loan)).await?;
            return Ok(render(
                svc,
                "paid_with_id_wrong_lender",
                vec![
                    ("lender_username", comment.author.clone()),
                    ("loan_id", loan_id.to_string()),
                    ("loan", templates::format_loan_table(&view, true)),
                    ("suggested_loans", templates::format_loan_table(&suggested, true)),
                ],
            ));
        }

        if loan.repaid_at.is_some() {
            let view = build_loan_views(svc.store.as_ref(), std::slice::from_ref(&loan)).await?;
            return Ok(render(
                svc,
                "paid_with_id_already_repaid",
                vec![("lender_username", comment.author.clone()), ("loan_id", loan_id.to_string()), ("loan", templates::format_loan_table(&view, true))],
            ));
        }

        let before_view = build_loan_views(svc.store.as_ref(), std::slice::from_ref(&loan)).await?;
        let applied = svc.ledger.apply_repayment(loan_id, amount.minor, &amount.currency, comment.created_at).await?;
        let after_loan = svc.store.get_loan(loan_id).await?.unwrap();
        let after_view = build_loan_views(svc.store.as_ref(), std::slice::from_ref(&after_loan)).await?;
        let borrower = svc.store.get_user(after_loan.borrower_id).await?;

        Ok(render(
            svc,
            "paid_with_id",
            vec![
                ("lender_username", comment.author.clone()),
                ("borrower_username", borrower.map(|u| u.username).unwrap_or_default()),
                ("loan_id", loan_id.to_string()),
                ("applied", applied.applied_minor.to_string()),
                ("remaining", applied.remaining_minor.to_string()),
                ("loan_before", templates::format_loan_table(&before_view, true)),
                ("loan_after", templates::format_loan_table(&after_view, true)),
            ],
        ))
    }
}

// ---------------------------------------------------------------- $paid ---

pub struct PaidSummon {
    parser: Parser,
}

impl PaidSummon {
    pub fn new() -> Self {
        Self {
            parser: Parser::new(vec!["$paid"], vec![TokenSpec::required(user_token()), TokenSpec::required(money_token())]),
        }
    }
}

impl Default for PaidSummon {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Summon for PaidSummon {
    fn name(&self) -> &'static str {
        "paid"
    }
    fn parser(&self) -> &Parser {
        &self.parser
    }
    async fn handle(&self, svc: &SummonServices, comment: &CommentContext, values: Vec<Option<TokenValue>>) -> anyhow::Result<String> {
        let borrower_handle = values[0].as_ref().and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let amount = values[1].as_ref().and_then(|v| v.as_money()).unwrap().clone();

        let lender = svc.store.find_or_create_user(&comment.author).await?;
        let borrower = svc.store.find_or_create_user(&borrower_handle).await?;

        let before_open = svc.store.list_open_loans_for_pair(lender.id, borrower.id).await?;
        let results = svc.ledger.apply_multi_loan_payment(lender.id, borrower.id, amount.minor, &amount.currency, comment.created_at).await?;

        if results.is_empty() {
            return Ok(render(
                svc,
                "paid_no_loans",
                vec![("lender_username", comment.author.clone()), ("borrower_username", borrower_handle)],
            ));
        }

        let affected_ids: Vec<LoanId> = results.iter().map(|(id, _)| *id).collect();
        let before_loans: Vec<Loan> = before_open.into_iter().filter(|l| affected_ids.contains(&l.id)).collect();
        let mut after_loans = Vec::with_capacity(affected_ids.len());
        for id in &affected_ids {
            if let Some(loan) = svc.store.get_loan(*id).await? {
                after_loans.push(loan);
            }
        }

        let before_views = build_loan_views(svc.store.as_ref(), &before_loans).await?;
        let after_views = build_loan_views(svc.store.as_ref(), &after_loans).await?;
        let remaining = results.last().map(|(_, a)| a.remaining_minor).unwrap_or(0);

        Ok(render(
            svc,
            "paid",
            vec![
                ("lender_username", comment.author.clone()),
                ("borrower_username", borrower_handle),
                ("amount", amount.display()),
                ("num_loans_affected", affected_ids.len().to_string()),
                ("remaining", remaining.to_string()),
                ("loans_before", templates::format_loan_table(&before_views, true)),
                ("loans_after", templates::format_loan_table(&after_views, true)),
            ],
        ))
    }
}

// -------------------------------------------------------------- $unpaid ---

pub struct UnpaidSummon {
    parser: Parser,
}

impl UnpaidSummon {
    pub fn new() -> Self {
        Self { parser: Parser::new(vec!["$unpaid"], vec![TokenSpec::required(user_token())]) }
    }
}

impl Default for UnpaidSummon {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Summon for UnpaidSummon {
    fn name(&self) -> &'static str {
        "unpaid"
    }
    fn parser(&self) -> &Parser {
        &self.parser
    }
    async fn handle(&self, svc: &SummonServices, comment: &CommentContext, values: Vec<Option<TokenValue>>) -> anyhow::Result<String> {
        let borrower_handle = values[0].as_ref().and_then(|v| v.as_str()).unwrap_or_default().to_string();

        let lender = svc.store.find_or_create_user(&comment.author).await?;
        let borrower = svc.store.find_or_create_user(&borrower_handle).await?;

        let before_open = svc.store.list_open_loans_for_pair(lender.id, borrower.id).await?;
        let affected = svc.ledger.mark_unpaid(lender.id, borrower.id, comment.created_at).await?;

        if affected.is_empty() {
            return Ok(render(
                svc,
                "unpaid_no_loans",
                vec![("lender_username", comment.author.clone()), ("borrower_username", borrower_handle)],
            ));
        }

        let before_views = build_loan_views(svc.store.as_ref(), &before_open.into_iter().filter(|l| affected.contains(&l.id)).collect::<Vec<_>>()).await?;
        let mut after_loans = Vec::with_capacity(affected.len());
        for id in &affected {
            if let Some(loan) = svc.store.get_loan(*id).await? {
                after_loans.push(loan);
            }
        }
        let after_views = build_loan_views(svc.store.as_ref(), &after_loans).await?;

        let summary = svc.ledger.summarize(borrower.id, comment.created_at, REPRESENTATIVE_LIMIT).await?;
        let borrower_summary = templates::format_summary(&borrower_handle, &summary);

        Ok(render(
            svc,
            "unpaid",
            vec![
                ("lender_username", comment.author.clone()),
                ("borrower_username", borrower_handle),
                ("loans_before", templates::format_loan_table(&before_views, true)),
                ("loans_after", templates::format_loan_table(&after_views, true)),
                ("borrower_summary", borrower_summary),
            ],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryEventBus;
    use crate::cache::TtlCache;
    use crate::money::fx::FxSource;
    use crate::store::sqlite::SqliteStore;
    use std::collections::HashMap;
    use std::time::Duration;

    fn services() -> SummonServices {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let cache = Arc::new(TtlCache::new());

        struct IdentityFx;
        #[async_trait]
        impl FxSource for IdentityFx {
            async fn fetch_rates(&self, _source: &str) -> anyhow::Result<HashMap<String, f64>> {
                Ok(crate::money::SUPPORTED_CURRENCIES.iter().map(|c| (c.code.to_string(), 1.0)).collect())
            }
        }
        let fx = Arc::new(FxCache::new(cache, Arc::new(IdentityFx), Duration::from_secs(60)));
        let bus: Arc<dyn crate::bus::EventBus> = Arc::new(InMemoryEventBus::new());
        let ledger = Arc::new(Ledger::new(store.clone(), fx.clone(), bus));
        SummonServices::new(store, ledger, fx)
    }

    fn comment(author: &str, link_author: &str) -> CommentContext {
        CommentContext {
            author: author.to_string(),
            fullname: "t1_abc".to_string(),
            link_fullname: "t3_def".to_string(),
            link_author: link_author.to_string(),
            permalink: "https://example/1".to_string(),
            created_at: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn ping_replies_pong() {
        let svc = services();
        let registry = SummonRegistry::new();
        let reply = registry.dispatch(&svc, &comment("alice", "bob"), "$ping").await.unwrap().unwrap();
        assert_eq!(reply, "Pong!");
    }

    #[tokio::test]
    async fn loan_then_paid_round_trip() {
        let svc = services();
        let registry = SummonRegistry::new();

        let loan_reply = registry.dispatch(&svc, &comment("lender1", "borrower1"), "$loan $100").await.unwrap().unwrap();
        assert!(loan_reply.contains("lender1"));
        assert!(loan_reply.contains("borrower1"));

        let paid_reply = registry
            .dispatch(&svc, &comment("lender1", "borrower1"), "$paid /u/borrower1 $100")
            .await
            .unwrap()
            .unwrap();
        assert!(paid_reply.contains("100"));
    }

    #[tokio::test]
    async fn paid_with_id_rejects_wrong_lender() {
        let svc = services();
        let registry = SummonRegistry::new();
        registry.dispatch(&svc, &comment("lender1", "borrower1"), "$loan $50").await.unwrap();

        let reply = registry.dispatch(&svc, &comment("someoneelse", "borrower1"), "$paid_with_id 1 $10").await.unwrap().unwrap();
        assert!(reply.contains("isn't one you lent"));
    }

    #[tokio::test]
    async fn unpaid_with_no_open_loans_uses_the_no_loans_template() {
        let svc = services();
        let registry = SummonRegistry::new();
        let reply = registry.dispatch(&svc, &comment("lender1", "ignored"), "$unpaid /u/nobody").await.unwrap().unwrap();
        assert!(reply.contains("no open loans"));
    }

    #[tokio::test]
    async fn check_on_unknown_user_reports_no_history() {
        let svc = services();
        let registry = SummonRegistry::new();
        let reply = registry.dispatch(&svc, &comment("asker", "ignored"), "$check /u/ghost").await.unwrap().unwrap();
        assert!(reply.contains("no loan history"));
    }

    #[tokio::test]
    async fn unmatched_text_returns_none() {
        let svc = services();
        let registry = SummonRegistry::new();
        assert!(registry.dispatch(&svc, &comment("a", "b"), "just chatting").await.unwrap().is_none());
    }
}
