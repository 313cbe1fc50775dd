//! Loan ledger (C3): creation, repayment, delinquency, summaries.
//!
//! Grounded on the teacher's `sim/lending.rs` for the shape of a ledger
//! service wrapping a store handle, and on `original_source/src/utils/paid_utils.py`
//! for the repayment arithmetic this module generalizes to arbitrary currencies.

use std::sync::Arc;

use thiserror::Error;

use crate::bus::EventBus;
use crate::model::*;
use crate::money::fx::{FxCache, FxError};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("repayment amount must be positive")]
    NonPositiveAmount,
    #[error("loan {0} does not exist")]
    LoanNotFound(LoanId),
    #[error("loan {0} is already fully repaid")]
    AlreadyRepaid(LoanId),
    #[error(transparent)]
    Fx(#[from] FxError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Money(#[from] crate::money::MoneyError),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

pub struct Ledger {
    store: Arc<dyn Store>,
    fx: Arc<FxCache>,
    bus: Arc<dyn EventBus>,
}

pub struct CreatedLoan {
    pub loan: Loan,
    pub principal: MoneyRow,
    pub currency: CurrencyRow,
}

pub struct AppliedRepayment {
    pub event_id: i64,
    pub applied_minor: i64,
    pub remaining_minor: i64,
    pub remaining_currency: String,
    pub loan_fully_repaid: bool,
    pub was_unpaid: bool,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>, fx: Arc<FxCache>, bus: Arc<dyn EventBus>) -> Self {
        Self { store, fx, bus }
    }

    /// §4.3 "Create loan".
    pub async fn create_loan(
        &self,
        lender_handle: &str,
        borrower_handle: &str,
        requested_minor: i64,
        requested_currency: &str,
        store_currency: &str,
        created_at: i64,
        post_fullname: &str,
        comment_fullname: &str,
        permalink: &str,
    ) -> LedgerResult<CreatedLoan> {
        let lender = self.store.find_or_create_user(lender_handle).await?;
        let borrower = self.store.find_or_create_user(borrower_handle).await?;

        let stored_minor = if requested_currency == store_currency {
            requested_minor
        } else {
            let rate = self.fx.convert(requested_currency, store_currency).await?;
            (requested_minor as f64 * rate).round() as i64
        };

        let usd_rate = if store_currency == "USD" {
            1.0
        } else {
            1.0 / self.fx.convert("USD", store_currency).await?
        };
        let usd_minor = (stored_minor as f64 * usd_rate).round() as i64;

        let currency = self.store.find_or_create_currency(store_currency).await?;
        let principal = self.store.create_money(currency.id, stored_minor, usd_minor).await?;
        let principal_repaid = self.store.create_money(currency.id, 0, 0).await?;

        let loan = self
            .store
            .create_loan(lender.id, borrower.id, principal.id, principal_repaid.id, created_at)
            .await?;
        self.store
            .create_loan_creation_info(loan.id, 0, post_fullname, comment_fullname)
            .await?;

        let payload = serde_json::to_value(events::LoansCreate {
            loan_id: loan.id,
            comment: events::CommentDescriptor { link_fullname: post_fullname.to_string(), fullname: comment_fullname.to_string() },
            lender: events::UserDescriptor { id: lender.id, username: lender.username },
            borrower: events::UserDescriptor { id: borrower.id, username: borrower.username },
            amount: events::MoneyPayload {
                minor: stored_minor,
                currency: currency.code.clone(),
                exp: currency.exponent,
                symbol: currency.symbol.clone(),
                symbol_on_left: currency.symbol_on_left,
            },
            permalink: permalink.to_string(),
        })
        .expect("event payload always serializes");
        let _ = self.bus.publish("loans.create", payload).await;

        Ok(CreatedLoan { loan, principal, currency })
    }

    /// §4.3 "Apply repayment".
    pub async fn apply_repayment(&self, loan_id: LoanId, amount_minor: i64, amount_currency: &str, now: i64) -> LedgerResult<AppliedRepayment> {
        if amount_minor <= 0 {
            return Err(LedgerError::NonPositiveAmount);
        }
        let loan = self.store.get_loan(loan_id).await?.ok_or(LedgerError::LoanNotFound(loan_id))?;
        if loan.repaid_at.is_some() {
            return Err(LedgerError::AlreadyRepaid(loan_id));
        }
        let principal = self.store.get_money(loan.principal_id).await?.ok_or(LedgerError::LoanNotFound(loan_id))?;
        let prior_repaid = self.store.get_money(loan.principal_repaid_id).await?.ok_or(LedgerError::LoanNotFound(loan_id))?;
        let loan_currency_id = principal.currency_id;
        let loan_currency = self.currency_code_for(loan_currency_id).await?;

        let rate_loan_to_usd = principal.amount_minor as f64 / principal.amount_usd_minor.max(1) as f64;

        let amount_in_loan_ccy = if amount_currency == loan_currency {
            amount_minor
        } else {
            let rate = self.fx.convert(amount_currency, &loan_currency).await?;
            ceil_div_f64(amount_minor as f64 * rate)
        };

        let remaining_on_loan = principal.amount_minor - prior_repaid.amount_minor;
        let applied_minor = remaining_on_loan.min(amount_in_loan_ccy);
        let applied_usd_minor = (applied_minor as f64 / rate_loan_to_usd).ceil() as i64;

        let (remaining_minor, remaining_currency) = if amount_currency == loan_currency {
            (amount_minor - applied_minor, loan_currency.clone())
        } else {
            let rate_given_to_loan = self.fx.convert(&loan_currency, amount_currency).await?;
            let applied_back_in_given = ceil_div_f64(applied_minor as f64 * rate_given_to_loan);
            (0i64.max(amount_minor - applied_back_in_given), amount_currency.to_string())
        };

        let applied_money = self.store.create_money(loan_currency_id, applied_minor, applied_usd_minor).await?;
        let event = self.store.insert_repayment_event(loan_id, applied_money.id, now).await?;

        let new_total = prior_repaid.amount_minor + applied_minor;
        let new_total_usd = (new_total as f64 / rate_loan_to_usd).ceil() as i64;
        let new_repaid_row = self.store.create_money(loan_currency_id, new_total, new_total_usd).await?;
        self.store.set_loan_principal_repaid(loan_id, new_repaid_row.id).await?;

        let fully_repaid = new_total == principal.amount_minor;
        let was_unpaid = loan.unpaid_at.is_some();
        if fully_repaid {
            self.store.set_loan_repaid_at(loan_id, Some(now)).await?;
            self.store.set_loan_unpaid_at(loan_id, None).await?;
            if was_unpaid {
                self.store.insert_unpaid_event(loan_id, UnpaidEventKind::Clearing, now).await?;
            }

            let lender = self.store.get_user(loan.lender_id).await?;
            let borrower = self.store.get_user(loan.borrower_id).await?;
            if let (Some(lender), Some(borrower)) = (lender, borrower) {
                let currency_row = self.store.find_or_create_currency(&loan_currency).await?;
                let payload = serde_json::to_value(events::LoansPaid {
                    loan_id,
                    lender: events::UserDescriptor { id: lender.id, username: lender.username },
                    borrower: events::UserDescriptor { id: borrower.id, username: borrower.username },
                    amount: events::MoneyPayload {
                        minor: new_total,
                        currency: loan_currency.clone(),
                        exp: currency_row.exponent,
                        symbol: currency_row.symbol,
                        symbol_on_left: currency_row.symbol_on_left,
                    },
                    was_unpaid,
                })
                .expect("event payload always serializes");
                let _ = self.bus.publish("loans.paid", payload).await;
            }
        }

        Ok(AppliedRepayment {
            event_id: event.id,
            applied_minor,
            remaining_minor,
            remaining_currency,
            loan_fully_repaid: fully_repaid,
            was_unpaid,
        })
    }

    async fn currency_code_for(&self, currency_id: CurrencyId) -> LedgerResult<String> {
        self.store
            .get_currency(currency_id)
            .await?
            .map(|row| row.code)
            .ok_or(LedgerError::LoanNotFound(0))
    }

    /// §4.3 "Multi-loan paid summon": rolls a single payment across the
    /// oldest open loans for a pair until it's exhausted or progress stalls.
    pub async fn apply_multi_loan_payment(
        &self,
        lender_id: UserId,
        borrower_id: UserId,
        mut amount_minor: i64,
        amount_currency: &str,
        now: i64,
    ) -> LedgerResult<Vec<(LoanId, AppliedRepayment)>> {
        let mut results = Vec::new();
        loop {
            if amount_minor <= 0 {
                break;
            }
            let open = self.store.list_open_loans_for_pair(lender_id, borrower_id).await?;
            let Some(loan) = open.into_iter().next() else { break };

            let applied = self.apply_repayment(loan.id, amount_minor, amount_currency, now).await?;
            let stalled = applied.remaining_minor >= amount_minor;
            amount_minor = applied.remaining_minor;
            results.push((loan.id, applied));
            if stalled {
                break;
            }
        }
        Ok(results)
    }

    /// §4.3 "Mark unpaid".
    pub async fn mark_unpaid(&self, lender_id: UserId, borrower_id: UserId, now: i64) -> LedgerResult<Vec<LoanId>> {
        let open = self.store.list_open_loans_for_pair(lender_id, borrower_id).await?;
        let mut affected = Vec::new();
        for loan in open {
            if loan.unpaid_at.is_none() {
                self.store.set_loan_unpaid_at(loan.id, Some(now)).await?;
                let event = self.store.insert_unpaid_event(loan.id, UnpaidEventKind::Unpaid, now).await?;
                let payload = serde_json::to_value(events::LoansUnpaid { loan_unpaid_event_id: event.id }).expect("serializes");
                let _ = self.bus.publish("loans.unpaid", payload).await;
                affected.push(loan.id);
            }
        }
        Ok(affected)
    }

    /// §4.3 "Summaries": the six buckets for a user.
    pub async fn summarize(&self, user_id: UserId, now: i64, representative_limit: usize) -> LedgerResult<UserSummary> {
        let as_lender = self.store.list_loans_as_lender(user_id).await?;
        let as_borrower = self.store.list_loans_as_borrower(user_id).await?;
        let one_year_ago = now - 365 * 86_400;

        let paid_lender: Vec<&Loan> = as_lender.iter().filter(|l| l.repaid_at.is_some()).collect();
        let unpaid_lender: Vec<&Loan> = as_lender.iter().filter(|l| l.unpaid_at.is_some() && l.repaid_at.is_none()).collect();
        let inprogress_lender: Vec<&Loan> = as_lender.iter().filter(|l| l.repaid_at.is_none() && l.unpaid_at.is_none()).collect();

        let paid_borrower: Vec<&Loan> = as_borrower.iter().filter(|l| l.repaid_at.is_some()).collect();
        let unpaid_borrower: Vec<&Loan> = as_borrower.iter().filter(|l| l.unpaid_at.is_some() && l.repaid_at.is_none()).collect();
        let inprogress_borrower: Vec<&Loan> = as_borrower.iter().filter(|l| l.repaid_at.is_none() && l.unpaid_at.is_none()).collect();

        let paid_as_lender = self.bucket(paid_lender, false, one_year_ago, representative_limit).await?;
        let unpaid_as_lender = self.bucket(unpaid_lender, true, one_year_ago, representative_limit).await?;
        let inprogress_as_lender = self.bucket(inprogress_lender, true, one_year_ago, representative_limit).await?;
        let paid_as_borrower = self.bucket(paid_borrower, false, one_year_ago, representative_limit).await?;
        let unpaid_as_borrower = self.bucket(unpaid_borrower, true, one_year_ago, representative_limit).await?;
        let inprogress_as_borrower = self.bucket(inprogress_borrower, true, one_year_ago, representative_limit).await?;

        Ok(UserSummary {
            paid_as_lender,
            paid_as_borrower,
            unpaid_as_lender,
            unpaid_as_borrower,
            inprogress_as_lender,
            inprogress_as_borrower,
        })
    }

    /// Builds one of the six summary buckets: `total_usd_minor` is always
    /// summed over every loan in the bucket (not just the capped
    /// representative slice), per §4.3.
    async fn bucket(
        &self,
        loans: Vec<&Loan>,
        want_representative: bool,
        one_year_ago: i64,
        representative_limit: usize,
    ) -> LedgerResult<SummaryBucket> {
        let count = loans.len() as i64;
        let mut total_usd_minor = 0i64;
        for loan in &loans {
            if let Some(money) = self.store.get_money(loan.principal_id).await? {
                total_usd_minor += money.amount_usd_minor;
            }
        }
        let representative = if want_representative {
            loans
                .iter()
                .filter(|l| l.created_at >= one_year_ago)
                .take(representative_limit)
                .map(|l| (*l).clone())
                .collect()
        } else {
            Vec::new()
        };
        Ok(SummaryBucket { count, total_usd_minor, representative })
    }

    /// `get_and_format_all_or_summary`: full table under `threshold` total loans.
    pub async fn get_and_format_all_or_summary(&self, user_id: UserId, threshold: usize, now: i64) -> LedgerResult<(Vec<Loan>, Option<UserSummary>)> {
        let as_lender = self.store.list_loans_as_lender(user_id).await?;
        let as_borrower = self.store.list_loans_as_borrower(user_id).await?;
        let total = as_lender.len() + as_borrower.len();
        if total < threshold {
            let mut all = as_lender;
            all.extend(as_borrower);
            Ok((all, None))
        } else {
            Ok((Vec::new(), Some(self.summarize(user_id, now, 7).await?)))
        }
    }
}

fn ceil_div_f64(x: f64) -> i64 {
    x.ceil() as i64
}
