//! The relational store (§3, §5's "owned namespaces").
//!
//! The schema itself is an out-of-scope external collaborator per spec
//! §1 — this module defines only the interface the ledger, permission
//! cache, and workers consume, plus one concrete sqlite-backed adapter.

pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::*;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("unique violation during find-or-create, and re-find also missed")]
    FindOrCreateRace,
    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The full set of persistence operations the core depends on. One
/// connection-owning implementation ([`sqlite::SqliteStore`]) is provided;
/// tests use an in-memory fake that implements the same trait.
#[async_trait]
pub trait Store: Send + Sync {
    /// find-or-create-or-find (§9): lowercases `username`, looks it up,
    /// inserts on miss, and re-finds on a unique-violation race.
    async fn find_or_create_user(&self, username: &str) -> StoreResult<User>;
    async fn get_user(&self, id: UserId) -> StoreResult<Option<User>>;
    async fn get_user_by_name(&self, username: &str) -> StoreResult<Option<User>>;

    async fn find_or_create_currency(&self, code: &str) -> StoreResult<CurrencyRow>;
    async fn get_currency(&self, id: CurrencyId) -> StoreResult<Option<CurrencyRow>>;

    async fn create_money(&self, currency_id: CurrencyId, amount_minor: i64, amount_usd_minor: i64) -> StoreResult<MoneyRow>;
    async fn get_money(&self, id: MoneyId) -> StoreResult<Option<MoneyRow>>;

    async fn create_loan(
        &self,
        lender_id: UserId,
        borrower_id: UserId,
        principal_id: MoneyId,
        principal_repaid_id: MoneyId,
        created_at: i64,
    ) -> StoreResult<Loan>;
    async fn create_loan_creation_info(
        &self,
        loan_id: LoanId,
        origin_type: i32,
        post_fullname: &str,
        comment_fullname: &str,
    ) -> StoreResult<LoanCreationInfo>;
    async fn get_loan(&self, id: LoanId) -> StoreResult<Option<Loan>>;

    /// Open (non-repaid, non-deleted) loans for a lender/borrower pair,
    /// oldest first.
    async fn list_open_loans_for_pair(&self, lender_id: UserId, borrower_id: UserId) -> StoreResult<Vec<Loan>>;
    /// All non-deleted loans where `user_id` is lender or borrower, newest first.
    async fn list_loans_as_lender(&self, user_id: UserId) -> StoreResult<Vec<Loan>>;
    async fn list_loans_as_borrower(&self, user_id: UserId) -> StoreResult<Vec<Loan>>;

    /// Replace the loan's principal-repaid pointer with a new money row,
    /// leaving the prior row untouched (history).
    async fn set_loan_principal_repaid(&self, loan_id: LoanId, new_money_id: MoneyId) -> StoreResult<()>;
    async fn set_loan_repaid_at(&self, loan_id: LoanId, repaid_at: Option<i64>) -> StoreResult<()>;
    async fn set_loan_unpaid_at(&self, loan_id: LoanId, unpaid_at: Option<i64>) -> StoreResult<()>;

    async fn insert_repayment_event(&self, loan_id: LoanId, money_id: MoneyId, created_at: i64) -> StoreResult<RepaymentEvent>;
    async fn insert_unpaid_event(&self, loan_id: LoanId, kind: UnpaidEventKind, created_at: i64) -> StoreResult<UnpaidEvent>;
    async fn sum_repayment_events(&self, loan_id: LoanId) -> StoreResult<i64>;

    /// Returns the subset of `fullnames` already present.
    async fn filter_handled_fullnames(&self, fullnames: &[String]) -> StoreResult<Vec<String>>;
    async fn insert_handled_fullname(&self, fullname: &str, handled_at: i64) -> StoreResult<()>;

    async fn get_permission_snapshot(&self, username: &str) -> StoreResult<Option<PermissionSnapshot>>;
    async fn set_permission_snapshot(&self, snapshot: &PermissionSnapshot) -> StoreResult<()>;
    async fn delete_permission_snapshot(&self, username: &str) -> StoreResult<()>;

    async fn insert_temporary_ban(&self, username: &str, moderator: &str, subreddit: &str, created_at: i64, ends_at: i64) -> StoreResult<TemporaryBan>;
    async fn list_expiring_temporary_bans(&self, before: i64, limit: usize) -> StoreResult<Vec<TemporaryBan>>;
    async fn delete_temporary_ban(&self, id: i64) -> StoreResult<()>;
    async fn delete_temporary_ban_for_subreddit(&self, username: &str, subreddit: &str) -> StoreResult<()>;

    async fn get_trust(&self, user_id: UserId) -> StoreResult<Option<Trust>>;
    async fn set_trust(&self, trust: &Trust) -> StoreResult<()>;

    async fn get_permission_grant(&self, auth_method_id: i64, permission: &str) -> StoreResult<Option<PermissionGrant>>;
    async fn insert_permission_grant(&self, auth_method_id: i64, permission: &str) -> StoreResult<()>;

    /// Count of the user's non-deleted, repaid loans as lender — the
    /// "completed-as-lender" count used by trust_loan_delays/lender_queue_trusts/recheck_permission.
    async fn count_completed_as_lender(&self, user_id: UserId) -> StoreResult<i64>;
    /// Count of the user's non-deleted loans as lender (any status).
    async fn count_loans_as_lender(&self, user_id: UserId) -> StoreResult<i64>;
    /// Count of the user's currently-unpaid loans as borrower.
    async fn count_unpaid_as_borrower(&self, user_id: UserId) -> StoreResult<i64>;

    async fn get_mod_onboarding_progress(&self, username: &str) -> StoreResult<i64>;
    async fn set_mod_onboarding_progress(&self, username: &str, progress: i64) -> StoreResult<()>;

    async fn list_moderators(&self, subreddit: &str) -> StoreResult<Vec<String>>;
    async fn add_moderator(&self, username: &str, subreddit: &str) -> StoreResult<()>;
    async fn remove_moderator(&self, username: &str, subreddit: &str) -> StoreResult<()>;

    async fn get_endpoint_alert_state(&self, username: &str, endpoint: &str) -> StoreResult<Option<(i64, i64)>>;
    async fn set_endpoint_alert_state(&self, username: &str, endpoint: &str, last_used_at: i64, last_alerted_at: i64) -> StoreResult<()>;
    /// Every known `(username, endpoint)` usage/alert pair, for the three
    /// deprecated_alerts passes to scan in one read.
    async fn list_endpoint_alert_states(&self) -> StoreResult<Vec<(String, String, i64, i64)>>;

    async fn get_unpaid_event(&self, id: i64) -> StoreResult<Option<UnpaidEvent>>;

    /// A lender's configured review threshold and the earliest time their
    /// trust should be reviewed, used by trust_loan_delays/lender_queue_trusts.
    async fn get_trust_loan_delay(&self, user_id: UserId) -> StoreResult<Option<TrustLoanDelay>>;
    async fn set_trust_loan_delay(&self, user_id: UserId, threshold: i64, min_review_at: i64) -> StoreResult<()>;
    async fn delete_trust_loan_delay(&self, user_id: UserId) -> StoreResult<()>;

    /// Whether `user_id` has claimed a human authentication method (signed
    /// up with a password) yet. See DESIGN.md for the simplification this
    /// takes over the original `password_authentications` table.
    async fn is_account_claimed(&self, user_id: UserId) -> StoreResult<bool>;
    async fn mark_account_claimed(&self, user_id: UserId) -> StoreResult<()>;

    async fn list_permission_grants(&self, auth_method_id: i64) -> StoreResult<Vec<String>>;
    async fn revoke_permission_grant(&self, auth_method_id: i64, permission: &str) -> StoreResult<()>;

    /// Every non-deleted loan together with its principal's USD minor
    /// amount, for the loans_stats worker's monthly/quarterly aggregation.
    /// A dedicated read instead of loading every `MoneyRow` one at a time.
    async fn list_loans_with_usd_for_stats(&self) -> StoreResult<Vec<(Loan, i64)>>;
}
