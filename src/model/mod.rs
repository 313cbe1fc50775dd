//! Core domain entities (§3).
//!
//! These are plain data records; persistence is entirely the job of
//! [`crate::store::Store`]. Nothing here talks to the database.

use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type CurrencyId = i64;
pub type MoneyId = i64;
pub type LoanId = i64;

/// A forum handle. Always lowercased before storage or lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
}

impl User {
    pub fn normalize(username: &str) -> String {
        username.to_lowercase()
    }
}

/// A stored currency row — metadata mirrors [`crate::money::Currency`] but
/// carries a database id and the instance's configured display symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyRow {
    pub id: CurrencyId,
    pub code: String,
    pub exponent: u32,
    pub symbol: Option<String>,
    pub symbol_on_left: bool,
}

/// A stored money row: minor-unit amount plus its frozen USD reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoneyRow {
    pub id: MoneyId,
    pub currency_id: CurrencyId,
    pub amount_minor: i64,
    pub amount_usd_minor: i64,
}

/// Loan-creation provenance: origin type 0 is "from a comment".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanCreationInfo {
    pub loan_id: LoanId,
    pub origin_type: i32,
    pub post_fullname: String,
    pub comment_fullname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loan {
    pub id: LoanId,
    pub lender_id: UserId,
    pub borrower_id: UserId,
    pub principal_id: MoneyId,
    pub principal_repaid_id: MoneyId,
    pub created_at: i64,
    pub repaid_at: Option<i64>,
    pub unpaid_at: Option<i64>,
    pub deleted_at: Option<i64>,
}

impl Loan {
    pub fn is_open(&self) -> bool {
        self.repaid_at.is_none() && self.deleted_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnpaidEventKind {
    Unpaid,
    Clearing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepaymentEvent {
    pub id: i64,
    pub loan_id: LoanId,
    pub money_id: MoneyId,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnpaidEvent {
    pub id: i64,
    pub loan_id: LoanId,
    pub kind: UnpaidEventKind,
    pub created_at: i64,
}

/// A forum item fullname the scanner has already processed. Insert-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandledFullname {
    pub fullname: String,
    pub handled_at: i64,
}

/// Cached user metadata from the forum (§4.5).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSnapshot {
    pub username: String,
    pub combined_karma: i64,
    pub comment_karma: i64,
    pub account_created_at: i64,
    pub approved: bool,
    pub moderator: bool,
    pub banned: bool,
    pub checked_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporaryBan {
    pub id: i64,
    pub username: String,
    pub moderator: String,
    pub subreddit: String,
    pub created_at: i64,
    pub ends_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustStatus {
    Unknown,
    Good,
    Bad,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trust {
    pub user_id: UserId,
    pub status: TrustStatus,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub auth_method_id: i64,
    pub permission: String,
}

/// A lender awaiting a trust recheck once they cross their configured
/// completed-as-lender threshold (§4.9 trust_loan_delays).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustLoanDelay {
    pub user_id: UserId,
    pub threshold: i64,
    pub min_review_at: i64,
}

/// A bucketed loan summary, one of six per §4.3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryBucket {
    pub count: i64,
    pub total_usd_minor: i64,
    pub representative: Vec<Loan>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub paid_as_lender: SummaryBucket,
    pub paid_as_borrower: SummaryBucket,
    pub unpaid_as_lender: SummaryBucket,
    pub unpaid_as_borrower: SummaryBucket,
    pub inprogress_as_lender: SummaryBucket,
    pub inprogress_as_borrower: SummaryBucket,
}

/// Event payload bodies published on the `events` topic exchange (§6).
pub mod events {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct MoneyPayload {
        pub minor: i64,
        pub currency: String,
        pub exp: u32,
        pub symbol: Option<String>,
        pub symbol_on_left: bool,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct UserDescriptor {
        pub id: UserId,
        pub username: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CommentDescriptor {
        pub link_fullname: String,
        pub fullname: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct LoansCreate {
        pub loan_id: LoanId,
        pub comment: CommentDescriptor,
        pub lender: UserDescriptor,
        pub borrower: UserDescriptor,
        pub amount: MoneyPayload,
        pub permalink: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct LoansPaid {
        pub loan_id: LoanId,
        pub lender: UserDescriptor,
        pub borrower: UserDescriptor,
        pub amount: MoneyPayload,
        pub was_unpaid: bool,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct LoansUnpaid {
        pub loan_unpaid_event_id: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct RequestPost {
        pub author: String,
        pub subreddit: String,
        pub fullname: String,
        pub title: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, Default)]
    pub struct RequestDetails {
        pub title: String,
        pub location: Option<String>,
        pub city: Option<String>,
        pub state: Option<String>,
        pub country: Option<String>,
        pub terms: Option<String>,
        pub processor: Option<String>,
        pub notes: Vec<String>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct LoansRequest {
        pub post: RequestPost,
        pub request: RequestDetails,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct UserSignup {
        pub user_id: UserId,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ModsChanged {
        pub username: String,
        pub user_id: UserId,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ModlogRecord {
        pub action: String,
        pub mod_username: String,
        pub target_username: Option<String>,
        pub subreddit: String,
        pub details: Option<String>,
        pub created_at: i64,
    }
}
