//! SQLite-backed [`Store`] (C3/C5's persistence). Mirrors the teacher's
//! `api/db.rs`: a single `rusqlite::Connection` behind a `tokio::sync::Mutex`,
//! migrated on open with `CREATE TABLE IF NOT EXISTS`.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;

use crate::model::*;
use super::{Store, StoreError, StoreResult};

pub type Conn = Arc<Mutex<Connection>>;

pub struct SqliteStore {
    conn: Conn,
}

impl SqliteStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("creating database directory")?;
            }
        }
        let conn = Connection::open(path).with_context(|| format!("opening sqlite at {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        migrate(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory sqlite")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrate(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }
}

fn migrate(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id       INTEGER PRIMARY KEY,
            username TEXT UNIQUE NOT NULL
        );

        CREATE TABLE IF NOT EXISTS currencies (
            id              INTEGER PRIMARY KEY,
            code            TEXT UNIQUE NOT NULL,
            exponent        INTEGER NOT NULL,
            symbol          TEXT,
            symbol_on_left  INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS moneys (
            id                INTEGER PRIMARY KEY,
            currency_id       INTEGER NOT NULL REFERENCES currencies(id),
            amount_minor      INTEGER NOT NULL,
            amount_usd_minor  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS loans (
            id                   INTEGER PRIMARY KEY,
            lender_id            INTEGER NOT NULL REFERENCES users(id),
            borrower_id          INTEGER NOT NULL REFERENCES users(id),
            principal_id         INTEGER NOT NULL REFERENCES moneys(id),
            principal_repaid_id  INTEGER NOT NULL REFERENCES moneys(id),
            created_at           INTEGER NOT NULL,
            repaid_at            INTEGER,
            unpaid_at            INTEGER,
            deleted_at           INTEGER
        );

        CREATE TABLE IF NOT EXISTS loan_creation_infos (
            loan_id         INTEGER PRIMARY KEY REFERENCES loans(id),
            origin_type     INTEGER NOT NULL,
            post_fullname   TEXT NOT NULL,
            comment_fullname TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS loan_repayment_events (
            id          INTEGER PRIMARY KEY,
            loan_id     INTEGER NOT NULL REFERENCES loans(id),
            money_id    INTEGER NOT NULL REFERENCES moneys(id),
            created_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS loan_unpaid_events (
            id          INTEGER PRIMARY KEY,
            loan_id     INTEGER NOT NULL REFERENCES loans(id),
            kind        TEXT NOT NULL,
            created_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS handled_fullnames (
            fullname    TEXT PRIMARY KEY,
            handled_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS permission_snapshots (
            username            TEXT PRIMARY KEY,
            combined_karma      INTEGER NOT NULL,
            comment_karma       INTEGER NOT NULL,
            account_created_at  INTEGER NOT NULL,
            approved            INTEGER NOT NULL,
            moderator           INTEGER NOT NULL,
            banned              INTEGER NOT NULL,
            checked_at          INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS temporary_bans (
            id          INTEGER PRIMARY KEY,
            username    TEXT NOT NULL,
            moderator   TEXT NOT NULL,
            subreddit   TEXT NOT NULL,
            created_at  INTEGER NOT NULL,
            ends_at     INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS trusts (
            user_id  INTEGER PRIMARY KEY REFERENCES users(id),
            status   TEXT NOT NULL,
            reason   TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS password_auth_permissions (
            auth_method_id  INTEGER NOT NULL,
            permission      TEXT NOT NULL,
            PRIMARY KEY (auth_method_id, permission)
        );

        CREATE TABLE IF NOT EXISTS moderators (
            username   TEXT NOT NULL,
            subreddit  TEXT NOT NULL,
            PRIMARY KEY (username, subreddit)
        );

        CREATE TABLE IF NOT EXISTS mod_onboarding_progress (
            username  TEXT PRIMARY KEY,
            progress  INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS endpoint_alerts (
            username        TEXT NOT NULL,
            endpoint        TEXT NOT NULL,
            last_used_at    INTEGER NOT NULL,
            last_alerted_at INTEGER NOT NULL,
            PRIMARY KEY (username, endpoint)
        );

        CREATE TABLE IF NOT EXISTS trust_loan_delays (
            user_id        INTEGER PRIMARY KEY REFERENCES users(id),
            threshold      INTEGER NOT NULL,
            min_review_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS claimed_accounts (
            user_id  INTEGER PRIMARY KEY REFERENCES users(id)
        );
        ",
    )?;
    Ok(())
}

fn row_to_unpaid_event(row: &rusqlite::Row) -> rusqlite::Result<UnpaidEvent> {
    let kind: String = row.get(2)?;
    Ok(UnpaidEvent {
        id: row.get(0)?,
        loan_id: row.get(1)?,
        kind: if kind == "clearing" { UnpaidEventKind::Clearing } else { UnpaidEventKind::Unpaid },
        created_at: row.get(3)?,
    })
}

fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    Ok(User { id: row.get(0)?, username: row.get(1)? })
}

fn row_to_currency(row: &rusqlite::Row) -> rusqlite::Result<CurrencyRow> {
    Ok(CurrencyRow {
        id: row.get(0)?,
        code: row.get(1)?,
        exponent: row.get::<_, i64>(2)? as u32,
        symbol: row.get(3)?,
        symbol_on_left: row.get::<_, i64>(4)? != 0,
    })
}

fn row_to_money(row: &rusqlite::Row) -> rusqlite::Result<MoneyRow> {
    Ok(MoneyRow {
        id: row.get(0)?,
        currency_id: row.get(1)?,
        amount_minor: row.get(2)?,
        amount_usd_minor: row.get(3)?,
    })
}

fn row_to_loan(row: &rusqlite::Row) -> rusqlite::Result<Loan> {
    Ok(Loan {
        id: row.get(0)?,
        lender_id: row.get(1)?,
        borrower_id: row.get(2)?,
        principal_id: row.get(3)?,
        principal_repaid_id: row.get(4)?,
        created_at: row.get(5)?,
        repaid_at: row.get(6)?,
        unpaid_at: row.get(7)?,
        deleted_at: row.get(8)?,
    })
}

const LOAN_COLUMNS: &str =
    "id, lender_id, borrower_id, principal_id, principal_repaid_id, created_at, repaid_at, unpaid_at, deleted_at";

#[async_trait]
impl Store for SqliteStore {
    async fn find_or_create_user(&self, username: &str) -> StoreResult<User> {
        let username = User::normalize(username);
        let conn = self.conn.lock().await;
        if let Some(u) = conn
            .query_row("SELECT id, username FROM users WHERE username = ?1", params![username], row_to_user)
            .optional()
            .map_err(|e| StoreError::Backend(e.into()))?
        {
            return Ok(u);
        }
        match conn.execute("INSERT INTO users (username) VALUES (?1)", params![username]) {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                Ok(User { id, username })
            }
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => conn
                .query_row("SELECT id, username FROM users WHERE username = ?1", params![username], row_to_user)
                .optional()
                .map_err(|e| StoreError::Backend(e.into()))?
                .ok_or(StoreError::FindOrCreateRace),
            Err(e) => Err(StoreError::Backend(e.into())),
        }
    }

    async fn get_user(&self, id: UserId) -> StoreResult<Option<User>> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT id, username FROM users WHERE id = ?1", params![id], row_to_user)
            .optional()
            .map_err(|e| StoreError::Backend(e.into()))
    }

    async fn get_user_by_name(&self, username: &str) -> StoreResult<Option<User>> {
        let username = User::normalize(username);
        let conn = self.conn.lock().await;
        conn.query_row("SELECT id, username FROM users WHERE username = ?1", params![username], row_to_user)
            .optional()
            .map_err(|e| StoreError::Backend(e.into()))
    }

    async fn find_or_create_currency(&self, code: &str) -> StoreResult<CurrencyRow> {
        let code = code.to_uppercase();
        let exponent = crate::money::exponent_for(&code).map_err(|e| StoreError::Backend(e.into()))?;
        let conn = self.conn.lock().await;
        if let Some(c) = conn
            .query_row(
                "SELECT id, code, exponent, symbol, symbol_on_left FROM currencies WHERE code = ?1",
                params![code],
                row_to_currency,
            )
            .optional()
            .map_err(|e| StoreError::Backend(e.into()))?
        {
            return Ok(c);
        }
        match conn.execute(
            "INSERT INTO currencies (code, exponent, symbol, symbol_on_left) VALUES (?1, ?2, NULL, 0)",
            params![code, exponent],
        ) {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                Ok(CurrencyRow { id, code, exponent, symbol: None, symbol_on_left: false })
            }
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => conn
                .query_row(
                    "SELECT id, code, exponent, symbol, symbol_on_left FROM currencies WHERE code = ?1",
                    params![code],
                    row_to_currency,
                )
                .optional()
                .map_err(|e| StoreError::Backend(e.into()))?
                .ok_or(StoreError::FindOrCreateRace),
            Err(e) => Err(StoreError::Backend(e.into())),
        }
    }

    async fn get_currency(&self, id: CurrencyId) -> StoreResult<Option<CurrencyRow>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, code, exponent, symbol, symbol_on_left FROM currencies WHERE id = ?1",
            params![id],
            row_to_currency,
        )
        .optional()
        .map_err(|e| StoreError::Backend(e.into()))
    }

    async fn create_money(&self, currency_id: CurrencyId, amount_minor: i64, amount_usd_minor: i64) -> StoreResult<MoneyRow> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO moneys (currency_id, amount_minor, amount_usd_minor) VALUES (?1, ?2, ?3)",
            params![currency_id, amount_minor, amount_usd_minor],
        )
        .map_err(|e| StoreError::Backend(e.into()))?;
        let id = conn.last_insert_rowid();
        Ok(MoneyRow { id, currency_id, amount_minor, amount_usd_minor })
    }

    async fn get_money(&self, id: MoneyId) -> StoreResult<Option<MoneyRow>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, currency_id, amount_minor, amount_usd_minor FROM moneys WHERE id = ?1",
            params![id],
            row_to_money,
        )
        .optional()
        .map_err(|e| StoreError::Backend(e.into()))
    }

    async fn create_loan(
        &self,
        lender_id: UserId,
        borrower_id: UserId,
        principal_id: MoneyId,
        principal_repaid_id: MoneyId,
        created_at: i64,
    ) -> StoreResult<Loan> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO loans (lender_id, borrower_id, principal_id, principal_repaid_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![lender_id, borrower_id, principal_id, principal_repaid_id, created_at],
        )
        .map_err(|e| StoreError::Backend(e.into()))?;
        let id = conn.last_insert_rowid();
        Ok(Loan { id, lender_id, borrower_id, principal_id, principal_repaid_id, created_at, repaid_at: None, unpaid_at: None, deleted_at: None })
    }

    async fn create_loan_creation_info(&self, loan_id: LoanId, origin_type: i32, post_fullname: &str, comment_fullname: &str) -> StoreResult<LoanCreationInfo> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO loan_creation_infos (loan_id, origin_type, post_fullname, comment_fullname) VALUES (?1, ?2, ?3, ?4)",
            params![loan_id, origin_type, post_fullname, comment_fullname],
        )
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(LoanCreationInfo { loan_id, origin_type, post_fullname: post_fullname.to_string(), comment_fullname: comment_fullname.to_string() })
    }

    async fn get_loan(&self, id: LoanId) -> StoreResult<Option<Loan>> {
        let conn = self.conn.lock().await;
        conn.query_row(&format!("SELECT {LOAN_COLUMNS} FROM loans WHERE id = ?1"), params![id], row_to_loan)
            .optional()
            .map_err(|e| StoreError::Backend(e.into()))
    }

    async fn list_open_loans_for_pair(&self, lender_id: UserId, borrower_id: UserId) -> StoreResult<Vec<Loan>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {LOAN_COLUMNS} FROM loans WHERE lender_id = ?1 AND borrower_id = ?2 AND repaid_at IS NULL AND deleted_at IS NULL ORDER BY created_at ASC, id ASC"
            ))
            .map_err(|e| StoreError::Backend(e.into()))?;
        let rows = stmt
            .query_map(params![lender_id, borrower_id], row_to_loan)
            .map_err(|e| StoreError::Backend(e.into()))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| StoreError::Backend(e.into()))
    }

    async fn list_loans_as_lender(&self, user_id: UserId) -> StoreResult<Vec<Loan>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!("SELECT {LOAN_COLUMNS} FROM loans WHERE lender_id = ?1 AND deleted_at IS NULL ORDER BY created_at DESC"))
            .map_err(|e| StoreError::Backend(e.into()))?;
        let rows = stmt.query_map(params![user_id], row_to_loan).map_err(|e| StoreError::Backend(e.into()))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| StoreError::Backend(e.into()))
    }

    async fn list_loans_as_borrower(&self, user_id: UserId) -> StoreResult<Vec<Loan>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!("SELECT {LOAN_COLUMNS} FROM loans WHERE borrower_id = ?1 AND deleted_at IS NULL ORDER BY created_at DESC"))
            .map_err(|e| StoreError::Backend(e.into()))?;
        let rows = stmt.query_map(params![user_id], row_to_loan).map_err(|e| StoreError::Backend(e.into()))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| StoreError::Backend(e.into()))
    }

    async fn set_loan_principal_repaid(&self, loan_id: LoanId, new_money_id: MoneyId) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("UPDATE loans SET principal_repaid_id = ?1 WHERE id = ?2", params![new_money_id, loan_id])
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn set_loan_repaid_at(&self, loan_id: LoanId, repaid_at: Option<i64>) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("UPDATE loans SET repaid_at = ?1 WHERE id = ?2", params![repaid_at, loan_id])
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn set_loan_unpaid_at(&self, loan_id: LoanId, unpaid_at: Option<i64>) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("UPDATE loans SET unpaid_at = ?1 WHERE id = ?2", params![unpaid_at, loan_id])
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn insert_repayment_event(&self, loan_id: LoanId, money_id: MoneyId, created_at: i64) -> StoreResult<RepaymentEvent> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO loan_repayment_events (loan_id, money_id, created_at) VALUES (?1, ?2, ?3)",
            params![loan_id, money_id, created_at],
        )
        .map_err(|e| StoreError::Backend(e.into()))?;
        let id = conn.last_insert_rowid();
        Ok(RepaymentEvent { id, loan_id, money_id, created_at })
    }

    async fn insert_unpaid_event(&self, loan_id: LoanId, kind: UnpaidEventKind, created_at: i64) -> StoreResult<UnpaidEvent> {
        let kind_str = match kind {
            UnpaidEventKind::Unpaid => "unpaid",
            UnpaidEventKind::Clearing => "clearing",
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO loan_unpaid_events (loan_id, kind, created_at) VALUES (?1, ?2, ?3)",
            params![loan_id, kind_str, created_at],
        )
        .map_err(|e| StoreError::Backend(e.into()))?;
        let id = conn.last_insert_rowid();
        Ok(UnpaidEvent { id, loan_id, kind, created_at })
    }

    async fn sum_repayment_events(&self, loan_id: LoanId) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT COALESCE(SUM(m.amount_minor), 0) FROM loan_repayment_events e JOIN moneys m ON m.id = e.money_id WHERE e.loan_id = ?1",
            params![loan_id],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::Backend(e.into()))
    }

    async fn filter_handled_fullnames(&self, fullnames: &[String]) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut known = Vec::new();
        for f in fullnames {
            let exists: bool = conn
                .query_row("SELECT 1 FROM handled_fullnames WHERE fullname = ?1", params![f], |_| Ok(true))
                .optional()
                .map_err(|e| StoreError::Backend(e.into()))?
                .unwrap_or(false);
            if exists {
                known.push(f.clone());
            }
        }
        Ok(known)
    }

    async fn insert_handled_fullname(&self, fullname: &str, handled_at: i64) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO handled_fullnames (fullname, handled_at) VALUES (?1, ?2)",
            params![fullname, handled_at],
        )
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn get_permission_snapshot(&self, username: &str) -> StoreResult<Option<PermissionSnapshot>> {
        let username = User::normalize(username);
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT username, combined_karma, comment_karma, account_created_at, approved, moderator, banned, checked_at FROM permission_snapshots WHERE username = ?1",
            params![username],
            |row| {
                Ok(PermissionSnapshot {
                    username: row.get(0)?,
                    combined_karma: row.get(1)?,
                    comment_karma: row.get(2)?,
                    account_created_at: row.get(3)?,
                    approved: row.get::<_, i64>(4)? != 0,
                    moderator: row.get::<_, i64>(5)? != 0,
                    banned: row.get::<_, i64>(6)? != 0,
                    checked_at: row.get(7)?,
                })
            },
        )
        .optional()
        .map_err(|e| StoreError::Backend(e.into()))
    }

    async fn set_permission_snapshot(&self, snapshot: &PermissionSnapshot) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO permission_snapshots (username, combined_karma, comment_karma, account_created_at, approved, moderator, banned, checked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(username) DO UPDATE SET
               combined_karma = excluded.combined_karma,
               comment_karma = excluded.comment_karma,
               account_created_at = excluded.account_created_at,
               approved = excluded.approved,
               moderator = excluded.moderator,
               banned = excluded.banned,
               checked_at = excluded.checked_at",
            params![
                snapshot.username,
                snapshot.combined_karma,
                snapshot.comment_karma,
                snapshot.account_created_at,
                snapshot.approved as i64,
                snapshot.moderator as i64,
                snapshot.banned as i64,
                snapshot.checked_at,
            ],
        )
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn delete_permission_snapshot(&self, username: &str) -> StoreResult<()> {
        let username = User::normalize(username);
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM permission_snapshots WHERE username = ?1", params![username])
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn insert_temporary_ban(&self, username: &str, moderator: &str, subreddit: &str, created_at: i64, ends_at: i64) -> StoreResult<TemporaryBan> {
        let username = User::normalize(username);
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO temporary_bans (username, moderator, subreddit, created_at, ends_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![username, moderator, subreddit, created_at, ends_at],
        )
        .map_err(|e| StoreError::Backend(e.into()))?;
        let id = conn.last_insert_rowid();
        Ok(TemporaryBan { id, username, moderator: moderator.to_string(), subreddit: subreddit.to_string(), created_at, ends_at })
    }

    async fn list_expiring_temporary_bans(&self, before: i64, limit: usize) -> StoreResult<Vec<TemporaryBan>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT id, username, moderator, subreddit, created_at, ends_at FROM temporary_bans WHERE ends_at < ?1 LIMIT ?2")
            .map_err(|e| StoreError::Backend(e.into()))?;
        let rows = stmt
            .query_map(params![before, limit as i64], |row| {
                Ok(TemporaryBan {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    moderator: row.get(2)?,
                    subreddit: row.get(3)?,
                    created_at: row.get(4)?,
                    ends_at: row.get(5)?,
                })
            })
            .map_err(|e| StoreError::Backend(e.into()))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| StoreError::Backend(e.into()))
    }

    async fn delete_temporary_ban(&self, id: i64) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM temporary_bans WHERE id = ?1", params![id]).map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn delete_temporary_ban_for_subreddit(&self, username: &str, subreddit: &str) -> StoreResult<()> {
        let username = User::normalize(username);
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM temporary_bans WHERE username = ?1 AND subreddit = ?2", params![username, subreddit])
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn get_trust(&self, user_id: UserId) -> StoreResult<Option<Trust>> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT user_id, status, reason FROM trusts WHERE user_id = ?1", params![user_id], |row| {
            let status: String = row.get(1)?;
            Ok(Trust {
                user_id: row.get(0)?,
                status: match status.as_str() {
                    "good" => TrustStatus::Good,
                    "bad" => TrustStatus::Bad,
                    _ => TrustStatus::Unknown,
                },
                reason: row.get(2)?,
            })
        })
        .optional()
        .map_err(|e| StoreError::Backend(e.into()))
    }

    async fn set_trust(&self, trust: &Trust) -> StoreResult<()> {
        let status = match trust.status {
            TrustStatus::Unknown => "unknown",
            TrustStatus::Good => "good",
            TrustStatus::Bad => "bad",
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO trusts (user_id, status, reason) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET status = excluded.status, reason = excluded.reason",
            params![trust.user_id, status, trust.reason],
        )
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn get_permission_grant(&self, auth_method_id: i64, permission: &str) -> StoreResult<Option<PermissionGrant>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT auth_method_id, permission FROM password_auth_permissions WHERE auth_method_id = ?1 AND permission = ?2",
            params![auth_method_id, permission],
            |row| Ok(PermissionGrant { auth_method_id: row.get(0)?, permission: row.get(1)? }),
        )
        .optional()
        .map_err(|e| StoreError::Backend(e.into()))
    }

    async fn insert_permission_grant(&self, auth_method_id: i64, permission: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO password_auth_permissions (auth_method_id, permission) VALUES (?1, ?2)",
            params![auth_method_id, permission],
        )
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn count_completed_as_lender(&self, user_id: UserId) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT COUNT(*) FROM loans WHERE lender_id = ?1 AND deleted_at IS NULL AND repaid_at IS NOT NULL",
            params![user_id],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::Backend(e.into()))
    }

    async fn count_loans_as_lender(&self, user_id: UserId) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT COUNT(*) FROM loans WHERE lender_id = ?1 AND deleted_at IS NULL", params![user_id], |row| row.get(0))
            .map_err(|e| StoreError::Backend(e.into()))
    }

    async fn count_unpaid_as_borrower(&self, user_id: UserId) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT COUNT(*) FROM loans WHERE borrower_id = ?1 AND deleted_at IS NULL AND unpaid_at IS NOT NULL",
            params![user_id],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::Backend(e.into()))
    }

    async fn get_mod_onboarding_progress(&self, username: &str) -> StoreResult<i64> {
        let username = User::normalize(username);
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row("SELECT progress FROM mod_onboarding_progress WHERE username = ?1", params![username], |row| row.get(0))
            .optional()
            .map_err(|e| StoreError::Backend(e.into()))?
            .unwrap_or(0))
    }

    async fn set_mod_onboarding_progress(&self, username: &str, progress: i64) -> StoreResult<()> {
        let username = User::normalize(username);
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO mod_onboarding_progress (username, progress) VALUES (?1, ?2)
             ON CONFLICT(username) DO UPDATE SET progress = excluded.progress",
            params![username, progress],
        )
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn list_moderators(&self, subreddit: &str) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT username FROM moderators WHERE subreddit = ?1")
            .map_err(|e| StoreError::Backend(e.into()))?;
        let rows = stmt.query_map(params![subreddit], |row| row.get(0)).map_err(|e| StoreError::Backend(e.into()))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| StoreError::Backend(e.into()))
    }

    async fn add_moderator(&self, username: &str, subreddit: &str) -> StoreResult<()> {
        let username = User::normalize(username);
        let conn = self.conn.lock().await;
        conn.execute("INSERT OR IGNORE INTO moderators (username, subreddit) VALUES (?1, ?2)", params![username, subreddit])
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn remove_moderator(&self, username: &str, subreddit: &str) -> StoreResult<()> {
        let username = User::normalize(username);
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM moderators WHERE username = ?1 AND subreddit = ?2", params![username, subreddit])
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn get_endpoint_alert_state(&self, username: &str, endpoint: &str) -> StoreResult<Option<(i64, i64)>> {
        let username = User::normalize(username);
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT last_used_at, last_alerted_at FROM endpoint_alerts WHERE username = ?1 AND endpoint = ?2",
            params![username, endpoint],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| StoreError::Backend(e.into()))
    }

    async fn set_endpoint_alert_state(&self, username: &str, endpoint: &str, last_used_at: i64, last_alerted_at: i64) -> StoreResult<()> {
        let username = User::normalize(username);
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO endpoint_alerts (username, endpoint, last_used_at, last_alerted_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(username, endpoint) DO UPDATE SET last_used_at = excluded.last_used_at, last_alerted_at = excluded.last_alerted_at",
            params![username, endpoint, last_used_at, last_alerted_at],
        )
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn list_endpoint_alert_states(&self) -> StoreResult<Vec<(String, String, i64, i64)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT username, endpoint, last_used_at, last_alerted_at FROM endpoint_alerts")
            .map_err(|e| StoreError::Backend(e.into()))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
            .map_err(|e| StoreError::Backend(e.into()))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| StoreError::Backend(e.into()))
    }

    async fn get_unpaid_event(&self, id: i64) -> StoreResult<Option<UnpaidEvent>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, loan_id, kind, created_at FROM loan_unpaid_events WHERE id = ?1",
            params![id],
            row_to_unpaid_event,
        )
        .optional()
        .map_err(|e| StoreError::Backend(e.into()))
    }

    async fn get_trust_loan_delay(&self, user_id: UserId) -> StoreResult<Option<TrustLoanDelay>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT user_id, threshold, min_review_at FROM trust_loan_delays WHERE user_id = ?1",
            params![user_id],
            |row| Ok(TrustLoanDelay { user_id: row.get(0)?, threshold: row.get(1)?, min_review_at: row.get(2)? }),
        )
        .optional()
        .map_err(|e| StoreError::Backend(e.into()))
    }

    async fn set_trust_loan_delay(&self, user_id: UserId, threshold: i64, min_review_at: i64) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO trust_loan_delays (user_id, threshold, min_review_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET threshold = excluded.threshold, min_review_at = excluded.min_review_at",
            params![user_id, threshold, min_review_at],
        )
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn delete_trust_loan_delay(&self, user_id: UserId) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM trust_loan_delays WHERE user_id = ?1", params![user_id])
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn is_account_claimed(&self, user_id: UserId) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        let found: Option<i64> = conn
            .query_row("SELECT user_id FROM claimed_accounts WHERE user_id = ?1", params![user_id], |row| row.get(0))
            .optional()
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(found.is_some())
    }

    async fn mark_account_claimed(&self, user_id: UserId) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("INSERT OR IGNORE INTO claimed_accounts (user_id) VALUES (?1)", params![user_id])
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn list_permission_grants(&self, auth_method_id: i64) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT permission FROM password_auth_permissions WHERE auth_method_id = ?1")
            .map_err(|e| StoreError::Backend(e.into()))?;
        let rows = stmt.query_map(params![auth_method_id], |row| row.get(0)).map_err(|e| StoreError::Backend(e.into()))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| StoreError::Backend(e.into()))
    }

    async fn revoke_permission_grant(&self, auth_method_id: i64, permission: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM password_auth_permissions WHERE auth_method_id = ?1 AND permission = ?2",
            params![auth_method_id, permission],
        )
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn list_loans_with_usd_for_stats(&self) -> StoreResult<Vec<(Loan, i64)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {LOAN_COLUMNS}, (SELECT amount_usd_minor FROM moneys WHERE moneys.id = loans.principal_id) \
                 FROM loans WHERE deleted_at IS NULL"
            ))
            .map_err(|e| StoreError::Backend(e.into()))?;
        let rows = stmt
            .query_map([], |row| Ok((row_to_loan(row)?, row.get(9)?)))
            .map_err(|e| StoreError::Backend(e.into()))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| StoreError::Backend(e.into()))
    }
}
