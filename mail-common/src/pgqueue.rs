//! # MailQueue
//!
//! A mail delivery queue backed by the `mail` table in PostgreSQL.
//!
//! A row exists for as long as its mail is pending: delivering or expiring a mail deletes it.
//! Workers claim rows with `FOR UPDATE SKIP LOCKED` inside a transaction that stays open
//! until the claim is resolved, so no `running` state has to be stored and a worker that
//! dies simply releases its row.
use std::str::FromStr;
use std::time;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use thiserror::Error;
use uuid::Uuid;

use crate::mail::MailSource;

/// Enumeration of parsing errors in MailQueue.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("{0} is not a valid MailSource")]
    ParseMailSourceError(String),
}

/// Enumeration of database-related errors in MailQueue.
/// Errors that can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("transaction {command} failed with: {error}")]
    TransactionError { command: String, error: sqlx::Error },
}

pub type PgQueueResult<T> = std::result::Result<T, DatabaseError>;

/// A pending mail, as stored in the queue.
#[derive(sqlx::FromRow, Debug, Clone, PartialEq)]
pub struct Mail {
    /// A unique id identifying a mail.
    pub id: Uuid,
    /// The user that triggered this mail, `None` for mails sent by the system itself.
    pub from_user_id: Option<i64>,
    /// What produced this mail.
    pub source: MailSource,
    /// The user this mail is addressed to.
    pub to_user_id: i64,
    pub subject: String,
    /// Rendered HTML body.
    pub body: String,
    /// Mails sharing a thread reference are grouped together by mail clients.
    pub thread_ref: Option<String>,
    /// Higher priority mails are claimed first among mails with the same attempt count.
    pub priority: i16,
    /// A datetime corresponding to when the mail was scheduled.
    pub created_at: DateTime<Utc>,
    /// Number of delivery attempts that already failed.
    pub attempt_count: i16,
    /// The mail cannot be claimed before this datetime. `None` means right away.
    pub not_before: Option<DateTime<Utc>>,
}

impl Mail {
    /// Return the number of failed attempts as an unsigned count.
    pub fn failed_attempts(&self) -> u32 {
        u32::try_from(self.attempt_count).unwrap_or(0)
    }
}

/// This struct represents a new mail being created to be enqueued into a `MailQueue`.
#[derive(Debug, Clone)]
pub struct NewMail {
    pub from_user_id: Option<i64>,
    pub source: MailSource,
    pub to_user_id: i64,
    pub subject: String,
    pub body: String,
    pub thread_ref: Option<String>,
    pub priority: i16,
}

impl NewMail {
    pub fn new(
        from_user_id: Option<i64>,
        source: MailSource,
        to_user_id: i64,
        subject: &str,
        body: String,
    ) -> Self {
        Self {
            from_user_id,
            source,
            to_user_id,
            subject: subject.to_owned(),
            body,
            thread_ref: None,
            priority: 0,
        }
    }

    pub fn thread_ref(mut self, thread_ref: &str) -> Self {
        self.thread_ref = Some(thread_ref.to_owned());
        self
    }

    pub fn priority(mut self, priority: i16) -> Self {
        self.priority = priority;
        self
    }
}

/// Insert a `NewMail` using any executor, typically the caller's open transaction.
/// The mail only becomes visible to workers once that transaction commits, and vanishes with it
/// if it rolls back.
/// We take ownership of `NewMail` to enforce a specific `NewMail` is only enqueued once.
pub async fn enqueue<'c, E>(executor: E, mail: NewMail) -> PgQueueResult<Uuid>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let id = Uuid::now_v7();
    let base_query = r#"
INSERT INTO mail
    (id, from_user_id, source, to_user_id, subject, body, thread_ref, priority, created_at, attempt_count, not_before)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), 0, NULL)
    "#;

    sqlx::query(base_query)
        .bind(id)
        .bind(mail.from_user_id)
        .bind(mail.source)
        .bind(mail.to_user_id)
        .bind(&mail.subject)
        .bind(&mail.body)
        .bind(&mail.thread_ref)
        .bind(mail.priority)
        .execute(executor)
        .await
        .map_err(|error| DatabaseError::QueryError {
            command: "INSERT".to_owned(),
            error,
        })?;

    Ok(id)
}

/// A `Mail` within an open PostgreSQL transaction holding its row lock.
/// Other workers running SKIP LOCKED queries cannot see it until the claim is resolved.
/// Dropping a `ClaimedMail` without resolving it rolls the transaction back, leaving the mail untouched.
#[derive(Debug)]
pub struct ClaimedMail {
    pub mail: Mail,
    txn: sqlx::Transaction<'static, sqlx::postgres::Postgres>,
}

impl ClaimedMail {
    /// Consume `ClaimedMail` to delete the mail after a successful delivery.
    pub async fn complete(mut self) -> PgQueueResult<CompletedMail> {
        delete_mail(&mut self.txn, self.mail.id).await?;
        commit(self.txn).await?;

        Ok(CompletedMail { id: self.mail.id })
    }

    /// Consume `ClaimedMail` to delete a mail that ran out of time to live.
    pub async fn expire(mut self) -> PgQueueResult<ExpiredMail> {
        delete_mail(&mut self.txn, self.mail.id).await?;
        commit(self.txn).await?;

        Ok(ExpiredMail {
            id: self.mail.id,
            created_at: self.mail.created_at,
            attempt_count: self.mail.attempt_count,
        })
    }

    /// Consume `ClaimedMail` to record a failed attempt and hide the mail until `not_before`.
    pub async fn requeue(mut self, not_before: DateTime<Utc>) -> PgQueueResult<RequeuedMail> {
        let base_query = r#"
UPDATE
    mail
SET
    attempt_count = attempt_count + 1,
    not_before = $2
WHERE
    id = $1
RETURNING
    attempt_count
        "#;

        let attempt_count: i16 = sqlx::query_scalar(base_query)
            .bind(self.mail.id)
            .bind(not_before)
            .fetch_one(&mut *self.txn)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        commit(self.txn).await?;

        Ok(RequeuedMail {
            id: self.mail.id,
            attempt_count,
            not_before,
        })
    }
}

async fn delete_mail(
    txn: &mut sqlx::Transaction<'static, sqlx::postgres::Postgres>,
    id: Uuid,
) -> PgQueueResult<()> {
    sqlx::query("DELETE FROM mail WHERE id = $1")
        .bind(id)
        .execute(&mut **txn)
        .await
        .map_err(|error| DatabaseError::QueryError {
            command: "DELETE".to_owned(),
            error,
        })?;

    Ok(())
}

async fn commit(txn: sqlx::Transaction<'static, sqlx::postgres::Postgres>) -> PgQueueResult<()> {
    txn.commit()
        .await
        .map_err(|error| DatabaseError::TransactionError {
            command: "COMMIT".to_owned(),
            error,
        })
}

/// State a mail is transitioned to after being delivered (or discarded): it is gone from the queue.
#[derive(Debug)]
pub struct CompletedMail {
    pub id: Uuid,
}

/// State a mail is transitioned to after a failed attempt that may still be retried.
#[derive(Debug)]
pub struct RequeuedMail {
    pub id: Uuid,
    /// The attempt count after this failure was recorded.
    pub attempt_count: i16,
    pub not_before: DateTime<Utc>,
}

/// State a mail is transitioned to after exhausting its time to live. It is gone from the queue.
#[derive(Debug)]
pub struct ExpiredMail {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Failed attempts before the one that expired the mail.
    pub attempt_count: i16,
}

/// A queue implemented on top of a PostgreSQL table.
#[derive(Clone)]
pub struct MailQueue {
    /// A connection pool used to connect to the PostgreSQL database.
    pool: PgPool,
    /// The longest a claim may be held. Enforced by PostgreSQL on the claiming transaction.
    processing_timeout: time::Duration,
}

impl MailQueue {
    /// Initialize a new MailQueue by intializing a connection pool to the database in `url`.
    ///
    /// # Arguments
    ///
    /// * `url`: A URL pointing to where the PostgreSQL database is hosted.
    /// * `max_connections`: The size of the connection pool.
    /// * `app_name`: Reported to PostgreSQL as `application_name`.
    pub fn new(url: &str, max_connections: u32, app_name: &'static str) -> PgQueueResult<Self> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|error| DatabaseError::PoolCreationError { error })?
            .application_name(app_name);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy_with(options);

        Ok(Self::new_from_pool(pool))
    }

    /// Initialize a new MailQueue from a provided connection pool.
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            processing_timeout: time::Duration::from_secs(60),
        }
    }

    /// Set how long a claim may be held before PostgreSQL terminates the claiming session.
    pub fn processing_timeout(mut self, processing_timeout: time::Duration) -> Self {
        self.processing_timeout = processing_timeout;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Enqueue a `NewMail` in its own transaction. Callers that need the mail to be atomic
    /// with their own writes should use `enqueue` with their transaction instead.
    pub async fn enqueue(&self, mail: NewMail) -> PgQueueResult<Uuid> {
        enqueue(&self.pool, mail).await
    }

    /// Claim the next eligible mail at `now` and hold the transaction.
    /// Any other `claim` calls will skip the locked row, so by holding a transaction we ensure only one
    /// worker can process a mail at a time.
    ///
    /// Eligible mails are served by fewest failed attempts, then highest priority, then oldest first.
    pub async fn claim(&self, now: DateTime<Utc>) -> PgQueueResult<Option<ClaimedMail>> {
        let mut txn = self
            .pool
            .begin()
            .await
            .map_err(|error| DatabaseError::ConnectionError { error })?;

        // A claim outliving the processing timeout is cut by the server, releasing the row lock.
        sqlx::query("SELECT set_config('idle_in_transaction_session_timeout', $1, true)")
            .bind(self.processing_timeout.as_millis().to_string())
            .execute(&mut *txn)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "SET".to_owned(),
                error,
            })?;

        // The query that follows uses a FOR UPDATE SKIP LOCKED clause.
        // For more details on this see: 2ndquadrant.com/en/blog/what-is-select-skip-locked-for-in-postgresql-9-5.
        let base_query = r#"
SELECT
    *
FROM
    mail
WHERE
    not_before IS NULL
    OR not_before <= $1
ORDER BY
    attempt_count,
    priority DESC,
    created_at
LIMIT 1
FOR UPDATE SKIP LOCKED
        "#;

        let mail: Option<Mail> = sqlx::query_as(base_query)
            .bind(now)
            .fetch_optional(&mut *txn)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        // Transaction is rolled back on drop.
        Ok(mail.map(|mail| ClaimedMail { mail, txn }))
    }
}
