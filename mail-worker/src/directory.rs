//! Looking up the people a mail is addressed to and sent on behalf of.
use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::DirectoryError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub display_name: String,
    pub email: String,
}

impl Contact {
    pub fn new(display_name: &str, email: &str) -> Self {
        Self {
            display_name: display_name.to_owned(),
            email: email.to_owned(),
        }
    }
}

/// Resolves user ids at send time, so renames and address changes made while a mail
/// waits in the queue are picked up.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Return `None` when the user no longer exists.
    async fn contact(&self, user_id: i64) -> Result<Option<Contact>, DirectoryError>;
}

/// A `Directory` reading the `"user"` table of the application database.
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Directory for PgDirectory {
    async fn contact(&self, user_id: i64) -> Result<Option<Contact>, DirectoryError> {
        let row: Option<(String, String)> =
            sqlx::query_as(r#"SELECT display_name, email FROM "user" WHERE id = $1"#)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(display_name, email)| Contact {
            display_name,
            email,
        }))
    }
}
