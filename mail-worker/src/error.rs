use std::time;

use mail_common::pgqueue;
use thiserror::Error;

/// Enumeration of errors raised by a `Transport` while sending a mail.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("{address:?} is not a valid mail address: {error}")]
    AddressError {
        address: String,
        error: lettre::address::AddressError,
    },
    #[error("failed to build message: {0}")]
    MessageError(#[from] lettre::error::Error),
    #[error("smtp delivery failed: {0}")]
    SmtpError(#[from] lettre::transport::smtp::Error),
    #[error("mail was rejected with code {0}")]
    Rejected(String),
    #[error("invalid smtp configuration: {0}")]
    ConfigError(String),
}

/// Enumeration of errors raised while resolving user contacts.
#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("contact query failed with: {0}")]
    QueryError(#[from] sqlx::Error),
}

#[derive(Error, Debug)]
#[error("failed to create a reply address for user {user_id}: {message}")]
pub struct ReplyAddressError {
    pub user_id: i64,
    pub message: String,
}

/// Everything that can go wrong during a delivery attempt.
/// None of these reach a caller: they all end up requeuing or expiring the mail.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error(transparent)]
    TransportError(#[from] TransportError),
    #[error(transparent)]
    DirectoryError(#[from] DirectoryError),
    #[error(transparent)]
    ReplyAddressError(#[from] ReplyAddressError),
    #[error("mail could not be sent within {0:?}")]
    Timeout(time::Duration),
}

/// Enumeration of errors related to claiming and resolving mails in the MailWorker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a database error occurred when processing a mail: {0}")]
    DatabaseError(#[from] pgqueue::DatabaseError),
}
