#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time;

use async_trait::async_trait;
use health::HealthRegistry;
use mail_common::mail::MailSource;
use mail_common::pgqueue::{MailQueue, NewMail};
use mail_common::retry::RetryPolicy;
use mail_worker::directory::{Contact, Directory};
use mail_worker::error::{DirectoryError, TransportError};
use mail_worker::message::{MailComposer, SenderSettings};
use mail_worker::reply::SharedReplyAddress;
use mail_worker::transport::{OutboundMail, Transport};
use mail_worker::worker::MailWorker;
use sqlx::PgPool;

pub const ALICE: i64 = 1;
pub const BOB: i64 = 2;

pub struct Users(HashMap<i64, Contact>);

impl Users {
    pub fn alice_and_bob() -> Self {
        Self(HashMap::from([
            (ALICE, Contact::new("Alice", "alice@example.com")),
            (BOB, Contact::new("Bob", "bob@example.com")),
        ]))
    }
}

#[async_trait]
impl Directory for Users {
    async fn contact(&self, user_id: i64) -> Result<Option<Contact>, DirectoryError> {
        Ok(self.0.get(&user_id).cloned())
    }
}

/// Plays back scripted outcomes, then succeeds. Records every mail it is handed.
#[derive(Default)]
pub struct ScriptedTransport {
    outcomes: Mutex<VecDeque<bool>>,
    sent: Mutex<Vec<OutboundMail>>,
    delay: Option<time::Duration>,
}

impl ScriptedTransport {
    /// `true` for a successful send, `false` for a rejected one.
    pub fn with_outcomes(outcomes: &[bool]) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.iter().copied().collect()),
            ..Default::default()
        }
    }

    pub fn slow(delay: time::Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<OutboundMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, mail: &OutboundMail) -> Result<(), TransportError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.sent.lock().unwrap().push(mail.clone());

        let success = self.outcomes.lock().unwrap().pop_front().unwrap_or(true);
        if success {
            Ok(())
        } else {
            Err(TransportError::Rejected("451".to_owned()))
        }
    }
}

pub fn composer(directory: Arc<dyn Directory>) -> MailComposer {
    MailComposer::new(
        directory,
        Arc::new(SharedReplyAddress::new("messages@example.org")),
        SenderSettings::new("Example <noreply@example.org>", "mail"),
    )
}

pub fn worker<'p>(
    queue: &'p MailQueue,
    directory: Arc<dyn Directory>,
    transport: Arc<dyn Transport>,
    max_concurrent_jobs: usize,
) -> MailWorker<'p> {
    MailWorker::new(
        "test",
        queue,
        time::Duration::from_millis(100),
        time::Duration::from_secs(5),
        max_concurrent_jobs,
        RetryPolicy::default(),
        composer(directory),
        transport,
        HealthRegistry::new("liveness"),
    )
}

pub fn comment_from_alice() -> NewMail {
    NewMail::new(
        Some(ALICE),
        MailSource::DiaryComment,
        BOB,
        "Alice commented on your diary entry",
        "<p>Nice trip!</p>".to_owned(),
    )
    .thread_ref("diary-3")
}

pub async fn count_mail(db: &PgPool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM mail")
        .fetch_one(db)
        .await
        .expect("failed to count mail")
}
