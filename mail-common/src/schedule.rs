//! Scheduling mails from business code.
//!
//! `MailScheduler::schedule` renders the body in the recipient's language and inserts the mail
//! on the caller's connection. Passing an open transaction ties the mail to the business event
//! that produced it: no commit, no mail.
use serde_json::Value;
use sqlx::PgConnection;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::mail::{MailSource, Recipient};
use crate::pgqueue::{self, DatabaseError, NewMail};

#[derive(Error, Debug)]
#[error("failed to render {template}: {message}")]
pub struct RenderError {
    pub template: String,
    pub message: String,
}

impl RenderError {
    pub fn new(template: &str, message: impl Into<String>) -> Self {
        Self {
            template: template.to_owned(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error(transparent)]
    RenderError(#[from] RenderError),
    #[error("failed to store mail: {0}")]
    DatabaseError(#[from] DatabaseError),
}

/// Renders mail bodies from templates.
pub trait BodyRenderer: Send + Sync {
    /// Render `template_name` with `data`, translated for the first supported entry of `languages`.
    fn render(
        &self,
        template_name: &str,
        languages: &[String],
        data: &Value,
    ) -> Result<String, RenderError>;
}

/// Everything needed to schedule one mail. Built with `MailRequest::new` and the chained setters.
#[derive(Debug, Clone)]
pub struct MailRequest {
    source: MailSource,
    from_user_id: Option<i64>,
    recipient: Recipient,
    subject: String,
    template_name: String,
    template_data: Value,
    thread_ref: Option<String>,
    priority: i16,
}

impl MailRequest {
    pub fn new(source: MailSource, recipient: Recipient, subject: &str, template_name: &str) -> Self {
        Self {
            source,
            from_user_id: None,
            recipient,
            subject: subject.to_owned(),
            template_name: template_name.to_owned(),
            template_data: Value::Null,
            thread_ref: None,
            priority: 0,
        }
    }

    /// The user that triggered this mail. Leave unset for system mails.
    pub fn from_user(mut self, user_id: i64) -> Self {
        self.from_user_id = Some(user_id);
        self
    }

    pub fn data(mut self, template_data: Value) -> Self {
        self.template_data = template_data;
        self
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

pub struct MailScheduler<R> {
    renderer: R,
}

impl<R: BodyRenderer> MailScheduler<R> {
    pub fn new(renderer: R) -> Self {
        Self { renderer }
    }

    /// Render and enqueue a mail on `conn`, returning its id.
    ///
    /// Rendering happens first: a template error never reaches the database and is returned as is,
    /// which should make the caller abort its transaction.
    pub async fn schedule(
        &self,
        conn: &mut PgConnection,
        request: MailRequest,
    ) -> Result<Uuid, ScheduleError> {
        let body = self.renderer.render(
            &request.template_name,
            &request.recipient.languages,
            &request.template_data,
        )?;

        let mut new_mail = NewMail::new(
            request.from_user_id,
            request.source,
            request.recipient.user_id,
            &request.subject,
            body,
        )
        .priority(request.priority);
        if let Some(thread_ref) = &request.thread_ref {
            new_mail = new_mail.thread_ref(thread_ref);
        }

        let id = pgqueue::enqueue(conn, new_mail).await?;

        debug!(
            "scheduled mail {} to user {} with subject {:?}",
            id, request.recipient.user_id, request.subject
        );

        Ok(id)
    }
}
