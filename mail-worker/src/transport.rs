//! Outbound mail transports.
//!
//! `SmtpTransport` talks to the configured relay through lettre. When no from addresses are
//! configured the worker runs with a `DisabledTransport` instead, which drops every mail.
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use lettre::message::header::{ContentType, Header, HeaderName, HeaderValue};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SmtpConfig;
use crate::error::TransportError;

/// A display name and address pair used for the From and To headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailAddress {
    pub name: Option<String>,
    pub email: String,
}

impl MailAddress {
    pub fn new(name: Option<&str>, email: &str) -> Self {
        Self {
            name: name.map(str::to_owned),
            email: email.to_owned(),
        }
    }

    /// A bare address with no display name. Also accepts `Name <address>` as the env vars do.
    pub fn bare(email: &str) -> Self {
        Self::new(None, email)
    }

    fn to_mailbox(&self) -> Result<Mailbox, TransportError> {
        let invalid = |error| TransportError::AddressError {
            address: self.email.clone(),
            error,
        };

        match &self.name {
            Some(name) => {
                let address: Address = self.email.parse().map_err(invalid)?;
                Ok(Mailbox::new(Some(name.clone()), address))
            }
            None => self.email.parse().map_err(invalid),
        }
    }
}

/// A fully composed mail ready to be handed over to a `Transport`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMail {
    pub id: Uuid,
    pub from: MailAddress,
    pub to: MailAddress,
    pub subject: String,
    pub body: String,
    /// Already in its `<prefix-ref@host>` message id form.
    pub thread_ref: Option<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, mail: &OutboundMail) -> Result<(), TransportError>;
}

/// The `X-Entity-Ref-ID` header, which stops some clients from collapsing unrelated threads.
#[derive(Debug, Clone, PartialEq, Eq)]
struct XEntityRefId(String);

impl Header for XEntityRefId {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("X-Entity-Ref-ID")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.to_owned()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

/// Build the lettre `Message` for an `OutboundMail`. The body is always sent as HTML.
pub fn build_message(mail: &OutboundMail) -> Result<Message, TransportError> {
    let mut builder = Message::builder()
        .from(mail.from.to_mailbox()?)
        .to(mail.to.to_mailbox()?)
        .date_now()
        .subject(mail.subject.clone())
        .header(ContentType::TEXT_HTML);

    if let Some(thread_ref) = &mail.thread_ref {
        builder = builder
            .in_reply_to(thread_ref.clone())
            .references(thread_ref.clone())
            .header(XEntityRefId(thread_ref.clone()));
    }

    Ok(builder.body(mail.body.clone())?)
}

pub struct SmtpTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpTransport {
    /// Build a transport for the relay in `config`.
    ///
    /// A secure connection uses implicit TLS on port 465 and STARTTLS on port 587.
    /// Any other port is refused when `SMTP_SECURE` is on.
    pub fn new(config: &SmtpConfig, send_timeout: time::Duration) -> Result<Self, TransportError> {
        let builder = if config.is_secure() {
            match config.smtp_port {
                465 => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)?,
                587 => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)?,
                port => {
                    return Err(TransportError::ConfigError(format!(
                        "secure SMTP requires port 465 or 587, got {port}"
                    )))
                }
            }
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
        };

        let mut builder = builder
            .port(config.smtp_port)
            .timeout(Some(send_timeout));

        if let Some(user) = &config.smtp_user {
            let password = config.smtp_pass.clone().unwrap_or_default();
            builder = builder.credentials(Credentials::new(user.clone(), password));
        }

        Ok(Self {
            transport: builder.build(),
        })
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn send(&self, mail: &OutboundMail) -> Result<(), TransportError> {
        let message = build_message(mail)?;
        let response = self.transport.send(message).await?;

        if !response.is_positive() {
            return Err(TransportError::Rejected(response.code().to_string()));
        }

        Ok(())
    }
}

/// Accepts and drops every mail.
pub struct DisabledTransport;

#[async_trait]
impl Transport for DisabledTransport {
    async fn send(&self, mail: &OutboundMail) -> Result<(), TransportError> {
        info!(
            "dropping mail {} to {} with subject {:?}: delivery is disabled",
            mail.id, mail.to.email, mail.subject
        );
        Ok(())
    }
}

/// Build the transport the worker should use for this configuration.
pub fn build_transport(
    config: &SmtpConfig,
    send_timeout: time::Duration,
) -> Result<Arc<dyn Transport>, TransportError> {
    if !config.is_configured() {
        warn!("SMTP is not configured, mail delivery is disabled");
        return Ok(Arc::new(DisabledTransport));
    }

    Ok(Arc::new(SmtpTransport::new(config, send_timeout)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvBool, NonEmptyString};

    fn smtp_config(port: u16, secure: Option<bool>) -> SmtpConfig {
        SmtpConfig {
            smtp_host: "127.0.0.1".to_owned(),
            smtp_port: port,
            smtp_user: None,
            smtp_pass: None,
            smtp_secure: secure.map(EnvBool),
            smtp_noreply_from: "noreply@example.org".to_owned(),
            smtp_messages_from: "messages@example.org".to_owned(),
            thread_ref_prefix: NonEmptyString("mail".to_owned()),
        }
    }

    fn outbound(thread_ref: Option<&str>) -> OutboundMail {
        OutboundMail {
            id: Uuid::now_v7(),
            from: MailAddress::new(Some("Alice"), "reply@example.org"),
            to: MailAddress::new(Some("Bob"), "bob@example.com"),
            subject: "New comment".to_owned(),
            body: "<p>Hello</p>".to_owned(),
            thread_ref: thread_ref.map(str::to_owned),
        }
    }

    fn formatted(message: &Message) -> String {
        String::from_utf8(message.formatted()).expect("message is not utf-8")
    }

    #[test]
    fn test_build_message_headers() {
        let message = build_message(&outbound(None)).expect("failed to build message");
        let raw = formatted(&message);

        assert!(raw.contains("From: Alice <reply@example.org>"));
        assert!(raw.contains("To: Bob <bob@example.com>"));
        assert!(raw.contains("Subject: New comment"));
        assert!(raw.contains("Content-Type: text/html; charset=utf-8"));
        assert!(raw.contains("Date: "));
        assert!(!raw.contains("In-Reply-To"));
        assert!(!raw.contains("X-Entity-Ref-ID"));
    }

    #[test]
    fn test_build_message_threads() {
        let thread_ref = "<mail-diary-3@example.org>";
        let message = build_message(&outbound(Some(thread_ref))).expect("failed to build message");
        let raw = formatted(&message);

        assert!(raw.contains(&format!("In-Reply-To: {thread_ref}")));
        assert!(raw.contains(&format!("References: {thread_ref}")));
        assert!(raw.contains(&format!("X-Entity-Ref-ID: {thread_ref}")));
    }

    #[test]
    fn test_build_message_bare_address() {
        let mut mail = outbound(None);
        mail.from = MailAddress::bare("Example <noreply@example.org>");

        let message = build_message(&mail).expect("failed to build message");

        assert!(formatted(&message).contains("From: Example <noreply@example.org>"));
    }

    #[test]
    fn test_build_message_invalid_address() {
        let mut mail = outbound(None);
        mail.to = MailAddress::new(Some("Bob"), "not an address");

        let error = build_message(&mail).expect_err("address should be rejected");

        assert!(matches!(error, TransportError::AddressError { .. }));
    }

    #[tokio::test]
    async fn test_secure_transport_requires_known_port() {
        let timeout = time::Duration::from_secs(5);

        assert!(SmtpTransport::new(&smtp_config(465, Some(true)), timeout).is_ok());
        assert!(SmtpTransport::new(&smtp_config(587, None), timeout).is_ok());
        assert!(SmtpTransport::new(&smtp_config(2525, Some(false)), timeout).is_ok());
        assert!(matches!(
            SmtpTransport::new(&smtp_config(2525, None), timeout),
            Err(TransportError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_transport_accepts_everything() {
        let mut config = smtp_config(25, None);
        config.smtp_messages_from = String::new();

        let transport =
            build_transport(&config, time::Duration::from_secs(5)).expect("failed to build");

        assert!(transport.send(&outbound(None)).await.is_ok());
    }
}
