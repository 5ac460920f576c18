//! Turning a queued `Mail` into an `OutboundMail`.
use std::sync::Arc;

use lettre::message::Mailbox;
use mail_common::mail::full_thread_ref;
use mail_common::pgqueue::Mail;
use tracing::{debug, info};

use crate::directory::Directory;
use crate::error::DeliveryError;
use crate::reply::ReplyAddresses;
use crate::transport::{MailAddress, OutboundMail};

/// Addresses that don't depend on the mail being sent.
#[derive(Debug, Clone)]
pub struct SenderSettings {
    pub noreply_from: String,
    pub thread_ref_prefix: String,
    /// Host part of thread message ids.
    pub thread_ref_host: String,
}

impl SenderSettings {
    /// Thread message ids are scoped to the domain of `noreply_from`.
    /// Config validation rejects an unparseable address when delivery is enabled, so the
    /// `localhost` fallback only applies while mails are being dropped.
    pub fn new(noreply_from: &str, thread_ref_prefix: &str) -> Self {
        let thread_ref_host = noreply_from
            .parse::<Mailbox>()
            .map(|mailbox| mailbox.email.domain().to_owned())
            .unwrap_or_else(|_| "localhost".to_owned());

        Self {
            noreply_from: noreply_from.to_owned(),
            thread_ref_prefix: thread_ref_prefix.to_owned(),
            thread_ref_host,
        }
    }
}

pub struct MailComposer {
    directory: Arc<dyn Directory>,
    reply_addresses: Arc<dyn ReplyAddresses>,
    settings: SenderSettings,
}

impl MailComposer {
    pub fn new(
        directory: Arc<dyn Directory>,
        reply_addresses: Arc<dyn ReplyAddresses>,
        settings: SenderSettings,
    ) -> Self {
        Self {
            directory,
            reply_addresses,
            settings,
        }
    }

    /// Compose the message for `mail`, or return `None` if its recipient is gone.
    ///
    /// System mails, and mails whose sender was deleted, come from the no-reply address.
    /// Anything else carries the sender's name and an address the recipient can reply to.
    pub async fn compose(&self, mail: &Mail) -> Result<Option<OutboundMail>, DeliveryError> {
        let Some(recipient) = self.directory.contact(mail.to_user_id).await? else {
            info!(
                "discarding mail {}: recipient {} no longer exists",
                mail.id, mail.to_user_id
            );
            return Ok(None);
        };

        let from = match mail.from_user_id {
            Some(from_user_id) if !mail.source.is_system() => {
                match self.directory.contact(from_user_id).await? {
                    Some(sender) => {
                        let reply_to = self
                            .reply_addresses
                            .create_address(mail.to_user_id, mail.source)
                            .await?;
                        MailAddress::new(Some(&sender.display_name), &reply_to)
                    }
                    None => {
                        debug!(
                            "sender {} of mail {} no longer exists, sending as no-reply",
                            from_user_id, mail.id
                        );
                        self.noreply()
                    }
                }
            }
            _ => self.noreply(),
        };

        let thread_ref = mail.thread_ref.as_deref().map(|thread_ref| {
            full_thread_ref(
                &self.settings.thread_ref_prefix,
                thread_ref,
                &self.settings.thread_ref_host,
            )
        });

        Ok(Some(OutboundMail {
            id: mail.id,
            from,
            to: MailAddress::new(Some(&recipient.display_name), &recipient.email),
            subject: mail.subject.clone(),
            body: mail.body.clone(),
            thread_ref,
        }))
    }

    fn noreply(&self) -> MailAddress {
        MailAddress::bare(&self.settings.noreply_from)
    }
}
