use async_trait::async_trait;
use mail_common::mail::MailSource;

use crate::error::ReplyAddressError;

/// Hands out the address a recipient's reply should be routed to.
#[async_trait]
pub trait ReplyAddresses: Send + Sync {
    async fn create_address(
        &self,
        replying_user_id: i64,
        source: MailSource,
    ) -> Result<String, ReplyAddressError>;
}

/// Routes every reply through one shared mailbox.
/// The address is only checked when a message is built, so an empty one is fine while delivery is disabled.
pub struct SharedReplyAddress {
    address: String,
}

impl SharedReplyAddress {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_owned(),
        }
    }
}

#[async_trait]
impl ReplyAddresses for SharedReplyAddress {
    async fn create_address(
        &self,
        _replying_user_id: i64,
        _source: MailSource,
    ) -> Result<String, ReplyAddressError> {
        Ok(self.address.clone())
    }
}
