use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::pgqueue::ParseError;

/// What produced a mail. Anything but `System` was triggered by another user,
/// and will be sent with a reply address that routes back to them.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "mail_source", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MailSource {
    System,
    Message,
    DiaryComment,
    NoteComment,
}

impl MailSource {
    pub fn is_system(&self) -> bool {
        matches!(self, MailSource::System)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MailSource::System => "system",
            MailSource::Message => "message",
            MailSource::DiaryComment => "diary_comment",
            MailSource::NoteComment => "note_comment",
        }
    }
}

/// Allow casting `MailSource` from strings.
impl FromStr for MailSource {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(MailSource::System),
            "message" => Ok(MailSource::Message),
            "diary_comment" => Ok(MailSource::DiaryComment),
            "note_comment" => Ok(MailSource::NoteComment),
            invalid => Err(ParseError::ParseMailSourceError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for MailSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The user a mail is addressed to, as known by the caller scheduling it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub user_id: i64,
    /// Preferred locales, most preferred first. Used to render the body.
    pub languages: Vec<String>,
}

impl Recipient {
    pub fn new(user_id: i64, languages: Vec<String>) -> Self {
        Self { user_id, languages }
    }
}

/// Build the Message-ID style reference used to thread related mails together.
///
/// All mails sharing a `thread_ref` point at the same fictional parent message,
/// which makes clients group them.
pub fn full_thread_ref(prefix: &str, thread_ref: &str, host: &str) -> String {
    format!("<{prefix}-{thread_ref}@{host}>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mail_source_from_str() {
        assert_eq!(
            MailSource::from_str("diary_comment").unwrap(),
            MailSource::DiaryComment
        );
        assert_eq!(MailSource::from_str("system").unwrap(), MailSource::System);
        assert!(MailSource::from_str("System").is_err());
        assert!(MailSource::from_str("carrier-pigeon").is_err());
    }

    #[test]
    fn test_mail_source_display_matches_from_str() {
        for source in [
            MailSource::System,
            MailSource::Message,
            MailSource::DiaryComment,
            MailSource::NoteComment,
        ] {
            assert_eq!(MailSource::from_str(&source.to_string()).unwrap(), source);
        }
    }

    #[test]
    fn test_only_system_is_system() {
        assert!(MailSource::System.is_system());
        assert!(!MailSource::Message.is_system());
        assert!(!MailSource::NoteComment.is_system());
    }

    #[test]
    fn test_full_thread_ref() {
        assert_eq!(
            full_thread_ref("mail", "diary-42", "example.org"),
            "<mail-diary-42@example.org>"
        );
    }
}
