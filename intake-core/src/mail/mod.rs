//! Mail ingestion: MIME parsing, raw-mail persistence, and the
//! checkpointed IMAP source.

mod html;
mod imap;
mod message;
mod persistence;

pub use html::html_to_text;
pub use imap::{
    FetchedMail, ImapFetcher, ImapMailFetch, MailFetch, PollOutcome,
};
pub use message::{MailPart, ParsedMail};
pub use persistence::MailPersistor;
