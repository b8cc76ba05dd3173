//! The canonical `Mail` value handed to filters
//!
//! Stripped of wire-protocol types so filter implementations are decoupled
//! from the IMAP library.

use crate::message::{Address, Message};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Default)]
pub struct Mail {
    pub from: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub sender: Vec<Address>,
    pub subject: String,
    pub date: Option<DateTime<Utc>>,
    pub message_id: String,
}

impl Mail {
    /// Project a fetched `Message` into the filter-facing `Mail` value.
    /// Addresses are carried over as-is; the date is already normalized to
    /// UTC by the envelope parser (`connection.rs`).
    #[must_use]
    pub fn from_message(message: &Message) -> Self {
        match &message.envelope {
            Some(env) => Self {
                from: env.from.clone(),
                to: env.to.clone(),
                cc: env.cc.clone(),
                bcc: env.bcc.clone(),
                sender: env.sender.clone(),
                subject: env.subject.clone().unwrap_or_default(),
                date: env.date,
                message_id: env.message_id.clone().unwrap_or_default(),
            },
            None => Self::default(),
        }
    }
}
