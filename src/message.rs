//! Canonical message and envelope types
//!
//! `Message` is the engine-internal representation of a fetched IMAP
//! message, decoupled from `async_imap`'s wire types so the rest of the
//! crate (state store, backup sink, filter pipeline) never has to import
//! `async_imap`. Conversion from `async_imap::types::Fetch` lives in
//! `connection.rs`, the only module allowed to see wire types.

use chrono::{DateTime, Utc};

/// A header-derived mail address (`personal name` + `user@host`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Address {
    pub name: Option<String>,
    pub email: String,
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) if !name.is_empty() => write!(f, "{name} <{}>", self.email),
            _ => write!(f, "{}", self.email),
        }
    }
}

/// The header-derived fields IMAP `FETCH ENVELOPE` returns.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub subject: Option<String>,
    pub message_id: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub from: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub sender: Vec<Address>,
}

/// A fetched message: UID, optional envelope, and the raw `BODY[]` bytes.
///
/// The envelope is optional because a server may return `ENVELOPE NIL`
/// for a corrupt or expunged message; the backup sink and filter pipeline
/// both degrade gracefully in that case.
#[derive(Debug, Clone)]
pub struct Message {
    pub uid: u32,
    pub envelope: Option<Envelope>,
    pub body: Vec<u8>,
}

impl Message {
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.envelope.as_ref()?.subject.as_deref()
    }

    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        self.envelope.as_ref()?.message_id.as_deref()
    }
}
