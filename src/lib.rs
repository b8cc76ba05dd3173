#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! IMAP mirror & curation agent
//!
//! A long-running agent that mirrors and curates a remote IMAP mailbox:
//! it walks every folder of an account, saves each message durably as an
//! `.eml` file on an object store, and applies user-supplied rules that
//! may move or delete messages. A persistent state file records, per
//! folder, the highest processed UID and the UID-validity value so runs
//! resume incrementally and detect remote invalidation.
//!
//! Module map (see `DESIGN.md` for the full grounding ledger):
//!
//! - [`object_store`] -- narrow file-system capability.
//! - [`connection`] -- single authenticated IMAP session.
//! - [`state`] -- crash-safe per-folder UID/UID-validity store.
//! - [`engine`] -- the sweep/idle loop.
//! - [`filter`] -- verdict pipeline and apply worker.
//! - [`backup`] -- `.eml` writer plugin.
//! - [`plugin`], [`message`], [`mail`], [`verdict`] -- shared contract and types.

pub mod backup;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod filter;
pub mod mail;
pub mod message;
pub mod object_store;
pub mod plugin;
pub mod state;
pub mod verdict;

pub use backup::BackupSink;
pub use config::Settings;
pub use connection::{ImapApi, ImapConnection};
pub use engine::SyncEngine;
pub use error::{Error, Result};
pub use filter::{Filter, FilterPipeline};
pub use mail::Mail;
pub use message::{Address, Envelope, Message};
pub use object_store::{LocalObjectStore, ObjectStore};
pub use plugin::Plugin;
pub use state::{FolderState, StateStore};
pub use verdict::Verdict;
