//! Backup sink
//!
//! A `Plugin` that writes every dispatched message's body to
//! `<backupDir>/<folder>/<safeName>.eml` and sets the file's mtime from the
//! envelope date. The filename is `{subject cropped to 200 runes}_{message-id}`
//! (or the bare UID when the envelope is missing), with whitespace and `/`
//! folded to `_` and every remaining non-`[A-Za-z0-9_-]` byte replaced by
//! `_`.

use crate::connection::ImapApi;
use crate::error::Result;
use crate::message::Message;
use crate::object_store::ObjectStore;
use crate::plugin::Plugin;
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use tracing::error;

fn disallowed_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-zA-Z\d_\-]").expect("static regex is valid"))
}

/// Build the `<folder>/<safeName>.eml` path for a fetched message.
#[must_use]
pub fn path_of_message(folder: &str, message: &Message) -> String {
    let raw = match &message.envelope {
        Some(env) => {
            let subject = crop_chars(env.subject.as_deref().unwrap_or(""), 200);
            let message_id = env.message_id.as_deref().unwrap_or("");
            format!("{subject}_{message_id}")
        }
        None => message.uid.to_string(),
    };

    let whitespace_folded: String = raw
        .chars()
        .map(|c| if c.is_whitespace() || c == '/' { '_' } else { c })
        .collect();
    let safe = disallowed_chars().replace_all(&whitespace_folded, "_");

    format!("{folder}/{safe}.eml")
}

fn crop_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

pub struct BackupSink {
    store: Arc<dyn ObjectStore>,
    backup_dir: String,
}

impl BackupSink {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, backup_dir: String) -> Self {
        Self { store, backup_dir }
    }

    async fn save(&self, folder: &str, message: &Message) -> Result<()> {
        let rel_path = path_of_message(folder, message);
        let full_path = format!("{}/{rel_path}", self.backup_dir);
        let dir = full_path.rsplit_once('/').map_or("", |(d, _)| d);

        self.store.mkdir_all(dir).await?;
        self.store.write_file(&full_path, &message.body).await?;

        let mtime = message.envelope.as_ref().and_then(|e| e.date).unwrap_or_else(Utc::now);
        self.store.set_mtime(&full_path, mtime).await?;
        Ok(())
    }
}

#[async_trait]
impl Plugin for BackupSink {
    fn name(&self) -> &str {
        "backup"
    }

    async fn init(&self, _connection: &Arc<dyn ImapApi>) -> Result<()> {
        self.store.mkdir_all(&self.backup_dir).await
    }

    async fn handle_message(&self, folder: &str, message: &Message) -> Result<()> {
        if let Err(e) = self.save(folder, message).await {
            error!(%folder, uid = message.uid, error = %e, "failed to back up message");
            return Err(e);
        }
        Ok(())
    }
}
