//! Plugin contract
//!
//! Plugins opt into a subset of four capabilities rather than inheriting
//! from a base class: `init`, `handle_message`, `select_mailboxes`,
//! `close`. Each has a no-op default so a plugin only overrides what it
//! needs -- the backup sink (`backup::BackupSink`) only overrides
//! `handle_message`; the filter pipeline (`filter::FilterPipeline`)
//! overrides `handle_message` and `close` (to drain its apply queue).
//!
//! The engine holds plugins as a trait object list and iterates them in
//! registration order.

use crate::connection::ImapApi;
use crate::error::Result;
use crate::message::Message;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Plugin: Send + Sync {
    /// A short name used in logs and in `PluginInit` error messages.
    fn name(&self) -> &str;

    /// One-time setup given the shared connection. Failure removes the
    /// plugin from the active set for the rest of the run.
    async fn init(&self, _connection: &Arc<dyn ImapApi>) -> Result<()> {
        Ok(())
    }

    /// Narrow the folder set for the sweep. An empty return means "no
    /// opinion"; the engine unions every plugin's non-empty answer.
    fn select_mailboxes(&self) -> Vec<String> {
        Vec::new()
    }

    /// Invoked for every dispatched message. Implementations must not
    /// retain `message` beyond this call.
    async fn handle_message(&self, _folder: &str, _message: &Message) -> Result<()> {
        Ok(())
    }

    /// Invoked once at engine shutdown, after the main sweep loop exits.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
