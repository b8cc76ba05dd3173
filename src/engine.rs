//! Sync engine -- the heart of the agent
//!
//! Drives the discover/decide/fetch/idle loop: for every folder, decide
//! between a full resync and an incremental fetch based on whether
//! `UIDVALIDITY` has changed, fetch in batches, dispatch each message to
//! the plugin set, then idle-wait for the next trigger.

use crate::connection::ImapApi;
use crate::message::Message;
use crate::object_store::ObjectStore;
use crate::plugin::Plugin;
use crate::state::{FolderState, StateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// Batch size for full-resync `FETCH`.
const FETCH_BATCH_SIZE: u32 = 100;
/// Pause between full-resync batches.
const FETCH_BATCH_WAIT: Duration = Duration::from_millis(500);
/// Back-off applied after an `IDLE` failure.
const IDLE_BACKOFF: Duration = Duration::from_secs(3600);
/// How long a single `IDLE` wait blocks before the engine re-checks the
/// stop signal and loops back into a sweep.
const IDLE_WAIT: Duration = Duration::from_secs(29 * 60);

/// What a folder's `UIDVALIDITY` comparison says to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    FullResync,
    Incremental { begin: u32 },
}

/// Pure decision step: unknown folders and epoch changes both force a
/// full resync; otherwise incremental fetch resumes from the stored
/// high-water mark (widened by `offset`).
#[must_use]
pub fn decide(known: bool, stored: FolderState, server_uid_validity: u32, offset: u32) -> Decision {
    if !known || server_uid_validity != stored.uid_validity {
        return Decision::FullResync;
    }
    Decision::Incremental {
        begin: begin_uid(stored.last_uid, offset),
    }
}

/// `begin <- max(0, lastUid - (offset - 1))`.
/// `offset = 0` means "no replay": begin exactly at the stored UID so the
/// boundary message can be recognized and skipped by [`should_dispatch`].
#[must_use]
pub fn begin_uid(last_uid: u32, offset: u32) -> u32 {
    if offset == 0 {
        last_uid
    } else {
        last_uid.saturating_sub(offset - 1)
    }
}

/// Whether a message returned by an incremental fetch should be dispatched:
/// with `offset = 0` the server inclusively re-returns the boundary UID,
/// which must be skipped; with
/// `offset > 0` every returned message in the replay window is dispatched
/// (duplicates inside the window are an accepted re-processing cost).
#[must_use]
pub fn should_dispatch(uid: u32, last_uid: u32, offset: u32) -> bool {
    offset != 0 || uid != last_uid
}

/// Batches of sequence numbers `1..=exists` in chunks of [`FETCH_BATCH_SIZE`].
fn fetch_batches(exists: u32) -> Vec<(u32, u32)> {
    let mut batches = Vec::new();
    let mut begin = 1;
    while begin <= exists {
        let end = (begin + FETCH_BATCH_SIZE).min(exists);
        batches.push((begin, end));
        begin += FETCH_BATCH_SIZE;
    }
    batches
}

/// Owns the connections, state, and plugin set for one run, and drives
/// the sweep/idle loop.
pub struct SyncEngine {
    active: Arc<dyn ImapApi>,
    idle: Arc<dyn ImapApi>,
    store: Arc<dyn ObjectStore>,
    plugins: Vec<Arc<dyn Plugin>>,
    state_dir: String,
    state_file: String,
    last_message_offset: u32,
    stop: Arc<Notify>,
}

impl SyncEngine {
    #[must_use]
    pub fn new(
        active: Arc<dyn ImapApi>,
        idle: Arc<dyn ImapApi>,
        store: Arc<dyn ObjectStore>,
        plugins: Vec<Arc<dyn Plugin>>,
        state_dir: String,
        state_file: String,
        last_message_offset: u32,
    ) -> Self {
        Self {
            active,
            idle,
            store,
            plugins,
            state_dir,
            state_file,
            last_message_offset,
            stop: Arc::new(Notify::new()),
        }
    }

    /// A handle that, when notified, asks the running loop to stop after
    /// its current sweep or IDLE wait returns.
    #[must_use]
    pub fn stop_handle(&self) -> Arc<Notify> {
        self.stop.clone()
    }

    /// Runs `init` on every plugin, dropping the ones that fail.
    pub async fn init_plugins(&mut self) {
        let mut kept = Vec::with_capacity(self.plugins.len());
        for plugin in std::mem::take(&mut self.plugins) {
            match plugin.init(&self.active).await {
                Ok(()) => kept.push(plugin),
                Err(e) => {
                    let e = crate::error::Error::PluginInit(plugin.name().to_string(), e.to_string());
                    error!(error = %e, "removing plugin from active set");
                }
            }
        }
        self.plugins = kept;
    }

    /// Runs sweeps until the stop signal fires. If `run_period` is `None`,
    /// performs exactly one sweep then returns; otherwise every following
    /// sweep is spaced at least `run_period` apart, the remainder of the
    /// wait spent in `IDLE`.
    pub async fn run(&self, run_period: Option<Duration>) {
        loop {
            let started = tokio::time::Instant::now();
            self.sweep_once().await;

            let Some(period) = run_period else { break };

            tokio::select! {
                () = self.stop.notified() => break,
                () = self.wait_for_next_sweep(started, period) => {}
            }
        }
        self.close_plugins().await;
    }

    async fn wait_for_next_sweep(&self, started: tokio::time::Instant, period: Duration) {
        let elapsed = started.elapsed();
        if elapsed < period {
            tokio::time::sleep(period - elapsed).await;
        }
        self.idle_wait().await;
    }

    /// One full pass: discover folders, load state, process each folder,
    /// then idle-wait for the next trigger.
    async fn sweep_once(&self) {
        let folders = match self.discover_folders().await {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, "LIST failed, aborting this sweep");
                return;
            }
        };

        let mut state = match StateStore::load(self.store.as_ref(), &self.state_dir, &self.state_file).await {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "state load failed, aborting this sweep");
                return;
            }
        };

        for folder in folders {
            if let Err(e) = self.process_folder(&folder, &mut state).await {
                error!(folder = %folder, error = %e, "folder sync failed, continuing with next folder");
            }
        }
    }

    /// Union of every plugin's `select_mailboxes`, sorted and deduplicated,
    /// falling back to a full `LIST "" "*"` when no plugin has an opinion.
    async fn discover_folders(&self) -> crate::error::Result<Vec<String>> {
        let mut names: Vec<String> = self.plugins.iter().flat_map(|p| p.select_mailboxes()).collect();
        if names.is_empty() {
            names = self.active.list_folders().await?;
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn process_folder(&self, folder: &str, state: &mut StateStore) -> crate::error::Result<()> {
        info!(%folder, "processing mailbox");
        let known = state.has_folder(folder);
        let stored = state.folder(folder);

        if !known {
            return self.full_resync(folder, state).await;
        }

        let status = self.active.status(folder).await?;
        match decide(known, stored, status.uid_validity, self.last_message_offset) {
            Decision::FullResync => self.full_resync(folder, state).await,
            Decision::Incremental { begin } => self.incremental(folder, state, begin).await,
        }
    }

    async fn full_resync(&self, folder: &str, state: &mut StateStore) -> crate::error::Result<()> {
        let status = self.active.status(folder).await?;
        let mut folder_state = FolderState {
            last_uid: 0,
            uid_validity: status.uid_validity,
        };
        state.set_folder(folder, folder_state);

        for (begin, end) in fetch_batches(status.exists) {
            let seq = format!("{begin}:{end}");
            match self.active.fetch(folder, &seq).await {
                Ok((fetch_status, messages)) => {
                    folder_state.uid_validity = fetch_status.uid_validity;
                    for message in &messages {
                        folder_state.last_uid = folder_state.last_uid.max(message.uid);
                        self.dispatch(folder, message, state, folder_state).await;
                    }
                }
                Err(e) => {
                    error!(%folder, %seq, error = %e, "batch fetch failed, continuing with next batch");
                }
            }
            tokio::time::sleep(FETCH_BATCH_WAIT).await;
        }
        Ok(())
    }

    async fn incremental(&self, folder: &str, state: &mut StateStore, begin: u32) -> crate::error::Result<()> {
        let mut folder_state = state.folder(folder);

        let uid_set = format!("{begin}:*");
        let (status, messages) = self.active.uid_fetch(folder, &uid_set).await?;
        folder_state.uid_validity = status.uid_validity;
        state.set_folder(folder, folder_state);

        for message in &messages {
            if !should_dispatch(message.uid, folder_state.last_uid, self.last_message_offset) {
                continue;
            }
            folder_state.last_uid = folder_state.last_uid.max(message.uid);
            self.dispatch(folder, message, state, folder_state).await;
        }
        Ok(())
    }

    /// Invokes every plugin's `handle_message`, then updates and persists
    /// state. A plugin failure or a persistence failure is logged and does
    /// not stop dispatch of the next message.
    async fn dispatch(&self, folder: &str, message: &Message, state: &mut StateStore, folder_state: FolderState) {
        for plugin in &self.plugins {
            if let Err(e) = plugin.handle_message(folder, message).await {
                warn!(plugin = plugin.name(), %folder, uid = message.uid, error = %e, "plugin failed to handle message");
            }
        }

        state.set_folder(folder, folder_state);
        if let Err(e) = state.save(self.store.as_ref(), &self.state_dir, &self.state_file).await {
            error!(%folder, error = %e, "failed to persist state after dispatch");
        }
    }

    /// Selects INBOX on the idle connection and waits for new data or the
    /// stop signal; on error, backs off an hour before the next sweep.
    async fn idle_wait(&self) -> bool {
        tokio::select! {
            () = self.stop.notified() => false,
            result = self.idle.idle("INBOX", IDLE_WAIT) => {
                match result {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(error = %e, "IDLE failed, backing off for an hour");
                        tokio::select! {
                            () = self.stop.notified() => false,
                            () = tokio::time::sleep(IDLE_BACKOFF) => true,
                        }
                    }
                }
            }
        }
    }

    async fn close_plugins(&self) {
        for plugin in &self.plugins {
            if let Err(e) = plugin.close().await {
                warn!(plugin = plugin.name(), error = %e, "plugin close failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(last_uid: u32, uid_validity: u32) -> FolderState {
        FolderState { last_uid, uid_validity }
    }

    #[test]
    fn unknown_folder_forces_full_resync() {
        assert_eq!(decide(false, state(0, 0), 7, 0), Decision::FullResync);
    }

    #[test]
    fn changed_uid_validity_forces_full_resync() {
        assert_eq!(decide(true, state(10, 7), 8, 0), Decision::FullResync);
    }

    #[test]
    fn stable_uid_validity_is_incremental() {
        assert_eq!(decide(true, state(10, 7), 7, 0), Decision::Incremental { begin: 10 });
    }

    #[test]
    fn zero_offset_begins_exactly_at_last_uid() {
        assert_eq!(begin_uid(10, 0), 10);
    }

    #[test]
    fn positive_offset_widens_the_replay_window() {
        assert_eq!(begin_uid(10, 3), 8);
    }

    #[test]
    fn offset_never_underflows_past_zero() {
        assert_eq!(begin_uid(2, 10), 0);
    }

    #[test]
    fn boundary_uid_is_skipped_with_zero_offset() {
        assert!(!should_dispatch(10, 10, 0));
        assert!(should_dispatch(11, 10, 0));
    }

    #[test]
    fn boundary_uid_is_redispatched_with_positive_offset() {
        assert!(should_dispatch(10, 10, 3));
    }

    #[test]
    fn fetch_batches_cover_the_full_range_in_chunks_of_100() {
        let batches = fetch_batches(250);
        assert_eq!(batches, vec![(1, 101), (101, 201), (201, 250)]);
    }

    #[test]
    fn fetch_batches_empty_mailbox_is_empty() {
        assert!(fetch_batches(0).is_empty());
    }
}
