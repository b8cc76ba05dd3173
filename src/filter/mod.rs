//! Filter pipeline
//!
//! A list of rule filters consulted in order, a bounded backlog of
//! pending moves, and a worker that applies them on its own schedule so
//! the engine's read-only sweep never has to issue a `SELECT READWRITE`
//! itself.
//!
//! The rule-execution engine itself is the [`Filter`] trait:
//! `evaluate(folder, mail) -> Verdict`. This module ships one reference
//! implementation, [`matcher::MatchFilter`], loading declarative rule
//! files from a directory.

pub mod matcher;

use crate::connection::ImapApi;
use crate::error::Result;
use crate::mail::Mail;
use crate::message::Message;
use crate::plugin::Plugin;
use crate::verdict::Verdict;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Folder whose verdicts are always suppressed, to avoid looping with
/// user-side empty-trash behavior.
const TRASH_FOLDER: &str = "Trash";

/// Capacity of the apply worker's backlog.
const QUEUE_CAPACITY: usize = 1024;

/// The rule-execution engine, modeled as a pure function from
/// `(folder, mail)` to a [`Verdict`]. Implementations must not observe
/// IMAP wire types.
pub trait Filter: Send + Sync {
    /// A short name used in logs.
    fn name(&self) -> &str;

    /// Narrows the folder set the engine sweeps. An empty return means
    /// "no opinion".
    fn select_mailboxes(&self) -> Vec<String> {
        Vec::new()
    }

    fn evaluate(&self, folder: &str, mail: &Mail) -> Verdict;
}

/// One task posted to the apply worker: move `uid` in `src_folder` to
/// `dest_folder`.
#[derive(Debug, Clone)]
struct MoveTask {
    src_folder: String,
    uid: u32,
    dest_folder: String,
}

struct Worker {
    tx: mpsc::Sender<MoveTask>,
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// The [`Plugin`] that wires an ordered list of [`Filter`]s into the
/// engine's dispatch path. On `HandleMessage` it projects the fetched
/// message into a [`Mail`], consults filters in order (first non-`Accept`
/// wins), and posts a move task to a single apply worker rather than
/// mutating the mailbox inline.
pub struct FilterPipeline {
    filters: Vec<Box<dyn Filter>>,
    quarantine_folder: String,
    worker: Mutex<Option<Worker>>,
}

impl FilterPipeline {
    #[must_use]
    pub fn new(filters: Vec<Box<dyn Filter>>, quarantine_folder: String) -> Self {
        Self {
            filters,
            quarantine_folder,
            worker: Mutex::new(None),
        }
    }

    fn first_verdict(&self, folder: &str, mail: &Mail) -> Verdict {
        for filter in &self.filters {
            match filter.evaluate(folder, mail) {
                Verdict::Accept => {}
                other => return other,
            }
        }
        Verdict::Accept
    }
}

#[async_trait]
impl Plugin for FilterPipeline {
    fn name(&self) -> &str {
        "filter"
    }

    async fn init(&self, connection: &Arc<dyn ImapApi>) -> Result<()> {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let stop = Arc::new(Notify::new());
        let handle = tokio::spawn(apply_loop(rx, stop.clone(), connection.clone()));
        *self.worker.lock().await = Some(Worker { tx, stop, handle });
        Ok(())
    }

    fn select_mailboxes(&self) -> Vec<String> {
        self.filters.iter().flat_map(|f| f.select_mailboxes()).collect()
    }

    async fn handle_message(&self, folder: &str, message: &Message) -> Result<()> {
        if folder == TRASH_FOLDER {
            return Ok(());
        }

        let mail = Mail::from_message(message);
        let verdict = self.first_verdict(folder, &mail);
        let Some(dest) = verdict.destination(&self.quarantine_folder) else {
            return Ok(());
        };

        info!(%folder, uid = message.uid, dest, "filter rejected message, queuing move");

        let task = MoveTask {
            src_folder: folder.to_string(),
            uid: message.uid,
            dest_folder: dest.to_string(),
        };

        let guard = self.worker.lock().await;
        if let Some(worker) = guard.as_ref() {
            if worker.tx.send(task).await.is_err() {
                warn!(%folder, uid = message.uid, "apply worker is gone, dropping move task");
            }
        }
        Ok(())
    }

    /// Stops accepting new work and waits for the worker to drain to
    /// idle. Tasks already queued (but not yet picked up) are discarded;
    /// a task already in flight finishes.
    async fn close(&self) -> Result<()> {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            worker.stop.notify_one();
            drop(worker.tx);
            let _ = worker.handle.await;
        }
        Ok(())
    }
}

async fn apply_loop(mut rx: mpsc::Receiver<MoveTask>, stop: Arc<Notify>, connection: Arc<dyn ImapApi>) {
    loop {
        tokio::select! {
            biased;
            () = stop.notified() => break,
            task = rx.recv() => {
                let Some(task) = task else { break };
                if let Err(e) = connection.uid_move(&task.src_folder, task.uid, &task.dest_folder).await {
                    error!(
                        folder = %task.src_folder,
                        uid = task.uid,
                        dest = %task.dest_folder,
                        error = %e,
                        "apply worker failed to move message, dropping task"
                    );
                }
            }
        }
    }
}
