//! End-to-end tests for the sweep engine
//!
//! Exercised against in-process fakes -- an in-memory [`FakeImapApi`] and
//! [`LocalObjectStore`] backed by a temp directory -- rather than a real
//! IMAP server or SMB share, since both are narrow interfaces the core
//! merely consumes.

use async_trait::async_trait;
use mirror_agent::backup::BackupSink;
use mirror_agent::connection::{FolderStatus, ImapApi};
use mirror_agent::engine::SyncEngine;
use mirror_agent::filter::{Filter, FilterPipeline};
use mirror_agent::mail::Mail;
use mirror_agent::message::{Envelope, Message};
use mirror_agent::object_store::{LocalObjectStore, ObjectStore};
use mirror_agent::plugin::Plugin;
use mirror_agent::state::StateStore;
use mirror_agent::verdict::Verdict;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
struct FakeMailbox {
    uid_validity: u32,
    messages: Vec<Message>,
}

struct FakeImapApi {
    mailboxes: Mutex<HashMap<String, FakeMailbox>>,
    idle_once: Mutex<Option<bool>>,
}

impl FakeImapApi {
    fn new(mailboxes: HashMap<String, FakeMailbox>) -> Self {
        Self {
            mailboxes: Mutex::new(mailboxes),
            idle_once: Mutex::new(None),
        }
    }

    fn with_idle_wake(mailboxes: HashMap<String, FakeMailbox>) -> Self {
        Self {
            mailboxes: Mutex::new(mailboxes),
            idle_once: Mutex::new(Some(true)),
        }
    }

    fn snapshot(&self, folder: &str) -> FakeMailbox {
        self.mailboxes.lock().unwrap().get(folder).cloned().unwrap_or(FakeMailbox {
            uid_validity: 0,
            messages: vec![],
        })
    }
}

fn message(uid: u32, subject: &str) -> Message {
    Message {
        uid,
        envelope: Some(Envelope {
            subject: Some(subject.to_string()),
            message_id: Some(format!("<{uid}@test>")),
            date: None,
            from: vec![],
            to: vec![],
            cc: vec![],
            bcc: vec![],
            sender: vec![],
        }),
        body: format!("Subject: {subject}\r\n\r\nbody {uid}").into_bytes(),
    }
}

#[async_trait]
impl ImapApi for FakeImapApi {
    async fn status(&self, folder: &str) -> mirror_agent::error::Result<FolderStatus> {
        let mb = self.snapshot(folder);
        Ok(FolderStatus {
            uid_validity: mb.uid_validity,
            uid_next: mb.messages.last().map_or(1, |m| m.uid + 1),
            exists: u32::try_from(mb.messages.len()).unwrap(),
        })
    }

    async fn list_folders(&self) -> mirror_agent::error::Result<Vec<String>> {
        let mut names: Vec<String> = self.mailboxes.lock().unwrap().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn fetch(&self, folder: &str, seq_set: &str) -> mirror_agent::error::Result<(FolderStatus, Vec<Message>)> {
        let mb = self.snapshot(folder);
        let (begin, end) = seq_set.split_once(':').expect("seq_set is begin:end");
        let begin: usize = begin.parse().unwrap();
        let end: usize = end.parse().unwrap();
        let messages = mb
            .messages
            .iter()
            .enumerate()
            .filter(|(i, _)| *i + 1 >= begin && *i + 1 <= end)
            .map(|(_, m)| m.clone())
            .collect();
        Ok((
            FolderStatus {
                uid_validity: mb.uid_validity,
                uid_next: mb.messages.last().map_or(1, |m| m.uid + 1),
                exists: u32::try_from(mb.messages.len()).unwrap(),
            },
            messages,
        ))
    }

    async fn uid_fetch(&self, folder: &str, uid_set: &str) -> mirror_agent::error::Result<(FolderStatus, Vec<Message>)> {
        let mb = self.snapshot(folder);
        let begin: u32 = uid_set.trim_end_matches(":*").parse().unwrap();
        let messages = mb.messages.iter().filter(|m| m.uid >= begin).cloned().collect();
        Ok((
            FolderStatus {
                uid_validity: mb.uid_validity,
                uid_next: mb.messages.last().map_or(1, |m| m.uid + 1),
                exists: u32::try_from(mb.messages.len()).unwrap(),
            },
            messages,
        ))
    }

    async fn uid_move(&self, folder: &str, uid: u32, dest: &str) -> mirror_agent::error::Result<()> {
        let mut mailboxes = self.mailboxes.lock().unwrap();
        let moved = mailboxes.get_mut(folder).and_then(|mb| {
            let idx = mb.messages.iter().position(|m| m.uid == uid)?;
            Some(mb.messages.remove(idx))
        });
        if let Some(message) = moved {
            mailboxes.entry(dest.to_string()).or_insert_with(|| FakeMailbox {
                uid_validity: 1,
                messages: vec![],
            }).messages.push(message);
        }
        Ok(())
    }

    async fn idle(&self, _folder: &str, _timeout: Duration) -> mirror_agent::error::Result<bool> {
        let mut slot = self.idle_once.lock().unwrap();
        match slot.take() {
            Some(wake) => Ok(wake),
            None => Ok(false),
        }
    }
}

struct AlwaysReject {
    target: String,
}

impl Filter for AlwaysReject {
    fn name(&self) -> &str {
        "always-reject"
    }

    fn evaluate(&self, _folder: &str, _mail: &Mail) -> Verdict {
        Verdict::Move {
            target: self.target.clone(),
        }
    }
}

async fn list_backup_files(store: &LocalObjectStore, dir: &str) -> Vec<String> {
    let mut files = store.list_files(dir).await.unwrap_or_default();
    files.sort();
    files
}

#[tokio::test]
async fn cold_start_backs_up_every_message_and_records_state() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(dir.path()));

    let mut mailboxes = HashMap::new();
    mailboxes.insert(
        "INBOX".to_string(),
        FakeMailbox {
            uid_validity: 7,
            messages: (1..=10).map(|uid| message(uid, "hi")).collect(),
        },
    );
    mailboxes.insert(
        "Archive".to_string(),
        FakeMailbox {
            uid_validity: 3,
            messages: (1..=5).map(|uid| message(uid, "old")).collect(),
        },
    );
    let api: Arc<dyn ImapApi> = Arc::new(FakeImapApi::new(mailboxes));

    let backup: Arc<dyn Plugin> = Arc::new(BackupSink::new(store.clone(), "backup".to_string()));
    let mut engine = SyncEngine::new(
        api.clone(),
        api,
        store.clone(),
        vec![backup],
        "state".to_string(),
        ".state.json".to_string(),
        0,
    );
    engine.init_plugins().await;
    engine.run(None).await;

    let local = LocalObjectStore::new(dir.path());
    assert_eq!(list_backup_files(&local, "backup/INBOX").await.len(), 10);
    assert_eq!(list_backup_files(&local, "backup/Archive").await.len(), 5);

    let mut state = StateStore::load(store.as_ref(), "state", ".state.json").await.unwrap();
    assert_eq!(state.folder("INBOX").last_uid, 10);
    assert_eq!(state.folder("INBOX").uid_validity, 7);
    assert_eq!(state.folder("Archive").last_uid, 5);
}

#[tokio::test]
async fn incremental_sweep_only_dispatches_new_messages() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(dir.path()));

    let mut state = StateStore::new();
    state.set_folder(
        "INBOX",
        mirror_agent::state::FolderState {
            last_uid: 10,
            uid_validity: 7,
        },
    );
    state.save(store.as_ref(), "state", ".state.json").await.unwrap();

    let mut mailboxes = HashMap::new();
    mailboxes.insert(
        "INBOX".to_string(),
        FakeMailbox {
            uid_validity: 7,
            messages: (1..=12).map(|uid| message(uid, "msg")).collect(),
        },
    );
    let api: Arc<dyn ImapApi> = Arc::new(FakeImapApi::new(mailboxes));

    let backup: Arc<dyn Plugin> = Arc::new(BackupSink::new(store.clone(), "backup".to_string()));
    let mut engine = SyncEngine::new(
        api.clone(),
        api,
        store.clone(),
        vec![backup],
        "state".to_string(),
        ".state.json".to_string(),
        0,
    );
    engine.init_plugins().await;
    engine.run(None).await;

    let files = list_backup_files(&LocalObjectStore::new(dir.path()), "backup/INBOX").await;
    assert_eq!(files.len(), 2, "only uids 11 and 12 should be newly backed up");

    let mut loaded = StateStore::load(store.as_ref(), "state", ".state.json").await.unwrap();
    assert_eq!(loaded.folder("INBOX").last_uid, 12);
}

#[tokio::test]
async fn uid_validity_change_triggers_full_resync_from_zero() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(dir.path()));

    let mut state = StateStore::new();
    state.set_folder(
        "INBOX",
        mirror_agent::state::FolderState {
            last_uid: 10,
            uid_validity: 7,
        },
    );
    state.save(store.as_ref(), "state", ".state.json").await.unwrap();

    let mut mailboxes = HashMap::new();
    mailboxes.insert(
        "INBOX".to_string(),
        FakeMailbox {
            uid_validity: 8,
            messages: (1..=3).map(|uid| message(uid, "new epoch")).collect(),
        },
    );
    let api: Arc<dyn ImapApi> = Arc::new(FakeImapApi::new(mailboxes));

    let backup: Arc<dyn Plugin> = Arc::new(BackupSink::new(store.clone(), "backup".to_string()));
    let mut engine = SyncEngine::new(
        api.clone(),
        api,
        store.clone(),
        vec![backup],
        "state".to_string(),
        ".state.json".to_string(),
        0,
    );
    engine.init_plugins().await;
    engine.run(None).await;

    let files = list_backup_files(&LocalObjectStore::new(dir.path()), "backup/INBOX").await;
    assert_eq!(files.len(), 3);

    let mut loaded = StateStore::load(store.as_ref(), "state", ".state.json").await.unwrap();
    assert_eq!(loaded.folder("INBOX").last_uid, 3);
    assert_eq!(loaded.folder("INBOX").uid_validity, 8);
}

#[tokio::test]
async fn filter_move_verdict_relocates_matching_messages() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(dir.path()));

    let mut mailboxes = HashMap::new();
    mailboxes.insert(
        "INBOX".to_string(),
        FakeMailbox {
            uid_validity: 1,
            messages: vec![message(4, "keep me"), message(7, "keep me too")],
        },
    );
    let api = Arc::new(FakeImapApi::new(mailboxes));
    let dyn_api: Arc<dyn ImapApi> = api.clone();

    let filters: Vec<Box<dyn Filter>> = vec![Box::new(AlwaysReject {
        target: "Folders/Keep".to_string(),
    })];
    let filter_plugin: Arc<dyn Plugin> = Arc::new(FilterPipeline::new(filters, "Spam.Shit".to_string()));

    let mut engine = SyncEngine::new(
        dyn_api.clone(),
        dyn_api,
        store,
        vec![filter_plugin],
        "state".to_string(),
        ".state.json".to_string(),
        0,
    );
    engine.init_plugins().await;
    engine.run(None).await;

    // `run(None)` already awaited `close_plugins`, which drains the apply
    // worker, so every queued move has landed by the time this returns.
    let inbox = api.snapshot("INBOX");
    assert!(inbox.messages.is_empty(), "both messages should have been moved out of INBOX");

    let keep = api.snapshot("Folders/Keep");
    let mut uids: Vec<u32> = keep.messages.iter().map(|m| m.uid).collect();
    uids.sort_unstable();
    assert_eq!(uids, vec![4, 7]);
}

#[tokio::test]
async fn idle_wake_triggers_a_second_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(dir.path()));

    let mut mailboxes = HashMap::new();
    mailboxes.insert(
        "INBOX".to_string(),
        FakeMailbox {
            uid_validity: 1,
            messages: vec![message(1, "hello")],
        },
    );
    let api: Arc<dyn ImapApi> = Arc::new(FakeImapApi::with_idle_wake(mailboxes));

    let backup: Arc<dyn Plugin> = Arc::new(BackupSink::new(store.clone(), "backup".to_string()));
    let mut engine = SyncEngine::new(
        api.clone(),
        api,
        store.clone(),
        vec![backup],
        "state".to_string(),
        ".state.json".to_string(),
        0,
    );
    engine.init_plugins().await;

    let stop = engine.stop_handle();
    let run = tokio::spawn(async move { engine.run(Some(Duration::from_millis(10))).await });

    // Let the first sweep, the idle wake, and the second (now-incremental,
    // empty) sweep happen, then ask the loop to stop.
    tokio::time::sleep(Duration::from_millis(100)).await;
    stop.notify_one();
    run.await.unwrap();

    let files = list_backup_files(&LocalObjectStore::new(dir.path()), "backup/INBOX").await;
    assert_eq!(files.len(), 1, "the single message should be backed up exactly once");
}
