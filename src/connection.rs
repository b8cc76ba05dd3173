//! IMAP connection wrapper
//!
//! Wraps a single `async_imap::Session` behind a mutex so the engine's
//! read/select/fetch sweeps and the filter pipeline's apply worker can
//! share one TCP connection without racing IMAP's single-command-at-a-time
//! protocol. The session is re-established on demand rather than held
//! across IDLE.
//!
//! Transport is implicit TLS on connect: this dials straight into a TLS
//! handshake against the configured address rather than negotiating
//! STARTTLS, since the target is a real mail provider rather than a local
//! bridge. Certificates are verified against the Mozilla root set.
//!
//! Any IMAP command that fails with "not logged in" is retried exactly
//! once against a freshly re-established session.

use crate::config::ImapSettings;
use crate::error::{Error, Result};
use crate::message::{Address as CanonAddress, Envelope as CanonEnvelope, Message};
use async_imap::extensions::idle::IdleResponse;
use async_imap::types::{Fetch, Name};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info, warn};

type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;
type ImapSession = async_imap::Session<Compat<TlsStream>>;

fn tls_connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

async fn dial(settings: &ImapSettings) -> Result<ImapSession> {
    debug!(addr = %settings.addr, "dialing IMAP server");
    let (host, port) = split_addr(&settings.addr)?;

    let tcp = TcpStream::connect((host.as_str(), port)).await?;
    let connector = tls_connector();
    let server_name = ServerName::try_from(host.clone())
        .map_err(|e| Error::Tls(format!("invalid server name {host}: {e}")))?
        .to_owned();
    let tls = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::Tls(e.to_string()))?;

    let client = async_imap::Client::new(tls.compat());
    let session = client
        .login(&settings.username, &settings.password)
        .await
        .map_err(|(e, _)| Error::Auth(e.to_string()))?;

    info!(addr = %settings.addr, "IMAP session established");
    Ok(session)
}

fn split_addr(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("imap.addr {addr} must be host:port")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::Config(format!("imap.addr {addr} has an invalid port")))?;
    Ok((host.to_string(), port))
}

/// A folder's mutable-state sliver returned by `STATUS`/`SELECT`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FolderStatus {
    pub uid_validity: u32,
    pub uid_next: u32,
    pub exists: u32,
}

/// Single shared IMAP connection, reconnected transparently on demand.
pub struct ImapConnection {
    settings: ImapSettings,
    session: Mutex<Option<ImapSession>>,
}

impl ImapConnection {
    #[must_use]
    pub fn new(settings: ImapSettings) -> Self {
        Self {
            settings,
            session: Mutex::new(None),
        }
    }

    async fn with_session<T, F, Fut>(&self, op: &str, f: F) -> Result<T>
    where
        F: Fn(ImapSession) -> Fut,
        Fut: std::future::Future<Output = (ImapSession, Result<T>)>,
    {
        let mut guard = self.session.lock().await;
        let session = match guard.take() {
            Some(s) => s,
            None => dial(&self.settings).await?,
        };

        let (session, result) = f(session).await;
        match result {
            Ok(value) => {
                *guard = Some(session);
                Ok(value)
            }
            Err(e) if e.is_not_logged_in() => {
                warn!(%op, "session no longer logged in, reconnecting once");
                let fresh = dial(&self.settings).await?;
                let (fresh, retried) = f(fresh).await;
                *guard = Some(fresh);
                retried
            }
            Err(e) => Err(e),
        }
    }

    /// `STATUS folder (UIDVALIDITY UIDNEXT MESSAGES)`, used to decide
    /// full-resync vs incremental without disturbing the selected mailbox.
    pub async fn status(&self, folder: &str) -> Result<FolderStatus> {
        self.with_session("status", |mut session| {
            let folder = folder.to_string();
            async move {
                let result = session
                    .status(&folder, "(UIDVALIDITY UIDNEXT MESSAGES)")
                    .await
                    .map(|mailbox| FolderStatus {
                        uid_validity: mailbox.uid_validity.unwrap_or(0),
                        uid_next: mailbox.uid_next.unwrap_or(0),
                        exists: mailbox.exists,
                    })
                    .map_err(|e| Error::Imap(e.to_string()));
                (session, result)
            }
        })
        .await
    }

    /// `SELECT` or `EXAMINE` a mailbox, returning its post-select status.
    pub async fn select(&self, folder: &str, read_only: bool) -> Result<FolderStatus> {
        self.with_session("select", |mut session| {
            let folder = folder.to_string();
            async move {
                let outcome = if read_only {
                    session.examine(&folder).await
                } else {
                    session.select(&folder).await
                };
                let result = outcome
                    .map(|mailbox| FolderStatus {
                        uid_validity: mailbox.uid_validity.unwrap_or(0),
                        uid_next: mailbox.uid_next.unwrap_or(0),
                        exists: mailbox.exists,
                    })
                    .map_err(|e| Error::Imap(e.to_string()));
                (session, result)
            }
        })
        .await
    }

    /// `LIST "" "*"`: every mailbox path the account exposes.
    pub async fn list_folders(&self) -> Result<Vec<String>> {
        self.with_session("list", |mut session| async move {
            let result = async {
                let names: Vec<Name> = session
                    .list(Some(""), Some("*"))
                    .await
                    .map_err(|e| Error::Imap(e.to_string()))?
                    .try_collect()
                    .await
                    .map_err(|e| Error::Imap(e.to_string()))?;
                Ok(names.iter().map(|n| n.name().to_string()).collect())
            }
            .await;
            (session, result)
        })
        .await
    }

    /// `SELECT folder READONLY` followed by `FETCH <seq> (UID ENVELOPE
    /// BODY.PEEK[])` against sequence numbers, used by full resync.
    /// Returns the post-select status alongside the fetched messages so
    /// the caller never needs a second round trip just to read
    /// `UIDVALIDITY`/`EXISTS`.
    pub async fn fetch(&self, folder: &str, seq_set: &str) -> Result<(FolderStatus, Vec<Message>)> {
        self.fetch_inner("fetch", folder, seq_set, false).await
    }

    /// `SELECT folder READONLY` followed by `UID FETCH <uids> (UID
    /// ENVELOPE BODY.PEEK[])`, used by incremental sync.
    pub async fn uid_fetch(&self, folder: &str, uid_set: &str) -> Result<(FolderStatus, Vec<Message>)> {
        self.fetch_inner("uid_fetch", folder, uid_set, true).await
    }

    async fn fetch_inner(
        &self,
        op: &str,
        folder: &str,
        set: &str,
        by_uid: bool,
    ) -> Result<(FolderStatus, Vec<Message>)> {
        self.with_session(op, |mut session| {
            let folder = folder.to_string();
            let set = set.to_string();
            async move {
                let result = async {
                    let mailbox = session.examine(&folder).await.map_err(|e| Error::Imap(e.to_string()))?;
                    let status = FolderStatus {
                        uid_validity: mailbox.uid_validity.unwrap_or(0),
                        uid_next: mailbox.uid_next.unwrap_or(0),
                        exists: mailbox.exists,
                    };
                    let fetches: Vec<Fetch> = if by_uid {
                        session
                            .uid_fetch(&set, "(UID ENVELOPE BODY.PEEK[])")
                            .await
                            .map_err(|e| Error::Imap(e.to_string()))?
                            .try_collect()
                            .await
                            .map_err(|e| Error::Imap(e.to_string()))?
                    } else {
                        session
                            .fetch(&set, "(UID ENVELOPE BODY.PEEK[])")
                            .await
                            .map_err(|e| Error::Imap(e.to_string()))?
                            .try_collect()
                            .await
                            .map_err(|e| Error::Imap(e.to_string()))?
                    };
                    Ok((status, fetches.iter().map(to_canonical_message).collect()))
                }
                .await;
                (session, result)
            }
        })
        .await
    }

    /// `UID MOVE <uid> <dest>`. The destination folder must already exist.
    pub async fn uid_move(&self, folder: &str, uid: u32, dest: &str) -> Result<()> {
        self.with_session("uid_move", |mut session| {
            let folder = folder.to_string();
            let dest = dest.to_string();
            async move {
                let result = async {
                    session
                        .select(&folder)
                        .await
                        .map_err(|e| Error::Imap(e.to_string()))?;
                    session
                        .uid_mv(uid.to_string(), &dest)
                        .await
                        .map_err(|e| Error::Imap(e.to_string()))?;
                    Ok(())
                }
                .await;
                (session, result)
            }
        })
        .await
    }

    /// Select `folder` and IDLE until new data arrives, `timeout` elapses,
    /// or the server drops the connection. Returns `true` if new data
    /// arrived before the timeout.
    pub async fn idle(&self, folder: &str, timeout: Duration) -> Result<bool> {
        let mut guard = self.session.lock().await;
        let session = match guard.take() {
            Some(s) => s,
            None => dial(&self.settings).await?,
        };

        match run_idle(session, folder, timeout).await {
            Ok((session, new_data)) => {
                *guard = Some(session);
                Ok(new_data)
            }
            Err(e) => {
                warn!(error = %e, "IDLE failed, session dropped");
                Err(e)
            }
        }
    }
}

/// Object-safe surface the sync engine and the filter apply worker
/// depend on, so both can be exercised in tests against an in-memory
/// fake instead of a live TLS socket.
#[async_trait::async_trait]
pub trait ImapApi: Send + Sync {
    async fn status(&self, folder: &str) -> Result<FolderStatus>;
    async fn list_folders(&self) -> Result<Vec<String>>;
    async fn fetch(&self, folder: &str, seq_set: &str) -> Result<(FolderStatus, Vec<Message>)>;
    async fn uid_fetch(&self, folder: &str, uid_set: &str) -> Result<(FolderStatus, Vec<Message>)>;
    async fn uid_move(&self, folder: &str, uid: u32, dest: &str) -> Result<()>;
    /// Waits on INBOX for new data; returns `true` if new data arrived
    /// before `timeout` elapsed.
    async fn idle(&self, folder: &str, timeout: Duration) -> Result<bool>;
}

#[async_trait::async_trait]
impl ImapApi for ImapConnection {
    async fn status(&self, folder: &str) -> Result<FolderStatus> {
        Self::status(self, folder).await
    }

    async fn list_folders(&self) -> Result<Vec<String>> {
        Self::list_folders(self).await
    }

    async fn fetch(&self, folder: &str, seq_set: &str) -> Result<(FolderStatus, Vec<Message>)> {
        Self::fetch(self, folder, seq_set).await
    }

    async fn uid_fetch(&self, folder: &str, uid_set: &str) -> Result<(FolderStatus, Vec<Message>)> {
        Self::uid_fetch(self, folder, uid_set).await
    }

    async fn uid_move(&self, folder: &str, uid: u32, dest: &str) -> Result<()> {
        Self::uid_move(self, folder, uid, dest).await
    }

    async fn idle(&self, folder: &str, timeout: Duration) -> Result<bool> {
        Self::idle(self, folder, timeout).await
    }
}

async fn run_idle(mut session: ImapSession, folder: &str, timeout: Duration) -> Result<(ImapSession, bool)> {
    session
        .examine(folder)
        .await
        .map_err(|e| Error::Imap(e.to_string()))?;

    let mut idle = session.idle();
    idle.init().await.map_err(|e| Error::Imap(e.to_string()))?;

    let (idle_wait, _stop) = idle.wait_with_timeout(timeout);
    let response = idle_wait.await.map_err(|e| Error::Imap(e.to_string()))?;

    let new_data = matches!(response, IdleResponse::NewData(_));
    let session = idle.done().await.map_err(|e| Error::Imap(e.to_string()))?;
    Ok((session, new_data))
}

fn to_canonical_message(fetch: &Fetch) -> Message {
    let uid = fetch.uid.unwrap_or(0);
    let body = fetch.body().map(<[u8]>::to_vec).unwrap_or_default();
    let envelope = fetch.envelope().map(to_canonical_envelope);
    Message { uid, envelope, body }
}

fn to_canonical_envelope(envelope: &async_imap::types::Envelope) -> CanonEnvelope {
    CanonEnvelope {
        subject: decode(envelope.subject.as_deref()),
        message_id: decode(envelope.message_id.as_deref()),
        date: decode(envelope.date.as_deref()).and_then(|d| parse_rfc2822(&d)),
        from: to_canonical_addresses(envelope.from.as_deref()),
        to: to_canonical_addresses(envelope.to.as_deref()),
        cc: to_canonical_addresses(envelope.cc.as_deref()),
        bcc: to_canonical_addresses(envelope.bcc.as_deref()),
        sender: to_canonical_addresses(envelope.sender.as_deref()),
    }
}

fn to_canonical_addresses(addrs: Option<&[async_imap::types::Address<'_>]>) -> Vec<CanonAddress> {
    addrs
        .unwrap_or_default()
        .iter()
        .map(|addr| {
            let mailbox = decode(addr.mailbox.as_deref()).unwrap_or_default();
            let host = decode(addr.host.as_deref()).unwrap_or_default();
            CanonAddress {
                name: decode(addr.name.as_deref()),
                email: format!("{mailbox}@{host}"),
            }
        })
        .collect()
}

fn decode(bytes: Option<&[u8]>) -> Option<String> {
    bytes.and_then(|b| std::str::from_utf8(b).ok()).map(str::to_string)
}

fn parse_rfc2822(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(s).ok().map(|dt| dt.with_timezone(&Utc))
}
