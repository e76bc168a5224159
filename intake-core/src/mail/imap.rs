//! Checkpointed IMAP source.
//!
//! One logical worker per account: take the account's distributed lock,
//! read the checkpoint, fetch new mail, persist + enqueue each message,
//! then advance the checkpoint. A tick that loses its lock mid-flight is
//! harmless: late writes land on the idempotency checks downstream.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_imap::Session;
use async_native_tls::TlsConnector;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::io::{AsyncRead, AsyncWrite};
use intake_model::{EmailAccount, EventSource, EventType, UnifiedEvent};
use tokio::net::TcpStream;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::{debug, error, info, warn};

use super::message::ParsedMail;
use super::persistence::MailPersistor;
use crate::error::{CoreError, Result};
use crate::stream::{CheckpointStore, DistributedLock, EventStream};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// One fetched message: IMAP UID plus RFC822 bytes.
#[derive(Debug, Clone)]
pub struct FetchedMail {
    pub uid: u32,
    pub raw: Vec<u8>,
}

/// Transport seam for the fetch loop; the real implementation speaks
/// IMAP, tests substitute a stub.
#[async_trait]
pub trait MailFetch: Send + Sync {
    async fn fetch_since(
        &self,
        account: &EmailAccount,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<FetchedMail>>;

    async fn mark_seen(
        &self,
        account: &EmailAccount,
        uids: &[u32],
    ) -> Result<()>;
}

/// Outcome of one poll tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Another replica holds the account lock.
    Skipped,
    Completed { fetched: usize, enqueued: usize },
}

pub struct ImapFetcher {
    fetch: Arc<dyn MailFetch>,
    persistor: Arc<MailPersistor>,
    stream: Arc<dyn EventStream>,
    lock: Arc<dyn DistributedLock>,
    checkpoints: Arc<dyn CheckpointStore>,
    /// Consumer identity recorded as the lock value.
    identity: String,
    poll_interval: Duration,
    lock_margin: Duration,
}

impl ImapFetcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fetch: Arc<dyn MailFetch>,
        persistor: Arc<MailPersistor>,
        stream: Arc<dyn EventStream>,
        lock: Arc<dyn DistributedLock>,
        checkpoints: Arc<dyn CheckpointStore>,
        identity: String,
        poll_interval: Duration,
        lock_margin: Duration,
    ) -> Self {
        Self {
            fetch,
            persistor,
            stream,
            lock,
            checkpoints,
            identity,
            poll_interval,
            lock_margin,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// One tick for one account.
    pub async fn poll_account(
        &self,
        account: &EmailAccount,
    ) -> Result<PollOutcome> {
        let key = account.worker_key();
        let lock_key = format!("email_worker:{key}:lock");
        let ttl = self.poll_interval + self.lock_margin;

        if !self.lock.acquire(&lock_key, &self.identity, ttl).await? {
            debug!(account = %account.name, "lock held elsewhere, skipping tick");
            return Ok(PollOutcome::Skipped);
        }

        let started = Utc::now();
        let result = self.poll_locked(account, &key, started).await;
        if let Err(e) = self.lock.release(&lock_key, &self.identity).await {
            warn!(account = %account.name, error = %e, "lock release failed");
        }
        result
    }

    async fn poll_locked(
        &self,
        account: &EmailAccount,
        key: &str,
        started: DateTime<Utc>,
    ) -> Result<PollOutcome> {
        let since = match self.checkpoints.get(key).await? {
            Some(checkpoint) => Some(checkpoint),
            None => account
                .imap_sync_days
                .map(|days| started - chrono::Duration::days(days)),
        };

        // Account-level failures abort the tick here, before the
        // checkpoint moves.
        let fetched = self.fetch.fetch_since(account, since).await?;

        let mut enqueued = 0usize;
        let mut processed_uids = Vec::new();
        for mail in &fetched {
            match self.ingest_one(account, mail).await {
                Ok(did_enqueue) => {
                    if did_enqueue {
                        enqueued += 1;
                    }
                    processed_uids.push(mail.uid);
                }
                Err(e) => {
                    error!(
                        account = %account.name,
                        uid = mail.uid,
                        error = %e,
                        "message ingest failed, continuing batch"
                    );
                }
            }
        }

        if account.imap_mark_as_read && !processed_uids.is_empty() {
            if let Err(e) =
                self.fetch.mark_seen(account, &processed_uids).await
            {
                warn!(account = %account.name, error = %e, "mark-as-read failed");
            }
        }

        self.checkpoints.advance(key, started).await?;

        if !fetched.is_empty() {
            info!(
                account = %account.name,
                fetched = fetched.len(),
                enqueued,
                "poll tick complete"
            );
        }
        Ok(PollOutcome::Completed { fetched: fetched.len(), enqueued })
    }

    /// Persist and enqueue one message. Returns whether an event was
    /// appended (already-processed mails are skipped).
    async fn ingest_one(
        &self,
        account: &EmailAccount,
        fetched: &FetchedMail,
    ) -> Result<bool> {
        let mail = ParsedMail::parse(&fetched.raw)?;
        let record = self.persistor.persist(&mail, account.id).await?;

        if record.processed_at.is_some() {
            debug!(message_id = %record.message_id, "mail already dispatched");
            return Ok(false);
        }

        let event = build_event(&mail, record.id, account);
        let stream_id = self.stream.append(&event).await?;
        debug!(
            event_id = %event.event_id,
            stream_id,
            "enqueued mail event"
        );
        self.persistor.mark_processed(record.id, event.event_id).await?;
        Ok(true)
    }
}

fn build_event(
    mail: &ParsedMail,
    raw_record_id: uuid::Uuid,
    account: &EmailAccount,
) -> UnifiedEvent {
    let mut event = UnifiedEvent::new(
        EventType::Email,
        EventSource::Email,
        format!("email:{}", mail.message_id),
        mail.text_content(),
        mail.date.unwrap_or_else(Utc::now),
    );
    event.source_id = Some(mail.message_id.clone());
    event.user_external_id = Some(mail.sender.clone());
    event.user_name = mail.sender_name.clone();
    event
        .metadata
        .insert("subject".into(), mail.subject.clone());
    event
        .metadata
        .insert("email_raw_id".into(), raw_record_id.to_string());
    event
        .metadata
        .insert("email_account_id".into(), account.worker_key());
    event
}

/// Production IMAP transport built on async-imap over TLS (or plain TCP
/// where an account opts out of SSL).
pub struct ImapMailFetch;

impl ImapMailFetch {
    pub fn new() -> Self {
        Self
    }

    async fn with_session<F, T>(
        &self,
        account: &EmailAccount,
        run: F,
    ) -> Result<T>
    where
        F: AsyncSessionOp<T>,
    {
        let address = format!("{}:{}", account.imap_host, account.imap_port);
        let tcp = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect(&address),
        )
        .await
        .map_err(|_| {
            CoreError::Mail(format!("connect timeout to {address}"))
        })??;

        if account.imap_use_ssl {
            let tls = TlsConnector::new()
                .connect(&account.imap_host, tcp.compat())
                .await
                .map_err(|e| {
                    CoreError::Mail(format!("tls handshake failed: {e}"))
                })?;
            let client = async_imap::Client::new(tls);
            let mut session = client
                .login(&account.imap_user, &account.imap_password)
                .await
                .map_err(|(e, _)| {
                    CoreError::Mail(format!("imap login failed: {e:?}"))
                })?;
            let result = run.run(&mut session, account).await;
            let _ = session.logout().await;
            result
        } else {
            let client = async_imap::Client::new(tcp.compat());
            let mut session = client
                .login(&account.imap_user, &account.imap_password)
                .await
                .map_err(|(e, _)| {
                    CoreError::Mail(format!("imap login failed: {e:?}"))
                })?;
            let result = run.run(&mut session, account).await;
            let _ = session.logout().await;
            result
        }
    }
}

impl Default for ImapMailFetch {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait so the TLS and plain sessions share one code path.
trait AsyncSessionOp<T>: Send {
    fn run<'a, S>(
        &'a self,
        session: &'a mut Session<S>,
        account: &'a EmailAccount,
    ) -> futures::future::BoxFuture<'a, Result<T>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug;
}

struct FetchOp {
    since: Option<DateTime<Utc>>,
}

impl AsyncSessionOp<Vec<FetchedMail>> for FetchOp {
    fn run<'a, S>(
        &'a self,
        session: &'a mut Session<S>,
        account: &'a EmailAccount,
    ) -> futures::future::BoxFuture<'a, Result<Vec<FetchedMail>>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug,
    {
        Box::pin(async move {
            session.select(&account.imap_folder).await.map_err(|e| {
                CoreError::Mail(format!(
                    "select {} failed: {e:?}",
                    account.imap_folder
                ))
            })?;

            // Conjunction of the configured criteria.
            let mut criteria = Vec::new();
            if let Some(since) = self.since {
                criteria.push(format!("SINCE {}", since.format("%d-%b-%Y")));
            }
            if account.imap_unseen_only {
                criteria.push("UNSEEN".to_owned());
            }
            let query = if criteria.is_empty() {
                "ALL".to_owned()
            } else {
                criteria.join(" ")
            };

            let uids = session.uid_search(&query).await.map_err(|e| {
                CoreError::Mail(format!("search failed: {e:?}"))
            })?;

            // Most recent first for the cut, fetch order ascending.
            let mut uids: Vec<u32> = uids.into_iter().collect();
            uids.sort_unstable_by(|a, b| b.cmp(a));
            uids.truncate(account.imap_fetch_limit.max(1));
            uids.sort_unstable();

            let mut mails = Vec::new();
            for uid in uids {
                let mut messages = session
                    .uid_fetch(uid.to_string(), "RFC822")
                    .await
                    .map_err(|e| {
                        CoreError::Mail(format!("fetch {uid} failed: {e:?}"))
                    })?;
                while let Some(message) = messages.next().await {
                    match message {
                        Ok(message) => {
                            if let Some(body) = message.body() {
                                mails.push(FetchedMail {
                                    uid,
                                    raw: body.to_vec(),
                                });
                            }
                        }
                        Err(e) => {
                            warn!(uid, error = ?e, "fetch item failed");
                        }
                    }
                }
            }
            Ok(mails)
        })
    }
}

struct MarkSeenOp {
    uids: Vec<u32>,
}

impl AsyncSessionOp<()> for MarkSeenOp {
    fn run<'a, S>(
        &'a self,
        session: &'a mut Session<S>,
        account: &'a EmailAccount,
    ) -> futures::future::BoxFuture<'a, Result<()>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug,
    {
        Box::pin(async move {
            session.select(&account.imap_folder).await.map_err(|e| {
                CoreError::Mail(format!(
                    "select {} failed: {e:?}",
                    account.imap_folder
                ))
            })?;
            let set = self
                .uids
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let mut responses = session
                .uid_store(&set, "+FLAGS (\\Seen)")
                .await
                .map_err(|e| {
                    CoreError::Mail(format!("store failed: {e:?}"))
                })?;
            while responses.next().await.is_some() {}
            Ok(())
        })
    }
}

#[async_trait]
impl MailFetch for ImapMailFetch {
    async fn fetch_since(
        &self,
        account: &EmailAccount,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<FetchedMail>> {
        self.with_session(account, FetchOp { since }).await
    }

    async fn mark_seen(
        &self,
        account: &EmailAccount,
        uids: &[u32],
    ) -> Result<()> {
        if uids.is_empty() {
            return Ok(());
        }
        self.with_session(account, MarkSeenOp { uids: uids.to_vec() }).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::db::InMemoryRawMailRepository;
    use crate::db::ports::RawMailRepository;
    use crate::storage::{BlobStorage, LocalDiskStore, MemoryTokenStore};
    use crate::stream::{
        InMemoryEventStream, MemoryCheckpointStore, MemoryLock,
    };

    struct StubFetch {
        mails: Mutex<Vec<FetchedMail>>,
        seen: Mutex<Vec<u32>>,
        fail: bool,
    }

    impl StubFetch {
        fn with_mails(mails: Vec<FetchedMail>) -> Self {
            Self { mails: Mutex::new(mails), seen: Mutex::new(Vec::new()), fail: false }
        }

        fn failing() -> Self {
            Self {
                mails: Mutex::new(Vec::new()),
                seen: Mutex::new(Vec::new()),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl MailFetch for StubFetch {
        async fn fetch_since(
            &self,
            _account: &EmailAccount,
            _since: Option<DateTime<Utc>>,
        ) -> Result<Vec<FetchedMail>> {
            if self.fail {
                return Err(CoreError::Mail("auth failed".into()));
            }
            Ok(self.mails.lock().unwrap().clone())
        }

        async fn mark_seen(
            &self,
            _account: &EmailAccount,
            uids: &[u32],
        ) -> Result<()> {
            self.seen.lock().unwrap().extend_from_slice(uids);
            Ok(())
        }
    }

    fn account(mark_as_read: bool) -> EmailAccount {
        EmailAccount {
            id: Some(3),
            name: "sales".into(),
            imap_host: "imap.example".into(),
            imap_port: 993,
            imap_use_ssl: true,
            imap_user: "sales@example".into(),
            imap_password: "secret".into(),
            imap_folder: "INBOX".into(),
            imap_mark_as_read: mark_as_read,
            imap_sync_days: Some(7),
            imap_unseen_only: false,
            imap_fetch_limit: 50,
            active: true,
            created_at: None,
        }
    }

    fn raw_mail(message_id: &str) -> Vec<u8> {
        format!(
            "Message-ID: <{message_id}>\r\nFrom: Buyer <buyer@ex.com>\r\n\
To: sales@example\r\nSubject: RFQ\r\n\
Date: Fri, 14 Mar 2025 09:26:53 +0000\r\n\r\nPlease quote 100 pcs.\r\n"
        )
        .into_bytes()
    }

    struct Fixture {
        fetcher: ImapFetcher,
        stream: Arc<InMemoryEventStream>,
        repo: Arc<InMemoryRawMailRepository>,
        checkpoints: Arc<MemoryCheckpointStore>,
        lock: Arc<MemoryLock>,
        _dir: tempfile::TempDir,
    }

    fn fixture(fetch: Arc<dyn MailFetch>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(InMemoryRawMailRepository::new());
        let storage = BlobStorage::new(
            None,
            Some(Arc::new(LocalDiskStore::new(
                dir.path().to_path_buf(),
                "http://localhost:8500".into(),
                Arc::new(MemoryTokenStore::new()),
            ))),
        );
        let persistor = Arc::new(MailPersistor::new(repo.clone(), storage));
        let stream = Arc::new(InMemoryEventStream::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let lock = Arc::new(MemoryLock::new());
        let fetcher = ImapFetcher::new(
            fetch,
            persistor,
            stream.clone(),
            lock.clone(),
            checkpoints.clone(),
            "test-worker".into(),
            Duration::from_secs(60),
            Duration::from_secs(30),
        );
        Fixture { fetcher, stream, repo, checkpoints, lock, _dir: dir }
    }

    #[tokio::test]
    async fn tick_persists_enqueues_and_advances_checkpoint() {
        let fetch = Arc::new(StubFetch::with_mails(vec![
            FetchedMail { uid: 1, raw: raw_mail("a@ex.com") },
            FetchedMail { uid: 2, raw: raw_mail("b@ex.com") },
        ]));
        let fx = fixture(fetch.clone());
        let account = account(true);

        let outcome = fx.fetcher.poll_account(&account).await.unwrap();
        assert_eq!(outcome, PollOutcome::Completed { fetched: 2, enqueued: 2 });

        assert_eq!(fx.repo.mail_count(), 2);
        assert_eq!(fx.stream.stream_info().await.unwrap().length, 2);
        assert!(fx.checkpoints.get("3").await.unwrap().is_some());
        assert_eq!(*fetch.seen.lock().unwrap(), vec![1, 2]);

        // Raw records link back to their events.
        let record =
            fx.repo.find_by_message_id("<a@ex.com>").await.unwrap().unwrap();
        assert!(record.event_id.is_some());
        assert!(record.processed_at.is_some());
    }

    #[tokio::test]
    async fn second_tick_does_not_reenqueue_processed_mail() {
        let fetch = Arc::new(StubFetch::with_mails(vec![FetchedMail {
            uid: 1,
            raw: raw_mail("dup@ex.com"),
        }]));
        let fx = fixture(fetch);
        let account = account(false);

        let first = fx.fetcher.poll_account(&account).await.unwrap();
        let second = fx.fetcher.poll_account(&account).await.unwrap();
        assert_eq!(first, PollOutcome::Completed { fetched: 1, enqueued: 1 });
        assert_eq!(second, PollOutcome::Completed { fetched: 1, enqueued: 0 });
        assert_eq!(fx.stream.stream_info().await.unwrap().length, 1);
        assert_eq!(fx.repo.mail_count(), 1);
    }

    #[tokio::test]
    async fn held_lock_skips_tick() {
        let fetch = Arc::new(StubFetch::with_mails(vec![FetchedMail {
            uid: 1,
            raw: raw_mail("lock@ex.com"),
        }]));
        let fx = fixture(fetch);
        let account = account(false);

        fx.lock
            .acquire(
                "email_worker:3:lock",
                "other-replica",
                Duration::from_secs(120),
            )
            .await
            .unwrap();
        let outcome = fx.fetcher.poll_account(&account).await.unwrap();
        assert_eq!(outcome, PollOutcome::Skipped);
        assert_eq!(fx.repo.mail_count(), 0);
    }

    #[tokio::test]
    async fn account_error_leaves_checkpoint_untouched() {
        let fx = fixture(Arc::new(StubFetch::failing()));
        let account = account(false);

        assert!(fx.fetcher.poll_account(&account).await.is_err());
        assert_eq!(fx.checkpoints.get("3").await.unwrap(), None);

        // The lock is released even after a failing tick.
        assert!(
            fx.lock
                .acquire(
                    "email_worker:3:lock",
                    "test-worker",
                    Duration::from_secs(1)
                )
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn checkpoint_only_moves_forward() {
        let fetch = Arc::new(StubFetch::with_mails(Vec::new()));
        let fx = fixture(fetch);
        let account = account(false);

        fx.fetcher.poll_account(&account).await.unwrap();
        let first = fx.checkpoints.get("3").await.unwrap().unwrap();
        fx.fetcher.poll_account(&account).await.unwrap();
        let second = fx.checkpoints.get("3").await.unwrap().unwrap();
        assert!(second >= first);
    }
}
