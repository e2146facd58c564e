#![forbid(unsafe_code)]

// In-process sync backend.
//
// Holds the authoritative user/file tables in memory and simulates network
// latency, rejections and stalls. Used by the bundled binary for dry runs and
// by tests.

use crate::auth::token::parse_test_access_token;
use crate::sync::{
    access_token_from_uri, FileRecord, Mutation, NoticeHandler, SessionNotice, SessionRequest,
    SyncBackend, SyncError, SyncSession, UserRecord,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Knobs for simulated backend behaviour
#[derive(Debug, Clone, Default)]
pub struct BackendBehavior {
    /// Added before every preload and transaction
    pub latency: Duration,
    /// Reject every transaction with this code
    pub reject_code: Option<u16>,
    /// Preloads and transactions never resolve
    pub stall: bool,
    /// Transactions succeed but nothing is committed
    pub drop_writes: bool,
    /// Sessions are told their protocol version is too old on open
    pub client_too_old: bool,
    /// Opening a session fails as if the origin were unreachable
    pub refuse_connections: bool,
}

#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Tables>,
}

struct Tables {
    users: StdRwLock<HashMap<String, UserRecord>>,
    files: StdRwLock<HashMap<String, FileRecord>>,
    behavior: StdRwLock<BackendBehavior>,
    access_secret: Option<String>,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    transactions: AtomicU64,
}

impl MemoryBackend {
    /// `access_secret` enables token validation on open; `None` accepts anyone.
    pub fn new(access_secret: Option<String>) -> Self {
        Self {
            inner: Arc::new(Tables {
                users: StdRwLock::new(HashMap::new()),
                files: StdRwLock::new(HashMap::new()),
                behavior: StdRwLock::new(BackendBehavior::default()),
                access_secret,
                sessions_opened: AtomicU64::new(0),
                sessions_closed: AtomicU64::new(0),
                transactions: AtomicU64::new(0),
            }),
        }
    }

    pub fn with_behavior(self, behavior: BackendBehavior) -> Self {
        self.set_behavior(behavior);
        self
    }

    pub fn set_behavior(&self, behavior: BackendBehavior) {
        *self.inner.behavior.write().unwrap_or_else(|e| e.into_inner()) = behavior;
    }

    fn behavior(&self) -> BackendBehavior {
        self.inner.behavior.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn seed_user(&self, user: UserRecord) {
        let mut users = self.inner.users.write().unwrap_or_else(|e| e.into_inner());
        users.insert(user.id.clone(), user);
    }

    pub fn user(&self, user_id: &str) -> Option<UserRecord> {
        self.inner.users.read().unwrap_or_else(|e| e.into_inner()).get(user_id).cloned()
    }

    pub fn files_owned_by(&self, owner_id: &str) -> Vec<FileRecord> {
        self.inner.files.read().unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|f| f.owner_id == owner_id)
            .cloned()
            .collect()
    }

    pub fn file_count(&self) -> usize {
        self.inner.files.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn sessions_opened(&self) -> u64 {
        self.inner.sessions_opened.load(Ordering::Relaxed)
    }

    pub fn sessions_closed(&self) -> u64 {
        self.inner.sessions_closed.load(Ordering::Relaxed)
    }

    pub fn transactions(&self) -> u64 {
        self.inner.transactions.load(Ordering::Relaxed)
    }

    fn authenticate(&self, request: &SessionRequest) -> Result<(), SyncError> {
        let Some(secret) = self.inner.access_secret.as_deref() else {
            return Ok(());
        };
        let token = access_token_from_uri(&request.uri)
            .ok_or_else(|| SyncError::Unauthorized("missing access token".to_string()))?;
        match parse_test_access_token(&token, secret) {
            Some(user_id) if user_id == request.user_id => Ok(()),
            _ => Err(SyncError::Unauthorized(format!("bad token for {}", request.user_id))),
        }
    }
}

#[async_trait]
impl SyncBackend for MemoryBackend {
    async fn open_session(&self, request: SessionRequest) -> Result<Arc<dyn SyncSession>, SyncError> {
        let behavior = self.behavior();
        if behavior.refuse_connections {
            return Err(SyncError::Connect(format!("{} refused the connection", request.uri.origin().ascii_serialization())));
        }
        self.authenticate(&request)?;
        self.inner.sessions_opened.fetch_add(1, Ordering::Relaxed);
        debug!("Session opened for {} at {}", request.user_id, request.uri);

        if behavior.client_too_old {
            (request.on_notice)(SessionNotice::ClientTooOld);
        }

        Ok(Arc::new(MemorySession {
            backend: self.clone(),
            user_id: request.user_id,
            on_notice: request.on_notice,
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        }))
    }
}

struct MemorySession {
    backend: MemoryBackend,
    user_id: String,
    on_notice: NoticeHandler,
    closed: AtomicBool,
    /// Wakes stalled requests when the session closes
    close_signal: Notify,
}

impl MemorySession {
    /// Simulates the round trip, honouring stall and latency settings.
    async fn round_trip(&self) -> Result<BackendBehavior, SyncError> {
        let closing = self.close_signal.notified();
        tokio::pin!(closing);
        closing.as_mut().enable();

        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }
        let behavior = self.backend.behavior();
        if behavior.stall {
            // Never answered; only closing the session ends the wait
            closing.await;
            return Err(SyncError::Closed);
        }
        // A request already in flight completes even if the session closes meanwhile
        if !behavior.latency.is_zero() {
            tokio::time::sleep(behavior.latency).await;
        }
        Ok(behavior)
    }
}

#[async_trait]
impl SyncSession for MemorySession {
    async fn preload_user(&self, user_id: &str) -> Result<Option<UserRecord>, SyncError> {
        self.round_trip().await?;
        Ok(self.backend.user(user_id))
    }

    async fn run_transaction(&self, mutations: Vec<Mutation>) -> Result<(), SyncError> {
        let behavior = self.round_trip().await?;
        self.backend.inner.transactions.fetch_add(1, Ordering::Relaxed);

        if let Some(code) = behavior.reject_code {
            (self.on_notice)(SessionNotice::MutationRejected { code });
            return Err(SyncError::Rejected { code });
        }
        if behavior.drop_writes {
            return Ok(());
        }

        let tables = &self.backend.inner;
        // Both locks taken up front so the whole batch commits at once
        let mut users = tables.users.write().unwrap_or_else(|e| e.into_inner());
        let mut files = tables.files.write().unwrap_or_else(|e| e.into_inner());
        for mutation in mutations {
            match mutation {
                Mutation::InsertUser(user) => {
                    users.insert(user.id.clone(), user);
                }
                Mutation::InsertFile(file) => {
                    files.insert(file.id.clone(), file);
                }
            }
        }
        Ok(())
    }

    fn committed_file(&self, file_id: &str) -> Option<FileRecord> {
        self.backend.inner.files.read().unwrap_or_else(|e| e.into_inner())
            .get(file_id)
            .filter(|f| f.owner_id == self.user_id)
            .cloned()
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_signal.notify_waiters();
            self.backend.inner.sessions_closed.fetch_add(1, Ordering::Relaxed);
            debug!("Session closed for {}", self.user_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::test_access_token;
    use crate::sync::session_uri;
    use std::sync::Mutex;

    fn request(user_id: &str, token: &str) -> (SessionRequest, Arc<Mutex<Vec<SessionNotice>>>) {
        let notices = Arc::new(Mutex::new(Vec::new()));
        let sink = notices.clone();
        let request = SessionRequest {
            user_id: user_id.to_string(),
            uri: session_uri("http://localhost:4000", user_id, token).unwrap(),
            on_notice: Arc::new(move |n| sink.lock().unwrap().push(n)),
        };
        (request, notices)
    }

    #[tokio::test]
    async fn test_rejects_token_for_other_user() {
        let backend = MemoryBackend::new(Some("s".into()));
        let (req, _) = request("alice", &test_access_token("s", "bob"));
        let result = backend.open_session(req).await;
        assert!(matches!(result, Err(SyncError::Unauthorized(_))));
        assert_eq!(backend.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn test_transaction_commits_and_is_visible() {
        let backend = MemoryBackend::new(Some("s".into()));
        let (req, _) = request("alice", &test_access_token("s", "alice"));
        let session = backend.open_session(req).await.unwrap();

        assert_eq!(session.preload_user("alice").await.unwrap(), None);
        let user = UserRecord::for_worker("alice", 1);
        let file = FileRecord::new_for_owner("f1", "alice", "slug".into(), 1);
        session
            .run_transaction(vec![Mutation::InsertUser(user.clone()), Mutation::InsertFile(file.clone())])
            .await
            .unwrap();

        assert_eq!(session.preload_user("alice").await.unwrap(), Some(user));
        assert_eq!(session.committed_file("f1"), Some(file));
        assert_eq!(backend.files_owned_by("alice").len(), 1);
    }

    #[tokio::test]
    async fn test_rejection_notifies_and_commits_nothing() {
        let backend = MemoryBackend::new(None).with_behavior(BackendBehavior {
            reject_code: Some(403),
            ..Default::default()
        });
        let (req, notices) = request("alice", "anything");
        let session = backend.open_session(req).await.unwrap();
        let file = FileRecord::new_for_owner("f1", "alice", "slug".into(), 1);

        let result = session.run_transaction(vec![Mutation::InsertFile(file)]).await;
        assert_eq!(result, Err(SyncError::Rejected { code: 403 }));
        assert_eq!(backend.file_count(), 0);
        assert_eq!(*notices.lock().unwrap(), vec![SessionNotice::MutationRejected { code: 403 }]);
    }

    #[tokio::test]
    async fn test_refused_connection_is_connect_error() {
        let backend = MemoryBackend::new(None).with_behavior(BackendBehavior {
            refuse_connections: true,
            ..Default::default()
        });
        let (req, _) = request("alice", "x");
        match backend.open_session(req).await {
            Err(SyncError::Connect(msg)) => assert!(msg.contains("localhost:4000"), "{msg}"),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("session opened"),
        }
        assert_eq!(backend.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn test_close_releases_stalled_requests() {
        let backend = MemoryBackend::new(None).with_behavior(BackendBehavior {
            stall: true,
            ..Default::default()
        });
        let (req, _) = request("alice", "x");
        let session = backend.open_session(req).await.unwrap();

        let stalled = session.clone();
        let pending = tokio::spawn(async move { stalled.preload_user("alice").await });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        session.close().await;
        let result = tokio::time::timeout(Duration::from_secs(5), pending).await;
        assert_eq!(result.unwrap().unwrap(), Err(SyncError::Closed));
    }

    #[tokio::test]
    async fn test_closed_session_refuses_work() {
        let backend = MemoryBackend::new(None);
        let (req, _) = request("alice", "x");
        let session = backend.open_session(req).await.unwrap();
        session.close().await;
        session.close().await;
        assert_eq!(backend.sessions_closed(), 1);
        assert_eq!(session.preload_user("alice").await, Err(SyncError::Closed));
    }
}
