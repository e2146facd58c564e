#![forbid(unsafe_code)]

// Sync backend collaborator - the client-side capability a worker drives.
//
// The wire protocol lives outside this crate. Workers only need to open an
// authenticated session, preload the user record, run mutations inside a
// transaction, and read back committed data.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use url::Url;

pub use memory::{BackendBehavior, MemoryBackend};

/// Protocol version advertised in the connect URI
pub const SYNC_PROTOCOL_VERSION: u32 = 7;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("mutation rejected {code}")]
    Rejected { code: u16 },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("session closed")]
    Closed,

    #[error("connection failed: {0}")]
    Connect(String),
}

/// Out-of-band notifications delivered by a live session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    MutationRejected { code: u16 },
    ClientTooOld,
}

impl SessionNotice {
    pub fn describe(&self) -> String {
        match self {
            SessionNotice::MutationRejected { code } => format!("mutation rejected {code}"),
            SessionNotice::ClientTooOld => "client too old".to_string(),
        }
    }
}

pub type NoticeHandler = Arc<dyn Fn(SessionNotice) + Send + Sync>;

/// Everything a backend needs to open a session for one simulated user
#[derive(Clone)]
pub struct SessionRequest {
    pub user_id: String,
    pub uri: Url,
    pub on_notice: NoticeHandler,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub email: String,
    pub color: String,
    pub locale: Option<String>,
    pub flags: String,
    pub created_at: u64,
    pub updated_at: u64,
}

impl UserRecord {
    /// Default record inserted for a simulated user on first connect
    pub fn for_worker(worker_id: &str, now_ms: u64) -> Self {
        Self {
            id: worker_id.to_string(),
            name: "Test User".to_string(),
            email: format!("{worker_id}@example.com"),
            color: "salmon".to_string(),
            locale: None,
            flags: String::new(),
            created_at: now_ms,
            updated_at: now_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub shared: bool,
    pub shared_link_type: String,
    pub published: bool,
    pub published_slug: String,
    pub is_empty: bool,
    pub is_deleted: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl FileRecord {
    pub fn new_for_owner(file_id: &str, owner_id: &str, published_slug: String, now_ms: u64) -> Self {
        Self {
            id: file_id.to_string(),
            name: "name".to_string(),
            owner_id: owner_id.to_string(),
            shared: true,
            shared_link_type: "edit".to_string(),
            published: true,
            published_slug,
            is_empty: true,
            is_deleted: false,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    InsertUser(UserRecord),
    InsertFile(FileRecord),
}

#[async_trait]
pub trait SyncBackend: Send + Sync {
    async fn open_session(&self, request: SessionRequest) -> Result<Arc<dyn SyncSession>, SyncError>;
}

#[async_trait]
pub trait SyncSession: Send + Sync {
    /// Resolves once the session has observed the user's record (or its absence).
    async fn preload_user(&self, user_id: &str) -> Result<Option<UserRecord>, SyncError>;

    /// Applies all mutations atomically; either every one commits or none does.
    async fn run_transaction(&self, mutations: Vec<Mutation>) -> Result<(), SyncError>;

    /// Reads the local committed replica.
    fn committed_file(&self, file_id: &str) -> Option<FileRecord>;

    async fn close(&self);
}

/// Builds the connect URI for a worker session.
///
/// `{origin}/app/{worker_id}/connect?accessToken=..&sessionId=..&protocolVersion=..`
pub fn session_uri(origin: &str, worker_id: &str, access_token: &str) -> Result<Url, url::ParseError> {
    let mut uri = Url::parse(origin)?;
    uri.set_path(&format!("/app/{worker_id}/connect"));
    uri.query_pairs_mut()
        .clear()
        .append_pair("accessToken", access_token)
        .append_pair("sessionId", worker_id)
        .append_pair("protocolVersion", &SYNC_PROTOCOL_VERSION.to_string());
    Ok(uri)
}

/// Extracts the `accessToken` query parameter from a connect URI.
pub fn access_token_from_uri(uri: &Url) -> Option<String> {
    uri.query_pairs()
        .find(|(k, _)| k == "accessToken")
        .map(|(_, v)| v.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_uri_layout() {
        let uri = session_uri("https://sync.example.com/ignored?x=1", "t1-0", "secret:t1-0").unwrap();
        assert_eq!(uri.path(), "/app/t1-0/connect");
        assert_eq!(uri.host_str(), Some("sync.example.com"));
        assert_eq!(access_token_from_uri(&uri).as_deref(), Some("secret:t1-0"));
        assert!(uri.query().unwrap().contains("sessionId=t1-0"));
        assert!(!uri.query().unwrap().contains("x=1"));
    }

    #[test]
    fn test_session_uri_rejects_garbage_origin() {
        assert!(session_uri("not a url", "w", "t").is_err());
    }

    #[test]
    fn test_default_user_record() {
        let user = UserRecord::for_worker("t1-3", 5);
        assert_eq!(user.email, "t1-3@example.com");
        assert_eq!(user.name, "Test User");
        assert_eq!(user.created_at, 5);
    }
}
