//! Session persistence: checkpoint blobs and message history per session.
//!
//! [`SessionStore`] is the persistence seam. [`FileSessionStore`] gives each
//! session its own directory:
//!
//! ```text
//! sessions_dir/
//!   ses-19a2f3c4b1-0001/
//!     manifest.json
//!     checkpoint.json
//!     messages.json
//! ```
//!
//! Every file is written atomically (temp file, then rename), so a reader
//! sees either the previous or the new version. Writes to one session are
//! serialized inside the process; the last write wins.
//! [`MemorySessionStore`] keeps the same data in process memory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{AgentError, Message, MessageRole};

/// Status of a session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Interrupted,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Session-keyed persistence for one checkpoint blob and the message history.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The saved checkpoint, or `None` when the session has none.
    async fn get_checkpoint(&self, session_id: &str) -> Result<Option<Value>, AgentError>;

    /// Replace the session's checkpoint.
    async fn set_checkpoint(&self, session_id: &str, checkpoint: &Value) -> Result<(), AgentError>;

    async fn delete_checkpoint(&self, session_id: &str) -> Result<(), AgentError>;

    async fn get_messages(&self, session_id: &str) -> Result<Option<Vec<Message>>, AgentError>;

    async fn set_messages(&self, session_id: &str, messages: &[Message]) -> Result<(), AgentError>;

    async fn mark_status(&self, session_id: &str, status: SessionStatus) -> Result<(), AgentError>;
}

/// Reject ids that could escape the sessions directory.
pub fn validate_session_id(session_id: &str) -> Result<(), AgentError> {
    let valid = !session_id.is_empty()
        && session_id.len() <= 128
        && !session_id.starts_with('.')
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(AgentError::InvalidSessionId(session_id.to_string()))
    }
}

/// First ~200 characters of the first user message.
pub fn extract_message_preview(messages: &[Message]) -> String {
    messages
        .iter()
        .find(|m| m.role == MessageRole::User)
        .map(|m| m.text().chars().take(200).collect())
        .unwrap_or_default()
}

// ── SessionManifest ────────────────────────────────────────────────

/// Lightweight metadata for a session, stored as `manifest.json`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionManifest {
    pub session_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub has_checkpoint: bool,
    #[serde(default)]
    pub message_count: usize,
    /// First ~200 chars of the first user message.
    #[serde(default)]
    pub message_preview: String,
}

impl SessionManifest {
    fn new(session_id: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            status: SessionStatus::Running,
            created_at: now,
            updated_at: now,
            has_checkpoint: false,
            message_count: 0,
            message_preview: String::new(),
        }
    }
}

// ── FileSessionStore ───────────────────────────────────────────────

const MANIFEST_FILE: &str = "manifest.json";
const CHECKPOINT_FILE: &str = "checkpoint.json";
const MESSAGES_FILE: &str = "messages.json";

/// Directory-per-session store on the local filesystem.
#[derive(Debug)]
pub struct FileSessionStore {
    sessions_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileSessionStore {
    /// Create a store, ensuring the root sessions directory exists.
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Result<Self, AgentError> {
        let sessions_dir = sessions_dir.into();
        std::fs::create_dir_all(&sessions_dir)?;
        Ok(Self {
            sessions_dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.sessions_dir
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf, AgentError> {
        validate_session_id(session_id)?;
        Ok(self.sessions_dir.join(session_id))
    }

    fn lock_for(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        locks.entry(session_id.to_string()).or_default().clone()
    }

    /// Atomic write: serialize to a temp file, then rename into place.
    async fn write_json<T: Serialize + ?Sized>(dir: &Path, file: &str, value: &T) -> Result<(), AgentError> {
        tokio::fs::create_dir_all(dir).await?;
        let final_path = dir.join(file);
        let tmp_path = dir.join(format!(".{file}.tmp"));
        let json = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&tmp_path, json)
            .await
            .map_err(|e| AgentError::Persistence(format!("write {}: {e}", tmp_path.display())))?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| AgentError::Persistence(format!("rename {}: {e}", final_path.display())))?;
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, AgentError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load a session's manifest. `None` if the session doesn't exist.
    pub async fn load_manifest(&self, session_id: &str) -> Result<Option<SessionManifest>, AgentError> {
        let dir = self.session_dir(session_id)?;
        Self::read_json(&dir.join(MANIFEST_FILE)).await
    }

    /// Read-modify-write the manifest. Caller holds the session lock.
    async fn update_manifest(
        &self,
        dir: &Path,
        session_id: &str,
        update: impl FnOnce(&mut SessionManifest),
    ) -> Result<(), AgentError> {
        let mut manifest = Self::read_json::<SessionManifest>(&dir.join(MANIFEST_FILE))
            .await?
            .unwrap_or_else(|| SessionManifest::new(session_id));
        update(&mut manifest);
        manifest.updated_at = Utc::now();
        Self::write_json(dir, MANIFEST_FILE, &manifest).await
    }

    /// All sessions with a readable manifest, most recently updated first.
    pub async fn list_sessions(&self) -> Result<Vec<SessionManifest>, AgentError> {
        let mut entries = tokio::fs::read_dir(&self.sessions_dir).await?;
        let mut manifests = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await.is_ok_and(|ft| ft.is_dir()) {
                continue;
            }
            let path = entry.path().join(MANIFEST_FILE);
            match Self::read_json::<SessionManifest>(&path).await {
                Ok(Some(m)) => manifests.push(m),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable manifest at {}: {e}", path.display()),
            }
        }
        manifests.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(manifests)
    }

    /// Delete the entire session directory.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), AgentError> {
        let dir = self.session_dir(session_id)?;
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn get_checkpoint(&self, session_id: &str) -> Result<Option<Value>, AgentError> {
        let dir = self.session_dir(session_id)?;
        Self::read_json(&dir.join(CHECKPOINT_FILE)).await
    }

    async fn set_checkpoint(&self, session_id: &str, checkpoint: &Value) -> Result<(), AgentError> {
        let dir = self.session_dir(session_id)?;
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;
        Self::write_json(&dir, CHECKPOINT_FILE, checkpoint).await?;
        self.update_manifest(&dir, session_id, |m| m.has_checkpoint = true)
            .await?;
        debug!(session_id, "Checkpoint written");
        Ok(())
    }

    async fn delete_checkpoint(&self, session_id: &str) -> Result<(), AgentError> {
        let dir = self.session_dir(session_id)?;
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;
        match tokio::fs::remove_file(dir.join(CHECKPOINT_FILE)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        self.update_manifest(&dir, session_id, |m| m.has_checkpoint = false)
            .await
    }

    async fn get_messages(&self, session_id: &str) -> Result<Option<Vec<Message>>, AgentError> {
        let dir = self.session_dir(session_id)?;
        Self::read_json(&dir.join(MESSAGES_FILE)).await
    }

    async fn set_messages(&self, session_id: &str, messages: &[Message]) -> Result<(), AgentError> {
        let dir = self.session_dir(session_id)?;
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;
        Self::write_json(&dir, MESSAGES_FILE, messages).await?;
        let preview = extract_message_preview(messages);
        self.update_manifest(&dir, session_id, |m| {
            m.message_count = messages.len();
            if m.message_preview.is_empty() {
                m.message_preview = preview;
            }
        })
        .await
    }

    async fn mark_status(&self, session_id: &str, status: SessionStatus) -> Result<(), AgentError> {
        let dir = self.session_dir(session_id)?;
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;
        self.update_manifest(&dir, session_id, |m| m.status = status)
            .await
    }
}

// ── MemorySessionStore ─────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
struct MemoryEntry {
    checkpoint: Option<Value>,
    messages: Option<Vec<Message>>,
    status: Option<SessionStatus>,
}

/// In-process store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_sessions<R>(&self, f: impl FnOnce(&mut HashMap<String, MemoryEntry>) -> R) -> R {
        let mut guard = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn status(&self, session_id: &str) -> Option<SessionStatus> {
        self.with_sessions(|s| s.get(session_id).and_then(|e| e.status))
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.with_sessions(|s| s.keys().cloned().collect());
        ids.sort();
        ids
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_checkpoint(&self, session_id: &str) -> Result<Option<Value>, AgentError> {
        Ok(self.with_sessions(|s| s.get(session_id).and_then(|e| e.checkpoint.clone())))
    }

    async fn set_checkpoint(&self, session_id: &str, checkpoint: &Value) -> Result<(), AgentError> {
        validate_session_id(session_id)?;
        self.with_sessions(|s| {
            s.entry(session_id.to_string()).or_default().checkpoint = Some(checkpoint.clone());
        });
        Ok(())
    }

    async fn delete_checkpoint(&self, session_id: &str) -> Result<(), AgentError> {
        self.with_sessions(|s| {
            if let Some(e) = s.get_mut(session_id) {
                e.checkpoint = None;
            }
        });
        Ok(())
    }

    async fn get_messages(&self, session_id: &str) -> Result<Option<Vec<Message>>, AgentError> {
        Ok(self.with_sessions(|s| s.get(session_id).and_then(|e| e.messages.clone())))
    }

    async fn set_messages(&self, session_id: &str, messages: &[Message]) -> Result<(), AgentError> {
        validate_session_id(session_id)?;
        self.with_sessions(|s| {
            s.entry(session_id.to_string()).or_default().messages = Some(messages.to_vec());
        });
        Ok(())
    }

    async fn mark_status(&self, session_id: &str, status: SessionStatus) -> Result<(), AgentError> {
        validate_session_id(session_id)?;
        self.with_sessions(|s| {
            s.entry(session_id.to_string()).or_default().status = Some(status);
        });
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn checkpoint_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path()).unwrap();

        store.set_checkpoint("ses-a", &json!({"step": 3})).await.unwrap();
        store.set_checkpoint("ses-a", &json!({"step": 6})).await.unwrap();
        let cp = store.get_checkpoint("ses-a").await.unwrap().unwrap();
        assert_eq!(cp["step"], 6);

        let manifest = store.load_manifest("ses-a").await.unwrap().unwrap();
        assert!(manifest.has_checkpoint);
        assert_eq!(manifest.status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn missing_session_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path()).unwrap();
        assert!(store.get_checkpoint("nope").await.unwrap().is_none());
        assert!(store.get_messages("nope").await.unwrap().is_none());
        assert!(store.load_manifest("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path()).unwrap();
        for bad in ["../etc", "a/b", "", ".hidden", "a b"] {
            let err = store.set_checkpoint(bad, &json!({})).await.unwrap_err();
            assert!(matches!(err, AgentError::InvalidSessionId(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn messages_update_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path()).unwrap();
        let msgs = vec![
            Message::system("sys"),
            Message::user("Create an About page for the bakery"),
            Message::assistant_text("Done."),
        ];
        store.set_messages("ses-m", &msgs).await.unwrap();
        store
            .mark_status("ses-m", SessionStatus::Completed)
            .await
            .unwrap();

        let loaded = store.get_messages("ses-m").await.unwrap().unwrap();
        assert_eq!(loaded, msgs);

        let manifest = store.load_manifest("ses-m").await.unwrap().unwrap();
        assert_eq!(manifest.message_count, 3);
        assert!(manifest.message_preview.starts_with("Create an About page"));
        assert_eq!(manifest.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path()).unwrap();
        store.set_checkpoint("ses-t", &json!({})).await.unwrap();
        let session_dir = dir.path().join("ses-t");
        assert!(session_dir.join(CHECKPOINT_FILE).exists());
        assert!(!session_dir.join(".checkpoint.json.tmp").exists());
        assert!(!session_dir.join(".manifest.json.tmp").exists());
    }

    #[tokio::test]
    async fn list_and_delete_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path()).unwrap();
        store.mark_status("ses-1", SessionStatus::Running).await.unwrap();
        store
            .mark_status("ses-2", SessionStatus::Interrupted)
            .await
            .unwrap();
        std::fs::create_dir(dir.path().join("not-a-session")).unwrap();

        let sessions = store.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, "ses-2");

        store.delete_checkpoint("ses-1").await.unwrap();
        store.delete_session("ses-1").await.unwrap();
        store.delete_session("ses-1").await.unwrap();
        assert_eq!(store.list_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_writes_to_one_session_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileSessionStore::new(dir.path()).unwrap());
        let writes = (0..8).map(|i| {
            let store = store.clone();
            async move { store.set_checkpoint("ses-c", &json!({"step": i})).await }
        });
        for r in futures::future::join_all(writes).await {
            r.unwrap();
        }
        let cp = store.get_checkpoint("ses-c").await.unwrap().unwrap();
        assert!(cp["step"].as_u64().unwrap() < 8);
    }

    #[tokio::test]
    async fn memory_store_behaves_like_file_store() {
        let store = MemorySessionStore::new();
        assert!(store.get_checkpoint("s").await.unwrap().is_none());
        store.set_checkpoint("s", &json!({"step": 1})).await.unwrap();
        store.mark_status("s", SessionStatus::Interrupted).await.unwrap();
        assert_eq!(store.status("s"), Some(SessionStatus::Interrupted));
        store.delete_checkpoint("s").await.unwrap();
        assert!(store.get_checkpoint("s").await.unwrap().is_none());
        assert_eq!(store.session_ids(), vec!["s"]);
    }

    #[test]
    fn status_serde() {
        let json = serde_json::to_string(&SessionStatus::Interrupted).unwrap();
        assert_eq!(json, "\"interrupted\"");
    }
}
