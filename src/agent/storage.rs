//! On-disk session storage.
//!
//! Layout, rooted at `<base>/sessions/<sid>/`:
//!
//! ```text
//! session.json              # session metadata + message list
//! messages/<key>.json       # originals; written only for compressible messages
//! turns/<agent>-<NNN>.json  # one debug record per LLM turn
//! ```
//!
//! Writes go to a temp file then an atomic rename, so a crash mid-write
//! never leaves a half-written `session.json` behind.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::agent::message::{LLMTurn, Message, Session};
use crate::errors::ContextError;

/// Handle to the session storage root.
pub struct SessionStorage {
    base: PathBuf,
}

impl SessionStorage {
    /// Open (and create if needed) a storage root at `base`.
    pub fn new(base: impl Into<PathBuf>) -> Result<Self, ContextError> {
        let base = base.into();
        fs::create_dir_all(base.join("sessions"))
            .map_err(|e| ContextError::Storage(format!("create storage root: {}", e)))?;
        Ok(Self { base })
    }

    /// The `sessions/` directory under the storage root.
    pub fn sessions_root(&self) -> PathBuf {
        self.base.join("sessions")
    }

    fn session_dir(&self, sid: &str) -> PathBuf {
        self.sessions_root().join(sid)
    }

    /// Create the on-disk layout for a new session and persist its metadata.
    pub fn create_session(&self, session: &Session) -> Result<(), ContextError> {
        let dir = self.session_dir(&session.id);
        fs::create_dir_all(dir.join("messages"))
            .map_err(|e| ContextError::Storage(format!("create session dirs: {}", e)))?;
        fs::create_dir_all(dir.join("turns"))
            .map_err(|e| ContextError::Storage(format!("create session dirs: {}", e)))?;
        self.save_session(session)
    }

    /// Persist session metadata (idempotent overwrite).
    pub fn save_session(&self, session: &Session) -> Result<(), ContextError> {
        let path = self.session_dir(&session.id).join("session.json");
        write_json_atomic(&path, session)
    }

    /// Persist a message's original content. Called before compression so
    /// the preserved copy is always the full text.
    pub fn save_message_content(&self, sid: &str, msg: &Message) -> Result<PathBuf, ContextError> {
        let path = self
            .session_dir(sid)
            .join("messages")
            .join(format!("{}.json", msg.key));
        write_json_atomic(&path, msg)?;
        Ok(path)
    }

    /// Load a preserved original. The returned message is never marked
    /// compressed: it is the pre-compression content.
    pub fn load_message_content(&self, sid: &str, key: &str) -> Result<Message, ContextError> {
        let path = self
            .session_dir(sid)
            .join("messages")
            .join(format!("{}.json", key));
        let raw = fs::read_to_string(&path)
            .map_err(|e| ContextError::Storage(format!("read {}: {}", path.display(), e)))?;
        let mut msg: Message = serde_json::from_str(&raw)
            .map_err(|e| ContextError::Storage(format!("parse {}: {}", path.display(), e)))?;
        msg.compressed = false;
        msg.original_tokens = None;
        Ok(msg)
    }

    /// Persist one LLM turn record as `turns/<agent>-<NNN>.json`.
    ///
    /// `seq` is zero-padded to 3 digits for stable lexical sorting.
    pub fn save_turn(&self, sid: &str, turn: &LLMTurn, seq: u32) -> Result<PathBuf, ContextError> {
        let path = self
            .session_dir(sid)
            .join("turns")
            .join(format!("{}-{:03}.json", turn.agent, seq));
        write_json_atomic(&path, turn)?;
        Ok(path)
    }

    /// Load every `session.json` under the storage root, newest first.
    pub fn list_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = Vec::new();
        let entries = match fs::read_dir(self.sessions_root()) {
            Ok(e) => e,
            Err(_) => return sessions,
        };
        for entry in entries.flatten() {
            let meta_path = entry.path().join("session.json");
            if let Ok(raw) = fs::read_to_string(&meta_path) {
                if let Ok(session) = serde_json::from_str::<Session>(&raw) {
                    sessions.push(session);
                }
            }
        }
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        sessions
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), ContextError> {
    let contents = serde_json::to_string_pretty(value)
        .map_err(|e| ContextError::Storage(format!("serialize {}: {}", path.display(), e)))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents)
        .map_err(|e| ContextError::Storage(format!("write {}: {}", tmp.display(), e)))?;
    fs::rename(&tmp, path)
        .map_err(|e| ContextError::Storage(format!("rename {}: {}", path.display(), e)))
}
