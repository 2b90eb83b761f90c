//! Durable session persistence: one JSON document per session.
//!
//! Saves are atomic from a reader's perspective: the document is written to a
//! temporary file in the same directory and renamed over the target. Writers
//! for the same session serialize behind a per-key async mutex.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use gateway_protocol::Exchange;
use gateway_protocol::SessionMode;
use gateway_protocol::SessionOptions;
use gateway_protocol::SessionState;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::session::Session;

/// Serialized form of a [`Session`]. Strict schema: unknown fields are
/// stripped on load.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    session_id: String,
    mode: SessionMode,
    state: SessionState,
    created_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
    message_history: Vec<Exchange>,
    options: SessionOptions,
    #[serde(default)]
    agent_context: HashMap<String, Value>,
    #[serde(default)]
    workspace_uri: Option<String>,
}

impl From<&Session> for SessionRecord {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            mode: session.mode,
            state: session.state,
            created_at: session.created_at,
            last_active_at: session.last_active_at,
            // Deep copy so later in-memory mutation cannot alias the
            // document being written.
            message_history: session.message_history.clone(),
            options: session.options.clone(),
            agent_context: session.agent_context.clone(),
            workspace_uri: session.workspace_uri.clone(),
        }
    }
}

impl From<SessionRecord> for Session {
    fn from(record: SessionRecord) -> Self {
        Session {
            id: record.session_id,
            mode: record.mode,
            state: record.state,
            created_at: record.created_at,
            last_active_at: record.last_active_at.max(record.created_at),
            message_history: record.message_history,
            options: record.options,
            agent_context: record.agent_context,
            workspace_uri: record.workspace_uri,
            history_replayed: false,
        }
    }
}

pub struct SessionStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    pub async fn save(&self, session: &Session) -> Result<()> {
        let lock = self.lock_for(&session.id).await;
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(&self.dir).await?;
        let record = SessionRecord::from(session);
        let json = serde_json::to_vec_pretty(&record)?;
        let target = self.path_for(&session.id);
        let dir = self.dir.clone();

        // NamedTempFile + persist is a rename within one directory, so a
        // concurrent reader sees either the old document or the new one.
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&json)?;
            tmp.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await??;

        debug!(session_id = %session.id, "session saved");
        Ok(())
    }

    pub async fn load(&self, session_id: &str) -> Result<Option<Session>> {
        let path = self.path_for(session_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: SessionRecord = serde_json::from_slice(&bytes)?;
        Ok(Some(record.into()))
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub async fn delete(&self, session_id: &str) -> Result<()> {
        let lock = self.lock_for(session_id).await;
        let _guard = lock.lock().await;
        match tokio::fs::remove_file(self.path_for(session_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
