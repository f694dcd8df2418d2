//! Session secrets and cookie jars.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taxmirror_core::{Cookie, Session};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::StoreError;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Credentials plus the last persisted cookie jar, or `NotFound`.
    async fn get(&self, session_id: Uuid) -> Result<Session, StoreError>;

    /// Fully replace the cookie jar. A jar captured before the one already
    /// stored is discarded so the latest completed call always wins.
    async fn put(
        &self,
        session_id: Uuid,
        cookies: &[Cookie],
        captured_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn save(&self, session: &Session) -> Result<(), StoreError>;

    async fn list_active(&self) -> Result<Vec<Session>, StoreError>;
}

fn apply_cookie_write(session: &mut Session, cookies: &[Cookie], captured_at: DateTime<Utc>) -> bool {
    if let Some(current) = session.cookies_updated_at {
        if captured_at < current {
            return false;
        }
    }
    session.cookies = Some(cookies.to_vec());
    session.cookies_updated_at = Some(captured_at);
    session.last_accessed_at = Some(captured_at);
    true
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    sessions: Mutex<HashMap<Uuid, Session>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sessions(sessions: impl IntoIterator<Item = Session>) -> Self {
        Self {
            sessions: Mutex::new(sessions.into_iter().map(|s| (s.id, s)).collect()),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, session_id: Uuid) -> Result<Session, StoreError> {
        self.sessions
            .lock()
            .await
            .get(&session_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("session", session_id))
    }

    async fn put(
        &self,
        session_id: Uuid,
        cookies: &[Cookie],
        captured_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(&session_id)
            .ok_or_else(|| StoreError::not_found("session", session_id))?;
        if !apply_cookie_write(session, cookies, captured_at) {
            debug!(%session_id, "discarding cookie jar older than the stored one");
        }
        Ok(())
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        self.sessions.lock().await.insert(session.id, session.clone());
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<Session>, StoreError> {
        let mut active: Vec<Session> = self
            .sessions
            .lock()
            .await
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect();
        active.sort_by_key(|s| s.id);
        Ok(active)
    }
}

/// One JSON document per session under a directory, written by temp-file rename.
#[derive(Debug)]
pub struct FileCredentialStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, session_id: Uuid) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    async fn read_session(&self, session_id: Uuid) -> Result<Session, StoreError> {
        let path = self.session_path(session_id);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::not_found("session", session_id));
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_str(&text)?)
    }

    async fn write_session(&self, session: &Session) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.session_path(session.id);
        let temp_path = self.dir.join(format!(".{}.{}.tmp", session.id, Uuid::new_v4()));
        let bytes = serde_json::to_vec_pretty(session)?;

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self, session_id: Uuid) -> Result<Session, StoreError> {
        self.read_session(session_id).await
    }

    async fn put(
        &self,
        session_id: Uuid,
        cookies: &[Cookie],
        captured_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut session = self.read_session(session_id).await?;
        if apply_cookie_write(&mut session, cookies, captured_at) {
            self.write_session(&session).await?;
            debug!(%session_id, cookies = cookies.len(), "persisted cookie jar");
        } else {
            debug!(%session_id, "discarding cookie jar older than the stored one");
        }
        Ok(())
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.write_session(session).await
    }

    async fn list_active(&self) -> Result<Vec<Session>, StoreError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .await
                .map_err(StoreError::from)
                .and_then(|text| serde_json::from_str::<Session>(&text).map_err(StoreError::from));
            match parsed {
                Ok(session) if session.active => sessions.push(session),
                Ok(_) => {}
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable session file"),
            }
        }
        sessions.sort_by_key(|s| s.id);
        Ok(sessions)
    }
}
