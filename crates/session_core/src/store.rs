//! Where the session lives: the auth token and the cached user record.

use std::{fs, io, path::PathBuf};

use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use shared::domain::UserRecord;
use tracing::warn;

/// Session state injected into a [`SessionController`](crate::SessionController).
///
/// Writers are last-writer-wins. An empty token is the same as no token.
pub trait SessionStore: Send + Sync {
    fn token(&self) -> Option<String>;
    fn store_token(&self, token: &str);
    fn clear_token(&self);
    fn user(&self) -> Option<UserRecord>;
    fn store_user(&self, user: UserRecord);
    fn clear_user(&self);
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    token: RwLock<Option<String>>,
    user: RwLock<Option<UserRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let store = Self::default();
        store.store_token(&token.into());
        store
    }
}

impl SessionStore for MemorySessionStore {
    fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    fn store_token(&self, token: &str) {
        *self.token.write() = non_empty(token);
    }

    fn clear_token(&self) {
        *self.token.write() = None;
    }

    fn user(&self) -> Option<UserRecord> {
        self.user.read().clone()
    }

    fn store_user(&self, user: UserRecord) {
        *self.user.write() = Some(user);
    }

    fn clear_user(&self) {
        *self.user.write() = None;
    }
}

/// Keeps the token in a file so it outlives the process. The user record is
/// only cached in memory and gets re-fetched with the persisted token.
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
    token: RwLock<Option<String>>,
    user: RwLock<Option<UserRecord>>,
    file: Mutex<()>,
}

impl FileSessionStore {
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let token = match fs::read_to_string(&path) {
            Ok(raw) => non_empty(raw.trim()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read token file '{}'", path.display()))
            }
        };

        Ok(Self {
            path,
            token: RwLock::new(token),
            user: RwLock::new(None),
            file: Mutex::new(()),
        })
    }

    /// Writes the in-memory token to disk. Runs after the token lock is
    /// released; the file lock orders writers so the file ends up holding
    /// the latest token.
    fn sync_file(&self) {
        let _file = self.file.lock();
        let token = self.token.read().clone();
        if let Err(err) = self.persist(token.as_deref()) {
            warn!(path = %self.path.display(), error = %err, "failed to persist session token");
        }
    }

    fn persist(&self, token: Option<&str>) -> io::Result<()> {
        match token {
            Some(token) => {
                if let Some(parent) = self.path.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent)?;
                    }
                }
                fs::write(&self.path, token)
            }
            None => match fs::remove_file(&self.path) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
                _ => Ok(()),
            },
        }
    }
}

impl SessionStore for FileSessionStore {
    fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    fn store_token(&self, token: &str) {
        *self.token.write() = non_empty(token);
        self.sync_file();
    }

    fn clear_token(&self) {
        *self.token.write() = None;
        self.sync_file();
    }

    fn user(&self) -> Option<UserRecord> {
        self.user.read().clone()
    }

    fn store_user(&self, user: UserRecord) {
        *self.user.write() = Some(user);
    }

    fn clear_user(&self) {
        *self.user.write() = None;
    }
}

fn non_empty(token: &str) -> Option<String> {
    (!token.is_empty()).then(|| token.to_string())
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
