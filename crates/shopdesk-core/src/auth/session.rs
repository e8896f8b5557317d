use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::store::DurableStore;

/// Storage key of the persisted session slice
pub const SESSION_STORAGE_KEY: &str = "session";

/// Bumped whenever the persisted layout changes; older slices are ignored.
const SLICE_VERSION: u32 = 1;

/// Opaque bearer credential. Never printed in full.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(<{} bytes>)", self.0.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: None,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }
}

/// Identity and credential always travel together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    pub identity: Identity,
    pub credential: Credential,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionData {
    pub fn new(identity: Identity, credential: Credential) -> Self {
        Self {
            identity,
            credential,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() > at)
    }

    pub fn time_until_expiry(&self) -> Option<Duration> {
        self.expires_at.map(|at| at - Utc::now())
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> Option<i64> {
        self.time_until_expiry().map(|d| d.num_minutes().max(0))
    }
}

/// The only piece of state written to durable storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSlice {
    pub version: u32,
    pub session: Option<SessionData>,
}

impl PersistedSlice {
    pub fn new(session: Option<SessionData>) -> Self {
        Self {
            version: SLICE_VERSION,
            session,
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let slice: PersistedSlice =
            serde_json::from_slice(bytes).context("Failed to parse session slice")?;
        if slice.version != SLICE_VERSION {
            bail!("Unsupported session slice version {}", slice.version);
        }
        if let Some(ref data) = slice.session {
            if data.identity.user_id.trim().is_empty() {
                bail!("Session slice has an empty user id");
            }
            if data.credential.as_str().trim().is_empty() {
                bail!("Session slice has an empty credential");
            }
        }
        Ok(slice)
    }
}

struct SessionInner {
    state: RwLock<Option<SessionData>>,
    store: Arc<dyn DurableStore>,
    storage_key: String,
    /// Serializes slice writes so the last write always reflects the latest state
    write_lock: tokio::sync::Mutex<()>,
}

/// Current credential and identity, backed by durable storage.
///
/// Clone is cheap; every clone sees the same state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(store: Arc<dyn DurableStore>, storage_key: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                state: RwLock::new(None),
                store,
                storage_key: storage_key.into(),
                write_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Restore the persisted slice. Returns whether a session was restored.
    ///
    /// Unreadable, outdated or expired slices leave the session logged out.
    /// A session established before this call is never overwritten.
    pub async fn rehydrate(&self) -> bool {
        let key = &self.inner.storage_key;
        let bytes = match self.inner.store.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("No persisted session");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read persisted session, starting logged out");
                return false;
            }
        };

        let data = match PersistedSlice::decode(&bytes) {
            Ok(slice) => slice.session,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable session slice");
                if let Err(e) = self.inner.store.remove(key).await {
                    warn!(error = %e, "Failed to remove unreadable session slice");
                }
                return false;
            }
        };

        let Some(data) = data.filter(|d| !d.is_expired()) else {
            debug!("Persisted session absent or expired");
            return false;
        };

        let mut state = self.inner.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.is_some() {
            debug!("Session established before rehydration, keeping it");
            return false;
        }
        info!(user_id = %data.identity.user_id, "Session restored");
        *state = Some(data);
        true
    }

    pub async fn login(&self, identity: Identity, credential: Credential) -> Result<()> {
        self.start(SessionData::new(identity, credential)).await
    }

    /// Replace the whole session atomically, then persist it.
    pub async fn start(&self, data: SessionData) -> Result<()> {
        info!(user_id = %data.identity.user_id, "Logged in");
        self.replace(Some(data));
        self.persist().await
    }

    /// Swap in a new credential for the current identity.
    pub async fn refresh_credential(
        &self,
        credential: Credential,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        {
            let mut state = self.inner.state.write().unwrap_or_else(PoisonError::into_inner);
            let Some(data) = state.as_mut() else {
                bail!("Cannot refresh credential while logged out");
            };
            data.credential = credential;
            data.expires_at = expires_at;
            debug!(user_id = %data.identity.user_id, "Credential refreshed");
        }
        self.persist().await
    }

    pub async fn logout(&self) -> Result<()> {
        self.clear();
        self.persist().await
    }

    /// Clear in-memory state only. Returns the session that was active.
    pub(crate) fn clear(&self) -> Option<SessionData> {
        let previous = self.replace(None);
        if let Some(ref data) = previous {
            info!(user_id = %data.identity.user_id, "Logged out");
        }
        previous
    }

    fn replace(&self, data: Option<SessionData>) -> Option<SessionData> {
        let mut state = self.inner.state.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *state, data)
    }

    /// Write the slice for whatever the state is when the write lock is acquired.
    pub(crate) async fn persist(&self) -> Result<()> {
        let _guard = self.inner.write_lock.lock().await;
        let slice = PersistedSlice::new(self.current_raw());
        let bytes = serde_json::to_vec(&slice).context("Failed to serialize session slice")?;
        self.inner
            .store
            .set(&self.inner.storage_key, &bytes)
            .await
            .context("Failed to persist session")
    }

    fn current_raw(&self) -> Option<SessionData> {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Active session, if any and not expired
    pub fn current(&self) -> Option<SessionData> {
        self.current_raw().filter(|d| !d.is_expired())
    }

    pub fn credential(&self) -> Option<Credential> {
        self.current().map(|d| d.credential)
    }

    pub fn identity(&self) -> Option<Identity> {
        self.current().map(|d| d.identity)
    }

    pub fn is_authenticated(&self) -> bool {
        self.current().is_some()
    }
}
