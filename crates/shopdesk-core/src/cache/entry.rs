use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;

use super::{CacheKey, Tag};
use crate::api::QueryError;

/// Response payload shared between the cache and every awaiter.
pub type Payload = Arc<Value>;

/// Terminal result of one fetch.
pub type Outcome = Result<Payload, QueryError>;

pub type FetchFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, QueryError>> + Send + Sync>;
pub type ProvidesFn = Arc<dyn Fn(&Value) -> Vec<Tag> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Uninitialized,
    Pending,
    Fulfilled,
    Rejected,
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryStatus::Uninitialized => "uninitialized",
            QueryStatus::Pending => "pending",
            QueryStatus::Fulfilled => "fulfilled",
            QueryStatus::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// A cacheable read: its key, how to fetch it, and which tags the result provides.
///
/// The fetcher is kept on the entry so invalidation can refetch without the
/// caller that first requested it.
#[derive(Clone)]
pub struct Query {
    key: CacheKey,
    fetch: FetchFn,
    /// Tags known before the response arrives
    known: Vec<Tag>,
    provides: ProvidesFn,
}

impl Query {
    pub fn new<F, Fut>(key: CacheKey, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, QueryError>> + Send + 'static,
    {
        Self {
            key,
            fetch: Arc::new(move || fetch().boxed()),
            known: Vec::new(),
            provides: Arc::new(|_| Vec::new()),
        }
    }

    /// Tags known before the response arrives. A rejected fetch is indexed
    /// under these too, so invalidation still reaches it.
    pub fn provides(mut self, tags: Vec<Tag>) -> Self {
        self.known.extend(tags);
        self
    }

    /// Tags computed from the response, in addition to `provides`
    pub fn provides_with<F>(mut self, provides: F) -> Self
    where
        F: Fn(&Value) -> Vec<Tag> + Send + Sync + 'static,
    {
        self.provides = Arc::new(provides);
        self
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub(crate) fn fetch(&self) -> BoxFuture<'static, Result<Value, QueryError>> {
        (self.fetch)()
    }

    pub(crate) fn known_tags(&self) -> &[Tag] {
        &self.known
    }

    pub(crate) fn tags_for(&self, data: &Value) -> Vec<Tag> {
        let mut tags = self.known.clone();
        tags.extend((self.provides)(data));
        tags
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query").field("key", &self.key).finish_non_exhaustive()
    }
}

/// Point-in-time view of a cache entry, as handed to subscribers.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub key: CacheKey,
    pub status: QueryStatus,
    /// Latest fulfilled payload. Kept through later pending and rejected
    /// attempts so it can be shown while revalidating.
    pub data: Option<Payload>,
    pub error: Option<QueryError>,
    pub tags: Vec<Tag>,
    pub subscribers: usize,
    pub fulfilled_at: Option<DateTime<Utc>>,
    pub stale: bool,
}

impl EntrySnapshot {
    pub(crate) fn uninitialized(key: CacheKey) -> Self {
        Self {
            key,
            status: QueryStatus::Uninitialized,
            data: None,
            error: None,
            tags: Vec::new(),
            subscribers: 0,
            fulfilled_at: None,
            stale: false,
        }
    }

    /// First load in progress, nothing to show yet
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Pending && self.data.is_none()
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.status, QueryStatus::Fulfilled | QueryStatus::Rejected)
    }

    pub fn age_minutes(&self) -> Option<i64> {
        self.fulfilled_at
            .map(|at| (Utc::now() - at).num_minutes())
    }

    pub fn age_display(&self) -> String {
        let Some(minutes) = self.age_minutes() else {
            return "never".to_string();
        };
        if minutes < 1 {
            // Clock skew lands here too
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }
}
