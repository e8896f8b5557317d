use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use tracing::{debug, info};

use super::{Credential, Session};
use crate::api::Endpoint;
use crate::cache::{Tag, WeakRequestCache};

/// Kind of the implicit tag every user-scoped query is indexed under, so
/// sign-out reaches entries that declare no tags of their own.
pub const USER_SCOPE_KIND: &str = "__user";

/// Tag kinds whose cached data belongs to the signed-in user.
#[derive(Debug, Clone, Default)]
pub struct UserScopes {
    kinds: Arc<RwLock<BTreeSet<String>>>,
}

impl UserScopes {
    /// Record the tag kinds of a user-scoped endpoint.
    pub fn register(&self, endpoint: &Endpoint) {
        if !endpoint.is_user_scoped() {
            return;
        }
        let mut kinds = self.kinds.write().unwrap_or_else(PoisonError::into_inner);
        for kind in endpoint.tag_kinds() {
            if !kinds.contains(kind) {
                debug!(kind, endpoint = endpoint.name(), "User-scoped tag kind registered");
                kinds.insert(kind.to_string());
            }
        }
    }

    pub fn kinds(&self) -> Vec<String> {
        let kinds = self.kinds.read().unwrap_or_else(PoisonError::into_inner);
        kinds.iter().cloned().collect()
    }

    /// The implicit user scope plus one wildcard tag per registered kind
    pub fn tags(&self) -> Vec<Tag> {
        let mut tags = vec![Tag::all(USER_SCOPE_KIND)];
        tags.extend(self.kinds().into_iter().map(Tag::all));
        tags
    }

    /// Tags a query of `endpoint` carries before any response arrives.
    pub fn scope_tags(endpoint: &Endpoint) -> Vec<Tag> {
        if endpoint.is_user_scoped() {
            vec![Tag::all(USER_SCOPE_KIND)]
        } else {
            Vec::new()
        }
    }
}

/// Ends the session and drops every user-scoped cache entry.
#[derive(Clone)]
pub struct SessionExpiry {
    session: Session,
    cache: WeakRequestCache,
    scopes: UserScopes,
}

impl SessionExpiry {
    pub fn new(session: Session, cache: WeakRequestCache, scopes: UserScopes) -> Self {
        Self {
            session,
            cache,
            scopes,
        }
    }

    pub fn scopes(&self) -> &UserScopes {
        &self.scopes
    }

    /// Clear the session, invalidate user-scoped tags, persist the cleared slice.
    ///
    /// The in-memory session is cleared before invalidation so every refetch
    /// it triggers goes out without a credential.
    pub async fn sign_out(&self) -> Result<()> {
        self.session.clear();
        self.invalidate_user_scoped();
        self.session.persist().await
    }

    /// Forced sign-out after the server rejected `attached`.
    ///
    /// Does nothing when the session has moved on to another credential since
    /// the request went out. Returns whether the session was ended.
    pub async fn expire(&self, attached: Option<&Credential>) -> Result<bool> {
        let Some(attached) = attached else {
            return Ok(false);
        };
        if self.session.credential().as_ref() != Some(attached) {
            debug!("Ignoring 401 for a superseded credential");
            return Ok(false);
        }
        info!("Credential rejected by server, signing out");
        self.sign_out().await?;
        Ok(true)
    }

    /// Mark every user-scoped entry stale. Returns how many entries were hit.
    pub fn invalidate_user_scoped(&self) -> usize {
        let Some(cache) = self.cache.upgrade() else {
            return 0;
        };
        let tags = self.scopes.tags();
        cache.invalidate(&tags).len()
    }
}
