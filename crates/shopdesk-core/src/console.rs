//! Process-wide entry point tying the session, cache and dispatcher together.
//!
//! A `Console` only exists after the persisted session has been read back, so
//! no query can go out before rehydration has finished.

use std::sync::Arc;

use anyhow::Result;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::api::{DispatchConfig, Dispatcher, Endpoint, EndpointKind, QueryError};
use crate::auth::{
    Credential, Identity, Session, SessionData, SessionExpiry, UserScopes, SESSION_STORAGE_KEY,
};
use crate::cache::{CacheConfig, CacheKey, EntrySnapshot, Outcome, Query, RequestCache};
use crate::store::DurableStore;

#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    pub cache: CacheConfig,
    pub dispatch: DispatchConfig,
    /// Storage key of the persisted session slice
    pub storage_key: String,
}

impl ConsoleConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            cache: CacheConfig::default(),
            dispatch: DispatchConfig::new(base_url),
            storage_key: SESSION_STORAGE_KEY.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct Console {
    session: Session,
    cache: RequestCache,
    dispatcher: Dispatcher,
    expiry: SessionExpiry,
}

impl Console {
    /// Restore the persisted session, then build the cache and dispatcher.
    pub async fn init(config: ConsoleConfig, store: Arc<dyn DurableStore>) -> Result<Self> {
        let session = Session::new(store, config.storage_key);
        let restored = session.rehydrate().await;

        let cache = RequestCache::new(config.cache);
        let expiry = SessionExpiry::new(session.clone(), cache.downgrade(), UserScopes::default());
        let dispatcher = Dispatcher::new(config.dispatch, session.clone(), expiry.clone())?;

        info!(
            restored,
            base_url = %dispatcher.base_url(),
            "Console ready"
        );
        Ok(Self {
            session,
            cache,
            dispatcher,
            expiry,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn cache(&self) -> &RequestCache {
        &self.cache
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Build the cacheable query for one call of a query endpoint.
    pub fn query<A>(&self, endpoint: &Endpoint, args: &A) -> Result<Query, QueryError>
    where
        A: Serialize + ?Sized,
    {
        if endpoint.kind() != EndpointKind::Query {
            return Err(QueryError::Validation(format!(
                "{} is a mutation and cannot be cached",
                endpoint.name()
            )));
        }
        self.expiry.scopes().register(endpoint);
        let scope = UserScopes::scope_tags(endpoint);

        let args = Arc::new(to_args(args)?);
        let endpoint = Arc::new(endpoint.clone());
        let key = endpoint.key(&args);

        let fetch = {
            let dispatcher = self.dispatcher.clone();
            let endpoint = Arc::clone(&endpoint);
            let args = Arc::clone(&args);
            move || {
                let dispatcher = dispatcher.clone();
                let endpoint = Arc::clone(&endpoint);
                let args = Arc::clone(&args);
                async move { dispatcher.execute(&endpoint, &args).await }
            }
        };

        Ok(Query::new(key, fetch)
            .provides(scope)
            .provides_with(move |data| endpoint.provided_tags(&args, data)))
    }

    pub async fn read<A>(&self, endpoint: &Endpoint, args: &A) -> Outcome
    where
        A: Serialize + ?Sized,
    {
        let query = self.query(endpoint, args)?;
        self.cache.read(&query).await
    }

    /// Typed variant of `read`
    pub async fn read_as<T, A>(&self, endpoint: &Endpoint, args: &A) -> Result<T, QueryError>
    where
        T: DeserializeOwned,
        A: Serialize + ?Sized,
    {
        let data = self.read(endpoint, args).await?;
        decode(&data)
    }

    pub fn subscribe<A>(&self, endpoint: &Endpoint, args: &A) -> Result<Subscription, QueryError>
    where
        A: Serialize + ?Sized,
    {
        let query = self.query(endpoint, args)?;
        let rx = self.cache.subscribe(&query);
        Ok(Subscription {
            cache: self.cache.clone(),
            key: query.key().clone(),
            rx,
        })
    }

    /// Send a mutation and invalidate the tags it declares once it succeeds.
    pub async fn mutate<A>(&self, endpoint: &Endpoint, args: &A) -> Result<Value, QueryError>
    where
        A: Serialize + ?Sized,
    {
        if endpoint.kind() != EndpointKind::Mutation {
            return Err(QueryError::Validation(format!(
                "{} is a query, use read or subscribe",
                endpoint.name()
            )));
        }
        self.expiry.scopes().register(endpoint);

        let args = to_args(args)?;
        let result = self.dispatcher.execute(endpoint, &args).await?;

        let tags = endpoint.invalidated_tags(&args, Some(&result));
        let hit = self.cache.invalidate(&tags);
        debug!(endpoint = endpoint.name(), invalidated = hit.len(), "Mutation applied");
        Ok(result)
    }

    pub async fn login(&self, identity: Identity, credential: Credential) -> Result<()> {
        self.start_session(SessionData::new(identity, credential)).await
    }

    /// Start a session and drop data cached for whoever was signed in before.
    pub async fn start_session(&self, data: SessionData) -> Result<()> {
        self.session.start(data).await?;
        self.expiry.invalidate_user_scoped();
        Ok(())
    }

    pub async fn logout(&self) -> Result<()> {
        self.expiry.sign_out().await
    }
}

fn to_args<A: Serialize + ?Sized>(args: &A) -> Result<Value, QueryError> {
    serde_json::to_value(args).map_err(|e| QueryError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(data: &Value) -> Result<T, QueryError> {
    T::deserialize(data).map_err(|e| QueryError::InvalidResponse(e.to_string()))
}

/// A live subscription to one cache entry. Dropping it unsubscribes.
pub struct Subscription {
    cache: RequestCache,
    key: CacheKey,
    rx: watch::Receiver<EntrySnapshot>,
}

impl Subscription {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        self.rx.borrow().clone()
    }

    /// Wait for the next change. `None` once the entry is gone.
    pub async fn changed(&mut self) -> Option<EntrySnapshot> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait until the entry is fulfilled or rejected and no fetch is pending.
    ///
    /// A stale settled entry with subscribers always has a refetch queued, so
    /// it is waited out.
    pub async fn wait_settled(&mut self) -> EntrySnapshot {
        loop {
            let snapshot = self.rx.borrow_and_update().clone();
            if snapshot.is_settled() && !snapshot.stale {
                return snapshot;
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone();
            }
        }
    }

    /// Current data decoded as `T`, if any has been fetched.
    pub fn decode<T: DeserializeOwned>(&self) -> Option<Result<T, QueryError>> {
        let data = self.rx.borrow().data.clone()?;
        Some(decode(&data))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cache.unsubscribe(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use httpmock::prelude::*;
    use reqwest::Method;
    use serde::Deserialize;
    use serde_json::json;

    use crate::api::TagTemplate;
    use crate::auth::PersistedSlice;
    use crate::cache::QueryStatus;
    use crate::store::MemoryStore;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Shop {
        id: String,
        approved: bool,
    }

    fn list_shops() -> Endpoint {
        Endpoint::query("listShops", "/shops")
            .provides(TagTemplate::all("Shop"))
            .provides(TagTemplate::each_result("Shop", "id"))
            .build()
            .expect("valid endpoint")
    }

    fn approve_shop() -> Endpoint {
        Endpoint::mutation("approveShop", Method::POST, "/shops/{id}/approve")
            .invalidates(TagTemplate::from_arg("Shop", "id"))
            .build()
            .expect("valid endpoint")
    }

    fn config(server: &MockServer) -> ConsoleConfig {
        let mut config = ConsoleConfig::new(Url::parse(&server.base_url()).expect("server url"));
        config.dispatch.initial_backoff = Duration::from_millis(1);
        config
    }

    async fn console(server: &MockServer) -> (Console, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let console = Console::init(config(server), store.clone()).await.expect("init");
        (console, store)
    }

    #[tokio::test]
    async fn test_mutation_refetches_subscribed_list() {
        let server = MockServer::start_async().await;
        let list = server
            .mock_async(|when, then| {
                when.method(GET).path("/shops");
                then.status(200)
                    .json_body(json!([{"id": "1", "approved": false}, {"id": "2", "approved": true}]));
            })
            .await;
        let approve = server
            .mock_async(|when, then| {
                when.method(POST).path("/shops/1/approve");
                then.status(200).json_body(json!({"id": "1", "approved": true}));
            })
            .await;

        let (console, _) = console(&server).await;
        let mut sub = console.subscribe(&list_shops(), &()).expect("subscribe");

        let snapshot = sub.wait_settled().await;
        assert_eq!(snapshot.status, QueryStatus::Fulfilled);
        let shops: Vec<Shop> = sub.decode().expect("data").expect("decodes");
        assert_eq!(shops.len(), 2);
        assert!(!shops[0].approved);
        assert_eq!(list.hits_async().await, 1);

        console
            .mutate(&approve_shop(), &json!({"id": "1"}))
            .await
            .expect("mutation succeeds");

        let snapshot = sub.wait_settled().await;
        assert_eq!(snapshot.status, QueryStatus::Fulfilled);
        assert!(!snapshot.stale);
        assert_eq!(approve.hits_async().await, 1);
        assert_eq!(list.hits_async().await, 2);
    }

    #[tokio::test]
    async fn test_failed_mutation_invalidates_nothing() {
        let server = MockServer::start_async().await;
        let list = server
            .mock_async(|when, then| {
                when.method(GET).path("/shops");
                then.status(200).json_body(json!([{"id": "1", "approved": false}]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/shops/1/approve");
                then.status(409).body("already approved");
            })
            .await;

        let (console, _) = console(&server).await;
        let mut sub = console.subscribe(&list_shops(), &()).expect("subscribe");
        sub.wait_settled().await;

        let err = console
            .mutate(&approve_shop(), &json!({"id": "1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Server { status: 409, .. }));
        assert!(!sub.snapshot().stale);
        assert_eq!(list.hits_async().await, 1);
    }

    #[tokio::test]
    async fn test_two_subscribers_share_one_fetch() {
        let server = MockServer::start_async().await;
        let list = server
            .mock_async(|when, then| {
                when.method(GET).path("/shops");
                then.status(200)
                    .delay(Duration::from_millis(50))
                    .json_body(json!([{"id": "1", "approved": false}]));
            })
            .await;

        let (console, _) = console(&server).await;
        let mut first = console.subscribe(&list_shops(), &()).expect("subscribe");
        let mut second = console.subscribe(&list_shops(), &()).expect("subscribe");
        assert_eq!(first.key(), second.key());

        let a = first.wait_settled().await;
        let b = second.wait_settled().await;
        assert_eq!(a.data, b.data);
        assert_eq!(b.subscribers, 2);
        assert_eq!(list.hits_async().await, 1);
    }

    #[tokio::test]
    async fn test_read_after_subscribe_uses_cache() {
        let server = MockServer::start_async().await;
        let list = server
            .mock_async(|when, then| {
                when.method(GET).path("/shops");
                then.status(200).json_body(json!([{"id": "1", "approved": true}]));
            })
            .await;

        let (console, _) = console(&server).await;
        let mut sub = console.subscribe(&list_shops(), &()).expect("subscribe");
        sub.wait_settled().await;

        let shops: Vec<Shop> = console.read_as(&list_shops(), &()).await.expect("read");
        assert_eq!(shops, vec![Shop { id: "1".to_string(), approved: true }]);
        assert_eq!(list.hits_async().await, 1);
    }

    #[tokio::test]
    async fn test_rehydrated_credential_on_first_request() {
        let server = MockServer::start_async().await;
        let list = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/shops")
                    .header("authorization", "Bearer tok-1");
                then.status(200).json_body(json!([]));
            })
            .await;

        let slice = PersistedSlice::new(Some(SessionData::new(
            Identity::new("u1"),
            Credential::new("tok-1"),
        )));
        let store = Arc::new(MemoryStore::with_values([(
            SESSION_STORAGE_KEY,
            serde_json::to_vec(&slice).expect("serialize"),
        )]));

        let console = Console::init(config(&server), store).await.expect("init");
        let identity = console.session().identity().expect("restored");
        assert_eq!(identity.user_id, "u1");

        console.read(&list_shops(), &()).await.expect("read");
        list.assert_async().await;
    }

    #[tokio::test]
    async fn test_corrupt_slice_starts_logged_out() {
        let server = MockServer::start_async().await;
        let store = Arc::new(MemoryStore::with_values([(
            SESSION_STORAGE_KEY,
            b"{not json".to_vec(),
        )]));

        let console = Console::init(config(&server), store.clone()).await.expect("init");
        assert!(!console.session().is_authenticated());
        assert!(store.get(SESSION_STORAGE_KEY).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_logout_drops_credential_and_refetches_anonymously() {
        let server = MockServer::start_async().await;
        let authed = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/shops")
                    .header("authorization", "Bearer tok-1");
                then.status(200).json_body(json!([{"id": "1", "approved": false}]));
            })
            .await;
        let anonymous = server
            .mock_async(|when, then| {
                when.method(GET).path("/shops").header_missing("authorization");
                then.status(200).json_body(json!([]));
            })
            .await;

        let (console, store) = console(&server).await;
        console
            .login(Identity::new("u1"), Credential::new("tok-1"))
            .await
            .expect("login");

        let mut sub = console.subscribe(&list_shops(), &()).expect("subscribe");
        sub.wait_settled().await;
        assert_eq!(authed.hits_async().await, 1);

        console.logout().await.expect("logout");
        assert!(!console.session().is_authenticated());

        let snapshot = sub.wait_settled().await;
        assert_eq!(snapshot.data.as_deref(), Some(&json!([])));
        assert_eq!(anonymous.hits_async().await, 1);

        let bytes = store.get(SESSION_STORAGE_KEY).await.expect("get").expect("written");
        let slice: PersistedSlice = serde_json::from_slice(&bytes).expect("slice");
        assert!(slice.session.is_none());
    }

    #[tokio::test]
    async fn test_unauthorized_response_forces_logout() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/shops");
                then.status(401).body("token expired");
            })
            .await;

        let (console, _) = console(&server).await;
        console
            .login(Identity::new("u1"), Credential::new("tok-1"))
            .await
            .expect("login");

        let err = console.read(&list_shops(), &()).await.unwrap_err();
        assert_eq!(err, QueryError::AuthExpired);
        assert!(!console.session().is_authenticated());
    }

    fn dashboard() -> Endpoint {
        Endpoint::query("dashboard", "/dashboard")
            .build()
            .expect("valid endpoint")
    }

    #[tokio::test]
    async fn test_logout_reaches_entries_without_tags() {
        let server = MockServer::start_async().await;
        let authed = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/dashboard")
                    .header("authorization", "Bearer tok-1");
                then.status(200).json_body(json!({"owner": "u1"}));
            })
            .await;
        let anonymous = server
            .mock_async(|when, then| {
                when.method(GET).path("/dashboard").header_missing("authorization");
                then.status(200).json_body(json!({"owner": null}));
            })
            .await;

        let (console, _) = console(&server).await;
        console
            .login(Identity::new("u1"), Credential::new("tok-1"))
            .await
            .expect("login");
        let first = console.read(&dashboard(), &()).await.expect("read");
        assert_eq!(*first, json!({"owner": "u1"}));

        console.logout().await.expect("logout");
        let second = console.read(&dashboard(), &()).await.expect("read");
        assert_eq!(*second, json!({"owner": null}));
        assert_eq!(authed.hits_async().await, 1);
        assert_eq!(anonymous.hits_async().await, 1);
    }

    #[tokio::test]
    async fn test_login_as_another_user_refetches_untagged_entries() {
        let server = MockServer::start_async().await;
        let first_user = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/dashboard")
                    .header("authorization", "Bearer tok-1");
                then.status(200).json_body(json!({"owner": "u1"}));
            })
            .await;
        let second_user = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/dashboard")
                    .header("authorization", "Bearer tok-2");
                then.status(200).json_body(json!({"owner": "u2"}));
            })
            .await;

        let (console, _) = console(&server).await;
        console
            .login(Identity::new("u1"), Credential::new("tok-1"))
            .await
            .expect("login");
        console.read(&dashboard(), &()).await.expect("read");

        console
            .login(Identity::new("u2"), Credential::new("tok-2"))
            .await
            .expect("login");
        let data = console.read(&dashboard(), &()).await.expect("read");
        assert_eq!(*data, json!({"owner": "u2"}));
        assert_eq!(first_user.hits_async().await, 1);
        assert_eq!(second_user.hits_async().await, 1);
    }

    #[tokio::test]
    async fn test_logout_refetches_empty_result_list() {
        let server = MockServer::start_async().await;
        let authed = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/orders")
                    .header("authorization", "Bearer tok-1");
                then.status(200).json_body(json!([]));
            })
            .await;
        let anonymous = server
            .mock_async(|when, then| {
                when.method(GET).path("/orders").header_missing("authorization");
                then.status(401);
            })
            .await;

        // Only result-derived tags, and the result carries none
        let list_orders = Endpoint::query("listOrders", "/orders")
            .provides(TagTemplate::each_result("Order", "id"))
            .build()
            .expect("valid endpoint");

        let (console, _) = console(&server).await;
        console
            .login(Identity::new("u1"), Credential::new("tok-1"))
            .await
            .expect("login");
        let mut sub = console.subscribe(&list_orders, &()).expect("subscribe");
        let snapshot = sub.wait_settled().await;
        assert_eq!(snapshot.status, QueryStatus::Fulfilled);

        console.logout().await.expect("logout");
        let snapshot = sub.wait_settled().await;
        assert_eq!(snapshot.status, QueryStatus::Rejected);
        assert_eq!(snapshot.error, Some(QueryError::AuthExpired));
        assert_eq!(authed.hits_async().await, 1);
        assert_eq!(anonymous.hits_async().await, 1);
    }

    #[tokio::test]
    async fn test_unauthorized_during_subscribed_fetch_refetches_anonymously() {
        let server = MockServer::start_async().await;
        let authed = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/shops")
                    .header("authorization", "Bearer tok-1");
                then.status(401).delay(Duration::from_millis(50));
            })
            .await;
        let anonymous = server
            .mock_async(|when, then| {
                when.method(GET).path("/shops").header_missing("authorization");
                then.status(200).json_body(json!([{"id": "1", "approved": true}]));
            })
            .await;

        let (console, _) = console(&server).await;
        console
            .login(Identity::new("u1"), Credential::new("tok-1"))
            .await
            .expect("login");

        let mut sub = console.subscribe(&list_shops(), &()).expect("subscribe");
        let snapshot = sub.wait_settled().await;

        assert!(!console.session().is_authenticated());
        assert_eq!(snapshot.status, QueryStatus::Fulfilled);
        assert!(snapshot.error.is_none());
        assert_eq!(authed.hits_async().await, 1);
        assert_eq!(anonymous.hits_async().await, 1);
    }

    #[tokio::test]
    async fn test_endpoint_kind_is_checked() {
        let server = MockServer::start_async().await;
        let (console, _) = console(&server).await;

        let err = console.read(&approve_shop(), &json!({"id": "1"})).await.unwrap_err();
        assert!(matches!(err, QueryError::Validation(_)));

        let err = console.mutate(&list_shops(), &()).await.unwrap_err();
        assert!(matches!(err, QueryError::Validation(_)));
        assert!(console.cache().is_empty());
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/shops");
                then.status(200).json_body(json!([]));
            })
            .await;

        let (console, _) = console(&server).await;
        let mut sub = console.subscribe(&list_shops(), &()).expect("subscribe");
        let key = sub.key().clone();
        sub.wait_settled().await;
        assert_eq!(console.cache().snapshot(&key).expect("entry").subscribers, 1);

        drop(sub);
        assert_eq!(console.cache().snapshot(&key).expect("entry").subscribers, 0);
    }
}
