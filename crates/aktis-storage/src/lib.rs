//! Embedded cache store, credential holder and authenticated HTTP fetch for Aktis.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use aktis_core::CredentialBundle;
use reqwest::cookie::Jar;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use reqwest::{Method, StatusCode, Url};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "aktis-storage";

const AUTH_KEY: &str = "current";

/// Named buckets of the embedded store. Names are part of the on-disk layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    Projects,
    Issues,
    ConfluenceSpaces,
    ConfluencePages,
    Auth,
}

impl Partition {
    pub const ALL: [Partition; 5] = [
        Partition::Projects,
        Partition::Issues,
        Partition::ConfluenceSpaces,
        Partition::ConfluencePages,
        Partition::Auth,
    ];

    /// Everything except credentials.
    pub const DATA: [Partition; 4] = [
        Partition::Projects,
        Partition::Issues,
        Partition::ConfluenceSpaces,
        Partition::ConfluencePages,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Projects => "projects",
            Self::Issues => "issues",
            Self::ConfluenceSpaces => "confluence_spaces",
            Self::ConfluencePages => "confluence_pages",
            Self::Auth => "auth",
        }
    }

    pub fn containers(kind: aktis_core::ContainerKind) -> Self {
        match kind {
            aktis_core::ContainerKind::Project => Self::Projects,
            aktis_core::ContainerKind::Space => Self::ConfluenceSpaces,
        }
    }

    pub fn items(kind: aktis_core::ContainerKind) -> Self {
        match kind {
            aktis_core::ContainerKind::Project => Self::Issues,
            aktis_core::ContainerKind::Space => Self::ConfluencePages,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("embedded store failure: {0}")]
    Sled(#[from] sled::Error),
    #[error("record encoding failure: {0}")]
    Json(#[from] serde_json::Error),
}

/// Single owner of the embedded database and all of its partitions.
///
/// Every partition is opened at construction, so a partition is never absent
/// while the store is alive. Multi-key writes go through one sled batch and
/// are applied atomically.
#[derive(Debug, Clone)]
pub struct CacheStore {
    db: sled::Db,
    trees: Vec<sled::Tree>,
}

impl CacheStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path.as_ref())?;
        Self::from_db(db)
    }

    /// In-memory store that disappears on drop.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let trees = Partition::ALL
            .iter()
            .map(|p| db.open_tree(p.name()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { db, trees })
    }

    fn tree(&self, partition: Partition) -> &sled::Tree {
        &self.trees[partition.index()]
    }

    pub fn upsert(&self, partition: Partition, key: &str, record: &JsonValue) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(record)?;
        self.tree(partition).insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    /// Write all records in one atomic batch; last write wins per key.
    pub fn upsert_batch<I>(&self, partition: Partition, records: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = (String, JsonValue)>,
    {
        let mut batch = sled::Batch::default();
        let mut written = 0usize;
        for (key, record) in records {
            batch.insert(key.as_bytes(), serde_json::to_vec(&record)?);
            written += 1;
        }
        self.tree(partition).apply_batch(batch)?;
        Ok(written)
    }

    pub fn get(&self, partition: Partition, key: &str) -> Result<Option<JsonValue>, StoreError> {
        match self.tree(partition).get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Full partition scan in key order. Undecodable values are skipped.
    pub fn get_all(&self, partition: Partition) -> Result<Vec<JsonValue>, StoreError> {
        let mut out = Vec::new();
        for entry in self.tree(partition).iter() {
            let (key, value) = entry?;
            match serde_json::from_slice(&value) {
                Ok(record) => out.push(record),
                Err(err) => warn!(
                    partition = partition.name(),
                    key = %String::from_utf8_lossy(&key),
                    error = %err,
                    "skipping undecodable record"
                ),
            }
        }
        Ok(out)
    }

    pub fn len(&self, partition: Partition) -> usize {
        self.tree(partition).len()
    }

    pub fn is_empty(&self, partition: Partition) -> bool {
        self.tree(partition).is_empty()
    }

    /// Remove every key in one batch. The partition itself stays open.
    pub fn clear(&self, partition: Partition) -> Result<usize, StoreError> {
        self.delete_where(partition, |_| true)
    }

    /// Delete every record the predicate accepts, in one batch.
    pub fn delete_matching<F>(&self, partition: Partition, predicate: F) -> Result<usize, StoreError>
    where
        F: Fn(&JsonValue) -> bool,
    {
        self.delete_where(partition, |bytes| {
            serde_json::from_slice::<JsonValue>(bytes)
                .map(|record| predicate(&record))
                .unwrap_or(false)
        })
    }

    fn delete_where<F>(&self, partition: Partition, predicate: F) -> Result<usize, StoreError>
    where
        F: Fn(&[u8]) -> bool,
    {
        let tree = self.tree(partition);
        let mut batch = sled::Batch::default();
        let mut removed = 0usize;
        for entry in tree.iter() {
            let (key, value) = entry?;
            if predicate(&value) {
                batch.remove(key);
                removed += 1;
            }
        }
        tree.apply_batch(batch)?;
        Ok(removed)
    }

    /// Read-modify-write of one record, retried until no concurrent writer
    /// interferes. Returns `false` when the key is absent.
    pub fn modify<F>(&self, partition: Partition, key: &str, mut f: F) -> Result<bool, StoreError>
    where
        F: FnMut(JsonValue) -> JsonValue,
    {
        let tree = self.tree(partition);
        loop {
            let Some(current) = tree.get(key.as_bytes())? else {
                return Ok(false);
            };
            let record: JsonValue = serde_json::from_slice(&current)?;
            let updated = serde_json::to_vec(&f(record))?;
            match tree.compare_and_swap(key.as_bytes(), Some(current), Some(updated))? {
                Ok(()) => return Ok(true),
                Err(_) => continue,
            }
        }
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credential bundle has no base URL")]
    Incomplete,
    #[error("invalid base URL {url}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("building HTTP client: {0}")]
    Client(#[from] reqwest::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fully-applied credentials: an HTTP client with its cookie jar plus the
/// request metadata that goes with it.
#[derive(Debug)]
pub struct AuthSession {
    client: reqwest::Client,
    base_url: String,
    user_agent: String,
    cloud_id: Option<String>,
    atl_token: Option<String>,
}

impl AuthSession {
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn cloud_id(&self) -> Option<&str> {
        self.cloud_id.as_deref()
    }

    pub fn atl_token(&self) -> Option<&str> {
        self.atl_token.as_deref()
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub timeout: Duration,
    pub fallback_user_agent: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            fallback_user_agent: "aktis-agent/0.1".to_string(),
        }
    }
}

/// Holds the current credentials. Readers get an `Arc` snapshot, so a
/// concurrent `apply` never exposes a half-built session.
#[derive(Debug)]
pub struct AuthState {
    current: RwLock<Option<Arc<AuthSession>>>,
    store: CacheStore,
    config: AuthConfig,
}

impl AuthState {
    pub fn new(store: CacheStore, config: AuthConfig) -> Self {
        Self {
            current: RwLock::new(None),
            store,
            config,
        }
    }

    /// Replace the held credentials and persist the bundle. A persistence
    /// failure is logged and does not undo the in-memory session.
    pub async fn apply(&self, bundle: &CredentialBundle) -> Result<(), AuthError> {
        self.install(bundle).await?;
        match serde_json::to_value(bundle) {
            Ok(value) => {
                if let Err(err) = self.store.upsert(Partition::Auth, AUTH_KEY, &value) {
                    error!(error = %err, "failed to persist credential bundle");
                }
            }
            Err(err) => error!(error = %err, "failed to encode credential bundle"),
        }
        Ok(())
    }

    /// Reapply a persisted bundle, if any. Returns whether one was applied.
    pub async fn restore(&self) -> Result<bool, AuthError> {
        let Some(value) = self.store.get(Partition::Auth, AUTH_KEY)? else {
            debug!("no stored credential bundle");
            return Ok(false);
        };
        let bundle: CredentialBundle = serde_json::from_value(value).map_err(StoreError::from)?;
        self.install(&bundle).await?;
        info!(base_url = %bundle.normalized_base_url(), "restored stored credential bundle");
        Ok(true)
    }

    async fn install(&self, bundle: &CredentialBundle) -> Result<(), AuthError> {
        if !bundle.is_complete() {
            return Err(AuthError::Incomplete);
        }
        let base_url = bundle.normalized_base_url();
        let origin = Url::parse(&base_url).map_err(|err| AuthError::InvalidBaseUrl {
            url: base_url.clone(),
            reason: err.to_string(),
        })?;

        let jar = Arc::new(Jar::default());
        for cookie in &bundle.cookies {
            jar.add_cookie_str(&cookie.to_set_cookie(), &origin);
        }
        let client = reqwest::Client::builder()
            .cookie_provider(jar)
            .gzip(true)
            .brotli(true)
            .timeout(self.config.timeout)
            .build()?;

        let user_agent = if bundle.user_agent.trim().is_empty() {
            self.config.fallback_user_agent.clone()
        } else {
            bundle.user_agent.clone()
        };
        let cloud_id = bundle.cloud_id().map(ToString::to_string);
        let atl_token = bundle.atl_token().map(ToString::to_string);
        if cloud_id.is_none() {
            debug!("cloudId not present in auth tokens");
        }
        if atl_token.is_none() {
            debug!("atlToken not present in auth tokens");
        }

        let session = Arc::new(AuthSession {
            client,
            base_url,
            user_agent,
            cloud_id,
            atl_token,
        });
        *self.current.write().await = Some(session);
        info!(
            base_url = %bundle.normalized_base_url(),
            cookies = bundle.cookies.len(),
            "authentication updated"
        );
        Ok(())
    }

    pub async fn session(&self) -> Option<Arc<AuthSession>> {
        self.current.read().await.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.current
            .read()
            .await
            .as_ref()
            .is_some_and(|s| !s.base_url.is_empty())
    }

    pub async fn base_url(&self) -> Option<String> {
        self.session().await.map(|s| s.base_url.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    AuthExpired,
    RemoteError,
}

pub fn classify_status(status: StatusCode) -> ResponseClass {
    match status {
        StatusCode::OK => ResponseClass::Success,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ResponseClass::AuthExpired,
        _ => ResponseClass::RemoteError,
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("not authenticated; submit a credential bundle first")]
    NotAuthenticated,
    #[error("remote session expired (status {status}); re-authenticate")]
    AuthExpired { status: u16 },
    #[error("http status {status}: {body}")]
    Remote { status: u16, body: String },
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
}

impl FetchError {
    /// Only network-level failures are worth retrying; this layer never does.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Issues single authenticated requests against the current base URL.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    auth: Arc<AuthState>,
}

impl HttpFetcher {
    pub fn new(auth: Arc<AuthState>) -> Self {
        Self { auth }
    }

    pub fn auth(&self) -> &Arc<AuthState> {
        &self.auth
    }

    pub async fn get(&self, path: &str) -> Result<Vec<u8>, FetchError> {
        self.request(Method::GET, path).await
    }

    pub async fn request(&self, method: Method, path: &str) -> Result<Vec<u8>, FetchError> {
        let session = self.auth.session().await.ok_or(FetchError::NotAuthenticated)?;
        let url = format!("{}{}", session.base_url(), path);
        let span = info_span!("remote_request", %method, path);
        send(&session, method, &url).instrument(span).await
    }
}

async fn send(session: &AuthSession, method: Method, url: &str) -> Result<Vec<u8>, FetchError> {
    let resp = session
        .client()
        .request(method, url)
        .header(USER_AGENT, session.user_agent())
        .header(ACCEPT, "application/json, text/html")
        .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9")
        .send()
        .await?;

    let status = resp.status();
    match classify_status(status) {
        ResponseClass::Success => Ok(resp.bytes().await?.to_vec()),
        class => {
            let body = resp.text().await.unwrap_or_default();
            error!(url, status = status.as_u16(), body = %body, "HTTP request failed");
            if class == ResponseClass::AuthExpired {
                Err(FetchError::AuthExpired {
                    status: status.as_u16(),
                })
            } else {
                Err(FetchError::Remote {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aktis_core::CookieSpec;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use tempfile::tempdir;

    fn bundle_for(base_url: &str) -> CredentialBundle {
        CredentialBundle {
            cookies: vec![CookieSpec {
                name: "tenant.session.token".into(),
                value: "secret".into(),
                ..Default::default()
            }],
            tokens: serde_json::Map::from_iter([("cloudId".to_string(), json!("cloud-123"))]),
            user_agent: "Mozilla/5.0 (test)".into(),
            base_url: base_url.into(),
            timestamp: Some(1_760_000_000),
        }
    }

    async fn spawn_remote() -> String {
        let app = Router::new()
            .route("/ok", get(|| async { "payload" }))
            .route(
                "/agent",
                get(|headers: HeaderMap| async move {
                    headers
                        .get("user-agent")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string()
                }),
            )
            .route("/expired", get(|| async { AxumStatus::UNAUTHORIZED }))
            .route("/forbidden", get(|| async { AxumStatus::FORBIDDEN }))
            .route(
                "/broken",
                get(|| async {
                    (
                        AxumStatus::BAD_REQUEST,
                        Json(json!({"errorMessages": ["bad jql"]})),
                    )
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn fetcher_for(base_url: &str) -> HttpFetcher {
        let auth = Arc::new(AuthState::new(CacheStore::temporary().unwrap(), AuthConfig::default()));
        auth.apply(&bundle_for(base_url)).await.unwrap();
        HttpFetcher::new(auth)
    }

    #[test]
    fn clear_keeps_partition_usable() {
        let dir = tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        store.upsert(Partition::Projects, "ENG", &json!({"key": "ENG"})).unwrap();
        store.upsert(Partition::Projects, "OPS", &json!({"key": "OPS"})).unwrap();

        assert_eq!(store.clear(Partition::Projects).unwrap(), 2);
        assert!(store.is_empty(Partition::Projects));

        store.upsert(Partition::Projects, "ENG", &json!({"key": "ENG"})).unwrap();
        assert_eq!(store.get_all(Partition::Projects).unwrap().len(), 1);
    }

    #[test]
    fn batch_upsert_is_last_write_wins() {
        let store = CacheStore::temporary().unwrap();
        let written = store
            .upsert_batch(
                Partition::Issues,
                vec![
                    ("ENG-1".to_string(), json!({"v": 1})),
                    ("ENG-1".to_string(), json!({"v": 2})),
                ],
            )
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(store.len(Partition::Issues), 1);
        assert_eq!(store.get(Partition::Issues, "ENG-1").unwrap(), Some(json!({"v": 2})));
    }

    #[test]
    fn delete_matching_only_touches_accepted_records() {
        let store = CacheStore::temporary().unwrap();
        store.upsert(Partition::Issues, "A-1", &json!({"containerKey": "A"})).unwrap();
        store.upsert(Partition::Issues, "A-2", &json!({"containerKey": "A"})).unwrap();
        store.upsert(Partition::Issues, "B-1", &json!({"containerKey": "B"})).unwrap();

        let removed = store
            .delete_matching(Partition::Issues, |r| r["containerKey"] == "A")
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.get_all(Partition::Issues).unwrap(), vec![json!({"containerKey": "B"})]);
    }

    #[test]
    fn modify_rewrites_existing_record_only() {
        let store = CacheStore::temporary().unwrap();
        store.upsert(Partition::ConfluenceSpaces, "DOC", &json!({"pageCount": 3})).unwrap();
        let hit = store
            .modify(Partition::ConfluenceSpaces, "DOC", |mut r| {
                r["pageCount"] = json!(0);
                r
            })
            .unwrap();
        assert!(hit);
        assert_eq!(
            store.get(Partition::ConfluenceSpaces, "DOC").unwrap(),
            Some(json!({"pageCount": 0}))
        );
        assert!(!store.modify(Partition::ConfluenceSpaces, "NOPE", |r| r).unwrap());
    }

    #[tokio::test]
    async fn incomplete_bundle_is_not_applied() {
        let auth = AuthState::new(CacheStore::temporary().unwrap(), AuthConfig::default());
        let err = auth.apply(&bundle_for("  ")).await.unwrap_err();
        assert!(matches!(err, AuthError::Incomplete));
        assert!(!auth.is_authenticated().await);
    }

    #[tokio::test]
    async fn applied_bundle_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = CacheStore::open(dir.path()).unwrap();
            let auth = AuthState::new(store.clone(), AuthConfig::default());
            auth.apply(&bundle_for("https://acme.atlassian.net/")).await.unwrap();
            assert!(auth.is_authenticated().await);
            store.flush().unwrap();
        }

        let store = CacheStore::open(dir.path()).unwrap();
        let auth = AuthState::new(store, AuthConfig::default());
        assert!(!auth.is_authenticated().await);
        assert!(auth.restore().await.unwrap());
        let session = auth.session().await.unwrap();
        assert_eq!(session.base_url(), "https://acme.atlassian.net");
        assert_eq!(session.cloud_id(), Some("cloud-123"));
        assert_eq!(session.atl_token(), None);
    }

    #[tokio::test]
    async fn fetch_without_auth_fails_fast() {
        let auth = Arc::new(AuthState::new(CacheStore::temporary().unwrap(), AuthConfig::default()));
        let err = HttpFetcher::new(auth).get("/ok").await.unwrap_err();
        assert!(matches!(err, FetchError::NotAuthenticated));
    }

    #[tokio::test]
    async fn fetch_classifies_remote_responses() {
        let base = spawn_remote().await;
        let http = fetcher_for(&base).await;

        assert_eq!(http.get("/ok").await.unwrap(), b"payload".to_vec());
        assert_eq!(http.get("/agent").await.unwrap(), b"Mozilla/5.0 (test)".to_vec());

        assert!(matches!(
            http.get("/expired").await.unwrap_err(),
            FetchError::AuthExpired { status: 401 }
        ));
        assert!(matches!(
            http.get("/forbidden").await.unwrap_err(),
            FetchError::AuthExpired { status: 403 }
        ));
        match http.get("/broken").await.unwrap_err() {
            FetchError::Remote { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("bad jql"));
            }
            other => panic!("unexpected error: {other}"),
        }
        match http.get("/missing").await.unwrap_err() {
            err @ FetchError::Remote { status: 404, .. } => assert!(!err.is_retryable()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn connection_refused_is_a_retryable_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let http = fetcher_for(&format!("http://{addr}")).await;
        let err = http.get("/ok").await.unwrap_err();
        assert!(matches!(err, FetchError::Transport(_)));
        assert!(err.is_retryable());
    }
}
