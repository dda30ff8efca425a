//! Index synchronization, item pagination and service wiring.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use aktis_core::{
    stored_container_key, ChildItem, ContainerKind, ContainerRecord, ItemCount, ProgressEvent,
    ProgressLevel,
};
use aktis_sources::{ConfluenceSource, JiraSource, RemoteSource, SourceError};
use aktis_storage::{AuthConfig, AuthState, CacheStore, HttpFetcher, Partition, StoreError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "aktis-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The remote returned an empty page.
    Exhausted,
    /// Every item on the latest page had already been seen.
    AllDuplicates,
    LastPageFlag,
    ShortPage,
    IterationCap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexSyncSummary {
    pub run_id: Uuid,
    pub kind: ContainerKind,
    pub containers: usize,
    pub counted: usize,
    pub unknown: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFetchSummary {
    pub container_key: String,
    pub removed: usize,
    pub stored: usize,
    pub duplicates: usize,
    pub misrouted: usize,
    /// Items dropped because their payload had no usable key.
    pub skipped: usize,
    pub requests: usize,
    pub stop_reason: StopReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationPolicy {
    pub page_size: usize,
    pub max_iterations: usize,
    pub inter_page_delay: Duration,
}

#[async_trait]
pub trait IndexSynchronizer: Send + Sync {
    fn kind(&self) -> ContainerKind;

    /// Drop every stored container of this kind. Items are left alone.
    fn clear_index(&self) -> Result<usize, SyncError>;

    async fn sync_index(&self) -> Result<IndexSyncSummary, SyncError>;
}

#[async_trait]
pub trait ItemPaginator: Send + Sync {
    async fn fetch_all(&self, container_key: &str) -> Result<ItemFetchSummary, SyncError>;
}

/// Operator-facing progress stream. Sending with nobody listening is fine.
#[derive(Debug, Clone)]
pub struct ProgressHub {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, level: ProgressLevel, message: impl Into<String>) {
        let _ = self.tx.send(ProgressEvent::new(level, message));
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(ProgressLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(ProgressLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(ProgressLevel::Error, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.emit(ProgressLevel::Success, message);
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Both capabilities for one container kind, driven by a [`RemoteSource`].
pub struct SyncEngine<S> {
    source: Arc<S>,
    store: CacheStore,
    http: HttpFetcher,
    progress: ProgressHub,
    policy: PaginationPolicy,
}

pub type JiraSync = SyncEngine<JiraSource>;
pub type ConfluenceSync = SyncEngine<ConfluenceSource>;

impl<S: RemoteSource + 'static> SyncEngine<S> {
    pub fn new(
        source: S,
        store: CacheStore,
        http: HttpFetcher,
        progress: ProgressHub,
        policy: PaginationPolicy,
    ) -> Self {
        Self {
            source: Arc::new(source),
            store,
            http,
            progress,
            policy,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn progress(&self) -> &ProgressHub {
        &self.progress
    }

    async fn run_index_sync(&self, run_id: Uuid) -> Result<IndexSyncSummary, SyncError> {
        let kind = self.source.kind();
        let containers = self.source.fetch_containers(&self.http).await?;
        let keys: Vec<String> = containers.iter().map(|c| c.key.clone()).collect();
        let shared = Arc::new(Mutex::new(containers));

        let mut handles = Vec::with_capacity(keys.len());
        for (idx, key) in keys.into_iter().enumerate() {
            let source = Arc::clone(&self.source);
            let http = self.http.clone();
            let shared = Arc::clone(&shared);
            handles.push(tokio::spawn(
                async move {
                    let count = match source.fetch_count(&http, &key).await {
                        Ok(n) => ItemCount::Known(n),
                        Err(err) => {
                            warn!(container = %key, error = %err, "count fetch failed; storing unknown");
                            ItemCount::Unknown
                        }
                    };
                    if let Some(record) = shared.lock().await.get_mut(idx) {
                        record.count = count;
                    }
                }
                .in_current_span(),
            ));
        }
        for handle in handles {
            handle.await?;
        }

        let containers: Vec<ContainerRecord> = std::mem::take(&mut *shared.lock().await);
        self.store.upsert_batch(
            Partition::containers(kind),
            containers.iter().map(|c| (c.key.clone(), c.to_document())),
        )?;

        let unknown = containers.iter().filter(|c| c.count.is_unknown()).count();
        for c in &containers {
            self.progress.info(format!(
                "Stored {kind} {} ({}) with {} {}s",
                c.key,
                c.name,
                c.count,
                kind.item_label()
            ));
        }
        info!(containers = containers.len(), unknown, "index sync complete");

        Ok(IndexSyncSummary {
            run_id,
            kind,
            containers: containers.len(),
            counted: containers.len() - unknown,
            unknown,
        })
    }

    async fn run_item_fetch(&self, container_key: &str) -> Result<ItemFetchSummary, SyncError> {
        let kind = self.source.kind();
        let items = Partition::items(kind);
        let policy = self.policy;

        let removed = self.store.delete_matching(items, |doc| {
            stored_container_key(kind, doc).as_deref() == Some(container_key)
        })?;
        debug!(removed, "removed previously stored items");

        let mut seen: HashSet<String> = HashSet::new();
        let mut summary = ItemFetchSummary {
            container_key: container_key.to_string(),
            removed,
            stored: 0,
            duplicates: 0,
            misrouted: 0,
            skipped: 0,
            requests: 0,
            stop_reason: StopReason::IterationCap,
        };
        let mut offset = 0usize;

        for iteration in 0..policy.max_iterations {
            if iteration > 0 {
                tokio::time::sleep(policy.inter_page_delay).await;
            }
            let page = self
                .source
                .fetch_item_page(&self.http, container_key, offset, policy.page_size)
                .await?;
            summary.requests += 1;

            let received = page.items.len();
            if received == 0 {
                summary.stop_reason = StopReason::Exhausted;
                break;
            }

            let mut fresh: Vec<(String, JsonValue)> = Vec::with_capacity(received);
            for payload in &page.items {
                let item = match ChildItem::from_payload(kind, container_key, payload.clone()) {
                    Ok(item) => item,
                    Err(err) => {
                        summary.skipped += 1;
                        warn!(offset, error = %err, "{} missing key field, skipping", kind.item_label());
                        continue;
                    }
                };
                if item.is_misrouted() {
                    summary.misrouted += 1;
                    warn!(
                        item = %item.key,
                        reported = item.reported_container.as_deref().unwrap_or_default(),
                        "item reports a different container than requested"
                    );
                }
                if !seen.insert(item.key.clone()) {
                    summary.duplicates += 1;
                    continue;
                }
                fresh.push((item.key.clone(), item.into_document()));
            }

            // No new key on a non-empty page means the remote is not advancing.
            if fresh.is_empty() {
                warn!(offset, received, "page contained no new items; remote pagination is not advancing");
                summary.stop_reason = StopReason::AllDuplicates;
                break;
            }

            summary.stored += self.store.upsert_batch(items, fresh)?;
            debug!(offset, received, stored = summary.stored, "stored page");
            self.progress.info(format!(
                "Fetched {} {}s for {kind} {container_key}",
                summary.stored,
                kind.item_label()
            ));

            if page.is_last == Some(true) {
                summary.stop_reason = StopReason::LastPageFlag;
                break;
            }
            if received < policy.page_size {
                summary.stop_reason = StopReason::ShortPage;
                break;
            }
            offset += received;
        }

        if summary.stop_reason == StopReason::IterationCap {
            warn!(
                max_iterations = policy.max_iterations,
                "stopped at iteration cap; remote never signalled the end"
            );
        }

        if self.source.reconcile_count_after_fetch() {
            let actual = summary.stored as u64;
            let field = kind.count_field();
            let updated = self.store.modify(Partition::containers(kind), container_key, |mut doc| {
                if let Some(map) = doc.as_object_mut() {
                    map.insert(field.to_string(), JsonValue::from(actual));
                }
                doc
            })?;
            if updated {
                debug!(count = actual, "replaced stored count with fetched total");
            }
        }

        info!(
            stored = summary.stored,
            duplicates = summary.duplicates,
            misrouted = summary.misrouted,
            skipped = summary.skipped,
            requests = summary.requests,
            stop = ?summary.stop_reason,
            "item fetch complete"
        );
        self.progress.success(format!(
            "Stored {} {}s for {kind} {container_key}",
            summary.stored,
            kind.item_label()
        ));
        Ok(summary)
    }
}

#[async_trait]
impl<S: RemoteSource + 'static> IndexSynchronizer for SyncEngine<S> {
    fn kind(&self) -> ContainerKind {
        self.source.kind()
    }

    fn clear_index(&self) -> Result<usize, SyncError> {
        Ok(self.store.clear(Partition::containers(self.source.kind()))?)
    }

    async fn sync_index(&self) -> Result<IndexSyncSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let kind = self.source.kind();
        let span = info_span!("index_sync", %run_id, kind = kind.label());
        let result = self.run_index_sync(run_id).instrument(span).await;
        if let Err(err) = &result {
            error!(%run_id, kind = kind.label(), error = %err, "index sync failed");
            self.progress.error(format!("Failed to sync {kind}s: {err}"));
        }
        result
    }
}

#[async_trait]
impl<S: RemoteSource + 'static> ItemPaginator for SyncEngine<S> {
    async fn fetch_all(&self, container_key: &str) -> Result<ItemFetchSummary, SyncError> {
        let kind = self.source.kind();
        let span = info_span!("item_fetch", kind = kind.label(), container = container_key);
        let result = self.run_item_fetch(container_key).instrument(span).await;
        if let Err(err) = &result {
            error!(kind = kind.label(), container = container_key, error = %err, "item fetch failed");
            self.progress.error(format!(
                "Failed to fetch {}s for {kind} {container_key}: {err}",
                kind.item_label()
            ));
        }
        result
    }
}

/// Fetch every container concurrently, one task each. Duplicate keys are
/// fetched once. Results come back in request order.
pub async fn fetch_many<P>(
    paginator: Arc<P>,
    keys: Vec<String>,
) -> Vec<(String, Result<ItemFetchSummary, SyncError>)>
where
    P: ItemPaginator + ?Sized + 'static,
{
    let mut unique = HashSet::new();
    let handles: Vec<_> = keys
        .into_iter()
        .filter(|key| unique.insert(key.clone()))
        .map(|key| {
            let paginator = Arc::clone(&paginator);
            let task_key = key.clone();
            let handle = tokio::spawn(async move { paginator.fetch_all(&task_key).await });
            (key, handle)
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (key, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(join) => Err(SyncError::Task(join)),
        };
        results.push((key, result));
    }
    results
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FullSyncSummary {
    pub projects: IndexSyncSummary,
    /// `None` when the space sync failed.
    pub spaces: Option<IndexSyncSummary>,
}

/// Rebuild the project index, then the space index. A project failure ends
/// the run; a space failure is logged and the run still succeeds.
pub async fn sync_all_indexes<J, C>(projects: &J, spaces: &C) -> Result<FullSyncSummary, SyncError>
where
    J: IndexSynchronizer + ?Sized,
    C: IndexSynchronizer + ?Sized,
{
    info!("starting full index sync");
    let projects = projects.sync_index().await?;
    let spaces = match spaces.sync_index().await {
        Ok(summary) => Some(summary),
        Err(err) => {
            error!(error = %err, "space index sync failed; continuing");
            None
        }
    };
    info!(
        projects = projects.containers,
        spaces = spaces.as_ref().map_or(0, |s| s.containers),
        "full index sync complete"
    );
    Ok(FullSyncSummary { projects, spaces })
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./aktis-data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    pub timeout_seconds: u64,
    /// Used when a credential bundle carries no user agent.
    pub user_agent: String,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            user_agent: "aktis-agent/0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JiraConfig {
    pub page_size: usize,
    pub count_cap: usize,
    pub max_iterations: usize,
    pub inter_page_delay_ms: u64,
}

impl Default for JiraConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            count_cap: 5000,
            max_iterations: 200,
            inter_page_delay_ms: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfluenceConfig {
    pub page_size: usize,
    pub max_iterations: usize,
    pub inter_page_delay_ms: u64,
}

impl Default for ConfluenceConfig {
    fn default() -> Self {
        Self {
            page_size: 25,
            max_iterations: 200,
            inter_page_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

const LOG_LEVELS: [&str; 4] = ["debug", "info", "warn", "error"];
const CONFIG_CANDIDATES: [&str; 2] = ["aktis.toml", "config.toml"];

/// Service configuration: defaults, then a TOML file, then environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub scraper: ScraperConfig,
    pub jira: JiraConfig,
    pub confluence: ConfluenceConfig,
    pub logging: LoggingConfig,
}

/// Result of [`ServiceConfig::load`]. Loading usually happens before a
/// subscriber is installed, so notes are returned instead of logged.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: ServiceConfig,
    pub path: Option<PathBuf>,
    /// Environment overrides that could not be applied.
    pub ignored: Vec<String>,
}

impl ServiceConfig {
    /// Load from `explicit` (which must exist) or the first config file found
    /// in the working directory, then apply environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => CONFIG_CANDIDATES
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists()),
        };
        let mut config = match &path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let ignored = config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(LoadedConfig {
            config,
            path,
            ignored,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loading config file");
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment overrides. Returns a note for each value that could
    /// not be parsed; the previous setting is kept for those.
    pub fn apply_env<F>(&mut self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| lookup(name))
                .filter(|value| !value.trim().is_empty())
        };
        let mut ignored = Vec::new();

        if let Some(path) = first(&["AKTIS_DATABASE_PATH", "DATABASE_PATH"]) {
            self.storage.database_path = PathBuf::from(path);
        }
        if let Some(port) = first(&["AKTIS_PORT", "SERVER_PORT"]) {
            match port.trim().parse() {
                Ok(port) => self.server.port = port,
                Err(_) => ignored.push(format!("ignoring unparsable port {port:?}")),
            }
        }
        if let Some(level) = first(&["AKTIS_LOG_LEVEL", "LOG_LEVEL"]) {
            self.logging.level = level.trim().to_ascii_lowercase();
        }
        if let Some(secs) = first(&["AKTIS_HTTP_TIMEOUT_SECS"]) {
            match secs.trim().parse() {
                Ok(secs) => self.scraper.timeout_seconds = secs,
                Err(_) => ignored.push(format!("ignoring unparsable HTTP timeout {secs:?}")),
            }
        }
        ignored
    }

    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.storage.database_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("storage.database_path must not be empty".into()));
        }
        if self.server.port == 0 {
            self.server.port = ServerConfig::default().port;
        }
        if self.jira.page_size == 0 || self.confluence.page_size == 0 {
            return Err(ConfigError::Invalid("page_size must be at least 1".into()));
        }
        if self.jira.max_iterations == 0 || self.confluence.max_iterations == 0 {
            return Err(ConfigError::Invalid("max_iterations must be at least 1".into()));
        }
        if self.jira.count_cap == 0 {
            return Err(ConfigError::Invalid("jira.count_cap must be at least 1".into()));
        }
        if self.scraper.timeout_seconds == 0 {
            return Err(ConfigError::Invalid("scraper.timeout_seconds must be at least 1".into()));
        }
        let level = self.logging.level.to_ascii_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "logging.level must be one of {}, got {:?}",
                LOG_LEVELS.join("|"),
                self.logging.level
            )));
        }
        self.logging.level = level;
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn jira_policy(&self) -> PaginationPolicy {
        PaginationPolicy {
            page_size: self.jira.page_size,
            max_iterations: self.jira.max_iterations,
            inter_page_delay: Duration::from_millis(self.jira.inter_page_delay_ms),
        }
    }

    pub fn confluence_policy(&self) -> PaginationPolicy {
        PaginationPolicy {
            page_size: self.confluence.page_size,
            max_iterations: self.confluence.max_iterations,
            inter_page_delay: Duration::from_millis(self.confluence.inter_page_delay_ms),
        }
    }

    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            timeout: Duration::from_secs(self.scraper.timeout_seconds),
            fallback_user_agent: self.scraper.user_agent.clone(),
        }
    }
}

/// One store, one credential holder and one engine per container kind.
#[derive(Clone)]
pub struct Services {
    pub store: CacheStore,
    pub auth: Arc<AuthState>,
    pub jira: Arc<JiraSync>,
    pub confluence: Arc<ConfluenceSync>,
    pub progress: ProgressHub,
}

impl Services {
    pub async fn open(config: &ServiceConfig) -> Result<Self> {
        let path = &config.storage.database_path;
        let store = CacheStore::open(path)
            .with_context(|| format!("opening store at {}", path.display()))?;
        Ok(Self::from_store(store, config).await)
    }

    pub async fn sync_all(&self) -> Result<FullSyncSummary, SyncError> {
        sync_all_indexes(self.jira.as_ref(), self.confluence.as_ref()).await
    }

    /// Wire everything around an already opened store and reapply any
    /// persisted credentials.
    pub async fn from_store(store: CacheStore, config: &ServiceConfig) -> Self {
        let auth = Arc::new(AuthState::new(store.clone(), config.auth_config()));
        match auth.restore().await {
            Ok(true) => info!("using stored credentials"),
            Ok(false) => info!("no stored credentials; waiting for authentication"),
            Err(err) => warn!(error = %err, "stored credentials could not be applied"),
        }

        let http = HttpFetcher::new(Arc::clone(&auth));
        let progress = ProgressHub::default();
        let jira = Arc::new(SyncEngine::new(
            JiraSource::new(config.jira.count_cap),
            store.clone(),
            http.clone(),
            progress.clone(),
            config.jira_policy(),
        ));
        let confluence = Arc::new(SyncEngine::new(
            ConfluenceSource::new(
                config.confluence.page_size,
                Duration::from_millis(config.confluence.inter_page_delay_ms),
                config.confluence.max_iterations,
            ),
            store.clone(),
            http,
            progress.clone(),
            config.confluence_policy(),
        ));

        Self {
            store,
            auth,
            jira,
            confluence,
            progress,
        }
    }
}
