//! Remote source contracts and the Jira / Confluence REST implementations.

use std::time::Duration;

use aktis_core::{ContainerKind, ContainerRecord};
use aktis_storage::{FetchError, HttpFetcher};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "aktis-sources";

const SNIPPET_CHARS: usize = 512;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected {what} payload ({source}); begins with: {snippet}")]
    Parse {
        what: &'static str,
        snippet: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl SourceError {
    /// Parse failure carrying the head of the offending payload.
    pub fn parse(
        what: &'static str,
        raw: &[u8],
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Parse {
            what,
            snippet: snippet(raw),
            source: Box::new(source),
        }
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::Fetch(FetchError::AuthExpired { .. }))
    }
}

/// One page of child item payloads, still opaque.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemPage {
    pub items: Vec<JsonValue>,
    /// Explicit end-of-results flag, when the endpoint provides one.
    pub is_last: Option<bool>,
}

#[async_trait]
pub trait RemoteSource: Send + Sync {
    fn kind(&self) -> ContainerKind;

    /// Full container list, without counts.
    async fn fetch_containers(&self, _http: &HttpFetcher) -> Result<Vec<ContainerRecord>, SourceError>;

    async fn fetch_count(&self, _http: &HttpFetcher, container_key: &str) -> Result<u64, SourceError>;

    async fn fetch_item_page(
        &self,
        _http: &HttpFetcher,
        container_key: &str,
        offset: usize,
        limit: usize,
    ) -> Result<ItemPage, SourceError>;

    /// Whether a completed item fetch should overwrite the stored count.
    fn reconcile_count_after_fetch(&self) -> bool {
        false
    }
}

fn snippet(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).chars().take(SNIPPET_CHARS).collect()
}

fn decode<T: DeserializeOwned>(what: &'static str, bytes: &[u8]) -> Result<T, SourceError> {
    serde_json::from_slice(bytes).map_err(|err| SourceError::parse(what, bytes, err))
}

fn containers_from(kind: ContainerKind, raw: Vec<JsonValue>) -> Vec<ContainerRecord> {
    raw.into_iter()
        .filter_map(|value| match ContainerRecord::from_value(kind, value) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(kind = %kind, error = %err, "skipping container without usable key");
                None
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct IssueSearchResponse {
    #[serde(default)]
    issues: Vec<JsonValue>,
    #[serde(rename = "isLast")]
    is_last: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ResultsResponse {
    #[serde(default)]
    results: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct TotalResponse {
    total: u64,
}

/// Projects and issues from the Jira Cloud REST API v3.
#[derive(Debug, Clone)]
pub struct JiraSource {
    count_cap: usize,
}

impl JiraSource {
    pub fn new(count_cap: usize) -> Self {
        Self { count_cap: count_cap.max(1) }
    }

    fn project_jql(project_key: &str) -> String {
        let jql = format!("project=\"{}\"", project_key.replace('"', "\\\""));
        urlencoding::encode(&jql).into_owned()
    }
}

impl Default for JiraSource {
    fn default() -> Self {
        Self::new(5000)
    }
}

#[async_trait]
impl RemoteSource for JiraSource {
    fn kind(&self) -> ContainerKind {
        ContainerKind::Project
    }

    async fn fetch_containers(&self, http: &HttpFetcher) -> Result<Vec<ContainerRecord>, SourceError> {
        let body = http.get("/rest/api/3/project").await?;
        let raw: Vec<JsonValue> = decode("project list", &body)?;
        info!(count = raw.len(), "fetched projects");
        Ok(containers_from(ContainerKind::Project, raw))
    }

    async fn fetch_count(&self, http: &HttpFetcher, project_key: &str) -> Result<u64, SourceError> {
        let path = format!(
            "/rest/api/3/search/jql?jql={}&maxResults={}&fields=-all",
            Self::project_jql(project_key),
            self.count_cap
        );
        let body = http.get(&path).await?;
        let resp: IssueSearchResponse = decode("issue count", &body)?;
        let count = resp.issues.len() as u64;
        if resp.is_last == Some(false) {
            warn!(project = project_key, count, cap = self.count_cap, "issue count truncated at cap");
        }
        debug!(project = project_key, count, "counted issues");
        Ok(count)
    }

    async fn fetch_item_page(
        &self,
        http: &HttpFetcher,
        project_key: &str,
        offset: usize,
        limit: usize,
    ) -> Result<ItemPage, SourceError> {
        let path = format!(
            "/rest/api/3/search/jql?jql={}&startAt={}&maxResults={}&fields=key,summary,status,issuetype,project",
            Self::project_jql(project_key),
            offset,
            limit
        );
        let body = http.get(&path).await?;
        let resp: IssueSearchResponse = decode("issue search", &body)?;
        Ok(ItemPage {
            items: resp.issues,
            is_last: resp.is_last,
        })
    }
}

/// Spaces and pages from the Confluence Cloud REST API.
#[derive(Debug, Clone)]
pub struct ConfluenceSource {
    list_page_size: usize,
    list_delay: Duration,
    max_list_requests: usize,
}

impl ConfluenceSource {
    pub fn new(list_page_size: usize, list_delay: Duration, max_list_requests: usize) -> Self {
        Self {
            list_page_size: list_page_size.max(1),
            list_delay,
            max_list_requests: max_list_requests.max(1),
        }
    }
}

impl Default for ConfluenceSource {
    fn default() -> Self {
        Self::new(25, Duration::from_millis(500), 200)
    }
}

#[async_trait]
impl RemoteSource for ConfluenceSource {
    fn kind(&self) -> ContainerKind {
        ContainerKind::Space
    }

    async fn fetch_containers(&self, http: &HttpFetcher) -> Result<Vec<ContainerRecord>, SourceError> {
        let mut raw = Vec::new();
        let mut start = 0usize;
        for request in 0..self.max_list_requests {
            if request > 0 {
                tokio::time::sleep(self.list_delay).await;
            }
            let path = format!("/wiki/rest/api/space?start={}&limit={}", start, self.list_page_size);
            let body = http.get(&path).await?;
            let page: ResultsResponse = decode("space list", &body)?;
            let received = page.results.len();
            debug!(start, received, "fetched space list page");
            raw.extend(page.results);
            if received < self.list_page_size {
                break;
            }
            start += received;
        }
        info!(count = raw.len(), "fetched spaces");
        Ok(containers_from(ContainerKind::Space, raw))
    }

    async fn fetch_count(&self, http: &HttpFetcher, space_key: &str) -> Result<u64, SourceError> {
        let path = format!(
            "/wiki/rest/api/content?spaceKey={}&limit=0",
            urlencoding::encode(space_key)
        );
        let body = http.get(&path).await?;
        let resp: TotalResponse = decode("page count", &body)?;
        debug!(space = space_key, count = resp.total, "counted pages");
        Ok(resp.total)
    }

    async fn fetch_item_page(
        &self,
        http: &HttpFetcher,
        space_key: &str,
        offset: usize,
        limit: usize,
    ) -> Result<ItemPage, SourceError> {
        let path = format!(
            "/wiki/rest/api/content?spaceKey={}&start={}&limit={}&expand=body.storage,space",
            urlencoding::encode(space_key),
            offset,
            limit
        );
        let body = http.get(&path).await?;
        let resp: ResultsResponse = decode("page list", &body)?;
        Ok(ItemPage {
            items: resp.results,
            is_last: None,
        })
    }

    fn reconcile_count_after_fetch(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use aktis_core::{CookieSpec, CredentialBundle, ItemCount};
    use aktis_storage::{AuthConfig, AuthState, CacheStore};
    use axum::extract::Query;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    async fn serve(app: Router) -> HttpFetcher {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake remote");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("fake remote");
        });

        let auth = Arc::new(AuthState::new(
            CacheStore::temporary().expect("temporary store"),
            AuthConfig::default(),
        ));
        auth.apply(&CredentialBundle {
            cookies: vec![CookieSpec {
                name: "tenant.session.token".into(),
                value: "t".into(),
                ..Default::default()
            }],
            base_url: format!("http://{addr}"),
            ..Default::default()
        })
        .await
        .expect("apply bundle");
        HttpFetcher::new(auth)
    }

    #[tokio::test]
    async fn jira_issue_page_carries_is_last_and_quoted_jql() {
        let app = Router::new().route(
            "/rest/api/3/search/jql",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                assert_eq!(q.get("jql").map(String::as_str), Some("project=\"ENG\""));
                assert_eq!(q.get("startAt").map(String::as_str), Some("100"));
                assert_eq!(q.get("maxResults").map(String::as_str), Some("100"));
                Json(json!({
                    "issues": [{"key": "ENG-101", "fields": {"project": {"key": "ENG"}}}],
                    "isLast": true
                }))
            }),
        );
        let http = serve(app).await;

        let page = JiraSource::default()
            .fetch_item_page(&http, "ENG", 100, 100)
            .await
            .expect("issue page");
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.is_last, Some(true));
    }

    #[tokio::test]
    async fn jira_count_is_result_length_even_when_truncated() {
        let app = Router::new().route(
            "/rest/api/3/search/jql",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                assert_eq!(q.get("fields").map(String::as_str), Some("-all"));
                assert_eq!(q.get("maxResults").map(String::as_str), Some("3"));
                Json(json!({"issues": [{"id": "1"}, {"id": "2"}, {"id": "3"}], "isLast": false}))
            }),
        );
        let http = serve(app).await;

        let count = JiraSource::new(3).fetch_count(&http, "ENG").await.expect("count");
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn jira_projects_skip_entries_without_key() {
        let app = Router::new().route(
            "/rest/api/3/project",
            get(|| async {
                Json(json!([
                    {"id": "10000", "key": "ENG", "name": "Engineering"},
                    {"id": "10001", "name": "Broken"}
                ]))
            }),
        );
        let http = serve(app).await;

        let projects = JiraSource::default().fetch_containers(&http).await.expect("projects");
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].key, "ENG");
        assert_eq!(projects[0].count, ItemCount::Unknown);
    }

    #[tokio::test]
    async fn confluence_space_list_follows_pages_until_short() {
        let app = Router::new().route(
            "/wiki/rest/api/space",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                let start: usize = q.get("start").and_then(|s| s.parse().ok()).unwrap_or(0);
                let results: Vec<_> = match start {
                    0 => vec![json!({"key": "A"}), json!({"key": "B"})],
                    2 => vec![json!({"key": "C"})],
                    _ => vec![],
                };
                Json(json!({ "results": results }))
            }),
        );
        let http = serve(app).await;

        let source = ConfluenceSource::new(2, Duration::from_millis(1), 10);
        let spaces = source.fetch_containers(&http).await.expect("spaces");
        let keys: Vec<_> = spaces.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn confluence_count_reads_total_and_pages_have_no_last_flag() {
        let app = Router::new().route(
            "/wiki/rest/api/content",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                if q.get("limit").map(String::as_str) == Some("0") {
                    Json(json!({"results": [], "total": 3}))
                } else {
                    assert_eq!(q.get("expand").map(String::as_str), Some("body.storage,space"));
                    Json(json!({"results": [{"id": "9", "space": {"key": "DOC"}}]}))
                }
            }),
        );
        let http = serve(app).await;
        let source = ConfluenceSource::default();

        assert_eq!(source.fetch_count(&http, "DOC").await.expect("count"), 3);
        let page = source.fetch_item_page(&http, "DOC", 0, 25).await.expect("pages");
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.is_last, None);
        assert!(source.reconcile_count_after_fetch());
    }

    #[tokio::test]
    async fn malformed_payload_is_a_parse_error_with_snippet() {
        let app = Router::new().route(
            "/wiki/rest/api/content",
            get(|| async { "<html>login required</html>" }),
        );
        let http = serve(app).await;

        let err = ConfluenceSource::default()
            .fetch_count(&http, "DOC")
            .await
            .expect_err("html is not a count");
        match err {
            SourceError::Parse { what, snippet, .. } => {
                assert_eq!(what, "page count");
                assert!(snippet.starts_with("<html>login required"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn expired_session_surfaces_as_auth_expired() {
        let app = Router::new().route(
            "/rest/api/3/project",
            get(|| async { axum::http::StatusCode::UNAUTHORIZED }),
        );
        let http = serve(app).await;

        let err = JiraSource::default()
            .fetch_containers(&http)
            .await
            .expect_err("401");
        assert!(err.is_auth_expired());
    }
}
