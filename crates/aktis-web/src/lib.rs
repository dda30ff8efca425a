//! HTTP dispatch layer for the Aktis agent.

use std::collections::HashSet;
use std::sync::Arc;

use aktis_core::{stored_container_key, ContainerKind, CredentialBundle};
use aktis_storage::{AuthError, Partition};
use aktis_sync::{fetch_many, IndexSynchronizer, ItemPaginator, Services};
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "aktis-web";

#[derive(Clone)]
pub struct AppState {
    pub services: Services,
}

impl AppState {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectKeysBody {
    #[serde(default)]
    project_keys: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpaceKeysBody {
    #[serde(default)]
    space_keys: Vec<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/version", get(version_handler))
        .route("/api/auth", post(auth_handler))
        .route("/api/auth/status", get(auth_status_handler))
        .route("/api/projects/refresh-cache", post(projects_refresh_handler))
        .route("/api/projects/sync", post(projects_sync_handler))
        .route("/api/projects/get-issues", post(get_issues_handler))
        .route("/api/spaces/refresh-cache", post(spaces_refresh_handler))
        .route("/api/spaces/sync", post(spaces_sync_handler))
        .route("/api/spaces/get-pages", post(get_pages_handler))
        .route("/api/scrape", post(scrape_handler))
        .route("/api/data/clear-all", post(clear_all_handler))
        .route("/api/data/jira", get(jira_data_handler))
        .route("/api/data/jira/issues", get(jira_issues_handler))
        .route("/api/data/confluence", get(confluence_data_handler))
        .route("/api/data/confluence/pages", get(confluence_pages_handler))
        .fallback(not_found_handler)
        .with_state(Arc::new(state))
}

/// Bind and serve until ctrl-c.
pub async fn serve(services: Services, bind_addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app(AppState::new(services)))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed to listen for shutdown signal");
            }
            info!("shutting down");
        })
        .await?;
    Ok(())
}

fn status_json(code: StatusCode, status: &str, message: impl Into<String>) -> Response {
    (code, Json(json!({ "status": status, "message": message.into() }))).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    status_json(StatusCode::INTERNAL_SERVER_ERROR, "error", err.to_string())
}

fn not_authenticated() -> Response {
    status_json(
        StatusCode::UNAUTHORIZED,
        "error",
        "Not authenticated. Submit credentials first.",
    )
}

fn started(message: impl Into<String>) -> Response {
    status_json(StatusCode::OK, "started", message)
}

fn clean_keys(keys: Vec<String>) -> Vec<String> {
    keys.into_iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect()
}

async fn health_handler() -> Json<JsonValue> {
    Json(json!({ "status": "ok" }))
}

async fn version_handler() -> Json<JsonValue> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION"), "name": "aktis" }))
}

async fn auth_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CredentialBundle>, JsonRejection>,
) -> Response {
    let Json(bundle) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return status_json(StatusCode::BAD_REQUEST, "error", rejection.body_text());
        }
    };
    match state.services.auth.apply(&bundle).await {
        Ok(()) => status_json(StatusCode::OK, "authenticated", "Authentication successful"),
        Err(err @ (AuthError::Incomplete | AuthError::InvalidBaseUrl { .. })) => {
            warn!(error = %err, "rejected credential bundle");
            status_json(StatusCode::BAD_REQUEST, "error", err.to_string())
        }
        Err(err) => server_error(err),
    }
}

async fn auth_status_handler(State(state): State<Arc<AppState>>) -> Json<JsonValue> {
    let auth = &state.services.auth;
    Json(json!({
        "authenticated": auth.is_authenticated().await,
        "baseUrl": auth.base_url().await,
    }))
}

/// Optionally clear the index, then rebuild it in the background.
async fn start_index_sync<E>(state: &AppState, engine: Arc<E>, clear_first: bool) -> Response
where
    E: IndexSynchronizer + 'static,
{
    if !state.services.auth.is_authenticated().await {
        return not_authenticated();
    }
    let kind = engine.kind();
    if clear_first {
        match engine.clear_index() {
            Ok(removed) => info!(kind = kind.label(), removed, "cleared index before refresh"),
            Err(err) => return server_error(err),
        }
    }
    tokio::spawn(async move {
        if let Ok(summary) = engine.sync_index().await {
            info!(
                run_id = %summary.run_id,
                containers = summary.containers,
                unknown = summary.unknown,
                "background index sync finished"
            );
        }
    });
    let verb = if clear_first { "Refreshing" } else { "Syncing" };
    started(format!("{verb} {kind}s with counts"))
}

fn start_item_fetch<P>(engine: Arc<P>, kind: ContainerKind, keys: Vec<String>) -> Response
where
    P: ItemPaginator + 'static,
{
    let keys = clean_keys(keys);
    if keys.is_empty() {
        return status_json(
            StatusCode::BAD_REQUEST,
            "error",
            format!("No {kind} keys provided"),
        );
    }
    let message = format!("Fetching {}s for {} {kind}(s)", kind.item_label(), keys.len());
    tokio::spawn(async move {
        for (key, result) in fetch_many(engine, keys).await {
            if let Ok(summary) = result {
                info!(
                    container = %key,
                    stored = summary.stored,
                    stop = ?summary.stop_reason,
                    "background item fetch finished"
                );
            }
        }
    });
    started(message)
}

async fn projects_refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    let engine = Arc::clone(&state.services.jira);
    start_index_sync(&state, engine, true).await
}

async fn projects_sync_handler(State(state): State<Arc<AppState>>) -> Response {
    let engine = Arc::clone(&state.services.jira);
    start_index_sync(&state, engine, false).await
}

async fn spaces_refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    let engine = Arc::clone(&state.services.confluence);
    start_index_sync(&state, engine, true).await
}

async fn spaces_sync_handler(State(state): State<Arc<AppState>>) -> Response {
    let engine = Arc::clone(&state.services.confluence);
    start_index_sync(&state, engine, false).await
}

async fn get_issues_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ProjectKeysBody>, JsonRejection>,
) -> Response {
    if !state.services.auth.is_authenticated().await {
        return not_authenticated();
    }
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return status_json(StatusCode::BAD_REQUEST, "error", rejection.body_text()),
    };
    let engine = Arc::clone(&state.services.jira);
    start_item_fetch(engine, ContainerKind::Project, body.project_keys)
}

async fn get_pages_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SpaceKeysBody>, JsonRejection>,
) -> Response {
    if !state.services.auth.is_authenticated().await {
        return not_authenticated();
    }
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return status_json(StatusCode::BAD_REQUEST, "error", rejection.body_text()),
    };
    let engine = Arc::clone(&state.services.confluence);
    start_item_fetch(engine, ContainerKind::Space, body.space_keys)
}

/// Project index, then space index, in one background task.
async fn scrape_handler(State(state): State<Arc<AppState>>) -> Response {
    if !state.services.auth.is_authenticated().await {
        return not_authenticated();
    }
    let services = state.services.clone();
    tokio::spawn(async move {
        match services.sync_all().await {
            Ok(summary) => info!(
                projects = summary.projects.containers,
                spaces_synced = summary.spaces.is_some(),
                "background full sync finished"
            ),
            Err(err) => error!(error = %err, "background full sync failed"),
        }
    });
    started("Full scrape started")
}

async fn clear_all_handler(State(state): State<Arc<AppState>>) -> Response {
    let store = &state.services.store;
    let mut removed = 0usize;
    for partition in Partition::DATA {
        match store.clear(partition) {
            Ok(n) => removed += n,
            Err(err) => return server_error(err),
        }
    }
    info!(removed, "cleared all cached data");
    status_json(StatusCode::OK, "success", "All data cleared")
}

fn scan(state: &AppState, partition: Partition) -> Result<Vec<JsonValue>, Response> {
    state.services.store.get_all(partition).map_err(server_error)
}

/// Items of `kind` whose container is among `keys`; every item when `keys` is empty.
fn filtered_items(state: &AppState, kind: ContainerKind, keys: &HashSet<String>) -> Result<Vec<JsonValue>, Response> {
    let items = scan(state, Partition::items(kind))?;
    if keys.is_empty() {
        return Ok(items);
    }
    Ok(items
        .into_iter()
        .filter(|doc| stored_container_key(kind, doc).is_some_and(|k| keys.contains(&k)))
        .collect())
}

fn query_keys(params: &[(String, String)], name: &str) -> HashSet<String> {
    params
        .iter()
        .filter(|(k, _)| k == name)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

async fn jira_data_handler(State(state): State<Arc<AppState>>) -> Response {
    let result = scan(&state, Partition::Projects)
        .and_then(|projects| Ok((projects, scan(&state, Partition::Issues)?)));
    match result {
        Ok((projects, issues)) => Json(json!({ "projects": projects, "issues": issues })).into_response(),
        Err(resp) => resp,
    }
}

async fn confluence_data_handler(State(state): State<Arc<AppState>>) -> Response {
    let result = scan(&state, Partition::ConfluenceSpaces)
        .and_then(|spaces| Ok((spaces, scan(&state, Partition::ConfluencePages)?)));
    match result {
        Ok((spaces, pages)) => Json(json!({ "spaces": spaces, "pages": pages })).into_response(),
        Err(resp) => resp,
    }
}

async fn jira_issues_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    let keys = query_keys(&params, "projectKey");
    match filtered_items(&state, ContainerKind::Project, &keys) {
        Ok(issues) => Json(json!({ "issues": issues })).into_response(),
        Err(resp) => resp,
    }
}

async fn confluence_pages_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    let keys = query_keys(&params, "spaceKey");
    match filtered_items(&state, ContainerKind::Space, &keys) {
        Ok(pages) => Json(json!({ "pages": pages })).into_response(),
        Err(resp) => resp,
    }
}

async fn not_found_handler(uri: Uri) -> Response {
    let path = uri.path();
    if path.starts_with("/api/") || path == "/api" {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Not Found", "path": path })),
        )
            .into_response()
    } else {
        (StatusCode::NOT_FOUND, "Not Found").into_response()
    }
}
