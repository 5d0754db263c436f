//! Axum + Askama front end over the merged circulars file.

use std::path::PathBuf;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use circ_adapters::SourceDefinition;
use circ_core::{Circular, MergedSnapshot, ScrapingStatus};
use circ_storage::{SnapshotStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "circ-web";

pub const SITE_TITLE: &str = "Circular Notice Watch";

pub const NOT_MERGED_NOTE: &str = "No circulars have been merged yet";

const DEFAULT_PER_PAGE: usize = 25;
const MAX_PER_PAGE: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub store: SnapshotStore,
    pub output_path: PathBuf,
    pub sources: Vec<SourceDefinition>,
}

impl AppState {
    pub fn new(output_path: impl Into<PathBuf>, sources: Vec<SourceDefinition>) -> Self {
        let output_path = output_path.into();
        let root = output_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            store: SnapshotStore::new(root),
            output_path,
            sources,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct CircularsQuery {
    source: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircularsPage {
    pub source: String,
    pub page: usize,
    pub per_page: usize,
    pub total_pages: usize,
    pub total: usize,
    pub circulars: Vec<Circular>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourcesOverview {
    pub last_updated: String,
    pub scraping_status: ScrapingStatus,
    pub total_circulars: usize,
    pub sources: Vec<SourceRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRow {
    pub source_id: String,
    pub display_name: String,
    pub url: String,
    pub enabled: bool,
    pub count: usize,
}

#[derive(Debug, Clone)]
struct CategoryTab {
    source_id: String,
    display_name: String,
    count: usize,
    selected: bool,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    title: String,
    last_updated: String,
    status: String,
    note: String,
    total: usize,
    all_selected: bool,
    categories: Vec<CategoryTab>,
    circulars: Vec<Circular>,
    selected_source: String,
    page: usize,
    total_pages: usize,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/circulars.json", get(snapshot_handler))
        .route("/api/circulars", get(circulars_handler))
        .route("/api/sources", get(sources_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, output = %state.output_path.display(), "serving circulars");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// The merged file, or an empty failed snapshot when none exists yet.
async fn load_snapshot(state: &AppState) -> anyhow::Result<MergedSnapshot> {
    match state.store.read_json(&state.output_path).await {
        Ok(snapshot) => Ok(snapshot),
        Err(StoreError::Missing(path)) => {
            warn!(path = %path.display(), "merged snapshot not found");
            Ok(MergedSnapshot::empty_failed(Utc::now(), NOT_MERGED_NOTE))
        }
        Err(err) => Err(err.into()),
    }
}

async fn index_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CircularsQuery>,
) -> Response {
    match load_snapshot(&state).await {
        Ok(snapshot) => {
            let page = paginate(&snapshot.circulars, &state.sources, &query);
            let categories = state
                .sources
                .iter()
                .map(|source| CategoryTab {
                    source_id: source.source_id.clone(),
                    display_name: source.display_name.clone(),
                    count: snapshot
                        .circulars
                        .iter()
                        .filter(|c| source.belongs_to_category(c))
                        .count(),
                    selected: source.source_id.eq_ignore_ascii_case(&page.source),
                })
                .collect::<Vec<_>>();
            render_html(IndexTemplate {
                title: SITE_TITLE.to_string(),
                last_updated: snapshot.last_updated.clone(),
                status: snapshot.scraping_status.as_str().to_string(),
                note: snapshot.note.clone().unwrap_or_default(),
                total: snapshot.total_circulars,
                all_selected: !categories.iter().any(|c| c.selected),
                categories,
                circulars: page.circulars,
                selected_source: page.source,
                page: page.page,
                total_pages: page.total_pages,
            })
        }
        Err(err) => server_error(err),
    }
}

async fn snapshot_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_snapshot(&state).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => server_error(err),
    }
}

async fn circulars_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CircularsQuery>,
) -> Response {
    match load_snapshot(&state).await {
        Ok(snapshot) => Json(paginate(&snapshot.circulars, &state.sources, &query)).into_response(),
        Err(err) => server_error(err),
    }
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_snapshot(&state).await {
        Ok(snapshot) => {
            let rows = state
                .sources
                .iter()
                .map(|source| SourceRow {
                    source_id: source.source_id.clone(),
                    display_name: source.display_name.clone(),
                    url: source.url.clone(),
                    enabled: source.enabled,
                    count: snapshot.source_breakdown.get(&source.source_id).copied().unwrap_or(0),
                })
                .collect::<Vec<_>>();
            Json(SourcesOverview {
                last_updated: snapshot.last_updated,
                scraping_status: snapshot.scraping_status,
                total_circulars: snapshot.total_circulars,
                sources: rows,
            })
            .into_response()
        }
        Err(err) => server_error(err),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format!("Server error: {err:#}"),
    )
        .into_response()
}

/// Filter by category (`all` or empty means everything) and cut one page.
/// Unknown categories match nothing.
fn paginate(all: &[Circular], sources: &[SourceDefinition], query: &CircularsQuery) -> CircularsPage {
    let selected = query
        .source
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("all"))
        .map(str::to_string);

    let filtered = match &selected {
        None => all.to_vec(),
        Some(id) => match sources.iter().find(|s| s.source_id.eq_ignore_ascii_case(id)) {
            Some(source) => all
                .iter()
                .filter(|c| source.belongs_to_category(c))
                .cloned()
                .collect(),
            None => Vec::new(),
        },
    };

    let per_page = query.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
    let total_pages = filtered.len().max(1).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let total = filtered.len();
    let circulars = filtered
        .into_iter()
        .skip((page - 1) * per_page)
        .take(per_page)
        .collect();

    CircularsPage {
        source: selected.unwrap_or_else(|| "all".to_string()),
        page,
        per_page,
        total_pages,
        total,
        circulars,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use circ_adapters::builtin_sources;
    use http_body_util::BodyExt;
    use std::collections::BTreeMap;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn record(no: &str, desc: &str, source_url: &str, link: &str) -> Circular {
        Circular {
            date: "10/10/2026".into(),
            circular_no: no.into(),
            description: desc.into(),
            download_link: link.into(),
            source_url: source_url.into(),
            scraped_at: "2026-10-16T06:00:00+00:00".into(),
            source: None,
            from_baseline: false,
        }
    }

    fn sample_snapshot() -> MergedSnapshot {
        let dept = "https://dtek.karnataka.gov.in/info-4/Departmental+Circulars/kn";
        let dvp = "https://dtek.karnataka.gov.in/page/Circulars/DVP/kn";
        let mut circulars = vec![
            record("DTE/ACD/221/2026", "Revised academic calendar", dept, "https://dtek.karnataka.gov.in/a.pdf"),
            record("DVP/12/2026", "Polytechnic lab upgrade funds", dvp, ""),
            // Filed on the departmental page but numbered as a DVP circular.
            record("ಡಿವಿಪಿ/4/2026", "Workshop equipment purchase", dept, ""),
        ];
        for i in 0..30 {
            circulars.push(record(&format!("EST/{i}"), "Staff posting order", "https://elsewhere/est", ""));
        }
        MergedSnapshot {
            last_updated: "2026-10-16T06:00:00+00:00".into(),
            total_circulars: circulars.len(),
            circulars,
            scraping_status: ScrapingStatus::Partial,
            source_breakdown: BTreeMap::from([("departmental".to_string(), 2), ("dvp".to_string(), 1)]),
            merge_info: None,
            note: None,
        }
    }

    async fn state_with(snapshot: Option<&MergedSnapshot>) -> (tempfile::TempDir, AppState) {
        let dir = tempdir().unwrap();
        let output = dir.path().join("circulars.json");
        if let Some(snapshot) = snapshot {
            SnapshotStore::new(dir.path()).write_json(&output, snapshot).await.unwrap();
        }
        (dir, AppState::new(output, builtin_sources()))
    }

    async fn get(state: AppState, uri: &str) -> (StatusCode, String) {
        let resp = app(state)
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn index_renders_listing_and_tabs() {
        let (_dir, state) = state_with(Some(&sample_snapshot())).await;
        let (status, text) = get(state, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains(SITE_TITLE));
        assert!(text.contains("Revised academic calendar"));
        assert!(text.contains("a.pdf"));
        assert!(text.contains("Page 1 of 2"));
    }

    #[tokio::test]
    async fn index_survives_missing_snapshot() {
        let (_dir, state) = state_with(None).await;
        let (status, text) = get(state, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains(NOT_MERGED_NOTE));
    }

    #[tokio::test]
    async fn raw_snapshot_is_served_as_json() {
        let (_dir, state) = state_with(None).await;
        let resp = app(state)
            .oneshot(axum::http::Request::builder().uri("/circulars.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap(), "application/json");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let snapshot: MergedSnapshot = serde_json::from_slice(&body).unwrap();
        assert_eq!(snapshot.scraping_status, ScrapingStatus::Failed);
        assert_eq!(snapshot.total_circulars, 0);
    }

    #[tokio::test]
    async fn category_filter_uses_page_and_number_markers() {
        let mut snapshot = sample_snapshot();
        snapshot.circulars.push(record(
            "ACM/7/2026",
            "Lab grant release",
            "https://elsewhere/acm",
            "https://dtek.karnataka.gov.in/uploads/DVP/grant.pdf",
        ));
        snapshot.total_circulars = snapshot.circulars.len();
        let (_dir, state) = state_with(Some(&snapshot)).await;

        let numbers = |page: &serde_json::Value| -> Vec<String> {
            page["circulars"]
                .as_array()
                .unwrap()
                .iter()
                .map(|c| c["circular_no"].as_str().unwrap().to_string())
                .collect()
        };

        let (status, text) = get(state.clone(), "/api/circulars?source=dvp").await;
        assert_eq!(status, StatusCode::OK);
        let page: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(page["total"], 3);
        assert_eq!(page["source"], "dvp");
        assert_eq!(numbers(&page), vec!["DVP/12/2026", "ಡಿವಿಪಿ/4/2026", "ACM/7/2026"]);

        // DVP-numbered records filed on the departmental page only show under dvp.
        let (_, text) = get(state, "/api/circulars?source=departmental").await;
        let page: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(page["total"], 1);
        assert_eq!(numbers(&page), vec!["DTE/ACD/221/2026"]);
    }

    #[tokio::test]
    async fn pagination_clamps_out_of_range_pages() {
        let (_dir, state) = state_with(Some(&sample_snapshot())).await;
        let (_, text) = get(state.clone(), "/api/circulars?per_page=10&page=99").await;
        let page: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(page["total"], 33);
        assert_eq!(page["total_pages"], 4);
        assert_eq!(page["page"], 4);
        assert_eq!(page["circulars"].as_array().unwrap().len(), 3);

        let (_, text) = get(state, "/api/circulars?source=nowhere").await;
        let page: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(page["total"], 0);
        assert_eq!(page["page"], 1);
    }

    #[tokio::test]
    async fn sources_report_breakdown_counts() {
        let (_dir, state) = state_with(Some(&sample_snapshot())).await;
        let (status, text) = get(state, "/api/sources").await;
        assert_eq!(status, StatusCode::OK);
        let overview: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(overview["scraping_status"], "partial");
        assert_eq!(overview["last_updated"], "2026-10-16T06:00:00+00:00");
        let dept = overview["sources"]
            .as_array()
            .unwrap()
            .iter()
            .find(|r| r["source_id"] == "departmental")
            .unwrap();
        assert_eq!(dept["count"], 2);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_a_server_error() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("circulars.json");
        std::fs::write(&output, b"not json").unwrap();
        let (status, _) = get(AppState::new(output, builtin_sources()), "/api/sources").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
