//! Source adapter contracts, declarative table layouts and the per-source fetch job.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use circ_core::{format_timestamp, Circular, FetchStatus, SourceSnapshot};
use circ_storage::{FetchError, HttpFetcher, SnapshotStore, StoreError};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "circ-adapters";

pub const DEFAULT_MAX_ROWS: usize = 100;

/// Header labels found in the date column of listing tables.
pub const HEADER_DATE_LABELS: &[&str] = &["date", "ದಿನಾಂಕ"];

/// Descriptions shorter than this are header or filler rows, not notices.
pub const MIN_ROW_DESCRIPTION_CHARS: usize = 10;

/// href fragments never followed when looking for a download link.
pub const BLOCKED_HREF_FRAGMENTS: &[&str] = &["atoall.com", "javascript:", "webinsight"];

/// Which `<td>` holds which field. Column position is the only thing that
/// differs between listing pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnLayout {
    pub date: usize,
    pub circular_no: usize,
    pub description: usize,
    pub min_cells: usize,
}

impl ColumnLayout {
    /// date | number | description
    pub const fn three_column() -> Self {
        Self {
            date: 0,
            circular_no: 1,
            description: 2,
            min_cells: 3,
        }
    }

    /// serial | date | number | description
    pub const fn serial_prefixed() -> Self {
        Self {
            date: 1,
            circular_no: 2,
            description: 3,
            min_cells: 4,
        }
    }

    /// date | number | description | (blank) | action
    pub const fn five_column() -> Self {
        Self {
            date: 0,
            circular_no: 1,
            description: 2,
            min_cells: 5,
        }
    }

    /// Rows must reach every mapped column as well as `min_cells`.
    pub fn required_cells(&self) -> usize {
        let widest = self.date.max(self.circular_no).max(self.description) + 1;
        widest.max(self.min_cells)
    }
}

impl Default for ColumnLayout {
    fn default() -> Self {
        Self::three_column()
    }
}

fn default_enabled() -> bool {
    true
}

/// One listing page, as declared in `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDefinition {
    pub source_id: String,
    pub display_name: String,
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Prefix for site-relative links.
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub layout: ColumnLayout,
    /// Used for rows too short for `layout` but long enough for this one.
    #[serde(default)]
    pub fallback_layout: Option<ColumnLayout>,
    #[serde(default)]
    pub max_rows: Option<usize>,
    /// Substring of `source_url` that identifies this source's records.
    #[serde(default)]
    pub url_marker: Option<String>,
    #[serde(default)]
    pub circular_no_markers: Vec<String>,
    /// Records whose `download_link` contains one of these also belong here.
    #[serde(default)]
    pub download_link_markers: Vec<String>,
    /// Records whose `circular_no` contains one of these never belong here,
    /// even when this source owns them.
    #[serde(default)]
    pub excluded_circular_no_markers: Vec<String>,
}

fn contains_any(text: &str, markers: &[String]) -> bool {
    markers.iter().any(|m| !m.is_empty() && text.contains(m.as_str()))
}

impl SourceDefinition {
    /// Same source by name (case-insensitive) or by `source_url` marker.
    pub fn owns(&self, record: &Circular) -> bool {
        if record
            .source
            .as_deref()
            .is_some_and(|s| s.trim().eq_ignore_ascii_case(&self.source_id))
        {
            return true;
        }
        self.url_marker
            .as_deref()
            .is_some_and(|marker| !marker.is_empty() && record.source_url.contains(marker))
    }

    /// Looser membership used for browsing: also matches on circular number patterns.
    pub fn belongs_to_category(&self, record: &Circular) -> bool {
        if contains_any(&record.circular_no, &self.excluded_circular_no_markers) {
            return false;
        }
        self.owns(record)
            || contains_any(&record.circular_no, &self.circular_no_markers)
            || contains_any(&record.download_link, &self.download_link_markers)
    }

    /// Layout for a row with `cells` cells, if any fits.
    pub fn layout_for(&self, cells: usize) -> Option<ColumnLayout> {
        std::iter::once(self.layout)
            .chain(self.fallback_layout)
            .find(|layout| cells >= layout.required_cells())
    }
}

pub fn builtin_sources() -> Vec<SourceDefinition> {
    let base = "https://dtek.karnataka.gov.in";
    let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    let def = |id: &str, name: &str, path: &str, layout: ColumnLayout, marker: &str| SourceDefinition {
        source_id: id.to_string(),
        display_name: name.to_string(),
        url: format!("{base}{path}"),
        enabled: true,
        base_url: base.to_string(),
        layout,
        fallback_layout: (layout != ColumnLayout::three_column()).then(ColumnLayout::three_column),
        max_rows: None,
        url_marker: Some(marker.to_string()),
        circular_no_markers: Vec::new(),
        download_link_markers: Vec::new(),
        excluded_circular_no_markers: Vec::new(),
    };
    let dvp_numbers = strings(&["DVP", "ಡಿವಿಪಿ"]);
    vec![
        SourceDefinition {
            excluded_circular_no_markers: dvp_numbers.clone(),
            ..def(
                "departmental",
                "Departmental Circulars",
                "/info-4/Departmental+Circulars/kn",
                ColumnLayout::three_column(),
                "Departmental+Circulars",
            )
        },
        SourceDefinition {
            circular_no_markers: dvp_numbers,
            download_link_markers: strings(&["/DVP/"]),
            ..def(
                "dvp",
                "DVP Circulars",
                "/page/Circulars/DVP/kn",
                ColumnLayout::serial_prefixed(),
                "Circulars/DVP",
            )
        },
        def(
            "est",
            "Establishment Circulars",
            "/page/Circulars/EST/kn",
            ColumnLayout::five_column(),
            "Circulars/EST",
        ),
        def(
            "acm",
            "Academic Circulars",
            "/page/Circulars/ACM/kn",
            ColumnLayout::five_column(),
            "Circulars/ACM",
        ),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        }
    }
}

impl Default for AdapterContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("invalid selector {0}")]
    Selector(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn listing_url(&self) -> &str;

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPage, AdapterError>;

    fn parse_listing(&self, page: &FetchedPage) -> Result<Vec<Circular>, AdapterError>;
}

/// The single configurable adapter behind every table-shaped listing.
#[derive(Debug, Clone)]
pub struct TableListingAdapter {
    definition: SourceDefinition,
    max_rows: usize,
}

impl TableListingAdapter {
    pub fn new(definition: SourceDefinition, default_max_rows: usize) -> Self {
        let max_rows = definition.max_rows.unwrap_or(default_max_rows);
        Self {
            definition,
            max_rows,
        }
    }
}

#[async_trait]
impl SourceAdapter for TableListingAdapter {
    fn source_id(&self) -> &str {
        &self.definition.source_id
    }

    fn listing_url(&self) -> &str {
        &self.definition.url
    }

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPage, AdapterError> {
        let resp = http
            .fetch_bytes(ctx.run_id, &self.definition.source_id, &self.definition.url)
            .await?;
        Ok(FetchedPage {
            url: resp.final_url,
            body: resp.body,
            fetched_at: ctx.fetched_at,
        })
    }

    fn parse_listing(&self, page: &FetchedPage) -> Result<Vec<Circular>, AdapterError> {
        let html = String::from_utf8_lossy(&page.body);
        extract_rows(&html, &self.definition, self.max_rows, page.fetched_at)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector(format!("{css}: {e}")))
}

fn cell_text(cell: &ElementRef<'_>) -> String {
    cell.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Walk `<tr>` rows (the first is a header) and map cells through the layout.
/// Malformed rows are skipped, never reported.
pub fn extract_rows(
    html: &str,
    definition: &SourceDefinition,
    max_rows: usize,
    scraped_at: DateTime<Utc>,
) -> Result<Vec<Circular>, AdapterError> {
    let document = Html::parse_document(html);
    let tr = selector("tr")?;
    let td = selector("td")?;
    let anchor = selector("a[href]")?;
    let stamp = format_timestamp(scraped_at);

    let mut out = Vec::new();
    for row in document.select(&tr).skip(1).take(max_rows) {
        let cells: Vec<ElementRef<'_>> = row.select(&td).collect();
        let Some(layout) = definition.layout_for(cells.len()) else {
            continue;
        };

        let date = cell_text(&cells[layout.date]);
        let circular_no = cell_text(&cells[layout.circular_no]);
        let description = cell_text(&cells[layout.description]);

        let date_lower = date.to_lowercase();
        if HEADER_DATE_LABELS.iter().any(|label| date_lower == *label)
            || description.chars().count() < MIN_ROW_DESCRIPTION_CHARS
        {
            continue;
        }

        let hrefs = cells
            .iter()
            .filter_map(|cell| cell.select(&anchor).next())
            .filter_map(|a| a.value().attr("href"));
        let download_link = first_download_link(hrefs, &definition.base_url);

        if !circ_core::is_valid(&date, &circular_no, &description, &download_link) {
            continue;
        }

        out.push(Circular {
            date,
            circular_no,
            description,
            download_link,
            source_url: definition.url.clone(),
            scraped_at: stamp.clone(),
            source: Some(definition.source_id.clone()),
            from_baseline: false,
        });
    }
    Ok(out)
}

/// First non-blocked href wins, even when it cannot be made absolute.
pub fn first_download_link<'a>(hrefs: impl IntoIterator<Item = &'a str>, base_url: &str) -> String {
    for href in hrefs {
        let lower = href.to_lowercase();
        if BLOCKED_HREF_FRAGMENTS.iter().any(|frag| lower.contains(frag)) {
            continue;
        }
        return resolve_href(href.trim(), base_url);
    }
    String::new()
}

pub fn resolve_href(href: &str, base_url: &str) -> String {
    if href.starts_with('/') {
        format!("{}{}", base_url.trim_end_matches('/'), href)
    } else if href.starts_with("http") {
        href.to_string()
    } else {
        String::new()
    }
}

/// Read a saved listing page from disk in place of an HTTP fetch.
pub fn load_fixture_page(path: impl AsRef<Path>, url: &str, fetched_at: DateTime<Utc>) -> Result<FetchedPage> {
    let path = path.as_ref();
    let body = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(FetchedPage {
        url: url.to_string(),
        body,
        fetched_at,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchJobReport {
    pub source_id: String,
    pub status: FetchStatus,
    pub count: usize,
    pub path: PathBuf,
    pub error: Option<String>,
}

/// Fetch, extract and overwrite one per-source snapshot.
///
/// Fetch and parse failures still produce a snapshot (zero records, status
/// `failed`) so an older file can never be mistaken for this run's result. Only
/// a failure to write the snapshot itself is returned as an error.
pub async fn run_fetch_job(
    adapter: &dyn SourceAdapter,
    http: &HttpFetcher,
    store: &SnapshotStore,
    ctx: &AdapterContext,
) -> Result<FetchJobReport, AdapterError> {
    let fetched = adapter.fetch_listing(http, ctx).await;
    let parsed = fetched.and_then(|page| adapter.parse_listing(&page));
    write_job_snapshot(adapter, store, ctx, parsed).await
}

/// Like [`run_fetch_job`] but parsing an already saved page.
pub async fn run_fixture_job(
    adapter: &dyn SourceAdapter,
    page: &FetchedPage,
    store: &SnapshotStore,
    ctx: &AdapterContext,
) -> Result<FetchJobReport, AdapterError> {
    let parsed = adapter.parse_listing(page);
    write_job_snapshot(adapter, store, ctx, parsed).await
}

async fn write_job_snapshot(
    adapter: &dyn SourceAdapter,
    store: &SnapshotStore,
    ctx: &AdapterContext,
    parsed: Result<Vec<Circular>, AdapterError>,
) -> Result<FetchJobReport, AdapterError> {
    let source_id = adapter.source_id();
    let snapshot = match parsed {
        Ok(circulars) => {
            info!(run_id = %ctx.run_id, source_id, count = circulars.len(), "extracted circulars");
            SourceSnapshot::new(source_id, adapter.listing_url(), ctx.fetched_at, circulars)
        }
        Err(err) => {
            warn!(run_id = %ctx.run_id, source_id, error = %err, "fetch job failed");
            SourceSnapshot::failed(source_id, adapter.listing_url(), ctx.fetched_at, err.to_string())
        }
    };

    let path = store.source_snapshot_path(source_id);
    store.write_json(&path, &snapshot).await?;
    Ok(FetchJobReport {
        source_id: source_id.to_string(),
        status: snapshot.status,
        count: snapshot.count,
        path,
        error: snapshot.error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 6, 0, 0).single().unwrap()
    }

    fn source(layout: ColumnLayout) -> SourceDefinition {
        SourceDefinition {
            source_id: "test".into(),
            display_name: "Test".into(),
            url: "https://example.gov.in/page/Circulars/TEST/kn".into(),
            enabled: true,
            base_url: "https://example.gov.in".into(),
            layout,
            fallback_layout: None,
            max_rows: None,
            url_marker: Some("Circulars/TEST".into()),
            circular_no_markers: vec!["TST".into()],
            download_link_markers: vec!["/TEST/".into()],
            excluded_circular_no_markers: vec!["OTHER".into()],
        }
    }

    fn table(rows: &[&str]) -> String {
        let mut html = String::from("<html><body><table><tr><th>Date</th><th>No</th><th>Subject</th></tr>");
        for row in rows {
            html.push_str(row);
        }
        html.push_str("</table></body></html>");
        html
    }

    #[test]
    fn three_column_rows_map_in_order() {
        let html = table(&[
            r#"<tr><td>05/03/2024</td><td>DTE/117</td><td>Transfer order of lecturers</td><td><a href="/uploads/117.pdf">PDF</a></td></tr>"#,
        ]);
        let rows = extract_rows(&html, &source(ColumnLayout::three_column()), 100, fixed_time()).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.date, "05/03/2024");
        assert_eq!(row.circular_no, "DTE/117");
        assert_eq!(row.description, "Transfer order of lecturers");
        assert_eq!(row.download_link, "https://example.gov.in/uploads/117.pdf");
        assert_eq!(row.source.as_deref(), Some("test"));
        assert_eq!(row.scraped_at, format_timestamp(fixed_time()));
    }

    #[test]
    fn serial_prefixed_layout_skips_the_serial_column() {
        let html = table(&[
            r#"<tr><td>1</td><td>12-01-2024</td><td>DVP/9</td><td>Diploma valuation programme</td></tr>"#,
        ]);
        let rows = extract_rows(&html, &source(ColumnLayout::serial_prefixed()), 100, fixed_time()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].date, "12-01-2024");
        assert_eq!(rows[0].circular_no, "DVP/9");
        assert_eq!(rows[0].download_link, "");
    }

    #[test]
    fn short_header_and_spam_rows_are_dropped() {
        let html = table(&[
            r#"<tr><td>05/03/2024</td><td>1</td></tr>"#,
            r#"<tr><td>ದಿನಾಂಕ</td><td>No</td><td>Subject of the circular</td></tr>"#,
            r#"<tr><td>05/03/2024</td><td>2</td><td>Too short</td></tr>"#,
            r#"<tr><td>05/03/2024</td><td>atoall</td><td>Accessibility helper row</td></tr>"#,
            r#"<tr><td>05/03/2024</td><td>3</td><td>External website that opens in a new window</td></tr>"#,
            r#"<tr><td>05/03/2024</td><td>4</td><td>Revised academic calendar</td></tr>"#,
        ]);
        let rows = extract_rows(&html, &source(ColumnLayout::three_column()), 100, fixed_time()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].circular_no, "4");
    }

    #[test]
    fn short_rows_fall_back_to_the_three_column_layout() {
        let html = table(&[
            r#"<tr><td>05/03/2024</td><td>EST/4</td><td>Deputation of teaching staff</td><td></td><td>View</td></tr>"#,
            r#"<tr><td>06/03/2024</td><td>EST/5</td><td>Promotion list of lecturers</td></tr>"#,
            r#"<tr><td>07/03/2024</td><td>EST/6</td></tr>"#,
        ]);
        let strict = source(ColumnLayout::five_column());
        let rows = extract_rows(&html, &strict, 100, fixed_time()).unwrap();
        assert_eq!(rows.len(), 1);

        let lenient = SourceDefinition {
            fallback_layout: Some(ColumnLayout::three_column()),
            ..strict
        };
        let numbers: Vec<String> = extract_rows(&html, &lenient, 100, fixed_time())
            .unwrap()
            .into_iter()
            .map(|c| c.circular_no)
            .collect();
        assert_eq!(numbers, vec!["EST/4", "EST/5"]);
        assert_eq!(lenient.layout_for(2), None);
        assert_eq!(lenient.layout_for(4), Some(ColumnLayout::three_column()));
    }

    #[test]
    fn max_rows_caps_rows_after_the_header() {
        let body: Vec<String> = (1..=5)
            .map(|i| format!("<tr><td>0{i}/01/2024</td><td>{i}</td><td>Circular number {i} text</td></tr>"))
            .collect();
        let refs: Vec<&str> = body.iter().map(String::as_str).collect();
        let rows = extract_rows(&table(&refs), &source(ColumnLayout::three_column()), 3, fixed_time()).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].circular_no, "3");
    }

    #[test]
    fn download_link_skips_blocked_hrefs_and_stops_at_first_usable() {
        let base = "https://example.gov.in/";
        assert_eq!(
            first_download_link(["javascript:void(0)", "https://www.atoall.com", "/a.pdf", "/b.pdf"], base),
            "https://example.gov.in/a.pdf"
        );
        assert_eq!(first_download_link(["docs/a.pdf", "/b.pdf"], base), "");
        assert_eq!(first_download_link(["http://other.in/x.pdf"], base), "http://other.in/x.pdf");
        assert_eq!(first_download_link(std::iter::empty(), base), "");
    }

    #[test]
    fn layout_required_cells_covers_mapped_columns() {
        assert_eq!(ColumnLayout::three_column().required_cells(), 3);
        assert_eq!(ColumnLayout::serial_prefixed().required_cells(), 4);
        assert_eq!(ColumnLayout::five_column().required_cells(), 5);
        let odd = ColumnLayout {
            date: 0,
            circular_no: 1,
            description: 6,
            min_cells: 3,
        };
        assert_eq!(odd.required_cells(), 7);
    }

    #[test]
    fn ownership_matches_source_name_or_url_marker() {
        let def = source(ColumnLayout::three_column());
        let by_name = Circular {
            source: Some("TEST".into()),
            ..Circular::default()
        };
        let by_url = Circular {
            source_url: "https://example.gov.in/page/Circulars/TEST/kn".into(),
            ..Circular::default()
        };
        let by_number = Circular {
            circular_no: "TST-4".into(),
            ..Circular::default()
        };
        assert!(def.owns(&by_name));
        assert!(def.owns(&by_url));
        assert!(!def.owns(&by_number));
        assert!(def.belongs_to_category(&by_number));
        assert!(!def.owns(&Circular::default()));
    }

    #[test]
    fn category_adds_link_markers_and_honours_exclusions() {
        let def = source(ColumnLayout::three_column());
        let by_link = Circular {
            download_link: "https://example.gov.in/uploads/TEST/x.pdf".into(),
            ..Circular::default()
        };
        let excluded = Circular {
            circular_no: "OTHER/9".into(),
            source: Some("test".into()),
            ..Circular::default()
        };
        assert!(!def.owns(&by_link));
        assert!(def.belongs_to_category(&by_link));
        assert!(def.owns(&excluded));
        assert!(!def.belongs_to_category(&excluded));
    }

    #[test]
    fn builtin_sources_have_distinct_ids_and_markers() {
        let sources = builtin_sources();
        assert_eq!(sources.len(), 4);
        let dvp = sources.iter().find(|s| s.source_id == "dvp").unwrap();
        assert_eq!(dvp.layout, ColumnLayout::serial_prefixed());
        assert!(dvp.url.contains(dvp.url_marker.as_deref().unwrap()));
        assert_eq!(dvp.fallback_layout, Some(ColumnLayout::three_column()));

        let departmental = sources.iter().find(|s| s.source_id == "departmental").unwrap();
        assert_eq!(departmental.fallback_layout, None);
        let dvp_numbered = Circular {
            circular_no: "ಡಿವಿಪಿ/4/2026".into(),
            source_url: departmental.url.clone(),
            ..Circular::default()
        };
        assert!(departmental.owns(&dvp_numbered));
        assert!(!departmental.belongs_to_category(&dvp_numbered));
        assert!(dvp.belongs_to_category(&dvp_numbered));
    }

    struct FailingAdapter;

    #[async_trait]
    impl SourceAdapter for FailingAdapter {
        fn source_id(&self) -> &str {
            "broken"
        }

        fn listing_url(&self) -> &str {
            "https://example.gov.in/broken"
        }

        async fn fetch_listing(
            &self,
            _http: &HttpFetcher,
            _ctx: &AdapterContext,
        ) -> Result<FetchedPage, AdapterError> {
            Err(AdapterError::Message("connection reset".into()))
        }

        fn parse_listing(&self, _page: &FetchedPage) -> Result<Vec<Circular>, AdapterError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn failed_fetch_still_overwrites_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let http = HttpFetcher::new(Default::default()).unwrap();
        let ctx = AdapterContext {
            run_id: Uuid::new_v4(),
            fetched_at: fixed_time(),
        };

        let report = run_fetch_job(&FailingAdapter, &http, &store, &ctx).await.unwrap();
        assert_eq!(report.status, FetchStatus::Failed);
        assert_eq!(report.count, 0);

        let snap: SourceSnapshot = store.read_json(&report.path).await.unwrap();
        assert_eq!(snap.status, FetchStatus::Failed);
        assert!(snap.circulars.is_empty());
        assert_eq!(snap.error.as_deref(), Some("connection reset"));
    }

    #[tokio::test]
    async fn fixture_job_writes_source_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let adapter = TableListingAdapter::new(source(ColumnLayout::three_column()), DEFAULT_MAX_ROWS);
        let page = FetchedPage {
            url: adapter.listing_url().to_string(),
            body: table(&[r#"<tr><td>05/03/2024</td><td>7</td><td>Examination timetable</td></tr>"#]).into_bytes(),
            fetched_at: fixed_time(),
        };
        let ctx = AdapterContext {
            run_id: Uuid::new_v4(),
            fetched_at: fixed_time(),
        };

        let report = run_fixture_job(&adapter, &page, &store, &ctx).await.unwrap();
        assert_eq!(report.status, FetchStatus::Success);
        assert_eq!(report.path, dir.path().join("data_test.json"));
        let snap: SourceSnapshot = store.read_json(&report.path).await.unwrap();
        assert_eq!(snap.count, 1);
        assert_eq!(snap.source, "test");
        assert_eq!(snap.scraped_at, format_timestamp(fixed_time()));
    }
}
