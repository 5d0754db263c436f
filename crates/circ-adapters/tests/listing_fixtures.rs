use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use circ_adapters::{
    builtin_sources, load_fixture_page, SourceAdapter, SourceDefinition, TableListingAdapter,
    DEFAULT_MAX_ROWS,
};
use circ_core::{parse_date, sentinel_date, Circular};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn fetched_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 16, 6, 0, 0).single().unwrap()
}

fn builtin(source_id: &str) -> SourceDefinition {
    builtin_sources()
        .into_iter()
        .find(|s| s.source_id == source_id)
        .expect("builtin source")
}

fn parse_fixture(source_id: &str) -> Vec<Circular> {
    let adapter = TableListingAdapter::new(builtin(source_id), DEFAULT_MAX_ROWS);
    let path = workspace_root()
        .join("fixtures")
        .join(source_id)
        .join("listing.html");
    let page = load_fixture_page(path, adapter.listing_url(), fetched_at()).unwrap();
    adapter.parse_listing(&page).unwrap()
}

#[test]
fn departmental_fixture_skips_spam_and_header_rows() {
    let rows = parse_fixture("departmental");
    let numbers: Vec<&str> = rows.iter().map(|r| r.circular_no.as_str()).collect();
    assert_eq!(numbers, vec!["DTE/ACD/221/2026", "DTE/EST/117/2026", ""]);

    assert_eq!(
        rows[0].description,
        "Revised academic calendar for odd semester 2026-27"
    );
    assert_eq!(
        rows[0].download_link,
        "https://dtek.karnataka.gov.in/uploads/circulars/acd-221.pdf"
    );
    assert_eq!(
        rows[1].download_link,
        "https://dtek.karnataka.gov.in/uploads/est-117.pdf"
    );
    assert_eq!(rows[2].download_link, "");
    assert!(rows.iter().all(|r| r.source.as_deref() == Some("departmental")));
    assert!(rows.iter().all(Circular::is_valid));
}

#[test]
fn dvp_fixture_matches_golden_snapshot() {
    let rows = parse_fixture("dvp");
    let golden_path = workspace_root().join("fixtures/dvp/expected.json");
    let golden: Vec<Circular> =
        serde_json::from_str(&std::fs::read_to_string(golden_path).unwrap()).unwrap();
    assert_eq!(rows, golden);

    // Kept, but sorts last.
    assert_eq!(parse_date(&rows[2].date), sentinel_date());
}

#[test]
fn five_column_fixture_falls_back_for_short_rows() {
    let rows = parse_fixture("est");
    let numbers: Vec<&str> = rows.iter().map(|r| r.circular_no.as_str()).collect();
    assert_eq!(numbers, vec!["EST/5/2026", "EST/4/2026"]);
    assert_eq!(
        rows[0].download_link,
        "https://dtek.karnataka.gov.in/uploads/est-5.pdf"
    );
    // Four cells: read as date | number | description.
    assert_eq!(rows[1].date, "10/10/2026");
    assert_eq!(rows[1].description, "Deputation orders for workshop staff");
    assert_eq!(rows[1].download_link, "");
}
