//! Core domain model, date parsing and record validity rules for circular notices.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "circ-core";

/// Link fragments that mark spam or navigation artifacts rather than documents.
pub const BLOCKED_LINK_FRAGMENTS: &[&str] = &[
    "atoall.com",
    "webinsight.cs.washington.edu",
    "satogo.com",
    "javascript:",
];

/// Circular numbers that only ever show up on accessibility-widget rows.
pub const JUNK_CIRCULAR_NOS: &[&str] = &["atoall", "webanywhere", "system access to go"];

/// Description phrases of placeholder rows that redirect off-site.
pub const JUNK_DESCRIPTION_PHRASES: &[&str] = &[
    "external website that opens in a new window",
    "javascript:",
    "webanywhere",
    "system access",
];

pub const MIN_DESCRIPTION_CHARS: usize = 5;

/// One published notice as extracted from a listing table.
///
/// Every field defaults to the empty string so that hand-curated baseline files
/// with missing keys still load; an empty `date` simply sorts last.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Circular {
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub circular_no: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub download_link: String,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub scraped_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Entered the merged list from the baseline file rather than a fetch.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub from_baseline: bool,
}

impl Circular {
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey {
            circular_no: self.circular_no.clone(),
            description: self.description.clone(),
        }
    }

    pub fn parsed_date(&self) -> NaiveDate {
        parse_date(&self.date)
    }

    pub fn is_valid(&self) -> bool {
        is_valid(
            &self.date,
            &self.circular_no,
            &self.description,
            &self.download_link,
        )
    }
}

/// `(circular_no, description)`: two records with equal keys are the same circular.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub circular_no: String,
    pub description: String,
}

impl IdentityKey {
    /// The `("", "")` key never identifies anything.
    pub fn is_empty(&self) -> bool {
        self.circular_no.is_empty() && self.description.is_empty()
    }
}

/// Outcome recorded by a fetch job in its per-source snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Success,
    #[default]
    NoData,
    Failed,
}

/// Output of one fetch job. Overwritten wholesale on every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub source: String,
    #[serde(default)]
    pub url: String,
    pub scraped_at: String,
    #[serde(default)]
    pub count: usize,
    pub circulars: Vec<Circular>,
    #[serde(default)]
    pub status: FetchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SourceSnapshot {
    pub fn new(source: &str, url: &str, scraped_at: DateTime<Utc>, circulars: Vec<Circular>) -> Self {
        let status = if circulars.is_empty() {
            FetchStatus::NoData
        } else {
            FetchStatus::Success
        };
        Self {
            source: source.to_string(),
            url: url.to_string(),
            scraped_at: format_timestamp(scraped_at),
            count: circulars.len(),
            circulars,
            status,
            error: None,
        }
    }

    pub fn failed(source: &str, url: &str, scraped_at: DateTime<Utc>, error: String) -> Self {
        Self {
            status: FetchStatus::Failed,
            error: Some(error),
            ..Self::new(source, url, scraped_at, Vec::new())
        }
    }
}

/// Coarse health signal of a merged snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapingStatus {
    Success,
    #[default]
    Partial,
    Failed,
}

impl ScrapingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapingStatus::Success => "success",
            ScrapingStatus::Partial => "partial",
            ScrapingStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MergeInfo {
    #[serde(default)]
    pub merged_at: String,
    #[serde(default)]
    pub sources_used: Vec<String>,
    #[serde(default)]
    pub skipped_sources: Vec<String>,
    #[serde(default)]
    pub fresh_data_count: usize,
    #[serde(default)]
    pub prior_count: usize,
    #[serde(default)]
    pub baseline_used: bool,
    #[serde(default)]
    pub baseline_count: usize,
    #[serde(default)]
    pub retention_policy: String,
    #[serde(default)]
    pub total_after_merge: usize,
}

/// The persisted, ranked artifact. Also the shape of the baseline file.
///
/// Only `circulars` is required when reading, so older or hand-edited files
/// still contribute their records.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MergedSnapshot {
    #[serde(default)]
    pub last_updated: String,
    #[serde(default)]
    pub total_circulars: usize,
    pub circulars: Vec<Circular>,
    #[serde(default)]
    pub scraping_status: ScrapingStatus,
    #[serde(default)]
    pub source_breakdown: BTreeMap<String, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_info: Option<MergeInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl MergedSnapshot {
    /// Snapshot served when nothing has been merged yet.
    pub fn empty_failed(now: DateTime<Utc>, note: &str) -> Self {
        Self {
            last_updated: format_timestamp(now),
            total_circulars: 0,
            circulars: Vec::new(),
            scraping_status: ScrapingStatus::Failed,
            source_breakdown: BTreeMap::new(),
            merge_info: None,
            note: Some(note.to_string()),
        }
    }
}

/// Fixed bottom-of-the-list date for anything [`parse_date`] cannot read.
pub fn sentinel_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1900, 1, 1).expect("1900-01-01 is a valid date")
}

/// Parses `DD/MM/YYYY`, `DD-MM-YYYY` or `YYYY-MM-DD`.
///
/// Never fails: anything else, including impossible calendar dates, maps to
/// [`sentinel_date`]. A `/` anywhere selects the day-first reading; with `-`
/// the 4-character token decides the order.
pub fn parse_date(text: &str) -> NaiveDate {
    try_parse_date(text).unwrap_or_else(sentinel_date)
}

fn try_parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if text.contains('/') {
        let parts: Vec<&str> = text.split('/').collect();
        if parts.len() != 3 {
            return None;
        }
        return ymd(parts[2], parts[1], parts[0]);
    }
    if text.contains('-') {
        let parts: Vec<&str> = text.split('-').collect();
        if parts.len() != 3 {
            return None;
        }
        if parts[2].chars().count() == 4 {
            return ymd(parts[2], parts[1], parts[0]);
        }
        if parts[0].chars().count() == 4 {
            return ymd(parts[0], parts[1], parts[2]);
        }
    }
    None
}

fn ymd(year: &str, month: &str, day: &str) -> Option<NaiveDate> {
    let year: i32 = year.trim().parse().ok()?;
    let month: u32 = month.trim().parse().ok()?;
    let day: u32 = day.trim().parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Rejects spam/navigation rows and rows without meaningful content.
pub fn is_valid(date: &str, circular_no: &str, description: &str, download_link: &str) -> bool {
    if date.trim().chars().count() <= 1 {
        return false;
    }
    if description.trim().chars().count() < MIN_DESCRIPTION_CHARS {
        return false;
    }

    let link = download_link.to_lowercase();
    if BLOCKED_LINK_FRAGMENTS.iter().any(|frag| link.contains(frag)) {
        return false;
    }

    let number = circular_no.trim().to_lowercase();
    if JUNK_CIRCULAR_NOS.iter().any(|junk| number == *junk) {
        return false;
    }

    let desc = description.to_lowercase();
    !JUNK_DESCRIPTION_PHRASES
        .iter()
        .any(|phrase| desc.contains(phrase))
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Reads RFC 3339 timestamps as well as offset-less ISO timestamps, which are
/// taken to be UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}
