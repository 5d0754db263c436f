//! Fetch orchestration and the reconciliation pipeline that merges per-source
//! snapshots, the previous merged output and the baseline into one ranked file.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use circ_adapters::{
    builtin_sources, run_fetch_job, run_fixture_job, load_fixture_page, AdapterContext,
    FetchJobReport, SourceAdapter, SourceDefinition, TableListingAdapter,
};
use circ_core::{
    format_timestamp, parse_date, parse_timestamp, Circular, MergeInfo, MergedSnapshot,
    ScrapingStatus, SourceSnapshot,
};
use circ_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, SnapshotStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "circ-sync";

pub const FAILED_NOTE: &str = "All scraping attempts failed";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceDefinition>,
}

impl SourceRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Registry file if present and valid, otherwise the built-in listing pages.
    pub fn load_or_builtin(path: impl AsRef<Path>) -> Self {
        match Self::load(path.as_ref()) {
            Ok(registry) => registry,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "using built-in source registry");
                Self {
                    sources: builtin_sources(),
                }
            }
        }
    }

    pub fn enabled(&self) -> Vec<SourceDefinition> {
        self.sources.iter().filter(|s| s.enabled).cloned().collect()
    }

    pub fn find(&self, source_id: &str) -> Option<&SourceDefinition> {
        self.sources
            .iter()
            .find(|s| s.source_id.eq_ignore_ascii_case(source_id))
    }
}

/// What to do with records whose identity key is `("", "")`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyKeyPolicy {
    /// Drop them all, as the long-running deployments always have.
    #[default]
    Drop,
    /// Treat every such record as its own circular.
    KeepEach,
}

impl FromStr for EmptyKeyPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "keep" | "keep_each" | "keep-each" => Ok(Self::KeepEach),
            other => anyhow::bail!("unknown empty-key policy {other:?} (expected drop|keep)"),
        }
    }
}

/// How the ranked list is cut down to size. One deployment uses one policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    Global { cap: usize },
    /// At most `per_source_cap` per source (records matching no source share
    /// one extra bucket), then at most `cap` overall.
    PerSourceThenGlobal { per_source_cap: usize, cap: usize },
}

impl RetentionPolicy {
    pub fn cap(&self) -> usize {
        match self {
            RetentionPolicy::Global { cap } | RetentionPolicy::PerSourceThenGlobal { cap, .. } => *cap,
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::Global { cap: 400 }
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionPolicy::Global { cap } => write!(f, "global:{cap}"),
            RetentionPolicy::PerSourceThenGlobal { per_source_cap, cap } => {
                write!(f, "per_source:{per_source_cap},global:{cap}")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub freshness_window: chrono::Duration,
    /// Below this many fresh records the baseline is mixed in.
    pub min_fresh_count: usize,
    pub retention: RetentionPolicy,
    /// Strictly more retained records than this reports `success`.
    pub success_threshold: usize,
    pub empty_key_policy: EmptyKeyPolicy,
    /// Feed the previous merged output back in as existing data.
    pub carry_forward: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            freshness_window: chrono::Duration::hours(4),
            min_fresh_count: 50,
            retention: RetentionPolicy::default(),
            success_threshold: 100,
            empty_key_policy: EmptyKeyPolicy::default(),
            carry_forward: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub output_path: PathBuf,
    pub baseline_path: PathBuf,
    pub sources_path: PathBuf,
    pub user_agent: Option<String>,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub accept_invalid_certs: bool,
    pub run_budget_secs: u64,
    pub source_delay_ms: u64,
    pub parallel_fetch: bool,
    pub max_rows: usize,
    pub reconcile: ReconcileConfig,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env_string(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    env_string(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(default)
}

/// Whole hours as a window; non-positive or out-of-range values keep `default`.
fn freshness_window_from_hours(hours: i64, default: chrono::Duration) -> chrono::Duration {
    match chrono::Duration::try_hours(hours) {
        Some(window) if hours > 0 => window,
        _ => {
            warn!(hours, "ignoring unusable CIRC_FRESHNESS_HOURS");
            default
        }
    }
}

impl SyncConfig {
    /// Defaults rooted at `data_dir`, no environment involved.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            output_path: data_dir.join("circulars.json"),
            baseline_path: data_dir.join("circulars-baseline.json"),
            data_dir,
            sources_path: PathBuf::from("sources.yaml"),
            user_agent: None,
            http_timeout_secs: 60,
            http_max_retries: 2,
            accept_invalid_certs: true,
            run_budget_secs: 300,
            source_delay_ms: 2000,
            parallel_fetch: false,
            max_rows: circ_adapters::DEFAULT_MAX_ROWS,
            reconcile: ReconcileConfig::default(),
            scheduler_enabled: false,
            sync_cron_1: "0 0 */3 * * *".to_string(),
            sync_cron_2: "0 30 8 * * *".to_string(),
        }
    }

    pub fn from_env() -> Self {
        let data_dir = env_string("CIRC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));
        let defaults = Self::with_data_dir(&data_dir);
        let base = defaults.reconcile.clone();

        let cap = env_parse("CIRC_RETENTION_CAP", base.retention.cap());
        let retention = match env_string("CIRC_PER_SOURCE_CAP").and_then(|v| v.trim().parse().ok()) {
            Some(per_source_cap) => RetentionPolicy::PerSourceThenGlobal { per_source_cap, cap },
            None => RetentionPolicy::Global { cap },
        };
        let empty_key_policy = match env_string("CIRC_EMPTY_KEY_POLICY") {
            Some(raw) => raw.parse().unwrap_or_else(|err| {
                warn!(error = %err, "falling back to default empty-key policy");
                EmptyKeyPolicy::default()
            }),
            None => EmptyKeyPolicy::default(),
        };

        Self {
            output_path: env_string("CIRC_OUTPUT")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_path),
            baseline_path: env_string("CIRC_BASELINE")
                .map(PathBuf::from)
                .unwrap_or(defaults.baseline_path),
            sources_path: env_string("CIRC_SOURCES")
                .map(PathBuf::from)
                .unwrap_or(defaults.sources_path),
            user_agent: env_string("CIRC_USER_AGENT"),
            http_timeout_secs: env_parse("CIRC_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            http_max_retries: env_parse("CIRC_HTTP_MAX_RETRIES", defaults.http_max_retries),
            accept_invalid_certs: env_flag("CIRC_ACCEPT_INVALID_CERTS", defaults.accept_invalid_certs),
            run_budget_secs: env_parse("CIRC_RUN_BUDGET_SECS", defaults.run_budget_secs),
            source_delay_ms: env_parse("CIRC_SOURCE_DELAY_MS", defaults.source_delay_ms),
            parallel_fetch: env_flag("CIRC_PARALLEL_FETCH", defaults.parallel_fetch),
            max_rows: env_parse("CIRC_MAX_ROWS", defaults.max_rows),
            reconcile: ReconcileConfig {
                freshness_window: freshness_window_from_hours(
                    env_parse("CIRC_FRESHNESS_HOURS", 4),
                    base.freshness_window,
                ),
                min_fresh_count: env_parse("CIRC_MIN_FRESH", base.min_fresh_count),
                retention,
                success_threshold: env_parse("CIRC_SUCCESS_THRESHOLD", base.success_threshold),
                empty_key_policy,
                carry_forward: env_flag("CIRC_CARRY_FORWARD", base.carry_forward),
            },
            scheduler_enabled: env_flag("CIRC_SCHEDULER_ENABLED", defaults.scheduler_enabled),
            sync_cron_1: env_string("CIRC_CRON_1").unwrap_or(defaults.sync_cron_1),
            sync_cron_2: env_string("CIRC_CRON_2").unwrap_or(defaults.sync_cron_2),
            data_dir,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        let mut http = HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            accept_invalid_certs: self.accept_invalid_certs,
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..BackoffPolicy::default()
            },
            ..HttpClientConfig::default()
        };
        if let Some(agent) = &self.user_agent {
            http.user_agents = vec![agent.clone()];
        }
        http
    }
}

/// Why a snapshot contributed nothing. Callers decide whether to absorb it.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot {0} not found")]
    Missing(PathBuf),
    #[error("unreadable snapshot: {0}")]
    Io(String),
    #[error("malformed snapshot: {0}")]
    Malformed(String),
    #[error("unparsable scraped_at {0:?}")]
    InvalidTimestamp(String),
    #[error("snapshot is {age_minutes} minutes old (window {window_minutes} minutes)")]
    Stale { age_minutes: i64, window_minutes: i64 },
}

impl From<StoreError> for SnapshotError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Missing(path) => SnapshotError::Missing(path),
            StoreError::Malformed { .. } => SnapshotError::Malformed(err.to_string()),
            other => SnapshotError::Io(other.to_string()),
        }
    }
}

/// A snapshot is usable while `now - scraped_at` is below the window.
pub fn check_freshness(
    snapshot: &SourceSnapshot,
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> Result<(), SnapshotError> {
    let scraped_at = parse_timestamp(&snapshot.scraped_at)
        .ok_or_else(|| SnapshotError::InvalidTimestamp(snapshot.scraped_at.clone()))?;
    let age = now - scraped_at;
    if age >= window {
        return Err(SnapshotError::Stale {
            age_minutes: age.num_minutes(),
            window_minutes: window.num_minutes(),
        });
    }
    Ok(())
}

pub async fn load_source_snapshot(
    store: &SnapshotStore,
    source_id: &str,
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> Result<Vec<Circular>, SnapshotError> {
    let path = store.source_snapshot_path(source_id);
    let snapshot: SourceSnapshot = store.read_json(&path).await?;
    check_freshness(&snapshot, now, window)?;
    Ok(snapshot.circulars)
}

pub async fn load_merged_snapshot(
    store: &SnapshotStore,
    path: impl AsRef<Path>,
) -> Result<MergedSnapshot, SnapshotError> {
    Ok(store.read_json(path).await?)
}

/// Keep the first record per identity key, in input order.
pub fn dedupe(records: Vec<Circular>, policy: EmptyKeyPolicy) -> Vec<Circular> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| {
            let key = record.identity_key();
            if key.is_empty() {
                return policy == EmptyKeyPolicy::KeepEach;
            }
            seen.insert(key)
        })
        .collect()
}

/// Newest first; equal dates keep their relative order.
pub fn sort_by_date_desc(records: &mut [Circular]) {
    records.sort_by_cached_key(|record| Reverse(parse_date(&record.date)));
}

fn owner_index(record: &Circular, sources: &[SourceDefinition]) -> Option<usize> {
    sources.iter().position(|source| source.owns(record))
}

/// Cut an already sorted list down per the policy. Order is preserved.
pub fn apply_retention(
    records: Vec<Circular>,
    policy: &RetentionPolicy,
    sources: &[SourceDefinition],
) -> Vec<Circular> {
    match *policy {
        RetentionPolicy::Global { cap } => records.into_iter().take(cap).collect(),
        RetentionPolicy::PerSourceThenGlobal { per_source_cap, cap } => {
            let mut taken: HashMap<Option<usize>, usize> = HashMap::new();
            records
                .into_iter()
                .filter(|record| {
                    let count = taken.entry(owner_index(record, sources)).or_default();
                    if *count < per_source_cap {
                        *count += 1;
                        true
                    } else {
                        false
                    }
                })
                .take(cap)
                .collect()
        }
    }
}

/// Retained records per known source; each record counts for its first owner.
pub fn source_breakdown(records: &[Circular], sources: &[SourceDefinition]) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> = sources
        .iter()
        .map(|s| (s.source_id.clone(), 0))
        .collect();
    for record in records {
        if let Some(idx) = owner_index(record, sources) {
            *counts.entry(sources[idx].source_id.clone()).or_default() += 1;
        }
    }
    counts
}

/// `failed` only when there was nothing to merge at all; a merge whose
/// candidates were all filtered away is `partial`.
pub fn scraping_status(candidates: usize, retained: usize, success_threshold: usize) -> ScrapingStatus {
    if candidates == 0 {
        ScrapingStatus::Failed
    } else if retained > success_threshold {
        ScrapingStatus::Success
    } else {
        ScrapingStatus::Partial
    }
}

/// Everything one merge cycle reads, already loaded.
#[derive(Debug, Clone, Default)]
pub struct ReconcileInputs {
    /// Fresh records per source, in registry order. Stale or unreadable sources
    /// appear with no records.
    pub fresh: Vec<(String, Vec<Circular>)>,
    pub skipped_sources: Vec<String>,
    pub prior: Option<Vec<Circular>>,
    pub baseline: Option<Vec<Circular>>,
}

impl ReconcileInputs {
    pub fn fresh_count(&self) -> usize {
        self.fresh.iter().map(|(_, records)| records.len()).sum()
    }
}

/// Build the merged snapshot. Candidates are concatenated fresh, then prior,
/// then baseline, so the freshest copy of a circular survives deduplication.
/// The baseline is only used when fresh data is below the threshold; once it
/// is not, prior records that were carried in from the baseline are dropped.
pub fn reconcile(
    inputs: ReconcileInputs,
    config: &ReconcileConfig,
    sources: &[SourceDefinition],
    now: DateTime<Utc>,
) -> MergedSnapshot {
    let fresh_count = inputs.fresh_count();
    let needs_baseline = fresh_count < config.min_fresh_count;
    let sources_used = inputs
        .fresh
        .iter()
        .filter(|(_, records)| !records.is_empty())
        .map(|(id, _)| id.clone())
        .collect::<Vec<_>>();

    let mut candidates = Vec::with_capacity(fresh_count);
    for (_, records) in inputs.fresh {
        candidates.extend(records.into_iter().map(|record| Circular {
            from_baseline: false,
            ..record
        }));
    }

    let prior = inputs
        .prior
        .unwrap_or_default()
        .into_iter()
        .filter(|record| needs_baseline || !record.from_baseline)
        .collect::<Vec<_>>();
    let prior_count = prior.len();
    candidates.extend(prior);

    let mut baseline_used = false;
    let mut baseline_count = 0;
    if needs_baseline {
        if let Some(baseline) = inputs.baseline {
            baseline_used = true;
            baseline_count = baseline.len();
            candidates.extend(baseline.into_iter().map(|record| Circular {
                from_baseline: true,
                ..record
            }));
        }
    }

    let candidate_count = candidates.len();
    let mut merged = dedupe(candidates, config.empty_key_policy);
    sort_by_date_desc(&mut merged);
    let circulars = apply_retention(merged, &config.retention, sources);

    let status = scraping_status(candidate_count, circulars.len(), config.success_threshold);
    let stamp = format_timestamp(now);
    MergedSnapshot {
        last_updated: stamp.clone(),
        total_circulars: circulars.len(),
        source_breakdown: source_breakdown(&circulars, sources),
        scraping_status: status,
        note: (status == ScrapingStatus::Failed).then(|| FAILED_NOTE.to_string()),
        merge_info: Some(MergeInfo {
            merged_at: stamp,
            sources_used,
            skipped_sources: inputs.skipped_sources,
            fresh_data_count: fresh_count,
            prior_count,
            baseline_used,
            baseline_count,
            retention_policy: config.retention.to_string(),
            total_after_merge: circulars.len(),
        }),
        circulars,
    }
}

/// Reads every input from disk, reconciles, and replaces the output file.
#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    store: SnapshotStore,
    config: ReconcileConfig,
    sources: Vec<SourceDefinition>,
    output_path: PathBuf,
    baseline_path: PathBuf,
}

impl ReconciliationEngine {
    pub fn new(
        store: SnapshotStore,
        config: ReconcileConfig,
        sources: Vec<SourceDefinition>,
        output_path: impl Into<PathBuf>,
        baseline_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            config,
            sources,
            output_path: output_path.into(),
            baseline_path: baseline_path.into(),
        }
    }

    /// Load inputs, absorbing every per-input failure into an empty contribution.
    pub async fn gather(&self, now: DateTime<Utc>) -> ReconcileInputs {
        let mut inputs = ReconcileInputs::default();

        for source in &self.sources {
            let id = source.source_id.clone();
            match load_source_snapshot(&self.store, &id, now, self.config.freshness_window).await {
                Ok(records) => {
                    info!(source_id = %id, count = records.len(), "fresh source snapshot");
                    inputs.fresh.push((id, records));
                }
                Err(err) => {
                    warn!(source_id = %id, error = %err, "source contributes no records");
                    inputs.skipped_sources.push(id.clone());
                    inputs.fresh.push((id, Vec::new()));
                }
            }
        }

        if self.config.carry_forward {
            inputs.prior = self.load_optional(&self.output_path, "previous merged snapshot").await;
        }

        let fresh_count = inputs.fresh_count();
        if fresh_count < self.config.min_fresh_count {
            info!(
                fresh_count,
                threshold = self.config.min_fresh_count,
                "too little fresh data, loading baseline"
            );
            inputs.baseline = self.load_optional(&self.baseline_path, "baseline").await;
        }

        inputs
    }

    async fn load_optional(&self, path: &Path, what: &str) -> Option<Vec<Circular>> {
        match load_merged_snapshot(&self.store, path).await {
            Ok(snapshot) => Some(snapshot.circulars),
            Err(SnapshotError::Missing(_)) => {
                debug!(path = %path.display(), "no {what}");
                None
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring {what}");
                None
            }
        }
    }

    /// One merge cycle. Only a failure to write the output is an error.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<MergedSnapshot> {
        let inputs = self.gather(now).await;
        let merged = reconcile(inputs, &self.config, &self.sources, now);
        self.store
            .write_json(&self.output_path, &merged)
            .await
            .with_context(|| format!("writing {}", self.output_path.display()))?;
        info!(
            total = merged.total_circulars,
            status = merged.scraping_status.as_str(),
            output = %self.output_path.display(),
            "merge complete"
        );
        Ok(merged)
    }
}

/// Wall-clock budget for one fetch run, passed explicitly.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self(Instant::now() + budget)
    }

    pub fn instant(&self) -> Instant {
        self.0
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.0
    }

    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchPlan {
    pub deadline: Deadline,
    pub delay_between_sources: Duration,
    pub parallel: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchRunSummary {
    pub run_id: Uuid,
    pub reports: Vec<FetchJobReport>,
    /// Not started, or cut off by the deadline.
    pub skipped: Vec<String>,
}

/// Run one fetch job per adapter within the plan's budget. Sources left over
/// when the budget runs out are skipped, not retried.
pub async fn fetch_all(
    adapters: Vec<Arc<dyn SourceAdapter>>,
    http: Arc<HttpFetcher>,
    store: SnapshotStore,
    ctx: AdapterContext,
    plan: FetchPlan,
) -> FetchRunSummary {
    let mut summary = FetchRunSummary {
        run_id: ctx.run_id,
        reports: Vec::new(),
        skipped: Vec::new(),
    };

    if plan.parallel {
        let order = adapters
            .iter()
            .map(|a| a.source_id().to_string())
            .collect::<Vec<_>>();
        let mut unfinished = order.iter().cloned().collect::<HashSet<_>>();
        let mut jobs = JoinSet::new();
        for adapter in adapters {
            let http = http.clone();
            let store = store.clone();
            let ctx = ctx.clone();
            jobs.spawn(async move {
                let source_id = adapter.source_id().to_string();
                let outcome = tokio::time::timeout_at(
                    plan.deadline.instant(),
                    run_fetch_job(adapter.as_ref(), &http, &store, &ctx),
                )
                .await;
                (source_id, outcome)
            });
        }
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok((source_id, Ok(Ok(report)))) => {
                    unfinished.remove(&source_id);
                    summary.reports.push(report);
                }
                Ok((source_id, Ok(Err(err)))) => {
                    warn!(source_id = %source_id, error = %err, "fetch job could not write snapshot");
                }
                Ok((source_id, Err(_))) => {
                    warn!(source_id = %source_id, "fetch job cut off by run budget");
                }
                Err(err) => warn!(error = %err, "fetch task panicked"),
            }
        }
        // Sources without a report are skipped, in registry order.
        summary.skipped = order.into_iter().filter(|id| unfinished.contains(id)).collect();
        return summary;
    }

    let total = adapters.len();
    for (idx, adapter) in adapters.iter().enumerate() {
        let source_id = adapter.source_id().to_string();
        if plan.deadline.is_expired() {
            warn!(source_id = %source_id, "run budget exhausted, skipping");
            summary.skipped.push(source_id);
            continue;
        }

        match run_fetch_job(adapter.as_ref(), &http, &store, &ctx).await {
            Ok(report) => summary.reports.push(report),
            Err(err) => {
                warn!(source_id = %source_id, error = %err, "fetch job could not write snapshot");
                summary.skipped.push(source_id);
            }
        }

        if idx + 1 < total && !plan.delay_between_sources.is_zero() {
            tokio::time::sleep(plan.delay_between_sources.min(plan.deadline.remaining())).await;
        }
    }
    summary
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_sources: usize,
    pub fetched_sources: usize,
    pub skipped_sources: Vec<String>,
    pub total_circulars: usize,
    pub scraping_status: ScrapingStatus,
    pub output_path: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: SourceRegistry,
    store: SnapshotStore,
    http: Arc<HttpFetcher>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::load_or_builtin(&config.sources_path);
        Self::with_registry(config, registry)
    }

    pub fn with_registry(config: SyncConfig, registry: SourceRegistry) -> Result<Self> {
        let store = SnapshotStore::new(config.data_dir.clone());
        let http = HttpFetcher::new(config.http_client_config())?;
        Ok(Self {
            config,
            registry,
            store,
            http: Arc::new(http),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    fn adapter_for(&self, source: &SourceDefinition) -> Arc<dyn SourceAdapter> {
        Arc::new(TableListingAdapter::new(source.clone(), self.config.max_rows))
    }

    fn source(&self, source_id: &str) -> Result<&SourceDefinition> {
        self.registry
            .find(source_id)
            .with_context(|| format!("no source registered as {source_id}"))
    }

    pub async fn fetch_source(&self, source_id: &str) -> Result<FetchJobReport> {
        let adapter = self.adapter_for(self.source(source_id)?);
        let ctx = AdapterContext::new();
        Ok(run_fetch_job(adapter.as_ref(), &self.http, &self.store, &ctx).await?)
    }

    /// Extract from a saved listing page instead of fetching it.
    pub async fn fetch_source_from_file(&self, source_id: &str, html_path: &Path) -> Result<FetchJobReport> {
        let adapter = self.adapter_for(self.source(source_id)?);
        let ctx = AdapterContext::new();
        let page = load_fixture_page(html_path, adapter.listing_url(), ctx.fetched_at)?;
        Ok(run_fixture_job(adapter.as_ref(), &page, &self.store, &ctx).await?)
    }

    pub async fn fetch_all(&self) -> FetchRunSummary {
        let adapters = self
            .registry
            .enabled()
            .iter()
            .map(|s| self.adapter_for(s))
            .collect::<Vec<_>>();
        let plan = FetchPlan {
            deadline: Deadline::after(Duration::from_secs(self.config.run_budget_secs)),
            delay_between_sources: Duration::from_millis(self.config.source_delay_ms),
            parallel: self.config.parallel_fetch,
        };
        fetch_all(adapters, self.http.clone(), self.store.clone(), AdapterContext::new(), plan).await
    }

    pub fn engine(&self) -> ReconciliationEngine {
        ReconciliationEngine::new(
            self.store.clone(),
            self.config.reconcile.clone(),
            self.registry.enabled(),
            self.config.output_path.clone(),
            self.config.baseline_path.clone(),
        )
    }

    pub async fn merge(&self) -> Result<MergedSnapshot> {
        self.engine().run(Utc::now()).await
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let fetched = self.fetch_all().await;
        let merged = self.merge().await?;
        Ok(SyncRunSummary {
            run_id: fetched.run_id,
            started_at,
            finished_at: Utc::now(),
            enabled_sources: self.registry.enabled().len(),
            fetched_sources: fetched.reports.len(),
            skipped_sources: fetched.skipped,
            total_circulars: merged.total_circulars,
            scraping_status: merged.scraping_status,
            output_path: self.config.output_path.display().to_string(),
        })
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&self.config.sync_cron_1, &self.config.sync_cron_2] {
            let pipeline = Arc::clone(self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    match pipeline.run_once().await {
                        Ok(summary) => info!(
                            run_id = %summary.run_id,
                            total = summary.total_circulars,
                            status = summary.scraping_status.as_str(),
                            "scheduled sync finished"
                        ),
                        Err(err) => warn!(error = %format!("{err:#}"), "scheduled sync failed"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Markdown overview of a merged snapshot for humans checking a run.
pub fn report_markdown(snapshot: &MergedSnapshot, sources: &[SourceDefinition], per_source: usize) -> String {
    let mut lines = vec!["# Circulars Summary".to_string(), String::new()];
    lines.push(format!("- Total circulars: {}", snapshot.total_circulars));
    lines.push(format!("- Last updated: {}", snapshot.last_updated));
    lines.push(format!("- Scraping status: {}", snapshot.scraping_status.as_str()));
    if let Some(note) = &snapshot.note {
        lines.push(format!("- Note: {note}"));
    }
    if let Some(info) = &snapshot.merge_info {
        lines.push(format!(
            "- Fresh records: {} (sources used: {})",
            info.fresh_data_count,
            if info.sources_used.is_empty() {
                "none".to_string()
            } else {
                info.sources_used.join(", ")
            }
        ));
        if info.baseline_used {
            lines.push(format!("- Baseline mixed in: {} records", info.baseline_count));
        }
    }

    lines.push(String::new());
    lines.push("## Source Breakdown".to_string());
    for (source, count) in &snapshot.source_breakdown {
        lines.push(format!("- {source}: {count}"));
    }

    for source in sources {
        let recent = snapshot
            .circulars
            .iter()
            .filter(|c| source.owns(c))
            .take(per_source)
            .collect::<Vec<_>>();
        lines.push(String::new());
        lines.push(format!("## Recent {} (top {})", source.display_name, per_source));
        if recent.is_empty() {
            lines.push("- none".to_string());
        }
        for (idx, circular) in recent.iter().enumerate() {
            lines.push(format!(
                "{}. {} - {}",
                idx + 1,
                circular.date,
                truncate_chars(&circular.description, 60)
            ));
        }
    }

    let dates = snapshot
        .circulars
        .iter()
        .map(|c| parse_date(&c.date))
        .collect::<Vec<_>>();
    if let (Some(min), Some(max)) = (dates.iter().min(), dates.iter().max()) {
        lines.push(String::new());
        lines.push(format!("Date range: {min} to {max}"));
    }
    lines.push(String::new());
    lines.join("\n")
}
