//! Scan-and-reconcile pipeline: fetch every selection, normalize prices, and
//! persist the run as one transaction.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use flatwatch_adapters::{FlatfyAdapter, FlatfyConfig, ListingSource};
use flatwatch_core::{ListingId, Offer, RateTable, RawListing, Selection, SelectionId, UnknownCurrency};
use flatwatch_storage::{HttpClientConfig, HttpFetcher, OfferStore, TokenBucketConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "flatwatch-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub api_base: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub price_min: u64,
    pub section_id: u32,
    pub lang: String,
    pub rate_limit: Option<TokenBucketConfig>,
    pub scheduler_enabled: bool,
    pub scan_cron_1: String,
    pub scan_cron_2: String,
    pub selections_file: PathBuf,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Both knobs must be set and non-zero for the limiter to be enabled.
fn rate_limit_from(burst: Option<u32>, refill_ms: Option<u64>) -> Option<TokenBucketConfig> {
    match (burst, refill_ms) {
        (Some(capacity), Some(refill_ms)) if capacity > 0 && refill_ms > 0 => Some(TokenBucketConfig {
            capacity,
            refill_every: Duration::from_millis(refill_ms),
        }),
        _ => None,
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let rate_limit = rate_limit_from(
            env_parse("FLATWATCH_RATE_LIMIT_BURST"),
            env_parse("FLATWATCH_RATE_LIMIT_REFILL_MS"),
        );

        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/flats.db?mode=rwc".to_string()),
            api_base: std::env::var("FLATWATCH_API_BASE")
                .unwrap_or_else(|_| "https://flatfy.ua/api".to_string()),
            user_agent: std::env::var("FLATWATCH_USER_AGENT")
                .unwrap_or_else(|_| "flatwatch/0.1".to_string()),
            http_timeout_secs: env_parse("FLATWATCH_HTTP_TIMEOUT_SECS").unwrap_or(20),
            price_min: env_parse("FLATWATCH_PRICE_MIN").unwrap_or(20_000),
            section_id: env_parse("FLATWATCH_SECTION_ID").unwrap_or(1),
            lang: std::env::var("FLATWATCH_LANG").unwrap_or_else(|_| "uk".to_string()),
            rate_limit,
            scheduler_enabled: std::env::var("FLATWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            scan_cron_1: std::env::var("SCAN_CRON_1").unwrap_or_else(|_| "0 0 8 * * *".to_string()),
            scan_cron_2: std::env::var("SCAN_CRON_2").unwrap_or_else(|_| "0 0 20 * * *".to_string()),
            selections_file: std::env::var("FLATWATCH_SELECTIONS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("selections.yaml")),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            token_bucket: self.rate_limit,
        }
    }

    pub fn flatfy_config(&self) -> FlatfyConfig {
        FlatfyConfig {
            base_url: self.api_base.clone(),
            price_min: self.price_min,
            section_id: self.section_id,
            lang: self.lang.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectionFailure {
    pub selection_id: SelectionId,
    pub title: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanRunSummary {
    pub run_id: Uuid,
    pub scan_at: NaiveDateTime,
    pub selections_processed: usize,
    pub selections_failed: usize,
    pub listings_fetched: usize,
    pub skipped_unknown_currency: usize,
    pub inserted: u64,
    pub deleted: u64,
    pub failures: Vec<SelectionFailure>,
}

/// Converts fetched listings into offer rows for one selection. Listings with
/// an unknown currency are returned separately and produce no row.
pub fn normalize_listings(
    listings: &[RawListing],
    selection_id: SelectionId,
    scan_at: NaiveDateTime,
    rates: &RateTable,
) -> (Vec<Offer>, Vec<(ListingId, UnknownCurrency)>) {
    let mut offers = Vec::with_capacity(listings.len());
    let mut rejected = Vec::new();
    for listing in listings {
        match Offer::from_listing(listing, selection_id, scan_at, rates) {
            Ok(offer) => offers.push(offer),
            Err(err) => rejected.push((listing.listing_id, err)),
        }
    }
    (offers, rejected)
}

pub struct ScanPipeline {
    store: OfferStore,
    source: Box<dyn ListingSource>,
    rates: RateTable,
    run_lock: Mutex<()>,
}

impl ScanPipeline {
    pub fn new(store: OfferStore, source: Box<dyn ListingSource>) -> Self {
        Self {
            store,
            source,
            rates: RateTable::default(),
            run_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &SyncConfig, store: OfferStore) -> Result<Self> {
        let http = HttpFetcher::new(config.http_config())?;
        let adapter = FlatfyAdapter::from_http(http, config.flatfy_config());
        Ok(Self::new(store, Box::new(adapter)))
    }

    pub fn with_rates(mut self, rates: RateTable) -> Self {
        self.rates = rates;
        self
    }

    pub fn store(&self) -> &OfferStore {
        &self.store
    }

    /// Runs one scan stamped with the current local time.
    pub async fn run_once(&self, allow_list: Option<&[SelectionId]>) -> Result<ScanRunSummary> {
        self.run_at(Local::now().naive_local(), allow_list).await
    }

    /// Runs one scan with an explicit scan timestamp shared by every selection.
    ///
    /// Fetch failures skip their selection; a store failure fails the whole run
    /// and leaves the database as it was.
    pub async fn run_at(
        &self,
        scan_at: NaiveDateTime,
        allow_list: Option<&[SelectionId]>,
    ) -> Result<ScanRunSummary> {
        let _running = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("scan_run", %run_id, %scan_at, source = self.source.source_id());

        async move {
            let entries = self
                .store
                .load_selections_each()
                .await
                .context("loading selections")?;
            let entries = restrict_to(entries, allow_list, |entry| match entry {
                Ok(selection) => selection.id,
                Err(invalid) => invalid.id,
            });

            let mut summary = ScanRunSummary {
                run_id,
                scan_at,
                selections_processed: 0,
                selections_failed: 0,
                listings_fetched: 0,
                skipped_unknown_currency: 0,
                inserted: 0,
                deleted: 0,
                failures: Vec::new(),
            };
            let mut offers = Vec::new();

            let mut selections = Vec::with_capacity(entries.len());
            for entry in entries {
                match entry {
                    Ok(selection) => selections.push(selection),
                    Err(invalid) => {
                        warn!(selection_id = invalid.id, error = %invalid.error, "stored selection is invalid, skipping");
                        summary.selections_failed += 1;
                        summary.failures.push(SelectionFailure {
                            selection_id: invalid.id,
                            title: invalid.title,
                            error: invalid.error.to_string(),
                        });
                    }
                }
            }

            for selection in &selections {
                match self.source.fetch_selection(selection).await {
                    Ok(listings) => {
                        let (mut staged, rejected) =
                            normalize_listings(&listings, selection.id, scan_at, &self.rates);
                        for (listing_id, err) in &rejected {
                            warn!(selection_id = selection.id, listing_id, error = %err, "skipping listing");
                        }
                        info!(
                            selection_id = selection.id,
                            fetched = listings.len(),
                            staged = staged.len(),
                            "selection fetched"
                        );
                        summary.selections_processed += 1;
                        summary.listings_fetched += listings.len();
                        summary.skipped_unknown_currency += rejected.len();
                        offers.append(&mut staged);
                    }
                    Err(err) => {
                        warn!(selection_id = selection.id, error = %err, "selection fetch failed, skipping");
                        summary.selections_failed += 1;
                        summary.failures.push(SelectionFailure {
                            selection_id: selection.id,
                            title: selection.title.clone(),
                            error: err.to_string(),
                        });
                    }
                }
            }

            let outcome = self
                .store
                .reconcile(&offers, scan_at)
                .await
                .context("persisting scan run")?;
            summary.inserted = outcome.inserted;
            summary.deleted = outcome.deleted;

            info!(
                processed = summary.selections_processed,
                failed = summary.selections_failed,
                inserted = summary.inserted,
                deleted = summary.deleted,
                "scan run complete"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }
}

fn restrict_to<T>(
    items: Vec<T>,
    allow_list: Option<&[SelectionId]>,
    id_of: impl Fn(&T) -> SelectionId,
) -> Vec<T> {
    let Some(allowed) = allow_list.filter(|ids| !ids.is_empty()) else {
        return items;
    };
    let allowed: BTreeSet<SelectionId> = allowed.iter().copied().collect();
    let known: BTreeSet<SelectionId> = items.iter().map(&id_of).collect();
    for missing in allowed.difference(&known) {
        warn!(selection_id = missing, "requested selection does not exist");
    }
    items
        .into_iter()
        .filter(|item| allowed.contains(&id_of(item)))
        .collect()
}

#[derive(Debug, Deserialize)]
struct SelectionsFile {
    selections: Vec<Selection>,
}

pub async fn load_selections_file(path: &Path) -> Result<Vec<Selection>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let file: SelectionsFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(file.selections)
}

/// Upserts every selection defined in `path`; returns how many were written.
pub async fn seed_selections(store: &OfferStore, path: &Path) -> Result<usize> {
    let selections = load_selections_file(path).await?;
    for selection in &selections {
        store
            .upsert_selection(selection)
            .await
            .with_context(|| format!("upserting selection {}", selection.id))?;
    }
    Ok(selections.len())
}

pub async fn open_store(config: &SyncConfig) -> Result<OfferStore> {
    let store = OfferStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    store.migrate().await.context("applying migrations")?;
    Ok(store)
}

pub async fn run_scan_once_from_env(allow_list: Option<&[SelectionId]>) -> Result<ScanRunSummary> {
    let config = SyncConfig::from_env();
    let store = open_store(&config).await?;
    let pipeline = ScanPipeline::from_config(&config, store.clone())?;
    let result = pipeline.run_once(allow_list).await;
    store.close().await;
    result
}

/// Builds a scheduler firing a full scan on both configured cron expressions.
/// Runs never overlap: each job waits on the pipeline's run lock.
pub async fn build_scheduler(
    config: &SyncConfig,
    pipeline: Arc<ScanPipeline>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&config.scan_cron_1, &config.scan_cron_2] {
        let pipeline = Arc::clone(&pipeline);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                if let Err(err) = pipeline.run_once(None).await {
                    error!(error = ?err, "scheduled scan failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

/// Starts the scheduler and blocks until Ctrl-C.
pub async fn run_scheduler_until_shutdown(config: &SyncConfig, pipeline: Arc<ScanPipeline>) -> Result<()> {
    let Some(mut sched) = build_scheduler(config, pipeline).await? else {
        warn!("scheduler disabled; set FLATWATCH_SCHEDULER_ENABLED=true");
        return Ok(());
    };
    sched.start().await.context("starting scheduler")?;
    info!(cron_1 = %config.scan_cron_1, cron_2 = %config.scan_cron_2, "scheduler running");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flatwatch_adapters::AdapterError;
    use flatwatch_core::SelectionQuery;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    /// Canned listings per selection; a missing entry fails like a broken upstream.
    #[derive(Clone, Default)]
    struct CannedSource {
        listings: Arc<StdMutex<HashMap<SelectionId, Vec<RawListing>>>>,
    }

    impl CannedSource {
        fn set(&self, selection_id: SelectionId, listings: Vec<RawListing>) {
            self.listings.lock().unwrap().insert(selection_id, listings);
        }
    }

    #[async_trait]
    impl ListingSource for CannedSource {
        fn source_id(&self) -> &'static str {
            "canned"
        }

        async fn fetch_selection(&self, selection: &Selection) -> Result<Vec<RawListing>, AdapterError> {
            self.listings
                .lock()
                .unwrap()
                .get(&selection.id)
                .cloned()
                .ok_or_else(|| AdapterError::Malformed {
                    url: format!("canned://{}", selection.id),
                    reason: "upstream unavailable".into(),
                })
        }
    }

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn listing(id: ListingId, price: f64, currency: &str) -> RawListing {
        RawListing {
            listing_id: id,
            area: Some(50.0),
            price,
            currency: currency.into(),
            floor: Some(5),
            inserted_at: Some(ts("2026-10-10 10:00:00")),
            renovation: Some(false),
        }
    }

    async fn pipeline_with(selections: &[Selection]) -> (ScanPipeline, CannedSource) {
        let store = OfferStore::in_memory().await.expect("store");
        for selection in selections {
            store.upsert_selection(selection).await.expect("selection");
        }
        let source = CannedSource::default();
        (ScanPipeline::new(store, Box::new(source.clone())), source)
    }

    fn query(id: SelectionId, filter: &str) -> Selection {
        Selection {
            id,
            title: format!("selection {id}"),
            query: SelectionQuery::Query {
                filter: filter.into(),
            },
        }
    }

    #[tokio::test]
    async fn price_drop_scenario_keeps_one_row_per_day() {
        let (pipeline, source) = pipeline_with(&[query(1, "city=kyiv")]).await;

        source.set(1, vec![listing(42, 100_000.0, "USD")]);
        pipeline.run_at(ts("2026-10-17 15:00:00"), None).await.unwrap();

        source.set(1, vec![listing(42, 95_000.0, "USD")]);
        let summary = pipeline.run_at(ts("2026-10-18 09:00:00"), None).await.unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.deleted, 0);

        let rows = pipeline.store().offers_for_listing(42).await.unwrap();
        let today: Vec<_> = rows
            .iter()
            .filter(|r| r.scan_date.date() == ts("2026-10-18 00:00:00").date())
            .collect();
        assert_eq!(today.len(), 1);
        assert_eq!(today[0].price, 95_000.0);

        let changes = pipeline
            .store()
            .discounts(ts("2026-10-18 00:00:00").date())
            .await
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].diff, -5_000.0);
        assert_eq!(changes[0].diff_pct, -5);
    }

    #[tokio::test]
    async fn rerun_within_a_day_is_idempotent() {
        let (pipeline, source) = pipeline_with(&[query(1, "city=kyiv")]).await;
        source.set(1, vec![listing(1, 10.0, "USD"), listing(2, 20.0, "USD")]);

        pipeline.run_at(ts("2026-10-18 08:00:00"), None).await.unwrap();
        let second = pipeline.run_at(ts("2026-10-18 20:00:00"), None).await.unwrap();

        assert_eq!(second.inserted, 2);
        assert_eq!(second.deleted, 2);
        assert_eq!(pipeline.store().count_offers().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn earlier_days_survive_overlapping_listings() {
        let (pipeline, source) = pipeline_with(&[query(1, "city=kyiv")]).await;
        source.set(1, vec![listing(1, 10.0, "USD")]);

        pipeline.run_at(ts("2026-10-16 12:00:00"), None).await.unwrap();
        pipeline.run_at(ts("2026-10-17 12:00:00"), None).await.unwrap();
        pipeline.run_at(ts("2026-10-18 12:00:00"), None).await.unwrap();

        assert_eq!(pipeline.store().offers_for_listing(1).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unknown_currency_contributes_no_row() {
        let (pipeline, source) = pipeline_with(&[query(1, "city=kyiv")]).await;
        source.set(1, vec![listing(1, 3910.0, "UAH"), listing(2, 100.0, "XYZ")]);

        let summary = pipeline.run_at(ts("2026-10-18 09:00:00"), None).await.unwrap();
        assert_eq!(summary.skipped_unknown_currency, 1);
        assert_eq!(summary.inserted, 1);

        let rows = pipeline.store().offers_for_listing(1).await.unwrap();
        assert_eq!(rows[0].price, 100.0);
        assert!(pipeline.store().offers_for_listing(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_selection_does_not_abort_the_run() {
        let (pipeline, source) =
            pipeline_with(&[query(1, "city=kyiv"), query(2, "city=lviv")]).await;
        source.set(2, vec![listing(7, 70.0, "USD")]);

        let summary = pipeline.run_at(ts("2026-10-18 09:00:00"), None).await.unwrap();
        assert_eq!(summary.selections_failed, 1);
        assert_eq!(summary.selections_processed, 1);
        assert_eq!(summary.failures[0].selection_id, 1);
        assert_eq!(pipeline.store().count_offers().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_selection_keeps_its_earlier_same_day_rows() {
        let (pipeline, source) = pipeline_with(&[query(1, "city=kyiv")]).await;
        source.set(1, vec![listing(1, 10.0, "USD")]);
        pipeline.run_at(ts("2026-10-18 08:00:00"), None).await.unwrap();

        source.listings.lock().unwrap().clear();
        pipeline.run_at(ts("2026-10-18 20:00:00"), None).await.unwrap();

        let rows = pipeline.store().offers_for_listing(1).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].scan_date, ts("2026-10-18 08:00:00"));
    }

    #[tokio::test]
    async fn allow_list_restricts_selections_and_shares_scan_time() {
        let favorites = Selection {
            id: 0,
            title: "Favorites".into(),
            query: SelectionQuery::Favorites {
                listing_ids: vec![5],
            },
        };
        let (pipeline, source) =
            pipeline_with(&[favorites, query(1, "city=kyiv"), query(2, "city=lviv")]).await;
        let mut fav = listing(5, 50.0, "USD");
        fav.renovation = None;
        source.set(0, vec![fav]);
        source.set(1, vec![listing(1, 10.0, "USD")]);
        source.set(2, vec![listing(2, 20.0, "USD")]);

        let summary = pipeline
            .run_at(ts("2026-10-18 09:00:00"), Some(&[0, 2, 77][..]))
            .await
            .unwrap();
        assert_eq!(summary.selections_processed, 2);
        assert!(pipeline.store().offers_for_listing(1).await.unwrap().is_empty());

        let fav_rows = pipeline.store().offers_for_listing(5).await.unwrap();
        let other_rows = pipeline.store().offers_for_listing(2).await.unwrap();
        assert_eq!(fav_rows[0].renovation, None);
        assert_eq!(fav_rows[0].selection_id, Some(0));
        assert_eq!(fav_rows[0].scan_date, other_rows[0].scan_date);
    }

    #[tokio::test]
    async fn selections_are_seeded_from_yaml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("selections.yaml");
        std::fs::write(
            &path,
            r#"
selections:
  - id: 0
    title: Favorites
    kind: favorites
    listing_ids: [40123456, 40123999]
  - id: 1
    title: Pechersk 2 rooms
    kind: query
    filter: "geo_id=1&room_count=2"
"#,
        )
        .unwrap();

        let store = OfferStore::in_memory().await.unwrap();
        assert_eq!(seed_selections(&store, &path).await.unwrap(), 2);

        let selections = store.load_selections().await.unwrap();
        assert_eq!(
            selections[0].query,
            SelectionQuery::Favorites {
                listing_ids: vec![40123456, 40123999]
            }
        );
        assert_eq!(
            selections[1].query,
            SelectionQuery::Query {
                filter: "geo_id=1&room_count=2".into()
            }
        );
    }

    #[tokio::test]
    async fn invalid_stored_selection_does_not_block_valid_ones() {
        let (pipeline, source) = pipeline_with(&[query(1, "city=kyiv")]).await;
        sqlx::query("INSERT INTO selection (id, title, kind, query) VALUES (2, 'bad', 'favorites', 'not json')")
            .execute(pipeline.store().pool())
            .await
            .unwrap();
        source.set(1, vec![listing(1, 10.0, "USD")]);

        let summary = pipeline.run_at(ts("2026-10-18 09:00:00"), None).await.unwrap();
        assert_eq!(summary.selections_processed, 1);
        assert_eq!(summary.selections_failed, 1);
        assert_eq!(summary.failures[0].selection_id, 2);
        assert_eq!(summary.failures[0].title, "bad");
        assert_eq!(pipeline.store().offers_for_listing(1).await.unwrap().len(), 1);

        let only_bad = pipeline.run_at(ts("2026-10-18 10:00:00"), Some(&[2][..])).await.unwrap();
        assert_eq!(only_bad.selections_failed, 1);
        assert_eq!(only_bad.selections_processed, 0);
    }

    #[test]
    fn rate_limit_needs_positive_burst_and_interval() {
        assert!(rate_limit_from(Some(5), Some(0)).is_none());
        assert!(rate_limit_from(Some(0), Some(250)).is_none());
        assert!(rate_limit_from(None, Some(250)).is_none());

        let limit = rate_limit_from(Some(5), Some(250)).expect("limiter");
        assert_eq!(limit.capacity, 5);
        assert_eq!(limit.refill_every, Duration::from_millis(250));
    }

    fn scheduler_config(enabled: bool, cron_1: &str) -> SyncConfig {
        SyncConfig {
            database_url: "sqlite::memory:".into(),
            api_base: "http://127.0.0.1:9/api".into(),
            user_agent: "flatwatch-test".into(),
            http_timeout_secs: 1,
            price_min: 20_000,
            section_id: 1,
            lang: "uk".into(),
            rate_limit: None,
            scheduler_enabled: enabled,
            scan_cron_1: cron_1.into(),
            scan_cron_2: "0 0 20 * * *".into(),
            selections_file: PathBuf::from("selections.yaml"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scheduler_is_built_only_when_enabled() {
        let (pipeline, _source) = pipeline_with(&[]).await;
        let pipeline = Arc::new(pipeline);

        let disabled = build_scheduler(&scheduler_config(false, "0 0 8 * * *"), Arc::clone(&pipeline))
            .await
            .unwrap();
        assert!(disabled.is_none());

        let enabled = build_scheduler(&scheduler_config(true, "0 0 8 * * *"), pipeline)
            .await
            .unwrap();
        assert!(enabled.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_cron_expression_is_an_error() {
        let (pipeline, _source) = pipeline_with(&[]).await;
        let err = build_scheduler(&scheduler_config(true, "every morning"), Arc::new(pipeline))
            .await
            .err()
            .expect("expected build_scheduler to fail");
        assert!(format!("{err:#}").contains("every morning"));
    }

    #[test]
    fn normalize_splits_unknown_currencies() {
        let (offers, rejected) = normalize_listings(
            &[listing(1, 39.8, "EUR"), listing(2, 1.0, "GBP")],
            3,
            ts("2026-10-18 09:00:00"),
            &RateTable::default(),
        );
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].price, 1.0);
        assert_eq!(offers[0].selection_id, Some(3));
        assert_eq!(rejected, vec![(2, UnknownCurrency("GBP".into()))]);
    }
}
