//! Staged data-refresh pipeline: raw ingest, staging landing, snapshot
//! reconciliation, core promotion, and status derivation, plus the two
//! per-domain orchestrators that chain the stages under a run lock.
//!
//! Every stage is idempotent for a given run id, so a crashed run can be
//! resumed from its first incomplete stage without duplicating writes.

use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use ypf_core::{
    derive_status, option_set_hash, Classification, DeltaEntry, PolicyStatus, ProductKind,
    ProductOption, RawPage, RunId, StagingRecord,
};
use ypf_sources::{
    explode_policy_pages, explode_product_base_pages, explode_product_option_pages,
    option_from_payload, policy_from_payload, product_from_payload, Enricher, FetchedPage,
    PageFeed, ParseReport, POLICY_SOURCE, PRODUCT_BASE_SOURCE, PRODUCT_OPTION_SOURCE,
    PRODUCT_SOURCE,
};
use ypf_storage::{ApiClientConfig, BackoffPolicy, EltStore, FetchError, StoreError};

pub const CRATE_NAME: &str = "ypf-elt";

/// Hard ceiling on pages per ingest, against a misbehaving upstream that
/// never reports its last page.
const MAX_PAGES_PER_RUN: u32 = 10_000;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EltConfig {
    pub database_url: String,
    pub policy_base_url: String,
    pub policy_api_key: String,
    pub page_size: u32,
    pub start_page: u32,
    /// 0 means "until the upstream runs out of pages".
    pub end_page: u32,
    pub deposit_base_url: String,
    pub saving_base_url: String,
    pub finlife_auth_key: String,
    pub top_fin_grp_no: String,
    pub http_timeout: Duration,
    pub retry_max: usize,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
}

fn env_str(name: &str) -> anyhow::Result<String> {
    env::var(name).with_context(|| format!("missing environment variable {name}"))
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_u32_or(name: &str, default: u32) -> anyhow::Result<u32> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => v.parse().with_context(|| format!("{name} must be an integer")),
        _ => Ok(default),
    }
}

impl EltConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: env_str("DATABASE_URL")?,
            policy_base_url: env_or(
                "YOUTH_BASE_URL",
                "https://www.youthcenter.go.kr/go/ythip/getPlcy",
            ),
            policy_api_key: env_str("YOUTH_API_KEY")?,
            page_size: env_u32_or("PAGE_SIZE", 100)?,
            start_page: env_u32_or("START_PAGE", 1)?,
            end_page: env_u32_or("END_PAGE", 0)?,
            deposit_base_url: env_or(
                "FINLIFE_DEPOSIT_URL",
                "https://finlife.fss.or.kr/finlifeapi/depositProductsSearch.json",
            ),
            saving_base_url: env_or(
                "FINLIFE_SAVING_URL",
                "https://finlife.fss.or.kr/finlifeapi/savingProductsSearch.json",
            ),
            finlife_auth_key: env_str("FINLIFE_AUTH_KEY")?,
            top_fin_grp_no: env_or("FINLIFE_TOP_FIN_GRP_NO", "020000"),
            http_timeout: Duration::from_secs(env_u32_or("HTTP_TIMEOUT", 20)? as u64),
            retry_max: env_u32_or("RETRY_MAX", 5)? as usize,
            gemini_api_key: env::var("GEMINI_API_KEY").ok().filter(|v| !v.is_empty()),
            gemini_model: env_or("GEMINI_MODEL", "gemini-2.0-flash"),
        })
    }

    pub fn api_client_config(&self) -> ApiClientConfig {
        ApiClientConfig {
            timeout: self.http_timeout,
            user_agent: None,
            backoff: BackoffPolicy {
                max_retries: self.retry_max,
                ..BackoffPolicy::default()
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StageError {
    #[error("run already in flight for {0}")]
    LockHeld(String),
    #[error("no prior run recorded for {0}")]
    NoRun(String),
    #[error("fetch failed on page {page_no}")]
    Fetch {
        page_no: u32,
        #[source]
        source: FetchError,
    },
    #[error("no parseable records for {source_name} {run_id}")]
    EmptyParse { source_name: String, run_id: RunId },
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for StageError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LockHeld(source) => StageError::LockHeld(source),
            other => StageError::Store(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage 1: raw ingest
// ---------------------------------------------------------------------------

/// Walks the feed's pages in order and appends each verbatim response to the
/// raw store. Stops at the upstream-reported last page, on an empty page, or
/// at the configured end page.
pub struct RawIngest<'a> {
    pub store: &'a dyn EltStore,
    pub start_page: u32,
    pub end_page: u32,
}

impl<'a> RawIngest<'a> {
    pub async fn run(&self, feed: &dyn PageFeed, run_id: RunId) -> Result<u32, StageError> {
        let mut page_no = self.start_page.max(1);
        let mut pages_ingested = 0u32;
        let mut last_page_seen = 0u32;

        loop {
            let fetched = feed
                .fetch_page(run_id, page_no)
                .await
                .map_err(|source| StageError::Fetch { page_no, source })?;
            self.append(feed, run_id, &fetched).await?;
            pages_ingested += 1;

            let meta = feed.paging_meta(&fetched.payload);
            if last_page_seen == 0 && meta.total_pages > 0 {
                last_page_seen = meta.total_pages;
                info!(source = feed.source(), %run_id, total_pages = last_page_seen, "paging detected");
            }

            if self.end_page > 0 && page_no >= self.end_page {
                break;
            }
            if last_page_seen > 0 && page_no >= last_page_seen {
                break;
            }
            if feed.page_items(&fetched.payload).is_empty() {
                info!(source = feed.source(), %run_id, page_no, "empty page, stopping");
                break;
            }
            if pages_ingested >= MAX_PAGES_PER_RUN {
                warn!(source = feed.source(), %run_id, "page ceiling reached, stopping");
                break;
            }
            page_no += 1;
        }

        info!(source = feed.source(), %run_id, pages = pages_ingested, "raw ingest done");
        Ok(pages_ingested)
    }

    async fn append(
        &self,
        feed: &dyn PageFeed,
        run_id: RunId,
        fetched: &FetchedPage,
    ) -> Result<(), StageError> {
        self.store
            .append_raw_page(&RawPage {
                ingest_id: Uuid::new_v4(),
                run_id,
                source: feed.source().to_string(),
                page_no: fetched.page_no,
                http_status: fetched.http_status,
                request_params: fetched.request_params.clone(),
                payload: fetched.payload.clone(),
                fetched_at: Utc::now(),
            })
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stage 2: staging lander
// ---------------------------------------------------------------------------

/// Explodes a run's raw pages into structured staging records. Skips the
/// whole run if records for it have already landed.
pub struct StagingLander<'a> {
    pub store: &'a dyn EltStore,
}

impl<'a> StagingLander<'a> {
    pub async fn run(
        &self,
        raw_source: &str,
        staging_source: &str,
        run_id: RunId,
        allow_empty: bool,
        explode: fn(&[RawPage]) -> ParseReport,
    ) -> Result<usize, StageError> {
        if self.store.staging_landed(staging_source, run_id).await? {
            info!(source = staging_source, %run_id, "staging already landed, skipping");
            return Ok(0);
        }

        let pages = self.store.raw_pages(raw_source, run_id).await?;
        let report = explode(&pages);
        for skipped in &report.skipped {
            warn!(
                source = staging_source,
                %run_id,
                page_no = skipped.page_no,
                reason = %skipped.reason,
                "skipped unparseable item"
            );
        }
        if report.records.is_empty() && !allow_empty {
            return Err(StageError::EmptyParse {
                source_name: staging_source.to_string(),
                run_id,
            });
        }

        self.store
            .insert_staging(staging_source, &report.records)
            .await?;
        info!(
            source = staging_source,
            %run_id,
            landed = report.records.len(),
            skipped = report.skipped.len(),
            "staging landed"
        );
        Ok(report.records.len())
    }
}

// ---------------------------------------------------------------------------
// Stage 3: snapshot reconciler
// ---------------------------------------------------------------------------

/// Diffs the run's staging records against the current snapshot, then
/// commits the rewritten snapshot and the classified delta in one store
/// operation. Re-running for the same run returns the persisted delta
/// untouched; the snapshot has already moved on, so recomputing would
/// misclassify everything as unchanged. The single commit is what makes
/// that reuse safe: an interrupted reconciliation leaves both artifacts
/// unwritten, never the snapshot without its delta.
pub struct SnapshotReconciler<'a> {
    pub store: &'a dyn EltStore,
}

impl<'a> SnapshotReconciler<'a> {
    pub async fn run(&self, source: &str, run_id: RunId) -> Result<Vec<DeltaEntry>, StageError> {
        if let Some(delta) = self.store.load_delta(source, run_id).await? {
            info!(source, %run_id, "delta already persisted, reusing");
            return Ok(delta);
        }

        let previous = self.store.snapshot(source).await?;
        let staged = self.store.staging_records(source, run_id).await?;
        let outcome = ypf_core::reconcile(&previous, &staged, run_id);

        self.store
            .commit_reconciliation(source, run_id, &outcome.snapshot, &outcome.delta)
            .await?;

        let mut counts: BTreeMap<Classification, usize> = BTreeMap::new();
        for entry in &outcome.delta {
            *counts.entry(entry.classification).or_default() += 1;
        }
        info!(source, %run_id, ?counts, "reconciled");
        Ok(outcome.delta)
    }
}

// ---------------------------------------------------------------------------
// Stage 4: core promotion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromotionStats {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub skipped: usize,
}

fn latest_by_key(records: Vec<StagingRecord>) -> BTreeMap<String, StagingRecord> {
    let mut latest = BTreeMap::new();
    for record in records {
        // records arrive in fetch order, so the last write wins
        latest.insert(record.source_key.clone(), record);
    }
    latest
}

/// Applies a policy delta to the core table. New and updated records are
/// rebuilt from their staged payload; removed records are deactivated and
/// the removal confirmed back into the snapshot.
pub struct PolicyPromoter<'a> {
    pub store: &'a dyn EltStore,
    pub enricher: &'a dyn Enricher,
}

impl<'a> PolicyPromoter<'a> {
    pub async fn run(
        &self,
        run_id: RunId,
        delta: &[DeltaEntry],
        now: DateTime<Utc>,
    ) -> Result<PromotionStats, StageError> {
        let mut stats = PromotionStats::default();
        if self.store.promotion_done(POLICY_SOURCE, run_id).await? {
            info!(%run_id, "policy promotion already done, skipping");
            return Ok(stats);
        }

        let staged = latest_by_key(self.store.staging_records(POLICY_SOURCE, run_id).await?);

        for entry in delta {
            match entry.classification {
                Classification::Unchanged => stats.unchanged += 1,
                Classification::Removed => {
                    self.store.deactivate_policy(&entry.source_key, now).await?;
                    self.store
                        .confirm_removal(POLICY_SOURCE, &entry.source_key)
                        .await?;
                    stats.removed += 1;
                }
                Classification::New | Classification::Updated => {
                    let Some(record) = staged.get(&entry.source_key) else {
                        warn!(key = %entry.source_key, %run_id, "delta entry without staged payload");
                        stats.skipped += 1;
                        continue;
                    };
                    self.promote_one(record, now, &mut stats).await?;
                }
            }
        }

        self.store.mark_promotion_done(POLICY_SOURCE, run_id).await?;
        info!(%run_id, ?stats, "policy promotion done");
        Ok(stats)
    }

    async fn promote_one(
        &self,
        record: &StagingRecord,
        now: DateTime<Utc>,
        stats: &mut PromotionStats,
    ) -> Result<(), StageError> {
        let mut fresh = policy_from_payload(
            &record.source_key,
            &record.payload,
            &record.record_hash,
            now,
        );

        match self.store.policy_by_source_key(&record.source_key).await? {
            None => {
                fresh.summary_ai = self.summarize(&fresh.title, fresh.description_raw.as_deref()).await;
                self.store.insert_policy(&fresh).await?;
                stats.inserted += 1;
            }
            Some(existing) => {
                // per-record guard for reruns after a partial failure
                if existing.content_hash == record.record_hash
                    && existing.status != PolicyStatus::Inactive
                {
                    stats.unchanged += 1;
                    return Ok(());
                }
                if existing.summary_ai.is_none() {
                    fresh.summary_ai =
                        self.summarize(&fresh.title, fresh.description_raw.as_deref()).await;
                }
                let was_inactive = existing.status == PolicyStatus::Inactive;
                let mut patched = existing;
                patched.patch_from(&fresh, now);
                self.store.update_policy(&patched).await?;
                if was_inactive {
                    // the key came back; let the status updater rederive it
                    self.store
                        .set_policy_status(patched.id, PolicyStatus::Unknown, now)
                        .await?;
                }
                stats.updated += 1;
            }
        }
        Ok(())
    }

    async fn summarize(&self, title: &str, body: Option<&str>) -> Option<String> {
        self.enricher.summarize(title, body.unwrap_or("")).await
    }
}

/// Product counterpart of [`PolicyPromoter`]. Options ride along with their
/// base record: even a base-unchanged product is rewritten when its option
/// set hash moved, since options are landed wholesale and never reconciled.
pub struct ProductPromoter<'a> {
    pub store: &'a dyn EltStore,
}

impl<'a> ProductPromoter<'a> {
    pub async fn run(
        &self,
        run_id: RunId,
        delta: &[DeltaEntry],
        now: DateTime<Utc>,
    ) -> Result<PromotionStats, StageError> {
        let mut stats = PromotionStats::default();
        if self.store.promotion_done(PRODUCT_BASE_SOURCE, run_id).await? {
            info!(%run_id, "product promotion already done, skipping");
            return Ok(stats);
        }

        let staged = latest_by_key(
            self.store
                .staging_records(PRODUCT_BASE_SOURCE, run_id)
                .await?,
        );
        let mut options_by_key: BTreeMap<String, Vec<ProductOption>> = BTreeMap::new();
        for record in self
            .store
            .staging_records(PRODUCT_OPTION_SOURCE, run_id)
            .await?
        {
            options_by_key
                .entry(record.source_key.clone())
                .or_default()
                .push(option_from_payload(&record.payload));
        }

        for entry in delta {
            let Some((kind, code)) = split_product_key(&entry.source_key) else {
                warn!(key = %entry.source_key, "malformed product key in delta");
                stats.skipped += 1;
                continue;
            };

            match entry.classification {
                Classification::Removed => {
                    self.store.deactivate_product(kind, &code, now).await?;
                    self.store
                        .confirm_removal(PRODUCT_BASE_SOURCE, &entry.source_key)
                        .await?;
                    stats.removed += 1;
                }
                Classification::New | Classification::Updated | Classification::Unchanged => {
                    let Some(record) = staged.get(&entry.source_key) else {
                        if entry.classification != Classification::Unchanged {
                            warn!(key = %entry.source_key, %run_id, "delta entry without staged payload");
                            stats.skipped += 1;
                        } else {
                            stats.unchanged += 1;
                        }
                        continue;
                    };
                    let options = options_by_key
                        .get(&entry.source_key)
                        .cloned()
                        .unwrap_or_default();
                    self.promote_one(kind, &code, record, options, now, &mut stats)
                        .await?;
                }
            }
        }

        self.store
            .mark_promotion_done(PRODUCT_BASE_SOURCE, run_id)
            .await?;
        info!(%run_id, ?stats, "product promotion done");
        Ok(stats)
    }

    async fn promote_one(
        &self,
        kind: ProductKind,
        code: &str,
        record: &StagingRecord,
        options: Vec<ProductOption>,
        now: DateTime<Utc>,
        stats: &mut PromotionStats,
    ) -> Result<(), StageError> {
        let mut fresh =
            product_from_payload(kind, code, &record.payload, &record.record_hash, now);
        fresh.option_set_hash = option_set_hash(&options);
        fresh.options_count = options.len() as i64;

        match self.store.product_by_source_key(kind, code).await? {
            None => {
                self.store.upsert_product(&fresh, &options).await?;
                stats.inserted += 1;
            }
            Some(existing) => {
                if existing.content_hash == fresh.content_hash
                    && existing.option_set_hash == fresh.option_set_hash
                    && existing.active
                {
                    stats.unchanged += 1;
                    return Ok(());
                }
                let mut patched = existing;
                patched.patch_from(&fresh, now);
                patched.option_set_hash = fresh.option_set_hash.clone();
                patched.options_count = fresh.options_count;
                patched.active = true;
                self.store.upsert_product(&patched, &options).await?;
                stats.updated += 1;
            }
        }
        Ok(())
    }
}

/// Inverse of [`ypf_sources::product_source_key`].
pub fn split_product_key(source_key: &str) -> Option<(ProductKind, String)> {
    let (kind, code) = source_key.split_once(':')?;
    let kind = ProductKind::parse(kind)?;
    if code.is_empty() {
        return None;
    }
    Some((kind, code.to_string()))
}

// ---------------------------------------------------------------------------
// Stage 5: status updater
// ---------------------------------------------------------------------------

/// Rederives the apply-window status of every non-inactive policy. Pure with
/// respect to the reference date, so safe to run any number of times.
pub struct StatusUpdater<'a> {
    pub store: &'a dyn EltStore,
}

impl<'a> StatusUpdater<'a> {
    pub async fn run(&self, today: NaiveDate, now: DateTime<Utc>) -> Result<usize, StageError> {
        let mut changed = 0usize;
        for policy in self.store.policies_for_status_refresh().await? {
            let derived = derive_status(
                policy.apply_type,
                policy.apply_start,
                policy.apply_end,
                today,
            );
            if derived != policy.status {
                self.store.set_policy_status(policy.id, derived, now).await?;
                changed += 1;
            }
        }
        info!(changed, %today, "status refresh done");
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// Orchestrators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: RunId,
    pub pages_ingested: u32,
    pub records_staged: usize,
    pub promotion: PromotionStats,
    pub status_changes: usize,
}

/// Full policy refresh: ingest, land, reconcile, promote, rederive status.
/// Holds the source run lock for the duration.
pub struct PolicyPipeline<'a> {
    pub store: &'a dyn EltStore,
    pub enricher: &'a dyn Enricher,
    pub start_page: u32,
    pub end_page: u32,
}

impl<'a> PolicyPipeline<'a> {
    pub async fn run(&self, feed: &dyn PageFeed) -> Result<RunSummary, StageError> {
        self.store.acquire_run_lock(POLICY_SOURCE).await?;
        let result = self.run_locked(feed).await;
        self.store.release_run_lock(POLICY_SOURCE).await?;
        result
    }

    async fn run_locked(&self, feed: &dyn PageFeed) -> Result<RunSummary, StageError> {
        let run_id = self.store.begin_run(POLICY_SOURCE).await?;
        let ingest = RawIngest {
            store: self.store,
            start_page: self.start_page,
            end_page: self.end_page,
        };
        let pages_ingested = ingest.run(feed, run_id).await?;
        let mut summary = self.finish_run(run_id).await?;
        summary.pages_ingested = pages_ingested;
        Ok(summary)
    }

    /// Re-drive the latest run through its remaining stages. Raw pages must
    /// already be present; every later stage skips work it has done before.
    pub async fn resume(&self) -> Result<RunSummary, StageError> {
        self.store.acquire_run_lock(POLICY_SOURCE).await?;
        let result = self.resume_locked().await;
        self.store.release_run_lock(POLICY_SOURCE).await?;
        result
    }

    async fn resume_locked(&self) -> Result<RunSummary, StageError> {
        let run_id = self
            .store
            .latest_run(POLICY_SOURCE)
            .await?
            .ok_or_else(|| StageError::NoRun(POLICY_SOURCE.to_string()))?;
        self.finish_run(run_id).await
    }

    async fn finish_run(&self, run_id: RunId) -> Result<RunSummary, StageError> {
        let lander = StagingLander { store: self.store };
        let records_staged = lander
            .run(POLICY_SOURCE, POLICY_SOURCE, run_id, false, explode_policy_pages)
            .await?;

        let reconciler = SnapshotReconciler { store: self.store };
        let delta = reconciler.run(POLICY_SOURCE, run_id).await?;

        let now = Utc::now();
        let promoter = PolicyPromoter {
            store: self.store,
            enricher: self.enricher,
        };
        let promotion = promoter.run(run_id, &delta, now).await?;

        let updater = StatusUpdater { store: self.store };
        let status_changes = updater.run(now.date_naive(), now).await?;

        Ok(RunSummary {
            run_id,
            pages_ingested: 0,
            records_staged,
            promotion,
            status_changes,
        })
    }
}

/// Full product refresh across both kinds. Raw pages for deposit and saving
/// land in the same run under the shared product namespace; base records are
/// reconciled, options ride along at promotion time.
pub struct ProductPipeline<'a> {
    pub store: &'a dyn EltStore,
    pub start_page: u32,
    pub end_page: u32,
}

impl<'a> ProductPipeline<'a> {
    pub async fn run(&self, feeds: &[&dyn PageFeed]) -> Result<RunSummary, StageError> {
        self.store.acquire_run_lock(PRODUCT_SOURCE).await?;
        let result = self.run_locked(feeds).await;
        self.store.release_run_lock(PRODUCT_SOURCE).await?;
        result
    }

    async fn run_locked(&self, feeds: &[&dyn PageFeed]) -> Result<RunSummary, StageError> {
        let run_id = self.store.begin_run(PRODUCT_SOURCE).await?;
        let ingest = RawIngest {
            store: self.store,
            start_page: self.start_page,
            end_page: self.end_page,
        };
        let mut pages_ingested = 0;
        for feed in feeds {
            pages_ingested += ingest.run(*feed, run_id).await?;
        }
        let mut summary = self.finish_run(run_id).await?;
        summary.pages_ingested = pages_ingested;
        Ok(summary)
    }

    pub async fn resume(&self) -> Result<RunSummary, StageError> {
        self.store.acquire_run_lock(PRODUCT_SOURCE).await?;
        let result = self.resume_locked().await;
        self.store.release_run_lock(PRODUCT_SOURCE).await?;
        result
    }

    async fn resume_locked(&self) -> Result<RunSummary, StageError> {
        let run_id = self
            .store
            .latest_run(PRODUCT_SOURCE)
            .await?
            .ok_or_else(|| StageError::NoRun(PRODUCT_SOURCE.to_string()))?;
        self.finish_run(run_id).await
    }

    async fn finish_run(&self, run_id: RunId) -> Result<RunSummary, StageError> {
        let lander = StagingLander { store: self.store };
        let records_staged = lander
            .run(
                PRODUCT_SOURCE,
                PRODUCT_BASE_SOURCE,
                run_id,
                false,
                explode_product_base_pages,
            )
            .await?;
        lander
            .run(
                PRODUCT_SOURCE,
                PRODUCT_OPTION_SOURCE,
                run_id,
                true,
                explode_product_option_pages,
            )
            .await?;

        let reconciler = SnapshotReconciler { store: self.store };
        let delta = reconciler.run(PRODUCT_BASE_SOURCE, run_id).await?;

        let promoter = ProductPromoter { store: self.store };
        let promotion = promoter.run(run_id, &delta, Utc::now()).await?;

        Ok(RunSummary {
            run_id,
            pages_ingested: 0,
            records_staged,
            promotion,
            status_changes: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_key_splits_and_rejects_garbage() {
        assert_eq!(
            split_product_key("DEPOSIT:X1"),
            Some((ProductKind::Deposit, "X1".to_string()))
        );
        assert_eq!(
            split_product_key("SAVING:ABC:DEF"),
            Some((ProductKind::Saving, "ABC:DEF".to_string()))
        );
        assert_eq!(split_product_key("LOAN:X1"), None);
        assert_eq!(split_product_key("DEPOSIT:"), None);
        assert_eq!(split_product_key("X1"), None);
    }

    #[test]
    fn latest_by_key_prefers_later_fetch() {
        let record = |key: &str, seq: u32, hash: &str| StagingRecord {
            run_id: RunId(1),
            source_key: key.to_string(),
            record_hash: hash.to_string(),
            payload: serde_json::json!({}),
            page_no: 1,
            fetch_seq: seq,
            ingested_at: Utc::now(),
        };
        let latest = latest_by_key(vec![
            record("A", 0, "h1"),
            record("B", 1, "h2"),
            record("A", 2, "h3"),
        ]);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest["A"].record_hash, "h3");
    }
}
