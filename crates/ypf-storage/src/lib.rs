//! Store capability traits with Postgres and in-memory implementations,
//! plus the retrying HTTP JSON client used by raw ingest.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info_span;
use uuid::Uuid;

use ypf_core::{
    ApplyType, Classification, DeltaEntry, FinProduct, Policy, PolicyStatus, ProductKind,
    ProductOption, RawPage, RunId, SnapshotEntry, StagingRecord,
};

pub const CRATE_NAME: &str = "ypf-storage";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run already in flight for source {0}")]
    LockHeld(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("{0}")]
    Corrupt(String),
}

// ---------------------------------------------------------------------------
// Retry / backoff (shared by ingest clients)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// HTTP JSON client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedJson {
    pub http_status: u16,
    pub body: Value,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response body is not JSON for {url}")]
    InvalidJson { url: String },
}

/// Thin GET-JSON client with bounded exponential backoff. One instance per
/// pipeline run; pages are fetched sequentially.
#[derive(Debug)]
pub struct ApiClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get_json(
        &self,
        run_id: RunId,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<FetchedJson, FetchError> {
        let span = info_span!("api_get_json", %run_id, url);
        let _guard = span.enter();

        let mut attempt = 0usize;
        loop {
            match self.client.get(url).query(params).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body: Value = resp
                            .json()
                            .await
                            .map_err(|_| FetchError::InvalidJson { url: final_url })?;
                        return Ok(FetchedJson {
                            http_status: status.as_u16(),
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::Request(err));
                    }
                }
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Store traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Fail-fast mutual exclusion: at most one in-flight run per source.
    async fn acquire_run_lock(&self, source: &str) -> Result<(), StoreError>;
    async fn release_run_lock(&self, source: &str) -> Result<(), StoreError>;
    async fn begin_run(&self, source: &str) -> Result<RunId, StoreError>;
    async fn latest_run(&self, source: &str) -> Result<Option<RunId>, StoreError>;
}

#[async_trait]
pub trait RawStore: Send + Sync {
    async fn append_raw_page(&self, page: &RawPage) -> Result<(), StoreError>;
    async fn raw_pages(&self, source: &str, run_id: RunId) -> Result<Vec<RawPage>, StoreError>;
}

#[async_trait]
pub trait StagingStore: Send + Sync {
    async fn staging_landed(&self, source: &str, run_id: RunId) -> Result<bool, StoreError>;
    async fn insert_staging(
        &self,
        source: &str,
        records: &[StagingRecord],
    ) -> Result<(), StoreError>;
    /// Records for the run in fetch order (page_no, then fetch_seq).
    async fn staging_records(
        &self,
        source: &str,
        run_id: RunId,
    ) -> Result<Vec<StagingRecord>, StoreError>;
    async fn snapshot(&self, source: &str) -> Result<Vec<SnapshotEntry>, StoreError>;
    /// Persist the rebuilt snapshot and the run's classified delta in one
    /// atomic step. A snapshot that has moved without its delta is not
    /// recoverable: recomputing against it classifies everything UNCHANGED.
    async fn commit_reconciliation(
        &self,
        source: &str,
        run_id: RunId,
        snapshot: &[SnapshotEntry],
        delta: &[DeltaEntry],
    ) -> Result<(), StoreError>;
    /// Drop a removal-flagged snapshot entry once the promoter has
    /// transitioned the core record.
    async fn confirm_removal(&self, source: &str, source_key: &str) -> Result<(), StoreError>;
    async fn load_delta(
        &self,
        source: &str,
        run_id: RunId,
    ) -> Result<Option<Vec<DeltaEntry>>, StoreError>;
    async fn promotion_done(&self, source: &str, run_id: RunId) -> Result<bool, StoreError>;
    async fn mark_promotion_done(&self, source: &str, run_id: RunId) -> Result<(), StoreError>;
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn policy_by_source_key(&self, source_key: &str) -> Result<Option<Policy>, StoreError>;
    async fn insert_policy(&self, policy: &Policy) -> Result<(), StoreError>;
    /// Rewrites upstream-derived columns and `summary_ai`; `id`, `status`,
    /// and `created_at` are never touched here.
    async fn update_policy(&self, policy: &Policy) -> Result<(), StoreError>;
    async fn deactivate_policy(
        &self,
        source_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    /// Every policy that is not in the terminal Inactive state.
    async fn policies_for_status_refresh(&self) -> Result<Vec<Policy>, StoreError>;
    async fn set_policy_status(
        &self,
        id: Uuid,
        status: PolicyStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ProductStore: Send + Sync {
    async fn product_by_source_key(
        &self,
        kind: ProductKind,
        source_key: &str,
    ) -> Result<Option<FinProduct>, StoreError>;
    /// Parent write plus full option replacement, atomic per product.
    async fn upsert_product(
        &self,
        product: &FinProduct,
        options: &[ProductOption],
    ) -> Result<(), StoreError>;
    async fn deactivate_product(
        &self,
        kind: ProductKind,
        source_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn product_options(&self, product_id: Uuid) -> Result<Vec<ProductOption>, StoreError>;
}

/// Everything a pipeline run needs from one store handle.
pub trait EltStore: RunStore + RawStore + StagingStore + PolicyStore + ProductStore {}

impl<T: RunStore + RawStore + StagingStore + PolicyStore + ProductStore> EltStore for T {}

// ---------------------------------------------------------------------------
// Read-side (REST layer)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct PolicyFilter {
    pub status: Option<PolicyStatus>,
    pub keyword: Option<String>,
    pub page: usize,
    pub per_page: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ProductFilter {
    pub kind: Option<ProductKind>,
    pub company: Option<String>,
    pub page: usize,
    pub per_page: usize,
}

fn page_bounds(page: usize, per_page: usize, total: usize) -> (usize, usize) {
    let per_page = per_page.clamp(1, 100);
    let page = page.max(1);
    let start = (page - 1) * per_page;
    (start.min(total), per_page)
}

#[async_trait]
pub trait ReadStore: Send + Sync {
    async fn list_policies(
        &self,
        filter: &PolicyFilter,
    ) -> Result<(Vec<Policy>, usize), StoreError>;
    async fn get_policy(&self, id: Uuid) -> Result<Option<Policy>, StoreError>;
    async fn list_products(
        &self,
        filter: &ProductFilter,
    ) -> Result<(Vec<FinProduct>, usize), StoreError>;
    async fn get_product(
        &self,
        id: Uuid,
    ) -> Result<Option<(FinProduct, Vec<ProductOption>)>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemInner {
    locks: BTreeSet<String>,
    next_run: i64,
    runs: BTreeMap<String, Vec<i64>>,
    raw: Vec<RawPage>,
    staging: BTreeMap<(String, i64), Vec<StagingRecord>>,
    snapshots: BTreeMap<String, BTreeMap<String, SnapshotEntry>>,
    deltas: BTreeMap<(String, i64), Vec<DeltaEntry>>,
    promotions: BTreeSet<(String, i64)>,
    policies: BTreeMap<String, Policy>,
    products: BTreeMap<(String, String), FinProduct>,
    options: BTreeMap<Uuid, Vec<ProductOption>>,
}

/// In-memory store with the same semantics as [`PgStore`]. Backs the test
/// suites and local dry runs; all coordination still goes through this one
/// handle, never through ambient state.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<MemInner>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemStore {
    async fn acquire_run_lock(&self, source: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.locks.insert(source.to_string()) {
            return Err(StoreError::LockHeld(source.to_string()));
        }
        Ok(())
    }

    async fn release_run_lock(&self, source: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.locks.remove(source);
        Ok(())
    }

    async fn begin_run(&self, source: &str) -> Result<RunId, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.next_run += 1;
        let run = inner.next_run;
        inner.runs.entry(source.to_string()).or_default().push(run);
        Ok(RunId(run))
    }

    async fn latest_run(&self, source: &str) -> Result<Option<RunId>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .runs
            .get(source)
            .and_then(|runs| runs.last().copied())
            .map(RunId))
    }
}

#[async_trait]
impl RawStore for MemStore {
    async fn append_raw_page(&self, page: &RawPage) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.raw.push(page.clone());
        Ok(())
    }

    async fn raw_pages(&self, source: &str, run_id: RunId) -> Result<Vec<RawPage>, StoreError> {
        let inner = self.inner.lock().await;
        let mut pages: Vec<RawPage> = inner
            .raw
            .iter()
            .filter(|p| p.source == source && p.run_id == run_id)
            .cloned()
            .collect();
        pages.sort_by_key(|p| p.page_no);
        Ok(pages)
    }
}

#[async_trait]
impl StagingStore for MemStore {
    async fn staging_landed(&self, source: &str, run_id: RunId) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .staging
            .get(&(source.to_string(), run_id.0))
            .map(|v| !v.is_empty())
            .unwrap_or(false))
    }

    async fn insert_staging(
        &self,
        source: &str,
        records: &[StagingRecord],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for record in records {
            let slot = inner
                .staging
                .entry((source.to_string(), record.run_id.0))
                .or_default();
            let duplicate = slot
                .iter()
                .any(|r| r.page_no == record.page_no && r.fetch_seq == record.fetch_seq);
            if !duplicate {
                slot.push(record.clone());
            }
        }
        Ok(())
    }

    async fn staging_records(
        &self,
        source: &str,
        run_id: RunId,
    ) -> Result<Vec<StagingRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let mut records = inner
            .staging
            .get(&(source.to_string(), run_id.0))
            .cloned()
            .unwrap_or_default();
        records.sort_by_key(|r| (r.page_no, r.fetch_seq));
        Ok(records)
    }

    async fn snapshot(&self, source: &str) -> Result<Vec<SnapshotEntry>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .snapshots
            .get(source)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn commit_reconciliation(
        &self,
        source: &str,
        run_id: RunId,
        snapshot: &[SnapshotEntry],
        delta: &[DeltaEntry],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let slot = inner.snapshots.entry(source.to_string()).or_default();
        for entry in snapshot {
            slot.insert(entry.source_key.clone(), entry.clone());
        }
        inner
            .deltas
            .insert((source.to_string(), run_id.0), delta.to_vec());
        Ok(())
    }

    async fn confirm_removal(&self, source: &str, source_key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(slot) = inner.snapshots.get_mut(source) {
            slot.remove(source_key);
        }
        Ok(())
    }

    async fn load_delta(
        &self,
        source: &str,
        run_id: RunId,
    ) -> Result<Option<Vec<DeltaEntry>>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.deltas.get(&(source.to_string(), run_id.0)).cloned())
    }

    async fn promotion_done(&self, source: &str, run_id: RunId) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.promotions.contains(&(source.to_string(), run_id.0)))
    }

    async fn mark_promotion_done(&self, source: &str, run_id: RunId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.promotions.insert((source.to_string(), run_id.0));
        Ok(())
    }
}

#[async_trait]
impl PolicyStore for MemStore {
    async fn policy_by_source_key(&self, source_key: &str) -> Result<Option<Policy>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.policies.get(source_key).cloned())
    }

    async fn insert_policy(&self, policy: &Policy) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .policies
            .insert(policy.source_key.clone(), policy.clone());
        Ok(())
    }

    async fn update_policy(&self, policy: &Policy) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.policies.get_mut(&policy.source_key) {
            Some(existing) => {
                let keep_status = existing.status;
                let keep_created = existing.created_at;
                let keep_id = existing.id;
                *existing = policy.clone();
                existing.status = keep_status;
                existing.created_at = keep_created;
                existing.id = keep_id;
                Ok(())
            }
            None => Err(StoreError::Corrupt(format!(
                "update for unknown policy {}",
                policy.source_key
            ))),
        }
    }

    async fn deactivate_policy(
        &self,
        source_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(policy) = inner.policies.get_mut(source_key) {
            policy.status = PolicyStatus::Inactive;
            policy.updated_at = now;
        }
        Ok(())
    }

    async fn policies_for_status_refresh(&self) -> Result<Vec<Policy>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .policies
            .values()
            .filter(|p| p.status != PolicyStatus::Inactive)
            .cloned()
            .collect())
    }

    async fn set_policy_status(
        &self,
        id: Uuid,
        status: PolicyStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(policy) = inner.policies.values_mut().find(|p| p.id == id) {
            policy.status = status;
            policy.updated_at = now;
        }
        Ok(())
    }
}

#[async_trait]
impl ProductStore for MemStore {
    async fn product_by_source_key(
        &self,
        kind: ProductKind,
        source_key: &str,
    ) -> Result<Option<FinProduct>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .products
            .get(&(kind.as_str().to_string(), source_key.to_string()))
            .cloned())
    }

    async fn upsert_product(
        &self,
        product: &FinProduct,
        options: &[ProductOption],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (product.kind.as_str().to_string(), product.source_key.clone());
        let id = match inner.products.get(&key) {
            Some(existing) => existing.id,
            None => product.id,
        };
        let mut stored = product.clone();
        stored.id = id;
        inner.products.insert(key, stored);
        inner.options.insert(id, options.to_vec());
        Ok(())
    }

    async fn deactivate_product(
        &self,
        kind: ProductKind,
        source_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(product) = inner
            .products
            .get_mut(&(kind.as_str().to_string(), source_key.to_string()))
        {
            product.active = false;
            product.updated_at = now;
        }
        Ok(())
    }

    async fn product_options(&self, product_id: Uuid) -> Result<Vec<ProductOption>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.options.get(&product_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl ReadStore for MemStore {
    async fn list_policies(
        &self,
        filter: &PolicyFilter,
    ) -> Result<(Vec<Policy>, usize), StoreError> {
        let inner = self.inner.lock().await;
        let keyword = filter.keyword.as_ref().map(|k| k.to_lowercase());
        let mut rows: Vec<Policy> = inner
            .policies
            .values()
            .filter(|p| filter.status.map(|s| p.status == s).unwrap_or(true))
            .filter(|p| {
                keyword
                    .as_ref()
                    .map(|k| p.title.to_lowercase().contains(k))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        let total = rows.len();
        let (start, per_page) = page_bounds(filter.page, filter.per_page, total);
        Ok((rows.into_iter().skip(start).take(per_page).collect(), total))
    }

    async fn get_policy(&self, id: Uuid) -> Result<Option<Policy>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.policies.values().find(|p| p.id == id).cloned())
    }

    async fn list_products(
        &self,
        filter: &ProductFilter,
    ) -> Result<(Vec<FinProduct>, usize), StoreError> {
        let inner = self.inner.lock().await;
        let company = filter.company.as_ref().map(|c| c.to_lowercase());
        let mut rows: Vec<FinProduct> = inner
            .products
            .values()
            .filter(|p| filter.kind.map(|k| p.kind == k).unwrap_or(true))
            .filter(|p| {
                company
                    .as_ref()
                    .map(|c| {
                        p.company_name
                            .as_deref()
                            .map(|n| n.to_lowercase().contains(c))
                            .unwrap_or(false)
                    })
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        let total = rows.len();
        let (start, per_page) = page_bounds(filter.page, filter.per_page, total);
        Ok((rows.into_iter().skip(start).take(per_page).collect(), total))
    }

    async fn get_product(
        &self,
        id: Uuid,
    ) -> Result<Option<(FinProduct, Vec<ProductOption>)>, StoreError> {
        let inner = self.inner.lock().await;
        let Some(product) = inner.products.values().find(|p| p.id == id).cloned() else {
            return Ok(None);
        };
        let options = inner.options.get(&id).cloned().unwrap_or_default();
        Ok(Some((product, options)))
    }
}

// ---------------------------------------------------------------------------
// Postgres store
// ---------------------------------------------------------------------------

/// Idempotent schema bootstrap; safe to run before every pipeline
/// invocation, mirroring the per-script DDL of the upstream jobs.
const BOOTSTRAP_SQL: &str = r#"
create schema if not exists elt;
create schema if not exists raw;
create schema if not exists stg;
create schema if not exists core;

create table if not exists elt.run_lock (
  source     text primary key,
  locked_at  timestamptz not null default now()
);

create table if not exists elt.runs (
  run_id     bigserial primary key,
  source     text not null,
  started_at timestamptz not null default now()
);
create index if not exists idx_runs_source on elt.runs(source, run_id desc);

create table if not exists raw.pages (
  ingest_id      uuid primary key,
  run_id         bigint not null,
  source         text not null,
  page_no        int not null,
  http_status    int not null,
  request_params jsonb not null,
  payload        jsonb not null,
  fetched_at     timestamptz not null
);
create index if not exists idx_raw_pages_run on raw.pages(source, run_id, page_no);

create table if not exists stg.landing (
  source      text not null,
  run_id      bigint not null,
  source_key  text not null,
  record_hash text not null,
  payload     jsonb not null,
  page_no     int not null,
  fetch_seq   int not null,
  ingested_at timestamptz not null,
  primary key (source, run_id, page_no, fetch_seq)
);
create index if not exists idx_stg_landing_key on stg.landing(source, source_key);

create table if not exists stg.current (
  source          text not null,
  source_key      text not null,
  record_hash     text not null,
  first_seen_run  bigint not null,
  last_seen_run   bigint not null,
  removal_flagged boolean not null default false,
  primary key (source, source_key)
);

create table if not exists elt.run_delta (
  source         text not null,
  run_id         bigint not null,
  source_key     text not null,
  classification text not null,
  record_hash    text not null,
  primary key (source, run_id, source_key)
);

create table if not exists elt.promotions (
  source      text not null,
  run_id      bigint not null,
  promoted_at timestamptz not null default now(),
  primary key (source, run_id)
);

create table if not exists core.policy (
  id              uuid primary key,
  source_key      text not null unique,
  title           text not null,
  summary_raw     text,
  description_raw text,
  summary_ai      text,
  apply_type      text not null,
  apply_start     date,
  apply_end       date,
  supervising_org text,
  operating_org   text,
  apply_url       text,
  ref_url_1       text,
  ref_url_2       text,
  keywords        jsonb not null default '[]'::jsonb,
  regions         jsonb not null default '[]'::jsonb,
  views           bigint not null default 0,
  status          text not null,
  content_hash    text not null,
  payload         jsonb not null,
  created_at      timestamptz not null,
  updated_at      timestamptz not null
);
create index if not exists idx_policy_status on core.policy(status);

create table if not exists core.product (
  id                uuid primary key,
  kind              text not null,
  source_key        text not null,
  disclosure_month  text,
  name              text not null,
  company_code      text,
  company_name      text,
  join_way          text,
  join_member       text,
  special_condition text,
  etc_note          text,
  max_limit         double precision,
  content_hash      text not null,
  option_set_hash   text,
  options_count     bigint not null default 0,
  active            boolean not null default true,
  payload           jsonb not null,
  created_at        timestamptz not null,
  updated_at        timestamptz not null,
  unique (kind, source_key)
);
create index if not exists idx_product_company on core.product(company_name);

create table if not exists core.product_option (
  id              bigserial primary key,
  product_id      uuid not null references core.product(id) on delete cascade,
  save_term_months int,
  rate_type       text,
  rate_type_name  text,
  base_rate       double precision,
  max_rate        double precision,
  reserve_type    text,
  content_hash    text not null,
  payload         jsonb not null
);
create index if not exists idx_option_product on core.product_option(product_id);
"#;

/// Postgres-backed store. All queries are runtime-checked `sqlx` queries so
/// the crate builds without a live database.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn bootstrap(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(BOOTSTRAP_SQL).execute(&self.pool).await?;
        Ok(())
    }
}

fn json_list(value: Value) -> Vec<String> {
    serde_json::from_value(value).unwrap_or_default()
}

fn policy_from_row(row: &PgRow) -> Result<Policy, StoreError> {
    Ok(Policy {
        id: row.try_get("id")?,
        source_key: row.try_get("source_key")?,
        title: row.try_get("title")?,
        summary_raw: row.try_get("summary_raw")?,
        description_raw: row.try_get("description_raw")?,
        summary_ai: row.try_get("summary_ai")?,
        apply_type: ApplyType::parse(&row.try_get::<String, _>("apply_type")?),
        apply_start: row.try_get("apply_start")?,
        apply_end: row.try_get("apply_end")?,
        supervising_org: row.try_get("supervising_org")?,
        operating_org: row.try_get("operating_org")?,
        apply_url: row.try_get("apply_url")?,
        ref_url_1: row.try_get("ref_url_1")?,
        ref_url_2: row.try_get("ref_url_2")?,
        keywords: json_list(row.try_get("keywords")?),
        regions: json_list(row.try_get("regions")?),
        views: row.try_get("views")?,
        status: PolicyStatus::parse(&row.try_get::<String, _>("status")?),
        content_hash: row.try_get("content_hash")?,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn product_from_row(row: &PgRow) -> Result<FinProduct, StoreError> {
    let kind_text: String = row.try_get("kind")?;
    let kind = ProductKind::parse(&kind_text)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown product kind {kind_text}")))?;
    Ok(FinProduct {
        id: row.try_get("id")?,
        kind,
        source_key: row.try_get("source_key")?,
        disclosure_month: row.try_get("disclosure_month")?,
        name: row.try_get("name")?,
        company_code: row.try_get("company_code")?,
        company_name: row.try_get("company_name")?,
        join_way: row.try_get("join_way")?,
        join_member: row.try_get("join_member")?,
        special_condition: row.try_get("special_condition")?,
        etc_note: row.try_get("etc_note")?,
        max_limit: row.try_get("max_limit")?,
        content_hash: row.try_get("content_hash")?,
        option_set_hash: row.try_get("option_set_hash")?,
        options_count: row.try_get("options_count")?,
        active: row.try_get("active")?,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn option_from_row(row: &PgRow) -> Result<ProductOption, StoreError> {
    Ok(ProductOption {
        save_term_months: row.try_get("save_term_months")?,
        rate_type: row.try_get("rate_type")?,
        rate_type_name: row.try_get("rate_type_name")?,
        base_rate: row.try_get("base_rate")?,
        max_rate: row.try_get("max_rate")?,
        reserve_type: row.try_get("reserve_type")?,
        content_hash: row.try_get("content_hash")?,
        payload: row.try_get("payload")?,
    })
}

fn staging_from_row(row: &PgRow) -> Result<StagingRecord, StoreError> {
    Ok(StagingRecord {
        run_id: RunId(row.try_get::<i64, _>("run_id")?),
        source_key: row.try_get("source_key")?,
        record_hash: row.try_get("record_hash")?,
        payload: row.try_get("payload")?,
        page_no: row.try_get::<i32, _>("page_no")? as u32,
        fetch_seq: row.try_get::<i32, _>("fetch_seq")? as u32,
        ingested_at: row.try_get("ingested_at")?,
    })
}

#[async_trait]
impl RunStore for PgStore {
    async fn acquire_run_lock(&self, source: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "insert into elt.run_lock (source) values ($1) on conflict (source) do nothing",
        )
        .bind(source)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::LockHeld(source.to_string()));
        }
        Ok(())
    }

    async fn release_run_lock(&self, source: &str) -> Result<(), StoreError> {
        sqlx::query("delete from elt.run_lock where source = $1")
            .bind(source)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn begin_run(&self, source: &str) -> Result<RunId, StoreError> {
        let run_id: i64 =
            sqlx::query_scalar("insert into elt.runs (source) values ($1) returning run_id")
                .bind(source)
                .fetch_one(&self.pool)
                .await?;
        Ok(RunId(run_id))
    }

    async fn latest_run(&self, source: &str) -> Result<Option<RunId>, StoreError> {
        let run: Option<i64> =
            sqlx::query_scalar("select max(run_id) from elt.runs where source = $1")
                .bind(source)
                .fetch_one(&self.pool)
                .await?;
        Ok(run.map(RunId))
    }
}

#[async_trait]
impl RawStore for PgStore {
    async fn append_raw_page(&self, page: &RawPage) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            insert into raw.pages
              (ingest_id, run_id, source, page_no, http_status, request_params, payload, fetched_at)
            values ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(page.ingest_id)
        .bind(page.run_id.0)
        .bind(&page.source)
        .bind(page.page_no as i32)
        .bind(page.http_status as i32)
        .bind(&page.request_params)
        .bind(&page.payload)
        .bind(page.fetched_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn raw_pages(&self, source: &str, run_id: RunId) -> Result<Vec<RawPage>, StoreError> {
        let rows = sqlx::query(
            r#"
            select ingest_id, run_id, source, page_no, http_status, request_params, payload, fetched_at
              from raw.pages
             where source = $1 and run_id = $2
             order by page_no asc
            "#,
        )
        .bind(source)
        .bind(run_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut pages = Vec::with_capacity(rows.len());
        for row in rows {
            pages.push(RawPage {
                ingest_id: row.try_get("ingest_id")?,
                run_id: RunId(row.try_get::<i64, _>("run_id")?),
                source: row.try_get("source")?,
                page_no: row.try_get::<i32, _>("page_no")? as u32,
                http_status: row.try_get::<i32, _>("http_status")? as u16,
                request_params: row.try_get("request_params")?,
                payload: row.try_get("payload")?,
                fetched_at: row.try_get("fetched_at")?,
            });
        }
        Ok(pages)
    }
}

#[async_trait]
impl StagingStore for PgStore {
    async fn staging_landed(&self, source: &str, run_id: RunId) -> Result<bool, StoreError> {
        let landed: bool = sqlx::query_scalar(
            "select exists(select 1 from stg.landing where source = $1 and run_id = $2)",
        )
        .bind(source)
        .bind(run_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(landed)
    }

    async fn insert_staging(
        &self,
        source: &str,
        records: &[StagingRecord],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"
                insert into stg.landing
                  (source, run_id, source_key, record_hash, payload, page_no, fetch_seq, ingested_at)
                values ($1, $2, $3, $4, $5, $6, $7, $8)
                on conflict do nothing
                "#,
            )
            .bind(source)
            .bind(record.run_id.0)
            .bind(&record.source_key)
            .bind(&record.record_hash)
            .bind(&record.payload)
            .bind(record.page_no as i32)
            .bind(record.fetch_seq as i32)
            .bind(record.ingested_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn staging_records(
        &self,
        source: &str,
        run_id: RunId,
    ) -> Result<Vec<StagingRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            select run_id, source_key, record_hash, payload, page_no, fetch_seq, ingested_at
              from stg.landing
             where source = $1 and run_id = $2
             order by page_no asc, fetch_seq asc
            "#,
        )
        .bind(source)
        .bind(run_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(staging_from_row).collect()
    }

    async fn snapshot(&self, source: &str) -> Result<Vec<SnapshotEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            select source_key, record_hash, first_seen_run, last_seen_run, removal_flagged
              from stg.current
             where source = $1
             order by source_key asc
            "#,
        )
        .bind(source)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(SnapshotEntry {
                source_key: row.try_get("source_key")?,
                record_hash: row.try_get("record_hash")?,
                first_seen_run: RunId(row.try_get::<i64, _>("first_seen_run")?),
                last_seen_run: RunId(row.try_get::<i64, _>("last_seen_run")?),
                removal_flagged: row.try_get("removal_flagged")?,
            });
        }
        Ok(entries)
    }

    async fn commit_reconciliation(
        &self,
        source: &str,
        run_id: RunId,
        snapshot: &[SnapshotEntry],
        delta: &[DeltaEntry],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for entry in snapshot {
            sqlx::query(
                r#"
                insert into stg.current
                  (source, source_key, record_hash, first_seen_run, last_seen_run, removal_flagged)
                values ($1, $2, $3, $4, $5, $6)
                on conflict (source, source_key) do update set
                  record_hash     = excluded.record_hash,
                  first_seen_run  = least(stg.current.first_seen_run, excluded.first_seen_run),
                  last_seen_run   = excluded.last_seen_run,
                  removal_flagged = excluded.removal_flagged
                "#,
            )
            .bind(source)
            .bind(&entry.source_key)
            .bind(&entry.record_hash)
            .bind(entry.first_seen_run.0)
            .bind(entry.last_seen_run.0)
            .bind(entry.removal_flagged)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("delete from elt.run_delta where source = $1 and run_id = $2")
            .bind(source)
            .bind(run_id.0)
            .execute(&mut *tx)
            .await?;
        for entry in delta {
            sqlx::query(
                r#"
                insert into elt.run_delta (source, run_id, source_key, classification, record_hash)
                values ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(source)
            .bind(run_id.0)
            .bind(&entry.source_key)
            .bind(entry.classification.to_string())
            .bind(&entry.record_hash)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn confirm_removal(&self, source: &str, source_key: &str) -> Result<(), StoreError> {
        sqlx::query("delete from stg.current where source = $1 and source_key = $2")
            .bind(source)
            .bind(source_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_delta(
        &self,
        source: &str,
        run_id: RunId,
    ) -> Result<Option<Vec<DeltaEntry>>, StoreError> {
        let rows = sqlx::query(
            r#"
            select source_key, classification, record_hash
              from elt.run_delta
             where source = $1 and run_id = $2
             order by source_key asc
            "#,
        )
        .bind(source)
        .bind(run_id.0)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut delta = Vec::with_capacity(rows.len());
        for row in rows {
            let classification = match row.try_get::<String, _>("classification")?.as_str() {
                "NEW" => Classification::New,
                "UPDATED" => Classification::Updated,
                "UNCHANGED" => Classification::Unchanged,
                "REMOVED" => Classification::Removed,
                other => {
                    return Err(StoreError::Corrupt(format!(
                        "unknown classification {other}"
                    )))
                }
            };
            delta.push(DeltaEntry {
                source_key: row.try_get("source_key")?,
                classification,
                record_hash: row.try_get("record_hash")?,
            });
        }
        Ok(Some(delta))
    }

    async fn promotion_done(&self, source: &str, run_id: RunId) -> Result<bool, StoreError> {
        let done: bool = sqlx::query_scalar(
            "select exists(select 1 from elt.promotions where source = $1 and run_id = $2)",
        )
        .bind(source)
        .bind(run_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(done)
    }

    async fn mark_promotion_done(&self, source: &str, run_id: RunId) -> Result<(), StoreError> {
        sqlx::query(
            "insert into elt.promotions (source, run_id) values ($1, $2) on conflict do nothing",
        )
        .bind(source)
        .bind(run_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

const POLICY_COLUMNS: &str = r#"
  id, source_key, title, summary_raw, description_raw, summary_ai,
  apply_type, apply_start, apply_end, supervising_org, operating_org,
  apply_url, ref_url_1, ref_url_2, keywords, regions, views, status,
  content_hash, payload, created_at, updated_at
"#;

#[async_trait]
impl PolicyStore for PgStore {
    async fn policy_by_source_key(&self, source_key: &str) -> Result<Option<Policy>, StoreError> {
        let row = sqlx::query(&format!(
            "select {POLICY_COLUMNS} from core.policy where source_key = $1"
        ))
        .bind(source_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(policy_from_row).transpose()
    }

    async fn insert_policy(&self, policy: &Policy) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"
            insert into core.policy ({POLICY_COLUMNS})
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                    $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
            "#
        ))
        .bind(policy.id)
        .bind(&policy.source_key)
        .bind(&policy.title)
        .bind(&policy.summary_raw)
        .bind(&policy.description_raw)
        .bind(&policy.summary_ai)
        .bind(policy.apply_type.as_str())
        .bind(policy.apply_start)
        .bind(policy.apply_end)
        .bind(&policy.supervising_org)
        .bind(&policy.operating_org)
        .bind(&policy.apply_url)
        .bind(&policy.ref_url_1)
        .bind(&policy.ref_url_2)
        .bind(serde_json::json!(policy.keywords))
        .bind(serde_json::json!(policy.regions))
        .bind(policy.views)
        .bind(policy.status.as_str())
        .bind(&policy.content_hash)
        .bind(&policy.payload)
        .bind(policy.created_at)
        .bind(policy.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_policy(&self, policy: &Policy) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            update core.policy set
              title = $2, summary_raw = $3, description_raw = $4, summary_ai = $5,
              apply_type = $6, apply_start = $7, apply_end = $8,
              supervising_org = $9, operating_org = $10, apply_url = $11,
              ref_url_1 = $12, ref_url_2 = $13, keywords = $14, regions = $15,
              views = $16, content_hash = $17, payload = $18, updated_at = $19
            where source_key = $1
            "#,
        )
        .bind(&policy.source_key)
        .bind(&policy.title)
        .bind(&policy.summary_raw)
        .bind(&policy.description_raw)
        .bind(&policy.summary_ai)
        .bind(policy.apply_type.as_str())
        .bind(policy.apply_start)
        .bind(policy.apply_end)
        .bind(&policy.supervising_org)
        .bind(&policy.operating_org)
        .bind(&policy.apply_url)
        .bind(&policy.ref_url_1)
        .bind(&policy.ref_url_2)
        .bind(serde_json::json!(policy.keywords))
        .bind(serde_json::json!(policy.regions))
        .bind(policy.views)
        .bind(&policy.content_hash)
        .bind(&policy.payload)
        .bind(policy.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deactivate_policy(
        &self,
        source_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("update core.policy set status = $2, updated_at = $3 where source_key = $1")
            .bind(source_key)
            .bind(PolicyStatus::Inactive.as_str())
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn policies_for_status_refresh(&self) -> Result<Vec<Policy>, StoreError> {
        let rows = sqlx::query(&format!(
            "select {POLICY_COLUMNS} from core.policy where status <> $1"
        ))
        .bind(PolicyStatus::Inactive.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(policy_from_row).collect()
    }

    async fn set_policy_status(
        &self,
        id: Uuid,
        status: PolicyStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("update core.policy set status = $2, updated_at = $3 where id = $1")
            .bind(id)
            .bind(status.as_str())
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

const PRODUCT_COLUMNS: &str = r#"
  id, kind, source_key, disclosure_month, name, company_code, company_name,
  join_way, join_member, special_condition, etc_note, max_limit,
  content_hash, option_set_hash, options_count, active, payload,
  created_at, updated_at
"#;

#[async_trait]
impl ProductStore for PgStore {
    async fn product_by_source_key(
        &self,
        kind: ProductKind,
        source_key: &str,
    ) -> Result<Option<FinProduct>, StoreError> {
        let row = sqlx::query(&format!(
            "select {PRODUCT_COLUMNS} from core.product where kind = $1 and source_key = $2"
        ))
        .bind(kind.as_str())
        .bind(source_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn upsert_product(
        &self,
        product: &FinProduct,
        options: &[ProductOption],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let id: Uuid = sqlx::query_scalar(&format!(
            r#"
            insert into core.product ({PRODUCT_COLUMNS})
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    $13, $14, $15, $16, $17, $18, $19)
            on conflict (kind, source_key) do update set
              disclosure_month = excluded.disclosure_month,
              name = excluded.name,
              company_code = excluded.company_code,
              company_name = excluded.company_name,
              join_way = excluded.join_way,
              join_member = excluded.join_member,
              special_condition = excluded.special_condition,
              etc_note = excluded.etc_note,
              max_limit = excluded.max_limit,
              content_hash = excluded.content_hash,
              option_set_hash = excluded.option_set_hash,
              options_count = excluded.options_count,
              active = excluded.active,
              payload = excluded.payload,
              updated_at = excluded.updated_at
            returning id
            "#
        ))
        .bind(product.id)
        .bind(product.kind.as_str())
        .bind(&product.source_key)
        .bind(&product.disclosure_month)
        .bind(&product.name)
        .bind(&product.company_code)
        .bind(&product.company_name)
        .bind(&product.join_way)
        .bind(&product.join_member)
        .bind(&product.special_condition)
        .bind(&product.etc_note)
        .bind(product.max_limit)
        .bind(&product.content_hash)
        .bind(&product.option_set_hash)
        .bind(product.options_count)
        .bind(product.active)
        .bind(&product.payload)
        .bind(product.created_at)
        .bind(product.updated_at)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("delete from core.product_option where product_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        for option in options {
            sqlx::query(
                r#"
                insert into core.product_option
                  (product_id, save_term_months, rate_type, rate_type_name,
                   base_rate, max_rate, reserve_type, content_hash, payload)
                values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(id)
            .bind(option.save_term_months)
            .bind(&option.rate_type)
            .bind(&option.rate_type_name)
            .bind(option.base_rate)
            .bind(option.max_rate)
            .bind(&option.reserve_type)
            .bind(&option.content_hash)
            .bind(&option.payload)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn deactivate_product(
        &self,
        kind: ProductKind,
        source_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "update core.product set active = false, updated_at = $3 where kind = $1 and source_key = $2",
        )
        .bind(kind.as_str())
        .bind(source_key)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn product_options(&self, product_id: Uuid) -> Result<Vec<ProductOption>, StoreError> {
        let rows = sqlx::query(
            r#"
            select save_term_months, rate_type, rate_type_name, base_rate,
                   max_rate, reserve_type, content_hash, payload
              from core.product_option
             where product_id = $1
             order by save_term_months nulls first, rate_type, reserve_type
            "#,
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(option_from_row).collect()
    }
}

#[async_trait]
impl ReadStore for PgStore {
    async fn list_policies(
        &self,
        filter: &PolicyFilter,
    ) -> Result<(Vec<Policy>, usize), StoreError> {
        let mut count_qb = QueryBuilder::new("select count(*) from core.policy where 1=1");
        let mut list_qb = QueryBuilder::new(format!(
            "select {POLICY_COLUMNS} from core.policy where 1=1"
        ));
        for qb in [&mut count_qb, &mut list_qb] {
            if let Some(status) = filter.status {
                qb.push(" and status = ").push_bind(status.as_str());
            }
            if let Some(keyword) = &filter.keyword {
                qb.push(" and title ilike ").push_bind(format!("%{keyword}%"));
            }
        }

        let total: i64 = count_qb.build_query_scalar().fetch_one(&self.pool).await?;
        let (start, per_page) = page_bounds(filter.page, filter.per_page, total as usize);

        list_qb.push(" order by updated_at desc, created_at desc");
        list_qb.push(" limit ").push_bind(per_page as i64);
        list_qb.push(" offset ").push_bind(start as i64);

        let rows = list_qb.build().fetch_all(&self.pool).await?;
        let policies = rows
            .iter()
            .map(policy_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((policies, total as usize))
    }

    async fn get_policy(&self, id: Uuid) -> Result<Option<Policy>, StoreError> {
        let row = sqlx::query(&format!("select {POLICY_COLUMNS} from core.policy where id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(policy_from_row).transpose()
    }

    async fn list_products(
        &self,
        filter: &ProductFilter,
    ) -> Result<(Vec<FinProduct>, usize), StoreError> {
        let mut count_qb = QueryBuilder::new("select count(*) from core.product where 1=1");
        let mut list_qb = QueryBuilder::new(format!(
            "select {PRODUCT_COLUMNS} from core.product where 1=1"
        ));
        for qb in [&mut count_qb, &mut list_qb] {
            if let Some(kind) = filter.kind {
                qb.push(" and kind = ").push_bind(kind.as_str());
            }
            if let Some(company) = &filter.company {
                qb.push(" and company_name ilike ")
                    .push_bind(format!("%{company}%"));
            }
        }

        let total: i64 = count_qb.build_query_scalar().fetch_one(&self.pool).await?;
        let (start, per_page) = page_bounds(filter.page, filter.per_page, total as usize);

        list_qb.push(" order by updated_at desc, created_at desc");
        list_qb.push(" limit ").push_bind(per_page as i64);
        list_qb.push(" offset ").push_bind(start as i64);

        let rows = list_qb.build().fetch_all(&self.pool).await?;
        let products = rows
            .iter()
            .map(product_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((products, total as usize))
    }

    async fn get_product(
        &self,
        id: Uuid,
    ) -> Result<Option<(FinProduct, Vec<ProductOption>)>, StoreError> {
        let row = sqlx::query(&format!(
            "select {PRODUCT_COLUMNS} from core.product where id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let product = product_from_row(&row)?;
        let options = self.product_options(id).await?;
        Ok(Some((product, options)))
    }
}
