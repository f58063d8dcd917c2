//! Upstream API feeds and record normalization.
//!
//! Two upstreams are covered: the youth-policy portal (paged policy list)
//! and the financial-products disclosure API (deposit and saving products,
//! each page carrying a `baseList` and an `optionList`). Feeds only fetch
//! and describe pages; exploding pages into staging records and building
//! core entities are pure functions so the pipeline stages stay testable.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use ypf_core::{
    canonical_hash, ApplyType, FinProduct, Policy, PolicyStatus, ProductKind, ProductOption,
    RawPage, RunId, StagingRecord,
};
use ypf_storage::{ApiClient, ApiClientConfig, FetchError};

pub const CRATE_NAME: &str = "ypf-sources";

/// Source namespaces. Raw product pages land once under [`PRODUCT_SOURCE`];
/// the base and option landers explode the same pages into their own
/// staging namespaces.
pub const POLICY_SOURCE: &str = "youthpolicy";
pub const PRODUCT_SOURCE: &str = "finproduct";
pub const PRODUCT_BASE_SOURCE: &str = "finproduct/base";
pub const PRODUCT_OPTION_SOURCE: &str = "finproduct/option";

/// Volatile upstream fields excluded from policy content hashing. `inqCnt`
/// is a view counter that changes on every fetch.
pub const POLICY_HASH_DROP: &[&str] = &["inqCnt"];

// ---------------------------------------------------------------------------
// Page feeds
// ---------------------------------------------------------------------------

/// Pagination facts a feed can read off one page payload; zero means the
/// upstream did not report the figure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PagingMeta {
    pub page_no: u32,
    pub total_pages: u32,
    pub total_count: u64,
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub page_no: u32,
    pub http_status: u16,
    pub request_params: Value,
    pub payload: Value,
}

/// One paged upstream. Implementations describe how to fetch a page and how
/// to read items and paging metadata back out of the stored payload.
#[async_trait]
pub trait PageFeed: Send + Sync {
    fn source(&self) -> &'static str;
    async fn fetch_page(&self, run_id: RunId, page_no: u32) -> Result<FetchedPage, FetchError>;
    fn page_items(&self, payload: &Value) -> Vec<Value>;
    fn paging_meta(&self, payload: &Value) -> PagingMeta;
}

fn result_node(payload: &Value) -> &Value {
    payload.get("result").unwrap_or(payload)
}

fn list_node(payload: &Value, names: &[&str]) -> Vec<Value> {
    let result = result_node(payload);
    for name in names {
        if let Some(items) = result.get(name).and_then(Value::as_array) {
            return items.clone();
        }
    }
    Vec::new()
}

/// Youth-policy portal feed. The page parameter name has changed upstream
/// before, so paging metadata is read defensively with a computed fallback.
pub struct YouthPolicyApi {
    client: ApiClient,
    base_url: String,
    api_key: String,
    page_size: u32,
}

impl YouthPolicyApi {
    pub fn new(
        base_url: String,
        api_key: String,
        page_size: u32,
        config: ApiClientConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: ApiClient::new(config)?,
            base_url,
            api_key,
            page_size,
        })
    }
}

#[async_trait]
impl PageFeed for YouthPolicyApi {
    fn source(&self) -> &'static str {
        POLICY_SOURCE
    }

    async fn fetch_page(&self, run_id: RunId, page_no: u32) -> Result<FetchedPage, FetchError> {
        let params = [
            ("apiKeyNm", self.api_key.clone()),
            ("pageNum", page_no.to_string()),
            ("pageSize", self.page_size.to_string()),
        ];
        let fetched = self.client.get_json(run_id, &self.base_url, &params).await?;
        Ok(FetchedPage {
            page_no,
            http_status: fetched.http_status,
            // key is redacted from the audit trail
            request_params: json!({ "pageNum": page_no, "pageSize": self.page_size }),
            payload: fetched.body,
        })
    }

    fn page_items(&self, payload: &Value) -> Vec<Value> {
        list_node(payload, &["youthPolicyList", "items"])
    }

    fn paging_meta(&self, payload: &Value) -> PagingMeta {
        let paging = result_node(payload).get("paging").cloned().unwrap_or(Value::Null);
        let page_no = json_u32(&paging, "pageNum")
            .or_else(|| json_u32(&paging, "page"))
            .unwrap_or(0);
        let page_size = json_u32(&paging, "pageSize").unwrap_or(self.page_size).max(1);
        let total_count = json_u64(&paging, "totCount").unwrap_or(0);

        let computed = if total_count > 0 {
            (total_count.div_ceil(page_size as u64)) as u32
        } else {
            0
        };
        let total_pages = json_u32(&paging, "totPage").unwrap_or(computed);

        PagingMeta {
            page_no,
            total_pages,
            total_count,
        }
    }
}

/// Financial-products disclosure feed for one product kind. Each response
/// page carries both the base list and the option list; the base list
/// drives pagination.
pub struct FinlifeApi {
    client: ApiClient,
    base_url: String,
    auth_key: String,
    top_fin_grp_no: String,
    kind: ProductKind,
}

impl FinlifeApi {
    pub fn new(
        base_url: String,
        auth_key: String,
        top_fin_grp_no: String,
        kind: ProductKind,
        config: ApiClientConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: ApiClient::new(config)?,
            base_url,
            auth_key,
            top_fin_grp_no,
            kind,
        })
    }
}

#[async_trait]
impl PageFeed for FinlifeApi {
    fn source(&self) -> &'static str {
        PRODUCT_SOURCE
    }

    async fn fetch_page(&self, run_id: RunId, page_no: u32) -> Result<FetchedPage, FetchError> {
        let params = [
            ("auth", self.auth_key.clone()),
            ("topFinGrpNo", self.top_fin_grp_no.clone()),
            ("pageNo", page_no.to_string()),
        ];
        let fetched = self.client.get_json(run_id, &self.base_url, &params).await?;
        Ok(FetchedPage {
            page_no,
            http_status: fetched.http_status,
            request_params: json!({
                "topFinGrpNo": self.top_fin_grp_no,
                "pageNo": page_no,
                "productKind": self.kind.as_str(),
            }),
            payload: fetched.body,
        })
    }

    fn page_items(&self, payload: &Value) -> Vec<Value> {
        list_node(payload, &["baseList"])
    }

    fn paging_meta(&self, payload: &Value) -> PagingMeta {
        let result = result_node(payload);
        PagingMeta {
            page_no: json_u32(result, "now_page_no").unwrap_or(0),
            total_pages: json_u32(result, "max_page_no").unwrap_or(0),
            total_count: json_u64(result, "total_count").unwrap_or(0),
        }
    }
}

// ---------------------------------------------------------------------------
// Page explosion (raw -> staging records)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedItem {
    pub page_no: u32,
    pub reason: String,
}

/// Outcome of exploding a run's raw pages: parseable items become staging
/// records, the rest are reported rather than silently dropped.
#[derive(Debug, Clone, Default)]
pub struct ParseReport {
    pub records: Vec<StagingRecord>,
    pub skipped: Vec<SkippedItem>,
}

/// Composite key for product records so deposit and saving codes cannot
/// collide in the shared staging namespace.
pub fn product_source_key(kind: ProductKind, fin_prdt_cd: &str) -> String {
    format!("{}:{}", kind.as_str(), fin_prdt_cd)
}

fn page_kind(page: &RawPage) -> Option<ProductKind> {
    page.request_params
        .get("productKind")
        .and_then(Value::as_str)
        .and_then(ProductKind::parse)
}

pub fn explode_policy_pages(pages: &[RawPage]) -> ParseReport {
    let mut report = ParseReport::default();
    let mut fetch_seq = 0u32;

    for page in pages {
        let items = list_node(&page.payload, &["youthPolicyList", "items"]);
        for item in items {
            let seq = fetch_seq;
            fetch_seq += 1;
            match json_str(&item, "plcyNo") {
                Some(policy_no) => report.records.push(StagingRecord {
                    run_id: page.run_id,
                    source_key: policy_no,
                    record_hash: canonical_hash(&item, POLICY_HASH_DROP),
                    payload: item,
                    page_no: page.page_no,
                    fetch_seq: seq,
                    ingested_at: page.fetched_at,
                }),
                None => report.skipped.push(SkippedItem {
                    page_no: page.page_no,
                    reason: "missing plcyNo".to_string(),
                }),
            }
        }
    }
    report
}

fn explode_product_list(pages: &[RawPage], list_name: &str) -> ParseReport {
    let mut report = ParseReport::default();
    let mut fetch_seq = 0u32;

    for page in pages {
        let Some(kind) = page_kind(page) else {
            report.skipped.push(SkippedItem {
                page_no: page.page_no,
                reason: "page without productKind".to_string(),
            });
            continue;
        };
        let items = list_node(&page.payload, &[list_name]);
        for item in items {
            let seq = fetch_seq;
            fetch_seq += 1;
            match json_str(&item, "fin_prdt_cd") {
                Some(code) => report.records.push(StagingRecord {
                    run_id: page.run_id,
                    source_key: product_source_key(kind, &code),
                    record_hash: canonical_hash(&item, &[]),
                    payload: item,
                    page_no: page.page_no,
                    fetch_seq: seq,
                    ingested_at: page.fetched_at,
                }),
                None => report.skipped.push(SkippedItem {
                    page_no: page.page_no,
                    reason: format!("{list_name} item missing fin_prdt_cd"),
                }),
            }
        }
    }
    report
}

pub fn explode_product_base_pages(pages: &[RawPage]) -> ParseReport {
    explode_product_list(pages, "baseList")
}

/// Options are landed wholesale (several records may share one source key);
/// they are never reconciled, only read back by the promoter.
pub fn explode_product_option_pages(pages: &[RawPage]) -> ParseReport {
    explode_product_list(pages, "optionList")
}

// ---------------------------------------------------------------------------
// Normalization helpers
// ---------------------------------------------------------------------------

fn json_str(value: &Value, key: &str) -> Option<String> {
    let s = match value.get(key)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn json_u32(value: &Value, key: &str) -> Option<u32> {
    json_i64(value, key).and_then(|n| u32::try_from(n).ok())
}

fn json_u64(value: &Value, key: &str) -> Option<u64> {
    json_i64(value, key).and_then(|n| u64::try_from(n).ok())
}

/// Upstreams are loose about number typing; accept both numbers and numeric
/// strings.
fn json_i64(value: &Value, key: &str) -> Option<i64> {
    match value.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_f64(value: &Value, key: &str) -> Option<f64> {
    match value.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Literal "-" is the upstream's spelling of "no value".
pub fn dash_to_none(value: Option<String>) -> Option<String> {
    match value {
        Some(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() || trimmed == "-" {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        None => None,
    }
}

pub fn parse_compact_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y%m%d").ok()
}

/// Apply window format: `"20240823 ~ 20240913"`. Anything else yields an
/// open pair.
pub fn parse_apply_period(s: &str) -> (Option<NaiveDate>, Option<NaiveDate>) {
    let mut parts = s.splitn(2, '~');
    let (Some(start), Some(end)) = (parts.next(), parts.next()) else {
        return (None, None);
    };
    match (parse_compact_date(start), parse_compact_date(end)) {
        (Some(start), Some(end)) => (Some(start), Some(end)),
        _ => (None, None),
    }
}

/// Comma-separated code or name lists, e.g. `plcyKywdNm` and `zipCd`.
pub fn split_code_list(value: &Value, key: &str) -> Vec<String> {
    match value.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

pub fn apply_type_from_code(code: &str) -> ApplyType {
    match code {
        "0057001" => ApplyType::Periodic,
        "0057002" => ApplyType::AlwaysOpen,
        "0057003" => ApplyType::Closed,
        _ => ApplyType::Unknown,
    }
}

// ---------------------------------------------------------------------------
// Core entity builders
// ---------------------------------------------------------------------------

/// Build a fresh policy entity from one staged payload. Status starts
/// Unknown; derivation is the status updater's job. `summary_ai` is filled
/// later by the enricher, if at all.
pub fn policy_from_payload(
    source_key: &str,
    payload: &Value,
    record_hash: &str,
    now: DateTime<Utc>,
) -> Policy {
    let (apply_start, apply_end) = json_str(payload, "aplyYmd")
        .map(|s| parse_apply_period(&s))
        .unwrap_or((None, None));
    let apply_type = json_str(payload, "aplyPrdSeCd")
        .map(|c| apply_type_from_code(&c))
        .unwrap_or(ApplyType::Unknown);

    Policy {
        id: Uuid::new_v4(),
        source_key: source_key.to_string(),
        title: json_str(payload, "plcyNm").unwrap_or_default(),
        summary_raw: dash_to_none(json_str(payload, "plcyCn")),
        description_raw: dash_to_none(json_str(payload, "plcySprtCn")),
        summary_ai: None,
        apply_type,
        apply_start,
        apply_end,
        supervising_org: dash_to_none(json_str(payload, "sprvsnInstCdNm")),
        operating_org: dash_to_none(json_str(payload, "operInstCdNm")),
        apply_url: dash_to_none(json_str(payload, "aplyUrlAddr")),
        ref_url_1: dash_to_none(json_str(payload, "refUrlAddr1")),
        ref_url_2: dash_to_none(json_str(payload, "refUrlAddr2")),
        keywords: split_code_list(payload, "plcyKywdNm"),
        regions: split_code_list(payload, "zipCd"),
        views: json_i64(payload, "inqCnt").unwrap_or(0),
        status: PolicyStatus::Unknown,
        content_hash: record_hash.to_string(),
        payload: payload.clone(),
        created_at: now,
        updated_at: now,
    }
}

pub fn product_from_payload(
    kind: ProductKind,
    source_key: &str,
    payload: &Value,
    record_hash: &str,
    now: DateTime<Utc>,
) -> FinProduct {
    FinProduct {
        id: Uuid::new_v4(),
        kind,
        source_key: source_key.to_string(),
        disclosure_month: json_str(payload, "dcls_month"),
        name: json_str(payload, "fin_prdt_nm").unwrap_or_default(),
        company_code: json_str(payload, "fin_co_no"),
        company_name: json_str(payload, "kor_co_nm"),
        join_way: dash_to_none(json_str(payload, "join_way")),
        join_member: dash_to_none(json_str(payload, "join_member")),
        special_condition: dash_to_none(json_str(payload, "spcl_cnd")),
        etc_note: dash_to_none(json_str(payload, "etc_note")),
        max_limit: json_f64(payload, "max_limit"),
        content_hash: record_hash.to_string(),
        option_set_hash: None,
        options_count: 0,
        active: true,
        payload: payload.clone(),
        created_at: now,
        updated_at: now,
    }
}

pub fn option_from_payload(payload: &Value) -> ProductOption {
    ProductOption {
        save_term_months: json_i64(payload, "save_trm").and_then(|n| i32::try_from(n).ok()),
        rate_type: json_str(payload, "intr_rate_type"),
        rate_type_name: json_str(payload, "intr_rate_type_nm"),
        base_rate: json_f64(payload, "intr_rate"),
        max_rate: json_f64(payload, "intr_rate2"),
        reserve_type: json_str(payload, "rsrv_type"),
        content_hash: canonical_hash(payload, &[]),
        payload: payload.clone(),
    }
}

// ---------------------------------------------------------------------------
// Enrichment
// ---------------------------------------------------------------------------

/// Best-effort summary generation for new or updated policies. Failures
/// never fail a promotion; the field just stays empty until a later run.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn summarize(&self, title: &str, body: &str) -> Option<String>;
}

pub struct NoopEnricher;

#[async_trait]
impl Enricher for NoopEnricher {
    async fn summarize(&self, _title: &str, _body: &str) -> Option<String> {
        None
    }
}

/// Gemini `generateContent` REST call. One short completion per policy.
pub struct GeminiEnricher {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl GeminiEnricher {
    pub fn new(api_key: String, model: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key,
            model,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.model
        )
    }
}

#[async_trait]
impl Enricher for GeminiEnricher {
    async fn summarize(&self, title: &str, body: &str) -> Option<String> {
        let prompt = format!(
            "다음 청년정책을 두 문장 이내로 요약해 주세요.\n정책명: {title}\n내용: {body}"
        );
        let request = json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });

        let response = self
            .client
            .post(self.endpoint())
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await;

        let body = match response {
            Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                Ok(body) => body,
                Err(err) => {
                    warn!(error = %err, "enricher returned unreadable body");
                    return None;
                }
            },
            Ok(resp) => {
                warn!(status = resp.status().as_u16(), "enricher request rejected");
                return None;
            }
            Err(err) => {
                warn!(error = %err, "enricher request failed");
                return None;
            }
        };

        body.pointer("/candidates/0/content/parts/0/text")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}
