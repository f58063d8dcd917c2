//! Core domain model for YPF: run identity, raw/staging/snapshot records,
//! delta classification, the reconciliation algorithm, and status derivation.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ypf-core";

/// Monotonically increasing pipeline run identifier, allocated by the store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct RunId(pub i64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

impl RunId {
    pub fn next(self) -> RunId {
        RunId(self.0 + 1)
    }
}

/// One verbatim upstream page, append-only. Audit trail and replay source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPage {
    pub ingest_id: Uuid,
    pub run_id: RunId,
    pub source: String,
    pub page_no: u32,
    pub http_status: u16,
    pub request_params: Value,
    pub payload: Value,
    pub fetched_at: DateTime<Utc>,
}

/// One structured record exploded from a raw page, tagged with its run
/// generation. `fetch_seq` preserves fetch order within the run for the
/// duplicate-key tie-break.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingRecord {
    pub run_id: RunId,
    pub source_key: String,
    pub record_hash: String,
    pub payload: Value,
    pub page_no: u32,
    pub fetch_seq: u32,
    pub ingested_at: DateTime<Utc>,
}

/// Latest observed state per `source_key`. Rebuilt each run by the
/// reconciler; `removal_flagged` entries survive until the promoter confirms
/// the removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub source_key: String,
    pub record_hash: String,
    pub first_seen_run: RunId,
    pub last_seen_run: RunId,
    pub removal_flagged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    New,
    Updated,
    Unchanged,
    Removed,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Classification::New => "NEW",
            Classification::Updated => "UPDATED",
            Classification::Unchanged => "UNCHANGED",
            Classification::Removed => "REMOVED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaEntry {
    pub source_key: String,
    pub classification: Classification,
    pub record_hash: String,
}

/// Output of one reconciliation pass: the rebuilt snapshot plus the
/// classified delta, both in `source_key` order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub snapshot: Vec<SnapshotEntry>,
    pub delta: Vec<DeltaEntry>,
}

/// Compare the new run's staging rows against the prior snapshot.
///
/// `staged` must be in fetch order; when the upstream emits the same
/// `source_key` twice within a run, the later-fetched row wins. Keys present
/// only in the prior snapshot are classified REMOVED and flagged, not
/// dropped — the promoter confirms removals.
pub fn reconcile(previous: &[SnapshotEntry], staged: &[StagingRecord], run_id: RunId) -> Reconciliation {
    let mut latest: BTreeMap<&str, &StagingRecord> = BTreeMap::new();
    for record in staged {
        latest.insert(record.source_key.as_str(), record);
    }

    let prior: BTreeMap<&str, &SnapshotEntry> =
        previous.iter().map(|e| (e.source_key.as_str(), e)).collect();

    let mut snapshot = Vec::with_capacity(latest.len());
    let mut delta = Vec::with_capacity(latest.len() + previous.len());

    for (key, record) in &latest {
        let classification = match prior.get(key) {
            None => Classification::New,
            Some(prev) if prev.record_hash != record.record_hash => Classification::Updated,
            Some(_) => Classification::Unchanged,
        };
        let first_seen_run = prior.get(key).map(|p| p.first_seen_run).unwrap_or(run_id);
        snapshot.push(SnapshotEntry {
            source_key: (*key).to_string(),
            record_hash: record.record_hash.clone(),
            first_seen_run,
            last_seen_run: run_id,
            removal_flagged: false,
        });
        delta.push(DeltaEntry {
            source_key: (*key).to_string(),
            classification,
            record_hash: record.record_hash.clone(),
        });
    }

    for entry in previous {
        if latest.contains_key(entry.source_key.as_str()) {
            continue;
        }
        let mut kept = entry.clone();
        kept.removal_flagged = true;
        snapshot.push(kept);
        delta.push(DeltaEntry {
            source_key: entry.source_key.clone(),
            classification: Classification::Removed,
            record_hash: entry.record_hash.clone(),
        });
    }

    snapshot.sort_by(|a, b| a.source_key.cmp(&b.source_key));
    delta.sort_by(|a, b| a.source_key.cmp(&b.source_key));

    Reconciliation { snapshot, delta }
}

/// Stable content hash over the key-sorted payload JSON with volatile
/// fields removed. serde_json maps are key-ordered, so serialization is
/// canonical once the drop list is applied.
pub fn canonical_hash(payload: &Value, drop_fields: &[&str]) -> String {
    let pruned = match payload {
        Value::Object(map) => {
            let kept: serde_json::Map<String, Value> = map
                .iter()
                .filter(|(k, _)| !drop_fields.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Value::Object(kept)
        }
        other => other.clone(),
    };
    let bytes = serde_json::to_vec(&pruned).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Policy domain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplyType {
    Periodic,
    AlwaysOpen,
    Closed,
    Unknown,
}

impl ApplyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyType::Periodic => "PERIODIC",
            ApplyType::AlwaysOpen => "ALWAYS_OPEN",
            ApplyType::Closed => "CLOSED",
            ApplyType::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> ApplyType {
        match s {
            "PERIODIC" => ApplyType::Periodic,
            "ALWAYS_OPEN" => ApplyType::AlwaysOpen,
            "CLOSED" => ApplyType::Closed,
            _ => ApplyType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyStatus {
    Open,
    Upcoming,
    Closed,
    Unknown,
    /// Terminal state for records the upstream no longer reports.
    Inactive,
}

impl PolicyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyStatus::Open => "OPEN",
            PolicyStatus::Upcoming => "UPCOMING",
            PolicyStatus::Closed => "CLOSED",
            PolicyStatus::Unknown => "UNKNOWN",
            PolicyStatus::Inactive => "INACTIVE",
        }
    }

    pub fn parse(s: &str) -> PolicyStatus {
        match s {
            "OPEN" => PolicyStatus::Open,
            "UPCOMING" => PolicyStatus::Upcoming,
            "CLOSED" => PolicyStatus::Closed,
            "INACTIVE" => PolicyStatus::Inactive,
            _ => PolicyStatus::Unknown,
        }
    }
}

/// Pure status derivation from the apply window and the reference date.
/// Recomputable at any time; the status updater never touches Inactive rows.
pub fn derive_status(
    apply_type: ApplyType,
    apply_start: Option<NaiveDate>,
    apply_end: Option<NaiveDate>,
    today: NaiveDate,
) -> PolicyStatus {
    match apply_type {
        ApplyType::AlwaysOpen => PolicyStatus::Open,
        ApplyType::Closed => PolicyStatus::Closed,
        ApplyType::Periodic => match (apply_start, apply_end) {
            (Some(start), Some(end)) => {
                if today < start {
                    PolicyStatus::Upcoming
                } else if today > end {
                    PolicyStatus::Closed
                } else {
                    PolicyStatus::Open
                }
            }
            _ => PolicyStatus::Unknown,
        },
        ApplyType::Unknown => PolicyStatus::Unknown,
    }
}

/// Durable youth-policy entity. The internal `id` is immutable for the
/// record's lifetime; `source_key` is the upstream policy number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: Uuid,
    pub source_key: String,
    pub title: String,
    pub summary_raw: Option<String>,
    pub description_raw: Option<String>,
    /// Core-only enrichment field; promotion never clobbers an existing
    /// value with None.
    pub summary_ai: Option<String>,
    pub apply_type: ApplyType,
    pub apply_start: Option<NaiveDate>,
    pub apply_end: Option<NaiveDate>,
    pub supervising_org: Option<String>,
    pub operating_org: Option<String>,
    pub apply_url: Option<String>,
    pub ref_url_1: Option<String>,
    pub ref_url_2: Option<String>,
    pub keywords: Vec<String>,
    pub regions: Vec<String>,
    pub views: i64,
    pub status: PolicyStatus,
    pub content_hash: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    /// Rewrite the upstream-derived fields from a freshly normalized record,
    /// keeping the internal key, creation time, current status, and any
    /// core-only enrichment the fresh record does not carry.
    pub fn patch_from(&mut self, fresh: &Policy, now: DateTime<Utc>) {
        self.title = fresh.title.clone();
        self.summary_raw = fresh.summary_raw.clone();
        self.description_raw = fresh.description_raw.clone();
        if fresh.summary_ai.is_some() {
            self.summary_ai = fresh.summary_ai.clone();
        }
        self.apply_type = fresh.apply_type;
        self.apply_start = fresh.apply_start;
        self.apply_end = fresh.apply_end;
        self.supervising_org = fresh.supervising_org.clone();
        self.operating_org = fresh.operating_org.clone();
        self.apply_url = fresh.apply_url.clone();
        self.ref_url_1 = fresh.ref_url_1.clone();
        self.ref_url_2 = fresh.ref_url_2.clone();
        self.keywords = fresh.keywords.clone();
        self.regions = fresh.regions.clone();
        self.views = fresh.views;
        self.content_hash = fresh.content_hash.clone();
        self.payload = fresh.payload.clone();
        self.updated_at = now;
    }
}

// ---------------------------------------------------------------------------
// Financial-product domain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductKind {
    Deposit,
    Saving,
}

impl ProductKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductKind::Deposit => "DEPOSIT",
            ProductKind::Saving => "SAVING",
        }
    }

    pub fn parse(s: &str) -> Option<ProductKind> {
        match s {
            "DEPOSIT" => Some(ProductKind::Deposit),
            "SAVING" => Some(ProductKind::Saving),
            _ => None,
        }
    }
}

/// Durable financial-product entity keyed by the upstream `fin_prdt_cd`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinProduct {
    pub id: Uuid,
    pub kind: ProductKind,
    pub source_key: String,
    pub disclosure_month: Option<String>,
    pub name: String,
    pub company_code: Option<String>,
    pub company_name: Option<String>,
    pub join_way: Option<String>,
    pub join_member: Option<String>,
    pub special_condition: Option<String>,
    pub etc_note: Option<String>,
    pub max_limit: Option<f64>,
    pub content_hash: String,
    pub option_set_hash: Option<String>,
    pub options_count: i64,
    pub active: bool,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FinProduct {
    /// Same contract as [`Policy::patch_from`]: upstream fields only.
    pub fn patch_from(&mut self, fresh: &FinProduct, now: DateTime<Utc>) {
        self.disclosure_month = fresh.disclosure_month.clone();
        self.name = fresh.name.clone();
        self.company_code = fresh.company_code.clone();
        self.company_name = fresh.company_name.clone();
        self.join_way = fresh.join_way.clone();
        self.join_member = fresh.join_member.clone();
        self.special_condition = fresh.special_condition.clone();
        self.etc_note = fresh.etc_note.clone();
        self.max_limit = fresh.max_limit;
        self.content_hash = fresh.content_hash.clone();
        self.payload = fresh.payload.clone();
        self.updated_at = now;
    }
}

/// Child row of a [`FinProduct`], fully replaced on each promotion of its
/// parent rather than patched incrementally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductOption {
    pub save_term_months: Option<i32>,
    pub rate_type: Option<String>,
    pub rate_type_name: Option<String>,
    pub base_rate: Option<f64>,
    pub max_rate: Option<f64>,
    pub reserve_type: Option<String>,
    pub content_hash: String,
    pub payload: Value,
}

/// Deterministic digest of a product's current option set, used to detect
/// option-level changes without row-by-row comparison. None for an empty set.
pub fn option_set_hash(options: &[ProductOption]) -> Option<String> {
    if options.is_empty() {
        return None;
    }
    let mut lines: Vec<String> = options
        .iter()
        .map(|o| {
            format!(
                "{}|{}|{}|{}|{}",
                o.save_term_months.unwrap_or(-1),
                o.rate_type.as_deref().unwrap_or(""),
                o.reserve_type.as_deref().unwrap_or(""),
                o.base_rate.map(|r| format!("{r:.5}")).unwrap_or_default(),
                o.max_rate.map(|r| format!("{r:.5}")).unwrap_or_default(),
            )
        })
        .collect();
    lines.sort();
    let mut hasher = Sha256::new();
    hasher.update(lines.join(";").as_bytes());
    Some(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn staged(key: &str, payload: Value, page_no: u32, fetch_seq: u32) -> StagingRecord {
        StagingRecord {
            run_id: RunId(7),
            source_key: key.to_string(),
            record_hash: canonical_hash(&payload, &[]),
            payload,
            page_no,
            fetch_seq,
            ingested_at: Utc::now(),
        }
    }

    fn snap(key: &str, payload: Value) -> SnapshotEntry {
        SnapshotEntry {
            source_key: key.to_string(),
            record_hash: canonical_hash(&payload, &[]),
            first_seen_run: RunId(6),
            last_seen_run: RunId(6),
            removal_flagged: false,
        }
    }

    #[test]
    fn classification_covers_new_updated_unchanged_removed() {
        let previous = vec![snap("A", json!({"v": 1})), snap("B", json!({"v": 1}))];
        let current = vec![
            staged("A", json!({"v": 1}), 1, 0),
            staged("C", json!({"v": 1}), 1, 1),
        ];
        let out = reconcile(&previous, &current, RunId(7));

        let by_key: BTreeMap<_, _> = out
            .delta
            .iter()
            .map(|d| (d.source_key.as_str(), d.classification))
            .collect();
        assert_eq!(by_key["A"], Classification::Unchanged);
        assert_eq!(by_key["B"], Classification::Removed);
        assert_eq!(by_key["C"], Classification::New);
    }

    #[test]
    fn updated_when_hash_differs() {
        let previous = vec![snap("A", json!({"v": 1}))];
        let current = vec![staged("A", json!({"v": 2}), 1, 0)];
        let out = reconcile(&previous, &current, RunId(7));
        assert_eq!(out.delta[0].classification, Classification::Updated);
        assert_eq!(out.snapshot[0].record_hash, current[0].record_hash);
        assert_eq!(out.snapshot[0].first_seen_run, RunId(6));
        assert_eq!(out.snapshot[0].last_seen_run, RunId(7));
    }

    #[test]
    fn exactly_one_snapshot_entry_per_key() {
        let previous = vec![snap("A", json!({"v": 1}))];
        let current = vec![
            staged("A", json!({"v": 2}), 1, 0),
            staged("A", json!({"v": 3}), 2, 0),
            staged("B", json!({"v": 1}), 2, 1),
        ];
        let out = reconcile(&previous, &current, RunId(7));
        assert_eq!(out.snapshot.len(), 2);
    }

    #[test]
    fn duplicate_source_key_resolves_to_later_fetch() {
        let v1 = json!({"v": 1});
        let v2 = json!({"v": 2});
        let current = vec![staged("A", v1, 1, 0), staged("A", v2.clone(), 2, 0)];
        let out = reconcile(&[], &current, RunId(7));
        assert_eq!(out.snapshot.len(), 1);
        assert_eq!(out.snapshot[0].record_hash, canonical_hash(&v2, &[]));
    }

    #[test]
    fn removed_entries_are_flagged_not_dropped() {
        let previous = vec![snap("A", json!({"v": 1}))];
        let out = reconcile(&previous, &[], RunId(7));
        assert_eq!(out.snapshot.len(), 1);
        assert!(out.snapshot[0].removal_flagged);
        assert_eq!(out.delta[0].classification, Classification::Removed);
    }

    #[test]
    fn reconcile_is_deterministic() {
        let previous = vec![snap("A", json!({"v": 1})), snap("B", json!({"v": 2}))];
        let current = vec![
            staged("B", json!({"v": 3}), 1, 0),
            staged("C", json!({"v": 1}), 1, 1),
        ];
        let first = reconcile(&previous, &current, RunId(7));
        let second = reconcile(&previous, &current, RunId(7));
        assert_eq!(first, second);
    }

    #[test]
    fn canonical_hash_ignores_dropped_and_key_order() {
        let a = json!({"title": "x", "inqCnt": 10});
        let b = json!({"inqCnt": 999, "title": "x"});
        assert_eq!(canonical_hash(&a, &["inqCnt"]), canonical_hash(&b, &["inqCnt"]));
        assert_ne!(canonical_hash(&a, &[]), canonical_hash(&b, &[]));
    }

    #[test]
    fn status_derivation_matches_apply_window() {
        let d = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap();
        let today = d("2026-08-30");

        assert_eq!(
            derive_status(ApplyType::AlwaysOpen, None, None, today),
            PolicyStatus::Open
        );
        assert_eq!(
            derive_status(ApplyType::Closed, None, None, today),
            PolicyStatus::Closed
        );
        assert_eq!(
            derive_status(ApplyType::Periodic, Some(d("2026-08-01")), Some(d("2026-09-01")), today),
            PolicyStatus::Open
        );
        assert_eq!(
            derive_status(ApplyType::Periodic, Some(d("2026-09-01")), Some(d("2026-09-30")), today),
            PolicyStatus::Upcoming
        );
        assert_eq!(
            derive_status(ApplyType::Periodic, Some(d("2026-01-01")), Some(d("2026-02-01")), today),
            PolicyStatus::Closed
        );
        assert_eq!(
            derive_status(ApplyType::Periodic, None, Some(d("2026-02-01")), today),
            PolicyStatus::Unknown
        );
    }

    #[test]
    fn option_set_hash_is_order_insensitive() {
        let opt = |term: i32, rate: f64| ProductOption {
            save_term_months: Some(term),
            rate_type: Some("S".into()),
            rate_type_name: Some("단리".into()),
            base_rate: Some(rate),
            max_rate: Some(rate + 0.5),
            reserve_type: None,
            content_hash: String::new(),
            payload: json!({}),
        };
        let forward = vec![opt(6, 2.1), opt(12, 2.4)];
        let reversed = vec![opt(12, 2.4), opt(6, 2.1)];
        assert_eq!(option_set_hash(&forward), option_set_hash(&reversed));
        assert_eq!(option_set_hash(&[]), None);
    }
}
