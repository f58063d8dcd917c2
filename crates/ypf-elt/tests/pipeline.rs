//! End-to-end pipeline behavior over the in-memory store: idempotent
//! stages, identity preservation across updates, removal and revival, and
//! crash resumption.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use ypf_core::{Classification, PolicyStatus, ProductKind, RunId};
use ypf_elt::{
    PolicyPipeline, PolicyPromoter, ProductPipeline, RawIngest, SnapshotReconciler, StageError,
    StagingLander,
};
use ypf_sources::{
    explode_policy_pages, Enricher, FetchedPage, PageFeed, PagingMeta, POLICY_SOURCE,
    PRODUCT_SOURCE,
};
use ypf_storage::{
    FetchError, MemStore, PolicyStore, ProductStore, ReadStore, RunStore, StagingStore,
};

struct ScriptedFeed {
    source: &'static str,
    payload: Mutex<Value>,
}

impl ScriptedFeed {
    fn policies(items: Value) -> Self {
        Self {
            source: POLICY_SOURCE,
            payload: Mutex::new(json!({ "result": { "youthPolicyList": items } })),
        }
    }

    fn products(base: Value, options: Value) -> Self {
        Self {
            source: PRODUCT_SOURCE,
            payload: Mutex::new(json!({ "result": { "baseList": base, "optionList": options } })),
        }
    }

    async fn set_policies(&self, items: Value) {
        *self.payload.lock().await = json!({ "result": { "youthPolicyList": items } });
    }

    async fn set_products(&self, base: Value, options: Value) {
        *self.payload.lock().await =
            json!({ "result": { "baseList": base, "optionList": options } });
    }
}

#[async_trait]
impl PageFeed for ScriptedFeed {
    fn source(&self) -> &'static str {
        self.source
    }

    async fn fetch_page(&self, _run_id: RunId, page_no: u32) -> Result<FetchedPage, FetchError> {
        let params = if self.source == PRODUCT_SOURCE {
            json!({ "pageNo": page_no, "productKind": "DEPOSIT" })
        } else {
            json!({ "pageNum": page_no })
        };
        Ok(FetchedPage {
            page_no,
            http_status: 200,
            request_params: params,
            payload: self.payload.lock().await.clone(),
        })
    }

    fn page_items(&self, payload: &Value) -> Vec<Value> {
        let result = payload.get("result").unwrap_or(payload);
        result
            .get("youthPolicyList")
            .or_else(|| result.get("baseList"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    fn paging_meta(&self, _payload: &Value) -> PagingMeta {
        PagingMeta {
            page_no: 1,
            total_pages: 1,
            total_count: 0,
        }
    }
}

struct StaticEnricher(&'static str);

#[async_trait]
impl Enricher for StaticEnricher {
    async fn summarize(&self, _title: &str, _body: &str) -> Option<String> {
        Some(self.0.to_string())
    }
}

fn policy_item(no: &str, name: &str) -> Value {
    json!({
        "plcyNo": no,
        "plcyNm": name,
        "aplyPrdSeCd": "0057002",
        "inqCnt": 1,
    })
}

fn pipeline<'a>(
    store: &'a MemStore,
    enricher: &'a dyn Enricher,
) -> PolicyPipeline<'a> {
    PolicyPipeline {
        store,
        enricher,
        start_page: 1,
        end_page: 0,
    }
}

#[tokio::test]
async fn first_run_promotes_everything_as_new() {
    let store = MemStore::new();
    let feed = ScriptedFeed::policies(json!([
        policy_item("P-1", "정책 1"),
        policy_item("P-2", "정책 2"),
    ]));
    let enricher = StaticEnricher("한 줄 요약");

    let summary = pipeline(&store, &enricher).run(&feed).await.unwrap();
    assert_eq!(summary.records_staged, 2);
    assert_eq!(summary.promotion.inserted, 2);
    assert_eq!(summary.promotion.updated, 0);

    let p1 = store.policy_by_source_key("P-1").await.unwrap().unwrap();
    assert_eq!(p1.summary_ai.as_deref(), Some("한 줄 요약"));
    // ALWAYS_OPEN derives straight to OPEN
    assert_eq!(p1.status, PolicyStatus::Open);
}

#[tokio::test]
async fn unchanged_rerun_writes_nothing_to_core() {
    let store = MemStore::new();
    let feed = ScriptedFeed::policies(json!([policy_item("P-1", "정책 1")]));
    let enricher = StaticEnricher("요약");
    let pipe = pipeline(&store, &enricher);

    pipe.run(&feed).await.unwrap();
    let before = store.policy_by_source_key("P-1").await.unwrap().unwrap();

    // identical content, only the volatile view counter moved
    feed.set_policies(json!([{
        "plcyNo": "P-1", "plcyNm": "정책 1", "aplyPrdSeCd": "0057002", "inqCnt": 999,
    }]))
    .await;
    let summary = pipe.run(&feed).await.unwrap();

    assert_eq!(summary.promotion.inserted, 0);
    assert_eq!(summary.promotion.updated, 0);
    assert_eq!(summary.promotion.unchanged, 1);

    let after = store.policy_by_source_key("P-1").await.unwrap().unwrap();
    assert_eq!(after.updated_at, before.updated_at);
    assert_eq!(after.views, before.views);
}

#[tokio::test]
async fn update_preserves_identity_and_enrichment() {
    let store = MemStore::new();
    let feed = ScriptedFeed::policies(json!([policy_item("P-1", "정책 1")]));
    let enricher = StaticEnricher("최초 요약");
    let pipe = pipeline(&store, &enricher);

    pipe.run(&feed).await.unwrap();
    let before = store.policy_by_source_key("P-1").await.unwrap().unwrap();

    feed.set_policies(json!([policy_item("P-1", "정책 1 (개정)")])).await;
    // enricher now fails; the stored summary must survive the update
    let noop = ypf_sources::NoopEnricher;
    let summary = pipeline(&store, &noop).run(&feed).await.unwrap();
    assert_eq!(summary.promotion.updated, 1);

    let after = store.policy_by_source_key("P-1").await.unwrap().unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.created_at, before.created_at);
    assert_eq!(after.title, "정책 1 (개정)");
    assert_eq!(after.summary_ai.as_deref(), Some("최초 요약"));
    assert!(after.updated_at > before.updated_at);
}

#[tokio::test]
async fn removed_key_deactivates_then_revives() {
    let store = MemStore::new();
    let feed = ScriptedFeed::policies(json!([
        policy_item("P-1", "정책 1"),
        policy_item("P-2", "정책 2"),
    ]));
    let enricher = StaticEnricher("요약");
    let pipe = pipeline(&store, &enricher);

    pipe.run(&feed).await.unwrap();

    feed.set_policies(json!([policy_item("P-1", "정책 1")])).await;
    let summary = pipe.run(&feed).await.unwrap();
    assert_eq!(summary.promotion.removed, 1);

    let gone = store.policy_by_source_key("P-2").await.unwrap().unwrap();
    assert_eq!(gone.status, PolicyStatus::Inactive);
    // confirmed removals leave the snapshot
    let snapshot = store.snapshot(POLICY_SOURCE).await.unwrap();
    assert!(snapshot.iter().all(|e| e.source_key != "P-2"));

    feed.set_policies(json!([
        policy_item("P-1", "정책 1"),
        policy_item("P-2", "정책 2"),
    ]))
    .await;
    let summary = pipe.run(&feed).await.unwrap();
    // the returning key is classified NEW against the pruned snapshot but
    // revives the existing core row instead of inserting a second one
    assert_eq!(summary.promotion.inserted, 0);
    assert_eq!(summary.promotion.updated, 1);

    let back = store.policy_by_source_key("P-2").await.unwrap().unwrap();
    assert_eq!(back.id, gone.id);
    assert_eq!(back.status, PolicyStatus::Open);
}

#[tokio::test]
async fn reconciler_rerun_returns_the_persisted_delta() {
    let store = MemStore::new();
    let feed = ScriptedFeed::policies(json!([policy_item("P-1", "정책 1")]));

    store.acquire_run_lock(POLICY_SOURCE).await.unwrap();
    let run_id = store.begin_run(POLICY_SOURCE).await.unwrap();
    let ingest = RawIngest {
        store: &store,
        start_page: 1,
        end_page: 0,
    };
    ingest.run(&feed, run_id).await.unwrap();
    let lander = StagingLander { store: &store };
    lander
        .run(POLICY_SOURCE, POLICY_SOURCE, run_id, false, explode_policy_pages)
        .await
        .unwrap();

    let reconciler = SnapshotReconciler { store: &store };
    let first = reconciler.run(POLICY_SOURCE, run_id).await.unwrap();
    // snapshot now contains P-1; a naive recompute would say UNCHANGED
    let second = reconciler.run(POLICY_SOURCE, run_id).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn promoter_rerun_after_marker_is_a_no_op() {
    let store = MemStore::new();
    let feed = ScriptedFeed::policies(json!([policy_item("P-1", "정책 1")]));
    let enricher = StaticEnricher("요약");
    let pipe = pipeline(&store, &enricher);

    let summary = pipe.run(&feed).await.unwrap();
    let before = store.policy_by_source_key("P-1").await.unwrap().unwrap();

    let delta = store
        .load_delta(POLICY_SOURCE, summary.run_id)
        .await
        .unwrap()
        .unwrap();
    let promoter = PolicyPromoter {
        store: &store,
        enricher: &enricher,
    };
    let stats = promoter.run(summary.run_id, &delta, Utc::now()).await.unwrap();
    assert_eq!(stats, Default::default());

    let after = store.policy_by_source_key("P-1").await.unwrap().unwrap();
    assert_eq!(after.updated_at, before.updated_at);
}

#[tokio::test]
async fn interrupted_reconciliation_still_promotes_new_records_on_resume() {
    let store = MemStore::new();
    let feed = ScriptedFeed::policies(json!([policy_item("P-1", "정책 1")]));
    let enricher = StaticEnricher("요약");

    // crash inside the reconciler stage: staging has landed but the
    // reconciliation never committed
    let run_id = store.begin_run(POLICY_SOURCE).await.unwrap();
    let ingest = RawIngest {
        store: &store,
        start_page: 1,
        end_page: 0,
    };
    ingest.run(&feed, run_id).await.unwrap();
    let lander = StagingLander { store: &store };
    lander
        .run(POLICY_SOURCE, POLICY_SOURCE, run_id, false, explode_policy_pages)
        .await
        .unwrap();

    // the commit is atomic, so the snapshot cannot have moved without its
    // delta; both are absent after the interruption
    assert!(store.snapshot(POLICY_SOURCE).await.unwrap().is_empty());
    assert!(store.load_delta(POLICY_SOURCE, run_id).await.unwrap().is_none());

    let summary = pipeline(&store, &enricher).resume().await.unwrap();
    assert_eq!(summary.promotion.inserted, 1);

    let delta = store.load_delta(POLICY_SOURCE, run_id).await.unwrap().unwrap();
    assert_eq!(delta[0].classification, Classification::New);
    assert!(store.policy_by_source_key("P-1").await.unwrap().is_some());
}

#[tokio::test]
async fn crashed_run_resumes_without_duplicating_staging() {
    let store = MemStore::new();
    let feed = ScriptedFeed::policies(json!([policy_item("P-1", "정책 1")]));
    let enricher = StaticEnricher("요약");

    // simulate a crash right after raw ingest
    let run_id = store.begin_run(POLICY_SOURCE).await.unwrap();
    let ingest = RawIngest {
        store: &store,
        start_page: 1,
        end_page: 0,
    };
    ingest.run(&feed, run_id).await.unwrap();

    let pipe = pipeline(&store, &enricher);
    let summary = pipe.resume().await.unwrap();
    assert_eq!(summary.run_id, run_id);
    assert_eq!(summary.promotion.inserted, 1);

    // resuming a finished run changes nothing
    let again = pipe.resume().await.unwrap();
    assert_eq!(again.promotion, Default::default());
    let staged = store.staging_records(POLICY_SOURCE, run_id).await.unwrap();
    assert_eq!(staged.len(), 1);
}

#[tokio::test]
async fn held_lock_fails_fast() {
    let store = MemStore::new();
    let feed = ScriptedFeed::policies(json!([policy_item("P-1", "정책 1")]));
    let enricher = StaticEnricher("요약");

    store.acquire_run_lock(POLICY_SOURCE).await.unwrap();
    let err = pipeline(&store, &enricher).run(&feed).await.unwrap_err();
    assert!(matches!(err, StageError::LockHeld(_)));

    store.release_run_lock(POLICY_SOURCE).await.unwrap();
    pipeline(&store, &enricher).run(&feed).await.unwrap();
}

fn deposit_base(code: &str, name: &str) -> Value {
    json!({ "fin_prdt_cd": code, "fin_prdt_nm": name, "kor_co_nm": "한국은행" })
}

fn deposit_option(code: &str, term: u32, rate: f64) -> Value {
    json!({
        "fin_prdt_cd": code,
        "save_trm": term.to_string(),
        "intr_rate_type": "S",
        "intr_rate": rate,
        "intr_rate2": rate + 0.5,
    })
}

#[tokio::test]
async fn product_run_promotes_base_and_options() {
    let store = MemStore::new();
    let feed = ScriptedFeed::products(
        json!([deposit_base("X1", "정기예금")]),
        json!([deposit_option("X1", 6, 2.0), deposit_option("X1", 12, 2.3)]),
    );
    let pipe = ProductPipeline {
        store: &store,
        start_page: 1,
        end_page: 0,
    };

    let summary = pipe.run(&[&feed]).await.unwrap();
    assert_eq!(summary.promotion.inserted, 1);

    let product = store
        .product_by_source_key(ProductKind::Deposit, "X1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(product.name, "정기예금");
    assert_eq!(product.options_count, 2);
    assert!(product.option_set_hash.is_some());

    let (_, options) = store.get_product(product.id).await.unwrap().unwrap();
    assert_eq!(options.len(), 2);
}

#[tokio::test]
async fn option_change_updates_product_even_when_base_is_unchanged() {
    let store = MemStore::new();
    let feed = ScriptedFeed::products(
        json!([deposit_base("X1", "정기예금")]),
        json!([deposit_option("X1", 6, 2.0)]),
    );
    let pipe = ProductPipeline {
        store: &store,
        start_page: 1,
        end_page: 0,
    };
    pipe.run(&[&feed]).await.unwrap();
    let before = store
        .product_by_source_key(ProductKind::Deposit, "X1")
        .await
        .unwrap()
        .unwrap();

    // same base payload, different rate
    feed.set_products(
        json!([deposit_base("X1", "정기예금")]),
        json!([deposit_option("X1", 6, 2.8)]),
    )
    .await;
    let summary = pipe.run(&[&feed]).await.unwrap();
    assert_eq!(summary.promotion.updated, 1);

    let after = store
        .product_by_source_key(ProductKind::Deposit, "X1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.content_hash, before.content_hash);
    assert_ne!(after.option_set_hash, before.option_set_hash);
}
