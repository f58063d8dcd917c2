//! Read-only JSON API over the core tables: policy and product listings
//! with filtering and pagination, plus per-record detail.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use uuid::Uuid;

use ypf_core::{FinProduct, Policy, PolicyStatus, ProductKind, ProductOption};
use ypf_storage::{PolicyFilter, ProductFilter, ReadStore};

pub const CRATE_NAME: &str = "ypf-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ReadStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn ReadStore>) -> Self {
        Self { store }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/policies", get(policies_handler))
        .route("/policies/{id}", get(policy_detail_handler))
        .route("/products", get(products_handler))
        .route("/products/{id}", get(product_detail_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize, Default)]
struct PoliciesQuery {
    status: Option<String>,
    keyword: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ProductsQuery {
    product_type: Option<String>,
    company: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Serialize)]
struct PageEnvelope<T> {
    items: Vec<T>,
    page: usize,
    per_page: usize,
    total: usize,
}

#[derive(Debug, Serialize)]
struct ProductDetail {
    #[serde(flatten)]
    product: FinProduct,
    options: Vec<ProductOption>,
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn policies_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PoliciesQuery>,
) -> Response {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => match parse_status(raw) {
            Some(status) => Some(status),
            None => return bad_request(format!("unknown status {raw}")),
        },
    };
    let (page, per_page) = page_params(query.page, query.per_page);
    let filter = PolicyFilter {
        status,
        keyword: query.keyword.filter(|k| !k.trim().is_empty()),
        page,
        per_page,
    };

    match state.store.list_policies(&filter).await {
        Ok((items, total)) => Json(PageEnvelope::<Policy> {
            items,
            page,
            per_page,
            total,
        })
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn policy_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let Ok(id) = Uuid::parse_str(&id) else {
        return bad_request("id must be a UUID".to_string());
    };
    match state.store.get_policy(id).await {
        Ok(Some(policy)) => Json(policy).into_response(),
        Ok(None) => not_found("policy not found"),
        Err(err) => server_error(err.into()),
    }
}

async fn products_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProductsQuery>,
) -> Response {
    let kind = match query.product_type.as_deref() {
        None | Some("") => None,
        Some(raw) => match ProductKind::parse(&raw.to_uppercase()) {
            Some(kind) => Some(kind),
            None => return bad_request(format!("unknown product_type {raw}")),
        },
    };
    let (page, per_page) = page_params(query.page, query.per_page);
    let filter = ProductFilter {
        kind,
        company: query.company.filter(|c| !c.trim().is_empty()),
        page,
        per_page,
    };

    match state.store.list_products(&filter).await {
        Ok((items, total)) => Json(PageEnvelope::<FinProduct> {
            items,
            page,
            per_page,
            total,
        })
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn product_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let Ok(id) = Uuid::parse_str(&id) else {
        return bad_request("id must be a UUID".to_string());
    };
    match state.store.get_product(id).await {
        Ok(Some((product, options))) => Json(ProductDetail { product, options }).into_response(),
        Ok(None) => not_found("product not found"),
        Err(err) => server_error(err.into()),
    }
}

fn page_params(page: Option<usize>, per_page: Option<usize>) -> (usize, usize) {
    (page.unwrap_or(1).max(1), per_page.unwrap_or(20).clamp(1, 100))
}

/// Strict status parse for the query string; the lenient store-side parse
/// would silently turn typos into the Unknown bucket.
fn parse_status(raw: &str) -> Option<PolicyStatus> {
    let upper = raw.to_uppercase();
    let parsed = PolicyStatus::parse(&upper);
    if parsed == PolicyStatus::Unknown && upper != "UNKNOWN" {
        None
    } else {
        Some(parsed)
    }
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    tracing::error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": "internal error" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;
    use ypf_core::ApplyType;
    use ypf_storage::{MemStore, PolicyStore, ProductStore};

    fn policy(key: &str, title: &str, status: PolicyStatus) -> Policy {
        let now = Utc::now();
        Policy {
            id: Uuid::new_v4(),
            source_key: key.to_string(),
            title: title.to_string(),
            summary_raw: None,
            description_raw: None,
            summary_ai: None,
            apply_type: ApplyType::AlwaysOpen,
            apply_start: None,
            apply_end: None,
            supervising_org: None,
            operating_org: None,
            apply_url: None,
            ref_url_1: None,
            ref_url_2: None,
            keywords: vec![],
            regions: vec![],
            views: 0,
            status,
            content_hash: "h".to_string(),
            payload: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    async fn seeded_state() -> AppState {
        let store = MemStore::new();
        store
            .insert_policy(&policy("P-1", "청년 월세 지원", PolicyStatus::Open))
            .await
            .unwrap();
        store
            .insert_policy(&policy("P-2", "취업 장려금", PolicyStatus::Closed))
            .await
            .unwrap();

        let now = Utc::now();
        let product = FinProduct {
            id: Uuid::new_v4(),
            kind: ProductKind::Deposit,
            source_key: "X1".to_string(),
            disclosure_month: Some("202608".to_string()),
            name: "정기예금".to_string(),
            company_code: None,
            company_name: Some("한국은행".to_string()),
            join_way: None,
            join_member: None,
            special_condition: None,
            etc_note: None,
            max_limit: None,
            content_hash: "h".to_string(),
            option_set_hash: None,
            options_count: 1,
            active: true,
            payload: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };
        let option = ProductOption {
            save_term_months: Some(12),
            rate_type: Some("S".to_string()),
            rate_type_name: None,
            base_rate: Some(2.1),
            max_rate: Some(2.6),
            reserve_type: None,
            content_hash: "oh".to_string(),
            payload: serde_json::json!({}),
        };
        store.upsert_product(&product, &[option]).await.unwrap();

        AppState::new(Arc::new(store))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_is_ok() {
        let app = app(seeded_state().await);
        let (status, body) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn policies_filter_by_status_and_keyword() {
        let state = seeded_state().await;

        let (status, body) = get_json(app(state.clone()), "/policies").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);

        let (_, body) = get_json(app(state.clone()), "/policies?status=OPEN").await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["items"][0]["source_key"], "P-1");

        let (_, body) = get_json(app(state.clone()), "/policies?keyword=%EC%9B%94%EC%84%B8").await;
        assert_eq!(body["total"], 1);

        let (status, _) = get_json(app(state), "/policies?status=bogus").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn policy_detail_roundtrip_and_misses() {
        let state = seeded_state().await;
        let (_, listing) = get_json(app(state.clone()), "/policies?status=OPEN").await;
        let id = listing["items"][0]["id"].as_str().unwrap().to_string();

        let (status, body) = get_json(app(state.clone()), &format!("/policies/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["title"], "청년 월세 지원");

        let (status, _) =
            get_json(app(state.clone()), &format!("/policies/{}", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get_json(app(state), "/policies/not-a-uuid").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn product_listing_and_detail_with_options() {
        let state = seeded_state().await;

        let (status, body) = get_json(app(state.clone()), "/products?product_type=deposit").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        let id = body["items"][0]["id"].as_str().unwrap().to_string();

        let (_, body) = get_json(app(state.clone()), "/products?company=%ED%95%9C%EA%B5%AD").await;
        assert_eq!(body["total"], 1);

        let (status, body) = get_json(app(state), &format!("/products/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "정기예금");
        assert_eq!(body["options"].as_array().unwrap().len(), 1);
    }
}
