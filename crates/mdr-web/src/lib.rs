//! JSON HTTP surface for the merge consistency service.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use mdr_core::MergeRequest;
use mdr_service::{MergeService, QueryService, ServiceConfig};
use mdr_storage::{MerchantStore, StoreError};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "mdr-web";

#[derive(Clone)]
pub struct AppState {
    pub query: QueryService,
    pub merge: MergeService,
}

impl AppState {
    pub fn new(store: Arc<dyn MerchantStore>) -> Self {
        Self {
            query: QueryService::new(store.clone()),
            merge: MergeService::new(store),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/pairs", get(pairs_handler))
        .route("/merge", post(merge_handler))
        .route("/history", get(history_handler))
        .route("/merchants/{id}", get(merchant_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &ServiceConfig, store: Arc<dyn MerchantStore>) -> anyhow::Result<()> {
    let listener = TcpListener::bind((config.web_host.as_str(), config.web_port)).await?;
    info!(addr = %listener.local_addr()?, "mdr-web listening");
    axum::serve(listener, app(AppState::new(store))).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn pairs_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.query.list_unresolved_pairs().await {
        Ok(pairs) => Json(pairs).into_response(),
        Err(err) => server_error(err),
    }
}

/// Rejections are part of the normal contract and still answer 200.
async fn merge_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MergeRequest>,
) -> Response {
    Json(state.merge.merge_merchants(&request).await).into_response()
}

async fn history_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.query.list_merge_history().await {
        Ok(history) => Json(history).into_response(),
        Err(err) => server_error(err),
    }
}

async fn merchant_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.query.get_merchant(&id).await {
        Ok(Some(merchant)) => Json(merchant).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("merchant '{id}' not found"),
            }),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: StoreError) -> Response {
    error!(error = %err, "storage read failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use mdr_core::{NewCandidate, NewMerchant};
    use mdr_service::{seed_store, SeedFixture};
    use mdr_storage::{FailPoint, MemoryStore};
    use serde_json::Value;
    use tower::ServiceExt;

    async fn seeded_store() -> Arc<MemoryStore> {
        let created = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).single().unwrap();
        let merchant = |id: &str| NewMerchant {
            id: id.to_string(),
            name: format!("Test Merchant {id}"),
            creation_date: created,
            is_active: true,
        };
        let fixture = SeedFixture {
            merchants: vec![merchant("merchant_1"), merchant("merchant_2")],
            candidates: vec![NewCandidate {
                merchant_id_1: "merchant_1".into(),
                merchant_name_1: "Test Merchant merchant_1".into(),
                creation_date_1: created,
                merchant_id_2: "merchant_2".into(),
                merchant_name_2: "Test Merchant merchant_2".into(),
                creation_date_2: created,
                cosine_distance: 0.85,
                is_processed: false,
            }],
        };
        let store = Arc::new(MemoryStore::new());
        seed_store(store.as_ref(), &fixture).await.unwrap();
        store
    }

    async fn body_json(resp: Response) -> Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn merge_request(keep: &str, discard: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/merge")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::json!({
                    "keep_merchant_id": keep,
                    "discard_merchant_id": discard,
                })
                .to_string(),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = app(AppState::new(Arc::new(MemoryStore::new())));
        let resp = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn pairs_lists_unprocessed_candidates() {
        let app = app(AppState::new(seeded_store().await));
        let resp = app.oneshot(get_request("/pairs")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        let pairs = body.as_array().unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0]["merchant_id_1"], "merchant_1");
        assert_eq!(pairs[0]["merchant_id_2"], "merchant_2");
        assert_eq!(pairs[0]["cosine_distance"], 0.85);
        assert_eq!(pairs[0]["is_processed"], false);
    }

    #[tokio::test]
    async fn merge_then_pairs_and_history_reflect_it() {
        let app = app(AppState::new(seeded_store().await));

        let resp = app
            .clone()
            .oneshot(merge_request("merchant_1", "merchant_2"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let outcome = body_json(resp).await;
        assert_eq!(outcome["success"], true);
        assert_eq!(outcome["message"], "Merchants merged successfully");
        assert_eq!(outcome["kept_merchant_id"], "merchant_1");
        assert_eq!(outcome["discarded_merchant_id"], "merchant_2");

        let pairs = body_json(app.clone().oneshot(get_request("/pairs")).await.unwrap()).await;
        assert!(pairs.as_array().unwrap().is_empty());

        let history = body_json(app.clone().oneshot(get_request("/history")).await.unwrap()).await;
        let history = history.as_array().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["discarded_merchant_id"], "merchant_2");
        assert!(history[0]["merged_by"].is_null());

        let merchant = body_json(
            app.oneshot(get_request("/merchants/merchant_2"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(merchant["is_active"], false);
    }

    #[tokio::test]
    async fn rejected_merge_still_answers_ok() {
        let app = app(AppState::new(seeded_store().await));
        let resp = app
            .oneshot(merge_request("merchant_1", "merchant_1"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let outcome = body_json(resp).await;
        assert_eq!(outcome["success"], false);
        assert_eq!(outcome["message"], "Cannot merge merchant with itself");
    }

    #[tokio::test]
    async fn pairs_storage_failure_is_a_server_error() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_point(Some(FailPoint::Reads)).await;
        let app = app(AppState::new(store));

        let resp = app.oneshot(get_request("/pairs")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_json(resp).await["error"].is_string());
    }

    #[tokio::test]
    async fn unknown_merchant_is_not_found() {
        let app = app(AppState::new(seeded_store().await));
        let resp = app.oneshot(get_request("/merchants/nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
