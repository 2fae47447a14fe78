//! Read-only JSON API over the archives.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use proptx_core::{ArchiveRecord, SearchTransactionRow, SummaryRow};
use proptx_storage::read_archive_page;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "proptx-web";

pub const DEFAULT_PAGE_LIMIT: usize = 100;

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    pub transaction_archive: PathBuf,
    pub summary_archive: PathBuf,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = lookup("PROPTX_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                lookup("PROPTX_WORKSPACE")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("data")
            });
        Self {
            host: lookup("PROPTX_WEB_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: lookup("PROPTX_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            transaction_archive: lookup("PROPTX_TRANSACTION_ARCHIVE")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("total_transactions.csv")),
            summary_archive: lookup("PROPTX_SUMMARY_ARCHIVE")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("transaction_summary.csv")),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub transaction_archive: PathBuf,
    pub summary_archive: PathBuf,
}

impl AppState {
    pub fn from_config(config: &WebConfig) -> Self {
        Self {
            transaction_archive: config.transaction_archive.clone(),
            summary_archive: config.summary_archive.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    DEFAULT_PAGE_LIMIT
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health_handler))
        .route("/api/v1/data/transaction", get(transaction_handler))
        .route("/api/v1/data/summary", get(summary_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: WebConfig) -> anyhow::Result<()> {
    let state = AppState::from_config(&config);
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr: SocketAddr = listener.local_addr()?;
    info!(%addr, archive = %config.transaction_archive.display(), "serving archive api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(WebConfig::from_env()).await
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn transaction_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Response {
    archive_page::<SearchTransactionRow>(state.transaction_archive.clone(), query).await
}

async fn summary_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Response {
    archive_page::<SummaryRow>(state.summary_archive.clone(), query).await
}

async fn archive_page<T: ArchiveRecord>(path: PathBuf, query: PageQuery) -> Response {
    let read = tokio::task::spawn_blocking(move || {
        read_archive_page::<T>(&path, query.offset, query.limit)
    })
    .await;
    match read {
        Ok(Ok(rows)) => Json(rows).into_response(),
        Ok(Err(err)) => server_error(err.into()),
        Err(err) => server_error(err.into()),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "archive read failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use proptx_core::{last_day_of_month, SaleType};
    use proptx_storage::merge_into_archive;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    fn tx_row(i: usize) -> SearchTransactionRow {
        let price = 1_000_000.0 + i as f64;
        let area_sqft = 1000.0;
        let area_sqm = area_sqft / proptx_core::SQFT_PER_SQM_SEARCH;
        SearchTransactionRow {
            project_name: format!("PROJECT {i}"),
            street_name: "ORCHARD ROAD".to_string(),
            property_type: "Condominium".to_string(),
            postal_district: 9,
            market_segment: "CCR".to_string(),
            tenure: "Freehold".to_string(),
            type_of_sale: SaleType::Resale,
            num_units: 1,
            price,
            nett_price: None,
            area_sqft,
            type_of_area: "Strata".to_string(),
            floor: "06 to 10".to_string(),
            unit_price_psf: price / area_sqft,
            reference_period: last_day_of_month(2020, 1).unwrap(),
            area_sqm,
            unit_price_psm: price / area_sqm,
        }
    }

    fn state_in(dir: &Path) -> AppState {
        AppState {
            transaction_archive: dir.join("total_transactions.csv"),
            summary_archive: dir.join("transaction_summary.csv"),
        }
    }

    fn seeded(rows: usize) -> (TempDir, AppState) {
        let dir = tempdir().expect("tempdir");
        let state = state_in(dir.path());
        let batch = (0..rows).map(tx_row).collect::<Vec<_>>();
        merge_into_archive(&state.transaction_archive, &batch).unwrap();
        (dir, state)
    }

    async fn get_json(state: AppState, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app(state)
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let dir = tempdir().expect("tempdir");
        let (status, body) = get_json(state_in(dir.path()), "/api/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn transaction_pages_follow_offset_and_limit() {
        let (_dir, state) = seeded(250);

        let (status, first) = get_json(state.clone(), "/api/v1/data/transaction").await;
        assert_eq!(status, StatusCode::OK);
        let first = first.as_array().unwrap();
        assert_eq!(first.len(), 100);
        assert_eq!(first[0]["id"], 0);
        assert_eq!(first[99]["id"], 99);

        let (_, tail) = get_json(state.clone(), "/api/v1/data/transaction?limit=100&offset=200").await;
        let tail = tail.as_array().unwrap();
        assert_eq!(tail.len(), 50);
        assert_eq!(tail[0]["id"], 200);
        assert_eq!(tail[49]["id"], 249);

        let (_, past_end) = get_json(state, "/api/v1/data/transaction?offset=300").await;
        assert_eq!(past_end.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn rows_are_typed_in_json() {
        let (_dir, state) = seeded(1);
        let (_, rows) = get_json(state, "/api/v1/data/transaction?limit=1").await;
        let row = &rows[0];
        assert_eq!(row["project_name"], "PROJECT 0");
        assert_eq!(row["postal_district"], 9);
        assert_eq!(row["type_of_sale"], "Resale");
        assert_eq!(row["reference_period"], "2020-01-31");
        assert!(row["nett_price"].is_null());
        assert_eq!(row["price"], 1_000_000.0);
    }

    #[tokio::test]
    async fn missing_archive_is_an_empty_page() {
        let dir = tempdir().expect("tempdir");
        let (status, body) = get_json(state_in(dir.path()), "/api/v1/data/summary").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn corrupt_archive_is_a_server_error() {
        let dir = tempdir().expect("tempdir");
        let state = state_in(dir.path());
        std::fs::write(&state.summary_archive, "name,value\na,1\n").unwrap();
        let (status, body) = get_json(state, "/api/v1/data/summary").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("corrupt archive"));
    }

    #[tokio::test]
    async fn non_numeric_paging_is_a_bad_request() {
        let (_dir, state) = seeded(1);
        let resp = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/v1/data/transaction?limit=abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn config_derives_archive_paths_from_data_dir() {
        let config = WebConfig::from_lookup(|key| match key {
            "PROPTX_DATA_DIR" => Some("/var/lib/proptx".to_string()),
            "PROPTX_WEB_PORT" => Some("9100".to_string()),
            _ => None,
        });
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9100);
        assert_eq!(config.transaction_archive, PathBuf::from("/var/lib/proptx/total_transactions.csv"));
        assert_eq!(config.summary_archive, PathBuf::from("/var/lib/proptx/transaction_summary.csv"));
    }
}
