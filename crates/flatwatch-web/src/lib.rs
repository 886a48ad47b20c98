//! Axum JSON API over the offer reports.

use std::num::NonZeroU32;
use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{Local, NaiveDate};
use flatwatch_core::RecentStatsFilter;
use flatwatch_storage::{OfferStore, StoreError};
use flatwatch_sync::{open_store, SyncConfig};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "flatwatch-web";
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8050";

#[derive(Clone)]
pub struct AppState {
    pub store: OfferStore,
}

impl AppState {
    pub fn new(store: OfferStore) -> Self {
        Self { store }
    }
}

#[derive(Debug, Default, Deserialize)]
struct DayQuery {
    day: Option<NaiveDate>,
}

impl DayQuery {
    fn day_or_today(&self) -> NaiveDate {
        self.day.unwrap_or_else(|| Local::now().date_naive())
    }
}

#[derive(Debug, Default, Deserialize)]
struct RecentStatsQuery {
    renovation: Option<bool>,
    last_days: Option<NonZeroU32>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/discounts", get(discounts_handler))
        .route("/api/new-offers", get(new_offers_handler))
        .route("/api/daily-stats", get(daily_stats_handler))
        .route("/api/recent-stats", get(recent_stats_handler))
        .route("/api/delisted", get(delisted_handler))
        .with_state(Arc::new(state))
}

pub fn listen_addr_from_env() -> String {
    std::env::var("FLATWATCH_LISTEN_ADDR").unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string())
}

pub async fn serve(addr: &str, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "serving report api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env(addr: Option<String>) -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let store = open_store(&config).await?;
    let addr = addr.unwrap_or_else(listen_addr_from_env);
    serve(&addr, AppState::new(store)).await
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn discounts_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<DayQuery>, QueryRejection>,
) -> Response {
    let day = match query {
        Ok(Query(q)) => q.day_or_today(),
        Err(rejection) => return bad_request(rejection),
    };
    json_or_error(state.store.discounts(day).await)
}

async fn new_offers_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<DayQuery>, QueryRejection>,
) -> Response {
    let day = match query {
        Ok(Query(q)) => q.day_or_today(),
        Err(rejection) => return bad_request(rejection),
    };
    json_or_error(state.store.new_offers(day).await)
}

async fn daily_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    json_or_error(state.store.daily_stats().await)
}

async fn recent_stats_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<RecentStatsQuery>, QueryRejection>,
) -> Response {
    let filter = match query {
        Ok(Query(q)) => RecentStatsFilter {
            renovation: q.renovation,
            last_days: q.last_days,
        },
        Err(rejection) => return bad_request(rejection),
    };
    json_or_error(state.store.recent_stats(filter).await)
}

async fn delisted_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<DayQuery>, QueryRejection>,
) -> Response {
    let day = match query {
        Ok(Query(q)) => q.day_or_today(),
        Err(rejection) => return bad_request(rejection),
    };
    json_or_error(state.store.delisted(day).await)
}

fn json_or_error<T: Serialize>(result: Result<T, StoreError>) -> Response {
    match result {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

fn bad_request(rejection: QueryRejection) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: rejection.body_text(),
        }),
    )
        .into_response()
}

fn server_error(err: StoreError) -> Response {
    error!(error = %err, "report query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}
