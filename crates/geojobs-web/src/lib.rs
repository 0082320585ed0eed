//! Axum + Askama front for the persisted job table: KPI page plus the JSON
//! endpoints the map layer consumes.

use std::net::SocketAddr;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use geojobs_core::query::DEFAULT_LIMIT;
use geojobs_core::{normalize_coordinates, AreaCount, AreaLevel, JobFilters};
use geojobs_storage::{JobReader, StoreError};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "geojobs-web";

/// Upper bound on rows a single `/api/jobs` call returns.
pub const MAX_LIMIT: u32 = 5000;
pub const DEFAULT_AREA_LIMIT: u32 = 200;

#[derive(Clone)]
pub struct AppState {
    pub reader: Arc<dyn JobReader>,
    pub table_label: String,
}

impl AppState {
    pub fn new(reader: Arc<dyn JobReader>, table_label: impl Into<String>) -> Self {
        Self {
            reader,
            table_label: table_label.into(),
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    table: String,
    total: i64,
    with_location: i64,
    coverage_percent: i64,
    areas: Vec<AreaCount>,
}

/// Query-string form of [`JobFilters`]. Values arrive as text so blank
/// parameters read as unset instead of failing to parse.
#[derive(Debug, Deserialize, Default)]
struct JobsQuery {
    keyword: Option<String>,
    areas: Option<String>,
    area_level: Option<String>,
    lat: Option<String>,
    lon: Option<String>,
    radius_km: Option<String>,
    limit: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct AreasQuery {
    level: Option<String>,
    limit: Option<u32>,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn parse_param<T: std::str::FromStr>(name: &str, value: &Option<String>) -> Result<Option<T>, String> {
    present(value)
        .map(|v| v.parse::<T>().map_err(|_| format!("invalid {name}: {v:?}")))
        .transpose()
}

fn parse_area_level(value: &Option<String>) -> Result<AreaLevel, String> {
    match present(value) {
        None | Some("municipality") => Ok(AreaLevel::Municipality),
        Some("region") => Ok(AreaLevel::Region),
        Some(other) => Err(format!("invalid area_level: {other:?}")),
    }
}

impl JobsQuery {
    fn into_filters(self) -> Result<JobFilters, String> {
        let center = match (
            parse_param::<f64>("lat", &self.lat)?,
            parse_param::<f64>("lon", &self.lon)?,
        ) {
            (None, None) => None,
            (Some(lat), Some(lon)) => Some(
                normalize_coordinates(Some(lon), Some(lat))
                    .ok_or_else(|| format!("center out of range: lat={lat} lon={lon}"))?,
            ),
            _ => return Err("lat and lon must be given together".to_string()),
        };
        let limit = parse_param::<u32>("limit", &self.limit)?
            .unwrap_or(DEFAULT_LIMIT)
            .min(MAX_LIMIT);
        Ok(JobFilters {
            keyword: present(&self.keyword).map(str::to_string),
            areas: present(&self.areas)
                .map(|a| a.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
            area_level: parse_area_level(&self.area_level)?,
            center,
            radius_km: parse_param::<f64>("radius_km", &self.radius_km)?,
            limit,
        })
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/jobs", get(jobs_handler))
        .route("/api/areas", get(areas_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "serving job explorer");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let stats = match state.reader.stats().await {
        Ok(stats) => stats,
        Err(err) => return store_error(err),
    };
    let areas = match state
        .reader
        .top_areas(AreaLevel::Municipality, DEFAULT_AREA_LIMIT)
        .await
    {
        Ok(areas) => areas,
        Err(err) => return store_error(err),
    };
    render_html(IndexTemplate {
        table: state.table_label.clone(),
        total: stats.total,
        with_location: stats.with_location,
        coverage_percent: stats.coverage_percent(),
        areas,
    })
}

async fn jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> Response {
    let filters = match query.into_filters() {
        Ok(filters) => filters,
        Err(message) => return bad_request(message),
    };
    match state.reader.query(&filters).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => store_error(err),
    }
}

async fn areas_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AreasQuery>,
) -> Response {
    let level = match parse_area_level(&query.level) {
        Ok(level) => level,
        Err(message) => return bad_request(message),
    };
    let limit = query.limit.unwrap_or(DEFAULT_AREA_LIMIT).min(MAX_LIMIT);
    match state.reader.top_areas(level, limit).await {
        Ok(areas) => Json(areas).into_response(),
        Err(err) => store_error(err),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, message).into_response()
}

fn store_error(err: StoreError) -> Response {
    match err {
        StoreError::InvalidQuery(err) => bad_request(err.to_string()),
        other => server_error(other.into()),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
