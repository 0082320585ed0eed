//! Source adapters: per-source field tables feeding the canonical job mapper,
//! the tabular export reader and the remote job search API.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use csv::StringRecord;
use geojobs_core::{normalize_coordinates, parse_f64, parse_job_id, parse_timestamp, CoercionError, Job};
use geojobs_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "geojobs-adapters";

pub const DEFAULT_SEARCH_URL: &str = "https://platsbanken-api.arbetsformedlingen.se/jobs/v1/search";
pub const DEFAULT_DETAIL_URL: &str = "https://platsbanken-api.arbetsformedlingen.se/jobs/v1/job/{job_id}";

/// Required coordinate columns of the tabular export.
pub const CSV_LON: &str = "workplace_longitude";
pub const CSV_LAT: &str = "workplace_latitude";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected payload from {context}: {source}")]
    Payload {
        context: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("missing required column {0:?}")]
    MissingColumn(String),
    #[error("unusable job identifier {0:?}")]
    InvalidIdentifier(String),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("{0}")]
    Message(String),
}

/// Why a raw record could not become a canonical job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("record has no job identifier")]
    MissingJobId,
    #[error("record job identifier is unusable: {0}")]
    InvalidJobId(CoercionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSchema {
    ApiDetail,
    TabularExport,
}

impl SourceSchema {
    pub fn field_table(self) -> &'static FieldTable {
        match self {
            SourceSchema::ApiDetail => &API_DETAIL_FIELDS,
            SourceSchema::TabularExport => &TABULAR_FIELDS,
        }
    }
}

/// Source field name for each canonical field; `None` means the source never
/// carries it and the canonical value stays null.
#[derive(Debug, Clone, Copy)]
pub struct FieldTable {
    pub job_id: &'static str,
    pub source_id: Option<&'static str>,
    pub title: Option<&'static str>,
    pub company: Option<&'static str>,
    pub occupation: Option<&'static str>,
    pub employment_type: Option<&'static str>,
    pub work_time_extent: Option<&'static str>,
    pub duration: Option<&'static str>,
    pub positions: Option<&'static str>,
    pub municipality: Option<&'static str>,
    pub region: Option<&'static str>,
    pub city: Option<&'static str>,
    /// Used as the city only when the workplace is flagged unspecified.
    pub workplace_name: Option<&'static str>,
    pub street_address: Option<&'static str>,
    pub postal_code: Option<&'static str>,
    pub unspecified_workplace: Option<&'static str>,
    pub published_at: Option<&'static str>,
    pub last_application_at: Option<&'static str>,
    pub expiration_at: Option<&'static str>,
    pub lon: &'static str,
    pub lat: &'static str,
}

/// JSON pointers into the detail payload.
pub const API_DETAIL_FIELDS: FieldTable = FieldTable {
    job_id: "/id",
    source_id: None,
    title: Some("/title"),
    company: Some("/company/name"),
    occupation: Some("/occupation"),
    employment_type: Some("/employmentType"),
    work_time_extent: Some("/workTimeExtent"),
    duration: Some("/duration"),
    positions: Some("/positions"),
    municipality: Some("/workplace/municipality"),
    region: Some("/workplace/region"),
    city: Some("/workplace/city"),
    workplace_name: Some("/workplace/name"),
    street_address: Some("/workplace/street"),
    postal_code: Some("/workplace/postCode"),
    unspecified_workplace: Some("/workplace/unspecifiedWorkplace"),
    published_at: Some("/publishedDate"),
    last_application_at: Some("/lastApplicationDate"),
    expiration_at: Some("/expirationDate"),
    lon: "/workplace/longitude",
    lat: "/workplace/latitude",
};

/// Column headers of the tabular export.
pub const TABULAR_FIELDS: FieldTable = FieldTable {
    job_id: "job_id",
    source_id: Some("id"),
    title: Some("title"),
    company: Some("company_name"),
    occupation: Some("occupation"),
    employment_type: Some("employment_type"),
    work_time_extent: None,
    duration: None,
    positions: None,
    municipality: Some("workplace_municipality"),
    region: Some("workplace_region"),
    city: Some("workplace_city"),
    workplace_name: None,
    street_address: Some("workplace_street"),
    postal_code: Some("workplace_post_code"),
    unspecified_workplace: None,
    published_at: Some("published_date"),
    last_application_at: Some("last_application_date"),
    expiration_at: Some("expiration_date"),
    lon: CSV_LON,
    lat: CSV_LAT,
};

/// Field access over one raw source record. Blank text reads as absent.
pub trait RawRecord {
    fn text(&self, field: &str) -> Option<String>;

    fn number(&self, field: &str) -> Option<f64> {
        self.text(field).and_then(|t| parse_f64(&t).ok())
    }

    fn flag(&self, field: &str) -> Option<bool> {
        let text = self.text(field)?.to_ascii_lowercase();
        match text.as_str() {
            "true" | "t" | "1" | "yes" => Some(true),
            "false" | "f" | "0" | "no" => Some(false),
            _ => None,
        }
    }
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl RawRecord for JsonValue {
    fn text(&self, field: &str) -> Option<String> {
        match self.pointer(field)? {
            JsonValue::String(s) => text_or_none(s),
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    fn number(&self, field: &str) -> Option<f64> {
        match self.pointer(field)? {
            JsonValue::Number(n) => n.as_f64().filter(|v| v.is_finite()),
            JsonValue::String(s) => parse_f64(s).ok(),
            _ => None,
        }
    }

    fn flag(&self, field: &str) -> Option<bool> {
        match self.pointer(field)? {
            JsonValue::Bool(b) => Some(*b),
            JsonValue::Null => None,
            _ => self.text(field).and_then(|t| match t.to_ascii_lowercase().as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            }),
        }
    }
}

/// One data row of a [`TabularExport`].
#[derive(Debug, Clone, Copy)]
pub struct CsvRow<'a> {
    headers: &'a HashMap<String, usize>,
    record: &'a StringRecord,
}

impl RawRecord for CsvRow<'_> {
    fn text(&self, field: &str) -> Option<String> {
        let idx = *self.headers.get(field)?;
        self.record.get(idx).and_then(text_or_none)
    }
}

fn whole_number(value: f64) -> Option<i32> {
    (value.fract() == 0.0 && value >= f64::from(i32::MIN) && value <= f64::from(i32::MAX))
        .then_some(value as i32)
}

/// Maps one raw record into the canonical job.
///
/// Only an unusable identifier rejects the record. Every other field degrades
/// to null: bad coordinates null both axes, unparseable timestamps null the
/// timestamp.
pub fn map_record<R: RawRecord + ?Sized>(raw: &R, schema: SourceSchema) -> Result<Job, MapError> {
    let table = schema.field_table();
    let text = |field: Option<&str>| field.and_then(|f| raw.text(f));
    let timestamp = |field: Option<&str>| text(field).and_then(|t| parse_timestamp(&t).ok());

    let job_id = raw
        .text(table.job_id)
        .ok_or(MapError::MissingJobId)
        .and_then(|t| parse_job_id(&t).map_err(MapError::InvalidJobId))?;

    let unspecified_workplace = table
        .unspecified_workplace
        .and_then(|f| raw.flag(f))
        .unwrap_or(false);
    let city = text(table.city).or_else(|| {
        if unspecified_workplace {
            text(table.workplace_name)
        } else {
            None
        }
    });

    Ok(Job {
        job_id,
        source_id: text(table.source_id).and_then(|t| parse_job_id(&t).ok()),
        title: text(table.title),
        company: text(table.company),
        occupation: text(table.occupation),
        employment_type: text(table.employment_type),
        work_time_extent: text(table.work_time_extent),
        duration: text(table.duration),
        positions: table
            .positions
            .and_then(|f| raw.number(f))
            .and_then(whole_number),
        municipality: text(table.municipality),
        region: text(table.region),
        city,
        street_address: text(table.street_address),
        postal_code: text(table.postal_code),
        unspecified_workplace,
        coordinates: normalize_coordinates(raw.number(table.lon), raw.number(table.lat)),
        published_at: timestamp(table.published_at),
        last_application_at: timestamp(table.last_application_at),
        expiration_at: timestamp(table.expiration_at),
    })
}

/// A delimited export loaded in full, headers indexed by name.
#[derive(Debug, Clone)]
pub struct TabularExport {
    headers: HashMap<String, usize>,
    records: Vec<StringRecord>,
}

impl TabularExport {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, AdapterError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let headers: HashMap<String, usize> = reader
            .headers()?
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.trim().to_string(), idx))
            .collect();
        for required in [CSV_LON, CSV_LAT] {
            if !headers.contains_key(required) {
                return Err(AdapterError::MissingColumn(required.to_string()));
            }
        }

        let records = reader.records().collect::<Result<Vec<_>, _>>()?;
        Ok(Self { headers, records })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
        Self::from_reader(file).with_context(|| format!("reading {}", path.display()))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = CsvRow<'_>> {
        self.records.iter().map(move |record| CsvRow {
            headers: &self.headers,
            record,
        })
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => text_or_none(&s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobSummary {
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchPage {
    #[serde(default)]
    pub ads: Vec<JobSummary>,
}

/// Search payload with the pagination keys rewritten per page.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchTemplate {
    base: JsonMap<String, JsonValue>,
}

impl SearchTemplate {
    pub fn for_occupation_field(occupation_field: Option<&str>) -> Self {
        let filters: Vec<JsonValue> = occupation_field
            .map(|value| json!({"type": "occupationField", "value": value}))
            .into_iter()
            .collect();
        let mut base = JsonMap::new();
        base.insert("filters".to_string(), JsonValue::Array(filters));
        base.insert("fromDate".to_string(), JsonValue::Null);
        base.insert("order".to_string(), json!("relevance"));
        base.insert("maxRecords".to_string(), json!(25));
        base.insert("startIndex".to_string(), json!(0));
        base.insert("toDate".to_string(), JsonValue::Null);
        base.insert("source".to_string(), json!("pb"));
        Self { base }
    }

    pub fn from_json(value: JsonValue) -> Result<Self, AdapterError> {
        match value {
            JsonValue::Object(base) => Ok(Self { base }),
            other => Err(AdapterError::Message(format!(
                "search payload must be a JSON object, got {other}"
            ))),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let value: JsonValue =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Self::from_json(value).with_context(|| format!("loading {}", path.display()))
    }

    pub fn page(&self, start_index: u32, max_records: u32) -> JsonValue {
        let mut payload = self.base.clone();
        payload.insert("startIndex".to_string(), json!(start_index));
        payload.insert("maxRecords".to_string(), json!(max_records));
        JsonValue::Object(payload)
    }
}

/// Remote job listing: a paginated search plus a per-job detail lookup.
#[async_trait]
pub trait JobApi: Send + Sync {
    async fn search(&self, payload: &JsonValue) -> Result<SearchPage, AdapterError>;

    /// `Ok(None)` when the listing referenced a job that no longer exists.
    async fn fetch_detail(&self, job_id: &str) -> Result<Option<JsonValue>, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct PlatsbankenApi {
    http: HttpFetcher,
    search_url: String,
    detail_url: String,
}

impl PlatsbankenApi {
    /// `detail_url` must contain a `{job_id}` placeholder.
    pub fn new(http: HttpFetcher, search_url: impl Into<String>, detail_url: impl Into<String>) -> Self {
        Self {
            http,
            search_url: search_url.into(),
            detail_url: detail_url.into(),
        }
    }

    pub fn detail_url_for(&self, job_id: &str) -> Result<String, AdapterError> {
        let valid = !job_id.is_empty()
            && job_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(AdapterError::InvalidIdentifier(job_id.to_string()));
        }
        Ok(self.detail_url.replace("{job_id}", job_id))
    }
}

#[async_trait]
impl JobApi for PlatsbankenApi {
    async fn search(&self, payload: &JsonValue) -> Result<SearchPage, AdapterError> {
        let body = self.http.post_json(&self.search_url, payload).await?;
        serde_json::from_value(body).map_err(|source| AdapterError::Payload {
            context: self.search_url.clone(),
            source,
        })
    }

    async fn fetch_detail(&self, job_id: &str) -> Result<Option<JsonValue>, AdapterError> {
        let url = self.detail_url_for(job_id)?;
        match self.http.get_json(&url).await {
            Ok(JsonValue::Object(detail)) => Ok(Some(JsonValue::Object(detail))),
            Ok(other) => Err(AdapterError::Message(format!(
                "detail for {job_id} is not a JSON object: {other}"
            ))),
            Err(err) if err.is_not_found() => {
                debug!(job_id, "detail no longer published");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}
