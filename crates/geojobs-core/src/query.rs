//! Read-side filters and the spatial query builder.
//!
//! Filters are collected into typed predicates first and only serialized at the
//! end, so every user-supplied value leaves as a bound parameter.

use std::cmp::Reverse;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{GeoPoint, Job, JobProjection, TableRef, SRID};

pub const DEFAULT_LIMIT: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("limit must be a positive integer")]
    ZeroLimit,
}

/// Administrative level that area names are matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AreaLevel {
    #[default]
    Municipality,
    Region,
}

impl AreaLevel {
    pub fn column(self) -> &'static str {
        match self {
            AreaLevel::Municipality => "municipality",
            AreaLevel::Region => "region",
        }
    }

    fn value_of(self, job: &Job) -> Option<&str> {
        match self {
            AreaLevel::Municipality => job.municipality.as_deref(),
            AreaLevel::Region => job.region.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobFilters {
    pub keyword: Option<String>,
    pub areas: Vec<String>,
    pub area_level: AreaLevel,
    pub center: Option<GeoPoint>,
    pub radius_km: Option<f64>,
    pub limit: u32,
}

impl Default for JobFilters {
    fn default() -> Self {
        Self {
            keyword: None,
            areas: Vec::new(),
            area_level: AreaLevel::default(),
            center: None,
            radius_km: None,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl JobFilters {
    fn keyword_term(&self) -> Option<&str> {
        self.keyword
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    fn area_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for area in &self.areas {
            let area = area.trim();
            if !area.is_empty() && !names.iter().any(|n| n == area) {
                names.push(area.to_string());
            }
        }
        names
    }

    /// Center plus radius in meters; either half alone is ignored.
    fn radius_m(&self) -> Option<(GeoPoint, f64)> {
        let center = self.center?;
        let km = self.radius_km.filter(|r| r.is_finite() && *r > 0.0)?;
        Some((center, km * 1000.0))
    }

    /// In-process evaluation of the same predicates the SQL builder emits.
    pub fn matches(&self, job: &Job) -> bool {
        let Some(point) = job.coordinates else {
            return false;
        };
        if let Some(term) = self.keyword_term() {
            let needle = term.to_lowercase();
            let hit = [&job.title, &job.occupation, &job.company]
                .into_iter()
                .flatten()
                .any(|field| field.to_lowercase().contains(&needle));
            if !hit {
                return false;
            }
        }
        let areas = self.area_names();
        if !areas.is_empty() {
            match self.area_level.value_of(job) {
                Some(value) if areas.iter().any(|a| a == value) => {}
                _ => return false,
            }
        }
        if let Some((center, meters)) = self.radius_m() {
            if center.haversine_m(&point) > meters {
                return false;
            }
        }
        true
    }

    /// Filters, orders by recency (unknown dates last) and truncates.
    pub fn apply<'a>(&self, jobs: impl IntoIterator<Item = &'a Job>) -> Vec<JobProjection> {
        let mut hits: Vec<&Job> = jobs.into_iter().filter(|job| self.matches(job)).collect();
        hits.sort_by_key(|job| {
            (
                job.published_at.is_none(),
                Reverse(job.published_at),
                Reverse(job.job_id),
            )
        });
        hits.into_iter()
            .take(self.limit as usize)
            .filter_map(JobProjection::from_job)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    Text(String),
    TextList(Vec<String>),
    Float(f64),
    Int(i64),
}

#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    HasLocation,
    Keyword { pattern: String },
    AreaIn { level: AreaLevel, names: Vec<String> },
    WithinDistance { center: GeoPoint, meters: f64 },
}

/// Accumulates SQL text and numbers placeholders as parameters are pushed.
#[derive(Default)]
struct SqlWriter {
    sql: String,
    params: Vec<QueryParam>,
}

impl SqlWriter {
    fn push(&mut self, text: &str) {
        self.sql.push_str(text);
    }

    fn bind(&mut self, param: QueryParam) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }

    fn predicate(&mut self, predicate: &Predicate) {
        match predicate {
            Predicate::HasLocation => self.push("location IS NOT NULL"),
            Predicate::Keyword { pattern } => {
                let p = self.bind(QueryParam::Text(pattern.clone()));
                let clause = ["title", "occupation", "company"]
                    .iter()
                    .map(|col| format!(r"{col} ILIKE {p} ESCAPE '\'"))
                    .collect::<Vec<_>>()
                    .join(" OR ");
                self.push(&format!("({clause})"));
            }
            Predicate::AreaIn { level, names } => {
                let p = self.bind(QueryParam::TextList(names.clone()));
                self.push(&format!("{} = ANY({p})", level.column()));
            }
            Predicate::WithinDistance { center, meters } => {
                let lon = self.bind(QueryParam::Float(center.lon));
                let lat = self.bind(QueryParam::Float(center.lat));
                let m = self.bind(QueryParam::Float(*meters));
                self.push(&format!(
                    "ST_DWithin(location::geography, ST_SetSRID(ST_MakePoint({lon}, {lat}), {SRID})::geography, {m})"
                ));
            }
        }
    }
}

fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len() + 2);
    out.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

/// Parameterized job search against the persisted table.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialQuery {
    table: TableRef,
    predicates: Vec<Predicate>,
    limit: i64,
}

impl SpatialQuery {
    pub fn build(table: &TableRef, filters: &JobFilters) -> Result<Self, QueryError> {
        if filters.limit == 0 {
            return Err(QueryError::ZeroLimit);
        }
        let mut predicates = vec![Predicate::HasLocation];
        if let Some(term) = filters.keyword_term() {
            predicates.push(Predicate::Keyword {
                pattern: escape_like(term),
            });
        }
        let names = filters.area_names();
        if !names.is_empty() {
            predicates.push(Predicate::AreaIn {
                level: filters.area_level,
                names,
            });
        }
        if let Some((center, meters)) = filters.radius_m() {
            predicates.push(Predicate::WithinDistance { center, meters });
        }
        Ok(Self {
            table: table.clone(),
            predicates,
            limit: i64::from(filters.limit),
        })
    }

    pub fn predicate_count(&self) -> usize {
        self.predicates.len()
    }

    fn write_predicates(&self, w: &mut SqlWriter) {
        for (i, predicate) in self.predicates.iter().enumerate() {
            if i > 0 {
                w.push(" AND ");
            }
            w.predicate(predicate);
        }
    }

    /// Just the conjunctive `WHERE` body and its parameters.
    pub fn predicate_sql(&self) -> (String, Vec<QueryParam>) {
        let mut w = SqlWriter::default();
        self.write_predicates(&mut w);
        (w.sql, w.params)
    }

    pub fn to_sql(&self) -> (String, Vec<QueryParam>) {
        let mut w = SqlWriter::default();
        w.push(&format!(
            "SELECT job_id, title, company, occupation, municipality, region, city, published_at, \
             ST_Y(location) AS lat, ST_X(location) AS lon FROM {} WHERE ",
            self.table
        ));
        self.write_predicates(&mut w);
        w.push(" ORDER BY published_at DESC NULLS LAST, job_id DESC LIMIT ");
        let limit = w.bind(QueryParam::Int(self.limit));
        w.push(&limit);
        (w.sql, w.params)
    }
}
