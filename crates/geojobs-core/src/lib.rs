//! Canonical job record, coordinate normalization and best-effort coercions.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod query;

pub use query::{AreaLevel, JobFilters, QueryError, QueryParam, SpatialQuery};

pub const CRATE_NAME: &str = "geojobs-core";

pub const LON_MIN: f64 = -180.0;
pub const LON_MAX: f64 = 180.0;
pub const LAT_MIN: f64 = -90.0;
pub const LAT_MAX: f64 = 90.0;

/// SRID of every stored geometry (WGS 84).
pub const SRID: i32 = 4326;

/// Validated WGS 84 position. Only [`normalize_coordinates`] builds one from raw input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lon: f64,
    pub lat: f64,
}

impl GeoPoint {
    /// Great-circle distance in meters on the mean Earth sphere.
    pub fn haversine_m(&self, other: &GeoPoint) -> f64 {
        const EARTH_RADIUS_M: f64 = 6_371_008.8;
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.lon - self.lon).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
    }
}

/// Returns a point only when both axes are present, finite and in range.
///
/// A pair where either side is missing or invalid collapses to `None`; half a
/// coordinate is never kept.
pub fn normalize_coordinates(lon: Option<f64>, lat: Option<f64>) -> Option<GeoPoint> {
    let (lon, lat) = (lon?, lat?);
    if !lon.is_finite() || !lat.is_finite() {
        return None;
    }
    if !(LON_MIN..=LON_MAX).contains(&lon) || !(LAT_MIN..=LAT_MAX).contains(&lat) {
        return None;
    }
    Some(GeoPoint { lon, lat })
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoercionError {
    #[error("empty value")]
    Empty,
    #[error("not a finite number: {0:?}")]
    NotANumber(String),
    #[error("not a numeric identifier: {0:?}")]
    NotAnIdentifier(String),
    #[error("unrecognized timestamp: {0:?}")]
    NotATimestamp(String),
}

fn non_empty(text: &str) -> Result<&str, CoercionError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        Err(CoercionError::Empty)
    } else {
        Ok(trimmed)
    }
}

pub fn parse_f64(text: &str) -> Result<f64, CoercionError> {
    let trimmed = non_empty(text)?;
    match trimmed.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(CoercionError::NotANumber(trimmed.to_string())),
    }
}

/// Accepts plain digits, or a float rendering whose fraction is all zeros
/// (`"123.0"`), which is how tabular exports tend to write integer columns.
pub fn parse_job_id(text: &str) -> Result<i64, CoercionError> {
    let trimmed = non_empty(text)?;
    let invalid = || CoercionError::NotAnIdentifier(trimmed.to_string());
    let digits = match trimmed.split_once('.') {
        Some((whole, fraction)) if !fraction.is_empty() && fraction.bytes().all(|b| b == b'0') => {
            whole
        }
        Some(_) => return Err(invalid()),
        None => trimmed,
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    digits.parse::<i64>().map_err(|_| invalid())
}

const NAIVE_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Zoned inputs are converted to UTC; zoneless ones are taken as-is.
pub fn parse_timestamp(text: &str) -> Result<NaiveDateTime, CoercionError> {
    let trimmed = non_empty(text)?;
    if let Ok(zoned) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(zoned.naive_utc());
    }
    for format in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(ts);
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| CoercionError::NotATimestamp(trimmed.to_string()))
}

/// Canonical job shape every source is mapped into before persistence.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Job {
    pub job_id: i64,
    /// Row id of the tabular export the record came from, when it has one.
    pub source_id: Option<i64>,
    pub title: Option<String>,
    pub company: Option<String>,
    pub occupation: Option<String>,
    pub employment_type: Option<String>,
    pub work_time_extent: Option<String>,
    pub duration: Option<String>,
    pub positions: Option<i32>,
    pub municipality: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub street_address: Option<String>,
    pub postal_code: Option<String>,
    pub unspecified_workplace: bool,
    pub coordinates: Option<GeoPoint>,
    pub published_at: Option<NaiveDateTime>,
    pub last_application_at: Option<NaiveDateTime>,
    pub expiration_at: Option<NaiveDateTime>,
}

impl Job {
    pub fn new(job_id: i64) -> Self {
        Self {
            job_id,
            ..Default::default()
        }
    }

    pub fn lon(&self) -> Option<f64> {
        self.coordinates.map(|p| p.lon)
    }

    pub fn lat(&self) -> Option<f64> {
        self.coordinates.map(|p| p.lat)
    }

    /// Coordinates re-checked against the valid ranges; what writers persist.
    pub fn normalized_location(&self) -> Option<GeoPoint> {
        self.coordinates
            .and_then(|p| normalize_coordinates(Some(p.lon), Some(p.lat)))
    }
}

/// Row shape returned to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProjection {
    pub job_id: i64,
    pub title: Option<String>,
    pub company: Option<String>,
    pub occupation: Option<String>,
    pub municipality: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub published_at: Option<NaiveDateTime>,
    pub lat: f64,
    pub lon: f64,
}

impl JobProjection {
    /// `None` for jobs without a location; those never appear in query results.
    pub fn from_job(job: &Job) -> Option<Self> {
        let point = job.coordinates?;
        Some(Self {
            job_id: job.job_id,
            title: job.title.clone(),
            company: job.company.clone(),
            occupation: job.occupation.clone(),
            municipality: job.municipality.clone(),
            region: job.region.clone(),
            city: job.city.clone(),
            published_at: job.published_at,
            lat: point.lat,
            lon: point.lon,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobStats {
    pub total: i64,
    pub with_location: i64,
}

impl JobStats {
    pub fn coverage_percent(&self) -> i64 {
        if self.total == 0 {
            0
        } else {
            self.with_location * 100 / self.total
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaCount {
    pub area: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid SQL identifier {0:?}")]
pub struct InvalidIdentifier(pub String);

/// Schema-qualified table name. Identifiers cannot be bound as parameters, so
/// they are validated here and quoted when rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    schema: String,
    table: String,
}

impl TableRef {
    pub fn new(schema: &str, table: &str) -> Result<Self, InvalidIdentifier> {
        Ok(Self {
            schema: validate_identifier(schema)?,
            table: validate_identifier(table)?,
        })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Name for indexes derived from this table, e.g. `idx_jobs_location`.
    pub fn index_name(&self, suffix: &str) -> String {
        format!("idx_{}_{}", self.table, suffix)
    }
}

impl Default for TableRef {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            table: "jobs".to_string(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\".\"{}\"", self.schema, self.table)
    }
}

fn validate_identifier(name: &str) -> Result<String, InvalidIdentifier> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid_start && valid_rest && name.len() <= 63 {
        Ok(name.to_string())
    } else {
        Err(InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_pairs_pass_through_unchanged() {
        for (lon, lat) in [(18.0686, 59.3293), (-180.0, -90.0), (180.0, 90.0), (0.0, 0.0)] {
            assert_eq!(
                normalize_coordinates(Some(lon), Some(lat)),
                Some(GeoPoint { lon, lat })
            );
        }
    }

    #[test]
    fn any_invalid_axis_nulls_the_pair() {
        let cases = [
            (Some(180.5), Some(59.0)),
            (Some(18.0), Some(-90.01)),
            (Some(f64::NAN), Some(59.0)),
            (Some(18.0), Some(f64::INFINITY)),
            (None, Some(59.0)),
            (Some(18.0), None),
            (None, None),
        ];
        for (lon, lat) in cases {
            assert_eq!(normalize_coordinates(lon, lat), None, "{lon:?},{lat:?}");
        }
    }

    #[test]
    fn job_ids_accept_digits_and_zero_fractions_only() {
        assert_eq!(parse_job_id("28461234"), Ok(28461234));
        assert_eq!(parse_job_id(" 42 "), Ok(42));
        assert_eq!(parse_job_id("42.0"), Ok(42));
        assert_eq!(parse_job_id("42.00"), Ok(42));
        assert!(parse_job_id("42.5").is_err());
        assert!(parse_job_id("42.").is_err());
        assert!(parse_job_id("-42").is_err());
        assert!(parse_job_id("abc").is_err());
        assert_eq!(parse_job_id("   "), Err(CoercionError::Empty));
        assert!(parse_job_id("99999999999999999999").is_err());
    }

    #[test]
    fn numbers_must_be_finite() {
        assert_eq!(parse_f64("18.0686"), Ok(18.0686));
        assert!(parse_f64("NaN").is_err());
        assert!(parse_f64("inf").is_err());
        assert!(parse_f64("east").is_err());
    }

    #[test]
    fn timestamps_parse_best_effort() {
        let expected = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap();
        assert_eq!(parse_timestamp("2024-06-01T10:30:00"), Ok(expected));
        assert_eq!(parse_timestamp("2024-06-01 10:30:00"), Ok(expected));
        assert_eq!(parse_timestamp("2024-06-01T12:30:00+02:00"), Ok(expected));
        assert_eq!(parse_timestamp("2024-06-01T10:30:00Z"), Ok(expected));
        assert_eq!(
            parse_timestamp("2024-06-01"),
            Ok(expected.date().and_hms_opt(0, 0, 0).unwrap())
        );
        assert!(parse_timestamp("yesterday").is_err());
        assert_eq!(parse_timestamp(""), Err(CoercionError::Empty));
    }

    #[test]
    fn haversine_matches_one_degree_of_latitude() {
        let a = GeoPoint { lon: 18.0, lat: 59.0 };
        let b = GeoPoint { lon: 18.0, lat: 60.0 };
        let d = a.haversine_m(&b);
        assert!((d - 111_195.08).abs() < 1.0, "{d}");
    }

    #[test]
    fn table_ref_rejects_injection() {
        assert!(TableRef::new("public", "jobs").is_ok());
        assert!(TableRef::new("public", "jobs; DROP TABLE x").is_err());
        assert!(TableRef::new("1public", "jobs").is_err());
        assert_eq!(TableRef::default().to_string(), "\"public\".\"jobs\"");
    }

    #[test]
    fn coverage_handles_empty_table() {
        assert_eq!(JobStats::default().coverage_percent(), 0);
        let stats = JobStats {
            total: 3,
            with_location: 2,
        };
        assert_eq!(stats.coverage_percent(), 66);
    }
}
