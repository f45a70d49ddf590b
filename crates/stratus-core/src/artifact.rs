//! Artifact schema
//!
//! Artifacts are a closed tagged union. Every variant carries
//! `schemaVersion` and a `type` discriminator on the wire; optional fields
//! are absent when unset, never null. Identity is the BLAKE3 hash of the
//! canonical msgpack bytes, so records are validated both before packaging
//! and after unpackaging.

use crate::envelope;
use crate::error::{Error, Result};
use crate::hash::Hash32;
use crate::location::format_coord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Current artifact record schema version.
pub const ARTIFACT_SCHEMA_VERSION: u16 = 1;

/// Well-known canonical variable names. Used to catch variable maps built
/// in the wrong direction; the full canonical namespace is open (any name
/// matching [`is_canonical_variable_name`]).
pub const KNOWN_CANONICAL_VARIABLES: &[&str] = &[
    "temperature_2m",
    "relative_humidity_2m",
    "dew_point_2m",
    "wind_speed_10m",
    "wind_gust_10m",
    "wind_direction_10m",
    "pressure_msl",
    "precipitation",
    "snowfall",
    "cloud_cover",
    "visibility",
    "uv_index",
];

/// True if `name` follows the canonical variable grammar: lowercase
/// snake_case, starting with a letter.
pub fn is_canonical_variable_name(name: &str) -> bool {
    let mut bytes = name.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_lowercase() => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

/// Artifact type discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Forecast,
    Observation,
    StationSet,
    Metadata,
    Retraction,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Forecast => "forecast",
            Self::Observation => "observation",
            Self::StationSet => "station_set",
            Self::Metadata => "metadata",
            Self::Retraction => "retraction",
        };
        f.write_str(s)
    }
}

/// Forecast grid: a single point or a bounding box.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Grid {
    #[serde(rename_all = "camelCase")]
    Point { lat: f64, lon: f64 },
    #[serde(rename_all = "camelCase")]
    Bbox {
        min_lat: f64,
        min_lon: f64,
        max_lat: f64,
        max_lon: f64,
    },
}

impl Grid {
    /// Compact key used by the forecast index and grid pins.
    pub fn key(&self) -> String {
        match self {
            Self::Point { lat, lon } => {
                format!("pt:{},{}", format_coord(*lat, 4), format_coord(*lon, 4))
            }
            Self::Bbox {
                min_lat,
                min_lon,
                max_lat,
                max_lon,
            } => format!(
                "bb:{},{},{},{}",
                format_coord(*min_lat, 4),
                format_coord(*min_lon, 4),
                format_coord(*max_lat, 4),
                format_coord(*max_lon, 4)
            ),
        }
    }

    fn validate(&self) -> Result<()> {
        let coords: Vec<f64> = match self {
            Self::Point { lat, lon } => vec![*lat, *lon],
            Self::Bbox {
                min_lat,
                min_lon,
                max_lat,
                max_lon,
            } => vec![*min_lat, *min_lon, *max_lat, *max_lon],
        };
        if coords.iter().any(|c| !c.is_finite()) {
            return Err(Error::InvalidInput("non-finite grid coordinate".into()));
        }
        Ok(())
    }
}

/// Model forecast for one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Forecast {
    pub schema_version: u16,
    pub model: String,
    /// ISO-8601 UTC instant of the model run.
    pub run_time: String,
    /// Epoch seconds when the forecast was issued upstream.
    pub issued_at: i64,
    pub valid_times: Vec<String>,
    pub variables: Vec<String>,
    pub grid: Grid,
    /// Per-variable series aligned to `valid_times`.
    pub data: BTreeMap<String, Vec<f64>>,
    /// Source variable name -> canonical variable name.
    pub variable_map: BTreeMap<String, String>,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

impl Forecast {
    pub fn validate(&self) -> Result<()> {
        self.grid.validate()?;
        for (var, series) in &self.data {
            if series.len() != self.valid_times.len() {
                return Err(Error::InvalidInput(format!(
                    "series {var} has {} values for {} valid times",
                    series.len(),
                    self.valid_times.len()
                )));
            }
            if series.iter().any(|v| !v.is_finite()) {
                return Err(Error::InvalidInput(format!(
                    "series {var} contains a non-finite value"
                )));
            }
            if !self.variable_map.contains_key(var) {
                return Err(Error::InvalidInput(format!(
                    "data key {var} missing from variableMap"
                )));
            }
        }
        // The map runs source -> canonical. A key that is itself a
        // well-known canonical name mapped to something that is not means
        // someone built it backwards.
        for (source_key, canonical_key) in &self.variable_map {
            if KNOWN_CANONICAL_VARIABLES.contains(&source_key.as_str())
                && !KNOWN_CANONICAL_VARIABLES.contains(&canonical_key.as_str())
            {
                return Err(Error::InvalidInput(format!(
                    "variableMap looks inverted: {source_key} -> {canonical_key}"
                )));
            }
        }
        Ok(())
    }
}

/// Station observations for one time bucket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub schema_version: u16,
    pub source: String,
    /// ISO UTC instant floored to `bucket_minutes`.
    pub observed_at_bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at_raw: Option<String>,
    pub bucket_minutes: u32,
    pub fetched_at: i64,
    /// Hash of the StationSet the station ids resolve through.
    pub station_set_id: Hash32,
    /// Canonical variable keys present in `data`.
    pub variables: Vec<String>,
    /// canonical variable -> station id -> reading (null = missing).
    pub data: BTreeMap<String, BTreeMap<String, Option<f64>>>,
}

impl Observation {
    pub fn validate(&self) -> Result<()> {
        if self.bucket_minutes == 0 {
            return Err(Error::InvalidInput("bucketMinutes must be positive".into()));
        }
        let floored = floor_observation_bucket(&self.observed_at_bucket, self.bucket_minutes)?;
        if floored != self.observed_at_bucket {
            return Err(Error::InvalidInput(format!(
                "observedAtBucket {} is not floored to {} minutes",
                self.observed_at_bucket, self.bucket_minutes
            )));
        }
        for var in self.variables.iter().chain(self.data.keys()) {
            if !is_canonical_variable_name(var) {
                return Err(Error::InvalidInput(format!(
                    "observation variable {var} is not canonical"
                )));
            }
        }
        for stations in self.data.values() {
            for reading in stations.values().flatten() {
                if !reading.is_finite() {
                    return Err(Error::InvalidInput(
                        "observation reading is non-finite".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// One physical station.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Station {
    pub id: String,
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wmo_id: Option<String>,
}

/// A stable set of stations referenced by observations.
///
/// Deliberately carries no timestamp of any kind: the same logical set must
/// hash identically no matter when it was assembled.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationSet {
    pub schema_version: u16,
    pub source: String,
    pub stations: Vec<Station>,
}

impl StationSet {
    pub fn validate(&self) -> Result<()> {
        for station in &self.stations {
            if station.id.is_empty() {
                return Err(Error::InvalidInput("station id is empty".into()));
            }
            if !station.lat.is_finite()
                || !station.lon.is_finite()
                || station.lat.abs() > 90.0
                || station.lon.abs() > 180.0
            {
                return Err(Error::InvalidInput(format!(
                    "station {} has out-of-range coordinates",
                    station.id
                )));
            }
        }
        Ok(())
    }
}

/// Rarely-changing description of a model or station set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub schema_version: u16,
    /// What the record describes (a model id or a station set hash).
    pub subject: String,
    pub name: String,
    pub attributes: BTreeMap<String, String>,
}

/// Notice that a previously published artifact should be dropped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Retraction {
    pub schema_version: u16,
    pub retracted_hash: Hash32,
    pub reason: String,
    pub issued_by: String,
    pub issued_at: i64,
}

/// The closed artifact union.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Artifact {
    Forecast(Forecast),
    Observation(Observation),
    StationSet(StationSet),
    Metadata(Metadata),
    Retraction(Retraction),
}

impl Artifact {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            Self::Forecast(_) => ArtifactKind::Forecast,
            Self::Observation(_) => ArtifactKind::Observation,
            Self::StationSet(_) => ArtifactKind::StationSet,
            Self::Metadata(_) => ArtifactKind::Metadata,
            Self::Retraction(_) => ArtifactKind::Retraction,
        }
    }

    pub fn schema_version(&self) -> u16 {
        match self {
            Self::Forecast(a) => a.schema_version,
            Self::Observation(a) => a.schema_version,
            Self::StationSet(a) => a.schema_version,
            Self::Metadata(a) => a.schema_version,
            Self::Retraction(a) => a.schema_version,
        }
    }

    /// Enforce per-variant invariants.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Forecast(a) => a.validate(),
            Self::Observation(a) => a.validate(),
            Self::StationSet(a) => a.validate(),
            Self::Metadata(_) | Self::Retraction(_) => Ok(()),
        }
    }

    /// Validate and package into a blob. Returns the blob and the id.
    pub fn package(&self) -> Result<(Vec<u8>, Hash32)> {
        self.validate()?;
        envelope::package(self, self.schema_version())
    }

    /// Unpackage and validate an artifact blob.
    pub fn unpackage(blob: &[u8]) -> Result<Self> {
        let artifact: Self = envelope::unpackage(blob)?;
        artifact.validate()?;
        Ok(artifact)
    }

    /// The artifact id without packaging (hash of canonical bytes).
    pub fn id(&self) -> Result<Hash32> {
        self.validate()?;
        let canonical = crate::canonical::canonical_msgpack(self)?;
        Ok(crate::hash::hash_bytes(&canonical))
    }
}

/// Floor an ISO-8601 UTC instant to its observation bucket and render it in
/// the canonical `YYYY-MM-DDTHH:MM:SS.000Z` form.
pub fn floor_observation_bucket(iso: &str, bucket_minutes: u32) -> Result<String> {
    if bucket_minutes == 0 {
        return Err(Error::InvalidInput("bucketMinutes must be positive".into()));
    }
    let parsed = DateTime::parse_from_rfc3339(iso)
        .map_err(|e| Error::InvalidInput(format!("bad instant {iso}: {e}")))?
        .with_timezone(&Utc);
    let bucket_secs = i64::from(bucket_minutes) * 60;
    let secs = parsed.timestamp();
    let floored = secs - secs.rem_euclid(bucket_secs);
    let instant = DateTime::from_timestamp(floored, 0)
        .ok_or_else(|| Error::InvalidInput(format!("instant {iso} out of range")))?;
    Ok(instant.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;

    fn station_set() -> StationSet {
        StationSet {
            schema_version: 1,
            source: "test_source".into(),
            stations: vec![Station {
                id: "STA1".into(),
                lat: 45.0,
                lon: -75.0,
                name: Some("Test Station".into()),
                elevation: None,
                wmo_id: None,
            }],
        }
    }

    fn observation(station_set_id: Hash32) -> Observation {
        let mut readings = BTreeMap::new();
        readings.insert("STA1".to_string(), Some(12.5));
        let mut data = BTreeMap::new();
        data.insert("temperature_2m".to_string(), readings);
        Observation {
            schema_version: 1,
            source: "test_source".into(),
            observed_at_bucket: "2026-01-01T00:00:00.000Z".into(),
            observed_at_raw: Some("2026-01-01T00:12:31.000Z".into()),
            bucket_minutes: 60,
            fetched_at: 1_767_225_600,
            station_set_id,
            variables: vec!["temperature_2m".into()],
            data,
        }
    }

    fn forecast() -> Forecast {
        let mut data = BTreeMap::new();
        data.insert("t2m".to_string(), vec![1.5, 2.5]);
        let mut variable_map = BTreeMap::new();
        variable_map.insert("t2m".to_string(), "temperature_2m".to_string());
        Forecast {
            schema_version: 1,
            model: "gfs".into(),
            run_time: "2026-01-08T06:00:00.000Z".into(),
            issued_at: 1_767_852_000,
            valid_times: vec![
                "2026-01-08T07:00:00.000Z".into(),
                "2026-01-08T08:00:00.000Z".into(),
            ],
            variables: vec!["temperature_2m".into()],
            grid: Grid::Point {
                lat: 44.6683,
                lon: -65.7619,
            },
            data,
            variable_map,
            source: "test_source".into(),
            source_url: None,
        }
    }

    #[test]
    fn test_bucket_flooring() {
        assert_eq!(
            floor_observation_bucket("2026-01-08T19:59:59.999Z", 60).unwrap(),
            "2026-01-08T19:00:00.000Z"
        );
        assert_eq!(
            floor_observation_bucket("2026-01-08T19:15:00.000Z", 15).unwrap(),
            "2026-01-08T19:15:00.000Z"
        );
    }

    #[test]
    fn test_package_roundtrip_preserves_identity() {
        let artifact = Artifact::StationSet(station_set());
        let (blob, id) = artifact.package().unwrap();
        let back = Artifact::unpackage(&blob).unwrap();
        assert_eq!(back, artifact);
        assert_eq!(back.id().unwrap(), id);
    }

    #[test]
    fn test_forecast_series_length_enforced() {
        let mut bad = forecast();
        bad.data.get_mut("t2m").unwrap().pop();
        assert!(Artifact::Forecast(bad).validate().is_err());
    }

    #[test]
    fn test_forecast_unmapped_source_rejected() {
        let mut bad = forecast();
        bad.variable_map.clear();
        assert!(Artifact::Forecast(bad).validate().is_err());
    }

    #[test]
    fn test_forecast_inverted_variable_map_rejected() {
        let mut bad = forecast();
        // canonical -> raw is the wrong direction
        bad.variable_map
            .insert("temperature_2m".to_string(), "t2m".to_string());
        assert!(Artifact::Forecast(bad).validate().is_err());
    }

    #[test]
    fn test_observation_requires_canonical_variables() {
        let id = hash_bytes(b"set");
        let mut bad = observation(id);
        bad.variables.push("T2M-Raw".into());
        assert!(Artifact::Observation(bad).validate().is_err());
    }

    #[test]
    fn test_observation_requires_floored_bucket() {
        let id = hash_bytes(b"set");
        let mut bad = observation(id);
        bad.observed_at_bucket = "2026-01-01T00:12:00.000Z".into();
        assert!(Artifact::Observation(bad).validate().is_err());
    }

    #[test]
    fn test_observation_null_readings_are_legal() {
        let id = hash_bytes(b"set");
        let mut obs = observation(id);
        obs.data
            .get_mut("temperature_2m")
            .unwrap()
            .insert("STA2".into(), None);
        assert!(Artifact::Observation(obs).validate().is_ok());
    }

    #[test]
    fn test_station_set_wire_form_has_no_timestamp() {
        let json = crate::canonical::canonical_json(&Artifact::StationSet(station_set())).unwrap();
        let text = String::from_utf8(json).unwrap();
        assert!(!text.contains("createdAt"));
        assert!(!text.contains("timestamp"));
        assert!(text.contains("\"type\":\"station_set\""));
    }

    #[test]
    fn test_grid_key() {
        let grid = Grid::Point {
            lat: 44.66834,
            lon: -65.76194,
        };
        assert_eq!(grid.key(), "pt:44.6683,-65.7619");
    }
}
