//! Upstream data sources
//!
//! Upstream weather APIs are opaque collaborators: a source hands back
//! already-typed records and the pipeline does the packaging. The fixture
//! source produces deterministic synthetic data so the whole publish cycle
//! can run without any network collaborator.

use async_trait::async_trait;
use std::collections::BTreeMap;
use stratus_core::artifact::{Forecast, Grid, Station};
use thiserror::Error;

/// Source errors
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    #[error("upstream returned invalid data: {0}")]
    InvalidData(String),
}

/// Raw observation material: candidate stations plus per-variable readings.
#[derive(Clone, Debug)]
pub struct ObservationReport {
    pub stations: Vec<Station>,
    /// ISO-8601 UTC instant the readings were taken.
    pub observed_at: String,
    /// Epoch seconds when the source obtained the readings.
    pub fetched_at: i64,
    /// canonical variable -> station id -> reading (None = missing).
    pub readings: BTreeMap<String, BTreeMap<String, Option<f64>>>,
}

/// An upstream provider of forecasts and observations.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Stable source identifier recorded on artifacts.
    fn name(&self) -> &str;

    /// Fetch the newest forecast run for one model at a coordinate.
    async fn fetch_forecast(
        &self,
        model: &str,
        lat: f64,
        lon: f64,
    ) -> Result<Forecast, SourceError>;

    /// Fetch candidate stations and their current readings near a
    /// coordinate.
    async fn fetch_observations(
        &self,
        lat: f64,
        lon: f64,
        radius_km: f64,
    ) -> Result<ObservationReport, SourceError>;
}

/// Great-circle distance in kilometers.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Pick the nearest station within `radius_km`, ties broken by id.
pub fn select_nearest_station(
    stations: &[Station],
    lat: f64,
    lon: f64,
    radius_km: f64,
) -> Option<&Station> {
    stations
        .iter()
        .map(|s| (haversine_km(lat, lon, s.lat, s.lon), s))
        .filter(|(d, _)| *d <= radius_km)
        .min_by(|(da, sa), (db, sb)| {
            da.total_cmp(db).then_with(|| sa.id.cmp(&sb.id))
        })
        .map(|(_, s)| s)
}

/// Deterministic synthetic source for tests and demos.
///
/// Data is anchored to one date captured at construction, so repeated
/// fetches from the same instance are byte-identical while the records
/// still look current to retention policies.
pub struct FixtureSource {
    name: String,
    anchor: chrono::NaiveDate,
}

impl FixtureSource {
    pub fn new() -> Self {
        Self {
            name: "fixture".to_string(),
            anchor: chrono::Utc::now().date_naive(),
        }
    }

    fn instant(&self, hour: u32, minute: u32, second: u32) -> String {
        format!("{}T{hour:02}:{minute:02}:{second:02}.000Z", self.anchor)
    }

    fn epoch(&self, hour: u32) -> i64 {
        self.anchor
            .and_hms_opt(hour, 0, 0)
            .expect("fixture hour in range")
            .and_utc()
            .timestamp()
    }
}

impl Default for FixtureSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamSource for FixtureSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_forecast(
        &self,
        model: &str,
        lat: f64,
        lon: f64,
    ) -> Result<Forecast, SourceError> {
        let run_time = self.instant(6, 0, 0);
        let valid_times: Vec<String> = (7..13).map(|h| self.instant(h, 0, 0)).collect();

        let mut data = BTreeMap::new();
        data.insert(
            "t2m".to_string(),
            (0..valid_times.len()).map(|i| -2.0 + i as f64 * 0.5).collect(),
        );
        data.insert(
            "ws10".to_string(),
            (0..valid_times.len()).map(|i| 3.5 + i as f64 * 0.25).collect(),
        );
        let mut variable_map = BTreeMap::new();
        variable_map.insert("t2m".to_string(), "temperature_2m".to_string());
        variable_map.insert("ws10".to_string(), "wind_speed_10m".to_string());

        Ok(Forecast {
            schema_version: 1,
            model: model.to_string(),
            run_time,
            issued_at: self.epoch(6),
            valid_times,
            variables: vec!["temperature_2m".into(), "wind_speed_10m".into()],
            grid: Grid::Point { lat, lon },
            data,
            variable_map,
            source: self.name.clone(),
            source_url: None,
        })
    }

    async fn fetch_observations(
        &self,
        lat: f64,
        lon: f64,
        _radius_km: f64,
    ) -> Result<ObservationReport, SourceError> {
        let stations = vec![
            Station {
                id: "FX001".into(),
                lat: lat + 0.02,
                lon: lon - 0.01,
                name: Some("Fixture North".into()),
                elevation: Some(12.0),
                wmo_id: None,
            },
            Station {
                id: "FX002".into(),
                lat: lat + 0.40,
                lon: lon + 0.35,
                name: Some("Fixture Far".into()),
                elevation: None,
                wmo_id: None,
            },
        ];

        let mut temp = BTreeMap::new();
        temp.insert("FX001".to_string(), Some(-1.5));
        temp.insert("FX002".to_string(), None);
        let mut wind = BTreeMap::new();
        wind.insert("FX001".to_string(), Some(4.2));
        wind.insert("FX002".to_string(), Some(6.0));

        let mut readings = BTreeMap::new();
        readings.insert("temperature_2m".to_string(), temp);
        readings.insert("wind_speed_10m".to_string(), wind);

        Ok(ObservationReport {
            stations,
            observed_at: self.instant(19, 47, 12),
            fetched_at: self.epoch(20),
            readings,
        })
    }
}
