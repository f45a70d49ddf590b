//! Ingest pipeline
//!
//! One run per location: fetch upstream records, package them into blobs,
//! upload idempotently, then publish a signed daily manifest and advance
//! the scope's chain head. Blobs are content-addressed, so a crashed or
//! repeated run converges to the same state.

use crate::sources::{select_nearest_station, ObservationReport, SourceError, UpstreamSource};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use stratus_core::artifact::{floor_observation_bucket, Artifact, Observation, StationSet};
use stratus_core::error::Error as CoreError;
use stratus_core::hash::Hash32;
use stratus_core::location::{
    compute_location_scope_id, make_loc_key, normalize_location_scope, LocationScope,
};
use stratus_core::manifest::{
    create_manifest, package_manifest, Manifest, ManifestEntry, ManifestSigner,
};
use stratus_store::error::StoreError;
use stratus_store::keys::{chunk_key, manifest_key, root_pointer_key, RootPointer};
use stratus_store::object_store::ObjectStore;
use thiserror::Error;
use tracing::{info, warn};

/// Ingest errors. Upstream failures are handled inside the run; anything
/// surfacing here failed the run.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("source error: {0}")]
    Source(#[from] SourceError),
    #[error("invalid location: {0}")]
    InvalidLocation(String),
    #[error("root pointer is corrupt: {0}")]
    CorruptRootPointer(String),
}

/// Per-run options.
#[derive(Clone, Debug)]
pub struct IngestOptions {
    pub models: Vec<String>,
    pub include_forecasts: bool,
    pub include_observations: bool,
    pub station_radius_km: f64,
    pub bucket_minutes: u32,
    /// Mirror the manifest and root pointer unscoped (legacy single-location
    /// deployments).
    pub publish_unscoped_mirror: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            models: vec!["gfs".into()],
            include_forecasts: true,
            include_observations: true,
            station_radius_km: 50.0,
            bucket_minutes: 60,
            publish_unscoped_mirror: false,
        }
    }
}

/// Result of one completed run.
#[derive(Clone, Debug)]
pub struct IngestOutcome {
    pub date: String,
    pub scope_id: String,
    pub manifest_hash: Hash32,
    pub artifact_hashes: Vec<Hash32>,
    pub chained_from: Option<Hash32>,
}

/// The publisher.
pub struct IngestPipeline {
    store: Arc<dyn ObjectStore>,
    source: Arc<dyn UpstreamSource>,
    signer: Option<ManifestSigner>,
    options: IngestOptions,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        source: Arc<dyn UpstreamSource>,
        signer: Option<ManifestSigner>,
        options: IngestOptions,
    ) -> Self {
        Self {
            store,
            source,
            signer,
            options,
        }
    }

    /// Run one full ingest cycle for a location.
    pub async fn run(
        &self,
        latitude: f64,
        longitude: f64,
        timezone: &str,
    ) -> Result<IngestOutcome, IngestError> {
        let scope = normalize_location_scope(latitude, longitude, Some(timezone), None)
            .map_err(|e| IngestError::InvalidLocation(e.to_string()))?;
        let scope_id = compute_location_scope_id(&scope)?;
        let loc_key = make_loc_key(latitude, longitude)
            .map_err(|e| IngestError::InvalidLocation(e.to_string()))?;
        let date = Utc::now().format("%Y-%m-%d").to_string();

        info!(%scope_id, %loc_key, %date, "starting ingest run");

        let mut entries: Vec<ManifestEntry> = Vec::new();
        let mut artifact_hashes: Vec<Hash32> = Vec::new();

        if self.options.include_forecasts {
            for model in &self.options.models {
                match self.source.fetch_forecast(model, latitude, longitude).await {
                    Ok(forecast) => {
                        let artifact = Artifact::Forecast(forecast);
                        let (hash, size) = self.upload_artifact(&artifact).await?;
                        entries.push(ManifestEntry::describe(
                            &artifact,
                            hash,
                            size,
                            Some(loc_key.clone()),
                        ));
                        artifact_hashes.push(hash);
                    }
                    Err(e) => {
                        // One model failing upstream never fails the run.
                        warn!(model = %model, error = %e, "forecast fetch failed, skipping model");
                    }
                }
            }
        }

        if self.options.include_observations {
            match self
                .source
                .fetch_observations(latitude, longitude, self.options.station_radius_km)
                .await
            {
                Ok(report) => {
                    match self
                        .publish_observation(&report, latitude, longitude, &loc_key)
                        .await?
                    {
                        Some(published) => {
                            entries.extend(published.0);
                            artifact_hashes.extend(published.1);
                        }
                        None => {
                            warn!("no station within radius, skipping observation");
                        }
                    }
                }
                Err(e) => {
                    // Observation publishing is best-effort.
                    warn!(error = %e, "observation fetch failed, publishing forecasts only");
                }
            }
        }

        // Chain onto today's previous manifest, if any.
        let root_key = root_pointer_key(Some(&scope_id));
        let previous = match self.store.get(&root_key).await? {
            Some(bytes) => {
                let pointer: RootPointer = serde_json::from_slice(&bytes)
                    .map_err(|e| IngestError::CorruptRootPointer(e.to_string()))?;
                (pointer.latest == date).then_some(pointer.latest_manifest_hash)
            }
            None => None,
        };

        let manifest = create_manifest(&date, entries, previous)?;
        let (manifest_blob, manifest_hash) =
            package_manifest(&manifest, self.signer.as_ref())?;

        // Manifest blobs are chunks too, so clients can load them by hash.
        self.store
            .put(&chunk_key(&manifest_hash), &manifest_blob)
            .await?;
        self.store
            .put(
                &manifest_key(Some(&scope_id), &date, &manifest_hash),
                &manifest_blob,
            )
            .await?;

        let pointer = RootPointer {
            latest: date.clone(),
            latest_manifest_hash: manifest_hash,
            scope: Some(scope.clone()),
        };
        let pointer_bytes = serde_json::to_vec(&pointer)
            .map_err(|e| IngestError::CorruptRootPointer(e.to_string()))?;
        self.store.put(&root_key, &pointer_bytes).await?;

        if self.options.publish_unscoped_mirror {
            self.store
                .put(&manifest_key(None, &date, &manifest_hash), &manifest_blob)
                .await?;
            self.store
                .put(&root_pointer_key(None), &pointer_bytes)
                .await?;
        }

        info!(
            %manifest_hash,
            artifacts = artifact_hashes.len(),
            chained = previous.is_some(),
            "ingest run published"
        );

        Ok(IngestOutcome {
            date,
            scope_id,
            manifest_hash,
            artifact_hashes,
            chained_from: previous,
        })
    }

    /// Package and upload one artifact, gated on existence for idempotency.
    /// Returns the hash and blob size.
    async fn upload_artifact(&self, artifact: &Artifact) -> Result<(Hash32, u64), IngestError> {
        let (blob, hash) = artifact.package()?;
        let key = chunk_key(&hash);
        if !self.store.exists(&key).await? {
            self.store.put(&key, &blob).await?;
        }
        Ok((hash, blob.len() as u64))
    }

    /// Compose and upload the StationSet and Observation for a report.
    ///
    /// The StationSet goes up first so the id the observation names is
    /// always content-available before the observation itself.
    async fn publish_observation(
        &self,
        report: &ObservationReport,
        latitude: f64,
        longitude: f64,
        loc_key: &str,
    ) -> Result<Option<(Vec<ManifestEntry>, Vec<Hash32>)>, IngestError> {
        let Some(nearest) = select_nearest_station(
            &report.stations,
            latitude,
            longitude,
            self.options.station_radius_km,
        ) else {
            return Ok(None);
        };

        let station_set = Artifact::StationSet(StationSet {
            schema_version: 1,
            source: self.source.name().to_string(),
            stations: vec![nearest.clone()],
        });
        let (set_hash, set_size) = self.upload_artifact(&station_set).await?;

        let bucket =
            floor_observation_bucket(&report.observed_at, self.options.bucket_minutes)?;
        let mut data: BTreeMap<String, BTreeMap<String, Option<f64>>> = BTreeMap::new();
        for (variable, readings) in &report.readings {
            let mut per_station = BTreeMap::new();
            per_station.insert(
                nearest.id.clone(),
                readings.get(&nearest.id).copied().flatten(),
            );
            data.insert(variable.clone(), per_station);
        }
        let observation = Artifact::Observation(Observation {
            schema_version: 1,
            source: self.source.name().to_string(),
            observed_at_bucket: bucket,
            observed_at_raw: Some(report.observed_at.clone()),
            bucket_minutes: self.options.bucket_minutes,
            fetched_at: report.fetched_at,
            station_set_id: set_hash,
            variables: report.readings.keys().cloned().collect(),
            data,
        });
        let (obs_hash, obs_size) = self.upload_artifact(&observation).await?;

        let entries = vec![
            ManifestEntry::describe(&station_set, set_hash, set_size, Some(loc_key.to_string())),
            ManifestEntry::describe(&observation, obs_hash, obs_size, Some(loc_key.to_string())),
        ];
        Ok(Some((entries, vec![set_hash, obs_hash])))
    }
}

/// Load and decode the current manifest chain head for a scope.
pub async fn read_chain_head(
    store: &dyn ObjectStore,
    scope_id: Option<&str>,
    expected_pubkey: Option<&str>,
) -> Result<Option<(RootPointer, Manifest)>, IngestError> {
    let Some(bytes) = store.get(&root_pointer_key(scope_id)).await? else {
        return Ok(None);
    };
    let pointer: RootPointer = serde_json::from_slice(&bytes)
        .map_err(|e| IngestError::CorruptRootPointer(e.to_string()))?;
    let Some(blob) = store
        .get(&chunk_key(&pointer.latest_manifest_hash))
        .await?
    else {
        return Ok(None);
    };
    let manifest = stratus_core::manifest::unpackage_manifest(&blob, expected_pubkey)?;
    Ok(Some((pointer, manifest)))
}
