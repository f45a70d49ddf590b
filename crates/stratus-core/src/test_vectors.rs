//! Cross-implementation test vectors
//!
//! These vectors pin the canonical encoding across implementations: any
//! producer or consumer in any language must reproduce these ids exactly.

use crate::artifact::{Artifact, Observation, Station, StationSet};
use crate::canonical::{canonical_json, canonical_msgpack};
use crate::hash::{hash_bytes, Hash32};
use crate::location::make_loc_key;
use serde::Serialize;
use std::collections::BTreeMap;

/// Test vector output format (JSON serializable)
#[derive(Serialize)]
pub struct TestVector {
    pub name: String,
    pub description: String,
    pub canonical_json: String,
    pub canonical_msgpack_hex: String,
    pub id_hex: String,
}

const STATION_SET_ID: &str = "fe87cbdc276d1985ddda985f1f0367edae5bfe4e08577a2df575ed4adbc8c359";
const OBSERVATION_ID: &str = "0efc5d8bb769ba2e2cf5c8d99173761e8b7e36eceb461c7d4ae39b7cf4f50511";

fn golden_station_set() -> Artifact {
    Artifact::StationSet(StationSet {
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
    })
}

fn golden_observation() -> Artifact {
    let mut readings = BTreeMap::new();
    readings.insert("STA1".to_string(), Some(12.5));
    let mut data = BTreeMap::new();
    data.insert("var1".to_string(), readings);
    Artifact::Observation(Observation {
        schema_version: 1,
        source: "test_source".into(),
        observed_at_bucket: "2026-01-01T00:00:00.000Z".into(),
        observed_at_raw: Some("2026-01-01T00:00:00.000Z".into()),
        bucket_minutes: 60,
        fetched_at: 1_735_689_600,
        station_set_id: Hash32::from_hex(STATION_SET_ID).unwrap(),
        variables: vec!["var1".into()],
        data,
    })
}

fn vector(name: &str, description: &str, artifact: &Artifact) -> TestVector {
    let msgpack = canonical_msgpack(artifact).unwrap();
    TestVector {
        name: name.into(),
        description: description.into(),
        canonical_json: String::from_utf8(canonical_json(artifact).unwrap()).unwrap(),
        canonical_msgpack_hex: hex::encode(&msgpack),
        id_hex: hash_bytes(&msgpack).to_hex(),
    }
}

/// Generate all test vectors as JSON
pub fn generate_test_vectors() -> Vec<TestVector> {
    vec![
        vector(
            "station_set_identity",
            "id = BLAKE3(canonical_msgpack(station_set))",
            &golden_station_set(),
        ),
        vector(
            "observation_identity",
            "id = BLAKE3(canonical_msgpack(observation))",
            &golden_observation(),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_vectors() {
        let vectors = generate_test_vectors();
        assert!(!vectors.is_empty());

        // Print JSON for manual inspection / export
        let json = serde_json::to_string_pretty(
            &vectors
                .iter()
                .map(|v| {
                    serde_json::json!({
                        "name": v.name,
                        "canonical_json": v.canonical_json,
                        "canonical_msgpack_hex": v.canonical_msgpack_hex,
                        "id_hex": v.id_hex,
                    })
                })
                .collect::<Vec<_>>(),
        )
        .unwrap();
        println!("Test Vectors:\n{json}");
    }

    #[test]
    fn test_station_set_golden_id() {
        let artifact = golden_station_set();
        assert_eq!(artifact.id().unwrap().to_hex(), STATION_SET_ID);
    }

    #[test]
    fn test_observation_golden_id() {
        let artifact = golden_observation();
        assert_eq!(artifact.id().unwrap().to_hex(), OBSERVATION_ID);
    }

    #[test]
    fn test_golden_ids_survive_packaging() {
        for artifact in [golden_station_set(), golden_observation()] {
            let (blob, id) = artifact.package().unwrap();
            assert_eq!(Artifact::unpackage(&blob).unwrap().id().unwrap(), id);
        }
    }

    #[test]
    fn test_station_set_canonical_json_shape() {
        let json = vector("x", "", &golden_station_set()).canonical_json;
        assert_eq!(
            json,
            r#"{"schemaVersion":1,"source":"test_source","stations":[{"id":"STA1","lat":45,"lon":-75,"name":"Test Station"}],"type":"station_set"}"#
        );
    }

    #[test]
    fn test_loc_key_golden() {
        assert_eq!(
            make_loc_key(44.66834, -65.76194).unwrap(),
            "v1:44.6683,-65.7619"
        );
    }
}
