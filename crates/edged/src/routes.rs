//! Edge HTTP surface
//!
//! Thin key-mapping over the object store. Status codes, cache headers,
//! and the JSON error shape are contracts: blobs are immutable (long cache
//! + ETag), pointers are short-cached, and 404/503 are never cacheable.
//! Every response carries `Access-Control-Allow-Origin: *`.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ingestd::pipeline::{IngestError, IngestPipeline};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use stratus_core::location::{canonicalize_loc_key, normalize_location_scope};
use stratus_store::keys::{manifest_dir_key, pack_key, root_pointer_key};
use stratus_store::object_store::ObjectStore;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, warn};

/// Shared route state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ObjectStore>,
    pub ingest: Arc<IngestPipeline>,
    pub default_timezone: String,
}

/// Build the edge router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/manifests/root.json", get(unscoped_root))
        .route("/manifests/{date}", get(unscoped_manifest_list))
        .route("/manifests/{date}/", get(unscoped_manifest_list))
        .route("/manifests/{date}/{hash}", get(unscoped_manifest_blob))
        .route("/chunks/{hash}", get(get_chunk))
        .route("/locations/{scope}/manifests/root.json", get(scoped_root))
        .route(
            "/locations/{scope}/manifests/{date}",
            get(scoped_manifest_list),
        )
        .route(
            "/locations/{scope}/manifests/{date}/",
            get(scoped_manifest_list),
        )
        .route(
            "/locations/{scope}/manifests/{date}/{hash}",
            get(scoped_manifest_blob),
        )
        .route("/locations/{scope}/latest.json", get(latest_for_loc_key))
        .route("/packs/{pack_id}", get(get_pack))
        .route("/ingest", post(ingest))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .with_state(state)
}

fn error_body(status: StatusCode, code: &str) -> Response {
    let mut response = (status, Json(json!({ "error": code }))).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn store_error(e: stratus_store::StoreError) -> Response {
    error!(error = %e, "object store failure");
    error_body(StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR")
}

fn blob_response(hash: &str, bytes: Vec<u8>) -> Response {
    let len = bytes.len();
    let mut response = Response::new(Body::from(bytes));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, len.into());
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("public, max-age=31536000, immutable"),
    );
    if let Ok(etag) = header::HeaderValue::from_str(&format!("\"{hash}\"")) {
        headers.insert(header::ETAG, etag);
    }
    response
}

fn json_response(value: serde_json::Value, cache_control: &'static str) -> Response {
    let mut response = Json(value).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static(cache_control),
    );
    response
}

async fn healthz() -> Response {
    json_response(json!({ "status": "ok" }), "no-store")
}

async fn root_pointer(state: &AppState, scope: Option<&str>) -> Response {
    match state.store.get(&root_pointer_key(scope)).await {
        Ok(Some(bytes)) => match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(value) => json_response(value, "public, max-age=30"),
            Err(e) => {
                error!(error = %e, "root pointer is not valid JSON");
                error_body(StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR")
            }
        },
        Ok(None) => error_body(StatusCode::NOT_FOUND, "NOT_FOUND"),
        Err(e) => store_error(e),
    }
}

async fn unscoped_root(State(state): State<AppState>) -> Response {
    root_pointer(&state, None).await
}

async fn scoped_root(State(state): State<AppState>, Path(scope): Path<String>) -> Response {
    root_pointer(&state, Some(&scope)).await
}

/// Aggregate a date's manifest hashes into one sorted JSON array.
async fn manifest_list(state: &AppState, scope: Option<&str>, date: &str) -> Response {
    let prefix = manifest_dir_key(scope, date);
    match state.store.list(&prefix).await {
        Ok(keys) => {
            let mut hashes: Vec<String> = keys
                .iter()
                .filter_map(|k| k.rsplit('/').next())
                .filter(|name| name.len() == 64 && name.bytes().all(|b| b.is_ascii_hexdigit()))
                .map(str::to_string)
                .collect();
            hashes.sort();
            json_response(json!(hashes), "public, max-age=30")
        }
        Err(e) => store_error(e),
    }
}

async fn unscoped_manifest_list(
    State(state): State<AppState>,
    Path(date): Path<String>,
) -> Response {
    manifest_list(&state, None, &date).await
}

async fn scoped_manifest_list(
    State(state): State<AppState>,
    Path((scope, date)): Path<(String, String)>,
) -> Response {
    manifest_list(&state, Some(&scope), &date).await
}

async fn manifest_blob(
    state: &AppState,
    scope: Option<&str>,
    date: &str,
    hash: &str,
) -> Response {
    let prefix = manifest_dir_key(scope, date);
    match state.store.get(&format!("{prefix}{hash}")).await {
        Ok(Some(bytes)) => blob_response(hash, bytes),
        Ok(None) => error_body(StatusCode::NOT_FOUND, "NOT_FOUND"),
        Err(e) => store_error(e),
    }
}

async fn unscoped_manifest_blob(
    State(state): State<AppState>,
    Path((date, hash)): Path<(String, String)>,
) -> Response {
    manifest_blob(&state, None, &date, &hash).await
}

async fn scoped_manifest_blob(
    State(state): State<AppState>,
    Path((scope, date, hash)): Path<(String, String, String)>,
) -> Response {
    manifest_blob(&state, Some(&scope), &date, &hash).await
}

async fn get_chunk(State(state): State<AppState>, Path(hash): Path<String>) -> Response {
    let hash = hash.to_lowercase();
    match state.store.get(&format!("chunks/{hash}")).await {
        Ok(Some(bytes)) => blob_response(&hash, bytes),
        Ok(None) => error_body(StatusCode::NOT_FOUND, "NOT_FOUND"),
        Err(e) => store_error(e),
    }
}

/// `{loc_key, dates: [{date, manifests: []}]}` for a canonical loc key.
async fn latest_for_loc_key(
    State(state): State<AppState>,
    Path(loc_key): Path<String>,
) -> Response {
    let Ok(canonical) = canonicalize_loc_key(&loc_key) else {
        return error_body(StatusCode::BAD_REQUEST, "INVALID_LOC_KEY");
    };
    // The canonical key is "v1:<lat>,<lon>".
    let Some((lat, lon)) = canonical
        .strip_prefix("v1:")
        .and_then(|coords| coords.split_once(','))
    else {
        return error_body(StatusCode::BAD_REQUEST, "INVALID_LOC_KEY");
    };
    let (Ok(lat), Ok(lon)) = (lat.parse::<f64>(), lon.parse::<f64>()) else {
        return error_body(StatusCode::BAD_REQUEST, "INVALID_LOC_KEY");
    };
    let scope = match normalize_location_scope(lat, lon, Some(&state.default_timezone), None) {
        Ok(scope) => scope,
        Err(_) => return error_body(StatusCode::BAD_REQUEST, "INVALID_LOC_KEY"),
    };
    let scope_id = match stratus_core::location::compute_location_scope_id(&scope) {
        Ok(scope_id) => scope_id,
        Err(_) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR"),
    };

    match state.store.get(&root_pointer_key(Some(&scope_id))).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_body(StatusCode::SERVICE_UNAVAILABLE, "CDN_UNAVAILABLE"),
        Err(e) => return store_error(e),
    }

    let prefix = format!("locations/{scope_id}/manifests/");
    let keys = match state.store.list(&prefix).await {
        Ok(keys) => keys,
        Err(e) => return store_error(e),
    };
    let mut dates: Vec<(String, Vec<String>)> = Vec::new();
    for key in keys {
        let rest = &key[prefix.len()..];
        let Some((date, hash)) = rest.split_once('/') else {
            continue;
        };
        if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            continue;
        }
        match dates.iter_mut().find(|(d, _)| d == date) {
            Some((_, hashes)) => hashes.push(hash.to_string()),
            None => dates.push((date.to_string(), vec![hash.to_string()])),
        }
    }
    dates.sort_by(|(a, _), (b, _)| a.cmp(b));
    let dates: Vec<serde_json::Value> = dates
        .into_iter()
        .map(|(date, mut manifests)| {
            manifests.sort();
            json!({ "date": date, "manifests": manifests })
        })
        .collect();

    json_response(
        json!({ "loc_key": canonical, "dates": dates }),
        "public, max-age=30",
    )
}

/// Range-served byte packs. Range requests answer `206 Partial Content`
/// with a matching `Content-Range`; requests without a Range get the whole
/// pack.
async fn get_pack(
    State(state): State<AppState>,
    Path(pack_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let key = pack_key(&pack_id);
    let bytes = match state.store.get(&key).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return error_body(StatusCode::NOT_FOUND, "NOT_FOUND"),
        Err(e) => return store_error(e),
    };
    let total = bytes.len() as u64;

    let Some(range) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) else {
        let mut response = Response::new(Body::from(bytes));
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/octet-stream"),
        );
        return response;
    };

    let Some((start, end)) = parse_byte_range(range, total) else {
        warn!(range = %range, pack_id = %pack_id, "unsatisfiable range");
        return error_body(StatusCode::RANGE_NOT_SATISFIABLE, "INVALID_RANGE");
    };

    let slice = bytes[start as usize..=(end as usize)].to_vec();
    let slice_len = slice.len();
    let mut response = Response::new(Body::from(slice));
    *response.status_mut() = StatusCode::PARTIAL_CONTENT;
    let headers_out = response.headers_mut();
    headers_out.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/octet-stream"),
    );
    headers_out.insert(header::CONTENT_LENGTH, slice_len.into());
    if let Ok(content_range) =
        header::HeaderValue::from_str(&format!("bytes {start}-{end}/{total}"))
    {
        headers_out.insert(header::CONTENT_RANGE, content_range);
    }
    response
}

/// Parse a single `bytes=start-end` range against `total`.
fn parse_byte_range(value: &str, total: u64) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = if end.is_empty() {
        total.checked_sub(1)?
    } else {
        end.parse().ok()?
    };
    (start <= end && end < total).then_some((start, end))
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    latitude: Option<f64>,
    longitude: Option<f64>,
    timezone: Option<String>,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    success: bool,
    #[serde(rename = "manifestHash")]
    manifest_hash: String,
    artifacts: usize,
    timestamp: i64,
}

async fn ingest(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> Response {
    let (Some(latitude), Some(longitude)) = (request.latitude, request.longitude) else {
        return error_body(StatusCode::BAD_REQUEST, "INVALID_LOCATION");
    };
    if !latitude.is_finite()
        || !longitude.is_finite()
        || latitude.abs() > 90.0
        || longitude.abs() > 180.0
    {
        return error_body(StatusCode::BAD_REQUEST, "INVALID_LOCATION");
    }
    let timezone = request
        .timezone
        .unwrap_or_else(|| state.default_timezone.clone());

    match state.ingest.run(latitude, longitude, &timezone).await {
        Ok(outcome) => {
            let body = IngestResponse {
                success: true,
                manifest_hash: outcome.manifest_hash.to_hex(),
                artifacts: outcome.artifact_hashes.len(),
                timestamp: chrono::Utc::now().timestamp(),
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(IngestError::InvalidLocation(_)) => {
            error_body(StatusCode::BAD_REQUEST, "INVALID_LOCATION")
        }
        Err(e) => {
            error!(error = %e, "ingest run failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "INGEST_FAILED")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::Request;
    use ingestd::pipeline::IngestOptions;
    use ingestd::sources::FixtureSource;
    use stratus_core::location::make_loc_key;
    use stratus_store::keys::chunk_key;
    use stratus_store::object_store::MemoryStore;
    use tower::ServiceExt;

    fn app_with_store() -> (Router, Arc<MemoryStore>, Arc<IngestPipeline>) {
        let store = Arc::new(MemoryStore::new());
        let ingest = Arc::new(IngestPipeline::new(
            store.clone(),
            Arc::new(FixtureSource::new()),
            None,
            IngestOptions::default(),
        ));
        let state = AppState {
            store: store.clone(),
            ingest: ingest.clone(),
            default_timezone: "UTC".to_string(),
        };
        (router(state), store, ingest)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_healthz() {
        let (app, _, _) = app_with_store();
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_chunk_is_json_404_no_store() {
        let (app, _, _) = app_with_store();
        let response = app
            .oneshot(
                Request::get(format!("/chunks/{}", "ab".repeat(32)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            "no-store"
        );
        assert_eq!(body_json(response).await, json!({"error": "NOT_FOUND"}));
    }

    #[tokio::test]
    async fn test_published_chunk_served_immutable_with_etag() {
        let (app, _, ingest) = app_with_store();
        let outcome = ingest.run(44.6683, -65.7619, "UTC").await.unwrap();
        let hash = outcome.artifact_hashes[0].to_hex();

        let response = app
            .oneshot(
                Request::get(format!("/chunks/{hash}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::ETAG], format!("\"{hash}\""));
        assert!(response.headers()[header::CACHE_CONTROL]
            .to_str()
            .unwrap()
            .contains("immutable"));
    }

    #[tokio::test]
    async fn test_scoped_root_and_manifest_list() {
        let (app, _, ingest) = app_with_store();
        let outcome = ingest.run(44.6683, -65.7619, "UTC").await.unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::get(format!(
                    "/locations/{}/manifests/root.json",
                    outcome.scope_id
                ))
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let root = body_json(response).await;
        assert_eq!(root["latest"], json!(outcome.date));
        assert_eq!(
            root["latestManifestHash"],
            json!(outcome.manifest_hash.to_hex())
        );

        let response = app
            .oneshot(
                Request::get(format!(
                    "/locations/{}/manifests/{}/",
                    outcome.scope_id, outcome.date
                ))
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!([outcome.manifest_hash.to_hex()])
        );
    }

    #[tokio::test]
    async fn test_latest_json_contract() {
        let (app, _, ingest) = app_with_store();

        // Non-canonical key: 400.
        let response = app
            .clone()
            .oneshot(
                Request::get("/locations/v1:44.66,-65.7600/latest.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            json!({"error": "INVALID_LOC_KEY"})
        );

        // Canonical but unpublished: 503.
        let key = make_loc_key(10.0, 20.0).unwrap();
        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/locations/{key}/latest.json"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            body_json(response).await,
            json!({"error": "CDN_UNAVAILABLE"})
        );

        // Published location: dates and manifests listed.
        let outcome = ingest.run(44.6683, -65.7619, "UTC").await.unwrap();
        let key = make_loc_key(44.6683, -65.7619).unwrap();
        let response = app
            .oneshot(
                Request::get(format!("/locations/{key}/latest.json"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["loc_key"], json!(key));
        assert_eq!(body["dates"][0]["date"], json!(outcome.date));
        assert_eq!(
            body["dates"][0]["manifests"],
            json!([outcome.manifest_hash.to_hex()])
        );
    }

    #[tokio::test]
    async fn test_pack_range_contract() {
        let (app, store, _) = app_with_store();
        store.put("packs/p1", b"0123456789").await.unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::get("/packs/p1")
                    .header(header::RANGE, "bytes=2-5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers()[header::CONTENT_RANGE],
            "bytes 2-5/10"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"2345");

        // No Range: whole pack, plain 200.
        let response = app
            .clone()
            .oneshot(Request::get("/packs/p1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Unsatisfiable range.
        let response = app
            .oneshot(
                Request::get("/packs/p1")
                    .header(header::RANGE, "bytes=9-20")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    }

    #[tokio::test]
    async fn test_ingest_route() {
        let (app, store, _) = app_with_store();

        // Missing coordinates: 400 INVALID_LOCATION.
        let response = app
            .clone()
            .oneshot(
                Request::post("/ingest")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"timezone":"UTC"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            json!({"error": "INVALID_LOCATION"})
        );

        // Out-of-range latitude.
        let response = app
            .clone()
            .oneshot(
                Request::post("/ingest")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"latitude":95.0,"longitude":0.0}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Valid request publishes.
        let response = app
            .oneshot(
                Request::post("/ingest")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"latitude":44.6683,"longitude":-65.7619,"timezone":"UTC"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["artifacts"], json!(3));
        let manifest_hash = body["manifestHash"].as_str().unwrap();
        assert!(store
            .exists(&chunk_key(
                &stratus_core::Hash32::from_hex(manifest_hash).unwrap()
            ))
            .await
            .unwrap());
    }
}
