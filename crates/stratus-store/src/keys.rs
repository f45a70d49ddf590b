//! Canonical object-store key layout
//!
//! Chunks are global; manifests and root pointers live under a location
//! scope. All hashes in keys are lowercase hex.

use serde::{Deserialize, Serialize};
use stratus_core::hash::Hash32;
use stratus_core::location::LocationScope;

/// Prefix for content-addressed artifact and manifest blobs.
pub const CHUNKS_PREFIX: &str = "chunks/";

/// Prefix for server-composed byte packs.
pub const PACKS_PREFIX: &str = "packs/";

/// Key of an artifact or manifest blob.
pub fn chunk_key(hash: &Hash32) -> String {
    format!("{CHUNKS_PREFIX}{hash}")
}

/// Key of a byte pack.
pub fn pack_key(pack_id: &str) -> String {
    format!("{PACKS_PREFIX}{pack_id}")
}

fn scope_prefix(scope_id: Option<&str>) -> String {
    match scope_id {
        Some(scope_id) => format!("locations/{scope_id}/"),
        None => String::new(),
    }
}

/// Directory key listing one day's manifest hashes.
pub fn manifest_dir_key(scope_id: Option<&str>, date: &str) -> String {
    format!("{}manifests/{date}/", scope_prefix(scope_id))
}

/// Key of one packaged manifest blob.
pub fn manifest_key(scope_id: Option<&str>, date: &str, hash: &Hash32) -> String {
    format!("{}manifests/{date}/{hash}", scope_prefix(scope_id))
}

/// Key of the scope's chain-head pointer.
pub fn root_pointer_key(scope_id: Option<&str>) -> String {
    format!("{}manifests/root.json", scope_prefix(scope_id))
}

/// Chain-head pointer document stored at `root_pointer_key`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootPointer {
    /// Latest published date, `YYYY-MM-DD`.
    pub latest: String,
    pub latest_manifest_hash: Hash32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<LocationScope>,
}
