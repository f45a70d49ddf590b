//! Daily manifests
//!
//! A manifest is the signed, dated, scoped directory of artifacts published
//! in one ingest run. The Ed25519 signature covers the canonical bytes of
//! the manifest *without* its signature field; the manifest id is the hash
//! of the canonical bytes *with* the signature attached. Verification
//! re-derives the signed bytes from the parsed record itself, so a manifest
//! signed over differently-shaped content can never verify.

use crate::artifact::{Artifact, ArtifactKind};
use crate::canonical::canonical_msgpack;
use crate::envelope;
use crate::error::{Error, Result};
use crate::hash::Hash32;
use chrono::NaiveDate;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Current manifest record schema version.
pub const MANIFEST_SCHEMA_VERSION: u16 = 1;

/// Detached Ed25519 signature envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureEnvelope {
    /// 64-byte signature, lowercase hex.
    pub signature: String,
    /// 32-byte public key, lowercase hex.
    pub public_key: String,
    pub signed_at: i64,
}

/// One artifact reference with enough metadata to filter without fetching.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub hash: Hash32,
    #[serde(rename = "type")]
    pub kind: ArtifactKind,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at_bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station_set_id: Option<Hash32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retracted_hash: Option<Hash32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loc_key: Option<String>,
}

impl ManifestEntry {
    /// Describe a packaged artifact.
    pub fn describe(
        artifact: &Artifact,
        hash: Hash32,
        size_bytes: u64,
        loc_key: Option<String>,
    ) -> Self {
        let mut entry = Self {
            hash,
            kind: artifact.kind(),
            size_bytes,
            model: None,
            run_time: None,
            grid_key: None,
            source: None,
            observed_at_bucket: None,
            bucket_minutes: None,
            station_set_id: None,
            retracted_hash: None,
            loc_key,
        };
        match artifact {
            Artifact::Forecast(f) => {
                entry.model = Some(f.model.clone());
                entry.run_time = Some(f.run_time.clone());
                entry.grid_key = Some(f.grid.key());
                entry.source = Some(f.source.clone());
            }
            Artifact::Observation(o) => {
                entry.source = Some(o.source.clone());
                entry.observed_at_bucket = Some(o.observed_at_bucket.clone());
                entry.bucket_minutes = Some(o.bucket_minutes);
                entry.station_set_id = Some(o.station_set_id);
            }
            Artifact::StationSet(s) => {
                entry.source = Some(s.source.clone());
            }
            Artifact::Metadata(_) => {}
            Artifact::Retraction(r) => {
                entry.retracted_hash = Some(r.retracted_hash);
            }
        }
        entry
    }
}

/// A daily, location-scoped artifact directory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u16,
    /// `YYYY-MM-DD`.
    pub date: String,
    /// Chain link to the previous manifest published for the same scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_manifest_hash: Option<Hash32>,
    pub published_at: i64,
    pub artifacts: Vec<ManifestEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureEnvelope>,
}

/// Ed25519 keypair for manifest signing.
#[derive(Clone)]
pub struct ManifestSigner {
    signing_key: SigningKey,
}

impl ManifestSigner {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Load from a 32-byte hex seed.
    pub fn from_seed_hex(seed_hex: &str) -> Result<Self> {
        let bytes = hex::decode(seed_hex)
            .map_err(|e| Error::InvalidKey(format!("bad signing seed hex: {e}")))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey("signing seed must be 32 bytes".into()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    /// Lowercase hex public key.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

/// Build an unsigned manifest stamped with the current time.
pub fn create_manifest(
    date: &str,
    artifacts: Vec<ManifestEntry>,
    previous_manifest_hash: Option<Hash32>,
) -> Result<Manifest> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|e| Error::InvalidInput(format!("bad manifest date {date}: {e}")))?;
    Ok(Manifest {
        schema_version: MANIFEST_SCHEMA_VERSION,
        date: date.to_string(),
        previous_manifest_hash,
        published_at: chrono::Utc::now().timestamp(),
        artifacts,
        signature: None,
    })
}

/// Sign (when a key is configured) and package a manifest into a blob.
///
/// Any pre-existing signature is stripped before re-signing. The returned
/// id covers the signed form.
pub fn package_manifest(
    manifest: &Manifest,
    signer: Option<&ManifestSigner>,
) -> Result<(Vec<u8>, Hash32)> {
    let mut manifest = manifest.clone();
    if let Some(signer) = signer {
        manifest.signature = None;
        let unsigned_bytes = canonical_msgpack(&manifest)?;
        let signature = signer.sign(&unsigned_bytes);
        manifest.signature = Some(SignatureEnvelope {
            signature: hex::encode(signature),
            public_key: signer.public_key_hex(),
            signed_at: chrono::Utc::now().timestamp(),
        });
    }
    envelope::package(&manifest, manifest.schema_version)
}

/// Verify a manifest's signature.
///
/// When `expected_pubkey` is given the signature must exist, the signer
/// must match (case-insensitively), and the signature must verify over the
/// canonical bytes re-derived from this record minus its signature field.
pub fn verify_manifest_signature(manifest: &Manifest, expected_pubkey: Option<&str>) -> Result<()> {
    let envelope = manifest.signature.as_ref().ok_or(Error::Unsigned)?;

    if let Some(expected) = expected_pubkey {
        if !envelope.public_key.eq_ignore_ascii_case(expected) {
            return Err(Error::UnexpectedSigner(envelope.public_key.clone()));
        }
    }

    let key_bytes: [u8; 32] = hex::decode(&envelope.public_key)
        .map_err(|e| Error::InvalidKey(format!("bad public key hex: {e}")))?
        .try_into()
        .map_err(|_| Error::InvalidKey("public key must be 32 bytes".into()))?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|e| Error::InvalidKey(e.to_string()))?;

    let sig_bytes: [u8; 64] = hex::decode(&envelope.signature)
        .map_err(|e| Error::InvalidKey(format!("bad signature hex: {e}")))?
        .try_into()
        .map_err(|_| Error::InvalidKey("signature must be 64 bytes".into()))?;
    let signature = Signature::from_bytes(&sig_bytes);

    let mut unsigned = manifest.clone();
    unsigned.signature = None;
    let message = canonical_msgpack(&unsigned)?;

    verifying_key
        .verify(&message, &signature)
        .map_err(|_| Error::InvalidSignature)
}

/// Unpackage a manifest blob, verifying the signature when a public key is
/// pinned.
pub fn unpackage_manifest(blob: &[u8], expected_pubkey: Option<&str>) -> Result<Manifest> {
    let manifest: Manifest = envelope::unpackage(blob)?;
    if expected_pubkey.is_some() {
        verify_manifest_signature(&manifest, expected_pubkey)?;
    }
    Ok(manifest)
}
