//! Self-describing blob envelope
//!
//! Wire format (46-byte header, then the compressed payload):
//!
//! | Offset | Size | Field                                 |
//! |--------|------|---------------------------------------|
//! | 0      | 4    | Magic `0x57464344` ("WFCD"), BE       |
//! | 4      | 2    | Schema version, BE                    |
//! | 6      | 4    | Uncompressed size, BE                 |
//! | 10     | 32   | Artifact id (BLAKE3 of canonical)     |
//! | 42     | 4    | Encoding flags, BE                    |
//! | 46     | N    | Compressed payload                    |
//!
//! Identity lives in the uncompressed canonical bytes; the envelope only
//! carries them, so re-compression can never change an artifact id.

use crate::canonical::canonical_msgpack;
use crate::compress::{Encoding, DEFAULT_ENCODING};
use crate::error::{Error, Result};
use crate::hash::{hash_bytes, hashes_equal, Hash32, HASH_LEN};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Envelope magic, "WFCD" big-endian.
pub const BLOB_MAGIC: u32 = 0x5746_4344;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 46;

/// Oldest schema version this reader accepts.
pub const SCHEMA_VERSION_MIN: u16 = 1;

/// Newest schema version this reader accepts.
pub const SCHEMA_VERSION_MAX: u16 = 1;

/// Upper bound on a declared uncompressed payload (64 MB).
const MAX_UNCOMPRESSED_SIZE: u32 = 64 * 1024 * 1024;

/// Parsed envelope header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlobHeader {
    pub schema_version: u16,
    pub uncompressed_size: u32,
    pub artifact_id: Hash32,
    pub encoding: Encoding,
}

/// Package canonical bytes into a blob. Returns the blob and its id.
pub fn package_bytes(canonical: &[u8], schema_version: u16) -> Result<(Vec<u8>, Hash32)> {
    if canonical.len() > MAX_UNCOMPRESSED_SIZE as usize {
        return Err(Error::InvalidInput(format!(
            "payload too large: {} bytes",
            canonical.len()
        )));
    }
    let id = hash_bytes(canonical);
    let compressed = DEFAULT_ENCODING.encode(canonical)?;

    let mut blob = Vec::with_capacity(HEADER_LEN + compressed.len());
    blob.extend_from_slice(&BLOB_MAGIC.to_be_bytes());
    blob.extend_from_slice(&schema_version.to_be_bytes());
    blob.extend_from_slice(&(canonical.len() as u32).to_be_bytes());
    blob.extend_from_slice(&id.0);
    blob.extend_from_slice(&DEFAULT_ENCODING.flags().to_be_bytes());
    blob.extend_from_slice(&compressed);
    Ok((blob, id))
}

/// Serialize a record to canonical msgpack and package it.
pub fn package<T: Serialize>(record: &T, schema_version: u16) -> Result<(Vec<u8>, Hash32)> {
    let canonical = canonical_msgpack(record)?;
    package_bytes(&canonical, schema_version)
}

/// Parse and validate the fixed header.
pub fn parse_header(blob: &[u8]) -> Result<BlobHeader> {
    if blob.len() < HEADER_LEN {
        return Err(Error::TooSmall(blob.len()));
    }
    let magic = u32::from_be_bytes([blob[0], blob[1], blob[2], blob[3]]);
    if magic != BLOB_MAGIC {
        return Err(Error::BadMagic(magic));
    }
    let schema_version = u16::from_be_bytes([blob[4], blob[5]]);
    if !(SCHEMA_VERSION_MIN..=SCHEMA_VERSION_MAX).contains(&schema_version) {
        return Err(Error::SchemaUnsupported(schema_version));
    }
    let uncompressed_size = u32::from_be_bytes([blob[6], blob[7], blob[8], blob[9]]);
    if uncompressed_size > MAX_UNCOMPRESSED_SIZE {
        return Err(Error::InvalidInput(format!(
            "declared size too large: {uncompressed_size} bytes"
        )));
    }
    let mut id = [0u8; HASH_LEN];
    id.copy_from_slice(&blob[10..42]);
    let flags = u32::from_be_bytes([blob[42], blob[43], blob[44], blob[45]]);
    let encoding = Encoding::from_flags(flags)?;

    Ok(BlobHeader {
        schema_version,
        uncompressed_size,
        artifact_id: Hash32(id),
        encoding,
    })
}

/// Unpack a blob to its verified canonical bytes.
///
/// Runs the full check sequence: header shape, magic, schema range,
/// encoding registry, declared size, and hash integrity.
pub fn unpackage_bytes(blob: &[u8]) -> Result<Vec<u8>> {
    let header = parse_header(blob)?;
    let canonical = header
        .encoding
        .decode(&blob[HEADER_LEN..], header.uncompressed_size as usize)?;
    if canonical.len() != header.uncompressed_size as usize {
        return Err(Error::SizeMismatch {
            expected: header.uncompressed_size,
            actual: canonical.len(),
        });
    }
    let computed = hash_bytes(&canonical);
    if !hashes_equal(&computed, &header.artifact_id) {
        return Err(Error::IntegrityMismatch {
            computed: computed.to_hex(),
            header: header.artifact_id.to_hex(),
        });
    }
    Ok(canonical)
}

/// Unpack a blob and decode the canonical msgpack record inside it.
pub fn unpackage<T: DeserializeOwned>(blob: &[u8]) -> Result<T> {
    let canonical = unpackage_bytes(blob)?;
    rmp_serde::from_slice(&canonical).map_err(|e| Error::Decode(e.to_string()))
}

/// Verify that a blob is intact and carries the expected artifact id.
///
/// The id lives over the uncompressed canonical bytes, so this checks the
/// header id against `expected` and then runs the full envelope integrity
/// sequence (which re-hashes the decompressed payload).
pub fn verify_blob(blob: &[u8], expected: &Hash32) -> Result<()> {
    let claimed = artifact_id_of(blob)?;
    if !hashes_equal(&claimed, expected) {
        return Err(Error::IntegrityMismatch {
            computed: claimed.to_hex(),
            header: expected.to_hex(),
        });
    }
    unpackage_bytes(blob)?;
    Ok(())
}

/// Extract the artifact id from a blob without decompressing the payload.
pub fn artifact_id_of(blob: &[u8]) -> Result<Hash32> {
    if blob.len() < HEADER_LEN {
        return Err(Error::TooSmall(blob.len()));
    }
    let mut id = [0u8; HASH_LEN];
    id.copy_from_slice(&blob[10..42]);
    Ok(Hash32(id))
}
