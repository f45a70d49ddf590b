//! Payload compression registry
//!
//! A closed set of encodings keyed by the envelope's encoding-flags word.
//! Decoding any flag outside the registry is a hard failure; new encodings
//! are additions here, never best-effort fallbacks.

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Registered payload encodings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    /// gzip over canonical msgpack. The only defined value.
    GzipMsgpack,
}

/// The encoding used for all newly packaged blobs.
pub const DEFAULT_ENCODING: Encoding = Encoding::GzipMsgpack;

impl Encoding {
    /// The envelope flags word for this encoding.
    pub const fn flags(self) -> u32 {
        match self {
            Self::GzipMsgpack => 0x0000_0001,
        }
    }

    /// Resolve a flags word from the registry.
    pub fn from_flags(flags: u32) -> Result<Self> {
        match flags {
            0x0000_0001 => Ok(Self::GzipMsgpack),
            other => Err(Error::UnknownEncoding(other)),
        }
    }

    /// Compress a payload.
    pub fn encode(self, bytes: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::GzipMsgpack => {
                let mut encoder = GzEncoder::new(
                    Vec::with_capacity(bytes.len() / 2 + 16),
                    Compression::default(),
                );
                encoder.write_all(bytes)?;
                Ok(encoder.finish()?)
            }
        }
    }

    /// Decompress a payload. `size_hint` pre-sizes the output buffer; the
    /// caller is responsible for checking the result against the envelope.
    pub fn decode(self, bytes: &[u8], size_hint: usize) -> Result<Vec<u8>> {
        match self {
            Self::GzipMsgpack => {
                let mut decoder = GzDecoder::new(bytes);
                let mut out = Vec::with_capacity(size_hint);
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }
}
