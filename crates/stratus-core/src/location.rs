//! Location scoping
//!
//! Manifests are namespaced by a location scope: a normalized
//! latitude/longitude/timezone record whose canonical hash is the scope id.
//! The loc key is the compact human-readable form (`v1:<lat>,<lon>` with
//! exactly four decimals); its parser accepts only the canonical grammar so
//! a key can never silently round on read.

use crate::canonical::canonical_msgpack;
use crate::error::{Error, Result};
use crate::hash::hash_bytes;
use serde::{Deserialize, Serialize};

/// Scope record version.
pub const SCOPE_VERSION: u16 = 1;

/// Loc key version prefix.
pub const LOC_KEY_VERSION: &str = "v1";

/// Default coordinate precision for scopes and loc keys.
pub const DEFAULT_SCOPE_DECIMALS: u8 = 4;

/// Normalized location scope. Coordinates are fixed-decimal strings so the
/// canonical bytes are stable across languages and float formatting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationScope {
    pub version: u16,
    pub latitude: String,
    pub longitude: String,
    pub timezone: String,
    pub decimals: u8,
}

/// Render a coordinate with a fixed number of decimals, normalizing any
/// negative-zero result to the positive form.
pub fn format_coord(value: f64, decimals: u8) -> String {
    let formatted = format!("{:.*}", decimals as usize, value);
    if formatted.starts_with('-') && formatted[1..].chars().all(|c| c == '0' || c == '.') {
        formatted[1..].to_string()
    } else {
        formatted
    }
}

fn check_coordinates(lat: f64, lon: f64) -> Result<()> {
    if !lat.is_finite() || !lon.is_finite() {
        return Err(Error::InvalidInput("non-finite coordinate".into()));
    }
    if lat.abs() > 90.0 {
        return Err(Error::InvalidInput(format!("latitude {lat} out of range")));
    }
    if lon.abs() > 180.0 {
        return Err(Error::InvalidInput(format!("longitude {lon} out of range")));
    }
    Ok(())
}

/// Normalize raw coordinates into a scope record.
pub fn normalize_location_scope(
    lat: f64,
    lon: f64,
    timezone: Option<&str>,
    decimals: Option<u8>,
) -> Result<LocationScope> {
    check_coordinates(lat, lon)?;
    let decimals = decimals.unwrap_or(DEFAULT_SCOPE_DECIMALS).min(8);
    let timezone = timezone
        .map(str::trim)
        .filter(|tz| !tz.is_empty())
        .unwrap_or("UTC")
        .to_string();
    Ok(LocationScope {
        version: SCOPE_VERSION,
        latitude: format_coord(lat, decimals),
        longitude: format_coord(lon, decimals),
        timezone,
        decimals,
    })
}

/// Scope id: BLAKE3 of the canonical bytes of the normalized scope, hex.
pub fn compute_location_scope_id(scope: &LocationScope) -> Result<String> {
    let bytes = canonical_msgpack(scope)?;
    Ok(hash_bytes(&bytes).to_hex())
}

/// Build the canonical loc key for a coordinate pair.
pub fn make_loc_key(lat: f64, lon: f64) -> Result<String> {
    check_coordinates(lat, lon)?;
    Ok(format!(
        "{LOC_KEY_VERSION}:{},{}",
        format_coord(lat, DEFAULT_SCOPE_DECIMALS),
        format_coord(lon, DEFAULT_SCOPE_DECIMALS)
    ))
}

/// Validate a loc key against the canonical grammar and return its
/// canonical form.
///
/// The only rewriting performed is `-0.0000` -> `0.0000`; any input that
/// would need rounding, padding, or trimming is rejected.
pub fn canonicalize_loc_key(key: &str) -> Result<String> {
    let rest = key
        .strip_prefix("v1:")
        .ok_or_else(|| Error::InvalidInput(format!("loc key {key} has no v1: prefix")))?;
    let (lat_s, lon_s) = rest
        .split_once(',')
        .ok_or_else(|| Error::InvalidInput(format!("loc key {key} is not lat,lon")))?;

    let lat = parse_fixed_component(lat_s)?;
    let lon = parse_fixed_component(lon_s)?;
    if lat.abs() > 90.0 {
        return Err(Error::InvalidInput(format!("latitude {lat_s} out of range")));
    }
    if lon.abs() > 180.0 {
        return Err(Error::InvalidInput(format!(
            "longitude {lon_s} out of range"
        )));
    }

    Ok(format!(
        "{LOC_KEY_VERSION}:{},{}",
        normalize_zero_component(lat_s),
        normalize_zero_component(lon_s)
    ))
}

/// Strict fixed-decimal grammar: `-`? (`0` | nonzero digits) `.` exactly
/// four digits. No `+`, no leading zeros, no whitespace.
fn parse_fixed_component(s: &str) -> Result<f64> {
    let body = s.strip_prefix('-').unwrap_or(s);
    let (int_part, frac_part) = body
        .split_once('.')
        .ok_or_else(|| Error::InvalidInput(format!("coordinate {s} has no decimal point")))?;

    let digits_ok = |p: &str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());
    if !digits_ok(int_part) || !digits_ok(frac_part) {
        return Err(Error::InvalidInput(format!("coordinate {s} is malformed")));
    }
    if frac_part.len() != 4 {
        return Err(Error::InvalidInput(format!(
            "coordinate {s} must carry exactly four decimals"
        )));
    }
    if int_part.len() > 1 && int_part.starts_with('0') {
        return Err(Error::InvalidInput(format!(
            "coordinate {s} has a leading zero"
        )));
    }
    s.parse::<f64>()
        .map_err(|e| Error::InvalidInput(format!("coordinate {s}: {e}")))
}

fn normalize_zero_component(s: &str) -> &str {
    if s.starts_with('-') && s[1..].chars().all(|c| c == '0' || c == '.') {
        &s[1..]
    } else {
        s
    }
}
