//! Region filename utilities.
//!
//! This module provides functions for converting between coordinates and
//! region `.rd5` filenames.
//!
//! # Filename Format
//!
//! Region files follow the naming convention: `{E|W}{lon}_{N|S}{lat}.rd5`
//!
//! - Longitude first, with E/W prefix and no padding (e.g., E5, W10)
//! - Latitude second, with N/S prefix (e.g., N45, S5)
//!
//! The filename represents the **southwest corner** of the 5° × 5° region,
//! so both values are multiples of 5.

use crate::region::REGION_DEGREES;

/// File extension of region files, without the dot.
pub const REGION_EXTENSION: &str = "rd5";

/// Convert a region origin to its filename.
///
/// # Examples
///
/// ```
/// use rd5::filename::origin_to_filename;
///
/// assert_eq!(origin_to_filename(5, 45), "E5_N45.rd5");
/// assert_eq!(origin_to_filename(-10, -5), "W10_S5.rd5");
/// ```
pub fn origin_to_filename(lon: i32, lat: i32) -> String {
    let lon_prefix = if lon >= 0 { 'E' } else { 'W' };
    let lat_prefix = if lat >= 0 { 'N' } else { 'S' };

    format!(
        "{}{}_{}{}.{}",
        lon_prefix,
        lon.abs(),
        lat_prefix,
        lat.abs(),
        REGION_EXTENSION
    )
}

/// Parse a region filename to extract its origin.
///
/// Accepts a bare name or a path, with or without the `.rd5` extension.
/// Returns `(lon, lat)` of the southwest corner, or `None` if parsing fails.
///
/// # Examples
///
/// ```
/// use rd5::filename::filename_to_origin;
///
/// assert_eq!(filename_to_origin("E5_N45.rd5"), Some((5, 45)));
/// assert_eq!(filename_to_origin("/data/segments/W10_S5.rd5"), Some((-10, -5)));
/// assert_eq!(filename_to_origin("invalid"), None);
/// ```
pub fn filename_to_origin(filename: &str) -> Option<(i32, i32)> {
    // Extract just the filename if a path is given
    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename);
    let name = name
        .strip_suffix(".rd5")
        .or_else(|| name.strip_suffix(".RD5"))
        .unwrap_or(name);

    let (lon_part, lat_part) = name.split_once('_')?;
    let lon = signed_degrees(lon_part, 'E', 'W')?;
    let lat = signed_degrees(lat_part, 'N', 'S')?;

    is_valid_origin(lon, lat).then_some((lon, lat))
}

fn signed_degrees(part: &str, positive: char, negative: char) -> Option<i32> {
    let mut chars = part.chars();
    let prefix = chars.next()?.to_ascii_uppercase();
    let digits = chars.as_str();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: i32 = digits.parse().ok()?;

    if prefix == positive {
        Some(value)
    } else if prefix == negative {
        Some(-value)
    } else {
        None
    }
}

/// Whether `(lon, lat)` is a region origin: on the 5° grid and in range.
pub fn is_valid_origin(lon: i32, lat: i32) -> bool {
    let step = REGION_DEGREES as i32;
    lon % step == 0
        && lat % step == 0
        && (-180..180).contains(&lon)
        && (-90..90).contains(&lat)
}
