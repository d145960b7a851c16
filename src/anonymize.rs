//! Privacy-preserving location anonymization.
//!
//! Coordinates are snapped to a fixed grid, rendered canonically, and
//! SHA-256-hashed (truncated to 16 hex chars), so every point in the same
//! grid cell yields the same stable hash.  Alongside the hash a coarse
//! [`RegionCode`] is assigned from fixed bounding boxes; the region code is
//! the **only** location information allowed to leave the engine in
//! anonymized summaries — raw coordinates never cross that boundary.

use sha2::{Digest, Sha256};

use crate::geo::GeoPoint;

/// Grid size used when snapping coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Precision {
    /// 0.001° — roughly 100 m cells.
    High,
    /// 0.01° — roughly 1 km cells.
    #[default]
    Medium,
    /// 0.1° — roughly 10 km cells.
    Low,
}

impl Precision {
    /// Grid step in degrees.
    pub fn degrees(self) -> f64 {
        match self {
            Precision::High => 0.001,
            Precision::Medium => 0.01,
            Precision::Low => 0.1,
        }
    }
}

/// Coarse region label standing in for an exact coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RegionCode {
    /// Santiago centro.
    RmCentro,
    /// Las Condes / Providencia corridor.
    RmOriente,
    /// Valparaíso centro.
    ValCentro,
    #[default]
    Other,
}

impl RegionCode {
    pub fn as_str(self) -> &'static str {
        match self {
            RegionCode::RmCentro => "RM_CENTRO",
            RegionCode::RmOriente => "RM_ORIENTE",
            RegionCode::ValCentro => "VAL_CENTRO",
            RegionCode::Other => "OTHER",
        }
    }
}

/// Result of anonymizing one coordinate pair.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LocationHash {
    /// 16 hex chars of SHA-256 over the snapped coordinate string.
    pub hash: String,
    pub region_code: RegionCode,
    pub precision: Precision,
}

/// Buckets and hashes coordinates into privacy-preserving region codes.
///
/// Stateless; exists as a value so the engine can be constructed with its
/// dependencies explicitly rather than reaching for free functions.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocationAnonymizer;

impl LocationAnonymizer {
    /// Hash a point at the given precision.
    ///
    /// Deterministic: any two points in the same grid cell produce the same
    /// hash, and coarser precision merges more neighbours into one cell.
    #[must_use]
    pub fn hash(&self, point: GeoPoint, precision: Precision) -> LocationHash {
        let step = precision.degrees();
        let lat = (point.lat / step).round() * step;
        let lon = (point.lon / step).round() * step;

        // Fixed 6-decimal rendering keeps the hash stable across platforms.
        let canonical = format!("{lat:.6},{lon:.6}");
        let digest = Sha256::digest(canonical.as_bytes());
        let mut hash = String::with_capacity(16);
        for byte in digest.iter().take(8) {
            hash.push_str(&format!("{byte:02x}"));
        }

        LocationHash {
            hash,
            region_code: region_code(lat, lon),
            precision,
        }
    }
}

/// Assign a coarse region from fixed bounding boxes, first match wins.
fn region_code(lat: f64, lon: f64) -> RegionCode {
    if (-33.7..=-33.2).contains(&lat) && (-70.9..=-70.4).contains(&lon) {
        RegionCode::RmCentro
    } else if (-33.5..=-33.2).contains(&lat) && (-70.7..=-70.4).contains(&lon) {
        RegionCode::RmOriente
    } else if (-33.0..=-32.5).contains(&lat) && (-71.8..=-71.2).contains(&lon) {
        RegionCode::ValCentro
    } else {
        RegionCode::Other
    }
}
