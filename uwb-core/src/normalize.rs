//! Result normalizer: raw radio measurements to one canonical sample shape.

use std::f64::consts::FRAC_PI_2;

use crate::identity::PeerId;
use crate::radio::{RawMeasurement, Vec3};

/// Latest measurement for one peer. Absent fields were not reported; they are not zero.
#[derive(Debug, Clone, PartialEq)]
pub struct RangingSample {
    pub peer_id: PeerId,
    pub distance_m: Option<f64>,
    pub azimuth_rad: Option<f64>,
    pub elevation_rad: Option<f64>,
    pub direction: Option<Vec3>,
    pub horizontal_angle_rad: Option<f64>,
}

/// Azimuth from a unit direction vector: `asin(x)`.
pub fn azimuth_from_direction(d: Vec3) -> f64 {
    d.x.clamp(-1.0, 1.0).asin()
}

/// Elevation from a unit direction vector: `atan2(z, y) + π/2`.
pub fn elevation_from_direction(d: Vec3) -> f64 {
    d.z.atan2(d.y) + FRAC_PI_2
}

fn finite(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite())
}

/// Normalize one raw measurement. Returns `None` when nothing usable was reported.
///
/// Directly reported azimuth/elevation pass through untouched; only missing
/// angles are derived from the direction vector.
pub fn normalize(peer_id: &PeerId, raw: &RawMeasurement) -> Option<RangingSample> {
    let distance = finite(raw.distance);
    let direction = raw
        .direction
        .filter(|d| d.x.is_finite() && d.y.is_finite() && d.z.is_finite());
    let azimuth = finite(raw.azimuth).or_else(|| direction.map(azimuth_from_direction));
    let elevation = finite(raw.elevation).or_else(|| direction.map(elevation_from_direction));
    let horizontal_angle = finite(raw.horizontal_angle);

    if distance.is_none()
        && direction.is_none()
        && azimuth.is_none()
        && elevation.is_none()
        && horizontal_angle.is_none()
    {
        return None;
    }
    Some(RangingSample {
        peer_id: peer_id.clone(),
        distance_m: distance,
        azimuth_rad: azimuth,
        elevation_rad: elevation,
        direction,
        horizontal_angle_rad: horizontal_angle,
    })
}
