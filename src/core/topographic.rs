//! Terrain-height orthorectification of ungridded positions
//!
//! Ungridded positions lie on the ellipsoid. A pixel imaging terrain at
//! height `h` is moved towards the satellite by `h / tan(elevation)` along the
//! line-of-sight azimuth, with the elevation corrected for atmospheric
//! refraction.

use crate::core::ephemeris::Ephemeris;
use crate::io::dem::DemAccessor;
use crate::types::{PixelRecord, UngridResult, View};
use std::sync::Arc;

pub const WGS84_A: f64 = 6_378_137.0;
pub const WGS84_F: f64 = 1.0 / 298.257_223_563;

/// Heights outside (MIN, MAX) metres are treated as implausible
pub const MIN_PLAUSIBLE_HEIGHT: f64 = -500.0;
pub const MAX_PLAUSIBLE_HEIGHT: f64 = 9000.0;

/// Standard atmosphere used by the refraction model
const REFRACTION_PRESSURE_PA: f64 = 101_000.0;
const REFRACTION_TEMPERATURE_K: f64 = 283.0;

/// Earth-fixed satellite position source
pub trait SatelliteTrack: Send + Sync {
    fn position_ecef(&self, mjd2000: f64) -> UngridResult<[f64; 3]>;
}

impl SatelliteTrack for Ephemeris {
    fn position_ecef(&self, mjd2000: f64) -> UngridResult<[f64; 3]> {
        Ephemeris::position_ecef(self, mjd2000)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkipReason {
    InvalidGeolocation,
    ImplausibleHeight(f64),
    SatelliteUnavailable,
    BelowHorizon,
}

/// Result of correcting one view of a pixel
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CorrectionOutcome {
    /// `terrain_fallback` is set when no DEM height was available and sea
    /// level was used instead
    Applied {
        delta_lat: f64,
        delta_lon: f64,
        terrain_fallback: bool,
    },
    Skipped(SkipReason),
}

pub struct TopographicCorrector {
    track: Arc<dyn SatelliteTrack>,
    dem: Arc<dyn DemAccessor>,
}

impl TopographicCorrector {
    pub fn new(track: Arc<dyn SatelliteTrack>, dem: Arc<dyn DemAccessor>) -> Self {
        Self { track, dem }
    }

    /// Correct both views of a record in place
    pub fn correct(&self, record: &mut PixelRecord) -> [CorrectionOutcome; 2] {
        [
            self.correct_view(record, View::Nadir),
            self.correct_view(record, View::Forward),
        ]
    }

    pub fn correct_view(&self, record: &mut PixelRecord, view: View) -> CorrectionOutcome {
        let sample = record.view(view);
        if !sample.validity.is_valid() {
            return CorrectionOutcome::Skipped(SkipReason::InvalidGeolocation);
        }
        let (lat, lon) = (sample.latitude, sample.longitude);

        let (height, terrain_fallback) = match self.dem.height_at(lat, lon) {
            Ok(h) => (h, false),
            Err(e) => {
                log::debug!("Terrain height unavailable at ({:.5}, {:.5}), using 0 m: {}", lat, lon, e);
                (0.0, true)
            }
        };
        if !(height > MIN_PLAUSIBLE_HEIGHT && height < MAX_PLAUSIBLE_HEIGHT) {
            return CorrectionOutcome::Skipped(SkipReason::ImplausibleHeight(height));
        }

        let satellite = match self.track.position_ecef(sample.time) {
            Ok(p) => p,
            Err(e) => {
                log::debug!("No satellite position for {} view at {:.8}: {}", view, sample.time, e);
                return CorrectionOutcome::Skipped(SkipReason::SatelliteUnavailable);
            }
        };

        let (azimuth, elevation) = azimuth_elevation(lat, lon, &satellite);
        if elevation <= 0.0 {
            return CorrectionOutcome::Skipped(SkipReason::BelowHorizon);
        }
        let elevation = elevation + refraction_correction(elevation);

        let (delta_lat, delta_lon) = horizontal_shift(lat, height, azimuth, elevation);
        record.shift_position(view, delta_lat, delta_lon);
        CorrectionOutcome::Applied {
            delta_lat,
            delta_lon,
            terrain_fallback,
        }
    }
}

/// Convert lat/lon/height (degrees, metres) to ECEF coordinates
pub fn geodetic_to_ecef(lat: f64, lon: f64, height: f64) -> [f64; 3] {
    let e2 = WGS84_F * (2.0 - WGS84_F);
    let lat_rad = lat.to_radians();
    let lon_rad = lon.to_radians();

    let n = WGS84_A / (1.0 - e2 * lat_rad.sin().powi(2)).sqrt();

    let x = (n + height) * lat_rad.cos() * lon_rad.cos();
    let y = (n + height) * lat_rad.cos() * lon_rad.sin();
    let z = (n * (1.0 - e2) + height) * lat_rad.sin();

    [x, y, z]
}

/// Azimuth (from north, clockwise) and elevation of `target` seen from the
/// ellipsoid point (lat, lon), radians
pub fn azimuth_elevation(lat: f64, lon: f64, target: &[f64; 3]) -> (f64, f64) {
    let origin = geodetic_to_ecef(lat, lon, 0.0);
    let d = [target[0] - origin[0], target[1] - origin[1], target[2] - origin[2]];

    let (sin_lat, cos_lat) = lat.to_radians().sin_cos();
    let (sin_lon, cos_lon) = lon.to_radians().sin_cos();

    let east = -sin_lon * d[0] + cos_lon * d[1];
    let north = -sin_lat * cos_lon * d[0] - sin_lat * sin_lon * d[1] + cos_lat * d[2];
    let up = cos_lat * cos_lon * d[0] + cos_lat * sin_lon * d[1] + sin_lat * d[2];

    let horizontal = (east * east + north * north).sqrt();
    (east.atan2(north), up.atan2(horizontal))
}

/// Atmospheric refraction to add to a geometric elevation (radians)
pub fn refraction_correction(elevation: f64) -> f64 {
    let el_deg = elevation.to_degrees();
    let arcmin = 1.02 / (el_deg + 10.3 / (el_deg + 5.11)).to_radians().tan();
    let scale = (REFRACTION_PRESSURE_PA / 101_000.0) * (283.0 / REFRACTION_TEMPERATURE_K);
    (arcmin.max(0.0) * scale / 60.0).to_radians()
}

/// Latitude/longitude shift (degrees) for terrain at `height` metres seen
/// along `azimuth` at `elevation` (radians)
pub fn horizontal_shift(lat: f64, height: f64, azimuth: f64, elevation: f64) -> (f64, f64) {
    let e2 = WGS84_F * (2.0 - WGS84_F);
    let phi = lat.to_radians();
    let w = 1.0 - e2 * phi.sin().powi(2);
    let prime_vertical = WGS84_A / w.sqrt();
    let meridional = WGS84_A * (1.0 - e2) / w.powf(1.5);

    let ground = height / elevation.tan();
    let dy = ground * azimuth.cos();
    let dx = ground * azimuth.sin();

    let delta_lat = dy.to_degrees() / meridional;
    let delta_lon = (dx / phi.cos()).to_degrees() / prime_vertical;
    (delta_lat, delta_lon)
}
