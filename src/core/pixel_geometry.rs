//! Constant-altitude pixel footprint model
//!
//! The instrument scans a cone whose axis is tilted forward by the cone
//! half-angle, so the nadir view looks straight down at the centre of the
//! swath and the forward view looks ahead at twice the half-angle. Footprints
//! are computed for a spherical earth and a fixed platform altitude, once per
//! run, for every output column.

use crate::types::{UngridError, UngridResult, View};
use serde::{Deserialize, Serialize};

/// Parameters of the footprint model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeometryParams {
    /// Platform altitude above the sphere (km)
    pub altitude_km: f64,
    /// Radius of the spherical earth (km)
    pub earth_radius_km: f64,
    /// Half-angle of the scan cone (degrees)
    pub cone_half_angle_deg: f64,
    /// Full angular IFOV of one detector sample (mrad)
    pub ifov_mrad: f64,
    /// Fraction of the IFOV reported as footprint extent
    pub reporting_extent: f64,
    /// Ground spacing of image columns (km)
    pub pixel_spacing_km: f64,
}

impl Default for GeometryParams {
    fn default() -> Self {
        Self {
            altitude_km: 799.8,
            earth_radius_km: 6371.0,
            cone_half_angle_deg: 23.45,
            ifov_mrad: 1.25,
            reporting_extent: 0.4,
            pixel_spacing_km: 1.0,
        }
    }
}

impl GeometryParams {
    pub fn with_reporting_extent(mut self, reporting_extent: f64) -> Self {
        self.reporting_extent = reporting_extent;
        self
    }

    fn validate(&self) -> UngridResult<()> {
        if !(self.reporting_extent > 0.0 && self.reporting_extent <= 1.0) {
            return Err(UngridError::Config(format!(
                "IFOV reporting extent must be in (0, 1], got {}",
                self.reporting_extent
            )));
        }
        if self.altitude_km <= 0.0 || self.earth_radius_km <= 0.0 || self.ifov_mrad <= 0.0 {
            return Err(UngridError::Config(
                "Altitude, earth radius and IFOV must be positive".to_string(),
            ));
        }
        if self.pixel_spacing_km <= 0.0 {
            return Err(UngridError::Config("Pixel spacing must be positive".to_string()));
        }
        Ok(())
    }
}

/// Ground footprint extent (km)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FootprintExtent {
    pub across: f64,
    pub along: f64,
}

/// Footprints of both views for one output column
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelGeometryEntry {
    pub nadir: FootprintExtent,
    pub forward: FootprintExtent,
}

impl PixelGeometryEntry {
    pub fn for_view(&self, view: View) -> FootprintExtent {
        match view {
            View::Nadir => self.nadir,
            View::Forward => self.forward,
        }
    }
}

/// Column-indexed footprint table
#[derive(Debug, Clone)]
pub struct PixelProjection {
    entries: Vec<PixelGeometryEntry>,
}

/// Intersection of a look direction with the sphere
struct GroundHit {
    /// Across-track arc distance from the sub-satellite track (km)
    across_km: f64,
    slant_range_km: f64,
    /// Angle between the look ray and the local vertical (rad)
    incidence: f64,
    /// Direction of the incidence plane on the ground, from along-track (rad)
    ground_azimuth: f64,
}

impl PixelProjection {
    /// Build the table for `width` image columns
    pub fn build(params: &GeometryParams, width: usize) -> UngridResult<Self> {
        params.validate()?;
        log::info!(
            "Building pixel projection for {} columns (reporting extent {})",
            width,
            params.reporting_extent
        );

        let mut entries = Vec::with_capacity(width);
        for col in 0..width {
            let across_km = (col as f64 + 0.5 - width as f64 / 2.0) * params.pixel_spacing_km;
            entries.push(PixelGeometryEntry {
                nadir: Self::footprint(params, View::Nadir, across_km)?,
                forward: Self::footprint(params, View::Forward, across_km)?,
            });
        }

        Ok(Self { entries })
    }

    pub fn get(&self, col: usize) -> Option<&PixelGeometryEntry> {
        self.entries.get(col)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn footprint(params: &GeometryParams, view: View, across_km: f64) -> UngridResult<FootprintExtent> {
        let psi = Self::solve_scan_angle(params, view, across_km)?;
        let hit = Self::intersect(params, view, psi)?;

        let delta = params.reporting_extent * params.ifov_mrad * 1e-3;
        let in_plane = hit.slant_range_km * delta / hit.incidence.cos();
        let cross_plane = hit.slant_range_km * delta;

        let (sin_g, cos_g) = hit.ground_azimuth.sin_cos();
        let along = (in_plane.powi(2) * cos_g.powi(2) + cross_plane.powi(2) * sin_g.powi(2)).sqrt();
        let across = (in_plane.powi(2) * sin_g.powi(2) + cross_plane.powi(2) * cos_g.powi(2)).sqrt();

        Ok(FootprintExtent { across, along })
    }

    /// Bisect the offset from the view centre that reaches `across_km`
    fn solve_scan_angle(params: &GeometryParams, view: View, across_km: f64) -> UngridResult<f64> {
        let half_pi = std::f64::consts::FRAC_PI_2;
        let mut lo = -half_pi;
        let mut hi = half_pi;

        let lo_across = Self::intersect(params, view, lo)?.across_km;
        let hi_across = Self::intersect(params, view, hi)?.across_km;
        if across_km <= lo_across {
            return Ok(lo);
        }
        if across_km >= hi_across {
            return Ok(hi);
        }

        for _ in 0..80 {
            let mid = 0.5 * (lo + hi);
            if Self::intersect(params, view, mid)?.across_km < across_km {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        Ok(0.5 * (lo + hi))
    }

    /// Look direction for offset `psi` from the view centre, intersected with the sphere.
    ///
    /// Frame: x along-track forward, y across-track, z towards the earth centre.
    fn intersect(params: &GeometryParams, view: View, psi: f64) -> UngridResult<GroundHit> {
        let kappa = params.cone_half_angle_deg.to_radians();
        let (sk, ck) = kappa.sin_cos();

        let scan_azimuth = match view {
            View::Nadir => std::f64::consts::PI - psi,
            View::Forward => psi,
        };
        let (sp, cp) = scan_azimuth.sin_cos();

        // axis (sk, 0, ck), in-plane basis (ck, 0, -sk), out-of-plane (0, 1, 0)
        let look = [ck * sk + sk * cp * ck, sk * sp, ck * ck - sk * cp * sk];

        let re = params.earth_radius_km;
        let orbit_radius = re + params.altitude_km;

        // Earth-centred frame with z up through the satellite
        let dir = [look[0], look[1], -look[2]];
        let b = orbit_radius * dir[2];
        let disc = b * b - (orbit_radius * orbit_radius - re * re);
        if disc < 0.0 {
            return Err(UngridError::Processing(format!(
                "{} view look direction at offset {:.4} rad misses the earth",
                view, psi
            )));
        }
        let slant = -b - disc.sqrt();
        let ground = [
            slant * dir[0],
            slant * dir[1],
            orbit_radius + slant * dir[2],
        ];

        let normal = [ground[0] / re, ground[1] / re, ground[2] / re];
        let cos_inc = -(dir[0] * normal[0] + dir[1] * normal[1] + dir[2] * normal[2]);
        let incidence = cos_inc.clamp(-1.0, 1.0).acos();

        // horizontal projection of the ray at the ground point
        let back = [-dir[0], -dir[1], -dir[2]];
        let horizontal = [
            back[0] - cos_inc * normal[0],
            back[1] - cos_inc * normal[1],
            back[2] - cos_inc * normal[2],
        ];
        let along_axis = Self::tangent([1.0, 0.0, 0.0], normal);
        let across_axis = Self::tangent([0.0, 1.0, 0.0], normal);
        let h_along = Self::dot(horizontal, along_axis);
        let h_across = Self::dot(horizontal, across_axis);
        let ground_azimuth = if h_along.abs() < 1e-12 && h_across.abs() < 1e-12 {
            0.0
        } else {
            h_across.atan2(h_along)
        };

        Ok(GroundHit {
            across_km: re * (ground[1] / re).clamp(-1.0, 1.0).asin(),
            slant_range_km: slant,
            incidence,
            ground_azimuth,
        })
    }

    fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
        a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
    }

    fn tangent(axis: [f64; 3], normal: [f64; 3]) -> [f64; 3] {
        let d = Self::dot(axis, normal);
        let t = [axis[0] - d * normal[0], axis[1] - d * normal[1], axis[2] - d * normal[2]];
        let n = Self::dot(t, t).sqrt();
        [t[0] / n, t[1] / n, t[2] / n]
    }
}
