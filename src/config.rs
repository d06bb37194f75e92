//! Run configuration
//!
//! Built once by the binary (or a caller) and passed explicitly to the
//! processor. Nothing here is global.

use crate::core::pixel_geometry::GeometryParams;
use crate::core::scheduler::{ImageBounds, SchedulerConfig};
use crate::io::writer::ContainerFormat;
use crate::types::{PixelReference, UngridError, UngridResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

static COORDINATE_PATTERN: OnceLock<Regex> = OnceLock::new();

/// `[x,y]` matcher, compiled on first use
fn coordinate_pattern() -> UngridResult<&'static Regex> {
    if let Some(pattern) = COORDINATE_PATTERN.get() {
        return Ok(pattern);
    }
    let pattern = Regex::new(r"^\[\s*(\d+)\s*,\s*(\d+)\s*\]$")
        .map_err(|e| UngridError::Config(format!("Invalid coordinate pattern: {}", e)))?;
    Ok(COORDINATE_PATTERN.get_or_init(|| pattern))
}

/// Image pixel written as `[x,y]` (column, row)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelCoordinate {
    pub x: usize,
    pub y: usize,
}

impl std::str::FromStr for PixelCoordinate {
    type Err = UngridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = coordinate_pattern()?.captures(s.trim()).ok_or_else(|| {
            UngridError::Config(format!("Invalid pixel coordinate '{}', expected [x,y]", s))
        })?;
        let parse = |i: usize| -> UngridResult<usize> {
            captures[i]
                .parse()
                .map_err(|e| UngridError::Config(format!("Invalid pixel coordinate '{}': {}", s, e)))
        };
        Ok(Self { x: parse(1)?, y: parse(2)? })
    }
}

impl std::fmt::Display for PixelCoordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{}]", self.x, self.y)
    }
}

/// Requested part of the image: a single pixel, or a window whose second
/// corner is exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsetWindow {
    pub start: PixelCoordinate,
    pub end: Option<PixelCoordinate>,
}

impl SubsetWindow {
    pub fn pixel(start: PixelCoordinate) -> Self {
        Self { start, end: None }
    }

    pub fn window(start: PixelCoordinate, end: PixelCoordinate) -> Self {
        Self { start, end: Some(end) }
    }

    /// Image bounds of the subset, checked against a (height, width) image
    pub fn resolve(&self, height: usize, width: usize) -> UngridResult<ImageBounds> {
        let (max_col, max_row) = match self.end {
            Some(end) => (end.x, end.y),
            None => (self.start.x + 1, self.start.y + 1),
        };
        if self.start.x >= max_col || self.start.y >= max_row {
            return Err(UngridError::Config(format!(
                "Subset corner {} must lie above and left of {}",
                self.start,
                PixelCoordinate { x: max_col, y: max_row }
            )));
        }
        if max_col > width || max_row > height {
            return Err(UngridError::Config(format!(
                "Subset {} to {} lies outside the {}x{} image",
                self.start,
                PixelCoordinate { x: max_col, y: max_row },
                width,
                height
            )));
        }
        ImageBounds::new(self.start.y, max_row, self.start.x, max_col)
    }
}

/// Everything needed for one ungridding run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub product: PathBuf,
    pub characterisation_file: Option<PathBuf>,
    pub fov_measurement_file: Option<PathBuf>,
    pub output: PathBuf,
    /// Image rows per band task
    pub rows_per_band: usize,
    /// Fraction of the IFOV reported as footprint extent
    pub ifov_reporting_extent: f64,
    /// Drop trailing image rows that no annotation covers
    pub trim: bool,
    pub pixel_reference: PixelReference,
    pub orthorectify: bool,
    /// DEM tile directory, SRTM tile or (with GDAL) raster
    pub dem: Option<PathBuf>,
    pub subset: Option<SubsetWindow>,
    pub workers: Option<usize>,
    pub timeout_s: u64,
    /// Channel whose FOV map is reported
    pub fov_channel: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            product: PathBuf::new(),
            characterisation_file: None,
            fov_measurement_file: None,
            output: PathBuf::from("output.zip"),
            rows_per_band: 1000,
            ifov_reporting_extent: 0.4,
            trim: true,
            pixel_reference: PixelReference::Corner,
            orthorectify: false,
            dem: None,
            subset: None,
            workers: None,
            timeout_s: 3600,
            fov_channel: "1200".to_string(),
        }
    }
}

impl RunConfig {
    /// Reject configurations that cannot run, before any computation
    pub fn validate(&self) -> UngridResult<()> {
        if self.product.as_os_str().is_empty() {
            return Err(UngridError::Config("No input product given".to_string()));
        }
        if self.output.as_os_str().is_empty() {
            return Err(UngridError::Config("No output file given".to_string()));
        }
        let format = ContainerFormat::from_path(&self.output);
        if !format.is_available() {
            return Err(UngridError::Config(format!(
                "{} output {} needs the netcdf feature; use a .zip output instead",
                format,
                self.output.display()
            )));
        }
        if self.rows_per_band == 0 {
            return Err(UngridError::Config("Rows per band must be at least 1".to_string()));
        }
        if !(self.ifov_reporting_extent > 0.0 && self.ifov_reporting_extent <= 1.0) {
            return Err(UngridError::Config(format!(
                "IFOV reporting extent must be in (0, 1], got {}",
                self.ifov_reporting_extent
            )));
        }
        if self.orthorectify && self.dem.is_none() {
            return Err(UngridError::Config(
                "Orthorectification requested without a DEM".to_string(),
            ));
        }
        if self.timeout_s == 0 {
            return Err(UngridError::Config("Timeout must be positive".to_string()));
        }
        if self.workers == Some(0) {
            return Err(UngridError::Config("Worker count must be at least 1".to_string()));
        }
        if let Some(SubsetWindow { start, end: Some(end) }) = self.subset {
            if start.x >= end.x || start.y >= end.y {
                return Err(UngridError::Config(format!(
                    "Subset corner {} must lie above and left of {}",
                    start, end
                )));
            }
        }
        Ok(())
    }

    pub fn geometry_params(&self) -> GeometryParams {
        GeometryParams::default().with_reporting_extent(self.ifov_reporting_extent)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            band_height: self.rows_per_band,
            workers: self.workers,
            timeout: Duration::from_secs(self.timeout_s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RunConfig {
        RunConfig {
            product: PathBuf::from("product.xml"),
            ..RunConfig::default()
        }
    }

    #[test]
    fn test_parse_coordinate() {
        let c: PixelCoordinate = "[12, 340]".parse().unwrap();
        assert_eq!(c, PixelCoordinate { x: 12, y: 340 });
        assert_eq!(c.to_string(), "[12,340]");
        assert!("12,340".parse::<PixelCoordinate>().is_err());
        assert!("[-1,3]".parse::<PixelCoordinate>().is_err());
        assert!("[1,2,3]".parse::<PixelCoordinate>().is_err());
    }

    #[test]
    fn test_coordinate_pattern_compiled_once() {
        let first = coordinate_pattern().unwrap() as *const Regex;
        for i in 0..50 {
            let c: PixelCoordinate = format!("[{}, {}]", i, 2 * i).parse().unwrap();
            assert_eq!(c, PixelCoordinate { x: i, y: 2 * i });
        }
        assert!(" [ 7 ,8 ] ".parse::<PixelCoordinate>().is_ok());
        assert!(std::ptr::eq(first, coordinate_pattern().unwrap()));
    }

    #[test]
    fn test_single_pixel_subset() {
        let subset = SubsetWindow::pixel(PixelCoordinate { x: 5, y: 7 });
        let bounds = subset.resolve(100, 512).unwrap();
        assert_eq!((bounds.min_row, bounds.max_row), (7, 8));
        assert_eq!((bounds.min_col, bounds.max_col), (5, 6));
    }

    #[test]
    fn test_window_subset() {
        let subset = SubsetWindow::window(PixelCoordinate { x: 0, y: 0 }, PixelCoordinate { x: 512, y: 64 });
        let bounds = subset.resolve(64, 512).unwrap();
        assert_eq!(bounds.rows(), 64);
        assert_eq!(bounds.cols(), 512);
    }

    #[test]
    fn test_subset_outside_image() {
        let subset = SubsetWindow::window(PixelCoordinate { x: 0, y: 0 }, PixelCoordinate { x: 513, y: 10 });
        assert!(matches!(subset.resolve(64, 512), Err(UngridError::Config(_))));
        let pixel = SubsetWindow::pixel(PixelCoordinate { x: 3, y: 64 });
        assert!(pixel.resolve(64, 512).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(config().validate().is_ok());

        let mut c = config();
        c.rows_per_band = 0;
        assert!(c.validate().is_err());

        let mut c = config();
        c.ifov_reporting_extent = 1.5;
        assert!(c.validate().is_err());

        let mut c = config();
        c.orthorectify = true;
        assert!(c.validate().is_err());
        c.dem = Some(PathBuf::from("srtm"));
        assert!(c.validate().is_ok());

        let mut c = config();
        c.subset = Some(SubsetWindow::window(
            PixelCoordinate { x: 10, y: 10 },
            PixelCoordinate { x: 5, y: 20 },
        ));
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_output_format_checked() {
        let mut c = config();
        c.output = PathBuf::from("geolocation.h5");
        assert_eq!(c.validate().is_ok(), cfg!(feature = "netcdf"));
        c.output = PathBuf::from("geolocation.nc");
        assert_eq!(c.validate().is_ok(), cfg!(feature = "netcdf"));
        c.output = PathBuf::from("geolocation.zip");
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_scheduler_config() {
        let mut c = config();
        c.rows_per_band = 250;
        c.workers = Some(3);
        let s = c.scheduler_config();
        assert_eq!(s.band_height, 250);
        assert_eq!(s.worker_count(), 3);
        assert_eq!(s.timeout, Duration::from_secs(3600));
        assert_eq!(c.geometry_params().reporting_extent, 0.4);
    }
}
