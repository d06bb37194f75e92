//! Per-pixel geolocation, time and FOV interpolation from sparse tie points
//!
//! Follows the instrument pixel coordinate methodology: the resolved
//! instrument (scan, pixel) is placed in the image x/y frame through the
//! scan/pixel x-y annotation, then latitude and longitude are interpolated
//! bilinearly from the geolocation tie-point grid. Acquisition time is derived
//! from the scan and pixel counters relative to the first annotated scan.

use crate::core::annotation_index::{ScanNumberTable, ScanPixelIndex};
use crate::core::pixel_geometry::PixelProjection;
use crate::io::product::ProductReader;
use crate::types::{
    AdsGroup, PixelRecord, PixelReference, PixelValidity, UngridError, UngridResult, View,
    ViewSample, GRANULE_ROWS, MIN_RESOLVABLE_SCAN, SECONDS_PER_DAY,
};
use std::sync::Arc;

pub const NADIR_SCAN_PIX_ADS: &str = "NADIR_VIEW_SCAN_PIX_NUM_ADS";
pub const FORWARD_SCAN_PIX_ADS: &str = "FWARD_VIEW_SCAN_PIX_NUM_ADS";
pub const SCAN_PIXEL_XY_ADS: &str = "SCAN_PIXEL_X_AND_Y_ADS";
pub const GEOLOCATION_ADS: &str = "GEOLOCATION_ADS";

/// Instrument timing used to derive acquisition times
#[derive(Debug, Clone, Copy)]
pub struct TimingParams {
    /// Duration of one instrument scan (s)
    pub scan_period_s: f64,
    /// Sampling interval between instrument pixels (s)
    pub pixel_period_s: f64,
}

impl Default for TimingParams {
    fn default() -> Self {
        Self {
            scan_period_s: 0.15,
            pixel_period_s: 0.15 / 2000.0,
        }
    }
}

/// Position of `value` on an ascending axis: lower index and fraction
fn bracket(axis: &[f64], value: f64) -> Option<(usize, f64)> {
    let n = axis.len();
    if n == 0 || !value.is_finite() {
        return None;
    }
    if n == 1 {
        return if value == axis[0] { Some((0, 0.0)) } else { None };
    }
    if value < axis[0] || value > axis[n - 1] {
        return None;
    }
    let upper = axis.partition_point(|&v| v <= value).clamp(1, n - 1);
    let lower = upper - 1;
    let span = axis[upper] - axis[lower];
    let fraction = if span > 0.0 { (value - axis[lower]) / span } else { 0.0 };
    Some((lower, fraction))
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

fn check_ascending(name: &str, axis: &[f64]) -> UngridResult<()> {
    if axis.windows(2).any(|w| w[1] <= w[0]) {
        return Err(UngridError::Metadata(format!(
            "{} must be strictly ascending",
            name
        )));
    }
    Ok(())
}

/// One granule of the scan/pixel x-y annotation
#[derive(Debug, Clone)]
struct ScanPixelRecord {
    first_scan: i32,
    scan_y: f64,
    pix_x: Vec<f64>,
    pix_y: Vec<f64>,
}

/// Image x/y coordinates of instrument pixels, per granule
#[derive(Debug, Clone)]
pub struct ScanPixelTable {
    tie_pixels: Vec<f64>,
    records: Vec<ScanPixelRecord>,
    /// Instrument scan number of the first annotated scan
    first_scan: i32,
    /// Time of the first annotated scan, MJD2000 days
    first_scan_time: f64,
}

impl ScanPixelTable {
    pub fn from_group(group: &AdsGroup) -> UngridResult<Self> {
        let tie_pixels = group.attribute("tie_pix_num")?.to_vec();
        check_ascending("tie_pix_num", &tie_pixels)?;

        let first = group.get(0).ok_or_else(|| {
            UngridError::Metadata(format!("{} has no records", group.name))
        })?;
        let first_scan = first.scalar("instr_scan_num")? as i32;
        let first_scan_time = first.scalar("dsr_time")?;

        let mut records = Vec::with_capacity(group.len());
        for (index, record) in group.records.iter().enumerate() {
            let pix_x = record.attribute("pix_x")?.to_vec();
            let pix_y = record.attribute("pix_y")?.to_vec();
            if pix_x.len() != tie_pixels.len() || pix_y.len() != tie_pixels.len() {
                return Err(UngridError::Metadata(format!(
                    "{} record {}: expected {} tie pixels, found {} x / {} y",
                    group.name,
                    index,
                    tie_pixels.len(),
                    pix_x.len(),
                    pix_y.len()
                )));
            }
            records.push(ScanPixelRecord {
                first_scan: record.scalar("instr_scan_num")? as i32,
                scan_y: record.scalar("img_scan_y")?,
                pix_x,
                pix_y,
            });
        }

        Ok(Self {
            tie_pixels,
            records,
            first_scan,
            first_scan_time,
        })
    }

    pub fn first_scan(&self) -> i32 {
        self.first_scan
    }

    pub fn first_scan_time(&self) -> f64 {
        self.first_scan_time
    }

    pub fn covered_rows(&self) -> usize {
        self.records.len() * GRANULE_ROWS
    }

    /// Image (x, y) in km of a fractional instrument pixel within record `k`
    fn record_xy(&self, k: usize, pixel: f64) -> Option<(f64, f64)> {
        let record = self.records.get(k)?;
        let (i, t) = bracket(&self.tie_pixels, pixel)?;
        let j = (i + 1).min(self.tie_pixels.len() - 1);
        let x = lerp(record.pix_x[i], record.pix_x[j], t);
        let y = record.scan_y + lerp(record.pix_y[i], record.pix_y[j], t);
        Some((x, y))
    }

    /// Image (x, y) in km of an instrument scan and fractional pixel
    pub fn image_xy(&self, scan: i32, pixel: f64) -> Option<(f64, f64)> {
        if scan < self.first_scan {
            return None;
        }
        let relative = (scan - self.first_scan) as usize;
        let k = relative / GRANULE_ROWS;
        if k >= self.records.len() {
            return None;
        }
        let scans_into = (scan - self.records[k].first_scan) as f64;
        let u = scans_into / GRANULE_ROWS as f64;

        let (x0, y0) = self.record_xy(k, pixel)?;
        if u == 0.0 {
            return Some((x0, y0));
        }
        if k + 1 < self.records.len() {
            let (x1, y1) = self.record_xy(k + 1, pixel)?;
            Some((lerp(x0, x1, u), lerp(y0, y1, u)))
        } else if k > 0 {
            // last record: continue the spacing of the previous granule
            let (xp, yp) = self.record_xy(k - 1, pixel)?;
            Some((x0 + (x0 - xp) * u, y0 + (y0 - yp) * u))
        } else {
            Some((x0, y0))
        }
    }
}

/// Latitude/longitude tie-point grid indexed by image y (rows) and x (columns)
#[derive(Debug, Clone)]
pub struct GeolocationTable {
    /// Cached ascending `img_scan_y` of every record
    scan_y: Vec<f64>,
    tie_x: Vec<f64>,
    latitudes: Vec<Vec<f64>>,
    longitudes: Vec<Vec<f64>>,
}

impl GeolocationTable {
    pub fn from_group(group: &AdsGroup) -> UngridResult<Self> {
        let tie_x = group.attribute("tie_pt_x")?.to_vec();
        check_ascending("tie_pt_x", &tie_x)?;

        let mut scan_y = Vec::with_capacity(group.len());
        let mut latitudes = Vec::with_capacity(group.len());
        let mut longitudes = Vec::with_capacity(group.len());

        for (index, record) in group.records.iter().enumerate() {
            let lat = record.attribute("tie_pt_lat")?.to_vec();
            let lon = record.attribute("tie_pt_long")?.to_vec();
            if lat.len() != tie_x.len() || lon.len() != tie_x.len() {
                return Err(UngridError::Metadata(format!(
                    "{} record {}: expected {} tie points",
                    group.name,
                    index,
                    tie_x.len()
                )));
            }
            scan_y.push(record.scalar("img_scan_y")?);
            latitudes.push(lat);
            longitudes.push(lon);
        }
        check_ascending("GEOLOCATION_ADS img_scan_y", &scan_y)?;

        Ok(Self {
            scan_y,
            tie_x,
            latitudes,
            longitudes,
        })
    }

    pub fn scan_y(&self) -> &[f64] {
        &self.scan_y
    }

    pub fn covered_rows(&self) -> usize {
        self.scan_y.len() * GRANULE_ROWS
    }

    /// Bilinear latitude/longitude at image coordinate (x, y)
    pub fn interpolate(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let (r, ty) = bracket(&self.scan_y, y)?;
        let (c, tx) = bracket(&self.tie_x, x)?;
        let r1 = (r + 1).min(self.scan_y.len() - 1);
        let c1 = (c + 1).min(self.tie_x.len() - 1);

        let lat = lerp(
            lerp(self.latitudes[r][c], self.latitudes[r][c1], tx),
            lerp(self.latitudes[r1][c], self.latitudes[r1][c1], tx),
            ty,
        );

        // unwrap the corners around the first one before blending
        let reference = self.longitudes[r][c];
        let unwrap = |lon: f64| {
            let mut d = lon - reference;
            if d > 180.0 {
                d -= 360.0;
            } else if d < -180.0 {
                d += 360.0;
            }
            reference + d
        };
        let lon = lerp(
            lerp(unwrap(self.longitudes[r][c]), unwrap(self.longitudes[r][c1]), tx),
            lerp(unwrap(self.longitudes[r1][c]), unwrap(self.longitudes[r1][c1]), tx),
            ty,
        );

        Some((lat, normalize_longitude(lon)))
    }
}

/// Wrap a longitude into (-180, 180]
pub fn normalize_longitude(lon: f64) -> f64 {
    let mut wrapped = (lon + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == -180.0 {
        wrapped = 180.0;
    }
    wrapped
}

/// All annotation tables needed for ungridding, extracted once per run
#[derive(Debug, Clone)]
pub struct AnnotationSet {
    pub nadir: ScanNumberTable,
    pub forward: ScanNumberTable,
    pub scan_pixel: ScanPixelTable,
    pub geolocation: GeolocationTable,
}

impl AnnotationSet {
    pub fn from_reader(reader: &dyn ProductReader) -> UngridResult<Self> {
        log::info!("Extracting annotation data sets");
        let set = Self {
            nadir: ScanNumberTable::from_group(reader.ads_group(NADIR_SCAN_PIX_ADS)?)?,
            forward: ScanNumberTable::from_group(reader.ads_group(FORWARD_SCAN_PIX_ADS)?)?,
            scan_pixel: ScanPixelTable::from_group(reader.ads_group(SCAN_PIXEL_XY_ADS)?)?,
            geolocation: GeolocationTable::from_group(reader.ads_group(GEOLOCATION_ADS)?)?,
        };
        log::debug!(
            "First annotated scan {} at MJD2000 {:.8}",
            set.scan_pixel.first_scan(),
            set.scan_pixel.first_scan_time()
        );
        Ok(set)
    }

    /// Image rows for which every annotation group has a record
    pub fn covered_rows(&self) -> usize {
        [
            self.scan_pixel.covered_rows(),
            self.geolocation.covered_rows(),
            self.nadir.covered_rows(),
            self.forward.covered_rows(),
        ]
        .into_iter()
        .min()
        .unwrap_or(0)
    }

    fn scan_numbers(&self, view: View) -> &ScanNumberTable {
        match view {
            View::Nadir => &self.nadir,
            View::Forward => &self.forward,
        }
    }
}

/// Ungrids single pixels; shared read-only by all row bands
#[derive(Debug, Clone)]
pub struct RowInterpolator {
    annotations: Arc<AnnotationSet>,
    projection: Arc<PixelProjection>,
    timing: TimingParams,
    reference: PixelReference,
}

impl RowInterpolator {
    pub fn new(
        annotations: Arc<AnnotationSet>,
        projection: Arc<PixelProjection>,
        timing: TimingParams,
        reference: PixelReference,
    ) -> Self {
        Self {
            annotations,
            projection,
            timing,
            reference,
        }
    }

    pub fn annotations(&self) -> &AnnotationSet {
        &self.annotations
    }

    /// Both views of image pixel (`row`, `col`)
    pub fn ungrid(&self, row: usize, col: usize) -> PixelRecord {
        let nadir = self.ungrid_view(View::Nadir, row, col);
        let forward = self.ungrid_view(View::Forward, row, col);
        PixelRecord::from_views(nadir, forward)
    }

    fn ungrid_view(&self, view: View, row: usize, col: usize) -> ViewSample {
        match self.annotations.scan_numbers(view).resolve(row, col) {
            Some(index) => self.ungrid_pixel(view, index, col),
            None => ViewSample::invalid(PixelValidity::NoData),
        }
    }

    /// Geolocation, time and FOV for a resolved instrument coordinate
    pub fn ungrid_pixel(&self, view: View, index: ScanPixelIndex, col: usize) -> ViewSample {
        if index.scan == 0 {
            return ViewSample::invalid(PixelValidity::NoData);
        }
        if index.scan < MIN_RESOLVABLE_SCAN {
            return ViewSample::invalid(PixelValidity::ScanBelowMinimum);
        }

        let footprint = match self.projection.get(col) {
            Some(entry) => entry.for_view(view),
            None => return ViewSample::invalid(PixelValidity::NoData),
        };

        let pixel = f64::from(index.pixel) + self.reference.offset();
        let scan_pixel = &self.annotations.scan_pixel;
        let (x, y) = match scan_pixel.image_xy(index.scan, pixel) {
            Some(xy) => xy,
            None => return ViewSample::invalid(PixelValidity::NoData),
        };
        let (latitude, longitude) = match self.annotations.geolocation.interpolate(x, y) {
            Some(position) => position,
            None => return ViewSample::invalid(PixelValidity::NoData),
        };

        let elapsed = f64::from(index.scan - scan_pixel.first_scan()) * self.timing.scan_period_s
            + pixel * self.timing.pixel_period_s;

        ViewSample {
            latitude,
            longitude,
            time: scan_pixel.first_scan_time() + elapsed / SECONDS_PER_DAY,
            fov_across: footprint.across,
            fov_along: footprint.along,
            validity: PixelValidity::Valid,
        }
    }
}
