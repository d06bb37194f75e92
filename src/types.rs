use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Image rows covered by one annotation record
pub const GRANULE_ROWS: usize = 32;

/// Smallest instrument scan number that can be resolved to a granule
pub const MIN_RESOLVABLE_SCAN: i32 = 32;

/// Fill value written when no geolocation could be derived
pub const NO_DATA_FILL: f64 = -999999.0;

/// Fill value written when the resolved scan number is below 32
pub const SCAN_BELOW_MINIMUM_FILL: f64 = -888888.0;

/// Number of numeric fields carried by one pixel record
pub const PIXEL_FIELDS: usize = 10;

/// Seconds per day, used for MJD2000 conversions
pub const SECONDS_PER_DAY: f64 = 86_400.0;

/// Instrument view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum View {
    Nadir,
    Forward,
}

impl View {
    pub const ALL: [View; 2] = [View::Nadir, View::Forward];
}

impl std::fmt::Display for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            View::Nadir => write!(f, "nadir"),
            View::Forward => write!(f, "forward"),
        }
    }
}

/// Validity tag carried alongside each view of a pixel record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelValidity {
    Valid,
    /// Outside annotation coverage or unmapped scan
    NoData,
    /// Resolved scan number below [`MIN_RESOLVABLE_SCAN`]
    ScanBelowMinimum,
}

impl PixelValidity {
    /// Float written to the output for an invalid view
    pub fn fill_value(self) -> Option<f64> {
        match self {
            PixelValidity::Valid => None,
            PixelValidity::NoData => Some(NO_DATA_FILL),
            PixelValidity::ScanBelowMinimum => Some(SCAN_BELOW_MINIMUM_FILL),
        }
    }

    pub fn is_valid(self) -> bool {
        matches!(self, PixelValidity::Valid)
    }
}

/// Where image pixel coordinates are referenced within the instrument pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelReference {
    Corner,
    Centre,
}

impl PixelReference {
    /// Offset added to the instrument pixel number
    pub fn offset(self) -> f64 {
        match self {
            PixelReference::Corner => 0.0,
            PixelReference::Centre => 0.5,
        }
    }
}

impl std::str::FromStr for PixelReference {
    type Err = UngridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "corner" => Ok(PixelReference::Corner),
            "centre" | "center" => Ok(PixelReference::Centre),
            other => Err(UngridError::Config(format!(
                "Invalid pixel reference '{}', expected Corner or Centre",
                other
            ))),
        }
    }
}

impl std::fmt::Display for PixelReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PixelReference::Corner => write!(f, "Corner"),
            PixelReference::Centre => write!(f, "Centre"),
        }
    }
}

/// Ungridded values for a single view of one pixel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Acquisition time, MJD2000 days (UTC)
    pub time: f64,
    /// Across-track FOV extent, km
    pub fov_across: f64,
    /// Along-track FOV extent, km
    pub fov_along: f64,
    pub validity: PixelValidity,
}

impl ViewSample {
    /// A sample holding the sentinel for `validity` in every field
    pub fn invalid(validity: PixelValidity) -> Self {
        let fill = validity.fill_value().unwrap_or(NO_DATA_FILL);
        Self {
            latitude: fill,
            longitude: fill,
            time: fill,
            fov_across: fill,
            fov_along: fill,
            validity,
        }
    }
}

/// Field offsets of one view inside a pixel record
#[derive(Debug, Clone, Copy)]
struct ViewLayout {
    latitude: usize,
    longitude: usize,
    time: usize,
    fov_across: usize,
    fov_along: usize,
}

const NADIR_LAYOUT: ViewLayout = ViewLayout {
    latitude: 0,
    longitude: 1,
    time: 4,
    fov_across: 6,
    fov_along: 7,
};

const FORWARD_LAYOUT: ViewLayout = ViewLayout {
    latitude: 2,
    longitude: 3,
    time: 5,
    fov_across: 8,
    fov_along: 9,
};

fn layout(view: View) -> ViewLayout {
    match view {
        View::Nadir => NADIR_LAYOUT,
        View::Forward => FORWARD_LAYOUT,
    }
}

/// Output unit for one image pixel.
///
/// Field order: nadir lat, nadir lon, forward lat, forward lon, nadir time,
/// forward time, nadir FOV across, nadir FOV along, forward FOV across,
/// forward FOV along.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelRecord {
    pub values: [f64; PIXEL_FIELDS],
    pub nadir: PixelValidity,
    pub forward: PixelValidity,
}

impl PixelRecord {
    /// Record with both views marked as no data
    pub fn no_data() -> Self {
        Self {
            values: [NO_DATA_FILL; PIXEL_FIELDS],
            nadir: PixelValidity::NoData,
            forward: PixelValidity::NoData,
        }
    }

    pub fn from_views(nadir: ViewSample, forward: ViewSample) -> Self {
        let mut record = Self::no_data();
        record.set_view(View::Nadir, nadir);
        record.set_view(View::Forward, forward);
        record
    }

    pub fn validity(&self, view: View) -> PixelValidity {
        match view {
            View::Nadir => self.nadir,
            View::Forward => self.forward,
        }
    }

    pub fn view(&self, view: View) -> ViewSample {
        let l = layout(view);
        ViewSample {
            latitude: self.values[l.latitude],
            longitude: self.values[l.longitude],
            time: self.values[l.time],
            fov_across: self.values[l.fov_across],
            fov_along: self.values[l.fov_along],
            validity: self.validity(view),
        }
    }

    pub fn set_view(&mut self, view: View, sample: ViewSample) {
        let l = layout(view);
        self.values[l.latitude] = sample.latitude;
        self.values[l.longitude] = sample.longitude;
        self.values[l.time] = sample.time;
        self.values[l.fov_across] = sample.fov_across;
        self.values[l.fov_along] = sample.fov_along;
        match view {
            View::Nadir => self.nadir = sample.validity,
            View::Forward => self.forward = sample.validity,
        }
    }

    /// Move the geolocation of a view by the given offsets in degrees
    pub fn shift_position(&mut self, view: View, delta_lat: f64, delta_lon: f64) {
        let l = layout(view);
        self.values[l.latitude] += delta_lat;
        self.values[l.longitude] += delta_lon;
    }
}

/// Orbit state vector in an Earth-fixed frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateVector {
    pub time: DateTime<Utc>,
    pub position: [f64; 3], // [x, y, z] in meters
    pub velocity: [f64; 3], // [vx, vy, vz] in m/s
}

/// Geospatial transformation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

/// One annotation data set record, attributes addressed by name
#[derive(Debug, Clone, Default)]
pub struct AdsRecord {
    pub attributes: HashMap<String, Vec<f64>>,
}

impl AdsRecord {
    pub fn attribute(&self, name: &str) -> UngridResult<&[f64]> {
        self.attributes
            .get(name)
            .map(|v| v.as_slice())
            .ok_or_else(|| UngridError::Metadata(format!("ADS record has no attribute '{}'", name)))
    }

    /// First element of an attribute
    pub fn scalar(&self, name: &str) -> UngridResult<f64> {
        self.attribute(name)?
            .first()
            .copied()
            .ok_or_else(|| UngridError::Metadata(format!("ADS attribute '{}' is empty", name)))
    }
}

/// Ordered annotation records of one type plus group-level attributes
#[derive(Debug, Clone, Default)]
pub struct AdsGroup {
    pub name: String,
    pub attributes: HashMap<String, Vec<f64>>,
    pub records: Vec<AdsRecord>,
}

impl AdsGroup {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&AdsRecord> {
        self.records.get(index)
    }

    pub fn attribute(&self, name: &str) -> UngridResult<&[f64]> {
        self.attributes.get(name).map(|v| v.as_slice()).ok_or_else(|| {
            UngridError::Metadata(format!("ADS group {} has no attribute '{}'", self.name, name))
        })
    }

    /// Image rows covered by this group
    pub fn covered_rows(&self) -> usize {
        self.records.len() * GRANULE_ROWS
    }
}

/// Convert a UTC timestamp to fractional days since 2000-01-01
pub fn datetime_to_mjd2000(time: DateTime<Utc>) -> f64 {
    let seconds = time.timestamp() as f64 + f64::from(time.timestamp_subsec_nanos()) * 1e-9;
    seconds / SECONDS_PER_DAY - 10_957.0
}

/// Convert fractional MJD2000 days back to a UTC timestamp
pub fn mjd2000_to_datetime(mjd2000: f64) -> UngridResult<DateTime<Utc>> {
    let seconds = (mjd2000 + 10_957.0) * SECONDS_PER_DAY;
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9).round().min(999_999_999.0) as u32;
    Utc.timestamp_opt(whole as i64, nanos)
        .single()
        .ok_or_else(|| UngridError::Processing(format!("MJD2000 value {} is out of range", mjd2000)))
}

/// Error types for ungridding
#[derive(Debug, thiserror::Error)]
pub enum UngridError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("XML parsing error: {0}")]
    XmlParsing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Orbit propagation error: {0}")]
    Propagation(String),

    #[error("DEM error: {0}")]
    Dem(String),

    #[error("Row bands did not finish within {0} seconds")]
    Timeout(u64),

    #[error("Zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("NetCDF error: {0}")]
    NetCdf(String),

    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

/// Result type for ungridding operations
pub type UngridResult<T> = Result<T, UngridError>;

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_sentinels_are_distinct() {
        assert_ne!(NO_DATA_FILL, SCAN_BELOW_MINIMUM_FILL);
        for fill in [NO_DATA_FILL, SCAN_BELOW_MINIMUM_FILL] {
            // Outside any latitude, longitude or MJD2000 time we could produce
            assert!(fill < -360.0);
            assert!(fill < -36_525.0);
        }
        assert_eq!(PixelValidity::Valid.fill_value(), None);
    }

    #[test]
    fn test_record_view_layout() {
        let nadir = ViewSample {
            latitude: 1.0,
            longitude: 2.0,
            time: 3.0,
            fov_across: 4.0,
            fov_along: 5.0,
            validity: PixelValidity::Valid,
        };
        let forward = ViewSample::invalid(PixelValidity::ScanBelowMinimum);
        let record = PixelRecord::from_views(nadir, forward);

        assert_eq!(record.values[0], 1.0);
        assert_eq!(record.values[1], 2.0);
        assert_eq!(record.values[4], 3.0);
        assert_eq!(record.values[6], 4.0);
        assert_eq!(record.values[7], 5.0);
        for idx in [2, 3, 5, 8, 9] {
            assert_eq!(record.values[idx], SCAN_BELOW_MINIMUM_FILL);
        }
        assert_eq!(record.view(View::Nadir), nadir);
        assert_eq!(record.forward, PixelValidity::ScanBelowMinimum);
    }

    #[test]
    fn test_mjd2000_conversion() {
        let epoch = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        assert_abs_diff_eq!(datetime_to_mjd2000(epoch), 0.0, epsilon = 1e-12);

        let t = Utc.with_ymd_and_hms(2008, 3, 1, 12, 0, 0).unwrap();
        let mjd = datetime_to_mjd2000(t);
        assert_abs_diff_eq!(mjd, 2982.5, epsilon = 1e-9);

        let back = mjd2000_to_datetime(mjd).unwrap();
        assert!((back - t).num_milliseconds().abs() <= 1);
    }

    #[test]
    fn test_pixel_reference_parsing() {
        assert_eq!("Corner".parse::<PixelReference>().unwrap(), PixelReference::Corner);
        assert_eq!("centre".parse::<PixelReference>().unwrap(), PixelReference::Centre);
        assert!("middle".parse::<PixelReference>().is_err());
    }
}
