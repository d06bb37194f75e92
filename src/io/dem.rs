use crate::types::{GeoTransform, UngridError, UngridResult};
use ndarray::Array2;
use regex::Regex;
use std::path::Path;
use std::sync::{Arc, OnceLock};

static TILE_NAME_PATTERN: OnceLock<Regex> = OnceLock::new();

/// SRTM tile name matcher (`N50E012`), compiled on first use
fn tile_name_pattern() -> Option<&'static Regex> {
    if let Some(pattern) = TILE_NAME_PATTERN.get() {
        return Some(pattern);
    }
    let pattern = Regex::new(r"(?i)([NS])(\d{2})([EW])(\d{3})").ok()?;
    Some(TILE_NAME_PATTERN.get_or_init(|| pattern))
}

/// SRTM void marker
pub const SRTM_NODATA: f32 = -32768.0;

/// Terrain height lookup used by the topographic corrector
pub trait DemAccessor: Send + Sync {
    /// Height in metres above the ellipsoid/geoid at (lat, lon) degrees
    fn height_at(&self, lat: f64, lon: f64) -> UngridResult<f64>;
}

/// In-memory elevation grid.
///
/// The transform addresses sample centres: sample (row, col) lies at
/// lon = top_left_x + col * pixel_width, lat = top_left_y + row * pixel_height.
#[derive(Debug, Clone)]
pub struct GridDem {
    data: Array2<f32>,
    transform: GeoTransform,
    nodata: Option<f32>,
}

impl GridDem {
    pub fn new(data: Array2<f32>, transform: GeoTransform, nodata: Option<f32>) -> UngridResult<Self> {
        if data.is_empty() {
            return Err(UngridError::Dem("Elevation grid is empty".to_string()));
        }
        if transform.pixel_width == 0.0 || transform.pixel_height == 0.0 {
            return Err(UngridError::Dem("Elevation grid spacing must be non-zero".to_string()));
        }
        Ok(Self {
            data,
            transform,
            nodata,
        })
    }

    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Fractional (row, col) of a coordinate, `None` outside the grid
    fn grid_position(&self, lat: f64, lon: f64) -> Option<(f64, f64)> {
        let col = (lon - self.transform.top_left_x) / self.transform.pixel_width;
        let row = (lat - self.transform.top_left_y) / self.transform.pixel_height;
        let (height, width) = self.data.dim();
        let tolerance = 1e-9;
        if !(row >= -tolerance && col >= -tolerance) {
            return None;
        }
        if row > (height - 1) as f64 + tolerance || col > (width - 1) as f64 + tolerance {
            return None;
        }
        Some((row.max(0.0), col.max(0.0)))
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        self.grid_position(lat, lon).is_some()
    }

    fn is_void(&self, value: f32) -> bool {
        value.is_nan() || self.nodata.map_or(false, |nd| value == nd)
    }
}

impl DemAccessor for GridDem {
    fn height_at(&self, lat: f64, lon: f64) -> UngridResult<f64> {
        let (row, col) = self
            .grid_position(lat, lon)
            .ok_or_else(|| UngridError::Dem(format!("({:.5}, {:.5}) is outside the DEM", lat, lon)))?;

        let (height, width) = self.data.dim();
        let y1 = (row.floor() as usize).min(height - 1);
        let x1 = (col.floor() as usize).min(width - 1);
        let y2 = (y1 + 1).min(height - 1);
        let x2 = (x1 + 1).min(width - 1);
        let dy = row - y1 as f64;
        let dx = col - x1 as f64;

        let corners = [
            (self.data[[y1, x1]], (1.0 - dx) * (1.0 - dy)),
            (self.data[[y1, x2]], dx * (1.0 - dy)),
            (self.data[[y2, x1]], (1.0 - dx) * dy),
            (self.data[[y2, x2]], dx * dy),
        ];
        let mut interpolated = 0.0;
        for (value, weight) in corners {
            if weight <= 0.0 {
                continue;
            }
            if self.is_void(value) {
                return Err(UngridError::Dem(format!("DEM void at ({:.5}, {:.5})", lat, lon)));
            }
            interpolated += value as f64 * weight;
        }
        Ok(interpolated)
    }
}

/// Set of grids, each queried when it contains the coordinate
#[derive(Debug, Clone, Default)]
pub struct TiledDem {
    tiles: Vec<GridDem>,
}

impl TiledDem {
    pub fn new(tiles: Vec<GridDem>) -> Self {
        Self { tiles }
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}

impl DemAccessor for TiledDem {
    fn height_at(&self, lat: f64, lon: f64) -> UngridResult<f64> {
        self.tiles
            .iter()
            .find(|tile| tile.contains(lat, lon))
            .ok_or_else(|| UngridError::Dem(format!("No DEM tile covers ({:.5}, {:.5})", lat, lon)))?
            .height_at(lat, lon)
    }
}

/// Digital Elevation Model reader
pub struct DemReader;

impl DemReader {
    /// Open a DEM: an SRTM tile (`.hgt` / `.hgt.gz`), a directory of tiles,
    /// or any GDAL raster when built with the `gdal` feature
    pub fn open<P: AsRef<Path>>(path: P) -> UngridResult<Arc<dyn DemAccessor>> {
        let path = path.as_ref();
        log::info!("Reading DEM from: {}", path.display());

        if path.is_dir() {
            return Ok(Arc::new(Self::read_tile_directory(path)?));
        }
        if Self::is_srtm_tile(path) {
            return Ok(Arc::new(Self::read_hgt(path)?));
        }

        #[cfg(feature = "gdal")]
        {
            Ok(Arc::new(Self::read_dem(path)?))
        }
        #[cfg(not(feature = "gdal"))]
        {
            Err(UngridError::Dem(format!(
                "Unsupported DEM format '{}' (SRTM .hgt/.hgt.gz tiles only; enable the gdal feature for other rasters)",
                path.display()
            )))
        }
    }

    fn is_srtm_tile(path: &Path) -> bool {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        name.ends_with(".hgt") || name.ends_with(".hgt.gz")
    }

    /// Load every SRTM tile found in a directory
    pub fn read_tile_directory(dir: &Path) -> UngridResult<TiledDem> {
        let mut tiles = Vec::new();
        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| Self::is_srtm_tile(p))
            .collect();
        entries.sort();

        for path in entries {
            tiles.push(Self::read_hgt(&path)?);
        }
        if tiles.is_empty() {
            return Err(UngridError::Dem(format!("No SRTM tiles in {}", dir.display())));
        }
        log::info!("Loaded {} DEM tiles", tiles.len());
        Ok(TiledDem::new(tiles))
    }

    /// Parse the south-west corner from a tile name like "N50E012" or "S23W045"
    pub fn parse_tile_coordinates(name: &str) -> Option<(f64, f64)> {
        let caps = tile_name_pattern()?.captures(name)?;
        let mut lat: f64 = caps[2].parse().ok()?;
        let mut lon: f64 = caps[4].parse().ok()?;
        if caps[1].eq_ignore_ascii_case("S") {
            lat = -lat;
        }
        if caps[3].eq_ignore_ascii_case("W") {
            lon = -lon;
        }
        Some((lat, lon))
    }

    /// Read an SRTM height tile, optionally gzipped
    pub fn read_hgt(path: &Path) -> UngridResult<GridDem> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let (south, west) = Self::parse_tile_coordinates(&name)
            .ok_or_else(|| UngridError::Dem(format!("Cannot parse SRTM tile name '{}'", name)))?;

        let raw = std::fs::read(path)?;
        let bytes = if name.to_ascii_lowercase().ends_with(".gz") {
            Self::decompress(&raw)?
        } else {
            raw
        };

        let samples = bytes.len() / 2;
        let size = (samples as f64).sqrt().round() as usize;
        if size < 2 || size * size * 2 != bytes.len() {
            return Err(UngridError::Dem(format!(
                "{}: {} bytes is not a square grid of 16-bit samples",
                name,
                bytes.len()
            )));
        }

        let values: Vec<f32> = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_be_bytes([pair[0], pair[1]]) as f32)
            .collect();
        let data = Array2::from_shape_vec((size, size), values)
            .map_err(|e| UngridError::Dem(format!("Failed to reshape DEM data: {}", e)))?;

        let spacing = 1.0 / (size - 1) as f64;
        log::debug!("SRTM tile {}: {}x{} samples", name, size, size);
        GridDem::new(
            data,
            GeoTransform {
                top_left_x: west,
                pixel_width: spacing,
                rotation_x: 0.0,
                top_left_y: south + 1.0,
                rotation_y: 0.0,
                pixel_height: -spacing,
            },
            Some(SRTM_NODATA),
        )
    }

    fn decompress(data: &[u8]) -> UngridResult<Vec<u8>> {
        use flate2::read::GzDecoder;
        use std::io::Read;

        let mut decoder = GzDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| UngridError::Dem(format!("Failed to decompress gzip data: {}", e)))?;
        if decompressed.is_empty() {
            return Err(UngridError::Dem("Decompressed HGT file is empty".to_string()));
        }
        log::debug!("Decompressed {} bytes", decompressed.len());
        Ok(decompressed)
    }

    /// Read the first band of any GDAL raster in geographic coordinates
    #[cfg(feature = "gdal")]
    pub fn read_dem(path: &Path) -> UngridResult<GridDem> {
        use gdal::Dataset;

        let dataset = Dataset::open(path)?;
        let geo_transform = dataset.geo_transform()?;
        let (width, height) = dataset.raster_size();
        log::debug!("DEM size: {}x{}", width, height);
        log::debug!("DEM geotransform: {:?}", geo_transform);

        let rasterband = dataset.rasterband(1)?;
        let nodata = rasterband.no_data_value().map(|v| v as f32);
        let band_data = rasterband.read_as::<f32>((0, 0), (width, height), (width, height), None)?;
        let dem_array = Array2::from_shape_vec((height, width), band_data.data)
            .map_err(|e| UngridError::Dem(format!("Failed to reshape DEM data: {}", e)))?;

        // GDAL transforms address pixel corners
        GridDem::new(
            dem_array,
            GeoTransform {
                top_left_x: geo_transform[0] + 0.5 * geo_transform[1],
                pixel_width: geo_transform[1],
                rotation_x: geo_transform[2],
                top_left_y: geo_transform[3] + 0.5 * geo_transform[5],
                rotation_y: geo_transform[4],
                pixel_height: geo_transform[5],
            },
            nodata,
        )
    }
}
