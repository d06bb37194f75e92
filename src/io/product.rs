use crate::types::{AdsGroup, AdsRecord, StateVector, UngridError, UngridResult};
use chrono::{DateTime, NaiveDateTime, Utc};
use ndarray::Array2;
use quick_xml::de::from_str;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use zip::ZipArchive;

/// Band whose raster defines the product image size
pub const IMAGE_SIZE_BAND: &str = "btemp_nadir_1200";

/// Read access to an opened product
pub trait ProductReader: Send + Sync {
    /// Product name used in output attributes
    fn name(&self) -> &str;

    fn ads_group(&self, name: &str) -> UngridResult<&AdsGroup>;

    /// Image (rows, columns)
    fn image_size(&self) -> UngridResult<(usize, usize)>;

    /// Raster band value at (col, row)
    fn sample(&self, band: &str, col: usize, row: usize) -> UngridResult<f64>;

    fn start_time(&self) -> DateTime<Utc>;

    fn stop_time(&self) -> DateTime<Utc>;

    /// Platform state vector used to seed orbit propagation
    fn state_vector(&self) -> UngridResult<StateVector>;

    /// Release raster storage; annotation access stays available
    fn close(&mut self);
}

#[derive(Debug, Deserialize)]
struct ProductXml {
    #[serde(rename = "@name")]
    name: String,
    acquisition: AcquisitionXml,
    #[serde(rename = "stateVector")]
    state_vector: Option<StateVectorXml>,
    #[serde(rename = "band", default)]
    bands: Vec<BandXml>,
    #[serde(rename = "ads", default)]
    groups: Vec<AdsXml>,
}

#[derive(Debug, Deserialize)]
struct AcquisitionXml {
    #[serde(rename = "@start")]
    start: String,
    #[serde(rename = "@stop")]
    stop: String,
}

#[derive(Debug, Deserialize)]
struct StateVectorXml {
    #[serde(rename = "@time")]
    time: String,
    #[serde(rename = "@x")]
    x: f64,
    #[serde(rename = "@y")]
    y: f64,
    #[serde(rename = "@z")]
    z: f64,
    #[serde(rename = "@vx")]
    vx: f64,
    #[serde(rename = "@vy")]
    vy: f64,
    #[serde(rename = "@vz")]
    vz: f64,
}

#[derive(Debug, Deserialize)]
struct BandXml {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@width")]
    width: usize,
    #[serde(rename = "@height")]
    height: usize,
    #[serde(rename = "$text", default)]
    values: String,
}

#[derive(Debug, Deserialize)]
struct AdsXml {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "attribute", default)]
    attributes: Vec<AttributeXml>,
    #[serde(rename = "record", default)]
    records: Vec<RecordXml>,
}

#[derive(Debug, Deserialize)]
struct RecordXml {
    #[serde(rename = "attribute", default)]
    attributes: Vec<AttributeXml>,
}

#[derive(Debug, Deserialize)]
struct AttributeXml {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "$text", default)]
    values: String,
}

/// Raster band held in memory; `data` is empty when only the size is known
#[derive(Debug, Clone)]
struct Band {
    width: usize,
    height: usize,
    data: Option<Array2<f64>>,
}

/// Product described by an XML document, stand-alone or inside a zip archive
#[derive(Debug)]
pub struct XmlProductReader {
    path: PathBuf,
    name: String,
    start: DateTime<Utc>,
    stop: DateTime<Utc>,
    state_vector: Option<StateVector>,
    bands: HashMap<String, Band>,
    groups: HashMap<String, AdsGroup>,
}

impl XmlProductReader {
    pub fn open<P: AsRef<Path>>(path: P) -> UngridResult<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(UngridError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("File not found: {}", path.display()),
            )));
        }
        log::info!("Opening product: {}", path.display());

        let is_zip = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| e.eq_ignore_ascii_case("zip"));
        let xml_content = if is_zip {
            Self::read_from_archive(&path)?
        } else {
            std::fs::read_to_string(&path)?
        };

        let mut reader = Self::parse(&xml_content)?;
        reader.path = path;
        Ok(reader)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the first `.xml` member of a zip archive
    fn read_from_archive(path: &Path) -> UngridResult<String> {
        let file = File::open(path)?;
        let mut archive = ZipArchive::new(file)
            .map_err(|e| UngridError::InvalidFormat(format!("Failed to open ZIP: {}", e)))?;

        let member = archive
            .file_names()
            .filter(|name| name.to_ascii_lowercase().ends_with(".xml"))
            .min()
            .map(str::to_string)
            .ok_or_else(|| {
                UngridError::InvalidFormat(format!("No product XML in {}", path.display()))
            })?;
        log::debug!("Reading product description {} from archive", member);

        let mut file = archive.by_name(&member)?;
        let mut xml_content = String::new();
        file.read_to_string(&mut xml_content)?;
        Ok(xml_content)
    }

    /// Parse a product XML document
    pub fn parse(xml_content: &str) -> UngridResult<Self> {
        let product: ProductXml = from_str(xml_content)
            .map_err(|e| UngridError::XmlParsing(format!("Failed to parse product XML: {}", e)))?;

        let start = parse_time(&product.acquisition.start)?;
        let stop = parse_time(&product.acquisition.stop)?;

        let state_vector = product
            .state_vector
            .map(|sv| -> UngridResult<StateVector> {
                Ok(StateVector {
                    time: parse_time(&sv.time)?,
                    position: [sv.x, sv.y, sv.z],
                    velocity: [sv.vx, sv.vy, sv.vz],
                })
            })
            .transpose()?;

        let mut bands = HashMap::new();
        for band in product.bands {
            let values = parse_values(&band.values, &band.name)?;
            let data = if values.is_empty() {
                None
            } else {
                Some(Array2::from_shape_vec((band.height, band.width), values).map_err(|e| {
                    UngridError::InvalidFormat(format!("Band {} has the wrong sample count: {}", band.name, e))
                })?)
            };
            bands.insert(
                band.name,
                Band {
                    width: band.width,
                    height: band.height,
                    data,
                },
            );
        }

        let mut groups = HashMap::new();
        for ads in product.groups {
            let attributes = collect_attributes(&ads.attributes, &ads.name)?;
            let records = ads
                .records
                .iter()
                .map(|record| {
                    Ok(AdsRecord {
                        attributes: collect_attributes(&record.attributes, &ads.name)?,
                    })
                })
                .collect::<UngridResult<Vec<_>>>()?;
            log::debug!("ADS {}: {} records", ads.name, records.len());
            groups.insert(
                ads.name.clone(),
                AdsGroup {
                    name: ads.name,
                    attributes,
                    records,
                },
            );
        }

        Ok(Self {
            path: PathBuf::new(),
            name: product.name,
            start,
            stop,
            state_vector,
            bands,
            groups,
        })
    }
}

impl ProductReader for XmlProductReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn ads_group(&self, name: &str) -> UngridResult<&AdsGroup> {
        self.groups
            .get(name)
            .ok_or_else(|| UngridError::Metadata(format!("Product has no ADS group {}", name)))
    }

    fn image_size(&self) -> UngridResult<(usize, usize)> {
        let band = self
            .bands
            .get(IMAGE_SIZE_BAND)
            .ok_or_else(|| UngridError::Metadata(format!("Product has no {} band", IMAGE_SIZE_BAND)))?;
        Ok((band.height, band.width))
    }

    fn sample(&self, band: &str, col: usize, row: usize) -> UngridResult<f64> {
        let raster = self
            .bands
            .get(band)
            .ok_or_else(|| UngridError::Metadata(format!("Product has no {} band", band)))?;
        if col >= raster.width || row >= raster.height {
            return Err(UngridError::Processing(format!(
                "({}, {}) is outside band {} ({}x{})",
                col, row, band, raster.width, raster.height
            )));
        }
        raster
            .data
            .as_ref()
            .map(|data| data[[row, col]])
            .ok_or_else(|| UngridError::Metadata(format!("Band {} carries no samples", band)))
    }

    fn start_time(&self) -> DateTime<Utc> {
        self.start
    }

    fn stop_time(&self) -> DateTime<Utc> {
        self.stop
    }

    fn state_vector(&self) -> UngridResult<StateVector> {
        self.state_vector
            .clone()
            .ok_or_else(|| UngridError::Metadata("Product carries no orbit state vector".to_string()))
    }

    fn close(&mut self) {
        for band in self.bands.values_mut() {
            band.data = None;
        }
        log::debug!("Closed product {}", self.name);
    }
}

fn collect_attributes(attributes: &[AttributeXml], group: &str) -> UngridResult<HashMap<String, Vec<f64>>> {
    attributes
        .iter()
        .map(|attr| Ok((attr.name.clone(), parse_values(&attr.values, &format!("{}/{}", group, attr.name))?)))
        .collect()
}

fn parse_values(text: &str, context: &str) -> UngridResult<Vec<f64>> {
    text.split_whitespace()
        .map(|token| {
            token
                .parse::<f64>()
                .map_err(|e| UngridError::XmlParsing(format!("{}: invalid number '{}': {}", context, token, e)))
        })
        .collect()
}

/// Parse product timestamps, with or without an explicit offset
fn parse_time(time_str: &str) -> UngridResult<DateTime<Utc>> {
    if let Ok(time) = DateTime::parse_from_rfc3339(time_str) {
        return Ok(time.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(time_str, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| UngridError::Metadata(format!("Could not parse time '{}': {}", time_str, e)))
}
