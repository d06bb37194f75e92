//! Self-describing output container
//!
//! The output extension picks the format: `.zip` is an archive holding
//! `manifest.json` (global and group attributes plus a dataset index) and one
//! raw little-endian array per variable, `.h5` is HDF5 and anything else is
//! NetCDF-4. The last two need the `netcdf` feature.

use crate::core::scheduler::UngridOutput;
use crate::types::{UngridError, UngridResult, View, NO_DATA_FILL, SCAN_BELOW_MINIMUM_FILL};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

pub const MANIFEST_NAME: &str = "manifest.json";
pub const CONTAINER_FORMAT: &str = "ungrid-container";

/// On-disk layout of the output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Zip,
    NetCdf4,
    Hdf5,
}

impl ContainerFormat {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        let extension = path
            .as_ref()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match extension.as_deref() {
            Some("zip") => Self::Zip,
            Some("h5") | Some("hdf5") => Self::Hdf5,
            _ => Self::NetCdf4,
        }
    }

    /// Whether this build can write the format
    pub fn is_available(self) -> bool {
        match self {
            Self::Zip => true,
            Self::NetCdf4 | Self::Hdf5 => cfg!(feature = "netcdf"),
        }
    }
}

impl std::fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Zip => write!(f, "zip"),
            Self::NetCdf4 => write!(f, "NetCDF-4"),
            Self::Hdf5 => write!(f, "HDF5"),
        }
    }
}

/// Run description stored as global attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalAttributes {
    pub input_file: String,
    pub product_name: String,
    pub trimmed: bool,
    pub ifov_reporting_extent: f64,
    pub fov_channel: String,
    pub characterisation_file: Option<String>,
    pub fov_measurement_file: Option<String>,
    pub pixel_reference: String,
    pub orthorectified: bool,
    pub no_data_fill: f64,
    pub scan_below_minimum_fill: f64,
    /// [min_row, max_row, min_col, max_col] when a subset was requested
    pub subset: Option<[usize; 4]>,
    pub first_row: usize,
    pub first_col: usize,
    pub failed_bands: Vec<usize>,
    pub created: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    F32,
    F64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub name: String,
    /// Member path inside the archive
    pub path: String,
    pub dtype: DataType,
    /// [rows, cols]
    pub shape: [usize; 2],
    /// Index of the field in the pixel record
    pub field: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub name: String,
    pub attributes: BTreeMap<String, String>,
    pub datasets: Vec<DatasetEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format: String,
    pub version: u32,
    pub global_attributes: GlobalAttributes,
    pub groups: Vec<GroupEntry>,
}

pub(crate) struct GroupLayout {
    pub name: &'static str,
    pub units: &'static str,
    pub description: &'static str,
    pub dtype: DataType,
    /// (dataset name, record field)
    pub datasets: &'static [(&'static str, usize)],
}

pub(crate) const GROUPS: [GroupLayout; 3] = [
    GroupLayout {
        name: "Geolocation",
        units: "degrees",
        description: "Ungridded pixel latitude and longitude",
        dtype: DataType::F32,
        datasets: &[
            ("nadir_latitude", 0),
            ("nadir_longitude", 1),
            ("forward_latitude", 2),
            ("forward_longitude", 3),
        ],
    },
    GroupLayout {
        name: "Acquisition_Times",
        units: "days since 2000-01-01T00:00:00 UTC",
        description: "Pixel acquisition time",
        dtype: DataType::F64,
        datasets: &[("nadir_time", 4), ("forward_time", 5)],
    },
    GroupLayout {
        name: "FOV_Projection",
        units: "km",
        description: "Ground-projected instantaneous field of view extent",
        dtype: DataType::F32,
        datasets: &[
            ("nadir_fov_across", 6),
            ("nadir_fov_along", 7),
            ("forward_fov_across", 8),
            ("forward_fov_along", 9),
        ],
    },
];

/// Row-major values of one record field
pub(crate) fn dataset_values(output: &UngridOutput, field: usize) -> Vec<f64> {
    output.records.iter().map(|record| record.values[field]).collect()
}

pub struct ContainerWriter;

impl ContainerWriter {
    /// Write the ungridded output in the format named by the extension; the
    /// file appears only once complete
    pub fn write<P: AsRef<Path>>(path: P, output: &UngridOutput, attributes: &GlobalAttributes) -> UngridResult<()> {
        let path = path.as_ref();
        match ContainerFormat::from_path(path) {
            ContainerFormat::Zip => Self::write_zip(path, output, attributes),
            #[cfg(feature = "netcdf")]
            format => crate::io::netcdf_writer::NetCdfWriter::write(path, format, output, attributes),
            #[cfg(not(feature = "netcdf"))]
            format => Err(UngridError::Config(format!(
                "{} output {} needs the netcdf feature; use a .zip output instead",
                format,
                path.display()
            ))),
        }
    }

    fn write_zip(path: &Path, output: &UngridOutput, attributes: &GlobalAttributes) -> UngridResult<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => std::path::PathBuf::from("."),
        };
        log::info!("Writing output container: {}", path.display());

        let temp = tempfile::NamedTempFile::new_in(&parent)?;
        let mut zip = ZipWriter::new(temp.as_file().try_clone()?);
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        let (rows, cols) = output.records.dim();
        let mut groups = Vec::with_capacity(GROUPS.len());

        for layout in &GROUPS {
            let mut datasets = Vec::with_capacity(layout.datasets.len());
            for &(name, field) in layout.datasets {
                let member = format!("{}/{}.bin", layout.name, name);
                zip.start_file(member.as_str(), options)?;

                let mut bytes = Vec::with_capacity(rows * cols * 8);
                for value in dataset_values(output, field) {
                    match layout.dtype {
                        DataType::F32 => bytes.extend_from_slice(&(value as f32).to_le_bytes()),
                        DataType::F64 => bytes.extend_from_slice(&value.to_le_bytes()),
                    }
                }
                zip.write_all(&bytes)?;
                log::debug!("Wrote {} ({} bytes)", member, bytes.len());

                datasets.push(DatasetEntry {
                    name: name.to_string(),
                    path: member,
                    dtype: layout.dtype,
                    shape: [rows, cols],
                    field,
                });
            }

            let mut group_attributes = BTreeMap::new();
            group_attributes.insert("units".to_string(), layout.units.to_string());
            group_attributes.insert("description".to_string(), layout.description.to_string());
            group_attributes.insert("_FillValue".to_string(), NO_DATA_FILL.to_string());
            group_attributes.insert("scan_below_minimum_value".to_string(), SCAN_BELOW_MINIMUM_FILL.to_string());
            groups.push(GroupEntry {
                name: layout.name.to_string(),
                attributes: group_attributes,
                datasets,
            });
        }

        let manifest = Manifest {
            format: CONTAINER_FORMAT.to_string(),
            version: 1,
            global_attributes: attributes.clone(),
            groups,
        };
        zip.start_file(MANIFEST_NAME, options)?;
        zip.write_all(serde_json::to_string_pretty(&manifest)?.as_bytes())?;
        zip.finish()?;

        temp.persist(path).map_err(|e| UngridError::Io(e.error))?;
        log::info!(
            "Wrote {} x {} pixels ({} views per pixel)",
            rows,
            cols,
            View::ALL.len()
        );
        Ok(())
    }
}

/// Read access to a written container
pub struct ContainerReader {
    archive: ZipArchive<File>,
}

impl ContainerReader {
    pub fn open<P: AsRef<Path>>(path: P) -> UngridResult<Self> {
        let file = File::open(path.as_ref())?;
        let archive = ZipArchive::new(file)?;
        Ok(Self { archive })
    }

    pub fn manifest(&mut self) -> UngridResult<Manifest> {
        let mut member = self.archive.by_name(MANIFEST_NAME)?;
        let mut content = String::new();
        member.read_to_string(&mut content)?;
        let manifest: Manifest = serde_json::from_str(&content)?;
        if manifest.format != CONTAINER_FORMAT {
            return Err(UngridError::InvalidFormat(format!(
                "Unexpected container format '{}'",
                manifest.format
            )));
        }
        Ok(manifest)
    }

    /// Dataset values widened to f64, row-major
    pub fn dataset(&mut self, entry: &DatasetEntry) -> UngridResult<Vec<f64>> {
        let mut member = self.archive.by_name(&entry.path)?;
        let mut bytes = Vec::new();
        member.read_to_end(&mut bytes)?;

        let values: Vec<f64> = match entry.dtype {
            DataType::F32 => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
                .collect(),
            DataType::F64 => bytes
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        };
        if values.len() != entry.shape[0] * entry.shape[1] {
            return Err(UngridError::InvalidFormat(format!(
                "Dataset {} holds {} values, expected {}",
                entry.name,
                values.len(),
                entry.shape[0] * entry.shape[1]
            )));
        }
        Ok(values)
    }
}
