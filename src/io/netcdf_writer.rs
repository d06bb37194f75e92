//! NetCDF-4 and HDF5 output
//!
//! Both formats go through libnetcdf: a NetCDF-4 file is an HDF5 file, so an
//! `.h5` output opens in HDF5 tools with the same groups and variables.
//! Dimensions `row` and `col` live in the root group and are shared by every
//! variable.

use crate::core::scheduler::UngridOutput;
use crate::io::writer::{dataset_values, ContainerFormat, DataType, GlobalAttributes, GROUPS};
use crate::types::{UngridError, UngridResult, NO_DATA_FILL, SCAN_BELOW_MINIMUM_FILL};
use std::path::Path;

pub const ROW_DIMENSION: &str = "row";
pub const COL_DIMENSION: &str = "col";

fn nc_error(context: &str, e: impl std::fmt::Display) -> UngridError {
    UngridError::NetCdf(format!("{}: {}", context, e))
}

pub struct NetCdfWriter;

impl NetCdfWriter {
    /// Write `output` to `path`; the file appears only once complete
    pub fn write(
        path: &Path,
        format: ContainerFormat,
        output: &UngridOutput,
        attributes: &GlobalAttributes,
    ) -> UngridResult<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => std::path::PathBuf::from("."),
        };
        let file_name = path
            .file_name()
            .ok_or_else(|| UngridError::Config(format!("Output path {} has no file name", path.display())))?;
        log::info!("Writing {} output: {}", format, path.display());

        // libnetcdf needs a path, so stage in a private directory beside the target
        let staging = tempfile::Builder::new().prefix(".ungrid").tempdir_in(&parent)?;
        let staged = staging.path().join(file_name);
        Self::write_file(&staged, format, output, attributes)?;
        std::fs::rename(&staged, path)?;
        Ok(())
    }

    fn write_file(
        path: &Path,
        format: ContainerFormat,
        output: &UngridOutput,
        attributes: &GlobalAttributes,
    ) -> UngridResult<()> {
        let (rows, cols) = output.records.dim();
        let mut file = netcdf::create(path).map_err(|e| nc_error("create", e))?;

        file.add_dimension(ROW_DIMENSION, rows)
            .map_err(|e| nc_error("row dimension", e))?;
        file.add_dimension(COL_DIMENSION, cols)
            .map_err(|e| nc_error("col dimension", e))?;
        Self::put_global_attributes(&mut file, format, attributes)?;

        for layout in &GROUPS {
            let mut group = file
                .add_group(layout.name)
                .map_err(|e| nc_error(layout.name, e))?;
            group
                .add_attribute("units", layout.units)
                .map_err(|e| nc_error(layout.name, e))?;
            group
                .add_attribute("description", layout.description)
                .map_err(|e| nc_error(layout.name, e))?;

            for &(name, field) in layout.datasets {
                let values = dataset_values(output, field);
                let dims = [ROW_DIMENSION, COL_DIMENSION];
                match layout.dtype {
                    DataType::F32 => {
                        let data: Vec<f32> = values.iter().map(|&v| v as f32).collect();
                        let mut var = group
                            .add_variable::<f32>(name, &dims)
                            .map_err(|e| nc_error(name, e))?;
                        var.set_fill_value(NO_DATA_FILL as f32)
                            .map_err(|e| nc_error(name, e))?;
                        var.put_attribute("units", layout.units)
                            .map_err(|e| nc_error(name, e))?;
                        var.put_attribute("scan_below_minimum_value", SCAN_BELOW_MINIMUM_FILL as f32)
                            .map_err(|e| nc_error(name, e))?;
                        var.put_values(&data, ..).map_err(|e| nc_error(name, e))?;
                    }
                    DataType::F64 => {
                        let mut var = group
                            .add_variable::<f64>(name, &dims)
                            .map_err(|e| nc_error(name, e))?;
                        var.set_fill_value(NO_DATA_FILL)
                            .map_err(|e| nc_error(name, e))?;
                        var.put_attribute("units", layout.units)
                            .map_err(|e| nc_error(name, e))?;
                        var.put_attribute("scan_below_minimum_value", SCAN_BELOW_MINIMUM_FILL)
                            .map_err(|e| nc_error(name, e))?;
                        var.put_values(&values, ..).map_err(|e| nc_error(name, e))?;
                    }
                }
                log::debug!("Wrote {}/{} ({} x {})", layout.name, name, rows, cols);
            }
        }
        Ok(())
    }

    fn put_global_attributes(
        file: &mut netcdf::FileMut,
        format: ContainerFormat,
        attributes: &GlobalAttributes,
    ) -> UngridResult<()> {
        let flag = |b: bool| if b { "true" } else { "false" };
        let mut text = vec![
            ("format", format.to_string()),
            ("input_file", attributes.input_file.clone()),
            ("product_name", attributes.product_name.clone()),
            ("trimmed", flag(attributes.trimmed).to_string()),
            ("fov_channel", attributes.fov_channel.clone()),
            ("pixel_reference", attributes.pixel_reference.clone()),
            ("orthorectified", flag(attributes.orthorectified).to_string()),
            ("created", attributes.created.clone()),
        ];
        if let Some(f) = &attributes.characterisation_file {
            text.push(("characterisation_file", f.clone()));
        }
        if let Some(f) = &attributes.fov_measurement_file {
            text.push(("fov_measurement_file", f.clone()));
        }
        for (name, value) in text {
            file.add_attribute(name, value.as_str())
                .map_err(|e| nc_error(name, e))?;
        }

        let numbers = [
            ("ifov_reporting_extent", attributes.ifov_reporting_extent),
            ("no_data_fill", attributes.no_data_fill),
            ("scan_below_minimum_fill", attributes.scan_below_minimum_fill),
        ];
        for (name, value) in numbers {
            file.add_attribute(name, value).map_err(|e| nc_error(name, e))?;
        }

        let mut indices = vec![
            ("first_row", vec![attributes.first_row as u64]),
            ("first_col", vec![attributes.first_col as u64]),
        ];
        if let Some(subset) = attributes.subset {
            indices.push(("subset", subset.iter().map(|&v| v as u64).collect()));
        }
        if !attributes.failed_bands.is_empty() {
            indices.push(("failed_bands", attributes.failed_bands.iter().map(|&v| v as u64).collect()));
        }
        for (name, value) in indices {
            file.add_attribute(name, value).map_err(|e| nc_error(name, e))?;
        }
        Ok(())
    }
}

/// Read access to a written NetCDF-4/HDF5 output
pub struct NetCdfReader {
    file: netcdf::File,
}

impl NetCdfReader {
    pub fn open<P: AsRef<Path>>(path: P) -> UngridResult<Self> {
        let file = netcdf::open(path.as_ref()).map_err(|e| nc_error("open", e))?;
        Ok(Self { file })
    }

    /// (rows, cols) of the output grid
    pub fn shape(&self) -> UngridResult<(usize, usize)> {
        let len = |name: &str| {
            self.file
                .dimension(name)
                .map(|d| d.len())
                .ok_or_else(|| UngridError::InvalidFormat(format!("Missing dimension '{}'", name)))
        };
        Ok((len(ROW_DIMENSION)?, len(COL_DIMENSION)?))
    }

    /// Variable `group/name` widened to f64, row-major
    pub fn dataset(&self, group: &str, name: &str) -> UngridResult<Vec<f64>> {
        let group = self
            .file
            .group(group)
            .map_err(|e| nc_error(group, e))?
            .ok_or_else(|| UngridError::InvalidFormat(format!("Missing group '{}'", group)))?;
        let var = group
            .variable(name)
            .ok_or_else(|| UngridError::InvalidFormat(format!("Missing variable '{}'", name)))?;
        var.get_values::<f64, _>(..).map_err(|e| nc_error(name, e))
    }

    /// Text-valued global attribute
    pub fn text_attribute(&self, name: &str) -> UngridResult<Option<String>> {
        let Some(attribute) = self.file.attribute(name) else {
            return Ok(None);
        };
        match attribute.value().map_err(|e| nc_error(name, e))? {
            netcdf::AttributeValue::Str(s) => Ok(Some(s)),
            other => Err(UngridError::InvalidFormat(format!(
                "Attribute '{}' is not text: {:?}",
                name, other
            ))),
        }
    }

    /// Numeric global attribute
    pub fn number_attribute(&self, name: &str) -> UngridResult<Option<f64>> {
        let Some(attribute) = self.file.attribute(name) else {
            return Ok(None);
        };
        let value = attribute.value().map_err(|e| nc_error(name, e))?;
        f64::try_from(value)
            .map(Some)
            .map_err(|e| nc_error(name, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scheduler::ImageBounds;
    use crate::types::{PixelRecord, PixelValidity, ViewSample};
    use ndarray::Array2;

    fn attributes() -> GlobalAttributes {
        GlobalAttributes {
            input_file: "product.xml".to_string(),
            product_name: "ATS_TOA_1PTEST".to_string(),
            trimmed: true,
            ifov_reporting_extent: 0.4,
            fov_channel: "1200".to_string(),
            characterisation_file: Some("ATS_CH1_AX".to_string()),
            fov_measurement_file: None,
            pixel_reference: "Centre".to_string(),
            orthorectified: false,
            no_data_fill: NO_DATA_FILL,
            scan_below_minimum_fill: SCAN_BELOW_MINIMUM_FILL,
            subset: None,
            first_row: 0,
            first_col: 0,
            failed_bands: vec![2],
            created: "2008-03-01T12:00:00Z".to_string(),
        }
    }

    fn output() -> UngridOutput {
        let mut records = Array2::from_elem((2, 3), PixelRecord::no_data());
        records[[0, 1]] = PixelRecord::from_views(
            ViewSample {
                latitude: -12.5,
                longitude: 130.25,
                time: 3001.25,
                fov_across: 1.0,
                fov_along: 1.5,
                validity: PixelValidity::Valid,
            },
            ViewSample::invalid(PixelValidity::ScanBelowMinimum),
        );
        UngridOutput {
            bounds: ImageBounds::new(0, 2, 0, 3).unwrap(),
            records,
            failed_bands: vec![],
        }
    }

    #[test]
    fn test_netcdf_groups_and_attributes() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.nc");
        NetCdfWriter::write(&path, ContainerFormat::NetCdf4, &output(), &attributes()).unwrap();

        let reader = NetCdfReader::open(&path).unwrap();
        assert_eq!(reader.shape().unwrap(), (2, 3));
        assert_eq!(reader.text_attribute("format").unwrap().as_deref(), Some("NetCDF-4"));
        assert_eq!(reader.text_attribute("pixel_reference").unwrap().as_deref(), Some("Centre"));
        assert_eq!(reader.text_attribute("fov_measurement_file").unwrap(), None);
        assert_eq!(reader.number_attribute("no_data_fill").unwrap(), Some(NO_DATA_FILL));

        let lat = reader.dataset("Geolocation", "nadir_latitude").unwrap();
        assert_eq!(lat, vec![NO_DATA_FILL, -12.5, NO_DATA_FILL, NO_DATA_FILL, NO_DATA_FILL, NO_DATA_FILL]);
        let forward = reader.dataset("Geolocation", "forward_longitude").unwrap();
        assert_eq!(forward[1], SCAN_BELOW_MINIMUM_FILL);
        let time = reader.dataset("Acquisition_Times", "nadir_time").unwrap();
        assert_eq!(time[1], 3001.25);
        assert!(reader.dataset("FOV_Projection", "nadir_latitude").is_err());
    }

    #[test]
    fn test_hdf5_output_staged_then_moved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.h5");
        NetCdfWriter::write(&path, ContainerFormat::Hdf5, &output(), &attributes()).unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        // HDF5 signature
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..8], b"\x89HDF\r\n\x1a\n");

        let reader = NetCdfReader::open(&path).unwrap();
        assert_eq!(reader.text_attribute("format").unwrap().as_deref(), Some("HDF5"));
        let along = reader.dataset("FOV_Projection", "nadir_fov_along").unwrap();
        assert_eq!(along[1], 1.5);
    }
}
