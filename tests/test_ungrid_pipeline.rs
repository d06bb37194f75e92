use approx::assert_abs_diff_eq;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use ungrid::config::{PixelCoordinate, RunConfig, SubsetWindow};
use ungrid::core::pixel_geometry::{GeometryParams, PixelProjection};
use ungrid::core::geodesy::vincenty_distance;
use ungrid::core::topographic::geodetic_to_ecef;
use ungrid::io::writer::{ContainerReader, Manifest};
use ungrid::types::{datetime_to_mjd2000, NO_DATA_FILL, SCAN_BELOW_MINIMUM_FILL};
use ungrid::{UngridError, UngridProcessor};

const WIDTH: usize = 8;
const HEIGHT: usize = 96;
const FIRST_SCAN: usize = 40;
const NADIR_FIRST_PIXEL: usize = 100;
const FORWARD_FIRST_PIXEL: usize = 1500;

fn acquisition_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2008, 3, 19, 12, 0, 0).unwrap()
}

fn join(values: impl IntoIterator<Item = f64>) -> String {
    values
        .into_iter()
        .map(|v| format!("{}", v))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Synthetic product whose tie points put pixel (row, col) of the nadir view
/// at lat = 50 + row / 100, lon = (-450 + col / 2) / 100
struct ProductBuilder {
    nadir_scans: Vec<Vec<usize>>,
    forward_scans: Vec<Vec<usize>>,
}

impl ProductBuilder {
    fn new() -> Self {
        let scans = (0..HEIGHT / 32).map(|g| vec![FIRST_SCAN + 32 * g; WIDTH]).collect::<Vec<_>>();
        Self {
            nadir_scans: scans.clone(),
            forward_scans: scans,
        }
    }

    fn scan_pix_ads(name: &str, scans: &[Vec<usize>], first_pixel: usize) -> String {
        let mut xml = format!("  <ads name=\"{}\">\n", name);
        for granule in scans {
            xml.push_str(&format!(
                "    <record><attribute name=\"instr_scan_num\">{}</attribute><attribute name=\"pix_num\">{}</attribute></record>\n",
                join(granule.iter().map(|&s| s as f64)),
                join((0..WIDTH).map(|c| (first_pixel + c) as f64)),
            ));
        }
        xml.push_str("  </ads>\n");
        xml
    }

    fn xml(&self) -> String {
        let start = acquisition_start();
        let t0 = datetime_to_mjd2000(start);
        let position = geodetic_to_ecef(50.5, -4.5, 800_000.0);
        let (lat, lon) = (50.5f64.to_radians(), -4.5f64.to_radians());
        let north = [-lat.sin() * lon.cos(), -lat.sin() * lon.sin(), lat.cos()];

        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<product name=\"ATS_TOA_1PSYNTH\">\n");
        xml.push_str(&format!(
            "  <acquisition start=\"{}\" stop=\"{}\"/>\n",
            start.to_rfc3339(),
            (start + chrono::Duration::seconds(20)).to_rfc3339()
        ));
        xml.push_str(&format!(
            "  <stateVector time=\"{}\" x=\"{}\" y=\"{}\" z=\"{}\" vx=\"{}\" vy=\"{}\" vz=\"{}\"/>\n",
            start.to_rfc3339(),
            position[0],
            position[1],
            position[2],
            7450.0 * north[0],
            7450.0 * north[1],
            7450.0 * north[2]
        ));
        xml.push_str(&format!(
            "  <band name=\"btemp_nadir_1200\" width=\"{}\" height=\"{}\"/>\n",
            WIDTH, HEIGHT
        ));
        xml.push_str(&Self::scan_pix_ads("NADIR_VIEW_SCAN_PIX_NUM_ADS", &self.nadir_scans, NADIR_FIRST_PIXEL));
        xml.push_str(&Self::scan_pix_ads("FWARD_VIEW_SCAN_PIX_NUM_ADS", &self.forward_scans, FORWARD_FIRST_PIXEL));

        xml.push_str("  <ads name=\"SCAN_PIXEL_X_AND_Y_ADS\">\n    <attribute name=\"tie_pix_num\">0 1000 2000</attribute>\n");
        for k in 0..HEIGHT / 32 {
            xml.push_str(&format!(
                "    <record><attribute name=\"instr_scan_num\">{}</attribute><attribute name=\"dsr_time\">{}</attribute><attribute name=\"img_scan_y\">{}</attribute><attribute name=\"pix_x\">-500 0 500</attribute><attribute name=\"pix_y\">0 0 0</attribute></record>\n",
                FIRST_SCAN + 32 * k,
                t0 + (32 * k) as f64 * 0.15 / 86400.0,
                32 * k
            ));
        }
        xml.push_str("  </ads>\n");

        xml.push_str("  <ads name=\"GEOLOCATION_ADS\">\n    <attribute name=\"tie_pt_x\">-600 0 600</attribute>\n");
        for k in 0..=HEIGHT / 32 {
            let lat = 50.0 + (32 * k) as f64 / 100.0;
            xml.push_str(&format!(
                "    <record><attribute name=\"img_scan_y\">{}</attribute><attribute name=\"tie_pt_lat\">{} {} {}</attribute><attribute name=\"tie_pt_long\">-6 0 6</attribute></record>\n",
                32 * k,
                lat,
                lat,
                lat
            ));
        }
        xml.push_str("  </ads>\n</product>\n");
        xml
    }

    fn write(&self, dir: &Path) -> PathBuf {
        let path = dir.join("product.xml");
        std::fs::write(&path, self.xml()).unwrap();
        path
    }
}

fn expected_nadir(row: usize, col: usize) -> (f64, f64) {
    let x = -500.0 + 0.5 * (NADIR_FIRST_PIXEL + col) as f64;
    (50.0 + row as f64 / 100.0, x / 100.0)
}

fn expected_forward(row: usize, col: usize) -> (f64, f64) {
    let x = -500.0 + 0.5 * (FORWARD_FIRST_PIXEL + col) as f64;
    (50.0 + row as f64 / 100.0, x / 100.0)
}

fn config(product: PathBuf, output: PathBuf) -> RunConfig {
    RunConfig {
        product,
        output,
        rows_per_band: 10,
        workers: Some(2),
        ..RunConfig::default()
    }
}

fn read_container(path: &Path) -> (Manifest, HashMap<String, Vec<f64>>) {
    let mut reader = ContainerReader::open(path).unwrap();
    let manifest = reader.manifest().unwrap();
    let mut datasets = HashMap::new();
    for group in &manifest.groups {
        for entry in &group.datasets {
            datasets.insert(entry.name.clone(), reader.dataset(entry).unwrap());
        }
    }
    (manifest, datasets)
}

/// 11x11 SRTM tile of constant height
fn write_tile(dir: &Path, name: &str, height: i16) {
    let bytes: Vec<u8> = (0..11 * 11).flat_map(|_| height.to_be_bytes()).collect();
    std::fs::write(dir.join(name), bytes).unwrap();
}

#[test]
fn test_end_to_end_geolocation_and_times() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let product = ProductBuilder::new().write(dir.path());
    let output = dir.path().join("out.zip");

    let summary = UngridProcessor::new(config(product, output.clone())).run().unwrap();
    assert_eq!(summary.failed_bands, 0);
    assert_eq!(summary.bounds.rows(), HEIGHT);
    assert_eq!(summary.bounds.cols(), WIDTH);

    let (manifest, data) = read_container(&output);
    let attributes = &manifest.global_attributes;
    assert_eq!(attributes.input_file, "product.xml");
    assert_eq!(attributes.product_name, "ATS_TOA_1PSYNTH");
    assert!(attributes.trimmed);
    assert_eq!(attributes.ifov_reporting_extent, 0.4);
    assert_eq!(attributes.fov_channel, "1200");
    assert_eq!(attributes.no_data_fill, NO_DATA_FILL);
    assert_eq!(attributes.scan_below_minimum_fill, SCAN_BELOW_MINIMUM_FILL);
    assert_eq!(attributes.subset, None);

    let t0 = datetime_to_mjd2000(acquisition_start());
    let projection = PixelProjection::build(&GeometryParams::default(), WIDTH).unwrap();
    for row in [0, 1, 31, 32, 50, 64, 95] {
        for col in [0, 3, 7] {
            let i = row * WIDTH + col;
            let (lat, lon) = expected_nadir(row, col);
            assert_abs_diff_eq!(data["nadir_latitude"][i], lat, epsilon = 1e-4);
            assert_abs_diff_eq!(data["nadir_longitude"][i], lon, epsilon = 1e-4);
            let (lat, lon) = expected_forward(row, col);
            assert_abs_diff_eq!(data["forward_latitude"][i], lat, epsilon = 1e-4);
            assert_abs_diff_eq!(data["forward_longitude"][i], lon, epsilon = 1e-4);

            let time = t0 + (row as f64 * 0.15 + (NADIR_FIRST_PIXEL + col) as f64 * 0.15 / 2000.0) / 86400.0;
            assert_abs_diff_eq!(data["nadir_time"][i], time, epsilon = 1e-9);

            let entry = projection.get(col).unwrap();
            assert_abs_diff_eq!(data["nadir_fov_across"][i], entry.nadir.across, epsilon = 1e-4);
            assert_abs_diff_eq!(data["forward_fov_along"][i], entry.forward.along, epsilon = 1e-4);
        }
    }
}

#[test]
fn test_unmapped_granule_is_no_data() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = ProductBuilder::new();
    builder.nadir_scans[1][3] = 0;
    let product = builder.write(dir.path());
    let output = dir.path().join("out.zip");
    UngridProcessor::new(config(product, output.clone())).run().unwrap();

    let (_, data) = read_container(&output);
    for row in 32..64 {
        let i = row * WIDTH + 3;
        for name in ["nadir_latitude", "nadir_longitude", "nadir_time", "nadir_fov_across"] {
            assert_eq!(data[name][i], NO_DATA_FILL, "{} row {}", name, row);
        }
        assert_ne!(data["forward_latitude"][i], NO_DATA_FILL);
    }
    assert_ne!(data["nadir_latitude"][31 * WIDTH + 3], NO_DATA_FILL);
    assert_ne!(data["nadir_latitude"][64 * WIDTH + 3], NO_DATA_FILL);
}

#[test]
fn test_scan_below_minimum_marked() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = ProductBuilder::new();
    builder.forward_scans[0][0] = 5;
    let product = builder.write(dir.path());
    let output = dir.path().join("out.zip");
    UngridProcessor::new(config(product, output.clone())).run().unwrap();

    let (_, data) = read_container(&output);
    for row in [0, 10, 26] {
        let i = row * WIDTH;
        assert_eq!(data["forward_latitude"][i], SCAN_BELOW_MINIMUM_FILL);
        assert_eq!(data["forward_time"][i], SCAN_BELOW_MINIMUM_FILL);
        assert_ne!(data["nadir_latitude"][i], SCAN_BELOW_MINIMUM_FILL);
    }
}

#[test]
fn test_scan_before_first_annotated_scan_is_no_data() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = ProductBuilder::new();
    // scans 35..=39 are resolvable but precede the first x-y record (40)
    builder.nadir_scans[0][2] = 35;
    let product = builder.write(dir.path());
    let output = dir.path().join("out.zip");
    UngridProcessor::new(config(product, output.clone())).run().unwrap();

    let (_, data) = read_container(&output);
    for row in 0..5 {
        let i = row * WIDTH + 2;
        for name in ["nadir_latitude", "nadir_longitude", "nadir_time", "nadir_fov_along"] {
            assert_eq!(data[name][i], NO_DATA_FILL, "{} row {}", name, row);
            assert_ne!(data[name][i], SCAN_BELOW_MINIMUM_FILL);
        }
        assert_ne!(data["forward_latitude"][i], NO_DATA_FILL);
    }
    // row 5 resolves to scan 40, the first annotated scan
    let (lat, _) = expected_nadir(0, 2);
    assert_abs_diff_eq!(data["nadir_latitude"][5 * WIDTH + 2], lat, epsilon = 1e-4);
}

#[cfg(feature = "netcdf")]
#[test]
fn test_netcdf_output_matches_zip() {
    use ungrid::io::NetCdfReader;

    let dir = tempfile::tempdir().unwrap();
    let product = ProductBuilder::new().write(dir.path());
    let zip_path = dir.path().join("out.zip");
    let nc_path = dir.path().join("out.nc");
    UngridProcessor::new(config(product.clone(), zip_path.clone())).run().unwrap();
    UngridProcessor::new(config(product, nc_path.clone())).run().unwrap();

    let (_, zipped) = read_container(&zip_path);
    let reader = NetCdfReader::open(&nc_path).unwrap();
    assert_eq!(reader.shape().unwrap(), (HEIGHT, WIDTH));
    assert_eq!(
        reader.text_attribute("product_name").unwrap().as_deref(),
        Some("ATS_TOA_1PSYNTH")
    );
    for (group, name) in [
        ("Geolocation", "forward_latitude"),
        ("Acquisition_Times", "nadir_time"),
        ("FOV_Projection", "forward_fov_across"),
    ] {
        assert_eq!(reader.dataset(group, name).unwrap(), zipped[name], "{}", name);
    }
}

#[test]
fn test_band_layout_does_not_change_output() {
    let dir = tempfile::tempdir().unwrap();
    let product = ProductBuilder::new().write(dir.path());

    let single = dir.path().join("single.zip");
    let mut c = config(product.clone(), single.clone());
    c.rows_per_band = HEIGHT;
    c.workers = Some(1);
    UngridProcessor::new(c).run().unwrap();

    let banded = dir.path().join("banded.zip");
    let mut c = config(product, banded.clone());
    c.rows_per_band = 7;
    c.workers = Some(4);
    UngridProcessor::new(c).run().unwrap();

    let (_, a) = read_container(&single);
    let (_, b) = read_container(&banded);
    assert_eq!(a.len(), 10);
    for (name, values) in &a {
        assert_eq!(values, &b[name], "dataset {}", name);
    }
}

#[test]
fn test_subset_window() {
    let dir = tempfile::tempdir().unwrap();
    let product = ProductBuilder::new().write(dir.path());
    let output = dir.path().join("out.zip");
    let mut c = config(product, output.clone());
    c.subset = Some(SubsetWindow::window(
        PixelCoordinate { x: 2, y: 10 },
        PixelCoordinate { x: 5, y: 40 },
    ));
    let summary = UngridProcessor::new(c).run().unwrap();
    assert_eq!(summary.bounds.rows(), 30);

    let (manifest, data) = read_container(&output);
    assert_eq!(manifest.groups[0].datasets[0].shape, [30, 3]);
    assert_eq!(manifest.global_attributes.subset, Some([10, 40, 2, 5]));
    assert!(!manifest.global_attributes.trimmed);
    assert_eq!(manifest.global_attributes.first_row, 10);

    let (lat, lon) = expected_nadir(33, 4);
    let i = (33 - 10) * 3 + (4 - 2);
    assert_abs_diff_eq!(data["nadir_latitude"][i], lat, epsilon = 1e-4);
    assert_abs_diff_eq!(data["nadir_longitude"][i], lon, epsilon = 1e-4);
}

#[test]
fn test_single_pixel_subset() {
    let dir = tempfile::tempdir().unwrap();
    let product = ProductBuilder::new().write(dir.path());
    let output = dir.path().join("out.zip");
    let mut c = config(product, output.clone());
    c.subset = Some(SubsetWindow::pixel(PixelCoordinate { x: 6, y: 70 }));
    UngridProcessor::new(c).run().unwrap();

    let (_, data) = read_container(&output);
    assert_eq!(data["nadir_latitude"].len(), 1);
    let (lat, _) = expected_nadir(70, 6);
    assert_abs_diff_eq!(data["nadir_latitude"][0], lat, epsilon = 1e-4);
}

#[test]
fn test_subset_outside_image_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let product = ProductBuilder::new().write(dir.path());
    let output = dir.path().join("out.zip");
    let mut c = config(product, output.clone());
    c.subset = Some(SubsetWindow::window(
        PixelCoordinate { x: 0, y: 0 },
        PixelCoordinate { x: WIDTH + 1, y: 10 },
    ));
    let result = UngridProcessor::new(c).run();
    assert!(matches!(result, Err(UngridError::Config(_))));
    assert!(!output.exists());
}

#[test]
fn test_orthorectification_shifts_positions() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let product = ProductBuilder::new().write(dir.path());
    let dem_dir = dir.path().join("dem");
    std::fs::create_dir(&dem_dir).unwrap();
    write_tile(&dem_dir, "N50W005.hgt", 1000);
    write_tile(&dem_dir, "N50E002.hgt", 1000);

    let plain = dir.path().join("plain.zip");
    UngridProcessor::new(config(product.clone(), plain.clone())).run().unwrap();

    let ortho = dir.path().join("ortho.zip");
    let mut c = config(product, ortho.clone());
    c.orthorectify = true;
    c.dem = Some(dem_dir);
    UngridProcessor::new(c).run().unwrap();

    let (manifest, corrected) = read_container(&ortho);
    assert!(manifest.global_attributes.orthorectified);
    let (_, original) = read_container(&plain);

    let mut moved = 0;
    for name in ["nadir_latitude", "nadir_longitude", "forward_latitude", "forward_longitude"] {
        for (a, b) in original[name].iter().zip(&corrected[name]) {
            let shift = (a - b).abs();
            assert!(shift < 0.02, "{} shifted by {}", name, shift);
            if shift > 0.0 {
                moved += 1;
            }
        }
    }
    assert!(moved > 0);
    assert_eq!(original["nadir_time"], corrected["nadir_time"]);

    // 1000 m of terrain seen from near nadir displaces by well under a kilometre
    for i in [0, WIDTH * 50 + 4, WIDTH * HEIGHT - 1] {
        let d = vincenty_distance(
            original["nadir_latitude"][i],
            original["nadir_longitude"][i],
            corrected["nadir_latitude"][i],
            corrected["nadir_longitude"][i],
        )
        .unwrap();
        assert!(d < 1000.0, "pixel {} moved {} m", i, d);
    }
}

#[test]
fn test_implausible_terrain_leaves_positions() {
    let dir = tempfile::tempdir().unwrap();
    let product = ProductBuilder::new().write(dir.path());
    let dem_dir = dir.path().join("dem");
    std::fs::create_dir(&dem_dir).unwrap();
    write_tile(&dem_dir, "N50W005.hgt", 9500);
    write_tile(&dem_dir, "N50E002.hgt", 9500);

    let plain = dir.path().join("plain.zip");
    UngridProcessor::new(config(product.clone(), plain.clone())).run().unwrap();

    let ortho = dir.path().join("ortho.zip");
    let mut c = config(product, ortho.clone());
    c.orthorectify = true;
    c.dem = Some(dem_dir);
    UngridProcessor::new(c).run().unwrap();

    let (_, a) = read_container(&plain);
    let (_, b) = read_container(&ortho);
    assert_eq!(a["nadir_latitude"], b["nadir_latitude"]);
    assert_eq!(a["forward_longitude"], b["forward_longitude"]);
}

#[test]
fn test_zipped_product() {
    let dir = tempfile::tempdir().unwrap();
    let product = dir.path().join("product.zip");
    let mut zip = zip::ZipWriter::new(std::fs::File::create(&product).unwrap());
    zip.start_file("ATS_TOA_1PSYNTH/product.xml", zip::write::FileOptions::default())
        .unwrap();
    zip.write_all(ProductBuilder::new().xml().as_bytes()).unwrap();
    zip.finish().unwrap();

    let output = dir.path().join("out.zip");
    let mut c = config(product, output.clone());
    c.pixel_reference = ungrid::PixelReference::Centre;
    UngridProcessor::new(c).run().unwrap();

    let (manifest, data) = read_container(&output);
    assert_eq!(manifest.global_attributes.input_file, "product.zip");
    assert_eq!(manifest.global_attributes.pixel_reference, "Centre");
    let (_, lon) = expected_nadir(0, 0);
    assert_abs_diff_eq!(data["nadir_longitude"][0], lon + 0.5 * 0.5 / 100.0, epsilon = 1e-4);
}

#[test]
fn test_missing_product_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.zip");
    let result = UngridProcessor::new(config(dir.path().join("absent.xml"), output.clone())).run();
    assert!(result.is_err());
    assert!(!output.exists());
}
