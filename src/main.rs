//! Command-line entry point

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use ungrid::{PixelCoordinate, PixelReference, RunConfig, SubsetWindow, UngridProcessor};

#[derive(Parser, Debug)]
#[command(name = "ungrid")]
#[command(version, about = "Ungrid pixel geolocation, acquisition time and FOV from a level-1B product")]
struct Args {
    /// Input product (.xml or .zip)
    product: PathBuf,

    /// Output file: .zip archive, .h5 HDF5, otherwise NetCDF-4
    output: PathBuf,

    /// Level-1B characterisation file, recorded in the output attributes
    #[arg(long)]
    characterisation_file: Option<PathBuf>,

    /// FOV calibration measurement file, recorded in the output attributes
    #[arg(long)]
    fov_measurement_file: Option<PathBuf>,

    /// Image rows per band task
    #[arg(long, default_value_t = 1000, env = "UNGRID_ROWS_PER_BAND")]
    rows_per_band: usize,

    /// Fraction of the IFOV reported as footprint extent
    #[arg(long, default_value_t = 0.4)]
    ifov_extent: f64,

    /// Keep image rows beyond the annotation coverage
    #[arg(long)]
    no_trim: bool,

    /// Pixel coordinate reference: Corner or Centre
    #[arg(long, default_value = "Corner", value_parser = parse_reference)]
    pixel_reference: PixelReference,

    /// Apply terrain parallax correction (needs --dem)
    #[arg(long)]
    orthorectify: bool,

    /// DEM tile directory, SRTM .hgt(.gz) tile or GDAL raster
    #[arg(long, env = "UNGRID_DEM")]
    dem: Option<PathBuf>,

    /// First subset pixel [x,y]; alone it selects a single pixel
    #[arg(long, value_parser = parse_coordinate)]
    subset_start: Option<PixelCoordinate>,

    /// Exclusive second subset corner [x,y]
    #[arg(long, value_parser = parse_coordinate, requires = "subset_start")]
    subset_end: Option<PixelCoordinate>,

    /// Worker threads (default: number of CPU cores)
    #[arg(long, env = "UNGRID_WORKERS")]
    workers: Option<usize>,

    /// Overall timeout in seconds
    #[arg(long, default_value_t = 3600)]
    timeout: u64,

    /// Channel whose FOV map is reported
    #[arg(long, default_value = "1200")]
    fov_channel: String,
}

fn parse_coordinate(s: &str) -> std::result::Result<PixelCoordinate, String> {
    s.parse().map_err(|e: ungrid::UngridError| e.to_string())
}

fn parse_reference(s: &str) -> std::result::Result<PixelReference, String> {
    s.parse().map_err(|e: ungrid::UngridError| e.to_string())
}

impl Args {
    fn into_config(self) -> RunConfig {
        let subset = self.subset_start.map(|start| match self.subset_end {
            Some(end) => SubsetWindow::window(start, end),
            None => SubsetWindow::pixel(start),
        });
        RunConfig {
            product: self.product,
            characterisation_file: self.characterisation_file,
            fov_measurement_file: self.fov_measurement_file,
            output: self.output,
            rows_per_band: self.rows_per_band,
            ifov_reporting_extent: self.ifov_extent,
            trim: !self.no_trim,
            pixel_reference: self.pixel_reference,
            orthorectify: self.orthorectify,
            dem: self.dem,
            subset,
            workers: self.workers,
            timeout_s: self.timeout,
            fov_channel: self.fov_channel,
        }
    }
}

fn run(config: RunConfig) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    println!("Calculating pixel geolocation, sample times and FOV");

    let summary = UngridProcessor::new(config)
        .run()
        .context("Ungridding failed")?;

    if summary.failed_bands > 0 {
        log::warn!("{} bands failed and were written as no data", summary.failed_bands);
    }
    println!("Processing complete");
    println!("Output file written to: {}", summary.output.display());
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    println!("ungrid {}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(args.into_config()) {
        log::error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
