//! End-to-end ungridding run: product in, container out

use crate::config::RunConfig;
use crate::core::ephemeris::{NumericalPropagator, Propagator};
use crate::core::pixel_geometry::PixelProjection;
use crate::core::row_interpolator::{AnnotationSet, RowInterpolator, TimingParams};
use crate::core::scheduler::{BandWorker, ImageBounds, RowBand, RowScheduler, UngridOutput};
use crate::core::topographic::{CorrectionOutcome, TopographicCorrector};
use crate::io::dem::DemReader;
use crate::io::product::{ProductReader, XmlProductReader};
use crate::io::writer::{ContainerWriter, GlobalAttributes};
use crate::types::{PixelRecord, UngridError, UngridResult, NO_DATA_FILL, SCAN_BELOW_MINIMUM_FILL};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-pixel work shared by all bands: ungrid, then optionally orthorectify
pub struct PixelPipeline {
    interpolator: RowInterpolator,
    corrector: Option<TopographicCorrector>,
}

impl PixelPipeline {
    pub fn new(interpolator: RowInterpolator, corrector: Option<TopographicCorrector>) -> Self {
        Self {
            interpolator,
            corrector,
        }
    }
}

/// Orthorectification counts for one band
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CorrectionTally {
    pub corrected: usize,
    pub terrain_fallbacks: usize,
    pub skipped: usize,
}

impl CorrectionTally {
    pub fn add(&mut self, outcome: &CorrectionOutcome) {
        match outcome {
            CorrectionOutcome::Applied { terrain_fallback, .. } => {
                self.corrected += 1;
                if *terrain_fallback {
                    self.terrain_fallbacks += 1;
                }
            }
            CorrectionOutcome::Skipped(_) => self.skipped += 1,
        }
    }
}

impl BandWorker for PixelPipeline {
    type Tally = CorrectionTally;

    fn compute_pixel(&self, row: usize, col: usize, tally: &mut CorrectionTally) -> UngridResult<PixelRecord> {
        let mut record = self.interpolator.ungrid(row, col);
        if let Some(corrector) = &self.corrector {
            for outcome in corrector.correct(&mut record) {
                tally.add(&outcome);
                if let CorrectionOutcome::Skipped(reason) = outcome {
                    log::trace!("Pixel ({}, {}) not corrected: {:?}", row, col, reason);
                }
            }
        }
        Ok(record)
    }

    fn finish_band(&self, band: &RowBand, tally: CorrectionTally) {
        if tally.terrain_fallbacks > 0 {
            log::warn!(
                "Band {} (rows {}..{}): no terrain height for {} of {} corrected views, sea level used",
                band.index,
                band.start_row,
                band.end_row(),
                tally.terrain_fallbacks,
                tally.corrected
            );
        }
    }
}

/// What a completed run produced
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub output: PathBuf,
    pub bounds: ImageBounds,
    pub failed_bands: usize,
    pub elapsed: Duration,
}

pub struct UngridProcessor {
    config: RunConfig,
    propagator: Box<dyn Propagator>,
}

impl UngridProcessor {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            propagator: Box::new(NumericalPropagator::default()),
        }
    }

    pub fn with_propagator(mut self, propagator: Box<dyn Propagator>) -> Self {
        self.propagator = propagator;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Read the configured product, ungrid it and write the container
    pub fn run(&self) -> UngridResult<RunSummary> {
        let start_time = Instant::now();
        self.config.validate()?;

        let mut reader = XmlProductReader::open(&self.config.product)?;
        let output = self.process(&mut reader)?;

        let attributes = self.global_attributes(reader.name(), &output);
        ContainerWriter::write(&self.config.output, &output, &attributes)?;

        let elapsed = start_time.elapsed();
        log::info!(
            "Ungridding completed in {:.2}s ({} failed bands)",
            elapsed.as_secs_f64(),
            output.failed_bands.len()
        );
        Ok(RunSummary {
            output: self.config.output.clone(),
            bounds: output.bounds,
            failed_bands: output.failed_bands.len(),
            elapsed,
        })
    }

    /// Ungrid an already opened product
    pub fn process(&self, reader: &mut dyn ProductReader) -> UngridResult<UngridOutput> {
        self.config.validate()?;

        let (height, width) = reader.image_size()?;
        log::info!("Product {} image: {} rows x {} columns", reader.name(), height, width);

        let annotations = Arc::new(AnnotationSet::from_reader(reader)?);
        let bounds = self.image_bounds(height, width, &annotations)?;

        let corrector = if self.config.orthorectify {
            Some(self.build_corrector(reader)?)
        } else {
            None
        };
        reader.close();

        let projection = Arc::new(PixelProjection::build(&self.config.geometry_params(), width)?);
        let interpolator = RowInterpolator::new(
            annotations,
            projection,
            TimingParams::default(),
            self.config.pixel_reference,
        );
        let worker = Arc::new(PixelPipeline::new(interpolator, corrector));

        let scheduler_config = self.config.scheduler_config();
        log::info!("Number of worker threads: {}", scheduler_config.worker_count());
        RowScheduler::new(scheduler_config).run(bounds, worker)
    }

    /// Window to ungrid: the subset if given, else the image, trimmed to the
    /// annotated rows when requested
    pub fn image_bounds(&self, height: usize, width: usize, annotations: &AnnotationSet) -> UngridResult<ImageBounds> {
        if let Some(subset) = &self.config.subset {
            let bounds = subset.resolve(height, width)?;
            log::info!(
                "Subset rows [{}, {}) columns [{}, {})",
                bounds.min_row,
                bounds.max_row,
                bounds.min_col,
                bounds.max_col
            );
            return Ok(bounds);
        }

        let mut max_row = height;
        if self.config.trim {
            max_row = annotations.covered_rows().min(height);
            log::info!("Number of image rows covered by ADS: {} / {}", max_row, height);
        }
        ImageBounds::new(0, max_row, 0, width)
    }

    fn build_corrector(&self, reader: &dyn ProductReader) -> UngridResult<TopographicCorrector> {
        let dem_path = self.config.dem.as_ref().ok_or_else(|| {
            UngridError::Config("Orthorectification requested without a DEM".to_string())
        })?;
        let dem = DemReader::open(dem_path)?;

        let state = reader.state_vector()?;
        let ephemeris = self
            .propagator
            .propagate(&state, reader.start_time(), reader.stop_time())?;
        log::info!("Orbit ephemeris ready with {} states", ephemeris.len());

        Ok(TopographicCorrector::new(Arc::new(ephemeris), dem))
    }

    pub fn global_attributes(&self, product_name: &str, output: &UngridOutput) -> GlobalAttributes {
        let bounds = output.bounds;
        let display = |p: &Option<PathBuf>| p.as_ref().map(|p| p.display().to_string());
        GlobalAttributes {
            input_file: self
                .config
                .product
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.config.product.display().to_string()),
            product_name: product_name.to_string(),
            trimmed: self.config.trim && self.config.subset.is_none(),
            ifov_reporting_extent: self.config.ifov_reporting_extent,
            fov_channel: self.config.fov_channel.clone(),
            characterisation_file: display(&self.config.characterisation_file),
            fov_measurement_file: display(&self.config.fov_measurement_file),
            pixel_reference: self.config.pixel_reference.to_string(),
            orthorectified: self.config.orthorectify,
            no_data_fill: NO_DATA_FILL,
            scan_below_minimum_fill: SCAN_BELOW_MINIMUM_FILL,
            subset: self
                .config
                .subset
                .map(|_| [bounds.min_row, bounds.max_row, bounds.min_col, bounds.max_col]),
            first_row: bounds.min_row,
            first_col: bounds.min_col,
            failed_bands: output.failed_bands.iter().map(|f| f.band.index).collect(),
            created: Utc::now().to_rfc3339(),
        }
    }
}
