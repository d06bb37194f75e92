//! Row-band parallel execution of the per-pixel ungridding
//!
//! The requested image window is cut into contiguous row bands. Each band is
//! computed by one pool task into a buffer it owns, and the buffers are
//! assembled by their assigned row range once every task has reported back.

use crate::types::{PixelRecord, UngridError, UngridResult, PIXEL_FIELDS};
use ndarray::{s, Array2, Array3};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default upper bound on the wait for all bands
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Computes one pixel record; shared read-only by every band task
pub trait BandWorker: Send + Sync + 'static {
    /// Counters owned by one band task while it runs
    type Tally: Default;

    fn compute_pixel(&self, row: usize, col: usize, tally: &mut Self::Tally) -> UngridResult<PixelRecord>;

    /// Called once a band has computed every pixel
    fn finish_band(&self, _band: &RowBand, _tally: Self::Tally) {}
}

/// Half-open image window [min_row, max_row) x [min_col, max_col)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBounds {
    pub min_row: usize,
    pub max_row: usize,
    pub min_col: usize,
    pub max_col: usize,
}

impl ImageBounds {
    pub fn new(min_row: usize, max_row: usize, min_col: usize, max_col: usize) -> UngridResult<Self> {
        if min_row >= max_row || min_col >= max_col {
            return Err(UngridError::Config(format!(
                "Empty image window rows [{}, {}) cols [{}, {})",
                min_row, max_row, min_col, max_col
            )));
        }
        Ok(Self {
            min_row,
            max_row,
            min_col,
            max_col,
        })
    }

    pub fn rows(&self) -> usize {
        self.max_row - self.min_row
    }

    pub fn cols(&self) -> usize {
        self.max_col - self.min_col
    }
}

/// Contiguous rows assigned to one task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowBand {
    pub index: usize,
    /// First image row of the band
    pub start_row: usize,
    pub rows: usize,
}

impl RowBand {
    pub fn end_row(&self) -> usize {
        self.start_row + self.rows
    }
}

/// Split [min_row, max_row) into bands of `band_height` plus a remainder band
pub fn partition_rows(min_row: usize, max_row: usize, band_height: usize) -> UngridResult<Vec<RowBand>> {
    if band_height == 0 {
        return Err(UngridError::Config("Row band height must be positive".to_string()));
    }
    let total = max_row.saturating_sub(min_row);
    let full = total / band_height;
    let remainder = total % band_height;

    let mut bands: Vec<RowBand> = (0..full)
        .map(|index| RowBand {
            index,
            start_row: min_row + index * band_height,
            rows: band_height,
        })
        .collect();
    if remainder > 0 {
        bands.push(RowBand {
            index: full,
            start_row: min_row + full * band_height,
            rows: remainder,
        });
    }
    Ok(bands)
}

/// Why a band produced no output
#[derive(Debug, Clone)]
pub struct BandFailure {
    pub band: RowBand,
    pub reason: String,
}

/// Result of one band task
#[derive(Debug)]
pub enum BandOutcome {
    Completed(Array2<PixelRecord>),
    Failed(BandFailure),
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub band_height: usize,
    /// Worker threads; `None` uses the available hardware concurrency
    pub workers: Option<usize>,
    pub timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            band_height: 1000,
            workers: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl SchedulerConfig {
    pub fn worker_count(&self) -> usize {
        self.workers
            .filter(|&w| w > 0)
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
    }
}

/// Assembled records for the whole window, row-major
#[derive(Debug, Clone)]
pub struct UngridOutput {
    pub bounds: ImageBounds,
    pub records: Array2<PixelRecord>,
    pub failed_bands: Vec<BandFailure>,
}

impl UngridOutput {
    /// Record for output row/column (relative to the window origin)
    pub fn record(&self, row: usize, col: usize) -> Option<&PixelRecord> {
        self.records.get((row, col))
    }

    /// Dense [rows x cols x 10] tensor of record values
    pub fn to_tensor(&self) -> Array3<f64> {
        let (rows, cols) = self.records.dim();
        Array3::from_shape_fn((rows, cols, PIXEL_FIELDS), |(r, c, k)| self.records[[r, c]].values[k])
    }
}

pub struct RowScheduler {
    config: SchedulerConfig,
}

impl RowScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn run<W: BandWorker>(&self, bounds: ImageBounds, worker: Arc<W>) -> UngridResult<UngridOutput> {
        let bands = partition_rows(bounds.min_row, bounds.max_row, self.config.band_height)?;
        log::info!(
            "Ungridding {} rows x {} columns in {} bands of up to {} rows",
            bounds.rows(),
            bounds.cols(),
            bands.len(),
            self.config.band_height
        );

        let outcomes = self.execute(&bands, bounds, worker)?;
        Ok(Self::assemble(bounds, &bands, outcomes))
    }

    #[cfg(feature = "parallel")]
    fn execute<W: BandWorker>(
        &self,
        bands: &[RowBand],
        bounds: ImageBounds,
        worker: Arc<W>,
    ) -> UngridResult<Vec<Option<BandOutcome>>> {
        use std::sync::mpsc::{self, RecvTimeoutError};

        let workers = self.config.worker_count();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| UngridError::Processing(format!("Failed to build thread pool: {}", e)))?;
        log::debug!("Submitting {} bands to {} workers", bands.len(), workers);

        let cancelled = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        for &band in bands {
            let tx = tx.clone();
            let worker = Arc::clone(&worker);
            let cancelled = Arc::clone(&cancelled);
            pool.spawn(move || {
                let outcome = run_band(worker.as_ref(), band, bounds, &cancelled);
                // receiver gone means the run already timed out
                let _ = tx.send((band.index, outcome));
            });
        }
        drop(tx);

        let deadline = Instant::now() + self.config.timeout;
        let mut outcomes: Vec<Option<BandOutcome>> = bands.iter().map(|_| None).collect();
        let mut received = 0;
        while received < bands.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((index, outcome)) => {
                    received += 1;
                    log::info!("Band {} finished ({}/{})", index, received, bands.len());
                    outcomes[index] = Some(outcome);
                }
                Err(RecvTimeoutError::Timeout) => {
                    cancelled.store(true, Ordering::Relaxed);
                    log::error!(
                        "Timed out after {:?} with {} of {} bands finished",
                        self.config.timeout,
                        received,
                        bands.len()
                    );
                    return Err(UngridError::Timeout(self.config.timeout.as_secs()));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(UngridError::Processing(format!(
                        "Worker pool stopped with {} of {} bands finished",
                        received,
                        bands.len()
                    )));
                }
            }
        }
        Ok(outcomes)
    }

    /// Sequential fallback when the parallel feature is disabled
    #[cfg(not(feature = "parallel"))]
    fn execute<W: BandWorker>(
        &self,
        bands: &[RowBand],
        bounds: ImageBounds,
        worker: Arc<W>,
    ) -> UngridResult<Vec<Option<BandOutcome>>> {
        let start = Instant::now();
        let never = AtomicBool::new(false);
        let mut outcomes = Vec::with_capacity(bands.len());
        for &band in bands {
            outcomes.push(Some(run_band(worker.as_ref(), band, bounds, &never)));
            log::info!("Band {} finished ({}/{})", band.index, outcomes.len(), bands.len());
            if start.elapsed() > self.config.timeout {
                return Err(UngridError::Timeout(self.config.timeout.as_secs()));
            }
        }
        Ok(outcomes)
    }

    fn assemble(bounds: ImageBounds, bands: &[RowBand], outcomes: Vec<Option<BandOutcome>>) -> UngridOutput {
        let mut records = Array2::from_elem((bounds.rows(), bounds.cols()), PixelRecord::no_data());
        let mut failed_bands = Vec::new();

        for (band, outcome) in bands.iter().zip(outcomes) {
            let offset = band.start_row - bounds.min_row;
            match outcome {
                Some(BandOutcome::Completed(buffer)) => {
                    records
                        .slice_mut(s![offset..offset + band.rows, ..])
                        .assign(&buffer);
                }
                Some(BandOutcome::Failed(failure)) => {
                    log::error!(
                        "Band {} (rows {}..{}) failed, left as no data: {}",
                        band.index,
                        band.start_row,
                        band.end_row(),
                        failure.reason
                    );
                    failed_bands.push(failure);
                }
                None => {
                    failed_bands.push(BandFailure {
                        band: *band,
                        reason: "no result reported".to_string(),
                    });
                }
            }
        }

        UngridOutput {
            bounds,
            records,
            failed_bands,
        }
    }
}

/// Compute every pixel of `band` into a private buffer; stops between rows
/// once `cancelled` is set
fn run_band<W: BandWorker + ?Sized>(
    worker: &W,
    band: RowBand,
    bounds: ImageBounds,
    cancelled: &AtomicBool,
) -> BandOutcome {
    let result = panic::catch_unwind(AssertUnwindSafe(|| -> UngridResult<Array2<PixelRecord>> {
        let mut buffer = Array2::from_elem((band.rows, bounds.cols()), PixelRecord::no_data());
        let mut tally = W::Tally::default();
        for local_row in 0..band.rows {
            if cancelled.load(Ordering::Relaxed) {
                return Err(UngridError::Processing(format!(
                    "band {} cancelled at row {}",
                    band.index,
                    band.start_row + local_row
                )));
            }
            let row = band.start_row + local_row;
            for (local_col, col) in (bounds.min_col..bounds.max_col).enumerate() {
                buffer[[local_row, local_col]] = worker.compute_pixel(row, col, &mut tally)?;
            }
        }
        worker.finish_band(&band, tally);
        Ok(buffer)
    }));

    match result {
        Ok(Ok(buffer)) => BandOutcome::Completed(buffer),
        Ok(Err(e)) => BandOutcome::Failed(BandFailure {
            band,
            reason: e.to_string(),
        }),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            BandOutcome::Failed(BandFailure {
                band,
                reason: format!("panic: {}", message),
            })
        }
    }
}
