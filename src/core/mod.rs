//! Core ungridding and orthorectification modules

pub mod annotation_index;
pub mod pixel_geometry;
pub mod row_interpolator;
pub mod scheduler;
pub mod ephemeris;
pub mod topographic;
pub mod geodesy;
pub mod pipeline;

// Re-export main types
pub use annotation_index::{ScanNumberGranule, ScanNumberTable, ScanPixelIndex};
pub use pixel_geometry::{FootprintExtent, GeometryParams, PixelGeometryEntry, PixelProjection};
pub use row_interpolator::{AnnotationSet, GeolocationTable, RowInterpolator, ScanPixelTable, TimingParams};
pub use scheduler::{
    partition_rows, BandFailure, BandOutcome, BandWorker, ImageBounds, RowBand, RowScheduler, SchedulerConfig,
    UngridOutput,
};
pub use ephemeris::{Ephemeris, NumericalPropagator, Propagator, PropagatorSettings};
pub use topographic::{CorrectionOutcome, SatelliteTrack, SkipReason, TopographicCorrector};
pub use geodesy::vincenty_distance;
pub use pipeline::{CorrectionTally, PixelPipeline, RunSummary, UngridProcessor};
