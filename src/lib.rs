//! ungrid: pixel geolocation ungridding for dual-view scanning radiometers
//!
//! Recovers the true geolocation, acquisition time and field-of-view footprint
//! of every image pixel of a level-1B product from its tie-point annotation
//! data sets, optionally corrects positions for terrain parallax, and writes
//! the results to a self-describing container.

pub mod types;
pub mod config;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    PixelRecord, PixelReference, PixelValidity, UngridError, UngridResult, View, ViewSample,
};
pub use config::{PixelCoordinate, RunConfig, SubsetWindow};
pub use io::{DemReader, XmlProductReader};
pub use crate::core::{RunSummary, UngridProcessor};
