//! Product, terrain and output collaborators

pub mod dem;
pub mod product;
pub mod writer;
#[cfg(feature = "netcdf")]
pub mod netcdf_writer;

pub use dem::{DemAccessor, DemReader, GridDem};
pub use product::{ProductReader, XmlProductReader};
pub use writer::{ContainerFormat, ContainerReader, ContainerWriter, GlobalAttributes, Manifest};
#[cfg(feature = "netcdf")]
pub use netcdf_writer::{NetCdfReader, NetCdfWriter};
