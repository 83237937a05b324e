//! convhost platform providers
//!
//! Capability traits the migration controller drives, plus the providers
//! shipped with this build:
//!
//! - [`local`]: directory-backed source and destination platforms
//! - [`exposer`]: direct file and `nbdkit` disk exposure
//! - [`converter`]: external in-place converter with a libvirt descriptor
//!
//! [`resolve`] picks one implementation per capability from the request.

pub mod capabilities;
pub mod converter;
pub mod descriptor;
pub mod error;
pub mod exposer;
pub mod local;
pub mod resolve;
pub mod snapshot;

pub use capabilities::{
    ConversionJob, Converter, DestinationPlatform, DiskExposer, GuestInspector, Platforms,
    SessionOptions, SnapshotDisk, SnapshotRef, SourcePlatform, FROM_CREATION,
};
pub use converter::CommandConverter;
pub use error::{ProviderError, ProviderResult};
pub use exposer::{FileExposer, NbdkitExposer};
pub use resolve::resolve;
pub use snapshot::SnapshotTree;
