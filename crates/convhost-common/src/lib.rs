//! convhost common types
//!
//! Shared vocabulary for the conversion host: the migration request and its
//! validation, the hardware/disk/NIC descriptors exchanged with platform
//! providers, change-tracking extents, and the runner configuration.

pub mod config;
pub mod error;
pub mod request;
pub mod types;

pub use config::{
    ConversionConfig, LoggingConfig, PathsConfig, PolicyConfig, PollBudget, PollingConfig,
    RunnerConfig, SyncConfig,
};
pub use error::{CommonError, Result};
pub use request::{
    DestinationKind, Mappings, MigrationRequest, RequestValidator, SideRequest, SourceKind,
};
pub use types::{
    ChangeExtent, CpuTopology, DestinationDisk, DiskDescriptor, DiskFormat, DiskMapping,
    HardwareDescriptor, NicDescriptor, NicSpec, OperatingSystemDescriptor, VmMetadata, VmSpec,
};

/// One mebibyte
pub const MIB: u64 = 1024 * 1024;

/// One gibibyte
pub const GIB: u64 = 1024 * MIB;
