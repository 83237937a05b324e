//! convhost migration controller
//!
//! [`MigrationController`] drives one VM from inspection to a running
//! destination VM. [`RunContext`] fixes where the run keeps its files; the
//! cutover sentinel and limits file in [`signals`] let an operator steer the
//! sync loop while it runs.

pub mod context;
pub mod controller;
pub mod error;
pub mod poll;
pub mod signals;

pub use context::RunContext;
pub use controller::{MigrationController, INSPECTION_SNAPSHOT};
pub use error::{MigrationError, MigrationResult};
pub use signals::{CutoverSignal, LimitsFile};
