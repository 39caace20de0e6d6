//! Kiln API Types
//!
//! Defines the records exchanged between the kiln core and the
//! reconciliation layer that drives it: build requests coming in, build and
//! kit status going out, and the per-platform scheduling configuration.

pub mod build;
pub mod error;
pub mod integration;
pub mod kit;
pub mod names;
pub mod platform;

pub use build::{
    Build, BuildCondition, BuildFailure, BuildPhase, BuildRequest, BuildStrategy, ConditionKind,
    FailureKind,
};
pub use error::{ApiError, ErrorCode};
pub use integration::Integration;
pub use kit::{Kit, KitPhase, KitType};
pub use names::{validate_name, NameError};
pub use platform::{OrderStrategy, PlatformConfig};

