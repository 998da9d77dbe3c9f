//! Shared HTTP vocabulary types

pub use method::Method;
pub use status_code::StatusCode;

pub mod limits;
mod method;
mod status_code;

/// Limits configuration re-export
pub use limits::Config as LimitsConfig;
