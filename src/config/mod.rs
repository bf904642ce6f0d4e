//! Transport configuration with environment variable support.

mod base;
mod size;

pub use base::{
    ConfigError, CorsConfig, ResponseMode, ResumabilityConfig, ResumabilityMode, SessionConfig,
    TransportConfig,
};
pub use size::parse_size;
