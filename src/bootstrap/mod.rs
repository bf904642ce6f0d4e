//! Process setup helpers for binaries embedding the transport.

mod tracing_init;

pub use tracing_init::{init_tracing, try_init_tracing};
