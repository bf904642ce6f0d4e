//! Tracing subscriber setup.

use tracing_subscriber::{
    fmt,
    prelude::*,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

/// Install a stderr subscriber filtered by `RUST_LOG`, or `default_filter`
/// when it is unset or invalid.
///
/// Stdout is left alone so a process can still speak a protocol on it.
///
/// ```rust
/// use mcp_http_stream::init_tracing;
///
/// // Per-stream and per-batch detail from the transport, info elsewhere.
/// init_tracing("mcp_http_stream=debug,info");
/// ```
///
/// Panics if a global subscriber is already set; see [`try_init_tracing`].
pub fn init_tracing(default_filter: &str) {
    subscriber(default_filter).init();
}

/// Like [`init_tracing`], but reports an already installed subscriber
/// instead of panicking.
pub fn try_init_tracing(default_filter: &str) -> Result<(), TryInitError> {
    subscriber(default_filter).try_init()
}

fn subscriber(default_filter: &str) -> impl SubscriberInitExt {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_is_reported() {
        // Only this test installs a global subscriber.
        let _ = try_init_tracing("mcp_http_stream=trace");
        assert!(try_init_tracing("info").is_err());
    }
}
