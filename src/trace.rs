//! Tracing infrastructure for debugging rotor.
//!
//! Enable with `--features tracing`. All trace macros become no-ops when
//! the feature is disabled; the transfer hot path never logs either way.

/// Initialize the tracing subscriber.
///
/// Call this at the start of tests or the bench binary to enable trace
/// output. Does nothing if the `tracing` feature is not enabled.
///
/// The ring only logs construction-time events, so the subscriber stays
/// minimal: an `RUST_LOG`-style filter plus thread names, which identify
/// the constructing thread when several threads share a ring. Timestamps
/// carry no signal at that volume and are left out.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rotor=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .without_time()
        .init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

// When tracing is enabled, re-export macros from the tracing crate.
#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error};

// When tracing is disabled, provide no-op macro implementations.
#[cfg(not(feature = "tracing"))]
macro_rules! debug_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! error_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use debug_noop as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use error_noop as error;
