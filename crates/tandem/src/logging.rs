//! `tracing` subscriber bootstrap shared by binaries and tests.

use tracing_subscriber::EnvFilter;

/// Environment variable holding an `EnvFilter` directive string.
pub const LOG_ENV: &str = "TANDEM_LOG";

/// Installs a fmt subscriber once per process.
///
/// `TANDEM_LOG` wins when set; otherwise the verbosity picks the level
/// (0 = warn, 1 = info, 2 = debug, 3+ = trace). Later calls are no-ops.
pub fn init(verbosity: u8) {
    let fallback = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbosity >= 2)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Test-friendly variant that routes output through the libtest capture.
pub fn init_for_tests() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
