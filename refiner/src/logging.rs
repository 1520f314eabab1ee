//! Diagnostic tracing for the refiner binary.
//!
//! Diagnostics go to stderr and are controlled by `RUST_LOG` or the CLI's
//! `-v` count. Run reports are product output and never pass through here;
//! the library only emits events and never installs a subscriber.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter directive for a `-v` count.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "refiner=info,warn",
        2 => "refiner=debug,info",
        _ => "trace",
    }
}

/// Install the stderr subscriber.
///
/// `RUST_LOG` wins over `verbosity` when set and valid.
///
/// ```bash
/// RUST_LOG=refiner::io::sandbox=debug refiner run --spec spec.md --oracle test_impl.py
/// ```
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
