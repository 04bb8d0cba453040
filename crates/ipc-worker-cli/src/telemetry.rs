//! Console logging for the `ipc-worker` binary.
//!
//! Library events are emitted through `tracing`; this installs the
//! subscriber that prints them. Verbosity follows `RUST_LOG` and defaults to
//! `info`, e.g. `RUST_LOG=ipc_worker=debug` shows role lifecycle and, with
//! `--log-timing`, per-request timings.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_telemetry() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true),
        )
        .try_init()?;
    Ok(())
}
