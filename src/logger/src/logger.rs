use std::io::Write;

use env_logger::{Builder, Env};

/// Install the process-wide logger.
///
/// Defaults to `info`; `RUST_LOG` overrides the filter as usual
/// (e.g. `RUST_LOG=cluster=debug,server=info`).
pub fn setup_logging() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                buf.timestamp_millis(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

