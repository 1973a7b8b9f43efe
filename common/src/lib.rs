//! Helpers shared by the QDMA daemon and control utility.

use std::io::Write;

use log::LevelFilter;

pub mod page;

/// Install the process logger.
///
/// `RUST_LOG` takes precedence over `level` so a single daemon can be made
/// chattier without touching its command line.
pub fn setup_logging(name: &'static str, level: LevelFilter) {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(level)
        .format(move |buf, record| {
            writeln!(
                buf,
                "{} {:<5} {}: {}",
                name,
                record.level(),
                record.target(),
                record.args()
            )
        })
        .parse_default_env();

    if builder.try_init().is_err() {
        // Already installed (tests, or a second call from the same process).
        log::debug!("{}: logger already initialised", name);
    }
}

/// Map a `-v` count to a level filter.
pub fn verbosity_level(verbosity: usize) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}
