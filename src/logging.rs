//! Logging utilities

use std::io::Write;

use env_logger::{Builder, Env};
use log::LevelFilter;

/// Initialize the logger with the given [LevelFilter]
///
/// `RUST_LOG` takes precedence over `filter`.
pub fn initialize_logger(filter: LevelFilter) {
    Builder::from_env(Env::default().default_filter_or(filter.as_str()))
        .format(|buf, record| {
            let level = record.level();
            let style = buf.default_level_style(level);

            writeln!(buf, "[{style}{level}{style:#}] {}", record.args())
        })
        .init();
}
