use env_logger::{Builder, Env};
use log::LevelFilter;
use std::io::Write;

use crate::verbosity::Verbosity;

/// Initialize the logging system with the given verbosity level.
pub(crate) fn init_logging(verbose: &Verbosity) {
    // Set a base level for all modules to `warn`, which is a reasonable default.
    // It will be overridden by RUST_LOG if it's set.
    let env = Env::default().filter_or("RUST_LOG", "warn");

    let mut builder = Builder::from_env(env);
    builder
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false);

    if std::env::var("RUST_LOG").is_err() {
        let level_filter = verbose.log_level_filter();

        // Other crates stay at `warn`, ours follow `-v` and `-q`
        builder.filter_level(LevelFilter::Warn);
        builder
            .filter_module("fanout", level_filter)
            .filter_module("fanout_lib", level_filter);
    }

    // Logs go to stderr without colors, so they never mix with results on stdout
    builder.format(move |buf, record| writeln!(buf, "[{}] {}", record.level(), record.args()));

    builder.init();
}
