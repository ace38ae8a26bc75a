use log::LevelFilter;

/// Initialize console logging for a binary. `RUST_LOG` refines the
/// verbosity selected on the command line.
pub fn init(verbosity: LevelFilter) {
    env_logger::Builder::new()
        .filter_level(verbosity)
        .parse_default_env()
        .format_timestamp_secs()
        .init();
}
