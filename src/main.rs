use std::{path::PathBuf, process::exit};

use clap::Parser;
use log::LevelFilter;

use updater::{adapters::HostAdapters, bootstrap, bus::ProgressBus, config::LocalConfig, logging};

/// Apply an offline update package to this host.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Path to the update package (.tar.gz)
    #[arg(required_unless_present = "staged", conflicts_with = "staged")]
    package: Option<PathBuf>,

    /// Run against an already staged and verified tree. Used by an older
    /// bootstrap when handing off to the engine bundled in a package.
    #[arg(long, value_name = "DIR", hide = true)]
    staged: Option<PathBuf>,

    /// Base directory for updater state (default: /opt/updater, or
    /// $UPDATER_BASE_DIR)
    #[arg(long, value_name = "DIR")]
    base_dir: Option<PathBuf>,

    /// Logging verbosity [OFF, ERROR, WARN, INFO, DEBUG, TRACE]
    #[arg(short, long, default_value_t = LevelFilter::Info)]
    verbosity: LevelFilter,
}

fn main() {
    let args = Args::parse();
    logging::init(args.verbosity);

    let mut config = LocalConfig::from_env();
    if let Some(base_dir) = args.base_dir {
        config.base_dir = base_dir;
    }

    let bus = ProgressBus::new();
    let adapters = HostAdapters::host();

    let code = match (&args.package, &args.staged) {
        (Some(package), None) => bootstrap::run_package(package, &config, &bus, adapters),
        (None, Some(root)) => bootstrap::run_staged(root, &config, &bus, adapters),
        _ => unreachable!("clap enforces exactly one input"),
    };
    exit(code);
}
