use clap::Parser;
use log::LevelFilter;

use updater::{config::LocalConfig, logging, server};

/// Serve the local update UI: uploads, job control and live progress.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Port to listen on (default: 8123, or $UPDATER_HTTP_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Base directory for updater state (default: /opt/updater, or
    /// $UPDATER_BASE_DIR)
    #[arg(long, value_name = "DIR")]
    base_dir: Option<std::path::PathBuf>,

    /// Logging verbosity [OFF, ERROR, WARN, INFO, DEBUG, TRACE]
    #[arg(short, long, default_value_t = LevelFilter::Info)]
    verbosity: LevelFilter,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.verbosity);

    let mut config = LocalConfig::from_env();
    if let Some(port) = args.port {
        config.http_port = port;
    }
    if let Some(base_dir) = args.base_dir {
        config.base_dir = base_dir;
    }

    server::serve(config).await
}
