use updater_api::version::EngineVersion;

pub mod actions;
pub mod adapters;
pub mod backup;
pub mod bootstrap;
pub mod bus;
pub mod checks;
pub mod config;
pub mod datastore;
pub mod engine;
pub mod logging;
pub mod server;

/// Version of the engine compiled into this binary.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Parsed form of [`ENGINE_VERSION`].
pub fn installed_engine_version() -> EngineVersion {
    EngineVersion::parse(ENGINE_VERSION).expect("crate version is not a valid engine version")
}
