//! Narrow capability interfaces over host side effects. The engine only ever
//! talks to containers, services and HTTP endpoints through these traits, so
//! tests can drive the full phase machine with in-process fakes.

use std::{path::Path, time::Duration};

use anyhow::{Context, Error};

pub trait ContainerRuntime: Send + Sync {
    fn compose_up(&self, compose_file: &Path, detach: bool, build: bool) -> Result<(), Error>;
    fn compose_down(&self, compose_file: &Path, remove_orphans: bool) -> Result<(), Error>;
    fn load_image(&self, image_tar: &Path) -> Result<String, Error>;
    fn prune_images(&self, all: bool, force: bool) -> Result<String, Error>;
    /// Health-check status of a container, or its run state when it defines
    /// no health check.
    fn container_health(&self, container: &str) -> Result<String, Error>;
}

pub trait ServiceSupervisor: Send + Sync {
    fn is_active(&self, service: &str) -> Result<bool, Error>;
}

pub trait HttpProbe: Send + Sync {
    /// GET the url and return the response status code.
    fn probe(&self, url: &str) -> Result<u16, Error>;
}

/// The set of host adapters handed to the engine.
pub struct HostAdapters {
    pub runtime: Box<dyn ContainerRuntime>,
    pub services: Box<dyn ServiceSupervisor>,
    pub http: Box<dyn HttpProbe>,
}

impl HostAdapters {
    /// Production adapters: the docker CLI, systemctl and a blocking HTTP
    /// client.
    pub fn host() -> Self {
        Self {
            runtime: Box::new(DockerCli),
            services: Box::new(SystemctlCli),
            http: Box::new(ReqwestProbe::new()),
        }
    }
}

struct DockerCli;

impl ContainerRuntime for DockerCli {
    fn compose_up(&self, compose_file: &Path, detach: bool, build: bool) -> Result<(), Error> {
        hostutils::docker::compose_up(compose_file, detach, build)
    }

    fn compose_down(&self, compose_file: &Path, remove_orphans: bool) -> Result<(), Error> {
        hostutils::docker::compose_down(compose_file, remove_orphans)
    }

    fn load_image(&self, image_tar: &Path) -> Result<String, Error> {
        hostutils::docker::load_image(image_tar)
    }

    fn prune_images(&self, all: bool, force: bool) -> Result<String, Error> {
        hostutils::docker::prune_images(all, force)
    }

    fn container_health(&self, container: &str) -> Result<String, Error> {
        hostutils::docker::container_health(container)
    }
}

struct SystemctlCli;

impl ServiceSupervisor for SystemctlCli {
    fn is_active(&self, service: &str) -> Result<bool, Error> {
        hostutils::systemd::service_is_active(service)
    }
}

struct ReqwestProbe {
    client: reqwest::blocking::Client,
}

impl ReqwestProbe {
    fn new() -> Self {
        Self {
            client: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl HttpProbe for ReqwestProbe {
    fn probe(&self, url: &str) -> Result<u16, Error> {
        let response = self
            .client
            .get(url)
            .send()
            .context(format!("Failed to reach {url}"))?;
        Ok(response.status().as_u16())
    }
}
