//! Service reloads over the host's service-management bus.
//!
//! Publishers poke the owning service after rewriting its config. The two
//! implementations cover the managers the publishers target: systemd units
//! via `ReloadOrRestartUnit` on the system bus, and upstart jobs via
//! `GetJobByName`/`Restart` on a bus socket path. Connections are dialed
//! per reload; reloads are rare.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;
use zbus::zvariant::OwnedObjectPath;

use crate::error::Error;

/// The seam publishers request service reloads through.
#[async_trait]
pub trait UnitReloader: Send + Sync {
    /// Reload (or restart) the named unit or job.
    async fn reload(&self, unit: &str) -> Result<(), Error>;
}

#[zbus::proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
trait SystemdManager {
    fn reload_or_restart_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;
}

/// Reloads systemd units on the system bus.
#[derive(Debug, Default)]
pub struct SystemdBusReloader;

#[async_trait]
impl UnitReloader for SystemdBusReloader {
    async fn reload(&self, unit: &str) -> Result<(), Error> {
        info!(unit, "systemd: starting reload");
        let connection = zbus::Connection::system().await?;
        let manager = SystemdManagerProxy::new(&connection).await?;
        manager.reload_or_restart_unit(unit, "replace").await?;
        Ok(())
    }
}

#[zbus::proxy(
    interface = "com.ubuntu.Upstart0_6",
    default_service = "com.ubuntu.Upstart",
    default_path = "/com/ubuntu/Upstart"
)]
trait Upstart {
    fn get_job_by_name(&self, name: &str) -> zbus::Result<OwnedObjectPath>;
}

#[zbus::proxy(
    interface = "com.ubuntu.Upstart0_6.Job",
    default_service = "com.ubuntu.Upstart"
)]
trait UpstartJob {
    fn restart(&self, env: Vec<&str>, wait: bool) -> zbus::Result<OwnedObjectPath>;
}

/// Restarts upstart jobs over the bus socket at a configured path.
#[derive(Debug)]
pub struct UpstartReloader {
    bus_path: PathBuf,
}

impl UpstartReloader {
    /// Build a reloader when the bus socket exists. Running outside that
    /// service manager is not an error, so absence just disables reloads.
    pub fn if_present(bus_path: &Path) -> Option<Self> {
        match std::fs::metadata(bus_path) {
            Ok(_) => Some(Self {
                bus_path: bus_path.to_path_buf(),
            }),
            Err(e) => {
                info!(path = %bus_path.display(), "upstart: disabled, cannot read bus socket: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl UnitReloader for UpstartReloader {
    async fn reload(&self, job: &str) -> Result<(), Error> {
        info!(job, "upstart: starting restart");
        let address = format!("unix:path={}", self.bus_path.display());
        let connection = zbus::connection::Builder::address(address.as_str())?
            .build()
            .await?;

        let upstart = UpstartProxy::new(&connection).await?;
        let job_path = upstart.get_job_by_name(job).await?;

        let job_proxy = UpstartJobProxy::builder(&connection)
            .path(job_path)?
            .build()
            .await?;
        job_proxy.restart(Vec::new(), true).await?;
        Ok(())
    }
}
