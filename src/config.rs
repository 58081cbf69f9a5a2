//! Configuration types for dockhand.
//!
//! All configuration is environment-driven: `Config` is deserialized from
//! the process environment (`DOCKER_HOST` becomes `docker_host` and so on),
//! with defaults matching a stock Docker host.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Docker API endpoint (`unix://...`, `tcp://...` or `http://...`).
    pub docker_host: String,

    /// IPv4 to report for containers running with `--net=host`.
    /// When unset such containers are skipped with a logged error.
    pub host_ip: Option<Ipv4Addr>,

    /// Address the DNS responder listens on (UDP and TCP).
    /// Port 0 binds an ephemeral port, readable from the responder.
    pub dns_listen: SocketAddr,

    /// Suffix appended to container names (`web` resolves as `web.docker`).
    pub container_domain: String,

    /// What to do when forwarding a query upstream fails.
    pub forward_failure: ForwardFailure,

    /// Path of the resolv.conf-style file the publisher rewrites.
    pub resolv_conf: PathBuf,

    /// Destination directory for systemd drop-ins. Unset (or missing on
    /// disk) disables the systemd publisher.
    pub systemd_conf_path: Option<PathBuf>,

    /// Directory holding the systemd drop-in templates.
    pub systemd_template_path: PathBuf,

    /// Path of the service-manager bus socket used for config reloads.
    pub upstart_dbus_path: PathBuf,

    /// Log level filter (e.g. "info", "dockhand=debug,warn").
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            docker_host: "unix:///tmp/docker.sock".to_string(),
            host_ip: None,
            dns_listen: "0.0.0.0:53".parse().expect("static socket addr"),
            container_domain: "docker".to_string(),
            forward_failure: ForwardFailure::default(),
            resolv_conf: PathBuf::from("/tmp/resolv.conf"),
            systemd_conf_path: None,
            systemd_template_path: PathBuf::from("/config/systemd"),
            upstart_dbus_path: PathBuf::from("/var/run/dbus/system_bus_socket"),
            log_level: "info".to_string(),
            prometheus_addr: None,
        }
    }
}

/// Behaviour when an upstream exchange fails.
///
/// The historical behaviour is to drop the query so the client times out;
/// `servfail` answers with SERVFAIL instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardFailure {
    /// Write no response; the client will time out and retry.
    #[default]
    Drop,
    /// Answer with response code SERVFAIL.
    Servfail,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()
    }
}
