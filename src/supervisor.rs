//! Process lifecycle.
//!
//! Wires the subsystems together: discovers the local address, seeds the
//! upstream table, starts the reconciler, binds the responder once the
//! table is warm, installs the nameserver publishers, and tears everything
//! down again on the first signal or subsystem failure.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::docker::DockerRuntime;
use crate::entries::EntriesTable;
use crate::error::Error;
use crate::forward::UdpForwarder;
use crate::handler::DnsHandler;
use crate::publish::reload::{SystemdBusReloader, UnitReloader, UpstartReloader};
use crate::publish::resolvconf::ResolvConf;
use crate::publish::systemd::SystemdDropIns;
use crate::publish::Publisher;
use crate::reconciler::Reconciler;
use crate::responder::Responder;

/// Where the host's own upstream resolvers are read from.
const SYSTEM_RESOLV_CONF: &str = "/etc/resolv.conf";

/// Poll interval while waiting for the initial enumeration.
const PRIME_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Run the resolver until a signal arrives or a subsystem fails.
pub async fn run(config: Config) -> Result<(), Error> {
    // Signals are installed first so a signal during startup still
    // triggers publisher cleanup.
    let cancel = shutdown_token()?;

    let local_addr = local_ipv4()?;
    info!(%local_addr, "got local address");

    let table = EntriesTable::new();

    // The container domain is authoritative-local: misses under it answer
    // NXDOMAIN instead of being forwarded.
    table.add_upstream(
        &config.container_domain,
        None,
        0,
        std::slice::from_ref(&config.container_domain),
    );
    seed_upstreams_from_resolv_conf(&table, Path::new(SYSTEM_RESOLV_CONF), local_addr)?;

    let runtime = Arc::new(DockerRuntime::connect(&config.docker_host)?);
    let reconciler = Reconciler::new(
        runtime,
        table.clone(),
        &config.container_domain,
        config.host_ip,
    );
    let mut reconciler_task = tokio::spawn(reconciler.run(cancel.clone()));

    // Bind only after the initial enumeration so the first query already
    // sees a warm table.
    loop {
        if table.is_primed() {
            break;
        }
        if cancel.is_cancelled() {
            let _ = reconciler_task.await;
            return Ok(());
        }
        if reconciler_task.is_finished() {
            return Err(flatten_task("reconciler", reconciler_task.await));
        }
        tokio::time::sleep(PRIME_POLL_INTERVAL).await;
    }

    let forwarder = Arc::new(UdpForwarder::default());
    let handler = DnsHandler::new(table.clone(), forwarder, config.forward_failure);
    let responder = Responder::bind(config.dns_listen, handler).await?;
    info!(udp = %responder.udp_addr(), tcp = %responder.tcp_addr(), "DNS responder ready");
    let mut responder_task = tokio::spawn(responder.run(cancel.clone()));

    let mut publishers = build_publishers(&config);
    for publisher in &mut publishers {
        if let Err(e) = publisher.store_address(local_addr).await {
            error!(publisher = publisher.name(), "error in publisher: {e}");
        }
    }

    let exit = tokio::select! {
        biased;

        _ = cancel.cancelled() => Ok(()),
        result = &mut reconciler_task => Err(flatten_task("reconciler", result)),
        result = &mut responder_task => Err(flatten_task("responder", result)),
    };

    cancel.cancel();
    for publisher in publishers.iter_mut().rev() {
        publisher.clean().await;
    }
    if !reconciler_task.is_finished() {
        let _ = reconciler_task.await;
    }
    if !responder_task.is_finished() {
        let _ = responder_task.await;
    }

    exit
}

/// Cancellation token wired to SIGINT and SIGTERM.
fn shutdown_token() -> Result<CancellationToken, Error> {
    let token = CancellationToken::new();
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("exit requested by signal: SIGINT"),
            _ = sigterm.recv() => info!("exit requested by signal: SIGTERM"),
        }
        cancel.cancel();
    });

    Ok(token)
}

/// First non-loopback, non-multicast IPv4 on any interface.
fn local_ipv4() -> Result<Ipv4Addr, Error> {
    let interfaces = local_ip_address::list_afinet_netifas().map_err(|e| {
        warn!("interface enumeration failed: {e}");
        Error::NoAddress
    })?;

    interfaces
        .into_iter()
        .find_map(|(_name, ip)| match ip {
            IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_multicast() => Some(v4),
            _ => None,
        })
        .ok_or(Error::NoAddress)
}

/// Register each of the host's existing nameservers as a default upstream,
/// excluding the local address to avoid a self-loop.
fn seed_upstreams_from_resolv_conf(
    table: &EntriesTable,
    path: &Path,
    local_addr: Ipv4Addr,
) -> Result<(), Error> {
    let content = fs::read_to_string(path)?;
    for server in parse_nameservers(&content) {
        if server == IpAddr::V4(local_addr) {
            continue;
        }
        table.add_upstream(&format!("resolv.conf:{server}"), Some(server), 53, &[]);
    }
    Ok(())
}

/// `nameserver` directives from resolv.conf-style content.
fn parse_nameservers(content: &str) -> Vec<IpAddr> {
    let mut servers = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut fields = line.split_whitespace();
        if fields.next() == Some("nameserver") {
            if let Some(addr) = fields.next().and_then(|a| a.parse().ok()) {
                servers.push(addr);
            }
        }
    }
    servers
}

/// The publisher registry, in startup order.
fn build_publishers(config: &Config) -> Vec<Box<dyn Publisher>> {
    let mut publishers: Vec<Box<dyn Publisher>> = Vec::new();

    let upstart = UpstartReloader::if_present(&config.upstart_dbus_path)
        .map(|r| Arc::new(r) as Arc<dyn UnitReloader>);
    publishers.push(Box::new(ResolvConf::new(config.resolv_conf.clone(), upstart)));

    match &config.systemd_conf_path {
        Some(dest) => match fs::metadata(dest) {
            Ok(_) => publishers.push(Box::new(SystemdDropIns::new(
                config.systemd_template_path.clone(),
                dest.clone(),
                Arc::new(SystemdBusReloader),
            ))),
            Err(e) => info!(path = %dest.display(), "systemd: disabled, cannot read destination: {e}"),
        },
        None => info!("systemd: disabled, SYSTEMD_CONF_PATH not set"),
    }

    publishers
}

fn flatten_task(what: &str, result: Result<Result<(), Error>, tokio::task::JoinError>) -> Error {
    match result {
        Ok(Ok(())) => Error::Config(format!("{what} exited unexpectedly")),
        Ok(Err(e)) => e,
        Err(e) => Error::Io(std::io::Error::other(format!("{what} task failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_nameservers_skips_comments_and_other_directives() {
        let content = "# comment\n; also comment\nsearch example.com\nnameserver 8.8.8.8\nnameserver 2001:4860:4860::8888\nnameserver not-an-ip\n";
        let servers = parse_nameservers(content);
        assert_eq!(
            servers,
            vec![
                "8.8.8.8".parse::<IpAddr>().unwrap(),
                "2001:4860:4860::8888".parse::<IpAddr>().unwrap(),
            ]
        );
    }

    #[test]
    fn seeding_registers_defaults_and_skips_local_address() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "nameserver 8.8.8.8").unwrap();
        writeln!(file, "nameserver 10.0.0.1").unwrap();

        let table = EntriesTable::new();
        seed_upstreams_from_resolv_conf(&table, file.path(), "10.0.0.1".parse().unwrap())
            .unwrap();

        assert_eq!(table.upstream_count(), 1);
        let upstream = table.upstream_for("anything.example.org.").unwrap();
        assert_eq!(upstream.addr, Some("8.8.8.8".parse().unwrap()));
        assert_eq!(upstream.port, 53);
    }

    #[test]
    fn seeding_requires_a_readable_file() {
        let table = EntriesTable::new();
        let result = seed_upstreams_from_resolv_conf(
            &table,
            Path::new("/nonexistent/resolv.conf"),
            "10.0.0.1".parse().unwrap(),
        );
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
