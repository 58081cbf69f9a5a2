//! Docker event reconciliation.
//!
//! Keeps the entries table consistent with the runtime: enumerate existing
//! containers at startup, then apply `start`/`die` events for as long as the
//! stream stays open. `start` handlers run as spawned tasks so one slow
//! inspect cannot head-of-line block the stream; removals are no-ops on
//! unknown ids and additions replace existing rows, so racing handlers
//! converge on the stream's final state.

use futures::StreamExt;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::docker::{ContainerDetails, ContainerEvent, EventAction, Runtime};
use crate::entries::EntriesTable;
use crate::error::Error;
use crate::metrics;

/// Bound on `container:<ref>` network-mode chains. Containers form a DAG
/// in practice; the bound turns an accidental cycle into an error.
const MAX_NETWORK_MODE_HOPS: usize = 32;

/// Default port for container-advertised upstream resolvers.
const DEFAULT_DNS_PORT: u16 = 53;

/// Reconciles the entries table against the Docker event stream.
#[derive(Clone)]
pub struct Reconciler {
    runtime: Arc<dyn Runtime>,
    table: EntriesTable,
    container_domain: String,
    host_ip: Option<Ipv4Addr>,
}

impl Reconciler {
    /// Create a reconciler.
    ///
    /// `container_domain` is the suffix appended to container names; a
    /// leading dot is added when missing.
    pub fn new(
        runtime: Arc<dyn Runtime>,
        table: EntriesTable,
        container_domain: &str,
        host_ip: Option<Ipv4Addr>,
    ) -> Self {
        let container_domain = if container_domain.starts_with('.') {
            container_domain.to_string()
        } else {
            format!(".{container_domain}")
        };
        Self {
            runtime,
            table,
            container_domain,
            host_ip,
        }
    }

    /// Run until cancelled or the event stream closes.
    ///
    /// The event subscription is registered before enumeration so events
    /// arriving mid-enumeration queue instead of being lost. The table is
    /// marked primed once enumeration finishes; the supervisor holds the
    /// responder's bind until then.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), Error> {
        let mut events = self.runtime.events();

        for id in self.runtime.list_containers().await? {
            if let Err(e) = self.add_container(&id).await {
                warn!(id = short_id(&id), "error adding container: {e}");
            }
        }
        self.table.mark_primed();
        self.table.emit_metrics();
        info!(
            hosts = self.table.host_count(),
            upstreams = self.table.upstream_count(),
            "initial container enumeration complete"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("reconciler shutting down");
                    return Ok(());
                }

                event = events.next() => {
                    match event {
                        Some(Ok(event)) => self.handle_event(event),
                        Some(Err(e)) => warn!("event stream error: {e}"),
                        None => return Err(Error::EventLoopClosed),
                    }
                }
            }
        }
    }

    fn handle_event(&self, event: ContainerEvent) {
        match event.action {
            EventAction::Start => {
                metrics::record_container_event("start");
                let reconciler = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = reconciler.add_container(&event.id).await {
                        warn!(id = short_id(&event.id), "error adding container: {e}");
                    }
                });
            }
            EventAction::Die => {
                metrics::record_container_event("die");
                self.table.remove_host(&event.id);
                self.table.remove_upstream(&event.id);
            }
            EventAction::Other => {}
        }
    }

    /// Inspect a container and register its host entry, upstream entry and
    /// bridge entry as applicable.
    pub async fn add_container(&self, id: &str) -> Result<(), Error> {
        let container = self.runtime.inspect_container(id).await?;
        let addr = self.resolve_address(&container).await?;

        let primary = format!("{}.{}", container.hostname, container.domainname);
        let alias = format!(
            "{}{}",
            container.name.trim_start_matches('/'),
            self.container_domain
        );
        self.table.add_host(&container.id, addr, &primary, &[alias]);

        if let Err(e) = self.register_upstream(&container, addr) {
            warn!(id = short_id(id), "skipping upstream registration: {e}");
        }

        // Make the bridge itself resolvable, e.g. `docker0` to its gateway.
        if let (Some(bridge), Some(gateway)) = (&container.bridge, container.gateway) {
            self.table
                .add_host(&format!("bridge:{bridge}"), gateway, bridge, &[]);
        }

        Ok(())
    }

    /// Resolve the container's effective IPv4 through its network mode.
    async fn resolve_address(&self, container: &ContainerDetails) -> Result<Ipv4Addr, Error> {
        let mut current = container.clone();

        for _ in 0..MAX_NETWORK_MODE_HOPS {
            if let Some(addr) = current.ip_address {
                return Ok(addr);
            }

            if current.network_mode == "host" {
                return self.host_ip.ok_or_else(|| {
                    Error::AddressResolution(
                        "IP not available with network mode \"host\"".to_string(),
                    )
                });
            }

            if let Some(other) = current.network_mode.strip_prefix("container:") {
                current = self.runtime.inspect_container(other).await?;
                continue;
            }

            return Err(Error::AddressResolution(format!(
                "unknown network mode \"{}\"",
                current.network_mode
            )));
        }

        Err(Error::AddressResolution(format!(
            "network mode of {} not resolvable within {MAX_NETWORK_MODE_HOPS} hops",
            short_id(&container.id)
        )))
    }

    /// Register the container as an upstream if it advertises DNS_RESOLVES.
    fn register_upstream(&self, container: &ContainerDetails, addr: Ipv4Addr) -> Result<(), Error> {
        let env = parse_container_env(&container.env, "DNS_");

        let Some(resolves) = env.get("DNS_RESOLVES") else {
            return Ok(());
        };
        if resolves.is_empty() {
            return Err(Error::ContainerEnv(
                "empty DNS_RESOLVES, should contain a comma-separated list with at least one domain"
                    .to_string(),
            ));
        }

        let port = match env.get("DNS_PORT").map(String::as_str) {
            None | Some("") => DEFAULT_DNS_PORT,
            Some(value) => value.parse().map_err(|_| {
                Error::ContainerEnv(format!(
                    "invalid DNS_PORT \"{value}\", should contain a number"
                ))
            })?,
        };

        let domains: Vec<String> = resolves.split(',').map(str::to_string).collect();
        self.table
            .add_upstream(&container.id, Some(IpAddr::V4(addr)), port, &domains);
        Ok(())
    }
}

/// Environment entries starting with `prefix`, split into key/value.
/// Entries without `=` map to an empty value.
fn parse_container_env(env: &[String], prefix: &str) -> HashMap<String, String> {
    let mut parsed = HashMap::new();
    for entry in env {
        if !entry.starts_with(prefix) {
            continue;
        }
        match entry.split_once('=') {
            Some((key, value)) => parsed.insert(key.to_string(), value.to_string()),
            None => parsed.insert(entry.clone(), String::new()),
        };
    }
    parsed
}

/// Abbreviated container id for log lines.
fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|e| e.to_string()).collect()
    }

    #[test]
    fn parse_env_keeps_only_prefixed_entries() {
        let parsed = parse_container_env(
            &env(&["PATH=/bin", "DNS_RESOLVES=a.com,b", "DNS_PORT=5353"]),
            "DNS_",
        );
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["DNS_RESOLVES"], "a.com,b");
        assert_eq!(parsed["DNS_PORT"], "5353");
    }

    #[test]
    fn parse_env_value_may_be_empty_or_missing() {
        let parsed = parse_container_env(&env(&["DNS_RESOLVES=", "DNS_FLAG"]), "DNS_");
        assert_eq!(parsed["DNS_RESOLVES"], "");
        assert_eq!(parsed["DNS_FLAG"], "");
    }

    #[test]
    fn parse_env_value_may_contain_equals() {
        let parsed = parse_container_env(&env(&["DNS_RESOLVES=a=b"]), "DNS_");
        assert_eq!(parsed["DNS_RESOLVES"], "a=b");
    }

    #[test]
    fn short_id_truncates_long_ids_only() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }
}
