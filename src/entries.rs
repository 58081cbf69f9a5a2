//! In-memory name tables backed by the Docker event stream.
//!
//! Three tables keyed by container id:
//! - hosts: id -> (IPv4 address, names), answering forward A lookups
//! - a derived reverse index answering PTR lookups with primary names
//! - upstreams: id -> upstream resolver entry, selected by longest suffix

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tracing::debug;

/// A container's forward DNS data.
#[derive(Debug, Clone)]
pub struct HostEntry {
    /// IPv4 address all of this entry's names resolve to.
    pub addr: Ipv4Addr,
    /// Names in fully-qualified form, primary name first.
    pub names: Vec<String>,
}

/// An upstream resolver entry.
///
/// Three variants, distinguished by field shape:
/// - `addr` set, `domains` empty: default upstream
/// - `domains` non-empty, `addr` set: scoped upstream for those domains
/// - `domains` non-empty, `addr` unset: local-domain sink; lookups under
///   these domains that miss the host table are NXDOMAIN, never forwarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamEntry {
    /// Resolver address; `None` marks a local-domain sink.
    pub addr: Option<IpAddr>,
    /// Resolver UDP port.
    pub port: u16,
    /// Domains this entry is scoped to, in fully-qualified form.
    pub domains: Vec<String>,
}

/// Normalise a name to canonical FQDN form: lowercase with a trailing dot.
pub fn normalize_fqdn(name: &str) -> String {
    let mut fqdn = name.trim().to_ascii_lowercase();
    if !fqdn.ends_with('.') {
        fqdn.push('.');
    }
    fqdn
}

/// The `in-addr.arpa` name for an IPv4 address, in canonical FQDN form.
pub fn reverse_arpa(addr: Ipv4Addr) -> String {
    let o = addr.octets();
    format!("{}.{}.{}.{}.in-addr.arpa.", o[3], o[2], o[1], o[0])
}

/// Thread-safe forward, reverse and upstream tables.
#[derive(Debug, Clone, Default)]
pub struct EntriesTable {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    /// container id -> HostEntry
    hosts: HashMap<String, HostEntry>,

    /// upstream id -> UpstreamEntry
    upstreams: HashMap<String, UpstreamEntry>,

    /// fqdn -> addresses (derived from hosts, rebuilt on writes)
    forward: HashMap<String, Vec<Ipv4Addr>>,

    /// reverse-arpa fqdn -> primary names (derived from hosts)
    reverse: HashMap<String, Vec<String>>,

    /// True once the initial container enumeration has completed.
    primed: bool,
}

impl EntriesTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the host entry for a container id.
    ///
    /// `name` is the primary name (returned by reverse lookups); `aliases`
    /// resolve forward only. Replacing an id drops every edge the previous
    /// entry contributed.
    pub fn add_host(&self, id: &str, addr: Ipv4Addr, name: &str, aliases: &[String]) {
        let mut names = Vec::with_capacity(1 + aliases.len());
        names.push(normalize_fqdn(name));
        names.extend(aliases.iter().map(|a| normalize_fqdn(a)));

        let mut inner = self.inner.write();
        debug!(id, %addr, ?names, "adding host");
        inner.hosts.insert(id.to_string(), HostEntry { addr, names });
        Self::rebuild_indices(&mut inner);
    }

    /// Remove a host entry by container id. No-op for unknown ids.
    pub fn remove_host(&self, id: &str) {
        let mut inner = self.inner.write();
        if inner.hosts.remove(id).is_some() {
            debug!(id, "removed host");
            Self::rebuild_indices(&mut inner);
        }
    }

    /// Insert or replace an upstream entry.
    ///
    /// Passing no `addr` registers a local-domain sink for `domains`.
    pub fn add_upstream(&self, id: &str, addr: Option<IpAddr>, port: u16, domains: &[String]) {
        let domains: Vec<String> = domains.iter().map(|d| normalize_fqdn(d)).collect();
        let mut inner = self.inner.write();
        debug!(id, ?addr, port, ?domains, "adding upstream");
        inner
            .upstreams
            .insert(id.to_string(), UpstreamEntry { addr, port, domains });
    }

    /// Remove an upstream entry by id. No-op for unknown ids.
    pub fn remove_upstream(&self, id: &str) {
        let mut inner = self.inner.write();
        if inner.upstreams.remove(id).is_some() {
            debug!(id, "removed upstream");
        }
    }

    /// Addresses registered for a name. Case-insensitive FQDN comparison;
    /// empty when unknown. Order is unspecified.
    pub fn find_host(&self, fqdn: &str) -> Vec<Ipv4Addr> {
        let fqdn = normalize_fqdn(fqdn);
        let inner = self.inner.read();
        inner.forward.get(&fqdn).cloned().unwrap_or_default()
    }

    /// Primary names whose address reverses to the given `in-addr.arpa`
    /// name. Aliases are never returned.
    pub fn find_reverse(&self, arpa: &str) -> Vec<String> {
        let arpa = normalize_fqdn(arpa);
        let inner = self.inner.read();
        inner.reverse.get(&arpa).cloned().unwrap_or_default()
    }

    /// Select the upstream for a query name.
    ///
    /// Scoped entries win over the default upstream, longest matched domain
    /// first; ties between equal-length matches are unspecified. A returned
    /// entry with `addr: None` means "authoritative-local, do not forward".
    pub fn upstream_for(&self, fqdn: &str) -> Option<UpstreamEntry> {
        let fqdn = normalize_fqdn(fqdn);
        let inner = self.inner.read();

        let mut best: Option<(&UpstreamEntry, usize)> = None;
        let mut default: Option<&UpstreamEntry> = None;

        for entry in inner.upstreams.values() {
            if entry.domains.is_empty() {
                if entry.addr.is_some() {
                    default = Some(entry);
                }
                continue;
            }
            for domain in &entry.domains {
                if domain_matches(&fqdn, domain)
                    && best.is_none_or(|(_, len)| domain.len() > len)
                {
                    best = Some((entry, domain.len()));
                }
            }
        }

        best.map(|(e, _)| e.clone()).or_else(|| default.cloned())
    }

    /// Mark the initial container enumeration as complete.
    pub fn mark_primed(&self) {
        let mut inner = self.inner.write();
        inner.primed = true;
        debug!(
            hosts = inner.hosts.len(),
            upstreams = inner.upstreams.len(),
            "table primed"
        );
    }

    /// True after the initial container enumeration has completed.
    pub fn is_primed(&self) -> bool {
        self.inner.read().primed
    }

    /// Number of host entries.
    pub fn host_count(&self) -> usize {
        self.inner.read().hosts.len()
    }

    /// Number of upstream entries.
    pub fn upstream_count(&self) -> usize {
        self.inner.read().upstreams.len()
    }

    /// Emit current table sizes as metrics.
    pub fn emit_metrics(&self) {
        let inner = self.inner.read();
        crate::metrics::record_table_sizes(inner.hosts.len(), inner.upstreams.len());
    }

    /// Rebuild the forward and reverse indices from the host table.
    fn rebuild_indices(inner: &mut Inner) {
        inner.forward.clear();
        inner.reverse.clear();

        for entry in inner.hosts.values() {
            for name in &entry.names {
                inner
                    .forward
                    .entry(name.clone())
                    .or_default()
                    .push(entry.addr);
            }
            if let Some(primary) = entry.names.first() {
                inner
                    .reverse
                    .entry(reverse_arpa(entry.addr))
                    .or_default()
                    .push(primary.clone());
            }
        }

        debug!(
            forward = inner.forward.len(),
            reverse = inner.reverse.len(),
            "rebuilt indices"
        );
    }
}

/// True when `fqdn` equals `domain` or is a subdomain of it.
/// Both arguments must already be in canonical FQDN form.
fn domain_matches(fqdn: &str, domain: &str) -> bool {
    fqdn == domain || fqdn.ends_with(&format!(".{domain}"))
}
