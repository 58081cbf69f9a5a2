//! dockhand - a host-resident DNS resolver for Docker containers.
//!
//! This crate watches the Docker event stream, keeps a live name table of
//! running containers, and serves an authoritative DNS responder that
//! answers A and PTR queries from that table. Queries it cannot answer are
//! forwarded to upstream resolvers; containers can advertise themselves as
//! upstreams for specific domains via `DNS_RESOLVES`. While running, the
//! host's resolver configuration points at dockhand and is restored on
//! shutdown.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                          dockhand                              │
//! │                                                                │
//! │  ┌────────────────┐      ┌──────────────────┐                 │
//! │  │  Reconciler    │─────▶│   EntriesTable   │                 │
//! │  │ (docker events)│      │   (in-memory)    │                 │
//! │  └────────────────┘      └────────┬─────────┘                 │
//! │          │                        │                            │
//! │          │ start/die              ▼                            │
//! │          │                ┌──────────────────┐     UDP/TCP    │
//! │          │                │  DNS responder   │◀──── :53       │
//! │          │                │  (hickory)       │────▶ upstreams │
//! │          │                └──────────────────┘                 │
//! │          │                                                     │
//! │  ┌───────┴────────┐      ┌──────────────────┐                 │
//! │  │  Supervisor    │─────▶│  Publishers      │ resolv.conf,    │
//! │  │ (signals)      │      │ (store / clean)  │ systemd drop-ins│
//! │  └────────────────┘      └──────────────────┘                 │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Resolution
//!
//! ```text
//! A    web.docker.              → container's bridge IPv4
//! PTR  2.0.17.172.in-addr.arpa. → container's primary name
//! A    x.example.com.           → forwarded to the longest-suffix upstream
//! A    nosuch.docker.           → NXDOMAIN (container domain never leaks)
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod docker;
pub mod entries;
pub mod error;
pub mod forward;
pub mod handler;
pub mod metrics;
pub mod publish;
pub mod reconciler;
pub mod responder;
pub mod supervisor;
pub mod telemetry;

// Re-export main types
pub use config::{Config, ForwardFailure};
pub use entries::{EntriesTable, HostEntry, UpstreamEntry};
pub use error::Error;
pub use handler::DnsHandler;
pub use reconciler::Reconciler;
pub use responder::Responder;
