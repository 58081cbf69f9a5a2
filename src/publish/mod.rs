//! Host nameserver publishers.
//!
//! A publisher installs the resolver's address into one host configuration
//! surface and reverts it on shutdown. The supervisor owns an explicit
//! registry (`Vec<Box<dyn Publisher>>`): `store_address` on every publisher
//! at startup, `clean` on every publisher at teardown, in reverse order,
//! regardless of individual failures.

pub mod reload;
pub mod resolvconf;
pub mod systemd;

use async_trait::async_trait;
use std::net::Ipv4Addr;

use crate::error::Error;

/// One host configuration surface.
#[async_trait]
pub trait Publisher: Send {
    /// Short name for log lines.
    fn name(&self) -> &'static str;

    /// Install `address` as the host's nameserver.
    async fn store_address(&mut self, address: Ipv4Addr) -> Result<(), Error>;

    /// Revert whatever `store_address` changed. Best effort; errors are
    /// logged by the implementation, not surfaced.
    async fn clean(&mut self);
}
