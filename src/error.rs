//! Error types for dockhand.

use thiserror::Error;

/// Errors that can occur while running the resolver.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Docker API error
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No usable local IPv4 address on any interface
    #[error("no addresses found")]
    NoAddress,

    /// A container's effective IP address could not be determined
    #[error("{0}")]
    AddressResolution(String),

    /// Malformed container-level DNS_* environment variable
    #[error("{0}")]
    ContainerEnv(String),

    /// Service-management bus failure
    #[error("bus error: {0}")]
    Bus(#[from] zbus::Error),

    /// The Docker event stream ended
    #[error("docker event loop closed")]
    EventLoopClosed,
}
