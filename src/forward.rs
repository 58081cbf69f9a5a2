//! Upstream query forwarding.
//!
//! A forwarded query is a one-shot UDP exchange: the (re-encoded) client
//! query is sent to the selected upstream and the first reply carrying the
//! same id is returned verbatim to the caller.

use async_trait::async_trait;
use hickory_proto::op::Message;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::trace;

/// Default time to wait for an upstream reply.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(3);

const MAX_REPLY_SIZE: usize = 4096;

/// Errors from an upstream exchange.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Socket-level failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No reply within the exchange timeout.
    #[error("no reply from {0} within {1:?}")]
    Timeout(SocketAddr, Duration),

    /// The reply could not be decoded.
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),
}

/// The seam the DNS handler forwards through.
#[async_trait]
pub trait Forward: Send + Sync {
    /// Exchange `query` with the resolver at `target` and return its reply.
    async fn forward(&self, query: &Message, target: SocketAddr)
        -> Result<Message, ForwardError>;
}

/// UDP exchange with a per-query ephemeral socket.
#[derive(Debug, Clone)]
pub struct UdpForwarder {
    timeout: Duration,
}

impl Default for UdpForwarder {
    fn default() -> Self {
        Self::new(DEFAULT_EXCHANGE_TIMEOUT)
    }
}

impl UdpForwarder {
    /// Create a forwarder with the given exchange timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Forward for UdpForwarder {
    async fn forward(
        &self,
        query: &Message,
        target: SocketAddr,
    ) -> Result<Message, ForwardError> {
        let bind_addr: SocketAddr = if target.is_ipv4() {
            "0.0.0.0:0".parse().expect("static socket addr")
        } else {
            "[::]:0".parse().expect("static socket addr")
        };

        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(target).await?;

        let bytes = query.to_vec()?;
        socket.send(&bytes).await?;
        trace!(%target, id = query.id(), len = bytes.len(), "forwarded query");

        let exchange = async {
            let mut buf = [0u8; MAX_REPLY_SIZE];
            loop {
                let len = socket.recv(&mut buf).await?;
                match Message::from_vec(&buf[..len]) {
                    // A stale reply to an earlier query on a reused port
                    // would carry a different id; keep waiting.
                    Ok(reply) if reply.id() == query.id() => return Ok(reply),
                    Ok(reply) => {
                        trace!(got = reply.id(), want = query.id(), "ignoring mismatched id");
                    }
                    Err(e) => return Err(ForwardError::Proto(e)),
                }
            }
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ForwardError::Timeout(target, self.timeout)),
        }
    }
}
