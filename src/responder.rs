//! DNS responder setup and lifecycle.
//!
//! Binding and serving are split so the supervisor can hold startup until
//! the sockets are accepting: `bind` returns with UDP and TCP registered
//! (port 0 selects an ephemeral port, readable afterwards), `run` drives
//! the serve loops until cancellation or failure.

use hickory_server::ServerFuture;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Error;
use crate::handler::DnsHandler;

/// Idle timeout for TCP connections.
const TCP_TIMEOUT: Duration = Duration::from_secs(30);

/// The DNS server over both transports.
pub struct Responder {
    server: ServerFuture<DnsHandler>,
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
}

impl Responder {
    /// Bind UDP and TCP on `listen` and register both with the server.
    ///
    /// On return the kernel is queueing packets for the handler. When
    /// `listen` has port 0 the UDP socket picks the port and TCP binds the
    /// same one, so tests can run unprivileged.
    pub async fn bind(listen: SocketAddr, handler: DnsHandler) -> Result<Self, Error> {
        let mut server = ServerFuture::new(handler);

        let (udp_socket, tcp_listener) = bind_pair(listen).await?;
        let udp_addr = udp_socket.local_addr()?;
        let tcp_addr = tcp_listener.local_addr()?;

        info!(addr = %udp_addr, "DNS UDP listening");
        server.register_socket(udp_socket);

        info!(addr = %tcp_addr, "DNS TCP listening");
        server.register_listener(tcp_listener, TCP_TIMEOUT);

        Ok(Self {
            server,
            udp_addr,
            tcp_addr,
        })
    }

    /// The bound UDP address.
    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    /// The bound TCP address.
    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    /// Serve until the token cancels (graceful shutdown) or the serve
    /// loops fail.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), Error> {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("DNS responder shutdown requested");
                let _ = self.server.shutdown_gracefully().await;
                Ok(())
            }
            result = self.server.block_until_done() => {
                info!("DNS responder serve loop exited");
                result.map_err(Error::from)
            }
        }
    }
}

/// Bind UDP and a TCP listener on the same port.
///
/// When an ephemeral port is requested the kernel picks the UDP port
/// without regard to TCP; rebind if its TCP twin happens to be taken.
async fn bind_pair(listen: SocketAddr) -> Result<(UdpSocket, TcpListener), Error> {
    const ATTEMPTS: usize = 10;
    let mut attempt = 0;
    loop {
        attempt += 1;
        let udp_socket = UdpSocket::bind(listen).await?;
        let port = udp_socket.local_addr()?.port();
        match TcpListener::bind(SocketAddr::new(listen.ip(), port)).await {
            Ok(tcp_listener) => return Ok((udp_socket, tcp_listener)),
            Err(e)
                if listen.port() == 0
                    && e.kind() == std::io::ErrorKind::AddrInUse
                    && attempt < ATTEMPTS =>
            {
                debug!(port, attempt, "TCP side of ephemeral port taken, rebinding");
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForwardFailure;
    use crate::entries::EntriesTable;
    use crate::forward::UdpForwarder;
    use std::sync::Arc;

    #[tokio::test]
    async fn bind_ephemeral_reports_real_port() {
        let handler = DnsHandler::new(
            EntriesTable::new(),
            Arc::new(UdpForwarder::default()),
            ForwardFailure::Drop,
        );
        let responder = Responder::bind("127.0.0.1:0".parse().unwrap(), handler)
            .await
            .unwrap();

        assert_ne!(responder.udp_addr().port(), 0);
        assert_eq!(responder.udp_addr().port(), responder.tcp_addr().port());
    }

    #[tokio::test]
    async fn cancelling_unblocks_run() {
        let handler = DnsHandler::new(
            EntriesTable::new(),
            Arc::new(UdpForwarder::default()),
            ForwardFailure::Drop,
        );
        let responder = Responder::bind("127.0.0.1:0".parse().unwrap(), handler)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(responder.run(cancel.clone()));

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run did not unblock after cancel")
            .expect("run task panicked");
        assert!(result.is_ok());
    }
}
