//! Shared test infrastructure for the loopback integration tests.

#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use dockhand::config::ForwardFailure;
use dockhand::entries::EntriesTable;
use dockhand::forward::UdpForwarder;
use dockhand::handler::DnsHandler;
use dockhand::responder::Responder;

pub const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// A resolver running on ephemeral loopback ports.
///
/// The serve task is cancelled when the value drops.
pub struct TestResolver {
    pub table: EntriesTable,
    pub udp: SocketAddr,
    pub tcp: SocketAddr,
    cancel: CancellationToken,
}

impl Drop for TestResolver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl TestResolver {
    /// Start a resolver with an empty table and default drop-on-failure
    /// forwarding.
    pub async fn start() -> Self {
        Self::start_with(ForwardFailure::Drop).await
    }

    /// Start a resolver with the given forward-failure behaviour.
    pub async fn start_with(forward_failure: ForwardFailure) -> Self {
        let table = EntriesTable::new();
        let handler = DnsHandler::new(
            table.clone(),
            Arc::new(UdpForwarder::new(Duration::from_millis(500))),
            forward_failure,
        );
        let responder = Responder::bind("127.0.0.1:0".parse().unwrap(), handler)
            .await
            .expect("failed to bind test resolver");

        let udp = responder.udp_addr();
        let tcp = responder.tcp_addr();
        let cancel = CancellationToken::new();
        tokio::spawn(responder.run(cancel.clone()));

        Self {
            table,
            udp,
            tcp,
            cancel,
        }
    }
}

/// Build wire-format bytes for a DNS query.
pub fn build_query_bytes(name: &str, record_type: RecordType, id: u16) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    let mut query = Query::new();
    query.set_name(Name::from_ascii(name).unwrap());
    query.set_query_type(record_type);
    query.set_query_class(DNSClass::IN);
    msg.add_query(query);
    msg.to_vec().unwrap()
}

/// Send a UDP query and wait for the reply.
pub async fn udp_query(server: SocketAddr, name: &str, record_type: RecordType, id: u16) -> Message {
    try_udp_query(server, name, record_type, id, QUERY_TIMEOUT)
        .await
        .expect("query timed out")
}

/// Send a UDP query; `None` when no reply arrives within `timeout`.
pub async fn try_udp_query(
    server: SocketAddr,
    name: &str,
    record_type: RecordType,
    id: u16,
    timeout: Duration,
) -> Option<Message> {
    let sock = UdpSocket::bind("127.0.0.1:0").await.expect("bind client socket");
    sock.send_to(&build_query_bytes(name, record_type, id), server)
        .await
        .expect("send query");

    let mut buf = vec![0u8; 4096];
    let len = tokio::time::timeout(timeout, sock.recv(&mut buf)).await.ok()?.ok()?;
    Some(Message::from_vec(&buf[..len]).expect("parse response"))
}

/// Send a TCP query (two-byte length framing) and wait for the reply.
pub async fn tcp_query(server: SocketAddr, name: &str, record_type: RecordType, id: u16) -> Message {
    let mut stream = tokio::time::timeout(QUERY_TIMEOUT, TcpStream::connect(server))
        .await
        .expect("connect timed out")
        .expect("connect failed");

    let query = build_query_bytes(name, record_type, id);
    let mut framed = Vec::with_capacity(2 + query.len());
    framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
    framed.extend_from_slice(&query);
    stream.write_all(&framed).await.expect("send query");

    let reply = tokio::time::timeout(QUERY_TIMEOUT, async {
        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut buf).await?;
        Ok::<_, std::io::Error>(buf)
    })
    .await
    .expect("reply timed out")
    .expect("read reply");

    Message::from_vec(&reply).expect("parse response")
}

/// Extract A addresses from a response, sorted for comparison.
pub fn extract_a_ips(msg: &Message) -> Vec<Ipv4Addr> {
    let mut ips: Vec<Ipv4Addr> = msg
        .answers()
        .iter()
        .filter_map(|r| match r.data() {
            RData::A(a) => Some(Ipv4Addr::from(*a)),
            _ => None,
        })
        .collect();
    ips.sort();
    ips
}

/// Extract PTR targets from a response.
pub fn extract_ptr_names(msg: &Message) -> Vec<String> {
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            RData::PTR(ptr) => Some(ptr.0.to_string()),
            _ => None,
        })
        .collect()
}

/// Assert the response code.
pub fn assert_response_code(msg: &Message, expected: ResponseCode) {
    assert_eq!(
        msg.response_code(),
        expected,
        "expected {:?}, got {:?}",
        expected,
        msg.response_code()
    );
}
