//! DNS request handling.
//!
//! One handler serves both transports. A queries are answered from the
//! forward table and PTR queries from the reverse table; everything else is
//! routed through upstream selection: forwarded when a matching upstream
//! exists, NXDOMAIN when none does or the match is a local-domain sink.

use async_trait::async_trait;
use hickory_proto::op::{Header, LowerQuery, Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, PTR};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::config::ForwardFailure;
use crate::entries::EntriesTable;
use crate::forward::Forward;
use crate::metrics::{self, QueryResult};

/// Handler answering from the entries table and forwarding the rest.
#[derive(Clone)]
pub struct DnsHandler {
    table: EntriesTable,
    forwarder: Arc<dyn Forward>,
    forward_failure: ForwardFailure,
}

impl DnsHandler {
    /// Create a handler over the given table and forwarder.
    pub fn new(
        table: EntriesTable,
        forwarder: Arc<dyn Forward>,
        forward_failure: ForwardFailure,
    ) -> Self {
        Self {
            table,
            forwarder,
            forward_failure,
        }
    }

    /// Send a response carrying `records` as the answer section.
    async fn respond_records<R: ResponseHandler>(
        &self,
        request: &Request,
        header: Header,
        records: &[Record],
        response_handle: &mut R,
    ) -> ResponseInfo {
        let response = MessageResponseBuilder::from_message_request(request).build(
            header,
            records.iter(),
            std::iter::empty(),
            std::iter::empty(),
            std::iter::empty(),
        );
        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                error!("failed to send response: {e}");
                ResponseInfo::from(header)
            }
        }
    }

    /// Send an empty response with the given response code.
    async fn respond_code<R: ResponseHandler>(
        &self,
        request: &Request,
        mut header: Header,
        code: ResponseCode,
        response_handle: &mut R,
    ) -> ResponseInfo {
        header.set_response_code(code);
        let response = MessageResponseBuilder::from_message_request(request).build_no_records(header);
        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                error!("failed to send response: {e}");
                ResponseInfo::from(header)
            }
        }
    }

    /// Relay an upstream reply back to the client.
    async fn relay_reply<R: ResponseHandler>(
        &self,
        request: &Request,
        reply: &Message,
        response_handle: &mut R,
    ) -> ResponseInfo {
        let mut header = Header::response_from_request(request.header());
        header.set_response_code(reply.response_code());
        header.set_authoritative(reply.authoritative());
        header.set_recursion_available(reply.recursion_available());

        // The transport layer appends its own OPT record when the client
        // negotiated EDNS; the upstream's copy must not ride along.
        let additionals: Vec<&Record> = reply
            .additionals()
            .iter()
            .filter(|r| r.record_type() != RecordType::OPT)
            .collect();

        let response = MessageResponseBuilder::from_message_request(request).build(
            header,
            reply.answers().iter(),
            reply.name_servers().iter(),
            std::iter::empty(),
            additionals.into_iter(),
        );
        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                error!("failed to relay upstream reply: {e}");
                ResponseInfo::from(header)
            }
        }
    }

    /// Route a query that found no local answer: forward it or NXDOMAIN.
    async fn forward_or_refuse<R: ResponseHandler>(
        &self,
        request: &Request,
        query: &LowerQuery,
        name: &str,
        header: Header,
        started: Instant,
        response_handle: &mut R,
    ) -> ResponseInfo {
        let rtype = query.query_type().to_string();

        let Some(upstream) = self.table.upstream_for(name) else {
            debug!(name, "no upstream, answering NXDOMAIN");
            metrics::record_query(&rtype, QueryResult::NxDomain, started.elapsed());
            return self
                .respond_code(request, header, ResponseCode::NXDomain, response_handle)
                .await;
        };

        let Some(addr) = upstream.addr else {
            // Local-domain sink: this name is ours even though no entry
            // matched, so it must not leak to any resolver.
            debug!(name, "local domain, answering NXDOMAIN");
            metrics::record_query(&rtype, QueryResult::NxDomain, started.elapsed());
            return self
                .respond_code(request, header, ResponseCode::NXDomain, response_handle)
                .await;
        };

        let target = SocketAddr::new(addr, upstream.port);
        let outgoing = forward_query(request, query);

        match self.forwarder.forward(&outgoing, target).await {
            Ok(reply) => {
                trace!(name, %target, answers = reply.answer_count(), "relaying upstream reply");
                metrics::record_query(&rtype, QueryResult::Forwarded, started.elapsed());
                self.relay_reply(request, &reply, response_handle).await
            }
            Err(e) => {
                warn!(name, %target, "upstream exchange failed: {e}");
                metrics::record_forward_failure();
                match self.forward_failure {
                    ForwardFailure::Drop => {
                        // No response; the client is left to time out.
                        metrics::record_query(&rtype, QueryResult::Dropped, started.elapsed());
                        let mut header = header;
                        header.set_response_code(ResponseCode::ServFail);
                        ResponseInfo::from(header)
                    }
                    ForwardFailure::Servfail => {
                        metrics::record_query(&rtype, QueryResult::ServFail, started.elapsed());
                        self.respond_code(request, header, ResponseCode::ServFail, response_handle)
                            .await
                    }
                }
            }
        }
    }
}

#[async_trait]
impl RequestHandler for DnsHandler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        let started = Instant::now();

        // Multi-question messages are undefined on the wire; the first
        // question is the query.
        let query = match request.request_info() {
            Ok(info) => info.query.clone(),
            Err(e) => {
                warn!(src = %request.src(), "malformed request: {e}");
                let mut header = Header::response_from_request(request.header());
                header.set_response_code(ResponseCode::FormErr);
                return ResponseInfo::from(header);
            }
        };

        let name = query.name().to_string();
        let qtype = query.query_type();
        trace!(name = %name, %qtype, src = %request.src(), "query");

        let mut header = Header::response_from_request(request.header());
        header.set_recursion_available(true);

        if qtype == RecordType::A {
            let addrs = self.table.find_host(&name);
            if !addrs.is_empty() {
                debug!(name = %name, count = addrs.len(), "answering A from host table");
                let owner = Name::from(query.name().clone());
                let records: Vec<Record> = addrs
                    .iter()
                    .map(|ip| {
                        let mut record =
                            Record::from_rdata(owner.clone(), 0, RData::A(A::from(*ip)));
                        record.set_dns_class(DNSClass::IN);
                        record
                    })
                    .collect();
                header.set_authoritative(true);
                metrics::record_query("A", QueryResult::Local, started.elapsed());
                return self
                    .respond_records(request, header, &records, &mut response_handle)
                    .await;
            }
        } else if qtype == RecordType::PTR {
            let hosts = self.table.find_reverse(&name);
            if !hosts.is_empty() {
                debug!(name = %name, count = hosts.len(), "answering PTR from reverse table");
                let owner = Name::from(query.name().clone());
                let records: Vec<Record> = hosts
                    .iter()
                    .filter_map(|host| match Name::from_ascii(host) {
                        Ok(ptr) => {
                            let mut record =
                                Record::from_rdata(owner.clone(), 0, RData::PTR(PTR(ptr)));
                            record.set_dns_class(DNSClass::IN);
                            Some(record)
                        }
                        Err(e) => {
                            warn!(host = %host, "skipping unencodable PTR target: {e}");
                            None
                        }
                    })
                    .collect();
                header.set_authoritative(true);
                metrics::record_query("PTR", QueryResult::Local, started.elapsed());
                return self
                    .respond_records(request, header, &records, &mut response_handle)
                    .await;
            }
        }

        self.forward_or_refuse(request, &query, &name, header, started, &mut response_handle)
            .await
    }
}

/// Re-encode the client's question for the upstream exchange, preserving
/// the id, question and recursion flag.
fn forward_query(request: &Request, query: &LowerQuery) -> Message {
    let mut msg = Message::new();
    msg.set_id(request.header().id());
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(request.header().recursion_desired());
    msg.add_query(query.original().clone());
    msg
}
