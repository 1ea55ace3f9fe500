//! Synthesizes sinkhole/NXDOMAIN/empty-NOERROR answers per spec §4.3 steps
//! 4–5. Forwarding (ALLOW) is handled by `forward.rs`; this module only
//! builds locally-terminated replies.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use hermesdns::{DnsPacket, DnsRecord, QueryType, ResultCode, TransientTtl};

use zdns_core::config;

const SYNTHESIZED_TTL: u32 = 30;

pub fn nxdomain(request: &DnsPacket) -> DnsPacket {
    let mut reply = base_reply(request);
    reply.header.rescode = ResultCode::NXDOMAIN;
    reply
}

pub fn servfail(request: &DnsPacket) -> DnsPacket {
    let mut reply = base_reply(request);
    reply.header.rescode = ResultCode::SERVFAIL;
    reply
}

/// NOERROR with the appropriate A/AAAA sinkhole record, or an empty NOERROR
/// for qtypes outside {A, AAAA, ANY} per spec §4.3 step 4.
pub fn sinkhole(request: &DnsPacket, domain: &str, qtype: QueryType) -> DnsPacket {
    let mut reply = base_reply(request);
    reply.header.rescode = ResultCode::NOERROR;

    if matches!(qtype, QueryType::A | QueryType::UNKNOWN(255)) {
        if let Ok(addr) = Ipv4Addr::from_str(&config::dns_sinkhole_ipv4()) {
            reply.answers.push(DnsRecord::A {
                domain: domain.to_string(),
                addr,
                ttl: TransientTtl(SYNTHESIZED_TTL),
            });
        }
    }
    if matches!(qtype, QueryType::AAAA | QueryType::UNKNOWN(255)) {
        if let Ok(addr) = Ipv6Addr::from_str(&config::dns_sinkhole_ipv6()) {
            reply.answers.push(DnsRecord::AAAA {
                domain: domain.to_string(),
                addr,
                ttl: TransientTtl(SYNTHESIZED_TTL),
            });
        }
    }

    reply
}

fn base_reply(request: &DnsPacket) -> DnsPacket {
    let mut reply = DnsPacket::new();
    reply.header.id = request.header.id;
    reply.header.recursion_desired = request.header.recursion_desired;
    reply.header.recursion_available = true;
    reply.header.response = true;
    reply.questions = request.questions.clone();
    reply
}

/// `ANY` is represented in hermesdns as `QueryType::UNKNOWN(255)`; spec §4.3
/// treats it as "both A and AAAA". `is_any` centralizes that mapping so
/// `sinkhole` above and the listener's qtype classification agree.
pub fn is_any(qtype: QueryType) -> bool {
    matches!(qtype, QueryType::UNKNOWN(255))
}
