//! Per-query pipeline shared by the UDP and TCP listeners: decode → decision
//! API → synthesize or forward → encode. One raw query message in, one
//! reply message out; transport-specific framing lives in `udp.rs`/`tcp.rs`.

use std::net::IpAddr;

use hermesdns::{DnsPacket, QueryType};

use zdns_core::config::{self, BlockMode, WarnMode};

use crate::answer;
use crate::codec;
use crate::decision;
use crate::forward;

pub async fn handle_query(client: &reqwest::Client, request_bytes: &[u8], peer_ip: IpAddr) -> Vec<u8> {
    let request = match codec::decode(request_bytes) {
        Ok(packet) => packet,
        Err(e) => {
            log::warn!("[dns] failed to decode query from {peer_ip}: {e}");
            return Vec::new();
        }
    };

    let Some(question) = request.questions.first() else {
        log::warn!("[dns] query from {peer_ip} carried no question");
        let reply = answer::servfail(&request);
        return codec::encode(&reply).unwrap_or_default();
    };

    let qname = question.name.trim_end_matches('.').to_lowercase();
    let qtype = question.qtype;
    let qtype_name = qtype_symbol(qtype);

    let decision = decision::decide(client, &qname, &peer_ip.to_string(), &qtype_name).await;
    log::info!(
        "[dns] {qname} ({qtype_name}) from {peer_ip} -> {} ray={}",
        decision.action,
        decision.ray_id
    );

    let reply = match decision.action.as_str() {
        "BLOCK" => build_block_reply(&request, &qname, qtype),
        "WARN" => build_warn_reply(&request, &qname, qtype).await,
        _ => forward_or_servfail(&request).await,
    };

    codec::encode(&reply).unwrap_or_default()
}

fn build_block_reply(request: &DnsPacket, qname: &str, qtype: QueryType) -> DnsPacket {
    match config::dns_block_mode() {
        BlockMode::NxDomain => answer::nxdomain(request),
        BlockMode::Sinkhole => answer::sinkhole(request, qname, qtype),
    }
}

async fn build_warn_reply(request: &DnsPacket, qname: &str, qtype: QueryType) -> DnsPacket {
    match config::dns_warn_mode() {
        WarnMode::NxDomain => answer::nxdomain(request),
        WarnMode::Sinkhole => answer::sinkhole(request, qname, qtype),
        WarnMode::Allow => forward_or_servfail(request).await,
    }
}

async fn forward_or_servfail(request: &DnsPacket) -> DnsPacket {
    match forward::forward(request).await {
        Ok(reply) => reply,
        Err(e) => {
            log::error!("[dns] upstream forward failed: {e}");
            answer::servfail(request)
        }
    }
}

fn qtype_symbol(qtype: QueryType) -> String {
    if answer::is_any(qtype) {
        "ANY".to_string()
    } else {
        format!("{:?}", qtype)
    }
}
