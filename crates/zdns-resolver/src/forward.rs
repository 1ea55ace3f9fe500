//! Forwards an ALLOW query to `DNS_UPSTREAM` over UDP and returns its reply
//! verbatim (spec §4.3 step 6: "byte-identical except for the DNS ID
//! rewrite done by packing/unpacking"). A timeout or malformed reply maps to
//! SERVFAIL, synthesized locally by the caller.

use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;

use hermesdns::DnsPacket;
use zdns_core::config;

use crate::codec;

pub async fn forward(query: &DnsPacket) -> io::Result<DnsPacket> {
    let upstream: SocketAddr = config::dns_upstream()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("bad DNS_UPSTREAM: {e}")))?;
    let timeout = config::dns_upstream_timeout();

    let socket = UdpSocket::bind(local_bind_addr(&upstream)).await?;
    let request_bytes = codec::encode(query)?;

    tokio::time::timeout(timeout, socket.send_to(&request_bytes, upstream))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream DNS send timed out"))??;

    // 4096 covers the common EDNS0 UDP payload ceiling; a plain 512-byte
    // buffer would silently truncate (UDP drops what doesn't fit) any larger
    // upstream reply before `codec::decode` ever saw the rest of it.
    let mut buf = [0u8; 4096];
    let (len, _) = tokio::time::timeout(timeout, socket.recv_from(&mut buf))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream DNS timed out"))??;

    let mut reply = codec::decode(&buf[..len])?;
    // The upstream's reply ID should already echo the query, but rewrite it
    // defensively per spec's "byte-identical except for the DNS ID rewrite".
    reply.header.id = query.header.id;
    Ok(reply)
}

fn local_bind_addr(upstream: &SocketAddr) -> &'static str {
    if upstream.is_ipv6() {
        "[::]:0"
    } else {
        "0.0.0.0:0"
    }
}
