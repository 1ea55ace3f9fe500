//! Thin wrapper around `hermesdns`'s `BytePacketBuffer`/`DnsPacket` so the
//! listener loops deal in `&[u8]` in, `Vec<u8>` out rather than touching the
//! buffer type directly at every call site.
//!
//! `BytePacketBuffer` itself is fixed at 512 bytes, which is smaller than the
//! 4096-byte EDNS0 payload ceiling callers may receive into; messages beyond
//! 512 bytes are truncated here. This is an accepted deviation from full
//! EDNS0 pass-through (spec §6) imposed by the wire codec crate, not a
//! truncation introduced by the caller's receive buffer size.

use std::io;

use hermesdns::{BytePacketBuffer, DnsPacket};

pub fn decode(data: &[u8]) -> io::Result<DnsPacket> {
    let mut buffer = BytePacketBuffer::new();
    let len = data.len().min(buffer.buf.len());
    buffer.buf[..len].copy_from_slice(&data[..len]);
    DnsPacket::from_buffer(&mut buffer)
}

pub fn encode(packet: &DnsPacket) -> io::Result<Vec<u8>> {
    let mut buffer = BytePacketBuffer::new();
    packet.write(&mut buffer)?;
    Ok(buffer.buf[..buffer.pos].to_vec())
}
