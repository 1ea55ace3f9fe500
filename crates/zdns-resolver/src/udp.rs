//! UDP listener: one `Resolver` instance shared with the TCP listener
//! (spec §4.3 — "two listeners on the same (host, port) ... share a single
//! Resolver instance"). Each datagram is handled on its own task so a slow
//! decision-API round trip never blocks other clients.

use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::handler;

pub async fn run(socket: UdpSocket, client: Arc<reqwest::Client>) {
    let socket = Arc::new(socket);
    let mut buf = [0u8; 512];

    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                log::error!("[dns] udp recv error: {e}");
                continue;
            }
        };

        let request = buf[..len].to_vec();
        let socket = socket.clone();
        let client = client.clone();

        tokio::spawn(async move {
            let reply_bytes = handler::handle_query(&client, &request, peer.ip()).await;
            if reply_bytes.is_empty() {
                return;
            }
            if let Err(e) = socket.send_to(&reply_bytes, peer).await {
                log::error!("[dns] udp send error to {peer}: {e}");
            }
        });
    }
}
