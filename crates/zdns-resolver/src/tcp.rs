//! TCP listener. DNS-over-TCP frames each message with a 2-byte big-endian
//! length prefix (RFC 1035 §4.2.2). Requests on the same connection are
//! handled sequentially so responses preserve arrival order within that
//! connection (spec §5); separate connections run concurrently.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::handler;

pub async fn run(listener: TcpListener, client: Arc<reqwest::Client>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                log::error!("[dns] tcp accept error: {e}");
                continue;
            }
        };

        let client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, peer.ip(), &client).await {
                log::debug!("[dns] tcp connection from {peer} ended: {e}");
            }
        });
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer_ip: std::net::IpAddr,
    client: &reqwest::Client,
) -> std::io::Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(());
        }
        let msg_len = u16::from_be_bytes(len_buf) as usize;

        let mut msg_buf = vec![0u8; msg_len];
        stream.read_exact(&mut msg_buf).await?;

        let reply_bytes = handler::handle_query(client, &msg_buf, peer_ip).await;
        if reply_bytes.is_empty() {
            continue;
        }

        let len_prefix = (reply_bytes.len() as u16).to_be_bytes();
        stream.write_all(&len_prefix).await?;
        stream.write_all(&reply_bytes).await?;
    }
}
