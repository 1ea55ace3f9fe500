//! zdns-resolver: the DNS data plane (C8). UDP and TCP listeners on the
//! same `(host, port)` share one decision-API HTTP client, obtain a
//! decision per query from zdns-api's `/dns/query`, and either synthesize a
//! sinkhole/NXDOMAIN/SERVFAIL answer or forward to `DNS_UPSTREAM`.

use std::sync::Arc;

use dotenv::dotenv;
use tokio::net::{TcpListener, UdpSocket};

use zdns_core::config;

mod answer;
mod codec;
mod decision;
mod forward;
mod handler;
mod tcp;
mod udp;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init();

    let host = config::dns_listen_host();
    let port = config::dns_listen_port();
    let addr = format!("{host}:{port}");

    let udp_socket = UdpSocket::bind(&addr).await?;
    let tcp_listener = TcpListener::bind(&addr).await?;
    log::info!("[dns] zdns-resolver listening on udp+tcp {addr}");
    log::info!(
        "[dns] upstream={} decision_api={} fail_open={}",
        config::dns_upstream(),
        config::dns_threat_api(),
        config::dns_fail_open()
    );

    let client = Arc::new(
        reqwest::Client::builder()
            .build()
            .expect("failed to build decision-API HTTP client"),
    );

    let udp_task = tokio::spawn(udp::run(udp_socket, client.clone()));
    let tcp_task = tokio::spawn(tcp::run(tcp_listener, client));

    let _ = tokio::join!(udp_task, tcp_task);
    Ok(())
}
