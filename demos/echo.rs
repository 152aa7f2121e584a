//! A minimal echo service: a TCP server whose handler mirrors the request
//!  value back, and a client calling it once.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use muxrpc::client::Client;
use muxrpc::config::{ClientConfig, ServerConfig};
use muxrpc::conn::TcpConnector;
use muxrpc::server::{FnHandler, Server};
use muxrpc::tlv;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server = Server::new(
        ServerConfig::default(),
        FnHandler(|mut ctx: tlv::RequestCtx| {
            let value = ctx.request.value().to_vec();
            ctx.response.set_value(&value);
            ctx
        }),
    )?;
    tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            tracing::error!("server failed: {:#}", e);
        }
    });

    let client: Client<tlv::Request, tlv::Response> = Client::new(
        ClientConfig::default(),
        Arc::new(TcpConnector::new(addr.to_string())),
    )?;

    let mut req = tlv::Request::default();
    req.set_value(b"hello over muxrpc");
    let resp = client
        .call_timeout(req, tlv::Response::default(), Duration::from_secs(2))
        .await?;

    println!("echoed: {}", String::from_utf8_lossy(resp.value()));

    client.close().await;
    Ok(())
}
