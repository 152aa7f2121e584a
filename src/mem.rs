//! An in-memory transport: a connector/listener pair joined by duplex pipes
//!  instead of sockets. Used by the test suites and handy for wiring a client
//!  and a server together inside one process.

use std::io;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use crate::conn::{BoxConn, ConnInfo, Connector, Listener};

const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// Creates a connected connector/listener pair. The listener reports a closed
///  listener once every connector clone is dropped.
pub fn pair() -> (MemConnector, MemListener) {
    let (conns_tx, conns_rx) = mpsc::channel(16);
    (
        MemConnector { conns: conns_tx },
        MemListener {
            conns: Mutex::new(conns_rx),
        },
    )
}

#[derive(Clone)]
pub struct MemConnector {
    conns: mpsc::Sender<BoxConn>,
}

#[async_trait]
impl Connector for MemConnector {
    async fn connect(&self) -> anyhow::Result<(BoxConn, ConnInfo)> {
        let (client_end, server_end) = tokio::io::duplex(PIPE_BUFFER_SIZE);
        self.conns
            .send(Box::new(server_end))
            .await
            .map_err(|_| anyhow::anyhow!("cannot connect to in-memory listener: it is closed"))?;
        Ok((Box::new(client_end), ConnInfo::default()))
    }
}

pub struct MemListener {
    conns: Mutex<mpsc::Receiver<BoxConn>>,
}

#[async_trait]
impl Listener for MemListener {
    async fn accept(&self) -> io::Result<(BoxConn, ConnInfo)> {
        match self.conns.lock().await.recv().await {
            Some(conn) => Ok((conn, ConnInfo::default())),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "in-memory listener closed",
            )),
        }
    }
}
