use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tracing::debug;

/// A bidirectional byte stream the transport can run over. Anything that is
///  `AsyncRead + AsyncWrite` qualifies - TCP streams, TLS wrappers, in-memory
///  duplex pipes.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Conn for T {}

pub type BoxConn = Box<dyn Conn>;

/// The buffered read half handed to codec `read` callbacks.
pub type ConnReader = BufReader<ReadHalf<BoxConn>>;

/// The buffered write half handed to codec `write` callbacks.
pub type ConnWriter = BufWriter<WriteHalf<BoxConn>>;

/// Addresses of an established connection, for log and error context. Both
///  sides are optional: in-memory transports have no addresses.
#[derive(Debug, Clone, Default)]
pub struct ConnInfo {
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
}

impl fmt::Display for ConnInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.local_addr {
            Some(addr) => write!(f, "{}", addr)?,
            None => write!(f, "-")?,
        }
        write!(f, "<->")?;
        match self.remote_addr {
            Some(addr) => write!(f, "{}", addr),
            None => write!(f, "-"),
        }
    }
}

/// Dials the server. The client re-invokes this every time it needs a fresh
///  connection, so implementations must be usable repeatedly.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> anyhow::Result<(BoxConn, ConnInfo)>;
}

/// Plain TCP dialing with `TCP_NODELAY`.
pub struct TcpConnector {
    pub addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> TcpConnector {
        TcpConnector { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> anyhow::Result<(BoxConn, ConnInfo)> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("cannot connect to {:?}", self.addr))?;
        stream.set_nodelay(true)?;
        let info = ConnInfo {
            local_addr: stream.local_addr().ok(),
            remote_addr: stream.peer_addr().ok(),
        };
        debug!("connected to {}", info);
        Ok((Box::new(stream), info))
    }
}

/// Accepts inbound connections on the server.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// An `UnexpectedEof` error means the listener was closed and the accept
    ///  loop should end cleanly.
    async fn accept(&self) -> std::io::Result<(BoxConn, ConnInfo)>;
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> std::io::Result<(BoxConn, ConnInfo)> {
        let (stream, remote_addr) = TcpListener::accept(self).await?;
        stream.set_nodelay(true)?;
        let info = ConnInfo {
            local_addr: stream.local_addr().ok(),
            remote_addr: Some(remote_addr),
        };
        Ok((Box::new(stream), info))
    }
}

/// Optional connection wrapper run right after dial/accept: protocol version
///  exchange, authentication, compression negotiation. The returned connection
///  replaces the raw one.
#[async_trait]
pub trait Handshake: Send + Sync + 'static {
    async fn handshake(&self, conn: BoxConn) -> anyhow::Result<BoxConn>;
}

/// Collapses the join result of a connection reader/writer task into the
///  task's own outcome.
pub(crate) fn flatten_join(
    result: Result<anyhow::Result<()>, tokio::task::JoinError>,
) -> anyhow::Result<()> {
    match result {
        Ok(inner) => inner,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(anyhow::anyhow!("connection task panicked: {}", e)),
    }
}

/// Runs the optional handshake under its time budget, then splits the
///  connection into buffered halves sized per configuration.
pub(crate) async fn buffered_conn(
    conn: BoxConn,
    read_buffer_size: usize,
    write_buffer_size: usize,
    handshake: Option<&dyn Handshake>,
    handshake_timeout: Duration,
) -> anyhow::Result<(ConnReader, ConnWriter)> {
    let conn = match handshake {
        Some(handshake) => time::timeout(handshake_timeout, handshake.handshake(conn))
            .await
            .map_err(|_| anyhow::anyhow!("handshake timed out after {:?}", handshake_timeout))?
            .context("error in handshake")?,
        None => conn,
    };

    let (read_half, write_half) = tokio::io::split(conn);
    Ok((
        BufReader::with_capacity(read_buffer_size, read_half),
        BufWriter::with_capacity(write_buffer_size, write_half),
    ))
}
