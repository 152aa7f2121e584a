//! The fixed part of the framing: the 4-byte little-endian nonce in front of
//!  every payload, and the I/O deadline bookkeeping shared by all four
//!  connection loops.

use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::select;
use tokio::sync::watch;
use tokio::time;
use tokio::time::Instant;
use crate::conn::{ConnReader, ConnWriter};

/// Idle setting for the connection writers' reusable flush timer while no
///  flush is armed.
pub const FLUSH_TIMER_IDLE: Duration = Duration::from_secs(24 * 3600);

pub async fn write_nonce(bw: &mut ConnWriter, nonce: u32) -> io::Result<()> {
    bw.write_all(&nonce.to_le_bytes()).await
}

/// Writes nonce bytes that were read off the wire back verbatim.
pub async fn write_nonce_bytes(bw: &mut ConnWriter, nonce: &[u8; 4]) -> io::Result<()> {
    bw.write_all(nonce).await
}

/// Reads the 4 nonce bytes of the next frame.
///
/// Returns `Ok(None)` if the peer closed the connection before the first byte:
///  that is the normal end of a connection's frame stream. A close in the
///  middle of the nonce is an error, because framing is lost.
pub async fn read_nonce(br: &mut ConnReader) -> io::Result<Option<[u8; 4]>> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        let n = br.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside a frame header",
            ));
        }
        filled += n;
    }
    Ok(Some(buf))
}

/// Tracks the effective read or write deadline of one connection direction.
///
/// The deadline is only pushed forward once more than 25% of the timeout has
///  elapsed since it was last pushed. Refreshing it on every frame would put a
///  deadline computation on the per-frame hot path for no gain in precision;
///  the price is that the effective timeout is up to 25% longer than
///  configured.
pub struct IoDeadline {
    timeout: Option<Duration>,
    last_refresh: Option<Instant>,
    deadline: Instant,
}

impl IoDeadline {
    pub fn new(timeout: Option<Duration>) -> IoDeadline {
        IoDeadline {
            timeout,
            last_refresh: None,
            deadline: Instant::now(),
        }
    }

    /// The deadline to apply to the next frame's I/O, or `None` if this
    ///  direction is not limited.
    pub fn current(&mut self) -> Option<Instant> {
        let timeout = self.timeout?;
        let now = Instant::now();
        let stale = match self.last_refresh {
            Some(last) => now - last > timeout / 4,
            None => true,
        };
        if stale {
            self.deadline = now + timeout;
            self.last_refresh = Some(now);
        }
        Some(self.deadline)
    }
}

/// Runs `fut` against an optional absolute deadline. Exceeding the deadline
///  surfaces as a `TimedOut` I/O error, which is fatal to the connection just
///  like any other socket error.
pub async fn with_deadline<T, E, F>(deadline: Option<Instant>, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<io::Error>,
{
    match deadline {
        Some(deadline) => match time::timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "i/o deadline exceeded").into()),
        },
        None => fut.await,
    }
}

/// Runs one frame I/O step against the optional deadline and the connection's
///  close signal. A connection being torn down surfaces as an I/O error on the
///  blocked read or write, so the loop holding a work item completes it
///  through its normal error path instead of the item being lost with the
///  task.
pub async fn frame_io<T, E, F>(
    deadline: Option<Instant>,
    closed: &mut watch::Receiver<bool>,
    fut: F,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<io::Error>,
{
    // the close notification may already have been consumed by other code
    //  sharing this receiver, so check the flag itself first
    if *closed.borrow() {
        return Err(closed_conn_error().into());
    }
    select! {
        result = with_deadline(deadline, fut) => result,
        _ = closed.changed() => Err(closed_conn_error().into()),
    }
}

fn closed_conn_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
    use crate::conn::BoxConn;

    async fn frame_pair() -> (ConnReader, ConnWriter) {
        let (a, b) = tokio::io::duplex(1024);
        let (read_half, _) = tokio::io::split(Box::new(a) as BoxConn);
        let (_, write_half) = tokio::io::split(Box::new(b) as BoxConn);
        (BufReader::new(read_half), BufWriter::new(write_half))
    }

    #[tokio::test]
    async fn test_nonce_roundtrip_little_endian() {
        let (mut br, mut bw) = frame_pair().await;

        write_nonce(&mut bw, 0x0403_0201).await.unwrap();
        bw.flush().await.unwrap();

        let nonce = read_nonce(&mut br).await.unwrap().unwrap();
        assert_eq!(nonce, [1, 2, 3, 4]);
        assert_eq!(u32::from_le_bytes(nonce), 0x0403_0201);
    }

    #[tokio::test]
    async fn test_clean_eof_before_first_byte() {
        let (mut br, bw) = frame_pair().await;
        drop(bw);

        assert!(read_nonce(&mut br).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_inside_header_is_an_error() {
        let (mut br, mut bw) = frame_pair().await;

        bw.write_all(&[1, 2]).await.unwrap();
        bw.flush().await.unwrap();
        drop(bw);

        let err = read_nonce(&mut br).await.err().expect("short header");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test(start_paused = true)]
    async fn test_io_deadline_refreshes_after_a_quarter() {
        let mut deadline = IoDeadline::new(Some(Duration::from_secs(4)));

        let first = deadline.current().unwrap();

        // within 25% of the timeout the deadline stays put
        time::advance(Duration::from_millis(900)).await;
        assert_eq!(deadline.current().unwrap(), first);

        // beyond 25% it is pushed forward
        time::advance(Duration::from_millis(200)).await;
        let second = deadline.current().unwrap();
        assert!(second > first);
        assert_eq!(second, Instant::now() + Duration::from_secs(4));
    }

    #[test]
    fn test_io_deadline_unlimited() {
        let mut deadline = IoDeadline::new(None);
        assert!(deadline.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_times_out() {
        let deadline = Some(Instant::now() + Duration::from_millis(50));
        let result: Result<(), io::Error> =
            with_deadline(deadline, std::future::pending()).await;
        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_frame_io_unblocks_on_connection_close() {
        let (closed_tx, mut closed_rx) = watch::channel(false);
        closed_tx.send(true).unwrap();

        let result: Result<(), io::Error> =
            frame_io(None, &mut closed_rx, std::future::pending()).await;
        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::ConnectionAborted);
    }
}
