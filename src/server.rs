//! The server endpoint: an accept loop, and per connection a reader that
//!  dispatches requests into user handlers and a writer that drains completed
//!  responses back onto the wire.
//!
//! Two dispatch modes exist, fixed for the lifetime of the server. In the
//!  default concurrent mode every request runs in its own task, gated by the
//!  server-wide concurrency cap; requests beyond the cap are answered with the
//!  codec's "concurrency limit exceeded" response without invoking the
//!  handler. In pipelined mode requests of one connection run serially on its
//!  reader task and the cap gates connections at accept time instead.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time;
use tracing::{debug, error, trace, warn};
use crate::config::ServerConfig;
use crate::conn;
use crate::conn::{BoxConn, ConnInfo, ConnReader, ConnWriter, Handshake, Listener};
use crate::frame;
use crate::frame::IoDeadline;
use crate::pool::Pool;

/// Backoff after a transient accept error.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The per-request state a handler works on: owns the decoded request and the
///  response being produced. Contexts are pooled and re-initialized between
///  requests, so `init` must reset every field that `read_request` does not
///  overwrite.
#[async_trait]
pub trait HandlerCtx: Default + Send + 'static {
    /// Prepares the context for reading the next request.
    fn init(&mut self, conn: &ConnInfo);

    /// Reads one request payload. An error is fatal to the connection.
    async fn read_request(&mut self, br: &mut ConnReader) -> anyhow::Result<()>;

    /// Writes the response payload. An error is fatal to the connection.
    async fn write_response(&mut self, bw: &mut ConnWriter) -> anyhow::Result<()>;

    /// Must set the response to a "concurrency limit exceeded" error.
    fn concurrency_limit_error(&mut self, concurrency: usize);
}

/// Processes one request context into one response context.
///
/// The returned context is the one whose response gets written and recycled:
///  either `ctx` itself, or a freshly produced context if the handler wants to
///  hold on to `ctx` beyond the call.
#[async_trait]
pub trait Handler<C: HandlerCtx>: Send + Sync + 'static {
    async fn handle(&self, ctx: C) -> C;
}

/// Adapts a plain non-blocking closure as a [`Handler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<C, F> Handler<C> for FnHandler<F>
where
    C: HandlerCtx,
    F: Fn(C) -> C + Send + Sync + 'static,
{
    async fn handle(&self, ctx: C) -> C {
        (self.0)(ctx)
    }
}

struct ServerWorkItem<C> {
    /// The request's nonce bytes, echoed verbatim on the response.
    nonce: [u8; 4],
    ctx: C,
}

struct ServerShared<C: HandlerCtx, H: Handler<C>> {
    config: ServerConfig,
    handler: H,
    handshake: Option<Arc<dyn Handshake>>,
    work_item_pool: Pool<ServerWorkItem<C>>,
    concurrency_count: AtomicUsize,
}

impl<C: HandlerCtx, H: Handler<C>> ServerShared<C, H> {
    fn acquire_work_item(&self) -> ServerWorkItem<C> {
        self.work_item_pool.get(|| ServerWorkItem {
            nonce: [0; 4],
            ctx: C::default(),
        })
    }

    fn release_work_item(&self, wi: ServerWorkItem<C>) {
        self.work_item_pool.put(wi);
    }
}

/// Accepts connections and serves rpc requests on them.
pub struct Server<C: HandlerCtx, H: Handler<C>> {
    shared: Arc<ServerShared<C, H>>,
}

impl<C: HandlerCtx, H: Handler<C>> Server<C, H> {
    pub fn new(config: ServerConfig, handler: H) -> anyhow::Result<Server<C, H>> {
        Self::build(config, handler, None)
    }

    pub fn with_handshake(
        config: ServerConfig,
        handler: H,
        handshake: Arc<dyn Handshake>,
    ) -> anyhow::Result<Server<C, H>> {
        Self::build(config, handler, Some(handshake))
    }

    fn build(
        config: ServerConfig,
        handler: H,
        handshake: Option<Arc<dyn Handshake>>,
    ) -> anyhow::Result<Server<C, H>> {
        config.validate()?;
        let shared = Arc::new(ServerShared {
            work_item_pool: Pool::new(config.concurrency),
            concurrency_count: AtomicUsize::new(0),
            config,
            handler,
            handshake,
        });
        Ok(Server { shared })
    }

    /// Serves connections accepted from `listener` until the listener closes.
    ///  Connections being served keep running after this returns; each ends
    ///  when its peer goes away.
    pub async fn serve(&self, listener: impl Listener) -> anyhow::Result<()> {
        let concurrency = self.shared.config.concurrency;
        let pipeline_requests = self.shared.config.pipeline_requests;

        loop {
            let (conn, info) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) if accept_error_is_transient(&e) => {
                    warn!("temporary error when accepting new connections: {}", e);
                    time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => {
                    error!("permanent error when accepting new connections: {}", e);
                    return Err(anyhow::Error::from(e).context("accept failed"));
                }
            };

            if pipeline_requests {
                // in pipelined mode the cap gates whole connections
                let n = self.shared.concurrency_count.fetch_add(1, Ordering::Relaxed) + 1;
                if n > concurrency {
                    self.shared.concurrency_count.fetch_sub(1, Ordering::Relaxed);
                    warn!("concurrency limit exceeded: {}, dropping connection {}", concurrency, info);
                    continue;
                }
            }

            let shared = self.shared.clone();
            tokio::spawn(async move {
                debug!("serving connection {}", info);
                if let Err(e) = serve_conn(shared.clone(), conn, info.clone()).await {
                    warn!("error on connection {}: {:#}", info, e);
                }
                if pipeline_requests {
                    shared.concurrency_count.fetch_sub(1, Ordering::Relaxed);
                }
            });
        }
    }
}

fn accept_error_is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Runs one connection: handshake, buffered split, then a reader and a writer
///  task whose first exit tears the other one down.
async fn serve_conn<C: HandlerCtx, H: Handler<C>>(
    shared: Arc<ServerShared<C, H>>,
    conn: BoxConn,
    info: ConnInfo,
) -> anyhow::Result<()> {
    let (br, bw) = conn::buffered_conn(
        conn,
        shared.config.read_buffer_size,
        shared.config.write_buffer_size,
        shared.handshake.as_deref(),
        shared.config.handshake_timeout,
    )
    .await?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let (resp_tx, resp_rx) = mpsc::channel(shared.config.concurrency);

    let mut reader = tokio::spawn(conn_reader(shared.clone(), br, info, resp_tx, stop_rx.clone()));
    let mut writer = tokio::spawn(conn_writer(shared.clone(), bw, resp_rx, stop_rx));

    // whichever side exits first flips the stop signal; the other side's
    //  blocked read or write then returns an error and it finishes through its
    //  own code path
    select! {
        result = &mut reader => {
            let _ = stop_tx.send(true);
            let _ = (&mut writer).await;
            conn::flatten_join(result)
        }
        result = &mut writer => {
            let _ = stop_tx.send(true);
            let _ = (&mut reader).await;
            conn::flatten_join(result)
        }
    }
}

/// The connection reader: frames requests into pooled work items and
///  dispatches them according to the pipeline mode.
async fn conn_reader<C: HandlerCtx, H: Handler<C>>(
    shared: Arc<ServerShared<C, H>>,
    mut br: ConnReader,
    info: ConnInfo,
    resp_tx: mpsc::Sender<ServerWorkItem<C>>,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let concurrency = shared.config.concurrency;
    let pipeline_requests = shared.config.pipeline_requests;
    let mut io_deadline = IoDeadline::new(shared.config.read_timeout);

    loop {
        let mut wi = shared.acquire_work_item();
        let deadline = io_deadline.current();

        match frame::frame_io(deadline, &mut stop, frame::read_nonce(&mut br)).await {
            Ok(Some(nonce)) => wi.nonce = nonce,
            Ok(None) => return Ok(()),
            Err(e) => {
                return Err(anyhow::Error::from(e).context("cannot read request ID"));
            }
        }

        wi.ctx.init(&info);
        if let Err(e) = frame::frame_io(deadline, &mut stop, wi.ctx.read_request(&mut br)).await {
            return Err(e.context("cannot read request"));
        }

        if pipeline_requests {
            handle_request(&shared, wi, &resp_tx, &mut stop).await;
            // a failed response push may have consumed the stop notification
            if *stop.borrow() {
                return Ok(());
            }
        } else {
            let n = shared.concurrency_count.fetch_add(1, Ordering::Relaxed) + 1;
            if n > concurrency {
                shared.concurrency_count.fetch_sub(1, Ordering::Relaxed);
                trace!("request beyond the concurrency limit of {}", concurrency);
                wi.ctx.concurrency_limit_error(concurrency);
                if !push_pending_response(&resp_tx, &mut stop, wi).await {
                    return Ok(());
                }
                continue;
            }

            let shared = shared.clone();
            let resp_tx = resp_tx.clone();
            let mut stop = stop.clone();
            tokio::spawn(async move {
                handle_request(&shared, wi, &resp_tx, &mut stop).await;
                shared.concurrency_count.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }
}

/// Invokes the handler and routes the returned context: fire-and-forget
///  requests produce no response, everything else is queued for the writer
///  with the request's nonce preserved.
async fn handle_request<C: HandlerCtx, H: Handler<C>>(
    shared: &ServerShared<C, H>,
    wi: ServerWorkItem<C>,
    resp_tx: &mpsc::Sender<ServerWorkItem<C>>,
    stop: &mut watch::Receiver<bool>,
) {
    let ServerWorkItem { nonce, ctx } = wi;
    let ctx = shared.handler.handle(ctx).await;

    if nonce == [0; 4] {
        shared.release_work_item(ServerWorkItem { nonce, ctx });
        return;
    }

    push_pending_response(resp_tx, stop, ServerWorkItem { nonce, ctx }).await;
}

/// Queues a completed work item for the writer, blocking if the channel is
///  full but giving up when the connection shuts down.
async fn push_pending_response<C>(
    resp_tx: &mpsc::Sender<ServerWorkItem<C>>,
    stop: &mut watch::Receiver<bool>,
    wi: ServerWorkItem<C>,
) -> bool {
    match resp_tx.try_send(wi) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(wi)) => {
            select! {
                result = resp_tx.send(wi) => result.is_ok(),
                _ = stop.changed() => false,
            }
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// The connection writer: drains completed work items, writes response frames
///  and manages the batched flush.
async fn conn_writer<C: HandlerCtx, H: Handler<C>>(
    shared: Arc<ServerShared<C, H>>,
    mut bw: ConnWriter,
    mut resp_rx: mpsc::Receiver<ServerWorkItem<C>>,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut io_deadline = IoDeadline::new(shared.config.write_timeout);

    let flush_timer = time::sleep(frame::FLUSH_TIMER_IDLE);
    tokio::pin!(flush_timer);
    let mut flush_armed = false;

    loop {
        let mut wi = match resp_rx.try_recv() {
            Ok(wi) => wi,
            Err(TryRecvError::Disconnected) => return Ok(()),
            Err(TryRecvError::Empty) => {
                select! {
                    maybe_wi = resp_rx.recv() => match maybe_wi {
                        Some(wi) => wi,
                        None => return Ok(()),
                    },
                    _ = stop.changed() => return Ok(()),
                    _ = flush_timer.as_mut(), if flush_armed => {
                        if let Err(e) = frame::frame_io(io_deadline.current(), &mut stop, bw.flush()).await {
                            return Err(anyhow::Error::from(e)
                                .context("cannot flush response data to client"));
                        }
                        flush_armed = false;
                        continue;
                    }
                }
            }
        };

        let deadline = io_deadline.current();
        if let Err(e) =
            frame::frame_io(deadline, &mut stop, frame::write_nonce_bytes(&mut bw, &wi.nonce)).await
        {
            return Err(anyhow::Error::from(e).context("cannot write response ID"));
        }
        if let Err(e) = frame::frame_io(deadline, &mut stop, wi.ctx.write_response(&mut bw)).await {
            return Err(e.context("cannot write response"));
        }
        trace!("sent response frame, nonce {}", u32::from_le_bytes(wi.nonce));
        shared.release_work_item(wi);

        if !flush_armed && resp_rx.is_empty() {
            let flush_at = match shared.config.max_batch_delay {
                Some(delay) => time::Instant::now() + delay,
                None => time::Instant::now(),
            };
            flush_timer.as_mut().reset(flush_at);
            flush_armed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct TestCtx {
        value: Vec<u8>,
        inits: u32,
    }

    #[async_trait]
    impl HandlerCtx for TestCtx {
        fn init(&mut self, _conn: &ConnInfo) {
            self.value.clear();
            self.inits += 1;
        }

        async fn read_request(&mut self, _br: &mut ConnReader) -> anyhow::Result<()> {
            Ok(())
        }

        async fn write_response(&mut self, _bw: &mut ConnWriter) -> anyhow::Result<()> {
            Ok(())
        }

        fn concurrency_limit_error(&mut self, concurrency: usize) {
            self.value = format!("concurrency limit exceeded: {}", concurrency).into_bytes();
        }
    }

    fn test_shared() -> Arc<ServerShared<TestCtx, FnHandler<fn(TestCtx) -> TestCtx>>> {
        Arc::new(ServerShared {
            config: ServerConfig::default(),
            handler: FnHandler(std::convert::identity as fn(TestCtx) -> TestCtx),
            handshake: None,
            work_item_pool: Pool::new(4),
            concurrency_count: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_fn_handler_passes_context_through() {
        let handler = FnHandler(|mut ctx: TestCtx| {
            ctx.value = b"handled".to_vec();
            ctx
        });
        let ctx = handler.handle(TestCtx::default()).await;
        assert_eq!(ctx.value, b"handled");
    }

    #[test]
    fn test_work_items_are_recycled() {
        let shared = test_shared();

        let mut wi = shared.acquire_work_item();
        wi.nonce = [1, 2, 3, 4];
        wi.ctx.value = b"state".to_vec();
        shared.release_work_item(wi);

        let wi = shared.acquire_work_item();
        // recycled verbatim; init() on the read path resets the context
        assert_eq!(wi.nonce, [1, 2, 3, 4]);
        assert_eq!(wi.ctx.value, b"state");
    }

    #[test]
    fn test_accept_error_classification() {
        assert!(accept_error_is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(accept_error_is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(!accept_error_is_transient(&io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(!accept_error_is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn test_push_pending_response_preempted_by_stop() {
        let (resp_tx, _resp_rx) = mpsc::channel(1);
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let wi = ServerWorkItem { nonce: [0; 4], ctx: TestCtx::default() };
        assert!(push_pending_response(&resp_tx, &mut stop_rx, wi).await);

        // channel is now full; a stop signal must unblock the push
        stop_tx.send(true).unwrap();
        let wi = ServerWorkItem { nonce: [0; 4], ctx: TestCtx::default() };
        assert!(!push_pending_response(&resp_tx, &mut stop_rx, wi).await);
    }

    #[tokio::test]
    async fn test_handle_request_drops_nowait_responses() {
        let shared = test_shared();
        let (resp_tx, mut resp_rx) = mpsc::channel(4);
        let (_stop_tx, mut stop_rx) = watch::channel(false);

        let wi = ServerWorkItem { nonce: [0; 4], ctx: TestCtx::default() };
        handle_request(shared.as_ref(), wi, &resp_tx, &mut stop_rx).await;
        assert!(resp_rx.try_recv().is_err());

        let wi = ServerWorkItem { nonce: [7, 0, 0, 0], ctx: TestCtx::default() };
        handle_request(shared.as_ref(), wi, &resp_tx, &mut stop_rx).await;
        let pushed = resp_rx.try_recv().unwrap();
        assert_eq!(pushed.nonce, [7, 0, 0, 0]);
    }
}
