//! The client endpoint: a single re-dialed connection, a bounded queue of
//!  outbound requests, nonce-correlated responses and a reaper for stale work.
//!
//! Three background tasks cooperate per client: the connection driver (dials,
//!  runs one connection at a time, drains the pending-response map when it
//!  dies), the connection writer and reader (one pair per live connection) and
//!  the reaper. They share state through [`ClientShared`]: the bounded
//!  pending-request queue, the nonce-keyed pending-response map and the
//!  recorded last connection error.

use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use anyhow::anyhow;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::io::AsyncWriteExt;
use tokio::select;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};
use crate::config::ClientConfig;
use crate::conn;
use crate::conn::{BoxConn, ConnReader, ConnWriter, Connector, Handshake};
use crate::error::Error;
use crate::frame;
use crate::frame::IoDeadline;
use crate::queue::PendingQueue;

/// Serializes one request onto the connection's buffered writer. The transport
///  writes the nonce first and invokes this for the payload; it never looks at
///  the bytes written.
#[async_trait]
pub trait RequestWriter: Send + 'static {
    async fn write_request(&mut self, bw: &mut ConnWriter) -> anyhow::Result<()>;
}

/// Reads one response payload from the connection's buffered reader. An error
///  is fatal to the connection, since the frame boundary is lost with it.
#[async_trait]
pub trait ResponseReader: Send + 'static {
    async fn read_response(&mut self, br: &mut ConnReader) -> anyhow::Result<()>;
}

/// Release hook for fire-and-forget requests: invoked with the owned request
///  exactly once when the transport is finally done with it, whether it was
///  sent, evicted on overflow, reaped, or rejected outright. Lets callers
///  recycle request objects through a [`crate::pool::Pool`].
pub type ReleaseFn<Req> = Box<dyn FnOnce(Req) + Send + 'static>;

/// How long the transport holds on to a fire-and-forget request at most. The
///  reaper frees them after this even if the link stalls before they reach
///  the wire.
const NOWAIT_DEADLINE: Duration = Duration::from_secs(10);

/// Backoff between dial attempts, and after a failed handshake.
const DIAL_RETRY_DELAY: Duration = Duration::from_secs(1);

const REAPER_MIN_SLEEP: Duration = Duration::from_millis(10);
const REAPER_MAX_SLEEP: Duration = Duration::from_secs(1);

struct ClientWorkItem<Req, Resp> {
    req: Req,
    /// `Some` for request-reply, `None` for fire-and-forget.
    resp: Option<Resp>,
    release_req: Option<ReleaseFn<Req>>,
    deadline: Instant,
    /// The single-use completion signal. `None` for fire-and-forget.
    done: Option<oneshot::Sender<Result<Resp, Error>>>,
}

impl<Req: std::fmt::Debug, Resp: std::fmt::Debug> std::fmt::Debug for ClientWorkItem<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientWorkItem")
            .field("req", &self.req)
            .field("resp", &self.resp)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl<Req, Resp> ClientWorkItem<Req, Resp> {
    fn is_nowait(&self) -> bool {
        self.done.is_none()
    }

    /// Completes a request-reply item with an error, or finally releases a
    ///  fire-and-forget item. Consumes the item, so completion is one-shot by
    ///  construction.
    fn complete_err(self, err: Error) {
        match self.done {
            Some(done) => {
                // the caller may have stopped waiting; that is fine
                let _ = done.send(Err(err));
            }
            None => self.release(),
        }
    }

    /// Completes a request-reply item with its filled response.
    fn complete_ok(self) {
        let resp = self
            .resp
            .expect("BUG: request-reply work item without a response");
        if let Some(done) = self.done {
            let _ = done.send(Ok(resp));
        }
    }

    /// Final release of a fire-and-forget item: hands the request back to its
    ///  owner via the release hook, if one was given.
    fn release(self) {
        if let Some(release) = self.release_req {
            release(self.req);
        }
    }
}

struct ClientShared<Req, Resp> {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    handshake: Option<Arc<dyn Handshake>>,

    pending_requests: PendingQueue<ClientWorkItem<Req, Resp>>,
    pending_responses: Mutex<FxHashMap<u32, ClientWorkItem<Req, Resp>>>,
    pending_requests_count: AtomicUsize,

    last_err: Mutex<Option<Error>>,
    stop_rx: watch::Receiver<bool>,
}

impl<Req, Resp> ClientShared<Req, Resp>
where
    Req: RequestWriter,
    Resp: ResponseReader + Default,
{
    fn is_closed(&self) -> bool {
        *self.stop_rx.borrow()
    }

    fn set_last_error(&self, err: Error) {
        *self.last_err.lock().unwrap() = Some(err);
    }

    /// The recorded last connection error usually carries more context (dial
    ///  failure, peer addresses, codec error) than the generic error a
    ///  completion would otherwise surface, so it is preferred when present.
    fn last_error_or(&self, err: Error) -> Error {
        match self.last_err.lock().unwrap().clone() {
            Some(last) => last,
            None => err,
        }
    }

    fn done_error(&self, wi: ClientWorkItem<Req, Resp>, err: Error) {
        // reaper-initiated timeouts must surface as timeouts
        let err = match err {
            Error::Timeout => Error::Timeout,
            other => self.last_error_or(other),
        };
        wi.complete_err(err);
    }

    /// Admits a work item into the pending-request queue. On a full queue the
    ///  default is to hand the item back; with `prioritize_new_requests` the
    ///  oldest queued item is evicted (and completed with overflow) to make
    ///  room for the new one.
    fn enqueue(&self, wi: ClientWorkItem<Req, Resp>) -> Result<(), ClientWorkItem<Req, Resp>> {
        match self.pending_requests.try_push(wi) {
            Ok(()) => Ok(()),
            Err(wi) => {
                if !self.config.prioritize_new_requests {
                    return Err(wi);
                }
                match self.pending_requests.try_pop() {
                    Some(oldest) => self.done_error(oldest, Error::PendingRequestsOverflow),
                    None => return Err(wi),
                }
                self.pending_requests.try_push(wi)
            }
        }
    }

    /// Completes everything that was waiting for a response on a connection
    ///  that just died.
    fn drain_pending_responses(&self) {
        let drained: Vec<ClientWorkItem<Req, Resp>> = {
            let mut pending = self.pending_responses.lock().unwrap();
            pending.drain().map(|(_, wi)| wi).collect()
        };
        if !drained.is_empty() {
            debug!("completing {} pending responses after connection loss", drained.len());
        }
        for wi in drained {
            self.done_error(wi, closed_error());
        }
    }

    /// One reaper pass over the queue: pulls at most the current queue length,
    ///  completes expired items with a timeout and re-admits the rest.
    fn sweep_stale_requests(&self) -> bool {
        let mut found = false;
        let n = self.pending_requests.len();
        let now = Instant::now();
        for _ in 0..n {
            let Some(wi) = self.pending_requests.try_pop() else {
                break;
            };
            if now > wi.deadline {
                self.done_error(wi, Error::Timeout);
                found = true;
            } else if let Err(wi) = self.enqueue(wi) {
                self.done_error(wi, Error::PendingRequestsOverflow);
            }
        }
        found
    }

    /// One reaper pass over the pending-response map. Completion is a
    ///  non-blocking oneshot send, so doing it under the map lock is fine.
    fn sweep_stale_responses(&self) -> bool {
        let now = Instant::now();
        let mut unblocked = false;

        let mut pending = self.pending_responses.lock().unwrap();
        let stale: Vec<u32> = pending
            .iter()
            .filter(|(_, wi)| now > wi.deadline)
            .map(|(nonce, _)| *nonce)
            .collect();
        for nonce in stale {
            if let Some(wi) = pending.remove(&nonce) {
                self.done_error(wi, Error::Timeout);
                unblocked = true;
            }
        }
        unblocked
    }
}

fn closed_error() -> Error {
    Error::conn(anyhow!("connection closed by server"))
}

/// Sends requests to a server over a single connection, transparently
///  re-dialing on failure.
///
/// `Req` and `Resp` are the codec's request and response types; the caller
///  owns both and gets the response back through the completion, which keeps
///  the steady-state request path free of per-call allocations. `Resp`'s
///  `Default` supplies the throwaway object used to consume responses whose
///  request has already timed out.
///
/// Run a second client over a second connection if a single connection
///  saturates a CPU core on either side.
pub struct Client<Req, Resp>
where
    Req: RequestWriter,
    Resp: ResponseReader + Default,
{
    shared: Arc<ClientShared<Req, Resp>>,
    init: Once,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
}

impl<Req, Resp> Client<Req, Resp>
where
    Req: RequestWriter,
    Resp: ResponseReader + Default,
{
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> anyhow::Result<Client<Req, Resp>> {
        Self::build(config, connector, None)
    }

    pub fn with_handshake(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        handshake: Arc<dyn Handshake>,
    ) -> anyhow::Result<Client<Req, Resp>> {
        Self::build(config, connector, Some(handshake))
    }

    fn build(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        handshake: Option<Arc<dyn Handshake>>,
    ) -> anyhow::Result<Client<Req, Resp>> {
        config.validate()?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let shared = Arc::new(ClientShared {
            pending_requests: PendingQueue::new(config.max_pending_requests),
            pending_responses: Mutex::new(FxHashMap::default()),
            pending_requests_count: AtomicUsize::new(0),
            last_err: Mutex::new(None),
            stop_rx,
            config,
            connector,
            handshake,
        });
        Ok(Client {
            shared,
            init: Once::new(),
            tasks: Mutex::new(Vec::new()),
            stop_tx,
        })
    }

    /// One-shot transition out of the fresh state: starts the connection
    ///  driver and the reaper.
    fn ensure_running(&self) {
        self.init.call_once(|| {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.push(tokio::spawn(run_driver(
                self.shared.clone(),
                self.shared.stop_rx.clone(),
            )));
            tasks.push(tokio::spawn(run_reaper(
                self.shared.clone(),
                self.shared.stop_rx.clone(),
            )));
        });
    }

    /// Sends `req` and waits for the response or the deadline, whichever comes
    ///  first. On success the filled `resp` is handed back, so response
    ///  objects can be reused across calls.
    ///
    /// A timeout completes with [`Error::Timeout`] and leaves the connection
    ///  alone; the late response, should it still arrive, is discarded.
    pub async fn call_deadline(&self, req: Req, resp: Resp, deadline: Instant) -> Result<Resp, Error> {
        let shared = &self.shared;
        if shared.is_closed() {
            return Err(shared.last_error_or(closed_error()));
        }
        self.ensure_running();

        let n = shared.pending_requests_count.fetch_add(1, Ordering::Relaxed) + 1;
        let _count = CountGuard(&shared.pending_requests_count);
        if n > shared.config.max_pending_requests && !shared.config.prioritize_new_requests {
            // fast-path reject, independent of the queue's state; with
            //  prioritize_new_requests the queue's evict-oldest policy decides
            return Err(shared.last_error_or(Error::PendingRequestsOverflow));
        }

        let (done_tx, done_rx) = oneshot::channel();
        let wi = ClientWorkItem {
            req,
            resp: Some(resp),
            release_req: None,
            deadline,
            done: Some(done_tx),
        };
        if shared.enqueue(wi).is_err() {
            return Err(shared.last_error_or(Error::PendingRequestsOverflow));
        }

        let mut stop = shared.stop_rx.clone();
        select! {
            result = done_rx => match result {
                Ok(completion) => completion,
                // the item was dropped in a connection teardown
                Err(_) => Err(shared.last_error_or(closed_error())),
            },
            _ = stop.changed() => Err(shared.last_error_or(closed_error())),
        }
    }

    /// [`Client::call_deadline`] with a relative timeout.
    pub async fn call_timeout(&self, req: Req, resp: Resp, timeout: Duration) -> Result<Resp, Error> {
        self.call_deadline(req, resp, Instant::now() + timeout).await
    }

    /// Schedules `req` for sending and forgets about it: no response is
    ///  expected and none is waited for. Returns whether the request was
    ///  admitted. The release hook, if given, receives the request back once
    ///  the transport is done with it - admitted or not.
    ///
    /// Fire-and-forget requests are not counted against
    ///  `max_pending_requests`, since no caller blocks on them.
    pub fn send_nowait(&self, req: Req, release_req: Option<ReleaseFn<Req>>) -> bool {
        let shared = &self.shared;
        if shared.is_closed() {
            if let Some(release) = release_req {
                release(req);
            }
            return false;
        }
        self.ensure_running();

        let wi = ClientWorkItem {
            req,
            resp: None,
            release_req,
            deadline: Instant::now() + NOWAIT_DEADLINE,
            done: None,
        };
        match shared.enqueue(wi) {
            Ok(()) => true,
            Err(wi) => {
                wi.release();
                false
            }
        }
    }

    /// The number of requests currently admitted and not yet completed. Useful
    ///  for informational purposes and for load balancing over several clients.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending_requests_count.load(Ordering::Relaxed)
    }

    /// One-shot shutdown: stops the background tasks, tears down the current
    ///  connection and completes everything still pending with a
    ///  connection-closed error. New work is rejected afterwards. Idempotent.
    pub async fn close(&self) {
        let _ = self.stop_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        while let Some(wi) = self.shared.pending_requests.try_pop() {
            self.shared.done_error(wi, closed_error());
        }
        self.shared.drain_pending_responses();
    }
}

struct CountGuard<'a>(&'a AtomicUsize);

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The connection driver: dials lazily once work shows up, runs one connection
///  until it dies, completes what was in flight and dials again.
async fn run_driver<Req, Resp>(shared: Arc<ClientShared<Req, Resp>>, mut stop: watch::Receiver<bool>)
where
    Req: RequestWriter,
    Resp: ResponseReader + Default,
{
    loop {
        // no connection is held while idle; wait for the first request
        let wi = select! {
            _ = stop.changed() => return,
            wi = shared.pending_requests.pop() => wi,
        };
        // put it back so it is on the queue (and visible to the reaper)
        //  while the dial is in progress
        if let Err(wi) = shared.enqueue(wi) {
            shared.done_error(wi, Error::PendingRequestsOverflow);
        }

        let (conn, info) = select! {
            _ = stop.changed() => return,
            result = shared.connector.connect() => match result {
                Ok(connected) => connected,
                Err(e) => {
                    debug!("dial failed: {:#}", e);
                    shared.set_last_error(Error::conn(e));
                    select! {
                        _ = stop.changed() => return,
                        _ = time::sleep(DIAL_RETRY_DELAY) => {}
                    }
                    continue;
                }
            }
        };

        debug!("serving connection {}", info);
        match serve_conn(shared.clone(), conn, stop.clone()).await {
            Ok(()) => {
                shared.set_last_error(Error::conn(anyhow!("{}: connection closed by server", info)));
            }
            Err(e) => {
                warn!("connection {} failed: {:#}", info, e);
                shared.set_last_error(Error::conn(e.context(info.to_string())));
            }
        }
        shared.drain_pending_responses();

        if *stop.borrow() {
            return;
        }
    }
}

/// Runs one connection: handshake, buffered split, then a reader and a writer
///  task whose first exit tears the other one down.
async fn serve_conn<Req, Resp>(
    shared: Arc<ClientShared<Req, Resp>>,
    conn: BoxConn,
    stop: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    Req: RequestWriter,
    Resp: ResponseReader + Default,
{
    let (br, bw) = match conn::buffered_conn(
        conn,
        shared.config.read_buffer_size,
        shared.config.write_buffer_size,
        shared.handshake.as_deref(),
        shared.config.handshake_timeout,
    )
    .await
    {
        Ok(halves) => halves,
        Err(e) => {
            // back off before the next dial, like after a failed dial
            let mut stop = stop;
            select! {
                _ = stop.changed() => {}
                _ = time::sleep(DIAL_RETRY_DELAY) => {}
            }
            return Err(e);
        }
    };

    // whichever side exits first flips the close signal; the other side's
    //  blocked read or write then returns an error and it finishes through its
    //  own completion path, so no work item in hand is ever lost
    let (closed_tx, closed_rx) = watch::channel(false);

    let mut reader = tokio::spawn(conn_reader(shared.clone(), br, closed_rx.clone()));
    let mut writer = tokio::spawn(conn_writer(shared.clone(), bw, stop, closed_rx));

    select! {
        result = &mut reader => {
            let _ = closed_tx.send(true);
            let _ = (&mut writer).await;
            conn::flatten_join(result)
        }
        result = &mut writer => {
            let _ = closed_tx.send(true);
            let _ = (&mut reader).await;
            conn::flatten_join(result)
        }
    }
}

/// The connection writer: drains the pending-request queue, assigns nonces,
///  writes frames and manages the batched flush.
async fn conn_writer<Req, Resp>(
    shared: Arc<ClientShared<Req, Resp>>,
    mut bw: ConnWriter,
    mut stop: watch::Receiver<bool>,
    mut conn_closed: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    Req: RequestWriter,
    Resp: ResponseReader + Default,
{
    let mut io_deadline = IoDeadline::new(shared.config.write_timeout);
    let mut next_nonce: u32 = 0;

    let flush_timer = time::sleep(frame::FLUSH_TIMER_IDLE);
    tokio::pin!(flush_timer);
    let mut flush_armed = false;

    loop {
        let mut wi = match shared.pending_requests.try_pop() {
            Some(wi) => wi,
            None => {
                select! {
                    wi = shared.pending_requests.pop() => wi,
                    _ = stop.changed() => return Ok(()),
                    _ = conn_closed.changed() => return Ok(()),
                    _ = flush_timer.as_mut(), if flush_armed => {
                        if let Err(e) = frame::frame_io(io_deadline.current(), &mut conn_closed, bw.flush()).await {
                            return Err(anyhow::Error::from(e)
                                .context("cannot flush requests data to the server"));
                        }
                        flush_armed = false;
                        continue;
                    }
                }
            }
        };

        let now = Instant::now();
        if now > wi.deadline {
            shared.done_error(wi, Error::Timeout);
            continue;
        }

        let nonce = if wi.is_nowait() { 0 } else { advance_nonce(&mut next_nonce) };
        let deadline = io_deadline.current();

        if let Err(e) =
            frame::frame_io(deadline, &mut conn_closed, frame::write_nonce(&mut bw, nonce)).await
        {
            let err = anyhow::Error::from(e).context("cannot send request ID to the server");
            return fail_item(&shared, wi, err);
        }
        if let Err(e) =
            frame::frame_io(deadline, &mut conn_closed, wi.req.write_request(&mut bw)).await
        {
            let err = e.context("cannot send request to the server");
            return fail_item(&shared, wi, err);
        }
        trace!("sent request frame, nonce {}", nonce);

        if wi.is_nowait() {
            wi.release();
        } else {
            let mut pending = shared.pending_responses.lock().unwrap();
            match pending.entry(nonce) {
                Entry::Occupied(_) => {
                    drop(pending);
                    error!("nonce collision in the pending-response map, id={}", nonce);
                    let err = Error::protocol(format!("request ID collision, id={}", nonce));
                    shared.done_error(wi, err.clone());
                    return Err(anyhow::Error::new(err));
                }
                Entry::Vacant(entry) => {
                    entry.insert(wi);
                }
            }
        }

        if !flush_armed && shared.pending_requests.is_empty() {
            let flush_at = match shared.config.max_batch_delay {
                Some(delay) => Instant::now() + delay,
                // no batching: the armed timer is already elapsed and fires on
                //  the next idle select, flushing after every frame
                None => Instant::now(),
            };
            flush_timer.as_mut().reset(flush_at);
            flush_armed = true;
        }
    }
}

fn fail_item<Req, Resp>(
    shared: &ClientShared<Req, Resp>,
    wi: ClientWorkItem<Req, Resp>,
    err: anyhow::Error,
) -> anyhow::Result<()>
where
    Req: RequestWriter,
    Resp: ResponseReader + Default,
{
    let err = Error::conn(err);
    shared.done_error(wi, err.clone());
    Err(anyhow::Error::new(err))
}

/// Assigns the next request-reply nonce, skipping zero on wraparound. The
///  writer is the only task that touches the counter.
fn advance_nonce(next_nonce: &mut u32) -> u32 {
    *next_nonce = next_nonce.wrapping_add(1);
    if *next_nonce == 0 {
        *next_nonce = 1;
    }
    *next_nonce
}

/// The connection reader: demultiplexes response frames back to their waiting
///  work items by nonce.
async fn conn_reader<Req, Resp>(
    shared: Arc<ClientShared<Req, Resp>>,
    mut br: ConnReader,
    mut conn_closed: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    Req: RequestWriter,
    Resp: ResponseReader + Default,
{
    // consumes payloads whose request is no longer tracked, e.g. when the
    //  reaper timed it out just before the response arrived
    let mut zero_resp = Resp::default();
    let mut io_deadline = IoDeadline::new(shared.config.read_timeout);

    loop {
        let deadline = io_deadline.current();

        let nonce = match frame::frame_io(deadline, &mut conn_closed, frame::read_nonce(&mut br)).await
        {
            Ok(Some(bytes)) => u32::from_le_bytes(bytes),
            Ok(None) => return Ok(()),
            Err(e) => {
                return Err(anyhow::Error::from(e).context("cannot read response ID"));
            }
        };

        let mut wi = shared.pending_responses.lock().unwrap().remove(&nonce);
        let target = match wi.as_mut() {
            Some(wi) => wi
                .resp
                .as_mut()
                .expect("BUG: pending-response map entry without a response"),
            None => {
                trace!("response for unknown nonce {}, discarding payload", nonce);
                &mut zero_resp
            }
        };

        if let Err(e) = frame::frame_io(deadline, &mut conn_closed, target.read_response(&mut br)).await
        {
            let err = e.context(format!("cannot read response with ID {}", nonce));
            return match wi {
                Some(wi) => fail_item(&shared, wi, err),
                None => Err(err),
            };
        }

        if let Some(wi) = wi {
            wi.complete_ok();
        }
    }
}

/// The reaper: periodically expires deadline-exceeded work in both the queue
///  and the pending-response map, with a self-tuning sleep - attentive while
///  timeouts are firing, near-free while idle.
async fn run_reaper<Req, Resp>(shared: Arc<ClientShared<Req, Resp>>, mut stop: watch::Receiver<bool>)
where
    Req: RequestWriter,
    Resp: ResponseReader + Default,
{
    let mut sleep_duration = REAPER_MIN_SLEEP;
    loop {
        select! {
            _ = stop.changed() => return,
            _ = time::sleep(sleep_duration) => {}
        }

        let fired = shared.sweep_stale_requests() | shared.sweep_stale_responses();
        sleep_duration = next_reaper_sleep(sleep_duration, fired);
    }
}

fn next_reaper_sleep(current: Duration, fired: bool) -> Duration {
    if fired {
        current.mul_f64(0.7).max(REAPER_MIN_SLEEP)
    } else {
        current.mul_f64(1.5).min(REAPER_MAX_SLEEP)
    }
}
