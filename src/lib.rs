//! A pipelined RPC transport that multiplexes many small requests over a single
//!  durable connection.
//!
//! ## Design goals
//!
//! * One connection per client/server pair, kept open indefinitely and re-dialed
//!   on failure - designed for links where connection setup is expensive
//!   (high latency, handshakes, compression dictionaries)
//! * Requests are pipelined: the client keeps writing requests without waiting
//!   for responses, and responses may come back in any order
//! * Writes are batched: a configurable flush delay amortises syscall and flush
//!   cost over many small frames
//! * The payload encoding is pluggable. The transport frames payloads but never
//!   inspects them - see [`client::RequestWriter`], [`client::ResponseReader`]
//!   and [`server::HandlerCtx`]. A simple type-length-value codec is provided
//!   in [`tlv`]
//! * Backpressure everywhere: the client's pending-request queue, the server's
//!   pending-response channel and the server's handler concurrency gate are all
//!   bounded
//! * Work items, handler contexts and payload buffers are recycled, keeping the
//!   steady-state request path allocation-free
//!
//! ## Wire format
//!
//! Each frame on the wire, in both directions:
//!
//! ```ascii
//! 0..3 : nonce (u32, little endian)
//! 4..  : payload bytes, length and content defined entirely by the codec
//! ```
//!
//! The nonce correlates a response to its request; the peer echoes it verbatim.
//! Nonce zero on a request marks it fire-and-forget: the server processes it
//! but never emits a response, and the client does not wait for one. Nonce zero
//! never appears on a response.
//!
//! A response for a nonce the client no longer tracks (e.g. the request timed
//! out moments earlier) is read and discarded to keep the framing intact.
//!
//! ## Errors
//!
//! Request completions carry an [`error::Error`]: a timeout, a pending-queue
//! overflow, or a transport error. Transport errors tear the connection down;
//! the client then completes everything in flight and re-dials. Timeouts and
//! overflows are per-request and leave the connection alone.

pub mod client;
pub mod config;
pub mod conn;
pub mod error;
mod frame;
pub mod mem;
pub mod pool;
mod queue;
pub mod server;
pub mod tlv;
