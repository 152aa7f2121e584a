use std::time::Duration;
use anyhow::bail;

/// Default number of pending requests a single client may queue before the
///  server responds to them.
pub const DEFAULT_MAX_PENDING_REQUESTS: usize = 1000;

/// Default cap on concurrent handler invocations per server.
pub const DEFAULT_CONCURRENCY: usize = 10_000;

/// Default time budget for the optional connection handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Client-side tuning knobs.
///
/// The defaults favour low latency: no write batching, unlimited I/O timeouts,
///  64 KiB stream buffers.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Cap on requests admitted but not yet responded to. Admission beyond the
    ///  cap fails with an overflow error (but see `prioritize_new_requests`).
    pub max_pending_requests: usize,

    /// How long the writer may sit on buffered frames before flushing them to
    ///  the socket. `None` flushes after every frame.
    ///
    /// Batching trades per-request latency for fewer syscalls and flushes,
    ///  which matters when many small requests share the connection.
    pub max_batch_delay: Option<Duration>,

    /// Maximum duration for reading a full response. Also bounds the lifetime
    ///  of an idle connection. `None` means unlimited.
    pub read_timeout: Option<Duration>,

    /// Maximum duration for writing a full request. `None` means unlimited.
    pub write_timeout: Option<Duration>,

    pub read_buffer_size: usize,
    pub write_buffer_size: usize,

    /// Overflow policy for a full pending-request queue: `false` rejects the
    ///  new request, `true` evicts the oldest queued request instead and
    ///  completes it with an overflow error.
    pub prioritize_new_requests: bool,

    /// Time budget for the optional connection handshake.
    pub handshake_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            max_pending_requests: DEFAULT_MAX_PENDING_REQUESTS,
            max_batch_delay: None,
            read_timeout: None,
            write_timeout: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            prioritize_new_requests: false,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_pending_requests == 0 {
            bail!("max_pending_requests must be positive");
        }
        if self.read_buffer_size == 0 || self.write_buffer_size == 0 {
            bail!("stream buffer sizes must be positive");
        }
        if self.handshake_timeout.is_zero() {
            bail!("handshake_timeout must be positive");
        }
        Ok(())
    }
}

/// Server-side tuning knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Cap on concurrent handler invocations. In pipelined mode this caps live
    ///  connections instead, since each connection handles requests serially.
    pub concurrency: usize,

    /// How long the writer may sit on buffered response frames before flushing
    ///  them. `None` flushes after every frame.
    pub max_batch_delay: Option<Duration>,

    /// Maximum duration for reading a full request. Also bounds the lifetime
    ///  of an idle connection. `None` means unlimited.
    pub read_timeout: Option<Duration>,

    /// Maximum duration for writing a full response. `None` means unlimited.
    pub write_timeout: Option<Duration>,

    pub read_buffer_size: usize,
    pub write_buffer_size: usize,

    /// Process each connection's requests serially on its reader task instead
    ///  of spawning a task per request. Maximum throughput when the handler
    ///  never blocks, and requests from one client are seen in order.
    pub pipeline_requests: bool,

    /// Time budget for the optional connection handshake.
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            concurrency: DEFAULT_CONCURRENCY,
            max_batch_delay: None,
            read_timeout: None,
            write_timeout: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            pipeline_requests: false,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.concurrency == 0 {
            bail!("concurrency must be positive");
        }
        if self.read_buffer_size == 0 || self.write_buffer_size == 0 {
            bail!("stream buffer sizes must be positive");
        }
        if self.handshake_timeout.is_zero() {
            bail!("handshake_timeout must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.max_pending_requests, 1000);
        assert_eq!(config.max_batch_delay, None);
        assert_eq!(config.read_buffer_size, 64 * 1024);
        assert!(!config.prioritize_new_requests);
        config.validate().unwrap();
    }

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.concurrency, 10_000);
        assert!(!config.pipeline_requests);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_caps() {
        let config = ClientConfig {
            max_pending_requests: 0,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            concurrency: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
