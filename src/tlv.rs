//! A minimal type-length-value payload codec.
//!
//! Requests carry a one-byte opcode and an opaque value, responses just a
//!  value:
//!
//! ```ascii
//! request  = value length (u32 LE) || opcode (u8) || value bytes
//! response = value length (u32 LE) || value bytes
//! ```
//!
//! Values are backed by `BytesMut` and reused across requests; the length
//!  prefix is capped so a corrupted or hostile peer cannot make the reader
//!  allocate unbounded memory.

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use crate::client::{RequestWriter, ResponseReader};
use crate::conn::{ConnInfo, ConnReader, ConnWriter};
use crate::server::HandlerCtx;

/// Upper bound on a single value's length on the wire.
pub const MAX_VALUE_SIZE: usize = 16 * 1024 * 1024;

async fn write_value(bw: &mut ConnWriter, value: &[u8]) -> anyhow::Result<()> {
    let len = u32::try_from(value.len()).context("value exceeds the wire format's length range")?;
    bw.write_u32_le(len).await?;
    bw.write_all(value).await?;
    Ok(())
}

async fn read_value(br: &mut ConnReader, value: &mut BytesMut) -> anyhow::Result<()> {
    let len = br.read_u32_le().await? as usize;
    if len > MAX_VALUE_SIZE {
        bail!("value length {} exceeds the maximum of {}", len, MAX_VALUE_SIZE);
    }
    value.resize(len, 0);
    br.read_exact(&mut value[..]).await?;
    Ok(())
}

/// A TLV request: an opcode selecting the operation and an opaque value.
#[derive(Debug, Default)]
pub struct Request {
    opcode: u8,
    value: BytesMut,
}

impl Request {
    pub fn set_opcode(&mut self, opcode: u8) {
        self.opcode = opcode;
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn set_value(&mut self, value: &[u8]) {
        self.value.clear();
        self.value.extend_from_slice(value);
    }

    pub fn append(&mut self, p: &[u8]) {
        self.value.extend_from_slice(p);
    }

    /// Swaps the backing buffer, avoiding a copy when the caller already owns
    ///  the bytes.
    pub fn swap_value(&mut self, value: BytesMut) -> BytesMut {
        std::mem::replace(&mut self.value, value)
    }

    pub fn clear(&mut self) {
        self.opcode = 0;
        self.value.clear();
    }

    /// Server-side read of one request off the wire.
    pub async fn read_request(&mut self, br: &mut ConnReader) -> anyhow::Result<()> {
        let result: anyhow::Result<()> = async {
            let len = br.read_u32_le().await? as usize;
            if len > MAX_VALUE_SIZE {
                bail!("value length {} exceeds the maximum of {}", len, MAX_VALUE_SIZE);
            }
            self.opcode = br.read_u8().await?;
            self.value.resize(len, 0);
            br.read_exact(&mut self.value[..]).await?;
            Ok(())
        }
        .await;
        result.context("cannot read request value")
    }
}

#[async_trait]
impl RequestWriter for Request {
    async fn write_request(&mut self, bw: &mut ConnWriter) -> anyhow::Result<()> {
        let result: anyhow::Result<()> = async {
            let len = u32::try_from(self.value.len())
                .context("value exceeds the wire format's length range")?;
            bw.write_u32_le(len).await?;
            bw.write_u8(self.opcode).await?;
            bw.write_all(&self.value).await?;
            Ok(())
        }
        .await;
        result.context("cannot write request value")
    }
}

/// A TLV response: an opaque value.
#[derive(Debug, Default)]
pub struct Response {
    value: BytesMut,
}

impl Response {
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn set_value(&mut self, value: &[u8]) {
        self.value.clear();
        self.value.extend_from_slice(value);
    }

    pub fn append(&mut self, p: &[u8]) {
        self.value.extend_from_slice(p);
    }

    pub fn swap_value(&mut self, value: BytesMut) -> BytesMut {
        std::mem::replace(&mut self.value, value)
    }

    pub fn clear(&mut self) {
        self.value.clear();
    }

    /// Server-side write of one response onto the wire.
    pub async fn write_response(&mut self, bw: &mut ConnWriter) -> anyhow::Result<()> {
        write_value(bw, &self.value)
            .await
            .context("cannot write response value")
    }
}

#[async_trait]
impl ResponseReader for Response {
    async fn read_response(&mut self, br: &mut ConnReader) -> anyhow::Result<()> {
        read_value(br, &mut self.value)
            .await
            .context("cannot read response value")
    }
}

/// Server-side handler context for the TLV codec: the decoded [`Request`] and
///  the [`Response`] under construction.
#[derive(Debug, Default)]
pub struct RequestCtx {
    pub request: Request,
    pub response: Response,
    conn: ConnInfo,
}

impl RequestCtx {
    /// Addresses of the connection the request arrived on.
    pub fn conn_info(&self) -> &ConnInfo {
        &self.conn
    }
}

#[async_trait]
impl HandlerCtx for RequestCtx {
    fn init(&mut self, conn: &ConnInfo) {
        self.request.clear();
        self.response.clear();
        self.conn = conn.clone();
    }

    async fn read_request(&mut self, br: &mut ConnReader) -> anyhow::Result<()> {
        self.request.read_request(br).await
    }

    async fn write_response(&mut self, bw: &mut ConnWriter) -> anyhow::Result<()> {
        self.response.write_response(bw).await
    }

    fn concurrency_limit_error(&mut self, concurrency: usize) {
        self.response.clear();
        self.response
            .append(format!("concurrency limit exceeded: {}", concurrency).as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tokio::io::{BufReader, BufWriter};
    use super::*;
    use crate::conn::BoxConn;

    fn codec_pair() -> (ConnReader, ConnWriter) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (read_half, _) = tokio::io::split(Box::new(a) as BoxConn);
        let (_, write_half) = tokio::io::split(Box::new(b) as BoxConn);
        (BufReader::new(read_half), BufWriter::new(write_half))
    }

    #[rstest]
    #[case(0, b"".as_slice())]
    #[case(7, b"foobar".as_slice())]
    #[case(255, &[0u8; 1000])]
    #[tokio::test]
    async fn test_request_roundtrip(#[case] opcode: u8, #[case] value: &'static [u8]) {
        let (mut br, mut bw) = codec_pair();

        let mut sent = Request::default();
        sent.set_opcode(opcode);
        sent.set_value(value);
        sent.write_request(&mut bw).await.unwrap();
        bw.flush().await.unwrap();

        let mut received = Request::default();
        received.read_request(&mut br).await.unwrap();
        assert_eq!(received.opcode(), opcode);
        assert_eq!(received.value(), value);
    }

    #[tokio::test]
    async fn test_response_roundtrip() {
        let (mut br, mut bw) = codec_pair();

        let mut sent = Response::default();
        sent.set_value(b"payload");
        sent.write_response(&mut bw).await.unwrap();
        bw.flush().await.unwrap();

        let mut received = Response::default();
        received.read_response(&mut br).await.unwrap();
        assert_eq!(received.value(), b"payload");
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_is_rejected() {
        let (mut br, mut bw) = codec_pair();

        bw.write_u32_le((MAX_VALUE_SIZE + 1) as u32).await.unwrap();
        bw.flush().await.unwrap();

        let mut received = Response::default();
        let err = received.read_response(&mut br).await.err().unwrap();
        assert!(err.to_string().contains("cannot read response value"));
    }

    #[tokio::test]
    async fn test_ctx_init_resets_state() {
        let mut ctx = RequestCtx::default();
        ctx.request.set_opcode(9);
        ctx.request.set_value(b"old");
        ctx.response.set_value(b"old");

        ctx.init(&ConnInfo::default());
        assert_eq!(ctx.request.opcode(), 0);
        assert!(ctx.request.value().is_empty());
        assert!(ctx.response.value().is_empty());
    }

    #[test]
    fn test_concurrency_limit_error_message() {
        let mut ctx = RequestCtx::default();
        ctx.concurrency_limit_error(10);
        assert_eq!(ctx.response.value(), b"concurrency limit exceeded: 10");
    }
}
