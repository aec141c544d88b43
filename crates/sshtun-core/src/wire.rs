//! SSH structured payloads carried by global requests and channel opens.
//!
//! Encoding follows RFC 4251: `string` is a 4-byte big-endian length followed
//! by the bytes, `uint32` is 4 bytes big-endian. Decoding is strict: short
//! buffers, trailing bytes and non-UTF-8 strings are all rejected.

use crate::error::{TunnelError, TunnelResult};

/// A record with a fixed SSH wire layout.
pub trait WireMessage: Sized {
    fn encode(&self) -> Vec<u8>;
    fn decode(buf: &[u8]) -> TunnelResult<Self>;
}

/// Payload of a `tcpip-forward` / `cancel-tcpip-forward` global request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub bind_ip: String,
    pub bind_port: u32,
}

/// Payload of a successful `tcpip-forward` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardResponse {
    pub bound_port: u32,
}

/// Extra data of `direct-tcpip` and `forwarded-tcpip` channel opens.
///
/// For `direct-tcpip` the forward fields name the target to dial; for
/// `forwarded-tcpip` they name the route that accepted the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginInfo {
    pub forward_ip: String,
    pub forward_port: u32,
    pub origin_ip: String,
    pub origin_port: u32,
}

/// Payload of a successful `session-token` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenResponse {
    pub token: String,
}

impl WireMessage for ForwardRequest {
    fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.string(&self.bind_ip);
        w.u32(self.bind_port);
        w.finish()
    }

    fn decode(buf: &[u8]) -> TunnelResult<Self> {
        let mut r = Reader::new(buf);
        let msg = Self {
            bind_ip: r.string()?,
            bind_port: r.u32()?,
        };
        r.finish()?;
        Ok(msg)
    }
}

impl WireMessage for ForwardResponse {
    fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u32(self.bound_port);
        w.finish()
    }

    fn decode(buf: &[u8]) -> TunnelResult<Self> {
        let mut r = Reader::new(buf);
        let msg = Self {
            bound_port: r.u32()?,
        };
        r.finish()?;
        Ok(msg)
    }
}

impl WireMessage for OriginInfo {
    fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.string(&self.forward_ip);
        w.u32(self.forward_port);
        w.string(&self.origin_ip);
        w.u32(self.origin_port);
        w.finish()
    }

    fn decode(buf: &[u8]) -> TunnelResult<Self> {
        let mut r = Reader::new(buf);
        let msg = Self {
            forward_ip: r.string()?,
            forward_port: r.u32()?,
            origin_ip: r.string()?,
            origin_port: r.u32()?,
        };
        r.finish()?;
        Ok(msg)
    }
}

impl WireMessage for TokenResponse {
    fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.string(&self.token);
        w.finish()
    }

    fn decode(buf: &[u8]) -> TunnelResult<Self> {
        let mut r = Reader::new(buf);
        let msg = Self { token: r.string()? };
        r.finish()?;
        Ok(msg)
    }
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn string(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> TunnelResult<&'a [u8]> {
        if self.buf.len() < n {
            return Err(TunnelError::MalformedRequest(format!(
                "truncated payload: need {n} bytes, have {}",
                self.buf.len()
            )));
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn u32(&mut self) -> TunnelResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn string(&mut self) -> TunnelResult<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| TunnelError::MalformedRequest("string field is not UTF-8".into()))
    }

    fn finish(self) -> TunnelResult<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(TunnelError::MalformedRequest(format!(
                "{} trailing bytes",
                self.buf.len()
            )))
        }
    }
}
