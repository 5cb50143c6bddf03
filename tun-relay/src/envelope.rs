//! UDP envelope codec
//!
//! Every datagram exchanged with the proxy's UDP endpoint is wrapped in one
//! self-contained envelope:
//!
//! ```text
//! +-----+-------------+-------------+-----+-------------+-------------+-------------+---------+
//! | TLEN| TARGET ADDR | TARGET PORT | SLEN| SOURCE ADDR | SOURCE PORT | PAYLOAD LEN | PAYLOAD |
//! +-----+-------------+-------------+-----+-------------+-------------+-------------+---------+
//! |  1  |   4 or 16   |   2 (BE)    |  1  |   4 or 16   |   2 (BE)    |   4 (BE)    |   var   |
//! +-----+-------------+-------------+-----+-------------+-------------+-------------+---------+
//! ```
//!
//! One envelope maps to exactly one datagram on the wire; there is no
//! further framing. Bytes following the declared payload are ignored.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::EnvelopeError;

/// Length tag for an IPv4 address body
pub const IPV4_LEN: u8 = 4;

/// Length tag for an IPv6 address body
pub const IPV6_LEN: u8 = 16;

/// Header size with two IPv4 endpoints
pub const MIN_HEADER_LEN: usize = 2 * (1 + 4 + 2) + 4;

/// Header size with two IPv6 endpoints
pub const MAX_HEADER_LEN: usize = 2 * (1 + 16 + 2) + 4;

/// A decoded (or to-be-encoded) envelope borrowing its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope<'a> {
    /// Remote endpoint the datagram is addressed to
    pub target: SocketAddr,
    /// Local endpoint the datagram originates from
    pub source: SocketAddr,
    pub payload: &'a [u8],
}

impl<'a> Envelope<'a> {
    pub const fn new(target: SocketAddr, source: SocketAddr, payload: &'a [u8]) -> Self {
        Self {
            target,
            source,
            payload,
        }
    }

    /// Size of the encoded form.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        endpoint_len(&self.target) + endpoint_len(&self.source) + 4 + self.payload.len()
    }

    /// Append the encoded envelope to `dst`, returning the number of bytes
    /// written.
    ///
    /// # Errors
    ///
    /// `InvalidAddress` when either endpoint is unspecified,
    /// `PayloadTooLarge` when the payload exceeds the 32-bit length field.
    pub fn encode_into<B: BufMut>(&self, dst: &mut B) -> Result<usize, EnvelopeError> {
        check_endpoint("target", &self.target)?;
        check_endpoint("source", &self.source)?;
        let payload_len = u32::try_from(self.payload.len()).map_err(|_| {
            EnvelopeError::PayloadTooLarge {
                len: self.payload.len(),
            }
        })?;

        put_endpoint(dst, &self.target);
        put_endpoint(dst, &self.source);
        dst.put_u32(payload_len);
        dst.put_slice(self.payload);
        Ok(self.encoded_len())
    }

    /// Encode into a freshly allocated buffer.
    pub fn to_bytes(&self) -> Result<Bytes, EnvelopeError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Parse an envelope from the front of `data`.
    ///
    /// # Errors
    ///
    /// `Truncated` when `data` ends before any declared field, `Malformed`
    /// when an address length tag is neither 4 nor 16.
    pub fn decode(data: &'a [u8]) -> Result<Self, EnvelopeError> {
        if data.len() < 2 {
            return Err(EnvelopeError::truncated(2, data.len()));
        }

        let mut cursor = Cursor { data, pos: 0 };
        let target = cursor.endpoint()?;
        let source = cursor.endpoint()?;
        let payload_len = u32::from_be_bytes(cursor.array::<4>()?) as usize;
        let payload = cursor.take(payload_len)?;

        Ok(Self {
            target,
            source,
            payload,
        })
    }
}

/// Encode `payload` sent from `source` towards `target`.
pub fn encode(target: SocketAddr, source: SocketAddr, payload: &[u8]) -> Result<Bytes, EnvelopeError> {
    Envelope::new(target, source, payload).to_bytes()
}

/// Decode one envelope from `data`.
pub fn decode(data: &[u8]) -> Result<Envelope<'_>, EnvelopeError> {
    Envelope::decode(data)
}

fn endpoint_len(addr: &SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(_) => 1 + 4 + 2,
        SocketAddr::V6(_) => 1 + 16 + 2,
    }
}

fn check_endpoint(which: &str, addr: &SocketAddr) -> Result<(), EnvelopeError> {
    if addr.ip().is_unspecified() {
        return Err(EnvelopeError::InvalidAddress(format!("{which} {addr}")));
    }
    Ok(())
}

fn put_endpoint<B: BufMut>(dst: &mut B, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(v4) => {
            dst.put_u8(IPV4_LEN);
            dst.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            dst.put_u8(IPV6_LEN);
            dst.put_slice(&v6.octets());
        }
    }
    dst.put_u16(addr.port());
}

/// Bounds-checked reader over the input slice.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], EnvelopeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| EnvelopeError::truncated(self.pos.saturating_add(n), self.data.len()))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], EnvelopeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn endpoint(&mut self) -> Result<SocketAddr, EnvelopeError> {
        let [len] = self.array::<1>()?;
        let ip = match len {
            IPV4_LEN => IpAddr::V4(Ipv4Addr::from(self.array::<4>()?)),
            IPV6_LEN => IpAddr::V6(Ipv6Addr::from(self.array::<16>()?)),
            other => {
                return Err(EnvelopeError::Malformed(format!(
                    "address length {other} at offset {}",
                    self.pos - 1
                )))
            }
        };
        let port = u16::from_be_bytes(self.array::<2>()?);
        Ok(SocketAddr::new(ip, port))
    }
}

#[cfg(test)]
mod proptest;
