//! DNS short-circuit support for the UDP relay
//!
//! UDP flows addressed to port 53 consult a [`DnsCache`] before anything is
//! dialed. A hit is answered straight back to the application; a miss is
//! relayed as usual and the proxy's reply is offered to the cache.

pub mod cache;

use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};

pub use cache::{CacheStats, CacheStatsSnapshot, DnsAnswerCache};

/// Well-known DNS port
pub const DNS_PORT: u16 = 53;

/// Whether a datagram's peer port is the DNS port
#[inline]
#[must_use]
pub fn is_dns_port(port: u16) -> bool {
    port == DNS_PORT
}

/// A cached answer ready to be sent back for a specific query.
#[derive(Debug, Clone)]
pub struct DnsAnswer {
    message: Message,
}

impl DnsAnswer {
    pub fn new(message: Message) -> Self {
        Self { message }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Wire form of the answer in a fresh allocation.
    pub fn pack(&self) -> Option<Vec<u8>> {
        self.message.to_vec().ok()
    }

    /// Encode into `buf`, replacing its contents and reusing its capacity.
    /// Returns the encoded length, or `None` if the message cannot be
    /// encoded.
    pub fn pack_into(&self, buf: &mut Vec<u8>) -> Option<usize> {
        buf.clear();
        let mut encoder = BinEncoder::new(buf);
        self.message.emit(&mut encoder).ok()?;
        drop(encoder);
        Some(buf.len())
    }
}

/// Answer cache consulted by the UDP relay.
pub trait DnsCache: Send + Sync {
    /// Look up an answer for a raw query message.
    fn query(&self, raw_query: &[u8]) -> Option<DnsAnswer>;

    /// Offer a raw response message for caching. Unsuitable responses are
    /// ignored.
    fn store(&self, raw_response: &[u8]);
}
