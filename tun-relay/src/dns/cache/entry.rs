//! Cached DNS answers

use std::time::Instant;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::Record;

/// A cached response together with its lifetime.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    message: Message,
    inserted_at: Instant,
    ttl: u32,
}

impl CacheEntry {
    pub fn new(message: Message, ttl: u32) -> Self {
        Self::new_at(message, ttl, Instant::now())
    }

    pub(crate) fn new_at(message: Message, ttl: u32, inserted_at: Instant) -> Self {
        Self {
            message,
            inserted_at,
            ttl,
        }
    }

    /// Build an entry from a response worth caching.
    ///
    /// Only complete, successful responses with at least one answer record
    /// qualify. The lifetime is the smallest answer TTL clamped to
    /// `[min_ttl, max_ttl]`.
    #[must_use]
    pub fn from_response(message: Message, min_ttl: u32, max_ttl: u32) -> Option<Self> {
        if message.message_type() != MessageType::Response
            || message.truncated()
            || message.response_code() != ResponseCode::NoError
        {
            return None;
        }
        let ttl = message.answers().iter().map(Record::ttl).min()?;
        Some(Self::new(message, ttl.clamp(min_ttl, max_ttl.max(min_ttl))))
    }

    /// Configured lifetime in seconds
    #[must_use]
    pub fn original_ttl(&self) -> u32 {
        self.ttl
    }

    /// Seconds left before expiry
    #[must_use]
    pub fn remaining_ttl(&self) -> u32 {
        let elapsed = u32::try_from(self.inserted_at.elapsed().as_secs()).unwrap_or(u32::MAX);
        self.ttl.saturating_sub(elapsed)
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.remaining_ttl() == 0
    }

    /// The cached response answering `query`: its ID and question section
    /// are the query's own, so a querier that varies the name's case gets
    /// it back unchanged. Every record's TTL is lowered to the time
    /// remaining.
    #[must_use]
    pub fn to_answer_message(&self, query: &Message) -> Message {
        let remaining = self.remaining_ttl();
        let adjust = |records: &[Record]| -> Vec<Record> {
            records
                .iter()
                .map(|r| {
                    let mut record = r.clone();
                    record.set_ttl(r.ttl().min(remaining));
                    record
                })
                .collect()
        };

        let source = &self.message;
        let mut message = Message::new();
        message.set_id(query.id());
        message.set_message_type(MessageType::Response);
        message.set_op_code(source.op_code());
        message.set_response_code(source.response_code());
        message.set_recursion_desired(source.recursion_desired());
        message.set_recursion_available(source.recursion_available());
        message.set_authentic_data(source.authentic_data());
        message.set_checking_disabled(source.checking_disabled());
        message.add_queries(query.queries().iter().cloned());
        message.add_answers(adjust(source.answers()));
        message.add_name_servers(adjust(source.name_servers()));
        message.add_additionals(adjust(source.additionals()));
        message
    }
}
