//! Cache key derived from the question section

use std::hash::{Hash, Hasher};

use hickory_proto::op::Message;

/// `(qname, qtype, qclass)` of the first question.
///
/// The name is lowercased and stripped of its trailing dot, so
/// `Example.COM.` and `example.com` share one entry.
#[derive(Debug, Clone)]
pub struct CacheKey {
    qname: String,
    qtype: u16,
    qclass: u16,
}

impl CacheKey {
    pub fn new(qname: impl Into<String>, qtype: u16, qclass: u16) -> Self {
        Self {
            qname: Self::normalize_domain(&qname.into()),
            qtype,
            qclass,
        }
    }

    /// Key for the first question of `message`, if it has one.
    #[must_use]
    pub fn from_message(message: &Message) -> Option<Self> {
        let q = message.queries().first()?;
        Some(Self::new(
            q.name().to_string(),
            q.query_type().into(),
            u16::from(q.query_class()),
        ))
    }

    #[must_use]
    pub fn qname(&self) -> &str {
        &self.qname
    }

    #[must_use]
    pub fn qtype(&self) -> u16 {
        self.qtype
    }

    #[must_use]
    pub fn qclass(&self) -> u16 {
        self.qclass
    }

    #[must_use]
    pub fn normalize_domain(domain: &str) -> String {
        let domain = domain.to_lowercase();
        match domain.strip_suffix('.') {
            Some(stripped) if !stripped.is_empty() => stripped.to_string(),
            _ => domain,
        }
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.qtype == other.qtype && self.qclass == other.qclass && self.qname == other.qname
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.qname.hash(state);
        self.qtype.hash(state);
        self.qclass.hash(state);
    }
}
