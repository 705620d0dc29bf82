//! Message headers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies one specific offer. Id 0 is reserved as the invalid header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct MessageHeader(u64);

impl MessageHeader {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn id(&self) -> u64 {
        self.0
    }

    pub const fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for MessageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic header issuer for a source. Never hands out the invalid id.
#[derive(Debug)]
pub struct HeaderSequence {
    next: AtomicU64,
}

impl HeaderSequence {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_header(&self) -> MessageHeader {
        MessageHeader(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for HeaderSequence {
    fn default() -> Self {
        Self::new()
    }
}
