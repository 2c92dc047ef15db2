//! Call and connection identifiers.
//!
//! Call ids are allocated per Call Engine and connection ids per Router.
//! Both counters only ever move forward, so a stale reply or a stale
//! session handle can never alias a newer one.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::envelope::CallId;

/// Strictly increasing call id source.
#[derive(Debug)]
pub struct CallIdAllocator {
    next: AtomicI64,
}

impl CallIdAllocator {
    /// Start allocating from 1.
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(1),
        }
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> CallId {
        CallId::Number(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Ids handed out so far.
    pub fn allocated(&self) -> i64 {
        self.next.load(Ordering::Relaxed) - 1
    }
}

impl Default for CallIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-local identifier of one routed channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

/// Strictly increasing connection id source.
#[derive(Debug)]
pub struct ConnectionIdAllocator {
    next: AtomicU64,
}

impl ConnectionIdAllocator {
    /// Start allocating from 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
