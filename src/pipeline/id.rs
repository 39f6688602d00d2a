//! Identity types for execution nodes and cache participants.
//!
//! IDs are newtypes over integers handed out by process-wide counters, so
//! they stay unique across independently started pipelines.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

static NEXT_NODE_ID: AtomicU32 = AtomicU32::new(0);
static NEXT_WRITER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_READER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one execution node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Allocate a fresh node id.
    pub fn next() -> Self {
        NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Identity of a cache writer. Zero is never handed out.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct WriterId(pub u64);

impl WriterId {
    pub fn next() -> Self {
        WriterId(NEXT_WRITER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "writer#{}", self.0)
    }
}

/// Identity of a cache reader; each reader has its own offset.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ReaderId(pub u64);

impl ReaderId {
    pub fn next() -> Self {
        ReaderId(NEXT_READER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(NodeId(42).to_string(), "node#42");
        assert_eq!(WriterId(7).to_string(), "writer#7");
    }

    #[test]
    fn test_ids_are_unique() {
        let a = NodeId::next();
        let b = NodeId::next();
        assert_ne!(a, b);
        assert_ne!(WriterId::next(), WriterId::next());
        assert_ne!(ReaderId::next(), ReaderId::next());
    }
}
