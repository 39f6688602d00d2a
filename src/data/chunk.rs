//! Byte chunks.

use bytes::Bytes;
use std::fmt;

/// An immutable, reference-counted contiguous byte buffer.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Chunk {
    data: Bytes,
}

impl Chunk {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
        }
    }

    pub fn from_static(data: &'static [u8]) -> Self {
        Self {
            data: Bytes::from_static(data),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    /// Split into the first `n` bytes and the rest without copying.
    pub fn split_at(&self, n: usize) -> (Chunk, Chunk) {
        let n = n.min(self.data.len());
        (
            Chunk::new(self.data.slice(..n)),
            Chunk::new(self.data.slice(n..)),
        )
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(data: Vec<u8>) -> Self {
        Chunk::new(Bytes::from(data))
    }
}

impl From<&'static str> for Chunk {
    fn from(data: &'static str) -> Self {
        Chunk::from_static(data.as_bytes())
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chunk({} bytes)", self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_at() {
        let chunk = Chunk::from("hello world");
        let (lhs, rhs) = chunk.split_at(5);
        assert_eq!(lhs.as_bytes(), b"hello");
        assert_eq!(rhs.as_bytes(), b" world");
    }

    #[test]
    fn test_split_past_end() {
        let chunk = Chunk::from("abc");
        let (lhs, rhs) = chunk.split_at(10);
        assert_eq!(lhs.len(), 3);
        assert!(rhs.is_empty());
    }
}
