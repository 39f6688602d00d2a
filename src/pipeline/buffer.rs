//! Inbound and outbound buffers of an execution node.
//!
//! The inbound buffer is shared between the node's event loop, which
//! appends pushed batches, and the input generator handed to the operator,
//! which pops from it. Both run on the node's own task, so the mutex is
//! never contended; it only makes the sharing expressible.

use crate::error::Result;
use crate::pipeline::element::{split, total_size, Element};
use crate::pipeline::generator::{Generator, Step};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub(crate) struct Inbound<T> {
    queue: VecDeque<T>,
    size: u64,
    upstream_open: bool,
    consumed: u64,
}

impl<T: Element> Inbound<T> {
    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn upstream_open(&self) -> bool {
        self.upstream_open
    }

    pub(crate) fn close_upstream(&mut self) {
        self.upstream_open = false;
    }

    /// Units handed to the operator so far.
    pub(crate) fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Append units, dropping stubs.
    pub(crate) fn append(&mut self, units: Vec<T>) {
        for unit in units {
            let size = unit.size();
            if size > 0 {
                self.size += size;
                self.queue.push_back(unit);
            }
        }
    }

    fn pop(&mut self) -> Option<T> {
        let unit = self.queue.pop_front()?;
        self.size -= unit.size();
        self.consumed += 1;
        Some(unit)
    }
}

pub(crate) struct SharedInbound<T> {
    inner: Arc<Mutex<Inbound<T>>>,
}

impl<T> Clone for SharedInbound<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Element> SharedInbound<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inbound {
                queue: VecDeque::new(),
                size: 0,
                upstream_open: true,
                consumed: 0,
            })),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inbound<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The generator the operator reads its input from.
    pub(crate) fn reader(&self) -> InputReader<T> {
        InputReader {
            inbound: self.clone(),
        }
    }
}

/// Input generator: yields buffered units in arrival order, is pending
/// while the buffer is empty but upstream may still deliver, and is done
/// once upstream finished and the buffer drained.
pub(crate) struct InputReader<T> {
    inbound: SharedInbound<T>,
}

impl<T: Element> Generator for InputReader<T> {
    type Item = T;

    fn next(&mut self) -> Result<Step<T>> {
        let mut inbound = self.inbound.lock();
        Ok(match inbound.pop() {
            Some(unit) => Step::Item(unit),
            None if inbound.upstream_open => Step::Pending,
            None => Step::Done,
        })
    }
}

/// Output waiting for downstream demand.
pub(crate) struct Outbound<T> {
    queue: Vec<T>,
    size: u64,
}

impl<T: Element> Outbound<T> {
    pub(crate) fn new() -> Self {
        Self {
            queue: Vec::new(),
            size: 0,
        }
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn push(&mut self, unit: T) {
        self.size += unit.size();
        self.queue.push(unit);
    }

    /// Remove at most `batch_size` worth of units from the front, splitting
    /// the unit that straddles the boundary.
    pub(crate) fn take(&mut self, batch_size: u64) -> Vec<T> {
        let (batch, rest) = split(std::mem::take(&mut self.queue), batch_size);
        self.queue = rest;
        self.size -= total_size(&batch);
        batch
    }
}
