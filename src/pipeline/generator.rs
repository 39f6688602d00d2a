//! Lazy, resumable, single-consumer sequences.
//!
//! A [`Generator`] is the unit of computation an operator hands to its
//! execution node. The node advances it one step at a time; each step
//! yields a value, reports that nothing is ready yet, or reports that the
//! sequence is exhausted. Generators are move-only and never restart.
//!
//! # Design
//!
//! The three-way [`Step`] lets an operator suspend cooperatively without
//! blocking a thread: returning [`Step::Pending`] hands control back to the
//! node's event loop, which re-runs the generator when new input arrives,
//! when the operator wakes it, or after a backoff delay.

use crate::error::Result;

/// Outcome of advancing a generator by one step.
#[derive(Debug, Clone, PartialEq)]
pub enum Step<T> {
    /// A value was produced.
    Item(T),
    /// Nothing is ready yet; try again later.
    Pending,
    /// The sequence is exhausted.
    Done,
}

impl<T> Step<T> {
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Step<U> {
        match self {
            Step::Item(item) => Step::Item(f(item)),
            Step::Pending => Step::Pending,
            Step::Done => Step::Done,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Step::Done)
    }
}

/// A lazily produced, possibly infinite sequence.
///
/// Once `next` returned [`Step::Done`] or an error, callers must not advance
/// the generator again.
pub trait Generator: Send {
    type Item;

    fn next(&mut self) -> Result<Step<Self::Item>>;
}

/// Type-erased generator, as exchanged between operators and nodes.
pub type BoxGenerator<T> = Box<dyn Generator<Item = T>>;

impl<G: Generator + ?Sized> Generator for Box<G> {
    type Item = G::Item;

    fn next(&mut self) -> Result<Step<Self::Item>> {
        (**self).next()
    }
}

/// Generator driven by a closure.
pub struct FromFn<F> {
    f: F,
}

/// Build a generator from a step function.
pub fn from_fn<T, F>(f: F) -> FromFn<F>
where
    F: FnMut() -> Result<Step<T>> + Send,
{
    FromFn { f }
}

impl<T, F> Generator for FromFn<F>
where
    F: FnMut() -> Result<Step<T>> + Send,
{
    type Item = T;

    fn next(&mut self) -> Result<Step<T>> {
        (self.f)()
    }
}

/// Generator over an iterator; never pending.
pub struct FromIter<I> {
    iter: I,
}

pub fn from_iter<I>(iter: I) -> FromIter<I::IntoIter>
where
    I: IntoIterator,
    I::IntoIter: Send,
{
    FromIter {
        iter: iter.into_iter(),
    }
}

impl<I> Generator for FromIter<I>
where
    I: Iterator + Send,
{
    type Item = I::Item;

    fn next(&mut self) -> Result<Step<I::Item>> {
        Ok(match self.iter.next() {
            Some(item) => Step::Item(item),
            None => Step::Done,
        })
    }
}

/// Generator that is exhausted immediately.
pub fn empty<T: Send>() -> FromIter<std::iter::Empty<T>> {
    from_iter(std::iter::empty())
}

/// Combinators available on every generator.
pub trait GeneratorExt: Generator + Sized {
    /// Transform each produced item.
    fn map_items<U, F>(self, f: F) -> MapItems<Self, F>
    where
        F: FnMut(Self::Item) -> Result<U> + Send,
    {
        MapItems { inner: self, f }
    }

    fn boxed(self) -> BoxGenerator<Self::Item>
    where
        Self: 'static,
    {
        Box::new(self)
    }
}

impl<G: Generator> GeneratorExt for G {}

pub struct MapItems<G, F> {
    inner: G,
    f: F,
}

impl<G, U, F> Generator for MapItems<G, F>
where
    G: Generator,
    F: FnMut(G::Item) -> Result<U> + Send,
{
    type Item = U;

    fn next(&mut self) -> Result<Step<U>> {
        Ok(match self.inner.next()? {
            Step::Item(item) => Step::Item((self.f)(item)?),
            Step::Pending => Step::Pending,
            Step::Done => Step::Done,
        })
    }
}
