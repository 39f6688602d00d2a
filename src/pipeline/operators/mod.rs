//! Built-in operators.
//!
//! | Operator | Type | Notes |
//! |----------|------|-------|
//! | `generate`, `from_events`, `channel_source` | void → events | sources |
//! | `from_bytes` | void → bytes | source |
//! | `where` | events → events | absorbs downstream filters |
//! | `head` | events → events | completes early |
//! | `read_lines` | bytes → events | parser |
//! | `discard` | events/bytes → void | sink |
//! | `channel_sink` | events → void | sink |
//! | `cache` | depends on mode | shared named caches |
//! | `parallel` | events → events/void | runs a sub-pipeline N times |
//! | `tcp_listen` | void → events | one sub-pipeline per connection |

mod cache;
mod filter;
mod head;
mod lines;
mod parallel;
pub(crate) mod sink;
mod source;
mod tcp_listen;

pub use cache::{Cache, CacheMode};
pub use filter::Where;
pub use head::Head;
pub use lines::ReadLines;
pub use parallel::{split_slice, Parallel};
pub use sink::{ChannelSink, Discard};
pub use source::{ChannelSource, FromBytes, FromEvents, Generate};
pub use tcp_listen::TcpListen;
