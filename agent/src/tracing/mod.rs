//! Trace line production: depth tracking, value rendering, line formatting
//! and delivery.
//!
//! - `value`: the closed tagged representation of Java values
//! - `runtime`: per-thread depth and entry/exit line formatting
//! - `sink`: where finished lines go (channel to the bridge, or nothing)
//! - `thread`: platform thread id retrieval

pub mod runtime;
pub mod sink;
pub mod thread;
pub mod value;

pub use runtime::TraceRuntime;
pub use sink::{ChannelSink, MessageSink};
pub use value::Value;
