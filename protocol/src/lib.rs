//! Common types shared between the metracer CLI and the in-process agent.

pub mod counters;
pub mod event;
pub mod patterns_file;
pub mod protocol;

pub use counters::*;
pub use event::*;
pub use patterns_file::*;
pub use protocol::*;
