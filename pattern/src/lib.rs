//! Pattern engine: decides which classes and methods qualify for tracing and
//! tracks what has actually been instrumented so it can be precisely undone.

pub mod error;
pub mod pattern_set;
pub mod registry;

pub use error::{PatternError, Result};
pub use pattern_set::{PatternSet, BLACKLISTED_PREFIXES};
pub use registry::{
    count_removed, ClassIdentity, InstrumentationKey, KeyRegistry, LoaderId, PatternHistory,
};
