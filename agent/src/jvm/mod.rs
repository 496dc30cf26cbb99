//! Everything that talks to the VM: raw interface tables, wrappers, the
//! probe class, and the JVMTI-backed class host.

pub mod env;
pub mod host;
pub mod probe;
pub mod sys;
