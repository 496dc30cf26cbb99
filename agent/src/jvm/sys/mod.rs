//! Raw FFI declarations for the JNI and JVMTI interface tables.

pub mod jni;
pub mod jvmti;
