//! JVM `.class` parsing and writing for in-place method rewriting.
//!
//! The parser is deliberately shallow: the constant pool, class/method
//! skeleton and `Code` attributes are structural because the transformer has
//! to read and regenerate them; every other attribute round-trips as opaque
//! bytes so rewriting can never corrupt metadata it does not understand.

pub mod class;
pub mod descriptor;
pub mod error;
pub mod pool;
mod reader;
mod writer;

pub use class::{
    ClassFile, CodeAttribute, ExceptionTableEntry, FieldInfo, LocalVariableEntry, MethodAttribute,
    MethodInfo, RawAttribute,
};
pub use descriptor::{FieldType, MethodDescriptor};
pub use error::ClassFileError;
pub use pool::{ConstantPool, CpInfo};
pub use writer::ByteWriter;

/// Class access and property flags (JVMS table 4.1-B / 4.6-A).
pub mod access {
    pub const ACC_PUBLIC: u16 = 0x0001;
    pub const ACC_PRIVATE: u16 = 0x0002;
    pub const ACC_PROTECTED: u16 = 0x0004;
    pub const ACC_STATIC: u16 = 0x0008;
    pub const ACC_FINAL: u16 = 0x0010;
    pub const ACC_SYNCHRONIZED: u16 = 0x0020;
    /// Same bit as `ACC_SYNCHRONIZED`; meaningful only on classes.
    pub const ACC_SUPER: u16 = 0x0020;
    pub const ACC_NATIVE: u16 = 0x0100;
    pub const ACC_INTERFACE: u16 = 0x0200;
    pub const ACC_ABSTRACT: u16 = 0x0400;
    pub const ACC_SYNTHETIC: u16 = 0x1000;
}
