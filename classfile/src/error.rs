use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClassFileError {
    #[error("unexpected end of class data")]
    UnexpectedEof,

    #[error("invalid magic: {0:#x}")]
    InvalidMagic(u32),

    #[error("invalid constant pool index: {0}")]
    BadPoolIndex(u16),

    #[error("invalid constant pool tag: {0}")]
    BadPoolTag(u8),

    #[error("constant pool entry {0} is not valid UTF-8")]
    MalformedUtf8(u16),

    #[error("malformed attribute: {0}")]
    MalformedAttribute(String),

    #[error("malformed descriptor: {0}")]
    BadDescriptor(String),

    #[error("constant pool exhausted (65535 entries)")]
    PoolOverflow,
}
