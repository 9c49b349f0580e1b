use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("message too short: {0} bytes")]
    MessageTooShort(usize),
    #[error("not a stun message")]
    NotStun,
    #[error("message length {declared} does not match {actual} remaining bytes")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("attribute 0x{ty:04x} length {len} overruns message")]
    AttributeOverrun { ty: u16, len: usize },
    #[error("attribute 0x{ty:04x} has {actual} byte body, expected {expected}")]
    AttributeLength {
        ty: u16,
        expected: usize,
        actual: usize,
    },
    #[error("attribute 0x{0:04x} is content dependent and has no standalone encoding")]
    ContentDependent(u16),
    #[error("fingerprint mismatch")]
    FingerprintMismatch,
    #[error("fingerprint must be the last attribute")]
    FingerprintNotLast,
    #[error("unknown address family 0x{0:02x}")]
    UnknownAddressFamily(u8),
    #[error("no message event handler configured")]
    NoEventHandler,
    #[error("empty message")]
    EmptyMessage,
    #[error("dispatch queue full")]
    QueueFull,
    #[error("dispatch pool closed")]
    PoolClosed,
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;
