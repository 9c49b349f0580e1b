use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument:{0}")]
    InvalidArgument(String),
    #[error("session is over")]
    SessionOver,
    #[error(transparent)]
    Protocol(#[from] rust_ice_core::error::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
