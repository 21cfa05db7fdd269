use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to read config file '{0}': {1}")]
    ConfigRead(PathBuf, io::Error),

    #[error("failed to parse config file '{0}': {1}")]
    ConfigParse(PathBuf, toml::de::Error),

    #[error("invalid listen address '{0}': expected ip:port")]
    InvalidAddress(String),

    #[error("unknown application type '{0}'")]
    UnknownApplication(String),

    #[error("connection {0} is closed")]
    ConnectionClosed(RawFd),
}

pub type Result<T> = std::result::Result<T, Error>;
