use std::io;
use std::result;
use thiserror::Error;

//-------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Logic(String),

    #[error("no such node: {0}")]
    NoSuchNode(String),

    #[error("node already exists: {0}")]
    NodeAlreadyExists(String),

    #[error("record of {0} bytes exceeds the largest slot size")]
    TooLargeRecord(u64),
}

pub type Result<T> = result::Result<T, StoreError>;

pub fn logic_error<T>(msg: impl Into<String>) -> Result<T> {
    Err(StoreError::Logic(msg.into()))
}

//-------------------------------------------------------------------------
