use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid arguments")]
    InvalidArgs,

    #[error("Invalid state")]
    InvalidState,

    #[error("Not found")]
    NotFound,

    #[error("Already exists")]
    Already,

    #[error("No buffers available")]
    NoBufs,

    #[error("Parse error: {0}")]
    Parse(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
