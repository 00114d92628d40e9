use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FsEventsError {
    #[error("at least one path must be watched")]
    NoPaths,

    #[error("path is not valid UTF-8: {0:?}")]
    NonUtf8Path(PathBuf),

    #[error("native stream could not be created for {paths:?}")]
    CreateFailed { paths: Vec<PathBuf> },

    #[error("stream {0} has been released")]
    Released(Uuid),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type FsEventsResult<T> = Result<T, FsEventsError>;
