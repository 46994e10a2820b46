use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("A transfer is already in progress")]
    Busy,

    #[error("Too many targets: capacity is {0}")]
    TooManyTargets(usize),

    #[error("No targets given")]
    NoTargets,

    #[error("Invalid transfer: {0}")]
    InvalidTransfer(#[from] crate::chunk::ChunkError),

    #[error("Data sink error: {0}")]
    Sink(#[from] crate::chunk::SinkError),

    #[error("Settings error: {0}")]
    Settings(#[from] crate::settings::SettingsError),

    #[error("Network error: {0}")]
    Network(#[from] crate::network::NetworkError),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

pub type BlobResult<T> = Result<T, BlobError>;
