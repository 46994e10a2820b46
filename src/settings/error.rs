use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Unsupported record version: {0}")]
    UnsupportedVersion(u8),

    #[error("Corrupt record under {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<bincode::Error> for SettingsError {
    fn from(err: bincode::Error) -> Self {
        SettingsError::SerializationError(err.to_string())
    }
}

pub type SettingsResult<T> = Result<T, SettingsError>;
