use thiserror::Error;

#[derive(Error, Debug)]
pub enum DfuError {
    #[error("A DFU procedure is already running")]
    Busy,

    #[error("Too many receivers: capacity is {0}")]
    TooManyTargets(usize),

    #[error("No receivers")]
    NoTargets,

    #[error("Slot {0} not found")]
    SlotNotFound(usize),

    #[error("Slot {0} has no committed image")]
    SlotInvalid(usize),

    #[error("Slot store is full: capacity is {0}")]
    SlotStoreFull(usize),

    #[error("An image with this fwid is already in slot {0}")]
    SlotExists(usize),

    #[error("Image size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: u32, actual: usize },

    #[error("No image at index {0}")]
    InvalidImageIndex(u8),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("BLOB error: {0}")]
    Blob(#[from] crate::blob::BlobError),

    #[error("Settings error: {0}")]
    Settings(#[from] crate::settings::SettingsError),
}

pub type DfuResult<T> = Result<T, DfuError>;
