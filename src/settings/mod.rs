pub mod error;
pub mod store;
pub mod types;

pub use error::{SettingsError, SettingsResult};
pub use store::{FileStore, MemoryStore, SettingsStore};
pub use types::{decode_record, encode_record, PersistedUpdate, PersistedXfer, RECORD_VERSION};
