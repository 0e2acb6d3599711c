//! Wire and domain models.

pub mod file_info;

pub use file_info::{EncryptionMode, FileInfo, FileState, FileType};
