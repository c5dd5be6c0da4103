//! Storage backend implementations.

pub mod ftp;
mod local;
mod memory;

pub use ftp::{FtpBackend, FtpFactory};
pub use local::{LocalBackend, LocalFactory};
pub(crate) use local::{copy_recursive, move_path};
pub use memory::{MemoryBackend, MemoryFactory, MemoryStore};
