//! # filedeck-kernel
//!
//! Virtual filesystem and command dispatch for the filedeck file manager.
//!
//! Volumes put storage backends (local disk, FTP, in-memory) behind one
//! hash-addressed protocol:
//! - Every client-facing reference is a hash token `<volume>_<base64 id>`
//! - Each request opens short-lived drivers with their own stat/listing cache
//! - Copy, move, archive and extract work across backends by streaming
//! - Long-running commands stop when their request is aborted

pub mod archive;
pub mod commands;
pub mod config;
pub mod hash;
pub mod imaging;
pub mod registry;
pub mod staging;
pub mod transfer;
pub mod vfs;
pub mod volume;

pub use commands::{
    CommandContext, CommandError, CommandHandler, CommandOutput, CommandRegistry, CommandResult,
    DispatchOptions, Dispatcher, Params, Reply,
};
pub use config::{ConfigError, KernelConfig, VolumeConfig};
pub use hash::HashError;
pub use registry::{BackendRegistry, VolumeRegistry};
pub use staging::{ChunkTracker, StagingArea};
pub use vfs::{
    Driver, Entry, FileDownload, FileStat, RequestCache, VfsError, VfsResult,
    backends::{FtpBackend, LocalBackend, MemoryBackend},
};
pub use volume::{Volume, VolumeContext};
