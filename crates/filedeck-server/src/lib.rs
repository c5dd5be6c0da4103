//! # filedeck-server
//!
//! Stdio transport for the filedeck dispatcher. One JSON option bag per
//! input line, one JSON response per output line.

pub mod transport;

pub use transport::{TransportError, serve};
