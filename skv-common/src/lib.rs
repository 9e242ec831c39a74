// skv-common - Shared protocol definitions for the SeriesKV client runtime
//
// This crate defines the wire frame codec, the error taxonomy, and the
// command interface the dispatch engine consumes.

pub mod command;
pub mod error;
pub mod frame;

// Re-export for convenience
pub use command::*;
pub use error::*;
pub use frame::*;
