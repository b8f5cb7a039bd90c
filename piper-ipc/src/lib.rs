//! Line protocol spoken between the orchestrator and the piper worker
//!
//! Commands travel over named FIFOs as single lines of whitespace separated
//! tokens. This crate decodes them once into closed enums, formats the
//! replies, and provides the FIFO transport both the worker pool and the
//! executors read from.

pub mod codec;
pub mod error;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use codec::{format_end_task, format_exception, parse_line};
pub use error::{IpcError, ProtocolError};
pub use protocol::{
    tags, Affinity, CollectionLayout, Command, Param, ParamType, Reply, ReturnedParam,
    TaskCommand,
};
pub use transport::{
    create_fifo, FifoPipe, LineTransport, MemoryTransport, PipePair, DEFAULT_REOPEN_DELAY,
};
