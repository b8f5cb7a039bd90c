//! Core types shared by piper processes
//!
//! This crate provides the in-process [`Value`] model handed to task
//! functions, the file serializer with its codec fallback chain, the
//! flatten/rebuild helpers for nested arguments and the per-process
//! [`ObjectTracker`].

pub mod error;
pub mod flatten;
pub mod serializer;
pub mod tracker;
pub mod value;

// Re-export commonly used types
pub use error::{FlattenError, SerializerError, SerializerResult, TrackerError};
pub use flatten::{flatten_args, rebuild_args, ArgLayout, Flat, SeqKind};
pub use serializer::{
    deserialize_from_bytes, deserialize_from_file, serialize_objects, serialize_to_bytes,
    serialize_to_file, Codec,
};
pub use tracker::{ObjectTracker, TrackToken, TrackerSnapshot};
pub use value::{DType, NdArray, Value};
