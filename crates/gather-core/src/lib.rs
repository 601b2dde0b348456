//! gather-core — wire format, range partitioning, and configuration.
//! All other Gather crates depend on this one.

pub mod config;
pub mod partition;
pub mod wire;

pub use partition::{assign, ChunkAssignment, SenderDescriptor};
pub use wire::{ByteRange, ChunkPayload, Message, SenderId, WireError};
