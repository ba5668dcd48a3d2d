//! Shared wire data model for the Toto framework.
//!
//! Everything that crosses a process boundary lives here: the request and
//! response [`Envelope`] shapes, the protocol error table, and the pluggable
//! serializer/compressor strategies used by the request pipeline, the worker
//! fabric and the event bus.

pub mod envelope;
pub mod error;
pub mod wire;

pub use envelope::{Envelope, Response, SessionInfo};
pub use error::TotoError;
pub use wire::{Compression, WireFormat};
