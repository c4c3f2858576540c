//! Shared data types for the docflow build engine.
//!
//! Pure data only: documents, query criteria, build events, chunk
//! directives, and the control-bus wire protocol. Kept in one crate so the
//! store and engine crates can share them without circular dependencies.

pub mod bus;
pub mod chunk;
pub mod criteria;
pub mod document;
pub mod event;

pub use bus::BusMessage;
pub use chunk::ChunkSpec;
pub use criteria::{Criteria, Query, SortDirection, SortSpec};
pub use document::{canonical_key, epoch, Document, FieldMap};
pub use event::{BuildEvent, EventKind, EventPayload};
