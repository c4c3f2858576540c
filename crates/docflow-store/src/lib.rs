//! Store capability surface and reference adapters.
//!
//! [`Store`] defines the uniform document-access contract builders run
//! against. The reference adapters here ([`MemoryStore`], [`JsonFileStore`])
//! evaluate criteria in-process; production adapters translate the same
//! contract onto their native backends.

pub mod error;
pub mod jsonfile;
pub mod memory;
pub mod registry;
pub mod store;
pub mod validator;

pub use error::{Result, StoreError};
pub use jsonfile::JsonFileStore;
pub use memory::MemoryStore;
pub use registry::StoreRegistry;
pub use store::{DocStream, Store};
pub use validator::{RequiredFieldsValidator, Validator};
