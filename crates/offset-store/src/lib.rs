//! Durable offset storage for the change stream.
//!
//! An offset is the last source position whose transaction was fully
//! delivered to the sink. The pipeline reads it once at startup to decide
//! where to resume and writes it after every delivered transaction.
//!
//! ## Storage Backends
//!
//! - `FilesystemStore` - one JSON file per stream, replaced atomically
//! - `PostgresStore` - a row per stream in a PostgreSQL table
//! - `MemoryStore` - process-local, keeps a history of saves for tests
//!
//! Every backend rejects saves that would move an offset backwards.

mod config;
mod error;
mod filesystem;
mod memory;
mod postgres;
pub mod store;


pub use config::OffsetStorage;
pub use error::{OffsetError, Result};
pub use filesystem::FilesystemStore;
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use store::{OffsetRecord, OffsetStore, StreamIdentity};
