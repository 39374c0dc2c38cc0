//! Job store implementations.
//!
//! This crate provides the in-memory store used by tests and single-process
//! deployments, and the SurrealDB-backed durable store.
//!
//! # Features
//!
//! - `memory` (default): SurrealDB in-memory engine (`mem://`)
//! - `rocksdb`: RocksDB engine for persistent file-based storage

mod connection;
mod memory;
mod schema;
mod surreal;

pub use connection::{Database, DbConfig, DbError, connect};
pub use memory::MemoryJobStore;
pub use schema::init_schema;
pub use surreal::SurrealJobStore;
