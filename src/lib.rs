//! TideDB - embedded object database engine
//!
//! Storage and transaction core of an embedded, object-oriented
//! database with optional cross-device synchronization.
//!
//! # Architecture
//!
//! TideDB rides on a **slab allocator over one memory-mapped file**:
//!
//! - **Refs**: one unified address space; refs below the baseline
//!   resolve into the file, refs above it into scratch slabs holding a
//!   write transaction's uncommitted nodes
//! - **MVCC**: commits write fresh nodes and flip a header select bit;
//!   readers pin their snapshot version until dropped
//! - **Coordinator**: a per-file singleton serializing writers, running
//!   change-set notifiers on a background worker and advancing readers
//! - **Sync**: an instruction applier integrates server changesets and
//!   a client-reset path recovers local offline changes
//!
//! # Features
//!
//! - Zero-copy reads via mmap with per-section mapping growth
//! - Snapshot-isolated transactions with frozen views
//! - Change-set notifications with self-notification skipping
//! - Client reset with DiscardLocal and Recover modes

#![deny(clippy::all)]

// Core modules
pub mod config;
pub mod constants;
pub mod error;
pub mod types;
pub mod util;

// Storage layer
pub mod core;

// Data model and transactions
pub mod db;

// Realm coordination and notifications
pub mod coordinator;

// Sync client core
pub mod sync;

// Re-export commonly used items
pub use config::RealmConfig;
pub use coordinator::{Coordinator, Realm};
pub use db::transaction::{Transaction, TransactionStage};
pub use db::{Db, DbOptions};
pub use error::{Result, TideError};
pub use types::{ColKey, DataType, ObjKey, Ref, TableKey, Value, Version};
