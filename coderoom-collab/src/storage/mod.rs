//! Durable storage for rooms that outlive their in-memory lifetime.
//!
//! ```text
//! ┌──────────────┐  evict (save)   ┌──────────────┐
//! │ SessionStore │ ──────────────► │ RoomArchive  │
//! │ (in-memory)  │ ◄────────────── │ (RocksDB)    │
//! └──────────────┘  re-join (load) └──────────────┘
//! ```

pub mod archive;

pub use archive::{ArchiveConfig, ArchiveError, ArchiveMetadata, ArchivedRoom, RoomArchive};
