//! Persistent storage layers: content-addressed blobs and SQLite metadata.

pub mod blob;
pub mod meta;
