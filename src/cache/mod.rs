//! Persistent per-directory record cache.
//!
//! Records are validated against each file's modification time and size;
//! any mismatch replaces the whole record. The cache is stored next to the
//! images as gzip-compressed JSON, and similarity descriptors are kept in a
//! separate user-level store because they are large.

pub mod descriptors;
pub mod directory;
pub mod record;

pub use descriptors::DescriptorStore;
pub use directory::{CACHE_FILE, CacheError, DirectoryCache, Reconciliation};
pub use record::{FieldKind, FieldSet, Neighbors, Record, UnknownField};
