//! Server-side integrity rows for client-held histories.
//!
//! Only `(object_id, token) -> digest` is persisted. A request reads the
//! rows it touches into a [`DigestTxn`], and its writes are committed in one
//! step that fails if any of those rows moved in the meantime.

pub mod errors;
pub mod integrity;
pub mod memory;
pub mod model;
pub mod spi;
pub mod tx;

pub use errors::{IntegrityError, IntegrityResult, StorageError, StorageResult};
pub use integrity::{FirstUsePolicy, IntegrityCheck, IntegrityStore};
pub use memory::MemoryDigestStore;
pub use model::{DigestKey, WriteOp};
pub use spi::{CommitReport, DigestStore};
pub use tx::DigestTxn;
