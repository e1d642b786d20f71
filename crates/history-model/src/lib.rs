//! Access-history data model shared by clients and the resource server.
//!
//! A [`HistoryList`] records which `(api, method)` pairs touched one object,
//! a [`BatchHistoryList`] is the wire envelope carried in the
//! `Authorization-History` / `Set-Authorization-History` headers, and
//! [`HistoryDigest`] is the integrity value the server keeps in place of the
//! full history. [`HistoryJar`] is the caller's side: it holds issued
//! histories per token and object.

pub mod batch;
pub mod canonical;
pub mod digest;
pub mod entry;
pub mod errors;
pub mod jar;
pub mod list;

pub use batch::BatchHistoryList;
pub use digest::{HistoryDigest, IntegrityMode};
pub use entry::{unix_now, HistoryEntry};
pub use errors::{DigestError, HistoryResult, MalformedHistoryError};
pub use jar::HistoryJar;
pub use list::HistoryList;

/// Request header carrying the caller's batch history.
pub const HISTORY_REQUEST_HEADER: &str = "authorization-history";
/// Response header carrying the batch history the caller must persist.
pub const HISTORY_RESPONSE_HEADER: &str = "set-authorization-history";
