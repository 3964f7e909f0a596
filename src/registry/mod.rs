//! Persistent ownership records for protected files.

pub mod resolver;
pub mod sled_store;

use crate::ident::{Fid, Uid};
use anyhow::Result;
use std::path::Path;

/// The ownership store trait which defines the methods a registry engine
/// must fulfill. There is exactly one owner per protected file; a file whose
/// identity is absent is treated identically to one owned by nobody.
pub trait OwnershipStore {
    /// Open or create the store below the provided path.
    fn open(path: &Path) -> Result<Self>
    where
        Self: Sized;

    /// Look up the recorded owner of a file identity.
    fn lookup(&self, fid: Fid) -> Result<Option<Uid>>;

    /// Record a new ownership. Fails if the identity is already present.
    fn insert(&mut self, fid: Fid, owner: Uid) -> Result<()>;

    /// Remove a recorded ownership. Fails if the identity is absent.
    fn remove(&mut self, fid: Fid) -> Result<()>;

    /// All records, ordered by file identity.
    fn entries(&self) -> Result<Vec<(Fid, Uid)>>;

    /// Flush the store to disk so that it is safe to stop the daemon.
    fn persist(&mut self) -> Result<()>;
}
