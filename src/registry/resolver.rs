//! Reverse name resolution from file identities to reopenable paths.

use crate::ident::{Fid, Uid};
use anyhow::{bail, Context, Result};
use log::trace;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use walkdir::{DirEntryExt, WalkDir};

/// Resolve a file identity back to a path suitable for reopening the file.
///
/// How the inode-to-name index is walked is filesystem specific; the
/// contract is to return one valid path or fail.
pub trait NameResolver {
    fn path_of(&self, fid: Fid) -> Result<PathBuf>;
}

/// A resolver that walks configured roots and matches inode numbers. Each
/// walk stays on the filesystem of its root so identities cannot collide
/// across mounts.
#[derive(Clone, Debug)]
pub struct WalkResolver {
    roots: Vec<PathBuf>,
}

impl WalkResolver {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }
}

impl NameResolver for WalkResolver {
    fn path_of(&self, fid: Fid) -> Result<PathBuf> {
        for root in &self.roots {
            for entry in WalkDir::new(root)
                .same_file_system(true)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if entry.ino() == fid {
                    trace!("Resolved file {} to {}", fid, entry.path().display());
                    return Ok(entry.into_path());
                }
            }
        }
        bail!("no path found for file identity {}", fid)
    }
}

/// The filesystem owner of a path, used to decide who may enroll it.
pub fn owner_of_path(path: &Path) -> Result<Uid> {
    Ok(std::fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .uid())
}
