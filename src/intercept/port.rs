//! The kernel port contract for the interception layer.

use super::table::DispatchTable;
use crate::ident::{Fid, Uid};
use anyhow::Result;
use std::os::unix::io::RawFd;
use std::path::Path;

/// Which operation a file position is recovered for. Reads use the
/// descriptor's current position; writes on an append-mode descriptor use
/// the current file size instead.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PosOp {
    Read,
    Write,
}

/// The services a host kernel must expose for the interception layer to
/// splice in, classify and forward calls. How the dispatch table is
/// discovered and how its page protection is toggled are port specific; the
/// contract is that none of these services fail silently.
pub trait KernelPort: Send + Sync {
    /// The syscall dispatch table, resolved by symbol name.
    fn dispatch_table(&mut self) -> Result<&mut DispatchTable>;

    /// The original read entry point.
    fn read(&self, fd: RawFd, buf: &mut [u8]) -> isize;

    /// The original write entry point.
    fn write(&self, fd: RawFd, buf: &[u8]) -> isize;

    /// The original execve entry point.
    fn execve(&self, path: &Path) -> isize;

    /// The original rename entry point.
    fn rename(&self, old: &Path, new: &Path) -> isize;

    /// The original unlink entry point.
    fn unlink(&self, path: &Path) -> isize;

    /// The original unlinkat entry point.
    fn unlinkat(&self, dfd: RawFd, path: &Path) -> isize;

    /// The original getdents64 entry point.
    fn getdents64(&self, fd: RawFd, buf: &mut [u8]) -> isize;

    /// The original openat entry point.
    fn openat(&self, dfd: RawFd, path: &Path, flags: i32, mode: u32) -> isize;

    /// The file identity behind an open descriptor; zero when the
    /// descriptor has none. Character and block devices always yield zero
    /// so the safe stays out of their hot path.
    fn fid_of_fd(&self, fd: RawFd) -> Fid;

    /// The file identity behind a path relative to `dfd`; zero on lookup
    /// failure and for character and block devices.
    fn fid_of_path(&self, dfd: RawFd, path: &Path) -> Fid;

    /// The file position the next `op` on the descriptor will act at.
    fn position(&self, fd: RawFd, op: PosOp) -> u64;

    /// The effective user identity of the calling process.
    fn caller_uid(&self) -> Uid;
}
