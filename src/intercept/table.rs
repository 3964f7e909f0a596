//! Model of the kernel's syscall dispatch table.
//!
//! The host kernel exposes an array of entry addresses indexed by syscall
//! number whose memory page is write protected. Install and uninstall each
//! swap exactly eight entries, raising the write enable only for the
//! duration of the swap.

use strum::Display;
use thiserror::Error;

/// An entry address within the dispatch table, as resolved by the port.
pub type Addr = u64;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("dispatch table is write protected")]
    WriteProtected,

    #[error("no dispatch entry for syscall {0}")]
    NoSuchEntry(usize),
}

/// The eight entry points replaced by the interception layer, with their
/// x86-64 syscall numbers.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum Hooked {
    Read,
    Write,
    Execve,
    Rename,
    Unlink,
    Unlinkat,
    Getdents64,
    Openat,
}

impl Hooked {
    pub const ALL: [Hooked; 8] = [
        Hooked::Read,
        Hooked::Write,
        Hooked::Execve,
        Hooked::Rename,
        Hooked::Unlink,
        Hooked::Unlinkat,
        Hooked::Getdents64,
        Hooked::Openat,
    ];

    /// The syscall number this entry point dispatches under.
    pub fn nr(self) -> usize {
        match self {
            Hooked::Read => 0,
            Hooked::Write => 1,
            Hooked::Execve => 59,
            Hooked::Rename => 82,
            Hooked::Unlink => 87,
            Hooked::Getdents64 => 217,
            Hooked::Openat => 257,
            Hooked::Unlinkat => 263,
        }
    }
}

/// One dispatch table entry: the address of an original handler, or the
/// guarded variant spliced in by the interception layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Entry {
    Original(Addr),
    Guarded(Hooked),
}

/// The dispatch table handle. Write protected except inside an explicit
/// enable window, mirroring the page protection dance of the host kernel.
#[derive(Debug)]
pub struct DispatchTable {
    entries: Vec<Entry>,
    writable: bool,
}

impl DispatchTable {
    /// Build the table from the port resolved entry addresses, protected.
    pub fn new(addrs: Vec<Addr>) -> Self {
        Self {
            entries: addrs.into_iter().map(Entry::Original).collect(),
            writable: false,
        }
    }

    /// The current entry for a syscall number.
    pub fn entry(&self, nr: usize) -> Option<Entry> {
        self.entries.get(nr).copied()
    }

    /// Toggle the write enable of the table's memory.
    pub fn set_writable(&mut self, writable: bool) {
        self.writable = writable;
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Swap one entry, returning the previous one. Refused while the table
    /// is write protected.
    pub fn swap(&mut self, nr: usize, entry: Entry) -> Result<Entry, TableError> {
        if !self.writable {
            return Err(TableError::WriteProtected);
        }
        let slot = self
            .entries
            .get_mut(nr)
            .ok_or(TableError::NoSuchEntry(nr))?;
        let old = *slot;
        *slot = entry;
        Ok(old)
    }
}
