//! The interception layer: guarded variants of the file I/O entry points.
//!
//! Each guarded call recovers the file identity and caller identity,
//! obtains the owner from the ownership source and classifies the call.
//! Unprotected files and superuser callers pass through untouched; owners
//! get the cipher applied around the payload; everyone else gets a generic
//! refusal. Ownership answers that cannot be distinguished from "not
//! protected" (daemon dead, query timeout) make the call pass through with
//! the bytes untransformed: the layer fails open.

pub mod dirent;
pub mod policy;
pub mod port;
pub mod table;

use crate::cipher;
use crate::ident::{Fid, SUPERUSER};
use crate::oracle::OwnerSource;
use anyhow::{Context, Result};
use dirent::Concealment;
use log::info;
use policy::Privilege;
use port::{KernelPort, PosOp};
use std::os::unix::io::RawFd;
use std::path::Path;
use table::{Entry, Hooked};

/// The generic refusal for denied calls, indistinguishable from an ordinary
/// permission failure.
pub const DENIED: isize = -1;

/// The interception layer. Installing splices the eight guarded entry
/// points into the port's dispatch table; uninstalling restores the saved
/// originals and hands the port back.
pub struct Interceptor<P, O> {
    port: P,
    owners: O,
    concealment: Concealment,
    saved: Vec<(usize, Entry)>,
}

impl<P: KernelPort, O: OwnerSource> Interceptor<P, O> {
    /// Splice the guarded entry points into the dispatch table. The write
    /// enable of the table is raised only for the duration of the swap.
    pub fn install(mut port: P, owners: O, concealment: Concealment) -> Result<Self> {
        let mut saved = Vec::with_capacity(Hooked::ALL.len());
        {
            let table = port.dispatch_table().context("locate dispatch table")?;
            table.set_writable(true);
            for hook in Hooked::ALL.iter().copied() {
                match table.swap(hook.nr(), Entry::Guarded(hook)) {
                    Ok(old) => saved.push((hook.nr(), old)),
                    Err(e) => {
                        for (nr, entry) in saved.drain(..).rev() {
                            let _ = table.swap(nr, entry);
                        }
                        table.set_writable(false);
                        return Err(e).context("splice guarded entry points");
                    }
                }
            }
            table.set_writable(false);
        }
        info!("Interception installed over {} entry points", saved.len());
        Ok(Self {
            port,
            owners,
            concealment,
            saved,
        })
    }

    /// Restore the original entries and release the port.
    pub fn uninstall(mut self) -> Result<P> {
        {
            let table = self
                .port
                .dispatch_table()
                .context("locate dispatch table")?;
            table.set_writable(true);
            let mut restore_error = None;
            for (nr, entry) in self.saved.drain(..).rev() {
                if let Err(e) = table.swap(nr, entry) {
                    restore_error.get_or_insert(e);
                }
            }
            table.set_writable(false);
            if let Some(e) = restore_error {
                return Err(e).context("restore original entry points");
            }
        }
        info!("Interception uninstalled");
        Ok(self.port)
    }

    /// The underlying port, e.g. for inspecting the dispatch table.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    fn classify_fd(&self, fd: RawFd) -> (Fid, Privilege) {
        let fid = self.port.fid_of_fd(fd);
        let caller = self.port.caller_uid();
        (
            fid,
            Privilege::classify(fid, caller, |f| self.owners.owner_of(f)),
        )
    }

    fn classify_path(&self, dfd: RawFd, path: &Path) -> Privilege {
        let fid = self.port.fid_of_path(dfd, path);
        Privilege::classify(fid, self.port.caller_uid(), |f| self.owners.owner_of(f))
    }

    /// Guarded read. For the owner the buffer is decrypted after the
    /// underlying read has filled it, using the position observed before
    /// the read.
    pub fn read(&self, fd: RawFd, buf: &mut [u8]) -> isize {
        let (fid, privilege) = self.classify_fd(fd);
        match privilege {
            Privilege::Pass => self.port.read(fd, buf),
            Privilege::Owner => {
                let pos = self.port.position(fd, PosOp::Read);
                let ret = self.port.read(fd, buf);
                if ret > 0 {
                    cipher::transform(&mut buf[..ret as usize], self.port.caller_uid(), fid, pos);
                }
                ret
            }
            Privilege::Deny => DENIED,
        }
    }

    /// Guarded write. For the owner the payload is encrypted before the
    /// underlying write, at the position observed before the write; an
    /// append-mode descriptor writes at the current file size.
    pub fn write(&self, fd: RawFd, buf: &[u8]) -> isize {
        let (fid, privilege) = self.classify_fd(fd);
        match privilege {
            Privilege::Pass => self.port.write(fd, buf),
            Privilege::Owner => {
                let pos = self.port.position(fd, PosOp::Write);
                let mut sealed = buf.to_vec();
                cipher::transform(&mut sealed, self.port.caller_uid(), fid, pos);
                self.port.write(fd, &sealed)
            }
            Privilege::Deny => DENIED,
        }
    }

    /// Guarded execve: a protected file only executes for its owner.
    pub fn execve(&self, path: &Path) -> isize {
        if self.classify_path(libc::AT_FDCWD, path).denied() {
            DENIED
        } else {
            self.port.execve(path)
        }
    }

    /// Guarded rename: the source must be readable by the caller and the
    /// destination must not be a protected file.
    pub fn rename(&self, old: &Path, new: &Path) -> isize {
        let source = self.classify_path(libc::AT_FDCWD, old);
        let destination = self.port.fid_of_path(libc::AT_FDCWD, new);
        if source.denied() || policy::is_protected(destination, |f| self.owners.owner_of(f)) {
            DENIED
        } else {
            self.port.rename(old, new)
        }
    }

    /// Guarded unlink: protected files cannot be removed here, removal goes
    /// through withdrawal.
    pub fn unlink(&self, path: &Path) -> isize {
        let fid = self.port.fid_of_path(libc::AT_FDCWD, path);
        if policy::is_protected(fid, |f| self.owners.owner_of(f)) {
            DENIED
        } else {
            self.port.unlink(path)
        }
    }

    /// Guarded unlinkat, same protection rule as unlink.
    pub fn unlinkat(&self, dfd: RawFd, path: &Path) -> isize {
        let fid = self.port.fid_of_path(dfd, path);
        if policy::is_protected(fid, |f| self.owners.owner_of(f)) {
            DENIED
        } else {
            self.port.unlinkat(dfd, path)
        }
    }

    /// Guarded directory enumeration: the returned record stream is
    /// post-processed to conceal entries the caller may not read. The
    /// superuser's enumeration is never filtered, and surviving records
    /// keep their order.
    pub fn getdents64(&self, fd: RawFd, buf: &mut [u8]) -> isize {
        let ret = self.port.getdents64(fd, buf);
        let caller = self.port.caller_uid();
        if ret <= 0 || caller == SUPERUSER {
            return ret;
        }
        let len = dirent::conceal(buf, ret as usize, self.concealment, |ino| {
            Privilege::classify(ino, caller, |f| self.owners.owner_of(f)).denied()
        });
        len as isize
    }

    /// Guarded openat: a protected file only opens for its owner.
    pub fn openat(&self, dfd: RawFd, path: &Path, flags: i32, mode: u32) -> isize {
        if self.classify_path(dfd, path).denied() {
            DENIED
        } else {
            self.port.openat(dfd, path, flags, mode)
        }
    }
}
