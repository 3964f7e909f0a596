//! Fork isolated enrollment and withdrawal transactions.
//!
//! The transcoding child adopts the owner's identity for the duration of
//! the file I/O, so a spliced interception layer sees the write back as
//! owner authorized and transforms it on the way through. The parent
//! performs the registry mutation between the child's read and write back
//! and takes the child's exit code as the transaction status; nothing
//! crosses the process boundary except the target file and one
//! synchronization pipe per direction.

use crate::cipher;
use crate::ident::{Fid, Uid};
use crate::registry::OwnershipStore;
use crate::wire::OpStatus;
use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use log::warn;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, close, fork, ForkResult};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::process;
use std::sync::Mutex;

/// How the write back half of a transaction gets its bytes transformed.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum TranscodeMode {
    /// The spliced interception layer transforms the child's plain I/O.
    Intercepted,

    /// No interception is installed; the child applies the cipher itself.
    /// Functionally equivalent, without an audit trail through the
    /// interception layer.
    Direct,
}

impl Default for TranscodeMode {
    fn default() -> Self {
        TranscodeMode::Direct
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Direction {
    Enroll,
    Withdraw,
}

/// Enroll a file: encrypt its bytes on disk and record `(fid, owner)`.
/// Readers never observe one without the other.
pub fn enroll<S: OwnershipStore>(
    path: &Path,
    fid: Fid,
    owner: Uid,
    store: &Mutex<S>,
    mode: TranscodeMode,
) -> Result<OpStatus> {
    transaction(path, fid, owner, store, mode, Direction::Enroll)
}

/// Withdraw a file: restore its plaintext bytes and drop the record.
pub fn withdraw<S: OwnershipStore>(
    path: &Path,
    fid: Fid,
    owner: Uid,
    store: &Mutex<S>,
    mode: TranscodeMode,
) -> Result<OpStatus> {
    transaction(path, fid, owner, store, mode, Direction::Withdraw)
}

fn mutate<S: OwnershipStore>(
    store: &Mutex<S>,
    direction: Direction,
    fid: Fid,
    owner: Uid,
) -> Result<()> {
    let mut guard = super::lock(store)?;
    match direction {
        Direction::Enroll => guard.insert(fid, owner),
        Direction::Withdraw => guard.remove(fid),
    }
}

fn transaction<S: OwnershipStore>(
    path: &Path,
    fid: Fid,
    owner: Uid,
    store: &Mutex<S>,
    mode: TranscodeMode,
    direction: Direction,
) -> Result<OpStatus> {
    let meta = std::fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    if !meta.is_file() {
        // Non-regular files carry only the registry record.
        return match mutate(store, direction, fid, owner) {
            Ok(()) => {
                super::lock(store)?.persist()?;
                Ok(OpStatus::empty())
            }
            Err(e) => {
                warn!("Registry mutation for file {} failed: {:#}", fid, e);
                Ok(OpStatus::OPERATION)
            }
        };
    }

    let (ready_r, ready_w) = unistd::pipe().context("create ready pipe")?;
    let (commit_r, commit_w) = unistd::pipe().context("create commit pipe")?;

    match unsafe { fork() }.context("fork transcoding child")? {
        ForkResult::Parent { child } => {
            let _ = close(ready_w);
            let _ = close(commit_r);
            let status = parent_half(child, fid, owner, store, direction, ready_r, commit_w);
            let _ = close(ready_r);
            let _ = close(commit_w);
            status
        }
        ForkResult::Child => {
            let _ = close(ready_r);
            let _ = close(commit_w);
            let code = match child_half(path, fid, owner, mode, ready_w, commit_r) {
                Ok(()) => 0,
                Err(_) => 1,
            };
            process::exit(code);
        }
    }
}

fn parent_half<S: OwnershipStore>(
    child: nix::unistd::Pid,
    fid: Fid,
    owner: Uid,
    store: &Mutex<S>,
    direction: Direction,
    ready_r: RawFd,
    commit_w: RawFd,
) -> Result<OpStatus> {
    // The child signals once it has read the file under the owner identity.
    let mut byte = [0u8; 1];
    let committed = if unistd::read(ready_r, &mut byte).unwrap_or(0) == 1 {
        match mutate(store, direction, fid, owner) {
            Ok(()) => {
                let _ = unistd::write(commit_w, &[1]);
                true
            }
            Err(e) => {
                warn!("Registry mutation for file {} failed: {:#}", fid, e);
                let _ = unistd::write(commit_w, &[0]);
                false
            }
        }
    } else {
        false
    };

    let status = waitpid(child, None).context("wait for transcoding child")?;
    let succeeded = matches!(status, WaitStatus::Exited(_, 0));

    if committed && succeeded {
        super::lock(store)?.persist()?;
        return Ok(OpStatus::empty());
    }
    if committed {
        // The write back never completed; take the mutation back so readers
        // cannot observe a half state.
        let rollback = {
            let mut guard = super::lock(store)?;
            match direction {
                Direction::Enroll => guard.remove(fid),
                Direction::Withdraw => guard.insert(fid, owner),
            }
        };
        if let Err(e) = rollback {
            warn!("Registry rollback for file {} failed: {:#}", fid, e);
        }
    }
    Ok(OpStatus::OPERATION)
}

fn child_half(
    path: &Path,
    fid: Fid,
    owner: Uid,
    mode: TranscodeMode,
    ready_w: RawFd,
    commit_r: RawFd,
) -> Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;

    // Adopt the owner's identity before touching the contents, so a spliced
    // interception layer classifies the I/O as owner authorized.
    unistd::seteuid(unistd::Uid::from_raw(owner)).context("drop privilege to owner")?;

    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer).context("read file contents")?;

    // Hand over to the parent for the registry mutation.
    unistd::write(ready_w, &[1]).context("signal parent")?;
    let mut ack = [0u8; 1];
    let n = unistd::read(commit_r, &mut ack).context("await registry commit")?;
    if n != 1 || ack[0] != 1 {
        bail!("registry mutation failed");
    }

    if mode == TranscodeMode::Direct {
        cipher::transform(&mut buffer, owner, fid, 0);
    }
    file.seek(SeekFrom::Start(0)).context("rewind file")?;
    file.write_all(&buffer).context("write file contents back")?;
    file.sync_all().context("sync file contents")?;
    Ok(())
}
