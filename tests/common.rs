use anyhow::{Context, Result};
use filesafe::ident::{Fid, Uid};
use filesafe::intercept::port::{KernelPort, PosOp};
use filesafe::intercept::table::DispatchTable;
use filesafe::oracle::Oracle;
use filesafe::wire::{ListRecord, Op, OpStatus, Request, LIST_RECORD_LEN};
use log::{error, info};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::stat::{fstat, fstatat, Mode};
use nix::unistd::{lseek, UnlinkatFlags, Whence};
use std::env;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{exit, Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const BINARY_PATH: &str = "target/debug/filesafed";

#[cfg(test)]
#[ctor::ctor]
fn init() {
    env::set_var("RUST_LOG", "info");
    let _ = env_logger::try_init();

    info!("Ensuring latest daemon binary build");
    if let Err(e) = Command::new("cargo").arg("build").status() {
        error!("Unable to build daemon binary: {}", e);
        exit(1);
    }
}

/// Most scenarios need real privilege switching and kernel attached socket
/// credentials; skip them gracefully on unprivileged runners.
pub fn require_root() -> bool {
    if nix::unistd::Uid::effective().is_root() {
        true
    } else {
        eprintln!("skipping: requires root");
        false
    }
}

/// The spawned daemon plus the temp directories it serves.
pub struct Sut {
    test_dir: TempDir,
    child: Option<Child>,
}

impl Sut {
    pub fn start() -> Result<Sut> {
        let test_dir = TempDir::new()?;
        fs::create_dir(test_dir.path().join("data"))?;
        let mut sut = Sut {
            test_dir,
            child: None,
        };
        sut.spawn_daemon()?;
        Ok(sut)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.test_dir.path().join("data")
    }

    pub fn sock_path(&self) -> PathBuf {
        self.test_dir.path().join("client.sock")
    }

    pub fn link_path(&self) -> PathBuf {
        self.test_dir.path().join("link.sock")
    }

    pub fn oracle_path(&self) -> PathBuf {
        self.test_dir.path().join("oracle.sock")
    }

    pub fn spawn_daemon(&mut self) -> Result<()> {
        info!("Starting daemon");
        let log_path = self.test_dir.path().join("daemon.log");
        let out_file = File::create(&log_path)?;
        let err_file = out_file.try_clone()?;

        let child = Command::new(BINARY_PATH)
            .arg("--log-level=debug")
            .arg(format!("--sock-path={}", self.sock_path().display()))
            .arg(format!(
                "--registry-path={}",
                self.test_dir.path().join("registry").display()
            ))
            .arg(format!("--link-sock-path={}", self.link_path().display()))
            .arg(format!(
                "--oracle-sock-path={}",
                self.oracle_path().display()
            ))
            .arg(format!("--scan-root={}", self.data_dir().display()))
            .arg("--transcode-mode=direct")
            .stderr(Stdio::from(err_file))
            .stdout(Stdio::from(out_file))
            .spawn()
            .context("unable to run daemon")?;
        self.child = Some(child);

        info!("Waiting for daemon to be ready");
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if UnixStream::connect(self.sock_path()).is_ok() {
                info!("Daemon is ready");
                return Ok(());
            }
            thread::sleep(Duration::from_millis(50));
        }
        anyhow::bail!("daemon did not come up within 5s")
    }

    pub fn kill_daemon(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            info!("Killing daemon pid {}", child.id());
            child.kill().context("kill daemon")?;
            child.wait().context("wait for daemon")?;
        }
        Ok(())
    }

    fn request(&self, op: Op, fid: Fid) -> Result<[u8; 4]> {
        let mut stream =
            UnixStream::connect(self.sock_path()).context("connect to daemon")?;
        stream.write_all(&Request { op, fid }.to_bytes())?;
        let mut response = [0u8; 4];
        stream.read_exact(&mut response)?;
        Ok(response)
    }

    pub fn insert(&self, fid: Fid) -> Result<OpStatus> {
        Ok(OpStatus::from_bits_truncate(u32::from_le_bytes(
            self.request(Op::Insert, fid)?,
        )))
    }

    pub fn delete(&self, fid: Fid) -> Result<OpStatus> {
        Ok(OpStatus::from_bits_truncate(u32::from_le_bytes(
            self.request(Op::Delete, fid)?,
        )))
    }

    /// Superuser LOOKUP: the response carries the recorded owner.
    pub fn lookup_owner(&self, fid: Fid) -> Result<Uid> {
        Ok(u32::from_le_bytes(self.request(Op::Lookup, fid)?))
    }

    pub fn list(&self) -> Result<Vec<ListRecord>> {
        let mut stream =
            UnixStream::connect(self.sock_path()).context("connect to daemon")?;
        stream.write_all(&Request { op: Op::List, fid: 0 }.to_bytes())?;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf)?;
        buf.chunks(LIST_RECORD_LEN)
            .map(|chunk| ListRecord::from_bytes(chunk).map_err(Into::into))
            .collect()
    }

    pub fn cleanup(mut self) -> Result<()> {
        self.kill_daemon()
    }
}

impl Drop for Sut {
    fn drop(&mut self) {
        // A panicking test must not leak a daemon process.
        let _ = self.kill_daemon();
    }
}

/// Bind an oracle against the system under test and wait for the daemon's
/// readiness keepalive to arrive.
pub fn ready_oracle(sut: &Sut) -> Result<Arc<Oracle>> {
    let oracle = Arc::new(Oracle::bind(sut.oracle_path(), sut.link_path())?);
    wait_ready(&oracle)?;
    Ok(oracle)
}

pub fn wait_ready(oracle: &Oracle) -> Result<()> {
    // Readiness doubles as a keepalive with a three second period.
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if oracle.is_ready() {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(25));
    }
    anyhow::bail!("oracle never saw a readiness announcement")
}

/// A port double that forwards the original entry points to the real
/// kernel, with an injectable caller identity.
pub struct UserlandPort {
    table: DispatchTable,
    caller: Arc<AtomicU32>,
}

impl UserlandPort {
    pub fn new(caller: Arc<AtomicU32>) -> Self {
        Self {
            table: DispatchTable::new((0..512).map(|nr| 0x7000 + nr as u64).collect()),
            caller,
        }
    }
}

impl KernelPort for UserlandPort {
    fn dispatch_table(&mut self) -> Result<&mut DispatchTable> {
        Ok(&mut self.table)
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> isize {
        nix::unistd::read(fd, buf).map(|n| n as isize).unwrap_or(-1)
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> isize {
        nix::unistd::write(fd, buf).map(|n| n as isize).unwrap_or(-1)
    }

    fn execve(&self, _path: &Path) -> isize {
        // Forwarding would replace the test process; the policy decision is
        // what is under test.
        0
    }

    fn rename(&self, old: &Path, new: &Path) -> isize {
        fs::rename(old, new).map(|_| 0).unwrap_or(-1)
    }

    fn unlink(&self, path: &Path) -> isize {
        fs::remove_file(path).map(|_| 0).unwrap_or(-1)
    }

    fn unlinkat(&self, dfd: RawFd, path: &Path) -> isize {
        nix::unistd::unlinkat(Some(dfd), path, UnlinkatFlags::NoRemoveDir)
            .map(|_| 0)
            .unwrap_or(-1)
    }

    fn getdents64(&self, fd: RawFd, buf: &mut [u8]) -> isize {
        unsafe {
            libc::syscall(
                libc::SYS_getdents64,
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            ) as isize
        }
    }

    fn openat(&self, dfd: RawFd, path: &Path, flags: i32, mode: u32) -> isize {
        nix::fcntl::openat(
            dfd,
            path,
            OFlag::from_bits_truncate(flags),
            Mode::from_bits_truncate(mode),
        )
        .map(|fd| fd as isize)
        .unwrap_or(-1)
    }

    fn fid_of_fd(&self, fd: RawFd) -> Fid {
        match fstat(fd) {
            Ok(stat) => fid_unless_device(stat.st_mode, stat.st_ino),
            Err(_) => 0,
        }
    }

    fn fid_of_path(&self, dfd: RawFd, path: &Path) -> Fid {
        match fstatat(dfd, path, nix::fcntl::AtFlags::empty()) {
            Ok(stat) => fid_unless_device(stat.st_mode, stat.st_ino),
            Err(_) => 0,
        }
    }

    fn position(&self, fd: RawFd, op: PosOp) -> u64 {
        if op == PosOp::Write {
            let flags = fcntl(fd, FcntlArg::F_GETFL).unwrap_or(0);
            if OFlag::from_bits_truncate(flags).contains(OFlag::O_APPEND) {
                return fstat(fd).map(|stat| stat.st_size as u64).unwrap_or(0);
            }
        }
        lseek(fd, 0, Whence::SeekCur).map(|pos| pos as u64).unwrap_or(0)
    }

    fn caller_uid(&self) -> Uid {
        self.caller.load(Ordering::SeqCst)
    }
}

/// Character and block devices are kept out of the classification hot path.
fn fid_unless_device(mode: u32, ino: u64) -> Fid {
    match mode & libc::S_IFMT {
        libc::S_IFCHR | libc::S_IFBLK => 0,
        _ => ino,
    }
}

/// Minimal reader for the kernel's dirent64 record stream: (ino, name).
pub fn parse_dirents(buf: &[u8], len: usize) -> Vec<(u64, String)> {
    use std::convert::TryInto;
    let mut out = Vec::new();
    let mut bpos = 0;
    while bpos + 19 <= len {
        let ino = u64::from_ne_bytes(buf[bpos..bpos + 8].try_into().unwrap());
        let reclen =
            u16::from_ne_bytes(buf[bpos + 16..bpos + 18].try_into().unwrap()) as usize;
        if reclen < 19 || bpos + reclen > len {
            break;
        }
        let name: String = buf[bpos + 19..bpos + reclen]
            .iter()
            .take_while(|b| **b != 0)
            .map(|b| *b as char)
            .collect();
        out.push((ino, name));
        bpos += reclen;
    }
    out
}
