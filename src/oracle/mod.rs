//! The ownership oracle: the interception side client that asks the daemon
//! who owns a file identity.
//!
//! Queries are correlated with responses by a 16 bit wrapping sequence
//! number. Every sequence value owns a dedicated response slot, so requests
//! and responses need no mutual exclusion beyond the atomic sequence step:
//! the dispatcher writes a slot exactly once before signalling it, and the
//! awakened requester is the unique reader. Wraparound can only collide with
//! a still-waiting request when more than 65,536 queries overlap.

use crate::ident::{Fid, Uid};
use crate::wire::{Datagram, DATAGRAM_LEN};
use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info, warn};
use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{recvmsg, setsockopt, sockopt, ControlMessageOwned, MsgFlags, UnixCredentials};
use std::io::IoSliceMut;
use std::fs;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Response slots, one per sequence value.
const SLOTS: usize = 1 << 16;

/// How long a query may wait before the daemon is latched as dead.
const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Minimum spacing of the "daemon terminated" notice.
const NOTICE_INTERVAL: Duration = Duration::from_secs(3);

/// Poll granularity of the dispatcher's shutdown check.
const DISPATCH_POLL: Duration = Duration::from_millis(100);

/// A source of ownership answers for the interception layer.
pub trait OwnerSource: Send + Sync {
    /// The owner of a file identity; zero when unprotected or unknown.
    fn owner_of(&self, fid: Fid) -> Uid;
}

impl<T: OwnerSource + ?Sized> OwnerSource for Arc<T> {
    fn owner_of(&self, fid: Fid) -> Uid {
        (**self).owner_of(fid)
    }
}

/// One response slot: the delivered owner and a rendezvous signalled at most
/// once per query.
struct Slot {
    uid: AtomicU32,
    signal_tx: Sender<()>,
    signal_rx: Receiver<()>,
}

impl Slot {
    fn new() -> Self {
        let (signal_tx, signal_rx) = bounded(1);
        Self {
            uid: AtomicU32::new(0),
            signal_tx,
            signal_rx,
        }
    }
}

struct Shared {
    sock: UnixDatagram,
    daemon_path: PathBuf,
    sequence: AtomicU16,
    daemon_pid: AtomicI32,
    slots: Vec<Slot>,
    last_notice: Mutex<Option<Instant>>,
}

impl Shared {
    fn owner_of(&self, fid: Fid) -> Uid {
        if self.daemon_pid.load(Ordering::SeqCst) == 0 {
            return 0;
        }

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        let slot = &self.slots[seq as usize];
        // Drain a signal left behind by a response that arrived after its
        // requester had already timed out.
        while slot.signal_rx.try_recv().is_ok() {}

        let query = Datagram::query(seq, fid);
        if self
            .sock
            .send_to(&query.to_bytes(), &self.daemon_path)
            .is_err()
        {
            self.latch_terminated();
            return 0;
        }

        match slot.signal_rx.recv_timeout(QUERY_TIMEOUT) {
            Ok(()) => slot.uid.load(Ordering::SeqCst),
            Err(_) => {
                self.latch_terminated();
                0
            }
        }
    }

    fn latch_terminated(&self) {
        self.daemon_pid.store(0, Ordering::SeqCst);
        if let Ok(mut last) = self.last_notice.lock() {
            let now = Instant::now();
            if last.map_or(true, |t| now.duration_since(t) >= NOTICE_INTERVAL) {
                *last = Some(now);
                warn!("Safe daemon terminated, ownership queries fail open");
            }
        }
    }

    fn dispatch(&self, shutdown: &AtomicBool) {
        let fd = self.sock.as_raw_fd();
        let mut buf = [0u8; DATAGRAM_LEN];
        let mut cmsg = cmsg_space!(UnixCredentials);

        while !shutdown.load(Ordering::SeqCst) {
            // The iovec borrows the buffer for the duration of the call, so
            // credentials and length are pulled out before decoding.
            let (bytes, creds) = {
                let mut iov = [IoSliceMut::new(&mut buf)];
                let msg = match recvmsg::<()>(fd, &mut iov, Some(&mut cmsg), MsgFlags::empty()) {
                    Ok(msg) => msg,
                    Err(Errno::EAGAIN) | Err(Errno::EINTR) => continue,
                    Err(e) => {
                        debug!("Oracle socket failed: {}", e);
                        break;
                    }
                };
                let creds = msg.cmsgs().find_map(|c| match c {
                    ControlMessageOwned::ScmCredentials(creds) => Some(creds),
                    _ => None,
                });
                (msg.bytes, creds)
            };

            let dgram = match Datagram::from_bytes(&buf[..bytes]) {
                Ok(dgram) => dgram,
                Err(e) => {
                    debug!("Dropping malformed datagram: {}", e);
                    continue;
                }
            };

            if dgram.is_ready() {
                match creds {
                    Some(creds) if creds.uid() == 0 => {
                        // Readiness doubles as a keepalive; only the
                        // transition is worth a log line.
                        let prev = self.daemon_pid.swap(creds.pid(), Ordering::SeqCst);
                        if prev != creds.pid() {
                            info!("Safe daemon ready (pid {})", creds.pid());
                        }
                    }
                    _ => warn!("Ignoring readiness datagram without superuser credentials"),
                }
            } else {
                let slot = &self.slots[dgram.seq as usize];
                slot.uid.store(dgram.payload as u32, Ordering::SeqCst);
                let _ = slot.signal_tx.try_send(());
            }
        }
    }
}

/// The oracle singleton: bind once at interception install time, tear down
/// on uninstall.
pub struct Oracle {
    shared: Arc<Shared>,
    shutdown: Arc<AtomicBool>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Oracle {
    /// Bind the oracle socket and start the response dispatcher. No query is
    /// answered before the daemon has announced readiness.
    pub fn bind<P: AsRef<Path>>(oracle_path: P, daemon_path: P) -> Result<Self> {
        let oracle_path = oracle_path.as_ref();
        if oracle_path.exists() {
            fs::remove_file(oracle_path).with_context(|| {
                format!("unable to remove socket file {}", oracle_path.display())
            })?;
        } else if let Some(dir) = oracle_path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("create socket dir {}", dir.display()))?;
        }

        let sock = UnixDatagram::bind(oracle_path)
            .with_context(|| format!("bind oracle socket {}", oracle_path.display()))?;
        setsockopt(sock.as_raw_fd(), sockopt::PassCred, &true)
            .context("enable credential passing on oracle socket")?;
        sock.set_read_timeout(Some(DISPATCH_POLL))
            .context("set oracle socket read timeout")?;

        let mut slots = Vec::with_capacity(SLOTS);
        for _ in 0..SLOTS {
            slots.push(Slot::new());
        }

        let shared = Arc::new(Shared {
            sock,
            daemon_path: daemon_path.as_ref().to_path_buf(),
            sequence: AtomicU16::new(0),
            daemon_pid: AtomicI32::new(0),
            slots,
            last_notice: Mutex::new(None),
        });
        let shutdown = Arc::new(AtomicBool::new(false));

        let dispatcher = {
            let shared = shared.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || shared.dispatch(&shutdown))
        };

        Ok(Self {
            shared,
            shutdown,
            dispatcher: Some(dispatcher),
        })
    }

    /// The owner of a file identity. Returns zero (not protected) when the
    /// daemon is not ready, on send failure and on timeout; a timeout
    /// latches the daemon as dead until the next readiness announcement.
    pub fn owner_of(&self, fid: Fid) -> Uid {
        self.shared.owner_of(fid)
    }

    /// Whether a readiness announcement has been seen and not latched away.
    pub fn is_ready(&self) -> bool {
        self.shared.daemon_pid.load(Ordering::SeqCst) != 0
    }
}

impl OwnerSource for Oracle {
    fn owner_of(&self, fid: Fid) -> Uid {
        Oracle::owner_of(self, fid)
    }
}

impl Drop for Oracle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.join();
        }
    }
}
