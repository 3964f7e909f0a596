//! The daemon side of the kernel link: readiness announcements and owner
//! responses for the interception layer's queries.

use crate::registry::OwnershipStore;
use crate::wire::{Datagram, DATAGRAM_LEN};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::fs;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Readiness doubles as a keepalive: it is re-announced at this interval so
/// an oracle that latched the daemon dead can recover.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3);

/// Poll granularity of the serve loop.
const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// The datagram endpoint answering "who owns file F" for the interception
/// layer. Queries carry a file identity and a correlation sequence; the
/// response echoes the sequence with the recorded owner, zero for
/// unprotected files.
pub struct KernelLink<S> {
    sock: UnixDatagram,
    oracle_path: PathBuf,
    store: Arc<Mutex<S>>,
}

impl<S: OwnershipStore + Send + 'static> KernelLink<S> {
    /// Bind the daemon side datagram socket.
    pub fn bind(link_path: &Path, oracle_path: &Path, store: Arc<Mutex<S>>) -> Result<Self> {
        if link_path.exists() {
            fs::remove_file(link_path).with_context(|| {
                format!("unable to remove socket file {}", link_path.display())
            })?;
        } else if let Some(dir) = link_path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("create socket dir {}", dir.display()))?;
        }
        let sock = UnixDatagram::bind(link_path)
            .with_context(|| format!("bind kernel link socket {}", link_path.display()))?;
        sock.set_read_timeout(Some(RECV_TIMEOUT))
            .context("set kernel link read timeout")?;
        Ok(Self {
            sock,
            oracle_path: oracle_path.to_path_buf(),
            store,
        })
    }

    /// Announce readiness to the oracle. Harmless while nobody listens.
    fn announce(&self) {
        match self
            .sock
            .send_to(&Datagram::ready().to_bytes(), &self.oracle_path)
        {
            Ok(_) => info!("Announced readiness to {}", self.oracle_path.display()),
            Err(e) => debug!("Readiness announcement failed: {}", e),
        }
    }

    /// Serve ownership queries on a background thread.
    pub fn spawn(self) -> JoinHandle<()> {
        thread::spawn(move || {
            if let Err(e) = self.serve() {
                warn!("Kernel link terminated: {:#}", e);
            }
        })
    }

    fn serve(&self) -> Result<()> {
        let mut buf = [0u8; DATAGRAM_LEN];
        self.announce();
        let mut last_announce = Instant::now();

        loop {
            if last_announce.elapsed() >= KEEPALIVE_INTERVAL {
                self.announce();
                last_announce = Instant::now();
            }
            let n = match self.sock.recv(&mut buf) {
                Ok(n) => n,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    continue
                }
                Err(e) => return Err(e).context("receive ownership query"),
            };
            let query = match Datagram::from_bytes(&buf[..n]) {
                Ok(query) if !query.is_ready() => query,
                _ => continue,
            };
            let owner = match super::lock(&self.store).and_then(|s| s.lookup(query.payload)) {
                Ok(owner) => owner.unwrap_or(0),
                Err(e) => {
                    warn!("Ownership lookup of file {} failed: {:#}", query.payload, e);
                    0
                }
            };
            if let Err(e) = self
                .sock
                .send_to(&Datagram::response(query.seq, owner).to_bytes(), &self.oracle_path)
            {
                debug!("Owner response failed: {}", e);
            }
        }
    }
}
