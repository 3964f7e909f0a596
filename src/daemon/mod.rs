//! The registry daemon: client request handling, the kernel link, and the
//! enrollment and withdrawal transactions.
//!
//! The daemon is the only process touching the registry. Clients connect to
//! a world accessible stream socket and exchange one request and one
//! response per connection; the caller's identity is taken from the peer
//! credentials of the connection, never from the payload.

pub mod kernel_link;
pub mod transcode;

pub use transcode::TranscodeMode;

use crate::config::Config;
use crate::ident::{self, Fid, Uid, SUPERUSER};
use crate::registry::resolver::{owner_of_path, NameResolver, WalkResolver};
use crate::registry::sled_store::SledStore;
use crate::registry::OwnershipStore;
use crate::wire::{ListRecord, Op, OpStatus, Request, REQUEST_LEN};
use anyhow::{anyhow, bail, Context, Result};
use clap::crate_name;
use kernel_link::KernelLink;
use log::{debug, info, warn};
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use std::env;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::{Arc, Mutex, MutexGuard};

/// Lock the shared registry, surfacing poisoning as an error.
pub(crate) fn lock<S>(store: &Mutex<S>) -> Result<MutexGuard<'_, S>> {
    store.lock().map_err(|_| anyhow!("registry lock poisoned"))
}

/// Daemon is the main instance serving the registry.
pub struct Daemon {
    config: Config,
}

impl Daemon {
    /// Create a new daemon instance.
    pub fn new(config: Config) -> Self {
        Daemon { config }
    }

    /// Open the registry, announce readiness on the kernel link and serve
    /// client requests until killed.
    pub fn run(self) -> Result<()> {
        self.set_logging_verbosity()
            .context("set logging verbosity")?;

        let store = SledStore::open(self.config.registry_path()).context("open registry")?;
        fs::set_permissions(
            self.config.registry_path(),
            fs::Permissions::from_mode(0o600),
        )
        .context("restrict registry permissions")?;
        let store = Arc::new(Mutex::new(store));
        let resolver = WalkResolver::new(self.config.scan_roots().clone());

        let link = KernelLink::bind(
            self.config.link_sock_path(),
            self.config.oracle_sock_path(),
            store.clone(),
        )
        .context("bind kernel link socket")?;
        let _kernel_link = link.spawn();

        let sock_path = self.config.sock_path();
        if !sock_path.is_absolute() {
            bail!(
                "specified socket path {} is not absolute",
                sock_path.display()
            )
        }
        if sock_path.exists() {
            fs::remove_file(sock_path)
                .with_context(|| format!("unable to remove socket file {}", sock_path.display()))?;
        } else if let Some(sock_dir) = sock_path.parent() {
            fs::create_dir_all(sock_dir)
                .with_context(|| format!("create socket dir {}", sock_dir.display()))?;
        }
        let listener = UnixListener::bind(sock_path)
            .with_context(|| format!("bind client socket {}", sock_path.display()))?;
        fs::set_permissions(sock_path, fs::Permissions::from_mode(0o666))
            .context("open up client socket permissions")?;

        info!("Safe daemon listening on {}", sock_path.display());

        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed client connection: {}", e);
                    continue;
                }
            };
            if let Err(e) = self.handle_client(&mut stream, &store, &resolver) {
                debug!("Client request failed: {:#}", e);
            }
        }
        Ok(())
    }

    /// Initialize the logger and set the verbosity to the configured level.
    fn set_logging_verbosity(&self) -> Result<()> {
        env::set_var(
            "RUST_LOG",
            format!("{}={}", crate_name!(), self.config.log_level()),
        );
        env_logger::try_init().context("init env logger")
    }

    fn handle_client(
        &self,
        stream: &mut UnixStream,
        store: &Mutex<SledStore>,
        resolver: &WalkResolver,
    ) -> Result<()> {
        let mut buf = [0u8; REQUEST_LEN];
        stream.read_exact(&mut buf).context("read client request")?;
        let request = Request::from_bytes(&buf).context("decode client request")?;
        let creds = getsockopt(stream.as_raw_fd(), PeerCredentials)
            .context("read peer credentials")?;
        let caller = creds.uid();
        debug!(
            "{} request from uid {} for file {}",
            request.op, caller, request.fid
        );

        match request.op {
            Op::List => self.list(stream, caller, store, resolver),
            Op::Lookup => self.lookup(stream, caller, request.fid, store),
            Op::Insert => {
                let status = self
                    .enroll(caller, request.fid, store, resolver)
                    .unwrap_or_else(|e| {
                        warn!("Enrollment of file {} failed: {:#}", request.fid, e);
                        OpStatus::OPERATION
                    });
                stream
                    .write_all(&status.to_bytes())
                    .context("write insert response")
            }
            Op::Delete => {
                let status = self
                    .withdraw(caller, request.fid, store, resolver)
                    .unwrap_or_else(|e| {
                        warn!("Withdrawal of file {} failed: {:#}", request.fid, e);
                        OpStatus::OPERATION
                    });
                stream
                    .write_all(&status.to_bytes())
                    .context("write delete response")
            }
        }
    }

    /// Stream the caller's protected files; all of them for the superuser.
    /// The stream is terminated by closing the connection.
    fn list(
        &self,
        stream: &mut UnixStream,
        caller: Uid,
        store: &Mutex<SledStore>,
        resolver: &WalkResolver,
    ) -> Result<()> {
        let entries = lock(store)?.entries()?;
        for (fid, owner) in entries {
            if caller != SUPERUSER && owner != caller {
                continue;
            }
            let path = match resolver.path_of(fid) {
                Ok(path) => path,
                Err(e) => {
                    warn!("Skipping unresolvable file {}: {:#}", fid, e);
                    continue;
                }
            };
            let record = ListRecord { owner, path };
            stream
                .write_all(&record.to_bytes())
                .context("write list record")?;
        }
        Ok(())
    }

    /// Check protection of one file. The superuser gets the recorded owner
    /// back instead of a status word.
    fn lookup(
        &self,
        stream: &mut UnixStream,
        caller: Uid,
        fid: Fid,
        store: &Mutex<SledStore>,
    ) -> Result<()> {
        let response: [u8; 4] = match lock(store)?.lookup(fid) {
            Ok(owner) => {
                let owner = owner.unwrap_or(0);
                if caller == SUPERUSER {
                    owner.to_le_bytes()
                } else if owner == caller {
                    OpStatus::empty().to_bytes()
                } else {
                    OpStatus::OWNER.to_bytes()
                }
            }
            Err(e) => {
                warn!("Registry lookup of file {} failed: {:#}", fid, e);
                OpStatus::OPERATION.to_bytes()
            }
        };
        stream
            .write_all(&response)
            .context("write lookup response")
    }

    /// Enroll a file. A non superuser caller must be the file's filesystem
    /// owner; a superuser request enrolls on behalf of that owner. Files
    /// already enrolled report an existence error.
    fn enroll(
        &self,
        caller: Uid,
        fid: Fid,
        store: &Mutex<SledStore>,
        resolver: &WalkResolver,
    ) -> Result<OpStatus> {
        if ident::is_reserved(fid) {
            return Ok(OpStatus::OPERATION);
        }
        if lock(store)?.lookup(fid)?.is_some() {
            return Ok(OpStatus::OPERATION | OpStatus::EXISTENCE);
        }
        let path = resolver
            .path_of(fid)
            .context("resolve path for enrollment")?;
        let fs_owner = owner_of_path(&path)?;
        if caller != SUPERUSER && caller != fs_owner {
            return Ok(OpStatus::OPERATION | OpStatus::OWNER);
        }
        // A superuser owned file has nothing to gain from the safe: its
        // records would read as "not protected".
        if fs_owner == SUPERUSER {
            return Ok(OpStatus::OPERATION | OpStatus::OWNER);
        }
        transcode::enroll(&path, fid, fs_owner, store, self.config.transcode_mode())
    }

    /// Withdraw a file. Only the recorded owner or the superuser may do so;
    /// files not enrolled report an existence error.
    fn withdraw(
        &self,
        caller: Uid,
        fid: Fid,
        store: &Mutex<SledStore>,
        resolver: &WalkResolver,
    ) -> Result<OpStatus> {
        let owner = match lock(store)?.lookup(fid)? {
            Some(owner) => owner,
            None => return Ok(OpStatus::OPERATION | OpStatus::EXISTENCE),
        };
        if caller != SUPERUSER && caller != owner {
            return Ok(OpStatus::OPERATION | OpStatus::OWNER);
        }
        let path = resolver
            .path_of(fid)
            .context("resolve path for withdrawal")?;
        transcode::withdraw(&path, fid, owner, store, self.config.transcode_mode())
    }
}
