//! The sled backed ownership store used by the daemon.

use crate::ident::{Fid, Uid};
use crate::registry::OwnershipStore;
use anyhow::{anyhow, bail, Context, Result};
use log::trace;
use sled::Db;
use std::convert::TryInto;
use std::path::Path;

/// Ownership records in a sled tree: big-endian identity bytes as keys so
/// iteration yields records in identity order.
#[derive(Clone, Debug)]
pub struct SledStore {
    db: Db,
}

impl OwnershipStore for SledStore {
    fn open(path: &Path) -> Result<Self> {
        trace!("Opening registry {}", path.display());
        Ok(Self {
            db: sled::open(path)
                .with_context(|| format!("failed to open registry path {}", path.display()))?,
        })
    }

    fn lookup(&self, fid: Fid) -> Result<Option<Uid>> {
        match self
            .db
            .get(fid.to_be_bytes())
            .context("failed to retrieve ownership record")?
        {
            None => Ok(None),
            Some(value) => Ok(Some(
                rmp_serde::from_slice(&value).context("deserialize owner")?,
            )),
        }
    }

    fn insert(&mut self, fid: Fid, owner: Uid) -> Result<()> {
        let value = rmp_serde::to_vec(&owner).context("failed to serialize owner")?;
        self.db
            .compare_and_swap(fid.to_be_bytes(), None as Option<&[u8]>, Some(value))
            .context("failed to insert ownership record")?
            .map_err(|_| anyhow!("ownership of file {} already recorded", fid))?;
        trace!("Recorded owner {} for file {}", owner, fid);
        Ok(())
    }

    fn remove(&mut self, fid: Fid) -> Result<()> {
        if self
            .db
            .remove(fid.to_be_bytes())
            .context("failed to remove ownership record")?
            .is_none()
        {
            bail!("no ownership recorded for file {}", fid);
        }
        trace!("Removed ownership of file {}", fid);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<(Fid, Uid)>> {
        let mut records = Vec::new();
        for entry in self.db.iter() {
            let (key, value) = entry.context("failed to iterate registry")?;
            let fid = u64::from_be_bytes(
                key.as_ref()
                    .try_into()
                    .map_err(|_| anyhow!("malformed registry key of {} bytes", key.len()))?,
            );
            let owner = rmp_serde::from_slice(&value).context("deserialize owner")?;
            records.push((fid, owner));
        }
        Ok(records)
    }

    fn persist(&mut self) -> Result<()> {
        self.db.flush().context("failed to persist registry")?;
        trace!("Persisted registry");
        Ok(())
    }
}
