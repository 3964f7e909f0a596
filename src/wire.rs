//! Wire formats for the client socket and the kernel link.
//!
//! Clients exchange one request and one response per connection on a unix
//! stream socket; the interception side and the daemon exchange fixed size
//! datagrams. Caller identity never travels in a payload, it is always taken
//! from socket peer credentials.

use crate::ident::{Fid, Uid};
use bitflags::bitflags;
use std::convert::TryInto;
use std::path::PathBuf;
use strum::{Display, FromRepr};
use thiserror::Error;

/// Errors raised while decoding a frame.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame too short: {0} bytes")]
    Truncated(usize),

    #[error("unknown operation {0:#04x}")]
    UnknownOp(u8),
}

/// Client request operations.
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, PartialEq)]
#[strum(serialize_all = "UPPERCASE")]
#[repr(u8)]
pub enum Op {
    /// Stream the caller's protected files; all of them for the superuser.
    List = 1,

    /// Check protection of one file; the superuser gets the owner back.
    Lookup = 2,

    /// Enroll a file into protection.
    Insert = 4,

    /// Withdraw a file from protection.
    Delete = 8,
}

/// Length of an encoded client request.
pub const REQUEST_LEN: usize = 9;

/// A client request: one operation and the file identity it applies to (the
/// identity is ignored for LIST).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Request {
    pub op: Op,
    pub fid: Fid,
}

impl Request {
    pub fn to_bytes(&self) -> [u8; REQUEST_LEN] {
        let mut buf = [0u8; REQUEST_LEN];
        buf[0] = self.op as u8;
        buf[1..9].copy_from_slice(&self.fid.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < REQUEST_LEN {
            return Err(WireError::Truncated(buf.len()));
        }
        let op = Op::from_repr(buf[0]).ok_or(WireError::UnknownOp(buf[0]))?;
        let fid = u64::from_le_bytes(buf[1..9].try_into().expect("eight fid bytes"));
        Ok(Request { op, fid })
    }
}

bitflags! {
    /// Status flags answered for LOOKUP, INSERT and DELETE. Success is all
    /// zeros. The flags compose: "already present" and "absent" carry both
    /// the operation and the existence bit, "not the owner" carries the
    /// operation and the owner bit.
    pub struct OpStatus: u32 {
        const OPERATION = 0b001;
        const EXISTENCE = 0b010;
        const OWNER = 0b100;
    }
}

impl OpStatus {
    pub fn to_bytes(self) -> [u8; 4] {
        self.bits().to_le_bytes()
    }
}

/// Size of the fixed path field in a LIST record.
pub const PATH_MAX: usize = 4096;

/// Length of an encoded LIST record.
pub const LIST_RECORD_LEN: usize = 4 + PATH_MAX;

/// One record of a LIST response stream: the owner and a reopenable path,
/// zero padded to [`PATH_MAX`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ListRecord {
    pub owner: Uid,
    pub path: PathBuf,
}

impl ListRecord {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; LIST_RECORD_LEN];
        buf[0..4].copy_from_slice(&self.owner.to_le_bytes());
        let path = self.path.to_string_lossy();
        let raw = path.as_bytes();
        let len = raw.len().min(PATH_MAX - 1);
        buf[4..4 + len].copy_from_slice(&raw[..len]);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < LIST_RECORD_LEN {
            return Err(WireError::Truncated(buf.len()));
        }
        let owner = u32::from_le_bytes(buf[0..4].try_into().expect("four owner bytes"));
        let end = buf[4..4 + PATH_MAX]
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(PATH_MAX);
        let path = PathBuf::from(String::from_utf8_lossy(&buf[4..4 + end]).into_owned());
        Ok(ListRecord { owner, path })
    }
}

/// Upper 32 bit mask marking a readiness datagram from the daemon.
pub const READY_MASK: u64 = 0xffff_ffff << 32;

/// Length of an encoded kernel link datagram.
pub const DATAGRAM_LEN: usize = 10;

/// A kernel link datagram: a correlation sequence and a single 64 bit
/// payload. With the upper 32 payload bits all set this is a readiness
/// announcement; otherwise the payload carries a file identity on the way to
/// the daemon and an owner identity on the way back, echoing the query's
/// sequence.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Datagram {
    pub seq: u16,
    pub payload: u64,
}

impl Datagram {
    /// The daemon's readiness announcement.
    pub fn ready() -> Self {
        Datagram {
            seq: 0,
            payload: READY_MASK,
        }
    }

    /// An ownership query for a file identity.
    pub fn query(seq: u16, fid: Fid) -> Self {
        Datagram { seq, payload: fid }
    }

    /// An owner response echoing the query's sequence.
    pub fn response(seq: u16, owner: Uid) -> Self {
        Datagram {
            seq,
            payload: u64::from(owner),
        }
    }

    /// Whether this datagram announces daemon readiness.
    pub fn is_ready(&self) -> bool {
        self.payload >> 32 == 0xffff_ffff
    }

    pub fn to_bytes(&self) -> [u8; DATAGRAM_LEN] {
        let mut buf = [0u8; DATAGRAM_LEN];
        buf[0..2].copy_from_slice(&self.seq.to_le_bytes());
        buf[2..10].copy_from_slice(&self.payload.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < DATAGRAM_LEN {
            return Err(WireError::Truncated(buf.len()));
        }
        Ok(Datagram {
            seq: u16::from_le_bytes(buf[0..2].try_into().expect("two sequence bytes")),
            payload: u64::from_le_bytes(buf[2..10].try_into().expect("eight payload bytes")),
        })
    }
}
