//! File and user identity primitives.

/// A stable file identity issued by the filesystem for the lifetime of the
/// inode. Zero means "no usable identity" (lookup failure, character and
/// block devices).
pub type Fid = u64;

/// A user identity. Zero denotes the superuser.
pub type Uid = u32;

/// The superuser identity.
pub const SUPERUSER: Uid = 0;

/// The first ten file identities belong to filesystem metadata and never
/// take part in protection.
pub const RESERVED_FIDS: Fid = 10;

/// Whether a file identity is reserved (or absent) and therefore exempt from
/// every protection check.
pub fn is_reserved(fid: Fid) -> bool {
    fid <= RESERVED_FIDS
}
