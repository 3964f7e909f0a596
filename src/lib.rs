//! Per file access control and transparent encryption for unix systems.
//!
//! A protected file is bound to its owning user. To anyone else its
//! contents are unreadable, its directory entry is concealed, and execute,
//! rename over, delete and open are refused; to the owner it behaves like
//! an ordinary file, with reads and writes transparently decrypted and
//! encrypted. Four parts cooperate: the position addressable
//! [cipher](cipher), the persistent ownership [registry](registry), the
//! [oracle](oracle) answering ownership queries on the interception side,
//! and the [interception layer](intercept) guarding the file I/O entry
//! points behind a kernel port contract. The [daemon](daemon) owns the
//! registry and performs enrollment and withdrawal.

pub mod cipher;
pub mod config;
pub mod daemon;
pub mod ident;
pub mod intercept;
pub mod oracle;
pub mod registry;
pub mod wire;

pub use config::Config;
pub use daemon::Daemon;
