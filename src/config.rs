//! Configuration related structures
use crate::daemon::TranscodeMode;
use crate::intercept::dirent::Concealment;
use clap::Parser;
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Builder, CopyGetters, Deserialize, Getters, Parser, Serialize)]
#[builder(pattern = "owned", setter(into))]
#[serde(rename_all = "kebab-case")]
#[command(
    about = "filesafe - per file access control and transparent encryption",
    after_help = "The daemon owns the registry of protected files and must run as root."
)]
/// filesafe - per file access control and transparent encryption
pub struct Config {
    #[get_copy = "pub"]
    #[builder(default = "LevelFilter::Info")]
    #[arg(
        default_value("info"),
        env("FILESAFE_LOG_LEVEL"),
        long("log-level"),
        short('l'),
        value_name("LEVEL")
    )]
    /// The logging level of the daemon
    log_level: LevelFilter,

    #[get = "pub"]
    #[builder(default = r#"PathBuf::from("/var/lib/filesafe/registry")"#)]
    #[arg(
        default_value("/var/lib/filesafe/registry"),
        env("FILESAFE_REGISTRY_PATH"),
        long("registry-path"),
        value_name("DIR")
    )]
    /// The path to the registry database directory
    registry_path: PathBuf,

    #[get = "pub"]
    #[builder(default = r#"PathBuf::from("/tmp/filesafe.sock")"#)]
    #[arg(
        default_value("/tmp/filesafe.sock"),
        env("FILESAFE_SOCK_PATH"),
        long("sock-path"),
        value_name("PATH")
    )]
    /// The path to the unix socket for client requests
    sock_path: PathBuf,

    #[get = "pub"]
    #[builder(default = r#"PathBuf::from("/run/filesafe/link.sock")"#)]
    #[arg(
        default_value("/run/filesafe/link.sock"),
        env("FILESAFE_LINK_SOCK_PATH"),
        long("link-sock-path"),
        value_name("PATH")
    )]
    /// The path to the daemon side kernel link socket
    link_sock_path: PathBuf,

    #[get = "pub"]
    #[builder(default = r#"PathBuf::from("/run/filesafe/oracle.sock")"#)]
    #[arg(
        default_value("/run/filesafe/oracle.sock"),
        env("FILESAFE_ORACLE_SOCK_PATH"),
        long("oracle-sock-path"),
        value_name("PATH")
    )]
    /// The path the ownership oracle receives datagrams on
    oracle_sock_path: PathBuf,

    #[get = "pub"]
    #[builder(default = r#"vec![PathBuf::from("/")]"#)]
    #[arg(
        default_value("/"),
        env("FILESAFE_SCAN_ROOT"),
        long("scan-root"),
        value_name("DIR")
    )]
    /// Filesystem roots walked during reverse name resolution; can be given
    /// multiple times
    scan_roots: Vec<PathBuf>,

    #[get_copy = "pub"]
    #[builder(default)]
    #[arg(
        default_value("zero"),
        env("FILESAFE_CONCEALMENT"),
        long("concealment"),
        value_enum,
        value_name("MODE")
    )]
    /// How protected entries are concealed during directory enumeration
    concealment: Concealment,

    #[get_copy = "pub"]
    #[builder(default)]
    #[arg(
        default_value("direct"),
        env("FILESAFE_TRANSCODE_MODE"),
        long("transcode-mode"),
        value_enum,
        value_name("MODE")
    )]
    /// Whether transcoding relies on spliced interception or applies the
    /// cipher directly
    transcode_mode: TranscodeMode,
}

impl Default for Config {
    fn default() -> Self {
        Self::parse()
    }
}
