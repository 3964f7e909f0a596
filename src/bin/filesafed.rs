use anyhow::Result;
use filesafe::{Config, Daemon};
use std::process::exit;

fn main() -> Result<()> {
    // Parse CLI arguments
    let config = Config::default();

    // Run the daemon based on the configuration
    if let Err(e) = Daemon::new(config).run() {
        // Collect all errors and chain them together. Do not use the logger
        // for printing here, because it could be possible that it fails before
        // initializing it.
        println!("Unable to run daemon: {:#}", e);
        exit(1);
    }

    Ok(())
}
