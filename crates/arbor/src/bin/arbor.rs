//! # ARBOR
//!
//! ```bash
//! arbor run.toml
//! RUST_LOG=arbor=debug arbor run.toml
//! ```
//!
//! Exit status: 0 on success or bad configuration, otherwise the fault
//! kind's status (2 resource, 3 initial conditions, 4 computation,
//! 5 output).

use std::path::PathBuf;

use arbor::{RunConfig, USAGE};
use tracing_subscriber::EnvFilter;

fn main() {
    let Some(path) = std::env::args_os().nth(1).map(PathBuf::from) else {
        println!("{USAGE}");
        return;
    };
    if path.as_os_str() == "--help" || path.as_os_str() == "-h" {
        println!("{USAGE}");
        return;
    }

    let config = match RunConfig::load(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}\n\n{USAGE}");
            return;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();

    println!("═══════════════════════════════════════════════════════════════════");
    println!("                           ARBOR v{}", env!("CARGO_PKG_VERSION"));
    println!("═══════════════════════════════════════════════════════════════════");
    println!("  config:  {}", path.display());
    println!("  ranks:   {}", config.group.ranks);
    println!("  backend: {:?}", config.device.backend);
    println!();

    std::process::exit(arbor::launch(&config));
}
