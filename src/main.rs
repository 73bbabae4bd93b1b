//! iSCSI target daemon entry point
//!
//! Loads the XML configuration (`iscsi-target.xml` in the working directory,
//! or the path given as the only argument), opens the backing files, and
//! runs the server until interrupted. Exits non-zero on configuration or
//! bind failure.

use iscsi_targetd::config::{TargetConfiguration, CONFIGURATION_FILE_NAME};
use iscsi_targetd::error::ScsiResult;
use iscsi_targetd::storage::{human_friendly_size, BlockStore, FileBlockStore};
use iscsi_targetd::target::{Target, TargetRegistry};
use iscsi_targetd::TargetServer;
use std::sync::Arc;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        log::error!("{e}");
        std::process::exit(1);
    }
}

fn run() -> ScsiResult<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| CONFIGURATION_FILE_NAME.to_string());

    let config = TargetConfiguration::load(&config_path)?;

    println!("iscsi-targetd {}", iscsi_targetd::VERSION);
    println!("   port:           {}", config.port);

    let targets = Arc::new(TargetRegistry::new());
    for info in &config.targets {
        let store = Arc::new(FileBlockStore::open(&info.storage_file_path)?);
        println!("   target name:    {}", info.name);
        println!("   storage file:   {}", info.storage_file_path.display());
        println!("   file size:      {}", human_friendly_size(store.size_in_bytes()));
        targets.add(Target::new(info.name.clone(), info.alias.clone(), store))?;
    }

    let server = TargetServer::builder()
        .bind_addr(&format!("0.0.0.0:{}", config.port))
        .allow_sloppy_negotiation(config.allow_sloppy_negotiation)
        .targets(targets)
        .bind()?;

    server.run()
}
