// src/commands.rs

use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use depot_transfer::config::ServerRegistry;
use depot_transfer::platform::HttpPlatformClient;
use depot_transfer::progress::CliProgress;
use depot_transfer::transfer::agent::HttpTransferAgent;
use depot_transfer::{TransferEngine, TransferOptions};

use crate::cli::TransferArgs;

pub fn transfer(args: TransferArgs) -> Result<()> {
    let registry_path = match args.config {
        Some(path) => path,
        None => ServerRegistry::default_path()?,
    };
    let registry = ServerRegistry::load(&registry_path)?;
    let source = registry.resolve(&args.source)?;
    let target = registry.resolve(&args.target)?;

    let mut options = TransferOptions {
        include_repos: args.include_repos,
        exclude_repos: args.exclude_repos,
        check_existence_in_filestore: args.filestore,
        dry_run: args.dry_run,
        ..Default::default()
    };
    if let Some(threads) = args.threads {
        options.threads = threads.max(1);
    }
    if let Some(dir) = args.transfer_dir {
        options.transfer_dir = dir;
    }

    info!(
        "transferring files from '{}' to '{}' with {} threads",
        source.id, target.id, options.threads
    );

    let engine = TransferEngine::new(
        Box::new(HttpTransferAgent::new(source.clone())?),
        Box::new(HttpPlatformClient::new(source)?),
        Box::new(HttpPlatformClient::new(target.clone())?),
        &target,
        options,
    )
    .with_progress(Box::new(CliProgress::new()));

    crate::signal::install_signal_handlers();
    let cancel = engine.cancel_flag();
    thread::spawn(move || {
        while !crate::signal::SHUTDOWN.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(200));
        }
        warn!("interrupt received, stopping the transfer...");
        cancel.cancel();
    });

    engine.run()?;
    Ok(())
}

pub fn list_servers(config: Option<std::path::PathBuf>) -> Result<()> {
    let registry_path = match config {
        Some(path) => path,
        None => ServerRegistry::default_path()?,
    };
    let registry = ServerRegistry::load(&registry_path)?;
    for server in &registry.servers {
        println!("{}\t{}", server.id, server.url);
    }
    Ok(())
}
