//! `reapd`: the host daemon. Loads its config, wires up logging, constructs one
//! `Orchestrator`, and serves the control plane until killed.

mod config;
mod dto;
mod http;
mod metrics;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use reap_engine::orchestrator::Orchestrator;

use crate::config::Config;

fn main() -> ExitCode {
    let config_path = match parse_args() {
        Ok(path) => path,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("reapd: failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    env_logger::Builder::new()
        .filter_level(config.log_level)
        .init();

    log::info!(
        "reapd starting: base_dir={} listen_addr={}",
        config.base_dir.display(),
        config.listen_addr.display()
    );

    let orchestrator = Arc::new(Orchestrator::new());

    if let Err(e) = http::run(&config.listen_addr, orchestrator, config.metrics_csv_path.clone()) {
        log::error!("reapd exiting: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn parse_args() -> Result<PathBuf, String> {
    let mut args = std::env::args().skip(1);
    match args.next() {
        Some(path) => Ok(PathBuf::from(path)),
        None => Err("usage: reapd <config.json>".to_string()),
    }
}
