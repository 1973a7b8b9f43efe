//! QDMA driver daemon
//!
//! Hosts one driver registry over the software engine and answers the
//! control protocol on a Unix datagram socket.
//!
//! ```text
//! qdmad [-v]... [-c CONFIG]
//! ```

use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use log::info;
use qdma_core::{ControlServer, DriverRegistry, HostPages, SoftEngine};

mod config;
mod server;

use config::Config;
use server::ControlSocket;

fn main() {
    let mut args = pico_args::Arguments::from_env();
    let verbosity = (0..).find(|_| !args.contains("-v")).unwrap_or(0);
    common::setup_logging("qdmad", common::verbosity_level(verbosity));

    if let Err(e) = run(args) {
        eprintln!("qdmad: {:#}", e);
        process::exit(1);
    }
}

fn run(mut args: pico_args::Arguments) -> anyhow::Result<()> {
    let config_path: Option<PathBuf> = args
        .opt_value_from_os_str(["-c", "--config"], |s| {
            Ok::<_, std::convert::Infallible>(PathBuf::from(s))
        })
        .context("bad --config")?;
    let rest = args.finish();
    if !rest.is_empty() {
        anyhow::bail!("unexpected arguments {:?}", rest);
    }

    let mut config = match &config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.apply_env(|name| env::var(name).ok())?;

    let registry = Arc::new(DriverRegistry::init(
        Arc::new(SoftEngine::new()),
        Arc::new(HostPages::new()),
        config.function.is_vf(),
    ));
    for conf in config.device_configs() {
        let device = registry
            .attach(&conf)
            .with_context(|| format!("failed to attach {}", conf.bdf()))?;
        info!(
            "{}: config bar {}, user bar {}, max QP {}",
            device.name(),
            device.config().config_bar,
            device.config().user_bar,
            device.qmax()
        );
    }

    let server = ControlServer::new(registry);
    let socket = ControlSocket::bind(&config.socket_path())?;
    info!("serving family {}", server.family_name());
    socket.serve(&server)
}
