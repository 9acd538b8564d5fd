#![forbid(unsafe_code)]

//! `tincd` entry point.

use std::fs;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use tinc_daemon::cli::{kill_daemon, Options};
use tinc_daemon::daemon::Daemon;
use tinc_daemon::hooks::ScriptRunner;
use tinc_daemon::keys::KeyStore;
use tinc_daemon::route::RouteMode;
use tinc_daemon::settings::Settings;
use tinc_vnd::VndMode;

fn init_logging(options: &Options) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(options.log_filter()));

    match options.logfile_path() {
        Some(path) => {
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("cannot open logfile {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let options = Options::parse();

    if let Some(kill) = &options.kill {
        return match kill_daemon(kill.as_deref(), &options.pidfile_path()) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("tincd: {e}");
                ExitCode::FAILURE
            }
        };
    }

    if let Err(e) = init_logging(&options) {
        eprintln!("tincd: {e}");
        return ExitCode::FAILURE;
    }

    match run(options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(options: Options) -> anyhow::Result<()> {
    if options.mlock {
        warn!("memory locking is not supported in this build");
    }
    if !options.no_detach {
        info!("running in the foreground (detaching is handled by the service manager)");
    }

    let confbase = options.confbase();
    let settings = Settings::load(&confbase, options.net.as_deref())
        .context("configuration failed")?;
    let host = settings.host_config(&settings.name)?;
    let keys = KeyStore::from_config(&host)?;

    let pidfile = options.pidfile_path();
    fs::write(&pidfile, format!("{}\n", std::process::id()))
        .with_context(|| format!("cannot write pid file {}", pidfile.display()))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("cannot start runtime")?;

    let result = runtime.block_on(async {
        // Router mode speaks IP over a tun-style device; switch and hub
        // modes need raw Ethernet.
        let vnd_mode = match settings.mode {
            RouteMode::Router => VndMode::Tun,
            RouteMode::Switch | RouteMode::Hub => VndMode::Tap,
        };
        let (vnd, frames) = tinc_vnd::open_file(
            &settings.device,
            &settings.interface,
            vnd_mode,
            tinc_routing::DEFAULT_MTU,
        )?;
        info!(
            device = %settings.device.display(),
            interface = %settings.interface,
            "virtual network device ready"
        );

        let hooks = Box::new(ScriptRunner::new(confbase.clone()));
        let daemon = Daemon::new(settings, keys, vnd, frames, hooks);
        daemon.run().await
    });

    if let Err(e) = fs::remove_file(&pidfile) {
        warn!("cannot remove pid file: {e}");
    }

    result.map_err(Into::into)
}
