//! Command-line interface of `tincd`.

use std::path::{Path, PathBuf};
use std::process::Command;

use clap::Parser;
use tinc_core::{Error, Result};

#[derive(Debug, Parser)]
#[command(name = "tincd", version, about = "Peer-to-peer encrypted overlay network daemon")]
pub struct Options {
    /// Read configuration options from DIR.
    #[arg(short = 'c', long = "config", value_name = "DIR")]
    pub config: Option<PathBuf>,

    /// Connect to net NETNAME.
    #[arg(short = 'n', long = "net", value_name = "NETNAME")]
    pub net: Option<String>,

    /// Increase debug level or set it to LEVEL.
    #[arg(short = 'd', long = "debug", value_name = "LEVEL")]
    pub debug: Option<Option<u8>>,

    /// Don't fork and detach.
    #[arg(short = 'D', long = "no-detach")]
    pub no_detach: bool,

    /// Lock the daemon into main memory.
    #[arg(short = 'L', long = "mlock")]
    pub mlock: bool,

    /// Attempt to kill a running daemon and exit.
    #[arg(short = 'k', long = "kill", value_name = "SIGNAL")]
    pub kill: Option<Option<String>>,

    /// Write log entries to a logfile.
    #[arg(long = "logfile", value_name = "FILENAME")]
    pub logfile: Option<Option<PathBuf>>,

    /// Write PID to FILENAME.
    #[arg(long = "pidfile", value_name = "FILENAME")]
    pub pidfile: Option<PathBuf>,
}

impl Options {
    /// `tinc` or `tinc.<netname>`; names the pidfile and logfile.
    pub fn identname(&self) -> String {
        match &self.net {
            Some(net) => format!("tinc.{net}"),
            None => "tinc".to_owned(),
        }
    }

    /// Configuration directory: `--config`, else `/etc/tinc[/<net>]`.
    pub fn confbase(&self) -> PathBuf {
        if let Some(dir) = &self.config {
            return dir.clone();
        }
        match &self.net {
            Some(net) => PathBuf::from("/etc/tinc").join(net),
            None => PathBuf::from("/etc/tinc"),
        }
    }

    pub fn pidfile_path(&self) -> PathBuf {
        self.pidfile
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/run/{}.pid", self.identname())))
    }

    pub fn logfile_path(&self) -> Option<PathBuf> {
        self.logfile.as_ref().map(|choice| {
            choice
                .clone()
                .unwrap_or_else(|| PathBuf::from(format!("/var/log/{}.log", self.identname())))
        })
    }

    /// Default level 1; bare `--debug` bumps it.
    pub fn debug_level(&self) -> u8 {
        match &self.debug {
            None => 1,
            Some(None) => 2,
            Some(Some(level)) => *level,
        }
    }

    /// Map the debug level onto a tracing filter directive.
    pub fn log_filter(&self) -> &'static str {
        match self.debug_level() {
            0 => "error",
            1 => "warn",
            2 => "info",
            3 => "debug",
            _ => "trace",
        }
    }
}

/// Translate a `--kill` argument into a signal name.
fn signal_name(arg: &str) -> Result<String> {
    const KNOWN: &[&str] = &["HUP", "TERM", "KILL", "USR1", "USR2", "WINCH", "INT", "ALRM"];
    let upper = arg.to_ascii_uppercase();
    if KNOWN.contains(&upper.as_str()) {
        return Ok(upper);
    }
    if arg.parse::<u8>().is_ok() {
        return Ok(arg.to_owned());
    }
    Err(Error::config(format!(
        "invalid signal {arg}; must be a number or one of HUP, TERM, KILL, USR1, USR2, WINCH, INT or ALRM"
    )))
}

/// Signal the daemon whose pid is in `pidfile`.
pub fn kill_daemon(signal: Option<&str>, pidfile: &Path) -> Result<()> {
    let signal = signal_name(signal.unwrap_or("TERM"))?;
    let text = std::fs::read_to_string(pidfile)
        .map_err(|e| Error::config(format!("cannot read pid file {}: {e}", pidfile.display())))?;
    let pid: u32 = text
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("bogus pid file {}", pidfile.display())))?;

    let status = Command::new("kill")
        .arg("-s")
        .arg(&signal)
        .arg(pid.to_string())
        .status()
        .map_err(Error::Io)?;
    if !status.success() {
        return Err(Error::config(format!("could not signal process {pid}")));
    }
    Ok(())
}
