//! Exec hooks: external scripts run on interface and reachability
//! transitions.

use std::path::PathBuf;

use tracing::{debug, warn};

/// Runs a hook script by name (relative to the configuration directory).
/// Injected so tests can assert hook invocations without spawning
/// processes.
pub trait HookRunner: Send {
    fn run(&mut self, script: &str, env: &[(String, String)]);
}

/// Spawns `<confbase>/<script>` through the shell, detached; a missing
/// script is not an error.
pub struct ScriptRunner {
    confbase: PathBuf,
}

impl ScriptRunner {
    pub fn new(confbase: PathBuf) -> Self {
        ScriptRunner { confbase }
    }
}

impl HookRunner for ScriptRunner {
    fn run(&mut self, script: &str, env: &[(String, String)]) {
        let path = self.confbase.join(script);
        if !path.is_file() {
            debug!(script, "no hook script");
            return;
        }

        let mut command = tokio::process::Command::new("/bin/sh");
        command.arg(&path);
        for (key, value) in env {
            command.env(key, value);
        }

        let script = script.to_owned();
        match command.spawn() {
            Ok(mut child) => {
                tokio::spawn(async move {
                    match child.wait().await {
                        Ok(status) if status.success() => debug!(%script, "hook finished"),
                        Ok(status) => warn!(%script, %status, "hook failed"),
                        Err(e) => warn!(%script, "hook wait failed: {e}"),
                    }
                });
            }
            Err(e) => warn!(%script, "cannot spawn hook: {e}"),
        }
    }
}

/// Test double that records invocations.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    pub calls: Vec<(String, Vec<(String, String)>)>,
}

impl HookRunner for RecordingRunner {
    fn run(&mut self, script: &str, env: &[(String, String)]) {
        self.calls.push((script.to_owned(), env.to_vec()));
    }
}
