//! Child process management
//!
//! The encoder and relay are opaque binaries launched from user-supplied
//! argument templates. Before spawning, any stale sibling whose full
//! command line matches ours is terminated; matching is exact, so
//! processes we did not configure are never touched.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use sysinfo::{ProcessesToUpdate, Signal, System};
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::errors::StreamError;
use crate::utils::split_args;

/// A fully rendered child command line, ready to spawn any number of
/// times.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    name: &'static str,
    program: String,
    args: Vec<String>,
    log_path: Option<PathBuf>,
}

impl ChildSpec {
    /// Render `template` by substituting `{key}` placeholders and
    /// splitting the result shell-style.
    pub fn from_template(
        name: &'static str,
        binary: &str,
        template: &str,
        substitutions: &[(&str, String)],
        log_path: Option<PathBuf>,
    ) -> Result<Self, StreamError> {
        if binary.is_empty() {
            return Err(StreamError::EmptyCommand { name });
        }

        let mut rendered = template.to_string();
        for (key, value) in substitutions {
            rendered = rendered.replace(&format!("{{{key}}}"), value);
        }

        Ok(Self {
            name,
            program: binary.to_string(),
            args: split_args(&rendered),
            log_path,
        })
    }

    /// The full command line, program first. Used for stale-sibling
    /// matching.
    pub fn cmdline(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Terminate any running process whose command line exactly matches
    /// ours. Returns how many were terminated; matching nothing is the
    /// normal case.
    pub fn kill_stale(&self) -> usize {
        let own = self.cmdline();
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let mut terminated = 0;
        for process in system.processes().values() {
            let cmd: Vec<String> = process
                .cmd()
                .iter()
                .map(|part| part.to_string_lossy().into_owned())
                .collect();
            if cmd == own {
                if process.kill_with(Signal::Term).is_none() {
                    process.kill();
                }
                terminated += 1;
                info!("Terminated stale {} process (pid {})", self.name, process.pid());
            }
        }

        terminated
    }

    /// Spawn the child. stdout/stderr go to the configured log file,
    /// or are inherited when no log is set.
    pub fn spawn(&self) -> Result<ManagedChild, StreamError> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        if let Some(log_path) = &self.log_path {
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
            {
                Ok(log) => {
                    if let Ok(clone) = log.try_clone() {
                        cmd.stdout(Stdio::from(log));
                        cmd.stderr(Stdio::from(clone));
                    }
                }
                Err(e) => {
                    warn!("Could not open {} log {}: {e}", self.name, log_path.display());
                }
            }
        }

        let child = cmd.spawn().map_err(|source| StreamError::Spawn {
            name: self.name,
            source,
        })?;

        debug!(
            "Started {} process (pid {:?}): {} {}",
            self.name,
            child.id(),
            self.program,
            self.args.join(" ")
        );

        Ok(ManagedChild {
            name: self.name,
            child,
            started: Instant::now(),
        })
    }
}

/// A spawned child the supervisor polls at 1 Hz.
#[derive(Debug)]
pub struct ManagedChild {
    name: &'static str,
    child: Child,
    started: Instant,
}

impl ManagedChild {
    /// Non-blocking exit check.
    pub fn try_status(&mut self) -> std::io::Result<Option<std::process::ExitStatus>> {
        self.child.try_wait()
    }

    /// Kill the child and reap it.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("Error killing {} process: {e}", self.name);
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}
