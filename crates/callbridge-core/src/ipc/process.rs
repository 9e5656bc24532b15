//! Engine subprocess management.
//!
//! Spawns the engine binary with piped stdio: stdin/stdout carry the framed
//! channel, stderr is the engine's console and is echoed to the debug log.

use std::ffi::OsString;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, info, warn};

use super::launcher::{EngineControl, EngineLauncher, EngineLink};
use super::transport::StreamTransport;
use crate::error::{Error, Result};

/// Environment variable naming the engine binary explicitly.
pub const ENGINE_PATH_VAR: &str = "CALLBRIDGE_ENGINE_PATH";

const ENGINE_BINARY: &str = if cfg!(windows) {
    "callbridge-engine.exe"
} else {
    "callbridge-engine"
};

/// Launches the engine as a child process.
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    probe: Option<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            probe: None,
        }
    }

    /// Locate `callbridge-engine` and launch that.
    ///
    /// Looks for the binary in the following order:
    /// 1. `CALLBRIDGE_ENGINE_PATH` environment variable
    /// 2. Same directory as the current executable
    /// 3. System PATH
    /// 4. `target/debug` or `target/release` of this workspace
    pub fn discover() -> Result<Self> {
        Ok(Self::new(find_engine_binary()?))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Run `directive` as the handshake probe goal.
    pub fn with_probe(mut self, directive: impl Into<String>) -> Self {
        self.probe = Some(directive.into());
        self
    }
}

fn find_engine_binary() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(ENGINE_PATH_VAR) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Ok(exe_path) = std::env::current_exe()
        && let Some(exe_dir) = exe_path.parent()
    {
        let candidate = exe_dir.join(ENGINE_BINARY);
        if candidate.exists() {
            return Ok(candidate);
        }
        // Integration tests run from target/<profile>/deps.
        if let Some(profile_dir) = exe_dir.parent() {
            let candidate = profile_dir.join(ENGINE_BINARY);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    if let Ok(path) = which::which(ENGINE_BINARY) {
        return Ok(path);
    }

    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        for profile in ["debug", "release"] {
            let path = PathBuf::from(&manifest_dir)
                .join("..")
                .join("..")
                .join("target")
                .join(profile)
                .join(ENGINE_BINARY);
            if path.exists() {
                return Ok(path.canonicalize().unwrap_or(path));
            }
        }
    }

    Err(Error::Launch(format!(
        "Could not find {} binary. Set {} or ensure it's in PATH.",
        ENGINE_BINARY, ENGINE_PATH_VAR
    )))
}

impl EngineLauncher for ProcessLauncher {
    fn launch(self: Box<Self>) -> Result<EngineLink> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::Launch(format!(
                    "Failed to spawn engine process '{}': {}",
                    self.program.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Launch("Failed to get engine stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Launch("Failed to get engine stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            thread::Builder::new()
                .name("callbridge-console".to_string())
                .spawn(move || {
                    for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                        debug!(target: "callbridge::console", "{}", line);
                    }
                })
                .map_err(|e| Error::Launch(format!("Failed to start console echo: {}", e)))?;
        }

        let pid = child.id();
        info!(pid, program = %self.program.display(), "engine process started");

        let transport: StreamTransport<BufReader<ChildStdout>, BufWriter<ChildStdin>> =
            StreamTransport::new(BufReader::new(stdout), BufWriter::new(stdin));

        Ok(EngineLink {
            transport: Arc::new(transport),
            control: Box::new(ProcessControl {
                pid,
                child: Mutex::new(child),
                killed: AtomicBool::new(false),
                probe: self.probe,
            }),
        })
    }
}

/// Control surface of an engine child process.
struct ProcessControl {
    pid: u32,
    child: Mutex<Child>,
    killed: AtomicBool,
    probe: Option<String>,
}

impl EngineControl for ProcessControl {
    fn send_break(&self) -> Result<()> {
        if self.killed.load(Ordering::SeqCst) {
            return Err(Error::InvalidOperation("engine has been killed".to_string()));
        }
        send_interrupt(self.pid)
    }

    fn handshake_directive(&self) -> Option<String> {
        self.probe.clone()
    }

    fn close(&self) -> Result<()> {
        if self.killed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut child = self
            .child
            .lock()
            .map_err(|_| Error::Transport("engine child handle poisoned".to_string()))?;

        if let Err(e) = child.kill() {
            // InvalidInput means the process already exited, which is fine
            if e.kind() != std::io::ErrorKind::InvalidInput {
                warn!("Failed to kill engine: {}", e);
            }
        }
        // Wait to reap zombie
        match child.wait() {
            Ok(status) => debug!(pid = self.pid, %status, "engine process exited"),
            Err(e) => warn!("Failed to wait for engine: {}", e),
        }
        Ok(())
    }
}

impl Drop for ProcessControl {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(unix)]
fn send_interrupt(pid: u32) -> Result<()> {
    // SAFETY: kill() with SIGINT only delivers a signal; an invalid pid yields ESRCH.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::Transport(format!(
            "Failed to interrupt engine {}: {}",
            pid,
            std::io::Error::last_os_error()
        )))
    }
}

#[cfg(not(unix))]
fn send_interrupt(pid: u32) -> Result<()> {
    Err(Error::InvalidOperation(format!(
        "break signal is not supported on this platform (engine {})",
        pid
    )))
}
