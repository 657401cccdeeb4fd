/// Process management for GDB
///
/// This module handles GDB process creation, lifecycle management,
/// and platform-specific signal handling.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::{GdbError, Result};

/// How to start GDB. Supplied by whoever configured the session.
#[derive(Debug, Clone)]
pub struct GdbConfig {
    pub gdb_path: String,
    pub gdb_arguments: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// `None` removes the variable from GDB's environment
    pub environment: HashMap<String, Option<String>>,
}

impl Default for GdbConfig {
    fn default() -> Self {
        Self {
            gdb_path: "gdb".to_string(),
            gdb_arguments: Vec::new(),
            cwd: None,
            environment: HashMap::new(),
        }
    }
}

impl GdbConfig {
    fn command(&self) -> Command {
        let mut command = Command::new(&self.gdb_path);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &self.environment {
            match value {
                Some(value) => command.env(key, value),
                None => command.env_remove(key),
            };
        }
        command
    }
}

pub struct GdbProcess {
    child: Child,
}

impl GdbProcess {
    /// Start a new GDB process with MI interface
    pub async fn start(config: &GdbConfig) -> Result<Self> {
        log::debug!("Starting GDB process: {} {:?}", config.gdb_path, config.gdb_arguments);

        let child = config
            .command()
            .arg("--interpreter=mi2")
            .args(&config.gdb_arguments)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        log::debug!("GDB process started with PID: {:?}", child.id());

        Ok(GdbProcess { child })
    }

    /// Run `gdb --version` and return its stdout
    pub async fn probe_version(config: &GdbConfig) -> Result<String> {
        let output = config.command().arg("--version").stdin(Stdio::null()).output().await?;
        if !output.status.success() {
            return Err(GdbError::CommandError(format!(
                "{} --version exited with {}: {}",
                config.gdb_path,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Get the process ID
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Take stdin handle
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    /// Take stdout handle
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take stderr handle
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Send interrupt signal to the GDB process
    pub fn interrupt(&self) -> Result<()> {
        match self.id() {
            Some(pid) => {
                log::debug!("Sending interrupt to GDB PID: {}", pid);
                send_interrupt_signal(pid)
            }
            None => Err(GdbError::ProcessTerminated),
        }
    }

    /// Kill the GDB process
    pub async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

/// Platform-specific interrupt signal implementation
#[cfg(windows)]
fn send_interrupt_signal(pid: u32) -> Result<()> {
    unsafe {
        use winapi::um::wincon::{GenerateConsoleCtrlEvent, CTRL_C_EVENT};

        let result = GenerateConsoleCtrlEvent(CTRL_C_EVENT, pid);
        if result == 0 {
            log::error!("GenerateConsoleCtrlEvent failed for PID {}", pid);
            Err(GdbError::CommunicationError("Failed to send Ctrl+C event".into()))
        } else {
            Ok(())
        }
    }
}

#[cfg(unix)]
fn send_interrupt_signal(pid: u32) -> Result<()> {
    let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
    if result != 0 {
        log::error!("Failed to send SIGINT to PID {}", pid);
        Err(GdbError::CommunicationError("Failed to send SIGINT".into()))
    } else {
        Ok(())
    }
}

#[cfg(not(any(windows, unix)))]
fn send_interrupt_signal(_pid: u32) -> Result<()> {
    Err(GdbError::CommunicationError("Interrupt not supported on this platform".into()))
}

/// Install custom signal handlers to prevent self-termination when sending signals
#[cfg(windows)]
pub fn install_signal_protection() {
    unsafe {
        use winapi::shared::minwindef::{BOOL, DWORD, TRUE};
        use winapi::um::consoleapi::SetConsoleCtrlHandler;

        unsafe extern "system" fn ctrl_handler(ctrl_type: DWORD) -> BOOL {
            use winapi::um::wincon::{CTRL_BREAK_EVENT, CTRL_C_EVENT};

            match ctrl_type {
                CTRL_C_EVENT | CTRL_BREAK_EVENT => TRUE,
                _ => 0,
            }
        }

        if SetConsoleCtrlHandler(Some(ctrl_handler), TRUE) == 0 {
            log::warn!("Failed to install custom Ctrl+C handler");
        }
    }
}

#[cfg(not(windows))]
pub fn install_signal_protection() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_gdb_binary_reports_start_error() {
        let config = GdbConfig {
            gdb_path: "/nonexistent/definitely-not-gdb".into(),
            ..Default::default()
        };
        let err = GdbProcess::start(&config).await.err().unwrap();
        assert!(matches!(err, GdbError::ProcessStartError(_)));
        assert!(GdbProcess::probe_version(&config).await.is_err());
    }
}
