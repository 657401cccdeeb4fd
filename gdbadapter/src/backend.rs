/// GDB backend: mode negotiation on top of the command correlator
///
/// Owns the GDB process (if any) and the communication channel, knows the GDB
/// version and whether async and non-stop mode ended up enabled.

use regex::Regex;
use std::cmp::Ordering;
use std::sync::OnceLock;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::communication::{GdbCommunication, GdbEvents};
use crate::process::{GdbConfig, GdbProcess};
use crate::types::GdbResult;
use crate::{GdbError, Result};

pub struct GdbBackend {
    comm: GdbCommunication,
    process: Option<GdbProcess>,
    version: Option<String>,
    async_mode: bool,
    non_stop: bool,
    non_stop_supported: bool,
}

impl GdbBackend {
    /// A backend that is not yet connected to anything
    pub fn new() -> (Self, GdbEvents) {
        let (comm, events) = GdbCommunication::new();
        let backend = Self {
            comm,
            process: None,
            version: None,
            async_mode: false,
            non_stop: false,
            non_stop_supported: true,
        };
        (backend, events)
    }

    /// Probe the version, spawn GDB and wire up its pipes
    pub async fn spawn(&mut self, config: &GdbConfig) -> Result<()> {
        match GdbProcess::probe_version(config).await {
            Ok(output) => self.set_version_output(&output),
            Err(e) => log::warn!("Could not determine GDB version: {}", e),
        }

        let mut process = GdbProcess::start(config).await?;
        let stdin = process
            .take_stdin()
            .ok_or_else(|| GdbError::CommunicationError("Failed to get stdin handle".into()))?;
        let stdout = process
            .take_stdout()
            .ok_or_else(|| GdbError::CommunicationError("Failed to get stdout handle".into()))?;
        let stderr = process
            .take_stderr()
            .ok_or_else(|| GdbError::CommunicationError("Failed to get stderr handle".into()))?;

        self.comm.setup(stdin, stdout).await;
        self.comm.attach_stderr(stderr);
        self.process = Some(process);
        Ok(())
    }

    /// Talk MI over an arbitrary stream pair instead of a spawned process
    pub async fn connect_streams<W, R>(&mut self, stdin: W, stdout: R)
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.comm.setup(stdin, stdout).await;
    }

    /// Record the version from `gdb --version` output; unparsable output leaves it unknown
    pub fn set_version_output(&mut self, output: &str) {
        self.version = parse_gdb_version_output(output);
        match &self.version {
            Some(version) => log::info!("GDB version {}", version),
            None => log::warn!("Unrecognised GDB version output: {:?}", output.lines().next()),
        }
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Unknown versions count as older than anything
    pub fn gdb_version_at_least(&self, version: &str) -> bool {
        match &self.version {
            Some(current) => compare_versions(current, version) != Ordering::Less,
            None => false,
        }
    }

    /// Wait until GDB printed its first prompt
    pub async fn wait_ready(&self) -> Result<()> {
        self.comm.wait_ready().await
    }

    /// Negotiate non-stop and async mode. Never fails: unsupported modes are switched off.
    pub async fn negotiate_modes(&mut self, request_async: bool, request_non_stop: bool) {
        let setting = if request_non_stop { "on" } else { "off" };
        match self.gdb_set("non-stop", setting).await {
            Ok(()) => self.non_stop = request_non_stop,
            Err(e) => {
                log::warn!("Non-stop mode not supported: {}", e);
                let _ = self.gdb_set("non-stop", "off").await;
                self.non_stop = false;
                self.non_stop_supported = false;
            }
        }

        let variable = if self.gdb_version_at_least("7.8") {
            "mi-async"
        } else {
            "target-async"
        };
        let setting = if request_async { "on" } else { "off" };
        match self.gdb_set(variable, setting).await {
            Ok(()) => self.async_mode = request_async,
            Err(e) => {
                log::warn!("Async mode not supported: {}", e);
                let _ = self.gdb_set(variable, "off").await;
                self.async_mode = false;
            }
        }

        // Non-stop needs async, whatever the negotiation above said
        if self.non_stop {
            self.async_mode = true;
        }
        log::debug!("Negotiated async={} non-stop={}", self.async_mode, self.non_stop);
    }

    pub fn is_async(&self) -> bool {
        self.async_mode
    }

    pub fn is_non_stop(&self) -> bool {
        self.non_stop
    }

    pub fn non_stop_supported(&self) -> bool {
        self.non_stop_supported
    }

    pub fn is_running(&self) -> bool {
        self.comm.is_running()
    }

    /// Send a raw MI command (leading dash included)
    pub async fn send_command(&self, command: &str) -> Result<GdbResult> {
        self.comm.send_command(command).await
    }

    /// Interrupt the target: MI interrupt in async mode, SIGINT to GDB otherwise
    pub async fn pause(&self, thread_id: Option<u32>) -> Result<()> {
        if self.async_mode || self.process.is_none() {
            let command = match thread_id {
                Some(thread) if self.non_stop => format!("-exec-interrupt --thread {}", thread),
                _ => "-exec-interrupt".to_string(),
            };
            self.send_command(&command).await?;
            Ok(())
        } else {
            self.process.as_ref().ok_or(GdbError::ProcessTerminated)?.interrupt()
        }
    }

    /// Ask GDB to exit, then make sure the process is gone
    pub async fn shutdown(&mut self) {
        if self.comm.is_running() {
            let _ = self.send_command("-gdb-exit").await;
        }
        self.comm.stop().await;
        if let Some(mut process) = self.process.take() {
            let _ = process.kill().await;
        }
    }
}

/// Extract the dotted version from `gdb --version` output
pub fn parse_gdb_version_output(output: &str) -> Option<String> {
    static PARENS: OnceLock<Regex> = OnceLock::new();
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    let parens = PARENS.get_or_init(|| Regex::new(r"\([^)]*\)").expect("valid regex"));
    let number = NUMBER.get_or_init(|| Regex::new(r"\d+(?:\.\d+)*").expect("valid regex"));

    let line = output.lines().find(|line| line.contains("gdb"))?;
    let after = &line[line.find("gdb")? + 3..];
    let stripped = parens.replace_all(after, "");
    number.find(&stripped).map(|m| m.as_str().to_string())
}

/// Numeric dot-component comparison.
///
/// Non-numeric components are skipped. When one version has extra
/// components, it is greater only if one of them is non-zero.
pub fn compare_versions(v1: &str, v2: &str) -> Ordering {
    let parts1: Vec<&str> = v1.split('.').collect();
    let parts2: Vec<&str> = v2.split('.').collect();

    for (a, b) in parts1.iter().zip(parts2.iter()) {
        let (Ok(a), Ok(b)) = (a.parse::<u64>(), b.parse::<u64>()) else {
            continue;
        };
        match a.cmp(&b) {
            Ordering::Equal => continue,
            other => return other,
        }
    }

    let extra_nonzero = |parts: &[&str], from: usize| parts[from..].iter().any(|p| p.parse::<u64>().map(|n| n > 0).unwrap_or(false));
    if parts1.len() > parts2.len() && extra_nonzero(&parts1, parts2.len()) {
        return Ordering::Greater;
    }
    if parts2.len() > parts1.len() && extra_nonzero(&parts2, parts1.len()) {
        return Ordering::Less;
    }
    Ordering::Equal
}
