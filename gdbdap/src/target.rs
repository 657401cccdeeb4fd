/// How the session gets GDB attached to something to debug
///
/// The session owns one strategy, picked from the launch/attach arguments:
/// a local program, an existing process, or a remote target (optionally
/// started through a server program such as `gdbserver`).

use async_trait::async_trait;
use regex::Regex;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use gdbadapter::GdbBackend;

use crate::config::{NumberOrString, SessionArguments, TargetArguments};
use crate::transport::EventSink;
use crate::{DapError, Result};

const DEFAULT_SERVER_PORT_PATTERN: &str = r"Listening on port ([0-9]+)";

#[async_trait]
pub trait TargetStrategy: Send {
    fn describe(&self) -> String;

    /// Load symbols and connect. Runs before `initialized` is sent.
    async fn connect(&mut self, backend: &GdbBackend, sink: &EventSink) -> Result<()>;

    /// Start or resume execution once the client finished configuration
    async fn start(&mut self, backend: &GdbBackend) -> Result<()>;

    async fn disconnect(&mut self, backend: &GdbBackend) -> Result<()>;
}

/// Run a user-supplied command: MI commands as-is, anything else through the CLI
pub async fn run_user_command(backend: &GdbBackend, command: &str) -> Result<()> {
    if command.starts_with('-') {
        backend.send_command(command).await?;
    } else {
        backend.interpreter_exec_console(command).await?;
    }
    Ok(())
}

/// Pick the strategy for a launch (`attach == false`) or attach request
pub fn select_target(args: &SessionArguments, attach: bool) -> Result<Box<dyn TargetStrategy>> {
    if let Some(target) = &args.target {
        return Ok(Box::new(RemoteTarget::new(args.program.clone(), target.clone())));
    }
    if attach {
        return Ok(Box::new(ProcessAttach {
            pid: args.process_id()?,
            program: args.program.clone(),
        }));
    }
    let program = args
        .program
        .clone()
        .ok_or_else(|| DapError::Request("Missing program to launch".to_string()))?;
    Ok(Box::new(LocalLaunch {
        program,
        arguments: args.arguments.clone(),
        cwd: args.cwd.clone(),
    }))
}

pub struct LocalLaunch {
    pub program: String,
    pub arguments: Option<String>,
    pub cwd: Option<String>,
}

#[async_trait]
impl TargetStrategy for LocalLaunch {
    fn describe(&self) -> String {
        format!("launch {}", self.program)
    }

    async fn connect(&mut self, backend: &GdbBackend, _sink: &EventSink) -> Result<()> {
        backend.file_exec_and_symbols(&self.program).await?;
        if let Some(cwd) = &self.cwd {
            backend.environment_cd(cwd).await?;
        }
        if let Some(arguments) = self.arguments.as_deref().filter(|a| !a.is_empty()) {
            backend.exec_arguments(arguments).await?;
        }
        Ok(())
    }

    async fn start(&mut self, backend: &GdbBackend) -> Result<()> {
        backend.exec_run().await?;
        Ok(())
    }

    async fn disconnect(&mut self, _backend: &GdbBackend) -> Result<()> {
        Ok(())
    }
}

pub struct ProcessAttach {
    pub pid: u32,
    pub program: Option<String>,
}

#[async_trait]
impl TargetStrategy for ProcessAttach {
    fn describe(&self) -> String {
        format!("attach to process {}", self.pid)
    }

    async fn connect(&mut self, backend: &GdbBackend, _sink: &EventSink) -> Result<()> {
        if let Some(program) = &self.program {
            backend.file_exec_and_symbols(program).await?;
        }
        backend.target_attach(self.pid).await?;
        Ok(())
    }

    async fn start(&mut self, backend: &GdbBackend) -> Result<()> {
        backend.exec_continue(None).await?;
        Ok(())
    }

    async fn disconnect(&mut self, backend: &GdbBackend) -> Result<()> {
        backend.target_detach().await?;
        Ok(())
    }
}

pub struct RemoteTarget {
    program: Option<String>,
    target: TargetArguments,
    server: Option<Child>,
}

impl RemoteTarget {
    pub fn new(program: Option<String>, target: TargetArguments) -> Self {
        Self {
            program,
            target,
            server: None,
        }
    }

    /// `-target-select` parameters: explicit ones, else `host:port`
    pub fn select_parameters(&self) -> Result<String> {
        if !self.target.parameters.is_empty() {
            return Ok(self.target.parameters.join(" "));
        }
        let port = self
            .target
            .port
            .as_ref()
            .ok_or_else(|| DapError::Request("Remote target needs a port or parameters".to_string()))?;
        Ok(format!(
            "{}:{}",
            self.target.host.as_deref().unwrap_or("localhost"),
            port.as_text()
        ))
    }

    /// Start the server program and wait until it reports readiness
    async fn start_server(&mut self, server: &str, sink: &EventSink) -> Result<()> {
        let pattern = Regex::new(
            self.target
                .server_port_reg_exp
                .as_deref()
                .unwrap_or(DEFAULT_SERVER_PORT_PATTERN),
        )
        .map_err(|e| DapError::Request(format!("Invalid serverPortRegExp: {}", e)))?;

        let mut command = Command::new(server);
        command
            .args(&self.target.server_parameters)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.target.cwd {
            command.current_dir(cwd);
        }
        log::info!("Starting server: {} {:?}", server, self.target.server_parameters);
        let mut child = command.spawn()?;

        let (line_tx, mut lines) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, line_tx);
        }

        loop {
            let Some(line) = lines.recv().await else {
                return Err(DapError::Request(format!("{} exited before it was ready", server)));
            };
            sink.output("server", &format!("{}\n", line));
            if let Some(caps) = pattern.captures(&line) {
                if self.target.port.is_none() {
                    self.target.port = caps.get(1).map(|m| NumberOrString::Text(m.as_str().to_string()));
                }
                break;
            }
        }

        if self.target.server_startup_delay > 0 {
            tokio::time::sleep(Duration::from_millis(self.target.server_startup_delay)).await;
        }

        let sink = sink.clone();
        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                sink.output("server", &format!("{}\n", line));
            }
        });

        self.server = Some(child);
        Ok(())
    }
}

fn forward_lines<R>(stream: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

#[async_trait]
impl TargetStrategy for RemoteTarget {
    fn describe(&self) -> String {
        format!(
            "{} target {}",
            self.target.target_type.as_deref().unwrap_or("remote"),
            self.select_parameters().unwrap_or_default()
        )
    }

    async fn connect(&mut self, backend: &GdbBackend, sink: &EventSink) -> Result<()> {
        if let Some(server) = self.target.server.clone() {
            self.start_server(&server, sink).await?;
        }
        if let Some(program) = &self.program {
            backend.file_exec_and_symbols(program).await?;
        }

        let target_type = self.target.target_type.as_deref().unwrap_or("remote");
        backend.target_select(target_type, &self.select_parameters()?).await?;

        for command in &self.target.connect_commands {
            run_user_command(backend, command).await?;
        }
        Ok(())
    }

    async fn start(&mut self, backend: &GdbBackend) -> Result<()> {
        backend.exec_continue(None).await?;
        Ok(())
    }

    async fn disconnect(&mut self, backend: &GdbBackend) -> Result<()> {
        let detached = backend.target_detach().await;
        if let Some(mut server) = self.server.take() {
            let _ = server.kill().await;
        }
        detached?;
        Ok(())
    }
}
