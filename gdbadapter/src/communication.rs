/// Communication layer for GDB/MI protocol
///
/// This module handles the low-level communication with GDB: it tags every
/// command with a token, routes result records back to the waiting caller by
/// that token, and fans out-of-band records into one channel per category.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

use crate::parser::{parse_gdb_output, LineBuffer};
use crate::types::{AsyncKind, AsyncRecord, GdbOutput, GdbResult, ResultClass, StreamRecord, StreamType};
use crate::{GdbError, Result};

type PendingCommands = Arc<Mutex<HashMap<u32, oneshot::Sender<GdbResult>>>>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Receiving ends of the out-of-band record channels.
///
/// Order is preserved within a category; nothing is promised across
/// categories.
pub struct GdbEvents {
    pub console: mpsc::UnboundedReceiver<StreamRecord>,
    pub notify: mpsc::UnboundedReceiver<AsyncRecord>,
    pub exec: mpsc::UnboundedReceiver<AsyncRecord>,
    pub status: mpsc::UnboundedReceiver<AsyncRecord>,
}

#[derive(Clone)]
struct EventSenders {
    console: mpsc::UnboundedSender<StreamRecord>,
    notify: mpsc::UnboundedSender<AsyncRecord>,
    exec: mpsc::UnboundedSender<AsyncRecord>,
    status: mpsc::UnboundedSender<AsyncRecord>,
}

/// Manages communication with GDB process
pub struct GdbCommunication {
    stdin: tokio::sync::Mutex<Option<Writer>>,
    token_counter: AtomicU32,
    pending_commands: PendingCommands,
    senders: EventSenders,
    is_running: Arc<Mutex<bool>>,
    ready_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    ready_receiver: Mutex<Option<oneshot::Receiver<()>>>,
}

impl GdbCommunication {
    /// Create a new communication manager and the channels it feeds
    pub fn new() -> (Self, GdbEvents) {
        let (console_tx, console) = mpsc::unbounded_channel();
        let (notify_tx, notify) = mpsc::unbounded_channel();
        let (exec_tx, exec) = mpsc::unbounded_channel();
        let (status_tx, status) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let comm = Self {
            stdin: tokio::sync::Mutex::new(None),
            token_counter: AtomicU32::new(1),
            pending_commands: Arc::new(Mutex::new(HashMap::new())),
            senders: EventSenders {
                console: console_tx,
                notify: notify_tx,
                exec: exec_tx,
                status: status_tx,
            },
            is_running: Arc::new(Mutex::new(false)),
            ready_sender: Arc::new(Mutex::new(Some(ready_tx))),
            ready_receiver: Mutex::new(Some(ready_rx)),
        };

        (comm, GdbEvents { console, notify, exec, status })
    }

    /// Set up communication over the process pipes (or any stream pair)
    pub async fn setup<W, R>(&self, stdin: W, stdout: R)
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        *self.stdin.lock().await = Some(Box::new(stdin));
        *self.is_running.lock().unwrap() = true;

        self.start_stdout_reader(stdout);
    }

    /// Forward GDB's stderr as log output
    pub fn attach_stderr<R>(&self, stderr: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let console = self.senders.console.clone();

        tokio::spawn(async move {
            log::debug!("GDB stderr reader started");
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let trimmed = line.trim_end();
                        if !trimmed.is_empty() {
                            log::debug!("GDB stderr: {}", trimmed);
                            let _ = console.send(StreamRecord {
                                stream_type: StreamType::Log,
                                content: format!("{}\n", trimmed),
                            });
                        }
                    }
                    Err(_) => break,
                }
            }
            log::debug!("GDB stderr reader finished");
        });
    }

    /// Wait for the first `(gdb)` prompt. Returns immediately once it has been seen.
    pub async fn wait_ready(&self) -> Result<()> {
        let receiver = self.ready_receiver.lock().unwrap().take();
        match receiver {
            Some(receiver) => receiver.await.map_err(|_| GdbError::ProcessTerminated),
            None => Ok(()),
        }
    }

    /// Send a command to GDB and wait for its result record.
    ///
    /// `command` is the full MI command including the leading dash.
    pub async fn send_command(&self, command: &str) -> Result<GdbResult> {
        if !self.is_running() {
            return Err(GdbError::ProcessTerminated);
        }

        let token = self.token_counter.fetch_add(1, Ordering::SeqCst);
        let command_line = format!("{}{}\n", token, command);

        log::debug!("SEND[{}]: {}", token, command);

        let (sender, receiver) = oneshot::channel();
        self.pending_commands.lock().unwrap().insert(token, sender);

        if let Err(e) = self.write_line(&command_line).await {
            self.pending_commands.lock().unwrap().remove(&token);
            return Err(e);
        }

        let result = receiver.await.map_err(|_| GdbError::ProcessTerminated)?;

        log::debug!("RECV[{}]: class={:?}", token, result.class);

        match &result.class {
            ResultClass::Done | ResultClass::Running | ResultClass::Connected | ResultClass::Exit => Ok(result),
            ResultClass::Error => {
                let error_msg = result.error_message().unwrap_or("Unknown error").to_string();
                log::debug!("RECV[{}]: GDB ERROR -> {}", token, error_msg);
                Err(GdbError::CommandError(error_msg))
            }
            ResultClass::Other(class) => Err(GdbError::ProtocolError(format!(
                "unexpected result class '{}' for '{}': {:?}",
                class, command, result.results
            ))),
        }
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(GdbError::ProcessTerminated)?;

        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| GdbError::CommunicationError(format!("Failed to write command: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| GdbError::CommunicationError(format!("Failed to flush command: {}", e)))?;
        Ok(())
    }

    /// Check if communication is active
    pub fn is_running(&self) -> bool {
        *self.is_running.lock().unwrap()
    }

    /// Number of commands still waiting for a result
    pub fn pending_count(&self) -> usize {
        self.pending_commands.lock().unwrap().len()
    }

    /// Stop communication; every waiting command fails with `ProcessTerminated`
    pub async fn stop(&self) {
        *self.is_running.lock().unwrap() = false;
        *self.stdin.lock().await = None;
        self.pending_commands.lock().unwrap().clear();
    }

    /// Start reading from GDB stdout
    fn start_stdout_reader<R>(&self, mut stdout: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let senders = self.senders.clone();
        let pending_commands = self.pending_commands.clone();
        let is_running = self.is_running.clone();
        let ready = self.ready_sender.clone();

        tokio::spawn(async move {
            log::debug!("GDB stdout reader started");
            let mut buffer = LineBuffer::new();
            let mut chunk = vec![0u8; 8192];

            loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) => {
                        log::debug!("GDB stdout: EOF reached");
                        break;
                    }
                    Ok(n) => {
                        for line in buffer.push(&chunk[..n]) {
                            Self::process_gdb_output(&line, &senders, &pending_commands, &ready);
                        }
                    }
                    Err(e) => {
                        log::error!("GDB stdout read error: {}", e);
                        break;
                    }
                }
            }
            if let Some(line) = buffer.finish() {
                Self::process_gdb_output(&line, &senders, &pending_commands, &ready);
            }

            *is_running.lock().unwrap() = false;
            // Dropping the senders fails every command still waiting
            pending_commands.lock().unwrap().clear();
            log::debug!("GDB stdout reader finished");
        });
    }

    /// Process a line of GDB output
    fn process_gdb_output(
        line: &str,
        senders: &EventSenders,
        pending_commands: &PendingCommands,
        ready: &Arc<Mutex<Option<oneshot::Sender<()>>>>,
    ) {
        if line.trim().is_empty() {
            return;
        }
        log::trace!("GDB_OUT: {}", line);

        match parse_gdb_output(line) {
            Ok(GdbOutput::Result(result)) => match result.token {
                Some(token) => {
                    let sender = pending_commands.lock().unwrap().remove(&token);
                    match sender {
                        Some(sender) => {
                            let _ = sender.send(result);
                        }
                        None => log::warn!("RECV[{}]: No pending command found for token!", token),
                    }
                }
                None => log::debug!("RECV[NO_TOKEN]: Result without token -> class={:?}", result.class),
            },
            Ok(GdbOutput::Async(record)) => {
                let sender = match record.kind {
                    AsyncKind::Exec => &senders.exec,
                    AsyncKind::Notify => &senders.notify,
                    AsyncKind::Status => &senders.status,
                };
                let _ = sender.send(record);
            }
            Ok(GdbOutput::Stream(stream)) => {
                let _ = senders.console.send(stream);
            }
            Ok(GdbOutput::Prompt) => {
                if let Some(sender) = ready.lock().unwrap().take() {
                    log::debug!("GDB prompt seen, parser ready");
                    let _ = sender.send(());
                }
            }
            Err(e) => {
                log::warn!("GDB_PARSE_ERROR: '{}' -> {}", line, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn test_send_without_process_fails_fast() {
        let (comm, _events) = GdbCommunication::new();
        let err = comm.send_command("-gdb-version").await.unwrap_err();
        assert!(matches!(err, GdbError::ProcessTerminated));
        assert_eq!(comm.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_results_are_routed_by_token() {
        let (comm, mut events) = GdbCommunication::new();
        let (stdin_ours, stdin_gdb) = duplex(4096);
        let (mut stdout_gdb, stdout_ours) = duplex(4096);
        comm.setup(stdin_ours, stdout_ours).await;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdin_gdb).lines();
            let first = lines.next_line().await.unwrap().unwrap();
            let second = lines.next_line().await.unwrap().unwrap();
            assert_eq!(first, "1-first");
            assert_eq!(second, "2-second");
            stdout_gdb
                .write_all(b"~\"chatter\\n\"\n*running,thread-id=\"all\"\n2^done,which=\"second\"\n1^error,msg=\"nope\"\n(gdb) \n")
                .await
                .unwrap();
        });

        let (first, second) = tokio::join!(comm.send_command("-first"), comm.send_command("-second"));

        match first {
            Err(GdbError::CommandError(msg)) => assert_eq!(msg, "nope"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(second.unwrap().get_str("which"), Some("second"));

        let console = events.console.recv().await.unwrap();
        assert_eq!(console.content, "chatter\n");
        let exec = events.exec.recv().await.unwrap();
        assert_eq!(exec.class, crate::types::AsyncClass::Running);
        comm.wait_ready().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_class_and_eof() {
        let (comm, _events) = GdbCommunication::new();
        let (stdin_ours, stdin_gdb) = duplex(4096);
        let (mut stdout_gdb, stdout_ours) = duplex(4096);
        comm.setup(stdin_ours, stdout_ours).await;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdin_gdb).lines();
            let _ = lines.next_line().await;
            stdout_gdb.write_all(b"99^done\n1^bogus,x=\"1\"\n").await.unwrap();
            let _ = lines.next_line().await;
            drop(stdout_gdb);
        });

        let err = comm.send_command("-one").await.unwrap_err();
        match err {
            GdbError::ProtocolError(msg) => assert!(msg.contains("bogus")),
            other => panic!("unexpected {:?}", other),
        }

        let err = comm.send_command("-two").await.unwrap_err();
        assert!(matches!(err, GdbError::ProcessTerminated));
    }
}
