/// DAP framing: `Content-Length` headers followed by a JSON payload

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{DapEvent, DapRequest, DapResponse};
use crate::{DapError, Result};

pub struct DapReader<R> {
    reader: R,
}

impl<R: AsyncBufRead + Unpin> DapReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read one framed message; `None` on a clean end of stream
    pub async fn read_message(&mut self) -> Result<Option<Value>> {
        let mut content_length: Option<usize> = None;
        let mut saw_header = false;
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                if saw_header {
                    return Err(DapError::Protocol("connection closed inside a header".into()));
                }
                return Ok(None);
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                if saw_header {
                    break;
                }
                continue;
            }
            saw_header = true;
            if let Some(v) = line.strip_prefix("Content-Length:") {
                content_length = Some(
                    v.trim()
                        .parse()
                        .map_err(|_| DapError::Protocol(format!("bad Content-Length: {}", v.trim())))?,
                );
            }
        }

        let len = content_length.ok_or_else(|| DapError::Protocol("Missing Content-Length header".into()))?;
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).await?;
        log::trace!("DAP <- {}", String::from_utf8_lossy(&buf));
        Ok(Some(serde_json::from_slice(&buf)?))
    }

    pub async fn read_request(&mut self) -> Result<Option<DapRequest>> {
        match self.read_message().await? {
            Some(message) => Ok(Some(serde_json::from_value(message)?)),
            None => Ok(None),
        }
    }
}

pub struct DapWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> DapWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_message<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        log::trace!("DAP -> {}", String::from_utf8_lossy(&payload));
        self.writer
            .write_all(format!("Content-Length: {}\r\n\r\n", payload.len()).as_bytes())
            .await?;
        self.writer.write_all(&payload).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[derive(Debug)]
enum Outgoing {
    Response(DapResponse),
    Event(DapEvent),
}

/// Cloneable handle for queueing responses and events to the client
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl EventSink {
    pub fn respond(&self, response: DapResponse) {
        if self.tx.send(Outgoing::Response(response)).is_err() {
            log::warn!("DAP writer gone, dropping response");
        }
    }

    pub fn event(&self, event: &'static str, body: Option<Value>) {
        let event = DapEvent {
            seq: 0,
            r#type: "event",
            event,
            body,
        };
        if self.tx.send(Outgoing::Event(event)).is_err() {
            log::warn!("DAP writer gone, dropping event");
        }
    }

    pub fn output(&self, category: &str, output: &str) {
        self.event("output", Some(json!({ "category": category, "output": output })));
    }
}

/// Start the task that numbers and writes outgoing messages
pub fn spawn_writer<W>(mut writer: DapWriter<W>) -> (EventSink, JoinHandle<()>)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        let mut seq = 0i64;
        while let Some(message) = rx.recv().await {
            seq += 1;
            let written = match message {
                Outgoing::Response(mut response) => {
                    response.seq = seq;
                    writer.write_message(&response).await
                }
                Outgoing::Event(mut event) => {
                    event.seq = seq;
                    writer.write_message(&event).await
                }
            };
            if let Err(e) = written {
                log::error!("Failed to write DAP message: {}", e);
                break;
            }
        }
        log::debug!("DAP writer finished");
    });
    (EventSink { tx }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, BufReader};

    #[tokio::test]
    async fn test_read_framed_request() {
        let body = r#"{"seq":1,"type":"request","command":"initialize","arguments":{"adapterID":"gdb"}}"#;
        let framed = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
        let mut reader = DapReader::new(BufReader::new(framed.as_bytes()));

        let request = reader.read_request().await.unwrap().unwrap();
        assert_eq!(request.seq, 1);
        assert_eq!(request.command, "initialize");
        assert_eq!(request.arguments["adapterID"], "gdb");
        assert!(reader.read_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_length_is_rejected() {
        let mut reader = DapReader::new(BufReader::new(&b"Content-Type: json\r\n\r\n{}"[..]));
        assert!(matches!(reader.read_message().await, Err(DapError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_writer_numbers_messages() {
        let (ours, theirs) = duplex(4096);
        let (sink, task) = spawn_writer(DapWriter::new(ours));
        sink.event("initialized", None);
        sink.output("console", "hello\n");
        drop(sink);
        task.await.unwrap();

        let mut reader = DapReader::new(BufReader::new(theirs));
        let first = reader.read_message().await.unwrap().unwrap();
        let second = reader.read_message().await.unwrap().unwrap();
        assert_eq!(first["seq"], 1);
        assert_eq!(first["event"], "initialized");
        assert_eq!(second["seq"], 2);
        assert_eq!(second["body"]["output"], "hello\n");
    }
}
