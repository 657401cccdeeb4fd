/// Debug Adapter Protocol front end for GDB
///
/// Reads DAP requests from a client, drives GDB through `gdbadapter`, and
/// reports GDB's asynchronous output back as DAP events.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;

use gdbadapter::GdbError;

pub mod config;
pub mod handles;
pub mod protocol;
pub mod pump;
pub mod session;
pub mod target;
pub mod transport;

pub use session::DebugSession;
pub use transport::{DapReader, DapWriter, EventSink};

#[derive(Error, Debug)]
pub enum DapError {
    #[error(transparent)]
    Gdb(#[from] GdbError),
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("DAP protocol error: {0}")]
    Protocol(String),
    #[error("{0}")]
    Request(String),
}

pub type Result<T> = std::result::Result<T, DapError>;

/// Serve one debug session over stdin/stdout
pub async fn run_stdio() -> Result<()> {
    run(tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve one debug session over an arbitrary stream pair
pub async fn run<R, W>(input: R, output: W) -> Result<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (sink, writer_task) = transport::spawn_writer(DapWriter::new(output));
    let session = DebugSession::new(sink);
    serve(session, input).await;

    // The writer finishes once every sink clone is gone
    let _ = writer_task.await;
    Ok(())
}

/// Read requests and hand them to the session one at a time
pub async fn serve<R>(mut session: DebugSession, input: R)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let (request_tx, mut request_rx) = mpsc::unbounded_channel();

    let reader_task = tokio::spawn(async move {
        let mut reader = DapReader::new(BufReader::new(input));
        loop {
            match reader.read_request().await {
                Ok(Some(request)) => {
                    if request_tx.send(request).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    log::debug!("DAP client closed the connection");
                    break;
                }
                Err(DapError::Json(e)) => log::warn!("Dropping malformed DAP message: {}", e),
                Err(e) => {
                    log::error!("DAP read failed: {}", e);
                    break;
                }
            }
        }
    });

    while let Some(request) = request_rx.recv().await {
        if !session.dispatch(request).await {
            break;
        }
    }

    reader_task.abort();
    session.shutdown().await;
}
