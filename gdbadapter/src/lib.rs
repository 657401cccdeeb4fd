/// GDB adapter library
///
/// This crate drives a GDB subprocess over GDB/MI (Machine Interface): it
/// parses MI output, correlates commands with their results, tracks
/// execution state, and implements the stateful pieces a debug adapter needs
/// on top (breakpoint reconciliation, variable objects, disassembly windows).

use thiserror::Error;

pub mod backend;
pub mod breakpoints;
pub mod commands;
pub mod communication;
pub mod disassembly;
pub mod events;
pub mod memory;
pub mod parser;
pub mod process;
pub mod types;
pub mod varobj;

pub use backend::*;
pub use communication::{GdbCommunication, GdbEvents};
pub use parser::*;
pub use types::*;

#[derive(Error, Debug)]
pub enum GdbError {
    #[error("Failed to start GDB process: {0}")]
    ProcessStartError(#[from] std::io::Error),
    #[error("{0}")]
    CommandError(String),
    #[error("Failed to parse GDB output: {0}")]
    ParseError(String),
    #[error("GDB process terminated unexpectedly")]
    ProcessTerminated,
    #[error("Communication error: {0}")]
    CommunicationError(String),
    #[error("GDB protocol error: {0}")]
    ProtocolError(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("{0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, GdbError>;
