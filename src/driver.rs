//! The non-blocking driver interface this crate sequences.
//!
//! The wire protocol, SQL text, and value conversion all live behind this
//! trait. The client layer only orders calls to these primitives against
//! socket readiness and timers: it never parses a byte of the protocol.
//!
//! The shape follows the classic asynchronous client API of a
//! request/response database: start a handshake and poll it forward, send a
//! command, flush, consume input on readability, and pull buffered results
//! until a `None` sentinel says the command is finished.

use std::future::Future;
use std::io;

use crate::error::{Error, Result};

/// Where a non-blocking connect/reset poll step wants to go next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStep {
    /// Wait until the socket is readable, then poll again.
    ReadWait,
    /// Wait until the socket is writable, then poll again.
    WriteWait,
    /// The handshake finished successfully.
    Ok,
    /// The handshake failed; see [`Driver::error_message`].
    Failed,
}

/// Connection status as the driver reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Ok,
    Bad,
}

/// Server-side transaction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    InError,
    Unknown,
}

impl TransactionStatus {
    /// True while a transaction block is open (healthy or failed).
    pub fn is_open(self) -> bool {
        matches!(
            self,
            TransactionStatus::InTransaction | TransactionStatus::InError
        )
    }
}

/// One logical command.
///
/// Every command flavor flows through the same send/pump/retry routine; the
/// driver is responsible for turning the variant into protocol messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Execute SQL text directly. May contain multiple statements.
    Query {
        sql: String,
        params: Vec<Option<String>>,
    },
    /// Create a named server-side prepared statement.
    Prepare { name: String, sql: String },
    /// Execute a previously prepared statement.
    ExecPrepared {
        name: String,
        params: Vec<Option<String>>,
    },
    /// Fetch the parameter/column description of a prepared statement.
    DescribePrepared { name: String },
}

/// An asynchronous server notice delivered outside the result stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
    pub backend_pid: i32,
}

/// Non-blocking primitives of the underlying database driver.
///
/// All methods except the readiness futures must return without blocking.
/// `finish` must be idempotent: the layer may call it again on an already
/// finalized driver during error unwinding.
pub trait Driver: Send + Sync + Sized + 'static {
    /// Connection parameters consumed by [`Driver::connect_start`].
    type Config: Clone + Send + Sync + 'static;

    /// One buffered command result (a statement's rows-plus-status, or a
    /// single row in single-row mode). Cheap to clone; wrap in `Arc` if the
    /// driver's native result is not.
    type Result: Clone + Send + 'static;

    /// Begin a connection attempt. The returned driver is not yet usable;
    /// drive it with [`Driver::connect_poll`].
    fn connect_start(config: &Self::Config) -> Result<Self>;

    /// Advance the connect handshake one step.
    fn connect_poll(&mut self) -> PollStep;

    /// Begin re-establishing the session on the same driver object.
    fn reset_start(&mut self) -> Result<()>;

    /// Advance the reset handshake one step.
    fn reset_poll(&mut self) -> PollStep;

    /// Close the socket and release driver resources. Idempotent.
    fn finish(&mut self);

    fn status(&self) -> ConnStatus;

    fn transaction_status(&self) -> TransactionStatus;

    /// Diagnostic text for the most recent driver-level failure.
    fn error_message(&self) -> String;

    /// Queue a command for transmission.
    fn send_command(&mut self, command: &Command) -> Result<()>;

    /// Push queued bytes toward the socket. Returns `true` once the
    /// outgoing buffer is empty, `false` if the socket would block.
    fn flush(&mut self) -> Result<bool>;

    /// Absorb whatever arrived on the socket without blocking.
    fn consume_input(&mut self) -> Result<()>;

    /// True while the next result is not yet fully buffered, i.e. while
    /// [`Driver::next_result`] would have to wait on the socket.
    fn is_busy(&self) -> bool;

    /// Next buffered result, or `None` once the current command has no
    /// further results.
    fn next_result(&mut self) -> Result<Option<Self::Result>>;

    /// Server-reported failure carried inside a result, if any.
    fn result_error(result: &Self::Result) -> Option<Error>;

    /// In single-row mode: true for an individual row result, false for
    /// the trailing per-statement status result.
    fn is_single_row(result: &Self::Result) -> bool;

    /// Ask the driver to deliver the current command row by row. Returns
    /// false if the mode could not be selected.
    fn set_single_row_mode(&mut self) -> bool;

    /// Pop a buffered asynchronous notification, if one arrived.
    fn take_notification(&mut self) -> Option<Notification>;

    /// Apply session defaults (e.g. client encoding) after a successful
    /// handshake.
    fn configure_defaults(&mut self) -> Result<()>;

    /// Resolves when the driver's socket is readable.
    fn wait_readable(&self) -> impl Future<Output = io::Result<()>> + Send;

    /// Resolves when the driver's socket is writable.
    fn wait_writable(&self) -> impl Future<Output = io::Result<()>> + Send;
}
