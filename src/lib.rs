//! Non-blocking database client layer.
//!
//! This crate runs commands over a single persistent connection without
//! ever blocking the runtime thread, recovers transparently from connection
//! loss, and multiplexes many logical callers over a small set of physical
//! connections. The wire protocol itself lives behind the [`Driver`] trait:
//! this layer only sequences the driver's non-blocking primitives against
//! socket readiness and timers.
//!
//! Architecture:
//! - `driver`: the non-blocking driver interface the layer consumes
//! - `future`: one-shot settleable results with callbacks and `.await`
//! - `pump`: readiness-driven command and handshake state machines
//! - `connection`: session handle, dispatch, reset, notifications
//! - `reconnect`: transaction-aware reconnect-and-resubmit policy
//! - `pool`: context-keyed pool with FIFO-fair waiting
//! - `config`: connection options and hooks
//! - `error`: the error taxonomy shared by all of the above

pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod future;
pub mod pool;
pub mod reconnect;

mod pump;


pub use config::{ConnectHook, ConnectOptions, ReconnectHook};
pub use connection::{Connection, SessionStatus};
pub use driver::{Command, ConnStatus, Driver, Notification, PollStep, TransactionStatus};
pub use error::{Error, ErrorKind, Result};
pub use future::{promise, Completion, Promise};
pub use pool::{ConnectionFactory, Pool, PoolContext, PoolOptions};
pub use reconnect::HookOutcome;
