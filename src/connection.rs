//! Logical database session.
//!
//! This module provides the session type that handles:
//! - Non-blocking connect and reset handshakes
//! - Command dispatch through a single send/pump/retry routine
//! - Timeout-aborted sessions and explicit recovery
//! - Asynchronous notification delivery
//!
//! A [`Connection`] is a cheap-clone handle over shared session state. The
//! driver sits behind an async mutex held by the single active pump; all
//! other session state lives behind short-lived synchronous locks.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::{ConnectOptions, ReconnectHook};
use crate::driver::{Command, Driver, Notification, TransactionStatus};
use crate::error::{Error, ErrorKind, Result};
use crate::future::{promise, Completion};
use crate::pump::{
    pump_notifications, HandshakeKind, HandshakePump, PumpMode, ResultPump, RowConsumer,
};

// ============================================================================
// Session state
// ============================================================================

/// Connection status, including the layer's own aborted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Healthy and ready for commands.
    Ok,
    /// Unusable until a reset succeeds.
    Bad,
    /// A command deadline expired; an explicit reset is required.
    Aborted,
}

pub(crate) struct ConnState {
    status: SessionStatus,
    closed: bool,
    busy: bool,
    hook_scope: bool,
    resetting: bool,
    txn_status: TransactionStatus,
    txn_at_send: TransactionStatus,
    txn_depth: u32,
    notifications: VecDeque<Notification>,
}

/// Shared between the session handle and its active pump. The pump holds a
/// plain reference for its lifetime; ownership stays with the connection.
pub(crate) struct SessionShared {
    state: Mutex<ConnState>,
    reset_signal: Notify,
    notify_event: Notify,
}

impl SessionShared {
    pub(crate) fn reset_notified(&self) -> Notified<'_> {
        self.reset_signal.notified()
    }

    /// Why an in-flight pump should give up, if it should.
    pub(crate) fn abandon_reason(&self) -> Option<&'static str> {
        let st = self.state.lock();
        if st.closed {
            Some("connection is closed")
        } else if st.resetting {
            Some("command abandoned by connection reset")
        } else {
            None
        }
    }

    pub(crate) fn push_notification(&self, notification: Notification) {
        self.state.lock().notifications.push_back(notification);
        self.notify_event.notify_waiters();
    }

    fn pop_notification(&self) -> Option<Notification> {
        self.state.lock().notifications.pop_front()
    }

    fn signal_abandon(&self) {
        self.reset_signal.notify_waiters();
        // Parked notification waiters must re-check the session state too.
        self.notify_event.notify_waiters();
    }
}

/// Clears the busy flag when the owning operation finishes. `acquired` is
/// false for commands issued from inside a hook, which run in the enclosing
/// operation's slot.
struct BusyGuard<'a> {
    session: &'a SessionShared,
    acquired: bool,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        if self.acquired {
            self.session.state.lock().busy = false;
        }
    }
}

pub(crate) struct HookScopeGuard<'a> {
    session: &'a SessionShared,
}

impl Drop for HookScopeGuard<'_> {
    fn drop(&mut self) {
        self.session.state.lock().hook_scope = false;
    }
}

// ============================================================================
// Connection
// ============================================================================

struct ConnectionInner<D: Driver> {
    driver: AsyncMutex<D>,
    session: SessionShared,
    options: Mutex<ConnectOptions<D>>,
}

/// A logical database session.
///
/// Cloning is cheap and every clone refers to the same session. At most one
/// command is outstanding at a time; a second command issued before the
/// first settles fails with [`Error::Busy`].
pub struct Connection<D: Driver> {
    inner: Arc<ConnectionInner<D>>,
}

impl<D: Driver> Clone for Connection<D> {
    fn clone(&self) -> Self {
        Connection {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> std::fmt::Debug for Connection<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl<D: Driver> Connection<D> {
    /// Establish a new session, bounded by the configured connect timeout.
    pub async fn connect(config: D::Config, options: ConnectOptions<D>) -> Result<Self> {
        let connect_timeout = options.get_connect_timeout();
        let mut driver = D::connect_start(&config)?;
        let handshake = HandshakePump {
            driver: &mut driver,
            kind: HandshakeKind::Connect,
            timeout: connect_timeout,
        }
        .run()
        .await;
        if let Err(err) = handshake {
            // Finalize the half-open driver so the descriptor cannot leak.
            driver.finish();
            return Err(err);
        }
        let txn_status = driver.transaction_status();
        let conn = Connection {
            inner: Arc::new(ConnectionInner {
                driver: AsyncMutex::new(driver),
                session: SessionShared {
                    state: Mutex::new(ConnState {
                        status: SessionStatus::Ok,
                        closed: false,
                        busy: false,
                        hook_scope: false,
                        resetting: false,
                        txn_status,
                        txn_at_send: TransactionStatus::Idle,
                        txn_depth: 0,
                        notifications: VecDeque::new(),
                    }),
                    reset_signal: Notify::new(),
                    notify_event: Notify::new(),
                },
                options: Mutex::new(options),
            }),
        };
        if let Err(err) = conn.run_connect_hook().await {
            conn.close().await;
            return Err(err);
        }
        Ok(conn)
    }

    /// Callback flavor of [`Connection::connect`].
    pub fn connect_deferred(config: D::Config, options: ConnectOptions<D>) -> Completion<Self> {
        let (settle, completion) = promise();
        tokio::spawn(async move {
            settle.settle(Self::connect(config, options).await);
        });
        completion
    }

    /// Re-establish the session in place, abandoning any in-flight command.
    /// Identity is preserved: existing handles stay valid.
    pub async fn reset(&self) -> Result<()> {
        {
            let mut st = self.inner.session.state.lock();
            if st.closed {
                return Err(Error::ConnectionBad("connection is closed".to_string()));
            }
            st.resetting = true;
        }
        self.inner.session.signal_abandon();
        self.reset_driver().await?;
        self.run_connect_hook().await
    }

    /// Callback flavor of [`Connection::reset`].
    pub fn reset_deferred(&self) -> Completion<()> {
        let (settle, completion) = promise();
        let conn = self.clone();
        tokio::spawn(async move {
            settle.settle(conn.reset().await);
        });
        completion
    }

    /// Drive the reset handshake. Does not run the post-connect hook.
    pub(crate) async fn reset_driver(&self) -> Result<()> {
        let connect_timeout = self.inner.options.lock().get_connect_timeout();
        let mut driver = self.inner.driver.lock().await;
        driver.reset_start()?;
        let res = HandshakePump {
            driver: &mut *driver,
            kind: HandshakeKind::Reset,
            timeout: connect_timeout,
        }
        .run()
        .await;
        let mut st = self.inner.session.state.lock();
        st.resetting = false;
        match &res {
            Ok(()) => {
                st.status = SessionStatus::Ok;
                st.txn_status = driver.transaction_status();
                st.notifications.clear();
            }
            Err(_) => st.status = SessionStatus::Bad,
        }
        res
    }

    /// Terminate the session and release the driver. Idempotent.
    pub async fn close(&self) {
        {
            let mut st = self.inner.session.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
        }
        self.inner.session.signal_abandon();
        let mut driver = self.inner.driver.lock().await;
        driver.finish();
        self.inner.session.state.lock().status = SessionStatus::Bad;
    }

    // ========================================================================
    // Status surface
    // ========================================================================

    pub fn status(&self) -> SessionStatus {
        let st = self.inner.session.state.lock();
        if st.closed {
            SessionStatus::Bad
        } else {
            st.status
        }
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.inner.session.state.lock().txn_status
    }

    /// True while a command or notification wait is outstanding.
    pub fn is_busy(&self) -> bool {
        self.inner.session.state.lock().busy
    }

    /// True when both handles refer to the same session.
    pub fn same_session(&self, other: &Connection<D>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.inner.options.lock().get_query_timeout()
    }

    /// `Duration::ZERO` disables the command deadline.
    pub fn set_query_timeout(&self, timeout: Duration) {
        self.inner.options.lock().set_query_timeout(timeout);
    }

    pub fn set_async_autoreconnect(&self, enabled: bool) {
        self.inner.options.lock().set_autoreconnect(enabled);
    }

    // ========================================================================
    // Command surface
    // ========================================================================

    /// Execute SQL text and return the last statement's result.
    pub async fn exec(&self, sql: &str) -> Result<D::Result> {
        self.run(Command::Query {
            sql: sql.to_string(),
            params: Vec::new(),
        })
        .await
    }

    /// Callback flavor of [`Connection::exec`].
    pub fn exec_deferred(&self, sql: &str) -> Completion<D::Result> {
        self.run_deferred(Command::Query {
            sql: sql.to_string(),
            params: Vec::new(),
        })
    }

    /// Execute SQL text with positional parameters.
    pub async fn query(&self, sql: &str, params: Vec<Option<String>>) -> Result<D::Result> {
        self.run(Command::Query {
            sql: sql.to_string(),
            params,
        })
        .await
    }

    pub fn query_deferred(&self, sql: &str, params: Vec<Option<String>>) -> Completion<D::Result> {
        self.run_deferred(Command::Query {
            sql: sql.to_string(),
            params,
        })
    }

    /// Create a named server-side prepared statement.
    pub async fn prepare(&self, name: &str, sql: &str) -> Result<D::Result> {
        self.run(Command::Prepare {
            name: name.to_string(),
            sql: sql.to_string(),
        })
        .await
    }

    pub fn prepare_deferred(&self, name: &str, sql: &str) -> Completion<D::Result> {
        self.run_deferred(Command::Prepare {
            name: name.to_string(),
            sql: sql.to_string(),
        })
    }

    /// Execute a previously prepared statement.
    pub async fn exec_prepared(
        &self,
        name: &str,
        params: Vec<Option<String>>,
    ) -> Result<D::Result> {
        self.run(Command::ExecPrepared {
            name: name.to_string(),
            params,
        })
        .await
    }

    pub fn exec_prepared_deferred(
        &self,
        name: &str,
        params: Vec<Option<String>>,
    ) -> Completion<D::Result> {
        self.run_deferred(Command::ExecPrepared {
            name: name.to_string(),
            params,
        })
    }

    /// Fetch the description of a prepared statement.
    pub async fn describe_prepared(&self, name: &str) -> Result<D::Result> {
        self.run(Command::DescribePrepared {
            name: name.to_string(),
        })
        .await
    }

    pub fn describe_prepared_deferred(&self, name: &str) -> Completion<D::Result> {
        self.run_deferred(Command::DescribePrepared {
            name: name.to_string(),
        })
    }

    /// Run one command through the shared dispatch path.
    pub async fn run(&self, command: Command) -> Result<D::Result> {
        match self.run_command(command, None).await? {
            Some(result) => Ok(result),
            None => Err(Error::Protocol("command produced no result".to_string())),
        }
    }

    /// Callback flavor of [`Connection::run`].
    pub fn run_deferred(&self, command: Command) -> Completion<D::Result> {
        let (settle, completion) = promise();
        let conn = self.clone();
        tokio::spawn(async move {
            settle.settle(conn.run(command).await);
        });
        completion
    }

    /// Single-row streaming: `consumer` receives each row as it arrives;
    /// the next row is fetched only after the consumer returns. Resolves
    /// once the command's trailing status has been seen.
    pub async fn exec_each_row<F>(&self, sql: &str, consumer: F) -> Result<()>
    where
        F: FnMut(D::Result) + Send + 'static,
    {
        let mut consumer: RowConsumer<D> = Box::new(consumer);
        self.run_command(
            Command::Query {
                sql: sql.to_string(),
                params: Vec::new(),
            },
            Some(&mut consumer),
        )
        .await?;
        Ok(())
    }

    /// Callback flavor of [`Connection::exec_each_row`].
    pub fn exec_each_row_deferred<F>(&self, sql: &str, consumer: F) -> Completion<()>
    where
        F: FnMut(D::Result) + Send + 'static,
    {
        let (settle, completion) = promise();
        let conn = self.clone();
        let sql = sql.to_string();
        tokio::spawn(async move {
            settle.settle(conn.exec_each_row(&sql, consumer).await);
        });
        completion
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    /// Next asynchronous notification; suspends until one arrives. While a
    /// command is in flight its pump delivers notifications; otherwise a
    /// listen pump occupies the command slot.
    pub async fn wait_for_notification(&self) -> Result<Notification> {
        self.notification_loop().await
    }

    /// Like [`Connection::wait_for_notification`] with a deadline.
    pub async fn wait_for_notification_timeout(&self, timeout: Duration) -> Result<Notification> {
        match tokio::time::timeout(timeout, self.notification_loop()).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    async fn notification_loop(&self) -> Result<Notification> {
        loop {
            let session = &self.inner.session;
            let notified = session.notify_event.notified();
            tokio::pin!(notified);
            if let Some(notification) = session.pop_notification() {
                return Ok(notification);
            }
            let guard = {
                let mut st = session.state.lock();
                if st.closed {
                    return Err(Error::ConnectionBad("connection is closed".to_string()));
                }
                if st.status == SessionStatus::Aborted {
                    return Err(Error::Expired);
                }
                if st.busy {
                    None
                } else {
                    st.busy = true;
                    Some(BusyGuard {
                        session,
                        acquired: true,
                    })
                }
            };
            match guard {
                Some(_busy) => {
                    let mut driver = self.inner.driver.lock().await;
                    let res = pump_notifications(&mut *driver, session).await;
                    if let Err(err) = &res {
                        if err.is_disconnect() {
                            session.state.lock().status = SessionStatus::Bad;
                        }
                    }
                    res?;
                }
                // An active pump will deliver; wait for its wake.
                None => notified.await,
            }
        }
    }

    // ========================================================================
    // Dispatch internals
    // ========================================================================

    async fn run_command(
        &self,
        command: Command,
        mut consumer: Option<&mut RowConsumer<D>>,
    ) -> Result<Option<D::Result>> {
        let _busy = self.acquire_busy()?;
        self.run_with_policy(&command, &mut consumer).await
    }

    /// One attempt plus the reconnect policy. Resubmissions re-enter this
    /// routine, so repeated connection loss cascades are each gated on a
    /// fresh successful reset.
    pub(crate) fn run_with_policy<'a, 'c>(
        &'a self,
        command: &'a Command,
        consumer: &'a mut Option<&'c mut RowConsumer<D>>,
    ) -> BoxFuture<'a, Result<Option<D::Result>>>
    where
        'c: 'a,
    {
        Box::pin(async move {
            match self.run_attempt(command, consumer).await {
                Err(err)
                    if err.is_disconnect()
                        && self.autoreconnect_enabled()
                        && self.inner.session.abandon_reason().is_none() =>
                {
                    self.autoreconnect(command, consumer, err).await
                }
                other => other,
            }
        })
    }

    async fn run_attempt<'c>(
        &self,
        command: &Command,
        consumer: &mut Option<&'c mut RowConsumer<D>>,
    ) -> Result<Option<D::Result>> {
        let query_timeout = self.inner.options.lock().get_query_timeout();
        let mut driver = self.inner.driver.lock().await;
        self.inner.session.state.lock().txn_at_send = driver.transaction_status();
        let res = attempt_inner(
            &mut *driver,
            &self.inner.session,
            command,
            consumer,
            query_timeout,
        )
        .await;
        let mut st = self.inner.session.state.lock();
        st.txn_status = driver.transaction_status();
        match &res {
            Err(err) if err.kind() == ErrorKind::Timeout => {
                warn!(error = %err, "command expired, session aborted until reset");
                st.status = SessionStatus::Aborted;
            }
            Err(err) if err.is_disconnect() => st.status = SessionStatus::Bad,
            _ => {}
        }
        res
    }

    fn acquire_busy(&self) -> Result<BusyGuard<'_>> {
        let session = &self.inner.session;
        let mut st = session.state.lock();
        if st.closed {
            return Err(Error::ConnectionBad("connection is closed".to_string()));
        }
        if st.status == SessionStatus::Aborted {
            return Err(Error::Expired);
        }
        if st.busy {
            if st.hook_scope {
                // Hook-issued commands share the enclosing operation's slot.
                return Ok(BusyGuard {
                    session,
                    acquired: false,
                });
            }
            return Err(Error::Busy);
        }
        st.busy = true;
        Ok(BusyGuard {
            session,
            acquired: true,
        })
    }

    pub(crate) fn enter_hook_scope(&self) -> HookScopeGuard<'_> {
        self.inner.session.state.lock().hook_scope = true;
        HookScopeGuard {
            session: &self.inner.session,
        }
    }

    /// Invoke the post-connect hook, if any, and gate on its future.
    pub(crate) async fn run_connect_hook(&self) -> Result<()> {
        let hook = self.inner.options.lock().connect_hook();
        let Some(hook) = hook else {
            return Ok(());
        };
        let _scope = self.enter_hook_scope();
        let res = hook(self).await;
        if let Err(err) = &res {
            warn!(error = %err, "post-connect hook failed");
        }
        res
    }

    pub(crate) fn autoreconnect_enabled(&self) -> bool {
        self.inner.options.lock().autoreconnect_enabled()
    }

    pub(crate) fn autoreconnect_hook(&self) -> Option<ReconnectHook<D>> {
        self.inner.options.lock().autoreconnect_hook()
    }

    /// Transaction status snapshot taken when the last command was sent.
    pub(crate) fn txn_open_at_send(&self) -> bool {
        self.inner.session.state.lock().txn_at_send.is_open()
    }

    /// Enters one transaction nesting level; true at the outermost level.
    pub(crate) fn txn_depth_enter(&self) -> bool {
        let mut st = self.inner.session.state.lock();
        st.txn_depth += 1;
        st.txn_depth == 1
    }

    /// Leaves one transaction nesting level; true once fully unwound.
    pub(crate) fn txn_depth_exit(&self) -> bool {
        let mut st = self.inner.session.state.lock();
        st.txn_depth = st.txn_depth.saturating_sub(1);
        st.txn_depth == 0
    }
}

/// Send the command, switch modes, and pump it to completion.
async fn attempt_inner<'c, D: Driver>(
    driver: &mut D,
    session: &SessionShared,
    command: &Command,
    consumer: &mut Option<&'c mut RowConsumer<D>>,
    query_timeout: Option<Duration>,
) -> Result<Option<D::Result>> {
    debug!(single_row = consumer.is_some(), "dispatching command");
    driver.send_command(command)?;
    if consumer.is_some() && !driver.set_single_row_mode() {
        return Err(Error::Protocol(
            "driver refused single-row mode".to_string(),
        ));
    }
    let mode = match consumer {
        Some(consumer) => PumpMode::SingleRow(&mut **consumer),
        None => PumpMode::Aggregate,
    };
    ResultPump {
        driver,
        session,
        mode,
        query_timeout,
    }
    .run()
    .await
}
