//! Socket-driven state machines.
//!
//! A pump owns the driver for the duration of one operation and advances it
//! on every readiness notification: [`ResultPump`] drains a command to its
//! final result, [`HandshakePump`] drives a non-blocking connect or reset to
//! completion, and [`pump_notifications`] services a standalone notification
//! wait. Pumps never block and never recurse: readiness handling is a plain
//! loop, so rapid-fire events cannot grow the stack.

use std::pin::Pin;
use std::time::Duration;

use tokio::sync::futures::Notified;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::connection::SessionShared;
use crate::driver::{ConnStatus, Driver, PollStep};
use crate::error::{Error, Result};

/// Per-row consumer for single-row streaming. The pump pulls the next row
/// only after the consumer returns.
pub(crate) type RowConsumer<D> = Box<dyn FnMut(<D as Driver>::Result) + Send>;

/// How the pump treats intermediate results.
pub(crate) enum PumpMode<'c, D: Driver> {
    /// Keep only the most recent result; it settles the command.
    Aggregate,
    /// Hand each row to the consumer as it arrives; the trailing status
    /// result is swallowed.
    SingleRow(&'c mut RowConsumer<D>),
}

/// Drains one in-flight command to completion.
pub(crate) struct ResultPump<'a, 'c, D: Driver> {
    pub(crate) driver: &'a mut D,
    pub(crate) session: &'a SessionShared,
    pub(crate) mode: PumpMode<'c, D>,
    pub(crate) query_timeout: Option<Duration>,
}

impl<'a, 'c, D: Driver> ResultPump<'a, 'c, D> {
    /// Run until the command's final result, an error, a timeout, or an
    /// abandon signal. Returns the retained result in aggregate mode,
    /// `None` in single-row mode.
    pub(crate) async fn run(self) -> Result<Option<D::Result>> {
        let ResultPump {
            driver,
            session,
            mut mode,
            query_timeout,
        } = self;

        let reset_evt = session.reset_notified();
        tokio::pin!(reset_evt);
        let mut last_activity = Instant::now();

        // Push the remaining command bytes out before draining.
        while !driver.flush()? {
            wait_ready(
                &*driver,
                session,
                true,
                reset_evt.as_mut(),
                &mut last_activity,
                query_timeout,
            )
            .await?;
        }

        let mut retained: Option<D::Result> = None;
        loop {
            if let Some(reason) = session.abandon_reason() {
                return Err(Error::ConnectionBad(reason.to_string()));
            }
            driver.consume_input()?;
            while let Some(notification) = driver.take_notification() {
                session.push_notification(notification);
            }
            while !driver.is_busy() {
                match driver.next_result()? {
                    Some(result) => match &mut mode {
                        PumpMode::Aggregate => retained = Some(result),
                        PumpMode::SingleRow(consumer) => {
                            if D::is_single_row(&result) {
                                consumer(result);
                            } else if let Some(err) = D::result_error(&result) {
                                return Err(err);
                            }
                        }
                    },
                    None => {
                        // End-of-command sentinel.
                        return match mode {
                            PumpMode::Aggregate => match retained {
                                Some(result) => match D::result_error(&result) {
                                    Some(err) => Err(err),
                                    None => Ok(Some(result)),
                                },
                                None => Err(Error::ConnectionBad(driver.error_message())),
                            },
                            PumpMode::SingleRow(_) => Ok(None),
                        };
                    }
                }
            }
            wait_ready(
                &*driver,
                session,
                false,
                reset_evt.as_mut(),
                &mut last_activity,
                query_timeout,
            )
            .await?;
        }
    }
}

/// Which half of the handshake family to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeKind {
    Connect,
    Reset,
}

/// Drives a non-blocking connect or reset to completion.
pub(crate) struct HandshakePump<'a, D: Driver> {
    pub(crate) driver: &'a mut D,
    pub(crate) kind: HandshakeKind,
    pub(crate) timeout: Option<Duration>,
}

impl<'a, D: Driver> HandshakePump<'a, D> {
    pub(crate) async fn run(self) -> Result<()> {
        let HandshakePump {
            driver,
            kind,
            timeout,
        } = self;

        let steps = async {
            loop {
                let step = match kind {
                    HandshakeKind::Connect => driver.connect_poll(),
                    HandshakeKind::Reset => driver.reset_poll(),
                };
                match step {
                    PollStep::Ok => {
                        if driver.status() != ConnStatus::Ok {
                            return Err(Error::ConnectionBad(driver.error_message()));
                        }
                        driver.configure_defaults()?;
                        return Ok(());
                    }
                    PollStep::Failed => {
                        return Err(Error::ConnectionBad(driver.error_message()));
                    }
                    PollStep::ReadWait => driver.wait_readable().await.map_err(Error::from)?,
                    PollStep::WriteWait => driver.wait_writable().await.map_err(Error::from)?,
                }
            }
        };

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, steps).await {
                Ok(res) => res,
                Err(_) => {
                    debug!(?kind, "handshake deadline elapsed");
                    Err(Error::Timeout(limit))
                }
            },
            None => steps.await,
        }
    }
}

/// Services a standalone notification wait: consumes input on readability
/// and returns once at least one notification has been delivered to the
/// session buffer.
pub(crate) async fn pump_notifications<D: Driver>(
    driver: &mut D,
    session: &SessionShared,
) -> Result<()> {
    let reset_evt = session.reset_notified();
    tokio::pin!(reset_evt);
    let mut last_activity = Instant::now();
    loop {
        if let Some(reason) = session.abandon_reason() {
            return Err(Error::ConnectionBad(reason.to_string()));
        }
        driver.consume_input()?;
        let mut delivered = false;
        while let Some(notification) = driver.take_notification() {
            session.push_notification(notification);
            delivered = true;
        }
        if delivered {
            return Ok(());
        }
        wait_ready(
            &*driver,
            session,
            false,
            reset_evt.as_mut(),
            &mut last_activity,
            None,
        )
        .await?;
    }
}

/// Wait for socket readiness, the abandon signal, or the quiet-interval
/// deadline, whichever comes first.
///
/// The deadline is measured from the last readiness notification, not from
/// pump start. A timer firing early relative to the last activity (a
/// timer/readiness race) re-arms for the remainder instead of failing.
async fn wait_ready<D: Driver>(
    driver: &D,
    session: &SessionShared,
    want_write: bool,
    mut reset_evt: Pin<&mut Notified<'_>>,
    last_activity: &mut Instant,
    limit: Option<Duration>,
) -> Result<()> {
    loop {
        let deadline = limit.map(|l| *last_activity + l);
        tokio::select! {
            _ = reset_evt.as_mut() => {
                let reason = session.abandon_reason().unwrap_or("connection reset");
                return Err(Error::ConnectionBad(reason.to_string()));
            }
            res = async {
                if want_write {
                    driver.wait_writable().await
                } else {
                    driver.wait_readable().await
                }
            } => {
                res?;
                *last_activity = Instant::now();
                return Ok(());
            }
            _ = sleep_or_never(deadline) => {
                if let Some(limit) = limit {
                    if last_activity.elapsed() >= limit {
                        debug!(?limit, "command quiet interval exceeded");
                        return Err(Error::Timeout(limit));
                    }
                }
            }
        }
    }
}

async fn sleep_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
