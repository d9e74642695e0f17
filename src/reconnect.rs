//! Automatic reconnect-and-resubmit policy.
//!
//! Consulted when a command fails with an error that means the connection
//! itself is gone. The policy resets the session in place and decides —
//! from the configured hook and the transaction state captured at
//! command-send time — whether the failed command is resubmitted or the
//! failure surfaces to the caller.

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::driver::{Command, Driver};
use crate::error::{Error, Result};
use crate::pump::RowConsumer;

/// What an `on_autoreconnect` hook wants done with the failed command.
pub enum HookOutcome {
    /// Resubmit the failed command over the fresh session.
    Retry,
    /// Keep the original error; no resubmission.
    Abort,
    /// Surface this error instead of the original one.
    Fail(Error),
    /// Wait for the future first: resubmit on its success, surface its
    /// error on failure.
    Deferred(BoxFuture<'static, Result<()>>),
}

impl<D: Driver> Connection<D> {
    pub(crate) async fn autoreconnect<'c>(
        &self,
        command: &Command,
        consumer: &mut Option<&'c mut RowConsumer<D>>,
        original: Error,
    ) -> Result<Option<D::Result>> {
        let was_in_transaction = self.txn_open_at_send();
        warn!(error = %original, "connection lost, attempting automatic reset");

        // A failed reset surfaces its own error, not the original one.
        self.reset_driver().await?;
        self.run_connect_hook().await?;

        let outcome = match self.autoreconnect_hook() {
            None => HookOutcome::Retry,
            Some(hook) => {
                let _scope = self.enter_hook_scope();
                match hook(self, &original) {
                    HookOutcome::Deferred(deferred) => match deferred.await {
                        Ok(()) => HookOutcome::Retry,
                        Err(err) => HookOutcome::Fail(err),
                    },
                    other => other,
                }
            }
        };

        match outcome {
            HookOutcome::Abort => Err(original),
            HookOutcome::Fail(err) => Err(err),
            HookOutcome::Retry | HookOutcome::Deferred(_) => {
                if was_in_transaction {
                    // The transaction died with the old session; resubmitting
                    // a fragment of it would be silent corruption.
                    debug!("transaction was open at send time, surfacing original error");
                    return Err(original);
                }
                debug!("resubmitting command after successful reset");
                self.run_with_policy(command, consumer).await
            }
        }
    }
}
