//! Connection pool.
//!
//! This module multiplexes many logical callers over a bounded set of
//! sessions. Reservations are keyed by an explicit [`PoolContext`] handle,
//! which makes nested acquisition (transaction scoping) reentrant: the same
//! context always gets its already-reserved connection back. Contexts that
//! find the pool exhausted suspend in FIFO order and are handed the next
//! released connection directly.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::driver::{Driver, TransactionStatus};
use crate::error::{ErrorKind, Result};

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Upper bound on live connections.
    pub max_size: usize,
    /// Connections pre-established at pool construction.
    pub min_size: usize,
    /// Error kind after which the reserved connection is replaced instead
    /// of returned to the idle list.
    pub disconnect_kind: ErrorKind,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolOptions {
    pub fn new() -> Self {
        Self {
            max_size: 4,
            min_size: 0,
            disconnect_kind: ErrorKind::ConnectionBad,
        }
    }

    pub fn max_size(mut self, max: usize) -> Self {
        self.max_size = max;
        self
    }

    pub fn min_size(mut self, min: usize) -> Self {
        self.min_size = min;
        self
    }

    pub fn disconnect_kind(mut self, kind: ErrorKind) -> Self {
        self.disconnect_kind = kind;
        self
    }
}

// ============================================================================
// Caller context
// ============================================================================

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one logical caller.
///
/// Passed explicitly through `acquire`/`execute`/`transaction` so nesting is
/// visible in the call chain rather than inferred from ambient state.
#[derive(Debug)]
pub struct PoolContext {
    id: u64,
}

impl PoolContext {
    pub fn new() -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Default for PoolContext {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Async factory producing fresh sessions for the pool.
pub type ConnectionFactory<D> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Connection<D>>> + Send + Sync>;

struct PoolState<D: Driver> {
    available: Vec<Connection<D>>,
    reserved: HashMap<u64, Connection<D>>,
    pending: VecDeque<(u64, oneshot::Sender<()>)>,
    /// Live connections plus in-flight factory calls.
    total: usize,
}

struct PoolInner<D: Driver> {
    state: Mutex<PoolState<D>>,
    options: PoolOptions,
    factory: ConnectionFactory<D>,
}

/// A connection pool over one driver type.
pub struct Pool<D: Driver> {
    inner: Arc<PoolInner<D>>,
}

impl<D: Driver> Clone for Pool<D> {
    fn clone(&self) -> Self {
        Pool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> Pool<D> {
    /// Create a pool, pre-establishing `min_size` connections.
    pub async fn connect<F, Fut>(options: PoolOptions, factory: F) -> Result<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Connection<D>>> + Send + 'static,
    {
        let factory: ConnectionFactory<D> = Arc::new(move || Box::pin(factory()));
        let pool = Pool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    available: Vec::new(),
                    reserved: HashMap::new(),
                    pending: VecDeque::new(),
                    total: 0,
                }),
                options,
                factory,
            }),
        };
        let warm = pool.inner.options.min_size.min(pool.inner.options.max_size);
        for _ in 0..warm {
            let conn = (pool.inner.factory)().await?;
            let mut st = pool.inner.state.lock();
            st.available.push(conn);
            st.total += 1;
        }
        Ok(pool)
    }

    /// Reserve a connection for `context`.
    ///
    /// Reentrant: a context that already holds a reservation gets the same
    /// connection back. With the pool exhausted the caller suspends until a
    /// release hands it a connection, FIFO among waiters.
    pub async fn acquire(&self, context: &PoolContext) -> Result<Connection<D>> {
        enum Plan {
            Grow,
            Wait(oneshot::Receiver<()>),
        }
        loop {
            let plan = {
                let mut st = self.inner.state.lock();
                if let Some(conn) = st.reserved.get(&context.id) {
                    return Ok(conn.clone());
                }
                if let Some(conn) = st.available.pop() {
                    st.reserved.insert(context.id, conn.clone());
                    return Ok(conn);
                }
                if st.total < self.inner.options.max_size {
                    // Claim the slot before awaiting the factory.
                    st.total += 1;
                    Plan::Grow
                } else {
                    let (tx, rx) = oneshot::channel();
                    st.pending.push_back((context.id, tx));
                    Plan::Wait(rx)
                }
            };
            match plan {
                Plan::Grow => match (self.inner.factory)().await {
                    Ok(conn) => {
                        let total = {
                            let mut st = self.inner.state.lock();
                            st.reserved.insert(context.id, conn.clone());
                            st.total
                        };
                        debug!(total, "pool grew by one connection");
                        return Ok(conn);
                    }
                    Err(err) => {
                        let mut st = self.inner.state.lock();
                        st.total -= 1;
                        // The freed slot may let a waiting context grow.
                        wake_one(&mut st.pending);
                        return Err(err);
                    }
                },
                Plan::Wait(rx) => {
                    let _ = rx.await;
                }
            }
        }
    }

    /// Return `context`'s reservation, handing it to the longest-waiting
    /// context if any. The woken caller resumes on a later scheduler tick.
    pub fn release(&self, context: &PoolContext) {
        let mut st = self.inner.state.lock();
        let Some(conn) = st.reserved.remove(&context.id) else {
            return;
        };
        loop {
            match st.pending.pop_front() {
                Some((waiter, tx)) => {
                    st.reserved.insert(waiter, conn.clone());
                    if tx.send(()).is_ok() {
                        return;
                    }
                    // Waiter abandoned its acquire; try the next one.
                    st.reserved.remove(&waiter);
                }
                None => {
                    st.available.push(conn);
                    return;
                }
            }
        }
    }

    /// Acquire, run `body` against the connection, release.
    ///
    /// An error matching the configured disconnect kind replaces the
    /// reserved connection in place, so a broken connection never returns
    /// to the idle list. Nested calls (same context) leave the reservation
    /// to the outermost scope's release.
    pub async fn execute<T, F, Fut>(&self, context: &PoolContext, body: F) -> Result<T>
    where
        F: FnOnce(Connection<D>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let nested = self.is_reserved(context);
        let conn = self.acquire(context).await?;
        let out = body(conn.clone()).await;
        if let Err(err) = &out {
            if err.kind() == self.inner.options.disconnect_kind {
                self.replace_reserved(context, conn).await;
            }
        }
        if !nested {
            self.release(context);
        }
        out
    }

    /// Scoped transaction. `BEGIN` is issued only at the outermost nesting
    /// level for the reserved connection; at that level's exit the
    /// transaction is committed or rolled back based on both the body's
    /// outcome and the live transaction status (which covers a body that
    /// finished the transaction itself).
    pub async fn transaction<T, F, Fut>(&self, context: &PoolContext, body: F) -> Result<T>
    where
        F: FnOnce(Connection<D>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute(context, |conn| async move {
            let outermost = conn.txn_depth_enter();
            if outermost {
                if let Err(err) = conn.exec("BEGIN").await {
                    conn.txn_depth_exit();
                    return Err(err);
                }
            }
            let out = body(conn.clone()).await;
            let unwound = conn.txn_depth_exit();
            if unwound {
                match (&out, conn.transaction_status()) {
                    (Ok(_), TransactionStatus::InTransaction) => {
                        conn.exec("COMMIT").await?;
                    }
                    (Ok(_), TransactionStatus::InError) => {
                        // The body swallowed a failed statement; unwind it.
                        conn.exec("ROLLBACK").await?;
                    }
                    (Ok(_), _) => {}
                    (Err(_), status) if status.is_open() => {
                        let _ = conn.exec("ROLLBACK").await;
                    }
                    (Err(_), _) => {}
                }
            }
            out
        })
        .await
    }

    /// Execute SQL text on a pooled connection.
    pub async fn exec(&self, context: &PoolContext, sql: &str) -> Result<D::Result> {
        let sql = sql.to_string();
        self.execute(context, move |conn| async move { conn.exec(&sql).await })
            .await
    }

    /// Execute parameterized SQL text on a pooled connection.
    pub async fn query(
        &self,
        context: &PoolContext,
        sql: &str,
        params: Vec<Option<String>>,
    ) -> Result<D::Result> {
        let sql = sql.to_string();
        self.execute(context, move |conn| async move {
            conn.query(&sql, params).await
        })
        .await
    }

    /// Close every idle connection. Reserved connections close when their
    /// contexts release and the pool is dropped.
    pub async fn close(&self) {
        let connections = {
            let mut st = self.inner.state.lock();
            st.total -= st.available.len();
            std::mem::take(&mut st.available)
        };
        for conn in connections {
            conn.close().await;
        }
    }

    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().available.len()
    }

    pub fn reserved_count(&self) -> usize {
        self.inner.state.lock().reserved.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Live connections plus in-flight factory calls.
    pub fn size(&self) -> usize {
        self.inner.state.lock().total
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    fn is_reserved(&self, context: &PoolContext) -> bool {
        self.inner.state.lock().reserved.contains_key(&context.id)
    }

    /// Swap a broken reserved connection for a fresh one. On factory
    /// failure the reservation is dropped and the pool shrinks; the body's
    /// original error still surfaces to the caller.
    async fn replace_reserved(&self, context: &PoolContext, broken: Connection<D>) {
        warn!("replacing broken pooled connection");
        match (self.inner.factory)().await {
            Ok(fresh) => {
                self.inner.state.lock().reserved.insert(context.id, fresh);
            }
            Err(err) => {
                warn!(error = %err, "replacement connection failed, shrinking pool");
                let mut st = self.inner.state.lock();
                st.reserved.remove(&context.id);
                st.total -= 1;
                wake_one(&mut st.pending);
            }
        }
        // Finalize the broken session off the caller's path.
        tokio::spawn(async move {
            broken.close().await;
        });
    }
}

fn wake_one(pending: &mut VecDeque<(u64, oneshot::Sender<()>)>) {
    while let Some((_, tx)) = pending.pop_front() {
        if tx.send(()).is_ok() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_options_builder() {
        let options = PoolOptions::new()
            .max_size(8)
            .min_size(2)
            .disconnect_kind(ErrorKind::Protocol);

        assert_eq!(options.max_size, 8);
        assert_eq!(options.min_size, 2);
        assert_eq!(options.disconnect_kind, ErrorKind::Protocol);
    }

    #[test]
    fn test_contexts_are_distinct() {
        let a = PoolContext::new();
        let b = PoolContext::new();
        assert_ne!(a.id, b.id);
    }
}
