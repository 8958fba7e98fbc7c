//! Bounded async resource pool with FIFO waiters and an acquire timeout.
//!
//! Slots move between three places: the idle queue, a caller's
//! [`PooledConnection`], or a waiter's oneshot channel. Every move happens
//! under the pool mutex, which is what makes the timeout race deterministic:
//! a waiter that times out checks, under the lock, whether a slot was already
//! sent to it. If so it keeps the slot; if not it leaves the queue, and any
//! slot freed afterwards goes to the next waiter or back to idle.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::manager::ManageConnection;
use crate::config::PoolConfig;
use crate::error::{GuardError, Result};

struct Slot<C> {
    id: u64,
    conn: C,
}

struct Waiter<C> {
    id: u64,
    tx: oneshot::Sender<Slot<C>>,
}

struct PoolInner<C> {
    idle: VecDeque<Slot<C>>,
    waiters: VecDeque<Waiter<C>>,
    leased: usize,
    creating: usize,
    next_slot_id: u64,
    next_waiter_id: u64,
    closed: bool,
}

impl<C> PoolInner<C> {
    fn total(&self) -> usize {
        self.idle.len() + self.leased + self.creating
    }

    fn slot_id(&mut self) -> u64 {
        let id = self.next_slot_id;
        self.next_slot_id += 1;
        id
    }

    /// Give `slot` to the oldest waiter still listening, else park it idle.
    fn hand_off(&mut self, mut slot: Slot<C>) {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.tx.send(slot) {
                Ok(()) => {
                    self.leased += 1;
                    return;
                }
                Err(returned) => slot = returned,
            }
        }
        self.idle.push_back(slot);
    }

    fn remove_waiter(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == id) {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }
}

struct Shared<M: ManageConnection> {
    manager: M,
    config: PoolConfig,
    inner: Mutex<PoolInner<M::Connection>>,
}

impl<M: ManageConnection> Shared<M> {
    fn lock(&self) -> MutexGuard<'_, PoolInner<M::Connection>> {
        self.inner.lock().expect("pool lock poisoned")
    }

    /// Take a leased slot back. Returns it when it must be destroyed.
    fn check_in(&self, slot: Slot<M::Connection>, healthy: bool) -> Option<Slot<M::Connection>> {
        let healthy = healthy && self.manager.is_valid(&slot.conn);
        let mut inner = self.lock();
        inner.leased -= 1;
        if healthy && !inner.closed {
            inner.hand_off(slot);
            None
        } else {
            Some(slot)
        }
    }

    /// Destroy a slot, then open a replacement if someone is waiting for one.
    async fn retire(self: &Arc<Self>, slot: Slot<M::Connection>) {
        debug!(slot = slot.id, "Destroying pooled connection");
        self.manager.destroy(slot.conn).await;
        self.replenish().await;
    }

    async fn replenish(self: &Arc<Self>) {
        let id = {
            let mut inner = self.lock();
            if inner.closed || inner.waiters.is_empty() || inner.total() >= self.config.max {
                return;
            }
            inner.creating += 1;
            inner.slot_id()
        };
        self.open_for_waiters(id).await;
    }

    /// Open a connection against capacity already counted in `creating` and
    /// hand it to the oldest waiter, or park it idle if none is left.
    async fn open_for_waiters(&self, id: u64) {
        let reservation = Reservation::new(self);

        match self.manager.create().await {
            Ok(conn) => {
                let orphan = {
                    let mut inner = self.lock();
                    reservation.settle(&mut inner);
                    if inner.closed {
                        Some(conn)
                    } else {
                        inner.hand_off(Slot { id, conn });
                        None
                    }
                };
                if let Some(conn) = orphan {
                    self.manager.destroy(conn).await;
                }
            }
            Err(e) => warn!(error = %e, "Failed to open replacement connection"),
        }
    }
}

/// Capacity held while a connection is being created. Released on drop so a
/// cancelled `create` never leaks a slot.
struct Reservation<'a, M: ManageConnection> {
    shared: &'a Shared<M>,
    settled: bool,
}

impl<'a, M: ManageConnection> Reservation<'a, M> {
    fn new(shared: &'a Shared<M>) -> Self {
        Self {
            shared,
            settled: false,
        }
    }

    fn settle(mut self, inner: &mut PoolInner<M::Connection>) {
        inner.creating -= 1;
        self.settled = true;
    }
}

impl<M: ManageConnection> Drop for Reservation<'_, M> {
    fn drop(&mut self) {
        if !self.settled {
            self.shared.lock().creating -= 1;
        }
    }
}

/// A queued `acquire`. If the future is dropped before it settles, the
/// waiter leaves the queue and any slot already sent to it is passed on.
struct PendingAcquire<'a, M: ManageConnection> {
    shared: &'a Shared<M>,
    id: u64,
    rx: oneshot::Receiver<Slot<M::Connection>>,
    settled: bool,
}

impl<M: ManageConnection> PendingAcquire<'_, M> {
    fn on_timeout(&mut self, started: Instant) -> Result<Slot<M::Connection>> {
        let shared = self.shared;
        let mut inner = shared.lock();
        self.settled = true;
        if inner.remove_waiter(self.id) {
            return Err(GuardError::PoolExhausted {
                waited: started.elapsed(),
            });
        }
        // No longer queued: a slot was sent just before the timer won the
        // race, or the pool closed.
        match self.rx.try_recv() {
            Ok(slot) => Ok(slot),
            Err(_) => Err(GuardError::PoolClosed),
        }
    }
}

impl<M: ManageConnection> Drop for PendingAcquire<'_, M> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let shared = self.shared;
        let mut inner = shared.lock();
        if !inner.remove_waiter(self.id) {
            if let Ok(slot) = self.rx.try_recv() {
                inner.leased -= 1;
                inner.hand_off(slot);
            }
        }
    }
}

enum AcquireStep<C> {
    Create(u64),
    Wait {
        id: u64,
        rx: oneshot::Receiver<Slot<C>>,
        open: Option<u64>,
    },
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    pub idle: usize,
    pub leased: usize,
    pub creating: usize,
    pub waiting: usize,
    pub total: usize,
    pub max: usize,
    pub closed: bool,
}

/// Generic connection pool. Cheap to clone; clones share the same slots.
pub struct Pool<M: ManageConnection> {
    shared: Arc<Shared<M>>,
}

impl<M: ManageConnection> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: ManageConnection> Pool<M> {
    /// Build a pool and open `config.min` connections up front.
    ///
    /// Warm-up failures are logged; the pool starts with whatever it could
    /// open and creates the rest on demand.
    pub async fn new(manager: M, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let pool = Self {
            shared: Arc::new(Shared {
                manager,
                config,
                inner: Mutex::new(PoolInner {
                    idle: VecDeque::new(),
                    waiters: VecDeque::new(),
                    leased: 0,
                    creating: 0,
                    next_slot_id: 1,
                    next_waiter_id: 1,
                    closed: false,
                }),
            }),
        };

        for _ in 0..pool.shared.config.min {
            match pool.shared.manager.create().await {
                Ok(conn) => {
                    let mut inner = pool.shared.lock();
                    let id = inner.slot_id();
                    inner.idle.push_back(Slot { id, conn });
                    drop(inner);
                }
                Err(e) => {
                    warn!(error = %e, "Pool warm-up connection failed");
                    break;
                }
            }
        }
        debug!(
            idle = pool.state().idle,
            min = pool.shared.config.min,
            max = pool.shared.config.max,
            "Connection pool ready"
        );
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Lease a connection.
    ///
    /// Returns an idle slot at once, opens a new one while below `max`, and
    /// otherwise queues behind earlier callers until a slot frees up or
    /// `acquire_timeout` elapses ([`GuardError::PoolExhausted`]). A caller
    /// that has to queue while the pool is below `max` opens a connection
    /// for the head of the queue.
    pub async fn acquire(&self) -> Result<PooledConnection<M>> {
        let started = Instant::now();
        let step = {
            let mut inner = self.shared.lock();
            if inner.closed {
                return Err(GuardError::PoolClosed);
            }
            match inner.idle.pop_front() {
                Some(slot) if inner.waiters.is_empty() => {
                    inner.leased += 1;
                    return Ok(self.wrap(slot));
                }
                Some(slot) => {
                    // Earlier callers are still queued; never jump the line.
                    inner.idle.push_front(slot);
                }
                None => {}
            }
            let has_room = inner.total() < self.shared.config.max;
            if inner.waiters.is_empty() && has_room {
                inner.creating += 1;
                AcquireStep::Create(inner.slot_id())
            } else {
                let (tx, rx) = oneshot::channel();
                let id = inner.next_waiter_id;
                inner.next_waiter_id += 1;
                inner.waiters.push_back(Waiter { id, tx });
                // Queued callers can outnumber in-flight creates while there
                // is room, e.g. after a replacement failed to open. Open one
                // for the head of the queue rather than waiting on a release
                // that may never come.
                let open = if has_room && inner.creating < inner.waiters.len() {
                    inner.creating += 1;
                    Some(inner.slot_id())
                } else {
                    None
                };
                AcquireStep::Wait { id, rx, open }
            }
        };
        let (waiter_id, rx, open) = match step {
            AcquireStep::Create(id) => return self.create_slot(id).await,
            AcquireStep::Wait { id, rx, open } => (id, rx, open),
        };

        let mut pending = PendingAcquire {
            shared: &self.shared,
            id: waiter_id,
            rx,
            settled: false,
        };
        let timeout = self.shared.config.acquire_timeout();
        let shared = &*self.shared;
        let rx = &mut pending.rx;
        let wait = async move {
            if let Some(slot_id) = open {
                shared.open_for_waiters(slot_id).await;
            }
            rx.await
        };
        let slot = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(slot)) => {
                pending.settled = true;
                slot
            }
            Ok(Err(_)) => {
                pending.settled = true;
                return Err(GuardError::PoolClosed);
            }
            Err(_) => pending.on_timeout(started)?,
        };
        Ok(self.wrap(slot))
    }

    async fn create_slot(&self, id: u64) -> Result<PooledConnection<M>> {
        let reservation = Reservation::new(&self.shared);
        match self.shared.manager.create().await {
            Ok(conn) => {
                let closed = {
                    let mut inner = self.shared.lock();
                    reservation.settle(&mut inner);
                    if !inner.closed {
                        inner.leased += 1;
                        debug!(slot = id, total = inner.total(), "Opened pooled connection");
                    }
                    inner.closed
                };
                if closed {
                    self.shared.manager.destroy(conn).await;
                    return Err(GuardError::PoolClosed);
                }
                Ok(self.wrap(Slot { id, conn }))
            }
            Err(e) => {
                drop(reservation);
                warn!(error = %e, "Failed to open pooled connection");
                Err(match e {
                    GuardError::BackendUnavailable(_) => e,
                    other => GuardError::BackendUnavailable(other.to_string()),
                })
            }
        }
    }

    /// Return a connection. Unhealthy or invalid connections, and any
    /// connection returned after [`close`](Self::close), are destroyed.
    pub async fn release(&self, mut conn: PooledConnection<M>) {
        let Some(slot) = conn.slot.take() else {
            return;
        };
        if let Some(dead) = self.shared.check_in(slot, !conn.unhealthy) {
            self.shared.retire(dead).await;
        }
    }

    /// Stop handing out connections. Pending waiters fail with
    /// [`GuardError::PoolClosed`], idle connections are destroyed now, and
    /// leased ones are destroyed when they come back.
    pub async fn close(&self) {
        let idle: Vec<_> = {
            let mut inner = self.shared.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.waiters.clear();
            inner.idle.drain(..).collect()
        };
        let drained = idle.len();
        for slot in idle {
            self.shared.manager.destroy(slot.conn).await;
        }
        info!(drained, "Connection pool closed");
    }

    pub fn state(&self) -> PoolState {
        let inner = self.shared.lock();
        PoolState {
            idle: inner.idle.len(),
            leased: inner.leased,
            creating: inner.creating,
            waiting: inner.waiters.len(),
            total: inner.total(),
            max: self.shared.config.max,
            closed: inner.closed,
        }
    }

    fn wrap(&self, slot: Slot<M::Connection>) -> PooledConnection<M> {
        PooledConnection {
            slot: Some(slot),
            shared: Arc::clone(&self.shared),
            unhealthy: false,
        }
    }
}

impl<M: ManageConnection> std::fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("state", &self.state()).finish()
    }
}

/// A leased connection.
///
/// Prefer [`Pool::release`]. Dropping the handle also returns it; an
/// unhealthy connection dropped this way is destroyed on a spawned task.
pub struct PooledConnection<M: ManageConnection> {
    slot: Option<Slot<M::Connection>>,
    shared: Arc<Shared<M>>,
    unhealthy: bool,
}

impl<M: ManageConnection> PooledConnection<M> {
    /// Stable identity of the underlying slot.
    pub fn slot_id(&self) -> u64 {
        self.slot.as_ref().map(|s| s.id).unwrap_or(0)
    }

    /// Flag the connection as broken so it is destroyed on release.
    pub fn mark_unhealthy(&mut self) {
        self.unhealthy = true;
    }

    pub fn is_unhealthy(&self) -> bool {
        self.unhealthy
    }
}

impl<M: ManageConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        &self.slot.as_ref().expect("connection already released").conn
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.slot.as_mut().expect("connection already released").conn
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        let Some(dead) = self.shared.check_in(slot, !self.unhealthy) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = Arc::clone(&self.shared);
                handle.spawn(async move { shared.retire(dead).await });
            }
            Err(_) => debug!(slot = dead.id, "No runtime to destroy connection, dropping it"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
