//! Transaction pool over device request handles
//!
//! A [`Transaction`] is one hardware submission slot: a request handle
//! allocated from the device, owned by exactly one caller between
//! acquisition and release. The [`TransactionPool`] is fixed-size; at every
//! observation point each slot is in exactly one place: the free list, the
//! in-flight set, or lent out to a caller.
//!
//! Started transactions return to the free list only through the completion
//! path: the pool registers every request descriptor with the reactor and
//! reinitializes the request when its completion event is dispatched.

use crate::device::DecodeDevice;
use crate::error::{Error, Result};
use crate::reactor::Reactor;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Upper bound on how long `acquire` blocks for a free transaction
///
/// A wedged hardware queue must surface as a diagnosable failure, not a
/// pipeline deadlock.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(2);

struct PoolState {
    free: Vec<OwnedFd>,
    in_flight: HashMap<RawFd, OwnedFd>,
    lent: usize,
    shutdown: bool,
}

pub(crate) struct PoolInner {
    device: Arc<dyn DecodeDevice>,
    state: Mutex<PoolState>,
    available: Condvar,
    capacity: usize,
}

impl PoolInner {
    /// Completion path: reinitialize the request and return it to the free list
    fn on_complete(&self, raw: RawFd) {
        let mut st = self.state.lock();
        let Some(fd) = st.in_flight.remove(&raw) else {
            // Readiness for a request we no longer track; nothing to do
            return;
        };
        if let Err(e) = self.device.reinit_request(raw) {
            warn!("request {} reinit failed: {}", raw, e);
        }
        st.free.push(fd);
        drop(st);
        self.available.notify_one();
    }
}

/// Fixed-size pool of reusable hardware submission slots
pub struct TransactionPool {
    inner: Arc<PoolInner>,
    reactor: Arc<dyn Reactor>,
    all_fds: Vec<RawFd>,
}

impl TransactionPool {
    /// Allocate `capacity` request handles from the device and register each
    /// with the reactor for completion dispatch
    pub fn new(
        device: Arc<dyn DecodeDevice>,
        reactor: Arc<dyn Reactor>,
        capacity: usize,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::invalid_input("transaction pool needs capacity > 0"));
        }

        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(device.alloc_request()?);
        }
        let all_fds: Vec<RawFd> = free.iter().map(|fd| fd.as_raw_fd()).collect();

        let inner = Arc::new(PoolInner {
            device: Arc::clone(&device),
            state: Mutex::new(PoolState {
                free,
                in_flight: HashMap::new(),
                lent: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
            capacity,
        });

        let interest = device.request_interest();
        for &raw in &all_fds {
            let weak: Weak<PoolInner> = Arc::downgrade(&inner);
            reactor.register(
                raw,
                interest,
                Box::new(move || {
                    if let Some(pool) = weak.upgrade() {
                        pool.on_complete(raw);
                    }
                }),
            )?;
        }

        Ok(TransactionPool {
            inner,
            reactor,
            all_fds,
        })
    }

    /// Acquire a free transaction, blocking up to [`ACQUIRE_TIMEOUT`]
    pub fn acquire(&self) -> Result<Transaction> {
        let deadline = Instant::now() + ACQUIRE_TIMEOUT;
        let mut st = self.inner.state.lock();
        loop {
            if st.shutdown {
                return Err(Error::invalid_state("transaction pool is shut down"));
            }
            if let Some(fd) = st.free.pop() {
                st.lent += 1;
                return Ok(Transaction {
                    fd: Some(fd),
                    pool: Arc::clone(&self.inner),
                });
            }
            if Instant::now() >= deadline {
                return Err(Error::PoolTimeout(ACQUIRE_TIMEOUT));
            }
            self.inner.available.wait_until(&mut st, deadline);
        }
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Slots currently on the free list
    pub fn free_count(&self) -> usize {
        self.inner.state.lock().free.len()
    }

    /// Slots currently submitted and awaiting completion
    pub fn in_flight_count(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    /// Slots currently lent out to callers, acquired but not started
    pub fn lent_count(&self) -> usize {
        self.inner.state.lock().lent
    }

    /// Block until no transaction is in flight, up to `timeout`
    pub fn wait_idle(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut st = self.inner.state.lock();
        while !st.in_flight.is_empty() {
            if Instant::now() >= deadline {
                return Err(Error::operation(format!(
                    "{} transactions still in flight after {:?}",
                    st.in_flight.len(),
                    timeout
                )));
            }
            self.inner.available.wait_until(&mut st, deadline);
        }
        Ok(())
    }
}

impl Drop for TransactionPool {
    fn drop(&mut self) {
        {
            let mut st = self.inner.state.lock();
            st.shutdown = true;
        }
        self.inner.available.notify_all();
        // Registrations must go before the descriptors they reference
        for &raw in &self.all_fds {
            if let Err(e) = self.reactor.unregister(raw) {
                warn!("unregister request fd {}: {}", raw, e);
            }
        }
    }
}

/// One acquired hardware submission slot
///
/// Dropping an unstarted transaction returns it to the pool, equivalent to
/// [`abort`]. Starting consumes the transaction: the slot is only reusable
/// once the completion path hands it back to the pool. Abort-after-start is
/// unrepresentable.
///
/// [`abort`]: Transaction::abort
pub struct Transaction {
    fd: Option<OwnedFd>,
    pool: Arc<PoolInner>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("fd", &self.fd.as_ref().map(|fd| fd.as_raw_fd()))
            .finish()
    }
}

impl Transaction {
    /// Raw request descriptor, for binding buffers and controls; the pool
    /// retains ownership
    pub fn fd(&self) -> RawFd {
        self.fd.as_ref().expect("live transaction").as_raw_fd()
    }

    /// Submit this transaction to the device
    ///
    /// On success ownership moves to the in-flight set. On failure the
    /// request is reinitialized (dropping anything staged against it) and
    /// returned to the free list, so a retry acquires a fresh slot without
    /// leaking capacity.
    pub fn start(mut self) -> Result<()> {
        let fd = self.fd.take().expect("live transaction");
        let raw = fd.as_raw_fd();
        let pool = Arc::clone(&self.pool);

        // Into the in-flight set before submission: a fast device may signal
        // completion before submit_request even returns.
        {
            let mut st = pool.state.lock();
            st.in_flight.insert(raw, fd);
            st.lent -= 1;
        }

        match pool.device.submit_request(raw) {
            Ok(()) => {
                debug!("request {} submitted", raw);
                Ok(())
            }
            Err(e) => {
                let mut st = pool.state.lock();
                if let Some(fd) = st.in_flight.remove(&raw) {
                    if let Err(re) = pool.device.reinit_request(raw) {
                        warn!("request {} reinit after failed submit: {}", raw, re);
                    }
                    st.free.push(fd);
                    drop(st);
                    pool.available.notify_one();
                }
                Err(e)
            }
        }
    }

    /// Return this unstarted transaction to the pool without submission
    pub fn abort(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(fd) = self.fd.take() {
            let raw = fd.as_raw_fd();
            // Drop anything staged against the request while it was lent out
            if let Err(e) = self.pool.device.reinit_request(raw) {
                warn!("request {} reinit on abort: {}", raw, e);
            }
            let mut st = self.pool.state.lock();
            st.free.push(fd);
            st.lent -= 1;
            drop(st);
            self.pool.available.notify_one();
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.release();
    }
}
