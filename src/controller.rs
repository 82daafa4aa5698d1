//! Buffer controller: the aggregate root of the request layer
//!
//! A [`BufferController`] owns the source entry pool, the destination free
//! pool, the negotiated formats, and the transaction pool, and orchestrates
//! one decode submission: bind a source entry, a destination entry, and any
//! request-scoped controls to a transaction, hand it to the pool, and arm
//! the completion dispatch that eventually signals the destination entry.
//!
//! The controller is shared by cloning: each clone is one reference, and the
//! last drop tears the session down. Destination entries lent out at that
//! point hold only a weak reference to the free pool, so their eventual
//! `free()` deletes them instead of touching dead pool state.

use crate::device::{DecodeDevice, ExtControl, QueryExtControl, QueueDir, SrcQueueArgs};
use crate::dmabuf::DmaBufAllocator;
use crate::error::{Error, Result};
use crate::format::{DstFormat, PixelFormat, RtFormat, SrcFormat};
use crate::queue::{DstEntry, DstFreePool, SrcEntry};
use crate::reactor::{Interest, Reactor};
use crate::request::{Transaction, TransactionPool};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default ceiling on the number of destination entries a controller will
/// allocate
///
/// The original interface had no bound, which turns a stalled consumer into
/// unbounded memory growth; exceeding the ceiling fails fast instead.
pub const DEFAULT_DST_ENTRY_LIMIT: usize = 32;

/// Bound on quiescing in-flight transactions during `stream_off`
const QUIESCE_TIMEOUT: Duration = Duration::from_secs(5);

struct CtlState {
    src_fmt: Option<SrcFormat>,
    dst_fmt: Option<DstFormat>,
    src_free: Vec<SrcEntry>,
    queued_src: HashMap<u32, SrcEntry>,
    queued_dst: HashMap<u32, Arc<crate::queue::DstShared>>,
    dst_total: usize,
    dst_entry_limit: usize,
    streaming: bool,
}

pub(crate) struct ControllerInner {
    device: Arc<dyn DecodeDevice>,
    reactor: Arc<dyn Reactor>,
    pool: TransactionPool,
    dst_pool: Arc<DstFreePool>,
    state: Mutex<CtlState>,
}

impl ControllerInner {
    /// Reactor callback and stream-off path: collect everything the device
    /// has finished with
    fn drain_completions(&self) {
        loop {
            match self.device.dequeue_dst() {
                Ok(Some(done)) => {
                    let shared = self.state.lock().queued_dst.remove(&done.index);
                    match shared {
                        Some(shared) => {
                            debug!(
                                index = done.index,
                                timestamp = done.timestamp,
                                status = %done.status,
                                "destination completed"
                            );
                            shared.complete(done.status, done.bytes_used);
                        }
                        None => warn!(
                            index = done.index,
                            "completion for an untracked destination buffer"
                        ),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("destination dequeue failed: {}", e);
                    break;
                }
            }
        }
        loop {
            match self.device.dequeue_src() {
                Ok(Some(index)) => {
                    let mut st = self.state.lock();
                    if let Some(entry) = st.queued_src.remove(&index) {
                        st.src_free.push(entry);
                    } else {
                        warn!(index, "dequeue for an untracked source buffer");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("source dequeue failed: {}", e);
                    break;
                }
            }
        }
    }

    fn in_flight(&self) -> bool {
        self.pool.in_flight_count() > 0 || !self.state.lock().queued_dst.is_empty()
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        // Best-effort teardown: quiesce the queues, then remove the poll
        // registration before the device (and its descriptor) go away.
        let _ = self.device.stream_off(QueueDir::Src);
        let _ = self.device.stream_off(QueueDir::Dst);
        if let Err(e) = self.reactor.unregister(self.device.poll_fd()) {
            warn!("unregister device poll fd: {}", e);
        }
        // Entries still lent out see the pool die through their weak
        // references; pooled ones are deleted here.
        self.dst_pool.clear();
    }
}

/// Orchestrates request submission over one decode device
///
/// Cloning shares the controller; the clone count is the reference count of
/// the session. All methods take `&self` and are callable from any thread.
#[derive(Clone)]
pub struct BufferController {
    inner: Arc<ControllerInner>,
}

impl BufferController {
    /// Build a controller over `device`, dispatching completions through
    /// `reactor`, with `transactions` hardware submission slots
    pub fn new(
        device: Arc<dyn DecodeDevice>,
        reactor: Arc<dyn Reactor>,
        transactions: usize,
    ) -> Result<Self> {
        let pool = TransactionPool::new(Arc::clone(&device), Arc::clone(&reactor), transactions)?;

        let inner = Arc::new(ControllerInner {
            device: Arc::clone(&device),
            reactor: Arc::clone(&reactor),
            pool,
            dst_pool: DstFreePool::new(),
            state: Mutex::new(CtlState {
                src_fmt: None,
                dst_fmt: None,
                src_free: Vec::new(),
                queued_src: HashMap::new(),
                queued_dst: HashMap::new(),
                dst_total: 0,
                dst_entry_limit: DEFAULT_DST_ENTRY_LIMIT,
                streaming: false,
            }),
        });

        let weak: Weak<ControllerInner> = Arc::downgrade(&inner);
        reactor.register(
            device.poll_fd(),
            Interest::Readable,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.drain_completions();
                }
            }),
        )?;

        info!(driver = %device.driver(), transactions, "buffer controller ready");
        Ok(BufferController { inner })
    }

    /// The transaction pool backing this controller
    pub fn pool(&self) -> &TransactionPool {
        &self.inner.pool
    }

    /// Negotiate the source (coded) format
    ///
    /// Refused while any transaction is in flight.
    pub fn set_src_format(
        &self,
        pixel_format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<SrcFormat> {
        if self.inner.in_flight() {
            return Err(Error::invalid_state(
                "format change with transactions in flight",
            ));
        }
        let buffer_size = pixel_format.default_buffer_size(width, height);
        let fmt = self
            .inner
            .device
            .set_src_format(pixel_format, width, height, buffer_size)?;
        info!(format = %pixel_format, width, height, "source format set");
        self.inner.state.lock().src_fmt = Some(fmt);
        Ok(fmt)
    }

    /// Negotiate the destination (raw picture) format; the granted
    /// dimensions are authoritative
    ///
    /// Refused while any transaction is in flight.
    pub fn set_dst_format(&self, rt_format: RtFormat, width: u32, height: u32) -> Result<DstFormat> {
        if self.inner.in_flight() {
            return Err(Error::invalid_state(
                "format change with transactions in flight",
            ));
        }
        let fmt = self.inner.device.set_dst_format(rt_format, width, height)?;
        info!(
            format = %rt_format,
            granted_width = fmt.width,
            granted_height = fmt.height,
            "destination format set"
        );
        self.inner.state.lock().dst_fmt = Some(fmt.clone());
        Ok(fmt)
    }

    /// Current destination format, as the device reports it
    pub fn dst_format(&self) -> Result<DstFormat> {
        self.inner.device.dst_format()
    }

    /// Cap the number of destination entries this controller will allocate
    pub fn set_dst_entry_limit(&self, limit: usize) {
        self.inner.state.lock().dst_entry_limit = limit;
    }

    /// Pre-allocate `count` source entries backed by `allocator`
    pub fn create_src_pool(&self, allocator: &dyn DmaBufAllocator, count: u32) -> Result<()> {
        let buffer_size = {
            let st = self.inner.state.lock();
            st.src_fmt
                .ok_or_else(|| Error::invalid_state("source format not negotiated"))?
                .buffer_size
        };
        let indices = self.inner.device.create_src_bufs(count)?;
        let mut entries = Vec::with_capacity(indices.len());
        for index in indices {
            entries.push(SrcEntry::new(index, allocator.alloc(buffer_size)?));
        }
        self.inner.state.lock().src_free.append(&mut entries);
        Ok(())
    }

    /// Acquire a free source entry; `None` when the pool is exhausted
    ///
    /// The entry count never grows past `create_src_pool`; what to do on
    /// exhaustion (wait, drop the frame) is the caller's policy.
    pub fn get_src_entry(&self) -> Option<SrcEntry> {
        self.inner.state.lock().src_free.pop()
    }

    /// Source entries currently in the free pool
    pub fn src_free_count(&self) -> usize {
        self.inner.state.lock().src_free.len()
    }

    /// Get a destination entry from the free pool, or allocate a new one
    /// backed by `allocator`
    ///
    /// Allocation beyond the configured ceiling fails fast with an
    /// allocation error.
    pub fn alloc_dst_entry(&self, allocator: &dyn DmaBufAllocator) -> Result<DstEntry> {
        if let Some(shared) = self.inner.dst_pool.pop() {
            return Ok(DstEntry::from_pooled(shared, &self.inner.dst_pool));
        }

        // Reserve against the ceiling before allocating; back out on failure
        let fmt = {
            let mut st = self.inner.state.lock();
            let fmt = st
                .dst_fmt
                .clone()
                .ok_or_else(|| Error::invalid_state("destination format not negotiated"))?;
            if st.dst_total >= st.dst_entry_limit {
                return Err(Error::allocation(format!(
                    "destination entry limit {} reached",
                    st.dst_entry_limit
                )));
            }
            st.dst_total += 1;
            fmt
        };

        let built = self.new_dst_index().and_then(|index| {
            let mut planes = Vec::with_capacity(fmt.planes.len());
            for layout in &fmt.planes {
                planes.push(allocator.alloc(layout.size)?);
            }
            debug!(index, "allocated destination entry");
            Ok(DstEntry::new_backed(index, planes, &self.inner.dst_pool))
        });
        if built.is_err() {
            self.inner.state.lock().dst_total -= 1;
        }
        built
    }

    /// Pre-create `count` destination entries with no backing buffers, for
    /// later `import_fd` binding
    pub fn create_dst_slots(&self, count: u32) -> Result<Vec<DstEntry>> {
        let fmt = {
            let mut st = self.inner.state.lock();
            let fmt = st
                .dst_fmt
                .clone()
                .ok_or_else(|| Error::invalid_state("destination format not negotiated"))?;
            if st.dst_total + count as usize > st.dst_entry_limit {
                return Err(Error::allocation(format!(
                    "destination entry limit {} reached",
                    st.dst_entry_limit
                )));
            }
            st.dst_total += count as usize;
            fmt
        };

        let sizes: Vec<usize> = fmt.planes.iter().map(|p| p.size).collect();
        let indices = match self.inner.device.create_dst_bufs(count) {
            Ok(indices) => indices,
            Err(e) => {
                self.inner.state.lock().dst_total -= count as usize;
                return Err(e);
            }
        };
        Ok(indices
            .into_iter()
            .map(|index| DstEntry::new_slot(index, sizes.clone(), &self.inner.dst_pool))
            .collect())
    }

    /// Destination entries currently in the free pool
    pub fn dst_free_count(&self) -> usize {
        self.inner.dst_pool.len()
    }

    fn new_dst_index(&self) -> Result<u32> {
        let indices = self.inner.device.create_dst_bufs(1)?;
        indices
            .into_iter()
            .next()
            .ok_or_else(|| Error::operation("device granted no destination buffer"))
    }

    /// Start streaming on both device queues
    pub fn stream_on(&self) -> Result<()> {
        self.inner.device.stream_on(QueueDir::Src)?;
        self.inner.device.stream_on(QueueDir::Dst)?;
        self.inner.state.lock().streaming = true;
        Ok(())
    }

    /// Stop streaming, quiescing any in-flight transactions first
    ///
    /// Safe to call with transactions in flight: cancelled pictures complete
    /// with an error status, so their waiters observe a terminal state.
    pub fn stream_off(&self) -> Result<()> {
        self.inner.device.stream_off(QueueDir::Src)?;
        self.inner.pool.wait_idle(QUIESCE_TIMEOUT)?;
        self.inner.device.stream_off(QueueDir::Dst)?;
        // The reactor will also observe these, but collecting synchronously
        // makes the post-condition (nothing queued) hold on return.
        self.inner.drain_completions();
        self.inner.state.lock().streaming = false;
        Ok(())
    }

    /// Whether both device queues are currently streaming
    pub fn is_streaming(&self) -> bool {
        self.inner.state.lock().streaming
    }

    /// Apply extended controls, scoped to `transaction` when given, globally
    /// otherwise
    pub fn set_ext_ctrls(
        &self,
        transaction: Option<&Transaction>,
        ctrls: &[ExtControl],
    ) -> Result<()> {
        self.inner
            .device
            .set_ext_ctrls(transaction.map(|t| t.fd()), ctrls)
    }

    /// Fill in descriptors for the given control ids
    pub fn query_ext_ctrls(&self, ctrls: &mut [QueryExtControl]) -> Result<()> {
        self.inner.device.query_ext_ctrls(ctrls)
    }

    /// Bind `src` and `dst` to `transaction` and submit it
    ///
    /// `is_final` marks the last request contributing to this picture;
    /// intermediate requests of a multi-slice picture pass `false` and the
    /// picture completes only after the final one.
    ///
    /// On failure the transaction has already been returned to the pool and
    /// the source entry comes back in the error, so the caller can retry
    /// with a fresh transaction or release the entry; the destination entry
    /// is never consumed.
    pub fn start_request(
        &self,
        transaction: Transaction,
        src: SrcEntry,
        dst: &DstEntry,
        is_final: bool,
    ) -> std::result::Result<(), StartRequestError> {
        let timestamp = src.timestamp();

        // All planes must be backed before anything is bound
        let plane_fds = match dst.shared().plane_fds() {
            Ok(fds) => fds,
            Err(error) => return Err(StartRequestError { error, src }),
        };

        // The picture buffer is queued once; continuation slices and retries
        // find it already bound.
        if !dst.shared().is_queued() {
            if let Err(error) = self.inner.device.queue_dst(dst.index(), &plane_fds, timestamp) {
                return Err(StartRequestError { error, src });
            }
            dst.shared().mark_queued(timestamp);
            self.inner
                .state
                .lock()
                .queued_dst
                .insert(dst.index(), Arc::clone(dst.shared()));
        }

        let args = SrcQueueArgs {
            index: src.index(),
            fd: src.as_raw_fd(),
            capacity: src.capacity(),
            length: src.len(),
            timestamp,
            request_fd: transaction.fd(),
            hold_dst: !is_final,
        };
        if let Err(error) = self.inner.device.queue_src(args) {
            // Dropping the transaction reinitializes the request and returns
            // it to the free list.
            return Err(StartRequestError { error, src });
        }

        // Into the in-flight map before submission: completion may race the
        // return of start().
        let index = src.index();
        self.inner.state.lock().queued_src.insert(index, src);

        debug!(
            src = index,
            dst = dst.index(),
            timestamp,
            is_final,
            "starting request"
        );
        if let Err(error) = transaction.start() {
            let src = self
                .inner
                .state
                .lock()
                .queued_src
                .remove(&index)
                .expect("entry placed above");
            return Err(StartRequestError { error, src });
        }
        Ok(())
    }
}

/// Failure from [`BufferController::start_request`]
///
/// Carries the source entry back to the caller; the transaction has already
/// been returned to its pool.
#[derive(Debug)]
pub struct StartRequestError {
    /// What went wrong
    pub error: Error,
    /// The unconsumed source entry
    pub src: SrcEntry,
}

impl std::fmt::Display for StartRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "start_request failed: {}", self.error)
    }
}

impl std::error::Error for StartRequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::software::SoftwareDevice;
    use crate::dmabuf::MemfdAllocator;
    use crate::reactor::PollReactor;

    fn setup() -> (Arc<SoftwareDevice>, BufferController) {
        let device = Arc::new(SoftwareDevice::new().unwrap());
        let reactor = Arc::new(PollReactor::new().unwrap());
        let ctl = BufferController::new(device.clone(), reactor, 4).unwrap();
        (device, ctl)
    }

    #[test]
    fn test_src_pool_acquire_and_exhaustion() {
        let (_dev, ctl) = setup();
        let alloc = MemfdAllocator::new();
        ctl.set_src_format(PixelFormat::H264Slice, 64, 64).unwrap();
        ctl.create_src_pool(&alloc, 2).unwrap();

        let a = ctl.get_src_entry().unwrap();
        let _b = ctl.get_src_entry().unwrap();
        assert!(ctl.get_src_entry().is_none());
        drop(a);
        // Dropped entries are gone, not returned: return happens through the
        // device dequeue path only
        assert!(ctl.get_src_entry().is_none());
    }

    #[test]
    fn test_dst_entry_limit() {
        let (_dev, ctl) = setup();
        let alloc = MemfdAllocator::new();
        ctl.set_dst_format(RtFormat::Nv12, 64, 64).unwrap();
        ctl.set_dst_entry_limit(2);

        let a = ctl.alloc_dst_entry(&alloc).unwrap();
        let _b = ctl.alloc_dst_entry(&alloc).unwrap();
        let err = ctl.alloc_dst_entry(&alloc).unwrap_err();
        assert!(matches!(err, Error::AllocationFailed(_)));

        // Freeing makes the entry reusable without counting a new allocation
        a.free();
        assert_eq!(ctl.dst_free_count(), 1);
        let _again = ctl.alloc_dst_entry(&alloc).unwrap();
        assert_eq!(ctl.dst_free_count(), 0);
    }

    #[test]
    fn test_alloc_dst_requires_format() {
        let (_dev, ctl) = setup();
        let alloc = MemfdAllocator::new();
        assert!(matches!(
            ctl.alloc_dst_entry(&alloc),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_dead_pool_after_teardown() {
        let (_dev, ctl) = setup();
        let alloc = MemfdAllocator::new();
        ctl.set_dst_format(RtFormat::Nv12, 64, 64).unwrap();
        let entry = ctl.alloc_dst_entry(&alloc).unwrap();

        let clone = ctl.clone();
        drop(ctl);
        drop(clone);

        // The controller is gone; free must delete rather than touch the pool
        let witness = Arc::downgrade(entry.shared());
        entry.free();
        assert!(witness.upgrade().is_none());
    }

    #[test]
    fn test_format_change_rejected_in_flight() {
        let (device, ctl) = setup();
        let alloc = MemfdAllocator::new();
        ctl.set_src_format(PixelFormat::H264Slice, 64, 64).unwrap();
        ctl.set_dst_format(RtFormat::Nv12, 64, 64).unwrap();
        ctl.create_src_pool(&alloc, 1).unwrap();

        let mut src = ctl.get_src_entry().unwrap();
        src.set_params(1);
        src.copy_in(b"frame", None).unwrap();
        let dst = ctl.alloc_dst_entry(&alloc).unwrap();
        let xact = ctl.pool().acquire().unwrap();

        // Delay completion so the transaction stays in flight
        device.inject_completion_delay(1, Duration::from_millis(300));
        ctl.stream_on().unwrap();
        ctl.start_request(xact, src, &dst, true).unwrap();

        assert!(matches!(
            ctl.set_src_format(PixelFormat::Vp9Frame, 64, 64),
            Err(Error::InvalidState(_))
        ));

        dst.wait().unwrap();
        dst.free();
    }

    #[test]
    fn test_unsupported_format_propagates() {
        let device = Arc::new(
            SoftwareDevice::with_formats(&[PixelFormat::H264Slice], &[RtFormat::Nv12]).unwrap(),
        );
        let reactor = Arc::new(PollReactor::new().unwrap());
        let ctl = BufferController::new(device, reactor, 1).unwrap();

        let err = ctl.set_src_format(PixelFormat::Av1Frame, 64, 64).unwrap_err();
        assert!(err.is_session_fatal());
    }
}
