//! Source and destination queue entries
//!
//! A [`SrcEntry`] wraps one coded-bitstream buffer plus its per-submission
//! metadata; a [`DstEntry`] wraps one decoded picture's plane buffers plus
//! its completion state. Entries are lent out by the
//! [`BufferController`](crate::controller::BufferController); the controller
//! also owns their free-pool membership.

use crate::dmabuf::{DmaBufAllocator, DmaBufHandle};
use crate::error::{CompletionStatus, Error, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::os::fd::{OwnedFd, RawFd};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

/// Default bound on a destination completion wait
///
/// The hardware owns no clock we can trust; a stuck driver must surface as an
/// error rather than block the pipeline forever.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// One coded-bitstream buffer plus submission metadata
///
/// Content length never exceeds the backing buffer's capacity: oversized
/// content grows the backing buffer transparently, preserving the entry's
/// identity (its queue slot) as seen by the device.
#[derive(Debug)]
pub struct SrcEntry {
    index: u32,
    handle: DmaBufHandle,
    timestamp: u64,
}

impl SrcEntry {
    pub(crate) fn new(index: u32, handle: DmaBufHandle) -> Self {
        SrcEntry {
            index,
            handle,
            timestamp: 0,
        }
    }

    /// Queue slot index of this entry
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Record the timestamp used when this entry is next submitted
    ///
    /// Does not touch buffer contents.
    pub fn set_params(&mut self, timestamp: u64) {
        self.timestamp = timestamp;
    }

    /// Timestamp recorded for the next submission
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Bytes of coded data currently in the entry
    pub fn len(&self) -> usize {
        self.handle.len()
    }

    /// Whether the entry holds no coded data
    pub fn is_empty(&self) -> bool {
        self.handle.is_empty()
    }

    /// Capacity of the backing buffer
    pub fn capacity(&self) -> usize {
        self.handle.size()
    }

    /// Replace the entry's content with `data`
    ///
    /// If `data` exceeds the current capacity the backing buffer is
    /// reallocated through `allocator`; without an allocator, growth fails
    /// with an allocation error and the previous content is untouched.
    /// Coded-frame sizes are unpredictable, so this is the normal path for
    /// occasional oversized frames rather than an exceptional one.
    pub fn copy_in(
        &mut self,
        data: &[u8],
        allocator: Option<&dyn DmaBufAllocator>,
    ) -> Result<()> {
        if data.len() > self.handle.size() {
            let Some(allocator) = allocator else {
                return Err(Error::allocation(format!(
                    "content of {} bytes exceeds capacity {} and no allocator was supplied",
                    data.len(),
                    self.handle.size()
                )));
            };
            // Grow with headroom so a run of slightly-larger frames does not
            // reallocate every time.
            let new_size = data.len().next_power_of_two();
            let mut grown = allocator.alloc(new_size)?;
            grown.map()?;
            debug!(
                index = self.index,
                old = self.handle.size(),
                new = new_size,
                "growing source buffer"
            );
            self.handle = grown;
        }

        self.handle.map()?;
        self.handle.data_mut().expect("mapped")[..data.len()].copy_from_slice(data);
        self.handle.set_len(data.len())
    }

    /// Read back the entry's content; for verification paths
    pub fn data(&self) -> Option<&[u8]> {
        self.handle.data().map(|d| &d[..self.handle.len()])
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.handle.as_raw_fd()
    }
}

/// Lifecycle of a destination entry
enum DstState {
    /// Not bound to any transaction
    Unqueued,
    /// Bound to an in-flight transaction
    Queued { timestamp: u64 },
    /// Completion observed
    Done {
        status: CompletionStatus,
        bytes_used: Vec<usize>,
    },
}

pub(crate) struct DstShared {
    index: u32,
    expected_plane_sizes: Vec<usize>,
    planes: Mutex<Vec<Option<DmaBufHandle>>>,
    state: Mutex<DstState>,
    done: Condvar,
}

impl DstShared {
    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    /// Whether this entry is currently bound to a transaction
    pub(crate) fn is_queued(&self) -> bool {
        matches!(*self.state.lock(), DstState::Queued { .. })
    }

    pub(crate) fn mark_queued(&self, timestamp: u64) {
        *self.state.lock() = DstState::Queued { timestamp };
    }

    /// Completion path: record the outcome and wake waiters
    pub(crate) fn complete(&self, status: CompletionStatus, bytes_used: Vec<usize>) {
        *self.state.lock() = DstState::Done { status, bytes_used };
        self.done.notify_all();
    }

    /// Reset for reuse from the free pool
    fn reset(&self) {
        *self.state.lock() = DstState::Unqueued;
        for handle in self.planes.lock().iter_mut().flatten() {
            handle.unmap();
        }
    }

    /// Raw descriptors of all bound planes, in order; fails if any plane is
    /// still an unbacked slot
    pub(crate) fn plane_fds(&self) -> Result<Vec<RawFd>> {
        self.planes
            .lock()
            .iter()
            .map(|p| {
                p.as_ref()
                    .map(|h| h.as_raw_fd())
                    .ok_or_else(|| Error::invalid_state("destination plane has no backing buffer"))
            })
            .collect()
    }
}

/// Free pool of destination entries, shared between the controller and the
/// entries it has lent out
///
/// The controller drops its reference at teardown; entries detect that via
/// `Weak::upgrade` and delete themselves instead of touching dead pool state.
pub(crate) struct DstFreePool {
    free: Mutex<Vec<Arc<DstShared>>>,
}

impl DstFreePool {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(DstFreePool {
            free: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn pop(&self) -> Option<Arc<DstShared>> {
        self.free.lock().pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.free.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.free.lock().clear();
    }
}

/// One decoded picture's plane buffers plus completion state
///
/// Read access to plane data is only valid between a successful [`wait`] and
/// through the guard returned by [`read_start`]; the guard releases the CPU
/// mapping when it goes out of scope, even on an early error return.
///
/// [`wait`]: DstEntry::wait
/// [`read_start`]: DstEntry::read_start
pub struct DstEntry {
    shared: Arc<DstShared>,
    pool: Weak<DstFreePool>,
}

impl std::fmt::Debug for DstEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DstEntry")
            .field("index", &self.shared.index())
            .finish()
    }
}

impl DstEntry {
    /// Build an entry backed by allocated plane buffers
    pub(crate) fn new_backed(
        index: u32,
        planes: Vec<DmaBufHandle>,
        pool: &Arc<DstFreePool>,
    ) -> Self {
        let expected: Vec<usize> = planes.iter().map(|h| h.size()).collect();
        DstEntry {
            shared: Arc::new(DstShared {
                index,
                expected_plane_sizes: expected,
                planes: Mutex::new(planes.into_iter().map(Some).collect()),
                state: Mutex::new(DstState::Unqueued),
                done: Condvar::new(),
            }),
            pool: Arc::downgrade(pool),
        }
    }

    /// Build an unbacked slot entry; planes arrive later via [`import_fd`]
    ///
    /// [`import_fd`]: DstEntry::import_fd
    pub(crate) fn new_slot(
        index: u32,
        expected_plane_sizes: Vec<usize>,
        pool: &Arc<DstFreePool>,
    ) -> Self {
        let n = expected_plane_sizes.len();
        DstEntry {
            shared: Arc::new(DstShared {
                index,
                expected_plane_sizes,
                planes: Mutex::new((0..n).map(|_| None).collect()),
                state: Mutex::new(DstState::Unqueued),
                done: Condvar::new(),
            }),
            pool: Arc::downgrade(pool),
        }
    }

    /// Rewrap an entry taken from the free pool
    pub(crate) fn from_pooled(shared: Arc<DstShared>, pool: &Arc<DstFreePool>) -> Self {
        DstEntry {
            shared,
            pool: Arc::downgrade(pool),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<DstShared> {
        &self.shared
    }

    /// Queue slot index of this entry
    pub fn index(&self) -> u32 {
        self.shared.index
    }

    /// Bind an externally-owned descriptor as the backing of `plane`
    ///
    /// Only valid for slot entries: fails if the plane already has a backing
    /// buffer, or if `size` is inconsistent with the negotiated destination
    /// format.
    pub fn import_fd(&self, plane: usize, fd: OwnedFd, size: usize) -> Result<()> {
        let expected = *self
            .shared
            .expected_plane_sizes
            .get(plane)
            .ok_or_else(|| Error::invalid_input(format!("no plane {}", plane)))?;
        if size != expected {
            return Err(Error::invalid_input(format!(
                "plane {} size {} does not match negotiated size {}",
                plane, size, expected
            )));
        }
        let mut planes = self.shared.planes.lock();
        if planes[plane].is_some() {
            return Err(Error::invalid_state(format!(
                "plane {} already has a backing buffer",
                plane
            )));
        }
        planes[plane] = Some(DmaBufHandle::import(fd, size));
        Ok(())
    }

    /// Shareable descriptor of `plane`; no ownership transfer
    pub fn dmabuf(&self, plane: usize) -> Result<RawFd> {
        let planes = self.shared.planes.lock();
        planes
            .get(plane)
            .and_then(|p| p.as_ref())
            .map(|h| h.as_raw_fd())
            .ok_or_else(|| Error::invalid_input(format!("no backed plane {}", plane)))
    }

    /// Duplicated descriptor of `plane`, for hand-off to a consumer; the
    /// caller owns the duplicate
    pub fn dup_fd(&self, plane: usize) -> Result<OwnedFd> {
        let planes = self.shared.planes.lock();
        planes
            .get(plane)
            .and_then(|p| p.as_ref())
            .ok_or_else(|| Error::invalid_input(format!("no backed plane {}", plane)))?
            .dup_fd()
    }

    /// Block until the transaction producing this picture completes, up to
    /// [`WAIT_TIMEOUT`]
    pub fn wait(&self) -> Result<()> {
        self.wait_timeout(WAIT_TIMEOUT)
    }

    /// Block until completion, up to `timeout`
    ///
    /// Distinguishes success, device failure, and per-frame decode errors;
    /// after a failure the entry is terminal and its data must not be read,
    /// but it may still be freed or recycled.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            match &*state {
                DstState::Unqueued => {
                    return Err(Error::invalid_state(
                        "waiting on an entry that was never submitted",
                    ));
                }
                DstState::Done { status, .. } => {
                    return status.into_result("destination entry");
                }
                DstState::Queued { .. } => {
                    if self.shared.done.wait_until(&mut state, deadline).timed_out() {
                        if matches!(&*state, DstState::Queued { .. }) {
                            return Err(Error::operation(format!(
                                "completion wait exceeded {:?}",
                                timeout
                            )));
                        }
                    }
                }
            }
        }
    }

    /// Bytes the device wrote into `plane`; available after a successful wait
    pub fn bytes_used(&self, plane: usize) -> Option<usize> {
        match &*self.shared.state.lock() {
            DstState::Done {
                status: CompletionStatus::Success,
                bytes_used,
            } => bytes_used.get(plane).copied(),
            _ => None,
        }
    }

    /// Acquire a scoped CPU mapping of the picture for read-back
    ///
    /// Only valid after a successful [`wait`]; the returned guard's drop
    /// releases the mapping.
    ///
    /// [`wait`]: DstEntry::wait
    pub fn read_start(&self) -> Result<DstReadGuard<'_>> {
        {
            let state = self.shared.state.lock();
            match &*state {
                DstState::Done {
                    status: CompletionStatus::Success,
                    ..
                } => {}
                DstState::Done { status, .. } => {
                    return Err(Error::invalid_state(format!(
                        "entry completed with {}; data is not readable",
                        status
                    )));
                }
                _ => {
                    return Err(Error::invalid_state(
                        "read access before a successful completion wait",
                    ));
                }
            }
        }

        let mut planes = self.shared.planes.lock();
        for handle in planes.iter_mut().flatten() {
            handle.map()?;
        }
        Ok(DstReadGuard { planes })
    }

    /// Return the entry to its controller's free pool, or delete it if the
    /// controller has been torn down
    pub fn free(self) {
        if let Some(pool) = self.pool.upgrade() {
            self.shared.reset();
            pool.free.lock().push(self.shared);
        } else {
            debug!("freeing entry into a dead pool; deleting");
        }
        // Without a live pool, dropping the last Arc deletes the entry
    }

    /// Unconditionally destroy the entry
    pub fn delete(self) {}
}

/// Scoped CPU mapping of a destination entry's planes
///
/// Holds the entry's plane table locked for its lifetime; the mapping is
/// released when the guard drops.
pub struct DstReadGuard<'a> {
    planes: MutexGuard<'a, Vec<Option<DmaBufHandle>>>,
}

impl DstReadGuard<'_> {
    /// CPU-visible contents of `plane`
    pub fn data(&self, plane: usize) -> Result<&[u8]> {
        self.planes
            .get(plane)
            .and_then(|p| p.as_ref())
            .and_then(|h| h.data())
            .ok_or_else(|| Error::invalid_input(format!("no mapped plane {}", plane)))
    }

    /// Number of planes
    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }
}

impl Drop for DstReadGuard<'_> {
    fn drop(&mut self) {
        for handle in self.planes.iter_mut().flatten() {
            handle.unmap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dmabuf::MemfdAllocator;

    fn src_entry(capacity: usize) -> SrcEntry {
        let alloc = MemfdAllocator::new();
        SrcEntry::new(0, alloc.alloc(capacity).unwrap())
    }

    #[test]
    fn test_copy_in_within_capacity() {
        let mut entry = src_entry(64);
        entry.copy_in(b"hello", None).unwrap();
        assert_eq!(entry.len(), 5);
        assert_eq!(entry.data().unwrap(), b"hello");
        assert_eq!(entry.capacity(), 64);
    }

    #[test]
    fn test_copy_in_growth_requires_allocator() {
        let mut entry = src_entry(8);
        let big = vec![0xabu8; 100];

        let err = entry.copy_in(&big, None).unwrap_err();
        assert!(matches!(err, Error::AllocationFailed(_)));
        assert_eq!(entry.capacity(), 8);

        let alloc = MemfdAllocator::new();
        entry.copy_in(&big, Some(&alloc)).unwrap();
        assert_eq!(entry.len(), 100);
        assert!(entry.capacity() >= 100);
        assert_eq!(entry.data().unwrap(), &big[..]);
    }

    #[test]
    fn test_set_params_keeps_content() {
        let mut entry = src_entry(16);
        entry.copy_in(b"abc", None).unwrap();
        entry.set_params(12345);
        assert_eq!(entry.timestamp(), 12345);
        assert_eq!(entry.data().unwrap(), b"abc");
    }

    fn backed_dst(pool: &Arc<DstFreePool>, plane_sizes: &[usize]) -> DstEntry {
        let alloc = MemfdAllocator::new();
        let planes = plane_sizes
            .iter()
            .map(|&s| alloc.alloc(s).unwrap())
            .collect();
        DstEntry::new_backed(0, planes, pool)
    }

    #[test]
    fn test_read_rejected_before_wait() {
        let pool = DstFreePool::new();
        let entry = backed_dst(&pool, &[4096]);
        assert!(matches!(entry.read_start(), Err(Error::InvalidState(_))));
        assert!(matches!(entry.wait(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_wait_and_read_after_completion() {
        let pool = DstFreePool::new();
        let entry = backed_dst(&pool, &[4096]);

        entry.shared().mark_queued(7);
        entry.shared().complete(CompletionStatus::Success, vec![4096]);

        entry.wait().unwrap();
        assert_eq!(entry.bytes_used(0), Some(4096));
        let guard = entry.read_start().unwrap();
        assert_eq!(guard.data(0).unwrap().len(), 4096);
        drop(guard);

        // Mapping released on guard drop
        assert!(entry
            .shared()
            .planes
            .lock()
            .iter()
            .flatten()
            .all(|h| !h.is_mapped()));
    }

    #[test]
    fn test_failed_completion_rejects_read() {
        let pool = DstFreePool::new();
        let entry = backed_dst(&pool, &[4096]);

        entry.shared().mark_queued(7);
        entry
            .shared()
            .complete(CompletionStatus::DecodingError, vec![0]);

        assert!(matches!(entry.wait(), Err(Error::DecodingError(_))));
        assert!(entry.read_start().is_err());
        assert_eq!(entry.bytes_used(0), None);

        // A failed entry may still be recycled
        entry.free();
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_wait_timeout_on_stuck_entry() {
        let pool = DstFreePool::new();
        let entry = backed_dst(&pool, &[64]);
        entry.shared().mark_queued(9);

        let begin = Instant::now();
        let err = entry.wait_timeout(Duration::from_millis(50)).unwrap_err();
        assert!(begin.elapsed() >= Duration::from_millis(50));
        assert!(matches!(err, Error::OperationFailed(_)));
    }

    #[test]
    fn test_free_into_dead_pool_deletes() {
        let pool = DstFreePool::new();
        let entry = backed_dst(&pool, &[64]);
        let witness = Arc::downgrade(entry.shared());

        drop(pool);
        entry.free();

        // The entry was deleted, not parked in a pool
        assert!(witness.upgrade().is_none());
    }

    #[test]
    fn test_import_fd_rules() {
        let pool = DstFreePool::new();
        let entry = DstEntry::new_slot(0, vec![4096, 2048], &pool);
        let alloc = MemfdAllocator::new();

        // Size must match the negotiated plane size
        let buf = alloc.alloc(4096).unwrap();
        let wrong = buf.dup_fd().unwrap();
        assert!(entry.import_fd(0, wrong, 1000).is_err());

        let fd = buf.dup_fd().unwrap();
        entry.import_fd(0, fd, 4096).unwrap();

        // Double-binding is rejected
        let again = buf.dup_fd().unwrap();
        assert!(matches!(
            entry.import_fd(0, again, 4096),
            Err(Error::InvalidState(_))
        ));

        // Round-trip: the exported descriptor references the same memory
        let mut through = crate::dmabuf::DmaBufHandle::import(entry.dup_fd(0).unwrap(), 4096);
        through.map().unwrap();
        through.data_mut().unwrap()[..4].copy_from_slice(b"ping");
        drop(through);

        let mut original = buf;
        original.map().unwrap();
        assert_eq!(&original.data().unwrap()[..4], b"ping");
    }
}
