//! Stateless decode device abstraction
//!
//! [`DecodeDevice`] is the seam between the buffer-orchestration core and a
//! concrete accelerator. Two backends implement it:
//!
//! - [`v4l2`] - the real V4L2/media-controller backend (feature `v4l2`)
//! - [`software`] - an in-process emulated device used by tests and tooling
//!
//! The trait deliberately mirrors the shape of a request-capable V4L2
//! device: two buffer queues (source/OUTPUT and destination/CAPTURE),
//! per-request extended controls, and request handles allocated from the
//! device that are submitted, polled for completion, and reinitialized for
//! reuse.

#[cfg(feature = "v4l2")]
pub mod v4l2;

pub mod software;

use crate::error::{CompletionStatus, Result};
use crate::format::{DstFormat, PixelFormat, RtFormat, SrcFormat};
use crate::reactor::Interest;
use std::os::fd::{OwnedFd, RawFd};

/// Which of the device's two buffer queues an operation addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDir {
    /// Source (coded bitstream) queue
    Src,
    /// Destination (decoded picture) queue
    Dst,
}

/// One extended control value, set globally or scoped to a request
///
/// The payload layout is control-specific; the device validates its size.
#[derive(Debug, Clone)]
pub struct ExtControl {
    /// Control id
    pub id: u32,
    /// Control payload
    pub data: Vec<u8>,
}

impl ExtControl {
    /// Build a control from an id and payload bytes
    pub fn new(id: u32, data: Vec<u8>) -> Self {
        ExtControl { id, data }
    }
}

/// Descriptor of one extended control, filled in by `query_ext_ctrls`
#[derive(Debug, Clone, Default)]
pub struct QueryExtControl {
    /// Control id to query (set by the caller)
    pub id: u32,
    /// Control name (set by the device)
    pub name: String,
    /// Payload size the device expects (set by the device)
    pub elem_size: usize,
}

impl QueryExtControl {
    /// Build a query for the given control id
    pub fn new(id: u32) -> Self {
        QueryExtControl {
            id,
            ..Default::default()
        }
    }
}

/// Arguments for queueing one source buffer
#[derive(Debug, Clone, Copy)]
pub struct SrcQueueArgs {
    /// Buffer slot index
    pub index: u32,
    /// Backing descriptor (passed per-queue; growth swaps descriptors)
    pub fd: RawFd,
    /// Allocated capacity of the backing buffer
    pub capacity: usize,
    /// Bytes of coded data in use
    pub length: usize,
    /// Timestamp cookie carried through to the matching destination buffer
    pub timestamp: u64,
    /// Request this buffer is bound to
    pub request_fd: RawFd,
    /// Keep the destination buffer held after this request completes
    /// (multi-slice pictures: every request but the final one holds)
    pub hold_dst: bool,
}

/// A destination buffer the device has finished with
#[derive(Debug, Clone)]
pub struct CompletedDst {
    /// Buffer slot index
    pub index: u32,
    /// Timestamp cookie from the source buffer that produced it
    pub timestamp: u64,
    /// How the decode ended
    pub status: CompletionStatus,
    /// Bytes written per memory plane
    pub bytes_used: Vec<usize>,
}

/// Contract between the orchestration core and a stateless decode accelerator
///
/// All methods take `&self`: implementations are internally synchronized, as
/// submission threads and reactor callbacks call in concurrently.
pub trait DecodeDevice: Send + Sync {
    /// Driver identification string
    fn driver(&self) -> String;

    /// Coded formats the device can decode
    fn enum_src_formats(&self) -> Result<Vec<PixelFormat>>;

    /// Raw formats the device can produce
    fn enum_dst_formats(&self) -> Result<Vec<RtFormat>>;

    /// Negotiate the source format; returns the granted format
    fn set_src_format(
        &self,
        pixel_format: PixelFormat,
        width: u32,
        height: u32,
        buffer_size: usize,
    ) -> Result<SrcFormat>;

    /// Negotiate the destination format; returns the granted format, whose
    /// dimensions may differ from the requested ones
    fn set_dst_format(&self, rt_format: RtFormat, width: u32, height: u32) -> Result<DstFormat>;

    /// Current destination format
    fn dst_format(&self) -> Result<DstFormat>;

    /// Register `count` additional source buffer slots; returns their indices
    fn create_src_bufs(&self, count: u32) -> Result<Vec<u32>>;

    /// Register `count` additional destination buffer slots; returns their indices
    fn create_dst_bufs(&self, count: u32) -> Result<Vec<u32>>;

    /// Queue a source buffer, bound to a request
    fn queue_src(&self, args: SrcQueueArgs) -> Result<()>;

    /// Queue a destination buffer slot backed by the given plane descriptors
    ///
    /// `timestamp` is the cookie of the picture this slot is reserved for;
    /// completions are tied back to entries through it, not through queue
    /// order.
    fn queue_dst(&self, index: u32, plane_fds: &[RawFd], timestamp: u64) -> Result<()>;

    /// Reclaim a consumed source buffer, if any is ready
    fn dequeue_src(&self) -> Result<Option<u32>>;

    /// Collect a completed destination buffer, if any is ready
    fn dequeue_dst(&self) -> Result<Option<CompletedDst>>;

    /// Start streaming on one queue
    fn stream_on(&self, dir: QueueDir) -> Result<()>;

    /// Stop streaming on one queue; the device returns all queued buffers
    fn stream_off(&self, dir: QueueDir) -> Result<()>;

    /// Apply extended controls, scoped to `request_fd` when given
    fn set_ext_ctrls(&self, request_fd: Option<RawFd>, ctrls: &[ExtControl]) -> Result<()>;

    /// Fill in descriptors for the given control ids
    fn query_ext_ctrls(&self, ctrls: &mut [QueryExtControl]) -> Result<()>;

    /// Allocate a request handle from the device's request allocator
    fn alloc_request(&self) -> Result<OwnedFd>;

    /// Submit a request for execution
    fn submit_request(&self, request_fd: RawFd) -> Result<()>;

    /// Return a completed (or staged-but-unsubmitted) request to its initial
    /// state for reuse; drops any buffers staged against it
    fn reinit_request(&self, request_fd: RawFd) -> Result<()>;

    /// Descriptor the reactor watches for dequeue readiness
    fn poll_fd(&self) -> RawFd;

    /// Readiness condition signaling request completion on request fds
    fn request_interest(&self) -> Interest;
}

/// Stateless-codec control ids, shared by both backends
pub mod ctrl {
    /// Base of the stateless codec control range
    pub const STATELESS_BASE: u32 = 0x00a4_0900;

    /// H.264 decode mode (frame- vs slice-based)
    pub const H264_DECODE_MODE: u32 = STATELESS_BASE;
    /// H.264 start-code handling
    pub const H264_START_CODE: u32 = STATELESS_BASE + 1;
    /// H.264 sequence parameter set
    pub const H264_SPS: u32 = STATELESS_BASE + 2;
    /// H.264 picture parameter set
    pub const H264_PPS: u32 = STATELESS_BASE + 3;
    /// H.264 scaling matrix
    pub const H264_SCALING_MATRIX: u32 = STATELESS_BASE + 4;
    /// H.264 per-slice parameters
    pub const H264_SLICE_PARAMS: u32 = STATELESS_BASE + 6;
    /// H.264 per-picture decode parameters
    pub const H264_DECODE_PARAMS: u32 = STATELESS_BASE + 7;
    /// VP8 frame header
    pub const VP8_FRAME: u32 = STATELESS_BASE + 200;
    /// MPEG-2 sequence header
    pub const MPEG2_SEQUENCE: u32 = STATELESS_BASE + 220;
    /// MPEG-2 picture header
    pub const MPEG2_PICTURE: u32 = STATELESS_BASE + 221;
}
