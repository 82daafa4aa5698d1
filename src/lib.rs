//! vidreq - request-based stateless video decode buffer orchestration
//!
//! vidreq manages the lifecycle of hardware video-decode transactions on
//! platforms where decoding is driven by a request-based, stateless
//! accelerator: a caller fills a source (bitstream) buffer and per-frame
//! control parameters, submits a request binding source, destination, and
//! controls, and later waits for hardware completion before consuming the
//! decoded picture.
//!
//! # Architecture
//!
//! vidreq is organized into several key modules:
//!
//! - `controller`: the [`BufferController`] aggregate root orchestrating
//!   submissions
//! - `request`: the fixed-size [`TransactionPool`] of hardware submission
//!   slots
//! - `queue`: [`SrcEntry`] and [`DstEntry`], the source/destination queue
//!   entries
//! - `device`: the [`DecodeDevice`] seam with a real V4L2 backend and an
//!   in-process emulated backend
//! - `dmabuf`: shareable buffer handles and the allocator seam
//! - `reactor`: completion-notification registration and a poll(2) reactor
//! - `format`: coded and raw format definitions and plane layout math
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vidreq_lib::{
//!     BufferController, MemfdAllocator, PixelFormat, PollReactor, RtFormat,
//!     SoftwareDevice,
//! };
//!
//! # fn main() -> vidreq_lib::Result<()> {
//! let device = Arc::new(SoftwareDevice::new()?);
//! let reactor = Arc::new(PollReactor::new()?);
//! let ctl = BufferController::new(device, reactor, 4)?;
//! let alloc = MemfdAllocator::new();
//!
//! ctl.set_src_format(PixelFormat::H264Slice, 1920, 1080)?;
//! ctl.set_dst_format(RtFormat::Nv12, 1920, 1080)?;
//! ctl.create_src_pool(&alloc, 4)?;
//! ctl.stream_on()?;
//!
//! let mut src = ctl.get_src_entry().expect("source pool exhausted");
//! src.set_params(33_000_000);
//! src.copy_in(&[0u8; 1024], Some(&alloc))?;
//! let dst = ctl.alloc_dst_entry(&alloc)?;
//! let xact = ctl.pool().acquire()?;
//! ctl.start_request(xact, src, &dst, true).map_err(|e| e.error)?;
//!
//! dst.wait()?;
//! let picture = dst.read_start()?;
//! let _y_plane = picture.data(0)?;
//! drop(picture);
//! dst.free();
//! # Ok(())
//! # }
//! ```

pub mod controller;
pub mod device;
pub mod dmabuf;
pub mod error;
pub mod format;
pub mod queue;
pub mod reactor;
pub mod request;

pub use controller::{BufferController, StartRequestError, DEFAULT_DST_ENTRY_LIMIT};
pub use device::software::SoftwareDevice;
#[cfg(feature = "v4l2")]
pub use device::v4l2::V4l2Device;
pub use device::{CompletedDst, DecodeDevice, ExtControl, QueryExtControl, QueueDir, SrcQueueArgs};
pub use dmabuf::{DmaBufAllocator, DmaBufHandle, MemfdAllocator};
pub use error::{CompletionStatus, Error, Result};
pub use format::{DstFormat, PixelFormat, PlaneLayout, RtFormat, SrcFormat};
pub use queue::{DstEntry, DstReadGuard, SrcEntry, WAIT_TIMEOUT};
pub use reactor::{Callback, Interest, PollReactor, Reactor};
pub use request::{Transaction, TransactionPool, ACQUIRE_TIMEOUT};

/// vidreq version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
