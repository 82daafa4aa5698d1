//! Emulated stateless decode device
//!
//! Implements the full [`DecodeDevice`] contract in-process: request handles
//! are eventfds, a worker thread stands in for the hardware, and "decoding"
//! is a deterministic transform of the source bytes into the negotiated
//! plane layout. Completion signaling goes through real descriptors, so the
//! request pool, reactor, and wait paths are exercised exactly as they would
//! be against hardware.
//!
//! Fault injection hooks cover the failure paths a real device can take:
//! rejected submissions, per-frame decode errors, delayed (out-of-order)
//! completions, and refused formats.

use super::{
    ctrl, CompletedDst, DecodeDevice, ExtControl, QueryExtControl, QueueDir, SrcQueueArgs,
};
use crate::dmabuf::DmaBufHandle;
use crate::error::{CompletionStatus, Error, Result};
use crate::format::{DstFormat, PixelFormat, RtFormat, SrcFormat};
use crate::reactor::Interest;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

fn eventfd() -> Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if fd < 0 {
        return Err(Error::from_errno("eventfd"));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn signal_eventfd(fd: RawFd) {
    let v = 1u64.to_ne_bytes();
    unsafe {
        libc::write(fd, v.as_ptr() as *const libc::c_void, 8);
    }
}

fn drain_eventfd(fd: RawFd) {
    let mut v = [0u8; 8];
    unsafe {
        libc::read(fd, v.as_mut_ptr() as *mut libc::c_void, 8);
    }
}

fn dup_fd(fd: RawFd) -> Result<OwnedFd> {
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if dup < 0 {
        return Err(Error::from_errno("dup"));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

/// A source buffer staged against a not-yet-submitted request
struct StagedSrc {
    index: u32,
    fd: OwnedFd,
    capacity: usize,
    length: usize,
    timestamp: u64,
    hold_dst: bool,
}

/// A submitted decode job awaiting execution
struct Job {
    request_fd: RawFd,
    src: StagedSrc,
    due: Option<Instant>,
}

/// A queued destination buffer slot with duplicated plane descriptors
struct DstSlot {
    index: u32,
    timestamp: u64,
    planes: Vec<(OwnedFd, usize)>,
}

#[derive(Default)]
struct Faults {
    reject_submissions: usize,
    decode_errors: HashSet<u64>,
    delays: HashMap<u64, Duration>,
}

struct State {
    src_fmt: Option<SrcFormat>,
    dst_fmt: Option<DstFormat>,
    src_buf_count: u32,
    dst_buf_count: u32,
    requests: HashMap<RawFd, Option<StagedSrc>>,
    jobs: Vec<Job>,
    // Queued picture slots, matched to jobs by timestamp; a slot survives
    // non-final (held) requests until the final one completes it.
    dst_slots: Vec<DstSlot>,
    done_src: VecDeque<u32>,
    done_dst: VecDeque<CompletedDst>,
    streaming_src: bool,
    streaming_dst: bool,
    faults: Faults,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    worker_wake: Condvar,
    poll_ev: OwnedFd,
    src_formats: Vec<PixelFormat>,
    dst_formats: Vec<RtFormat>,
    controls: Vec<(u32, &'static str, usize)>,
}

/// In-process emulated stateless decoder
pub struct SoftwareDevice {
    shared: Arc<Shared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SoftwareDevice {
    /// Create a device supporting every format this crate defines
    pub fn new() -> Result<Self> {
        Self::with_formats(
            &[
                PixelFormat::H264Slice,
                PixelFormat::HevcSlice,
                PixelFormat::Vp8Frame,
                PixelFormat::Vp9Frame,
                PixelFormat::Av1Frame,
                PixelFormat::Mpeg2Slice,
            ],
            &[
                RtFormat::Nv12,
                RtFormat::Nv12Mplane,
                RtFormat::P010,
                RtFormat::Yuv420,
                RtFormat::Yuv420Mplane,
            ],
        )
    }

    /// Create a device supporting only the given formats
    pub fn with_formats(src: &[PixelFormat], dst: &[RtFormat]) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                src_fmt: None,
                dst_fmt: None,
                src_buf_count: 0,
                dst_buf_count: 0,
                requests: HashMap::new(),
                jobs: Vec::new(),
                dst_slots: Vec::new(),
                done_src: VecDeque::new(),
                done_dst: VecDeque::new(),
                streaming_src: false,
                streaming_dst: false,
                faults: Faults::default(),
                shutdown: false,
            }),
            worker_wake: Condvar::new(),
            poll_ev: eventfd()?,
            src_formats: src.to_vec(),
            dst_formats: dst.to_vec(),
            controls: vec![
                (ctrl::H264_DECODE_MODE, "H264 Decode Mode", 4),
                (ctrl::H264_START_CODE, "H264 Start Code", 4),
                (ctrl::H264_SPS, "H264 Sequence Parameter Set", 44),
                (ctrl::H264_PPS, "H264 Picture Parameter Set", 36),
                (ctrl::H264_SCALING_MATRIX, "H264 Scaling Matrix", 160),
                (ctrl::H264_SLICE_PARAMS, "H264 Slice Parameters", 48),
                (ctrl::H264_DECODE_PARAMS, "H264 Decode Parameters", 200),
                (ctrl::VP8_FRAME, "VP8 Frame Header", 280),
                (ctrl::MPEG2_SEQUENCE, "MPEG-2 Sequence Header", 12),
                (ctrl::MPEG2_PICTURE, "MPEG-2 Picture Header", 16),
            ],
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("vidreq-swdev".into())
            .spawn(move || worker_loop(worker_shared))
            .map_err(|e| Error::operation(format!("spawn device worker: {}", e)))?;

        Ok(SoftwareDevice {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Fail the next `n` request submissions with a device-busy error
    pub fn inject_submit_failure(&self, n: usize) {
        self.shared.state.lock().faults.reject_submissions = n;
    }

    /// Report a decode error for the picture carrying `timestamp`
    pub fn inject_decode_error(&self, timestamp: u64) {
        self.shared
            .state
            .lock()
            .faults
            .decode_errors
            .insert(timestamp);
    }

    /// Delay completion of the picture carrying `timestamp`
    ///
    /// Later submissions without a delay complete first, which forces the
    /// out-of-order completion path.
    pub fn inject_completion_delay(&self, timestamp: u64, delay: Duration) {
        self.shared.state.lock().faults.delays.insert(timestamp, delay);
    }

    /// The deterministic "decode" transform: what plane `plane` of a picture
    /// decoded from `src` will contain, for a plane of `size` bytes
    ///
    /// Tests compare read-back data against this.
    pub fn reference_plane(src: &[u8], plane: usize, size: usize) -> Vec<u8> {
        let mut out = vec![0u8; size];
        if src.is_empty() {
            return out;
        }
        for (i, b) in out.iter_mut().enumerate() {
            *b = src[i % src.len()] ^ (plane as u8);
        }
        out
    }
}

impl Drop for SoftwareDevice {
    fn drop(&mut self) {
        {
            let mut st = self.shared.state.lock();
            st.shutdown = true;
        }
        self.shared.worker_wake.notify_all();
        if let Some(w) = self.worker.lock().take() {
            let _ = w.join();
        }
    }
}

/// Write the decode result for `job` into `slot`'s planes
fn run_decode(job: &Job, slot: &DstSlot, poisoned: bool) -> (CompletionStatus, Vec<usize>) {
    if poisoned {
        return (CompletionStatus::DecodingError, vec![0; slot.planes.len()]);
    }

    // Read the coded data through the descriptor the way hardware would
    let src_bytes = match read_src(&job.src) {
        Ok(b) => b,
        Err(e) => {
            warn!("source read failed: {}", e);
            return (CompletionStatus::OperationFailed, vec![0; slot.planes.len()]);
        }
    };

    let mut bytes_used = Vec::with_capacity(slot.planes.len());
    for (plane, (fd, size)) in slot.planes.iter().enumerate() {
        let dup = match dup_fd(fd.as_raw_fd()) {
            Ok(d) => d,
            Err(e) => {
                warn!("plane dup failed: {}", e);
                return (CompletionStatus::OperationFailed, vec![0; slot.planes.len()]);
            }
        };
        let mut handle = DmaBufHandle::import(dup, *size);
        if handle.map().is_err() {
            return (CompletionStatus::OperationFailed, vec![0; slot.planes.len()]);
        }
        let pattern = SoftwareDevice::reference_plane(&src_bytes, plane, *size);
        handle.data_mut().expect("mapped").copy_from_slice(&pattern);
        bytes_used.push(*size);
    }
    (CompletionStatus::Success, bytes_used)
}

fn read_src(src: &StagedSrc) -> Result<Bytes> {
    let dup = dup_fd(src.fd.as_raw_fd())?;
    let mut handle = DmaBufHandle::import(dup, src.capacity);
    handle.map()?;
    let data = handle.data().expect("mapped");
    Ok(Bytes::copy_from_slice(&data[..src.length.min(data.len())]))
}

fn worker_loop(shared: Arc<Shared>) {
    let mut st = shared.state.lock();
    loop {
        if st.shutdown {
            return;
        }

        let now = Instant::now();
        let runnable = st.streaming_src && st.streaming_dst;
        let pick = if runnable {
            st.jobs.iter().position(|job| {
                let due = job.due.map_or(true, |d| d <= now);
                due && st
                    .dst_slots
                    .iter()
                    .any(|s| s.timestamp == job.src.timestamp)
            })
        } else {
            None
        };

        let Some(pick) = pick else {
            // Sleep until the earliest delayed job is due, or until queue
            // state changes.
            let next_due = if runnable {
                st.jobs.iter().filter_map(|j| j.due).min()
            } else {
                None
            };
            match next_due {
                Some(due) => {
                    let timeout = due.saturating_duration_since(Instant::now());
                    shared.worker_wake.wait_for(&mut st, timeout);
                }
                None => shared.worker_wake.wait(&mut st),
            }
            continue;
        };

        let job = st.jobs.remove(pick);
        let slot_pos = st
            .dst_slots
            .iter()
            .position(|s| s.timestamp == job.src.timestamp)
            .expect("matching slot checked above");
        let slot = st.dst_slots.remove(slot_pos);
        let poisoned = st.faults.decode_errors.remove(&job.src.timestamp);

        // The transform runs without the device lock held, as hardware would.
        drop(st);
        let (status, bytes_used) = run_decode(&job, &slot, poisoned);
        debug!(
            timestamp = job.src.timestamp,
            index = slot.index,
            %status,
            hold = job.src.hold_dst,
            "decode job finished"
        );
        st = shared.state.lock();

        // Source buffer is consumed and the request is complete either way.
        st.done_src.push_back(job.src.index);
        signal_eventfd(shared.poll_ev.as_raw_fd());
        signal_eventfd(job.request_fd);

        if job.src.hold_dst && status == CompletionStatus::Success {
            // Held open for the next slice of the same picture
            st.dst_slots.push(slot);
        } else {
            st.done_dst.push_back(CompletedDst {
                index: slot.index,
                timestamp: job.src.timestamp,
                status,
                bytes_used,
            });
            signal_eventfd(shared.poll_ev.as_raw_fd());
        }
    }
}

impl DecodeDevice for SoftwareDevice {
    fn driver(&self) -> String {
        "vidreq-software".into()
    }

    fn enum_src_formats(&self) -> Result<Vec<PixelFormat>> {
        Ok(self.shared.src_formats.clone())
    }

    fn enum_dst_formats(&self) -> Result<Vec<RtFormat>> {
        Ok(self.shared.dst_formats.clone())
    }

    fn set_src_format(
        &self,
        pixel_format: PixelFormat,
        width: u32,
        height: u32,
        buffer_size: usize,
    ) -> Result<SrcFormat> {
        if !self.shared.src_formats.contains(&pixel_format) {
            return Err(Error::unsupported_format(format!(
                "source format {} not supported",
                pixel_format
            )));
        }
        if width == 0 || height == 0 {
            return Err(Error::invalid_input("zero dimension"));
        }
        let fmt = SrcFormat {
            pixel_format,
            width,
            height,
            buffer_size: buffer_size.max(4096),
        };
        self.shared.state.lock().src_fmt = Some(fmt);
        Ok(fmt)
    }

    fn set_dst_format(&self, rt_format: RtFormat, width: u32, height: u32) -> Result<DstFormat> {
        if !self.shared.dst_formats.contains(&rt_format) {
            return Err(Error::unsupported_format(format!(
                "destination format {} not supported",
                rt_format
            )));
        }
        if width == 0 || height == 0 {
            return Err(Error::invalid_input("zero dimension"));
        }
        // Hardware granularity: luma rows and columns in pairs
        let fmt = DstFormat::new(rt_format, width.next_multiple_of(2), height.next_multiple_of(2));
        self.shared.state.lock().dst_fmt = Some(fmt.clone());
        Ok(fmt)
    }

    fn dst_format(&self) -> Result<DstFormat> {
        self.shared
            .state
            .lock()
            .dst_fmt
            .clone()
            .ok_or_else(|| Error::invalid_state("destination format not negotiated"))
    }

    fn create_src_bufs(&self, count: u32) -> Result<Vec<u32>> {
        let mut st = self.shared.state.lock();
        if st.src_fmt.is_none() {
            return Err(Error::invalid_state("source format not negotiated"));
        }
        let first = st.src_buf_count;
        st.src_buf_count += count;
        Ok((first..st.src_buf_count).collect())
    }

    fn create_dst_bufs(&self, count: u32) -> Result<Vec<u32>> {
        let mut st = self.shared.state.lock();
        if st.dst_fmt.is_none() {
            return Err(Error::invalid_state("destination format not negotiated"));
        }
        let first = st.dst_buf_count;
        st.dst_buf_count += count;
        Ok((first..st.dst_buf_count).collect())
    }

    fn queue_src(&self, args: SrcQueueArgs) -> Result<()> {
        let mut st = self.shared.state.lock();
        if args.index >= st.src_buf_count {
            return Err(Error::unsupported_buffer(format!(
                "source index {} beyond registered {}",
                args.index, st.src_buf_count
            )));
        }
        let staged = st
            .requests
            .get_mut(&args.request_fd)
            .ok_or_else(|| Error::invalid_input("unknown request fd"))?;
        if staged.is_some() {
            return Err(Error::invalid_state("request already carries a source buffer"));
        }
        *staged = Some(StagedSrc {
            index: args.index,
            fd: dup_fd(args.fd)?,
            capacity: args.capacity,
            length: args.length,
            timestamp: args.timestamp,
            hold_dst: args.hold_dst,
        });
        Ok(())
    }

    fn queue_dst(&self, index: u32, plane_fds: &[RawFd], timestamp: u64) -> Result<()> {
        let mut st = self.shared.state.lock();
        let fmt = st
            .dst_fmt
            .clone()
            .ok_or_else(|| Error::invalid_state("destination format not negotiated"))?;
        if index >= st.dst_buf_count {
            return Err(Error::unsupported_buffer(format!(
                "destination index {} beyond registered {}",
                index, st.dst_buf_count
            )));
        }
        if plane_fds.len() != fmt.planes.len() {
            return Err(Error::unsupported_buffer(format!(
                "expected {} planes, got {}",
                fmt.planes.len(),
                plane_fds.len()
            )));
        }
        let mut planes = Vec::with_capacity(plane_fds.len());
        for (fd, layout) in plane_fds.iter().zip(fmt.planes.iter()) {
            planes.push((dup_fd(*fd)?, layout.size));
        }
        st.dst_slots.push(DstSlot {
            index,
            timestamp,
            planes,
        });
        drop(st);
        self.shared.worker_wake.notify_all();
        Ok(())
    }

    fn dequeue_src(&self) -> Result<Option<u32>> {
        let mut st = self.shared.state.lock();
        let out = st.done_src.pop_front();
        if out.is_none() && st.done_dst.is_empty() {
            drain_eventfd(self.shared.poll_ev.as_raw_fd());
        }
        Ok(out)
    }

    fn dequeue_dst(&self) -> Result<Option<CompletedDst>> {
        let mut st = self.shared.state.lock();
        let out = st.done_dst.pop_front();
        if out.is_none() && st.done_src.is_empty() {
            drain_eventfd(self.shared.poll_ev.as_raw_fd());
        }
        Ok(out)
    }

    fn stream_on(&self, dir: QueueDir) -> Result<()> {
        let mut st = self.shared.state.lock();
        match dir {
            QueueDir::Src => st.streaming_src = true,
            QueueDir::Dst => st.streaming_dst = true,
        }
        drop(st);
        self.shared.worker_wake.notify_all();
        Ok(())
    }

    fn stream_off(&self, dir: QueueDir) -> Result<()> {
        let mut st = self.shared.state.lock();
        match dir {
            QueueDir::Src => {
                st.streaming_src = false;
                // Pending jobs are cancelled: their requests complete and
                // their source buffers come back.
                let jobs = std::mem::take(&mut st.jobs);
                for job in jobs {
                    st.done_src.push_back(job.src.index);
                    signal_eventfd(job.request_fd);
                    signal_eventfd(self.shared.poll_ev.as_raw_fd());
                }
            }
            QueueDir::Dst => {
                st.streaming_dst = false;
                // Queued pictures that never decoded complete with an error
                // so waiters observe a terminal state.
                let slots: Vec<DstSlot> = st.dst_slots.drain(..).collect();
                for slot in slots {
                    let n = slot.planes.len();
                    st.done_dst.push_back(CompletedDst {
                        index: slot.index,
                        timestamp: slot.timestamp,
                        status: CompletionStatus::OperationFailed,
                        bytes_used: vec![0; n],
                    });
                    signal_eventfd(self.shared.poll_ev.as_raw_fd());
                }
            }
        }
        drop(st);
        self.shared.worker_wake.notify_all();
        Ok(())
    }

    fn set_ext_ctrls(&self, request_fd: Option<RawFd>, ctrls: &[ExtControl]) -> Result<()> {
        let st = self.shared.state.lock();
        if let Some(fd) = request_fd {
            if !st.requests.contains_key(&fd) {
                return Err(Error::invalid_input("unknown request fd"));
            }
        }
        for c in ctrls {
            let Some((_, _, size)) = self
                .shared
                .controls
                .iter()
                .find(|(id, _, _)| *id == c.id)
            else {
                return Err(Error::UnsupportedControl(c.id));
            };
            if c.data.len() != *size {
                return Err(Error::ControlSize {
                    id: c.id,
                    expected: *size,
                    got: c.data.len(),
                });
            }
        }
        Ok(())
    }

    fn query_ext_ctrls(&self, ctrls: &mut [QueryExtControl]) -> Result<()> {
        for c in ctrls.iter_mut() {
            let Some((_, name, size)) = self
                .shared
                .controls
                .iter()
                .find(|(id, _, _)| *id == c.id)
            else {
                return Err(Error::UnsupportedControl(c.id));
            };
            c.name = (*name).into();
            c.elem_size = *size;
        }
        Ok(())
    }

    fn alloc_request(&self) -> Result<OwnedFd> {
        let fd = eventfd()?;
        self.shared.state.lock().requests.insert(fd.as_raw_fd(), None);
        Ok(fd)
    }

    fn submit_request(&self, request_fd: RawFd) -> Result<()> {
        let mut st = self.shared.state.lock();
        if st.faults.reject_submissions > 0 {
            st.faults.reject_submissions -= 1;
            return Err(Error::operation("device busy"));
        }
        let staged = st
            .requests
            .get_mut(&request_fd)
            .ok_or_else(|| Error::invalid_input("unknown request fd"))?;
        let src = staged
            .take()
            .ok_or_else(|| Error::invalid_state("request carries no source buffer"))?;
        let due = st
            .faults
            .delays
            .remove(&src.timestamp)
            .map(|d| Instant::now() + d);
        st.jobs.push(Job {
            request_fd,
            src,
            due,
        });
        drop(st);
        self.shared.worker_wake.notify_all();
        Ok(())
    }

    fn reinit_request(&self, request_fd: RawFd) -> Result<()> {
        let mut st = self.shared.state.lock();
        let staged = st
            .requests
            .get_mut(&request_fd)
            .ok_or_else(|| Error::invalid_input("unknown request fd"))?;
        *staged = None;
        drain_eventfd(request_fd);
        Ok(())
    }

    fn poll_fd(&self) -> RawFd {
        self.shared.poll_ev.as_raw_fd()
    }

    fn request_interest(&self) -> Interest {
        // eventfd completion marker; the real backend uses Priority
        Interest::Readable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> SoftwareDevice {
        let dev = SoftwareDevice::new().unwrap();
        dev.set_src_format(PixelFormat::H264Slice, 64, 64, 4096)
            .unwrap();
        dev.set_dst_format(RtFormat::Nv12, 64, 64).unwrap();
        dev
    }

    #[test]
    fn test_format_negotiation() {
        let dev = SoftwareDevice::with_formats(&[PixelFormat::H264Slice], &[RtFormat::Nv12])
            .unwrap();
        assert!(dev
            .set_src_format(PixelFormat::Vp9Frame, 64, 64, 4096)
            .is_err());
        assert!(dev.set_dst_format(RtFormat::P010, 64, 64).is_err());

        // Odd dimensions are rounded up to the next even value
        let fmt = dev.set_dst_format(RtFormat::Nv12, 63, 63).unwrap();
        assert_eq!((fmt.width, fmt.height), (64, 64));
        assert_eq!(dev.dst_format().unwrap(), fmt);
    }

    #[test]
    fn test_buffer_registration_requires_format() {
        let dev = SoftwareDevice::new().unwrap();
        assert!(dev.create_src_bufs(2).is_err());
        dev.set_src_format(PixelFormat::H264Slice, 64, 64, 4096)
            .unwrap();
        assert_eq!(dev.create_src_bufs(2).unwrap(), vec![0, 1]);
        assert_eq!(dev.create_src_bufs(2).unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_control_validation() {
        let dev = setup();
        let mut q = [QueryExtControl::new(ctrl::H264_SPS)];
        dev.query_ext_ctrls(&mut q).unwrap();
        assert_eq!(q[0].elem_size, 44);
        assert!(!q[0].name.is_empty());

        let ok = ExtControl::new(ctrl::H264_SPS, vec![0; 44]);
        assert!(dev.set_ext_ctrls(None, &[ok]).is_ok());

        let short = ExtControl::new(ctrl::H264_SPS, vec![0; 10]);
        assert!(matches!(
            dev.set_ext_ctrls(None, &[short]),
            Err(Error::ControlSize { .. })
        ));

        let unknown = ExtControl::new(0xdead_beef, vec![]);
        assert!(matches!(
            dev.set_ext_ctrls(None, &[unknown]),
            Err(Error::UnsupportedControl(_))
        ));
    }

    #[test]
    fn test_submit_requires_staged_source() {
        let dev = setup();
        let req = dev.alloc_request().unwrap();
        assert!(matches!(
            dev.submit_request(req.as_raw_fd()),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_submit_fault_injection() {
        let dev = setup();
        dev.create_src_bufs(1).unwrap();
        let alloc = crate::dmabuf::MemfdAllocator::new();
        let buf = crate::dmabuf::DmaBufAllocator::alloc(&alloc, 4096).unwrap();
        let req = dev.alloc_request().unwrap();
        dev.queue_src(SrcQueueArgs {
            index: 0,
            fd: buf.as_raw_fd(),
            capacity: 4096,
            length: 16,
            timestamp: 1000,
            request_fd: req.as_raw_fd(),
            hold_dst: false,
        })
        .unwrap();

        dev.inject_submit_failure(1);
        assert!(dev.submit_request(req.as_raw_fd()).is_err());
        // The staged buffer survives the rejection; a reinit clears it
        dev.reinit_request(req.as_raw_fd()).unwrap();
        assert!(matches!(
            dev.submit_request(req.as_raw_fd()),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_reference_plane_is_deterministic() {
        let src = b"abc";
        let p0 = SoftwareDevice::reference_plane(src, 0, 6);
        assert_eq!(p0, vec![b'a', b'b', b'c', b'a', b'b', b'c']);
        let p1 = SoftwareDevice::reference_plane(src, 1, 3);
        assert_eq!(p1, vec![b'a' ^ 1, b'b' ^ 1, b'c' ^ 1]);
        assert_eq!(SoftwareDevice::reference_plane(&[], 0, 4), vec![0; 4]);
    }
}
