//! Request-layer integration tests
//!
//! Drive the full orchestration stack (controller, transaction pool, queue
//! entries, reactor) against the emulated device: real descriptors, real
//! completion dispatch, no hardware required.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use vidreq_lib::{
    BufferController, DmaBufAllocator, DmaBufHandle, Error, MemfdAllocator, PixelFormat,
    PollReactor, RtFormat, SoftwareDevice,
};

fn new_session(transactions: usize) -> (Arc<SoftwareDevice>, BufferController) {
    let device = Arc::new(SoftwareDevice::new().expect("software device"));
    let reactor = Arc::new(PollReactor::new().expect("poll reactor"));
    let ctl = BufferController::new(device.clone(), reactor, transactions).expect("controller");
    (device, ctl)
}

/// Poll until `cond` holds, failing the test after `timeout`
fn wait_until<F: Fn() -> bool>(what: &str, timeout: Duration, cond: F) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_end_to_end_decode() {
    let (_device, ctl) = new_session(4);
    let alloc = MemfdAllocator::new();

    ctl.set_src_format(PixelFormat::H264Slice, 1920, 1080)
        .unwrap();
    let dst_fmt = ctl.set_dst_format(RtFormat::Nv12, 1920, 1080).unwrap();
    assert_eq!((dst_fmt.width, dst_fmt.height), (1920, 1080));
    let plane_size = dst_fmt.plane_size(0).unwrap();
    assert_eq!(plane_size, 1920 * 1080 * 3 / 2);

    ctl.create_src_pool(&alloc, 4).unwrap();

    // Build a free pool of 4 destination entries
    let entries: Vec<_> = (0..4).map(|_| ctl.alloc_dst_entry(&alloc).unwrap()).collect();
    for e in entries {
        e.free();
    }
    assert_eq!(ctl.dst_free_count(), 4);

    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let mut src = ctl.get_src_entry().expect("source pool exhausted");
    src.set_params(33_000_000);
    src.copy_in(&payload, Some(&alloc)).unwrap();

    let dst = ctl.alloc_dst_entry(&alloc).unwrap();
    assert_eq!(ctl.dst_free_count(), 3);

    let xact = ctl.pool().acquire().unwrap();
    ctl.start_request(xact, src, &dst, true)
        .expect("start_request");

    ctl.stream_on().unwrap();
    dst.wait().unwrap();

    let picture = dst.read_start().unwrap();
    let data = picture.data(0).unwrap();
    assert_eq!(data.len(), plane_size);
    assert_eq!(
        data,
        &SoftwareDevice::reference_plane(&payload, 0, plane_size)[..]
    );
    drop(picture);

    dst.free();
    assert_eq!(ctl.dst_free_count(), 4);

    // The consumed source entry and the transaction come home asynchronously
    wait_until("source entry recycle", Duration::from_secs(5), || {
        ctl.src_free_count() == 4
    });
    wait_until("transaction return", Duration::from_secs(5), || {
        ctl.pool().free_count() == 4
    });
}

#[test]
fn test_concurrent_decodes_complete_out_of_order() {
    let (device, ctl) = new_session(2);
    let alloc = MemfdAllocator::new();

    ctl.set_src_format(PixelFormat::H264Slice, 64, 64).unwrap();
    let dst_fmt = ctl.set_dst_format(RtFormat::Nv12, 64, 64).unwrap();
    let plane_size = dst_fmt.plane_size(0).unwrap();
    ctl.create_src_pool(&alloc, 2).unwrap();
    ctl.stream_on().unwrap();

    // The first picture completes ~300ms late, so the second finishes first;
    // completions must still land on the right entries.
    device.inject_completion_delay(1_000, Duration::from_millis(300));

    let mut workers = Vec::new();
    for (timestamp, fill) in [(1_000u64, 0x11u8), (2_000, 0x77)] {
        let ctl = ctl.clone();
        workers.push(thread::spawn(move || {
            let alloc = MemfdAllocator::new();
            let payload = vec![fill; 1024];

            let mut src = ctl.get_src_entry().expect("source entry");
            src.set_params(timestamp);
            src.copy_in(&payload, Some(&alloc)).unwrap();

            let dst = ctl.alloc_dst_entry(&alloc).unwrap();
            let xact = ctl.pool().acquire().unwrap();
            ctl.start_request(xact, src, &dst, true).expect("start");

            dst.wait().unwrap();
            let picture = dst.read_start().unwrap();
            let data = picture.data(0).unwrap();
            assert_eq!(
                data,
                &SoftwareDevice::reference_plane(&payload, 0, plane_size)[..],
                "plane data for timestamp {} is contaminated",
                timestamp
            );
            drop(picture);
            dst.free();
        }));
    }
    for w in workers {
        w.join().expect("worker thread");
    }

    wait_until("both transactions returned", Duration::from_secs(5), || {
        ctl.pool().free_count() == 2
    });
    assert_eq!(ctl.dst_free_count(), 2);
}

#[test]
fn test_multi_slice_picture_completes_on_final_request() {
    let (_device, ctl) = new_session(2);
    let alloc = MemfdAllocator::new();

    ctl.set_src_format(PixelFormat::H264Slice, 64, 64).unwrap();
    let dst_fmt = ctl.set_dst_format(RtFormat::Nv12, 64, 64).unwrap();
    let plane_size = dst_fmt.plane_size(0).unwrap();
    ctl.create_src_pool(&alloc, 2).unwrap();
    ctl.stream_on().unwrap();

    let timestamp = 42_000u64;
    let dst = ctl.alloc_dst_entry(&alloc).unwrap();

    // First slice holds the picture open
    let mut slice0 = ctl.get_src_entry().unwrap();
    slice0.set_params(timestamp);
    slice0.copy_in(&[0xaa; 512], None).unwrap();
    let xact = ctl.pool().acquire().unwrap();
    ctl.start_request(xact, slice0, &dst, false).expect("slice 0");

    // The final slice closes it
    let final_payload = vec![0xbbu8; 512];
    let mut slice1 = ctl.get_src_entry().unwrap();
    slice1.set_params(timestamp);
    slice1.copy_in(&final_payload, None).unwrap();
    let xact = ctl.pool().acquire().unwrap();
    ctl.start_request(xact, slice1, &dst, true).expect("slice 1");

    dst.wait().unwrap();
    let picture = dst.read_start().unwrap();
    assert_eq!(
        picture.data(0).unwrap(),
        &SoftwareDevice::reference_plane(&final_payload, 0, plane_size)[..]
    );
    drop(picture);
    dst.free();

    wait_until("both slices recycled", Duration::from_secs(5), || {
        ctl.src_free_count() == 2 && ctl.pool().free_count() == 2
    });
}

#[test]
fn test_submission_failure_leaves_entries_with_caller() {
    let (device, ctl) = new_session(1);
    let alloc = MemfdAllocator::new();

    ctl.set_src_format(PixelFormat::H264Slice, 64, 64).unwrap();
    ctl.set_dst_format(RtFormat::Nv12, 64, 64).unwrap();
    ctl.create_src_pool(&alloc, 1).unwrap();
    ctl.stream_on().unwrap();

    let payload = vec![0x5au8; 256];
    let mut src = ctl.get_src_entry().unwrap();
    src.set_params(7_000);
    src.copy_in(&payload, None).unwrap();
    let dst = ctl.alloc_dst_entry(&alloc).unwrap();

    device.inject_submit_failure(1);
    let xact = ctl.pool().acquire().unwrap();
    let failure = ctl.start_request(xact, src, &dst, true).unwrap_err();
    assert!(matches!(failure.error, Error::OperationFailed(_)));

    // The transaction is already back in the pool; the source entry came
    // back in the error; the destination entry was never consumed.
    assert_eq!(ctl.pool().free_count(), 1);
    let src = failure.src;
    assert_eq!(src.len(), payload.len());

    let xact = ctl.pool().acquire().unwrap();
    ctl.start_request(xact, src, &dst, true).expect("retry");
    dst.wait().unwrap();
    dst.free();
}

#[test]
fn test_decode_error_is_terminal_but_recyclable() {
    let (device, ctl) = new_session(1);
    let alloc = MemfdAllocator::new();

    ctl.set_src_format(PixelFormat::H264Slice, 64, 64).unwrap();
    ctl.set_dst_format(RtFormat::Nv12, 64, 64).unwrap();
    ctl.create_src_pool(&alloc, 1).unwrap();
    ctl.stream_on().unwrap();

    let timestamp = 9_000u64;
    device.inject_decode_error(timestamp);

    let mut src = ctl.get_src_entry().unwrap();
    src.set_params(timestamp);
    src.copy_in(&[1, 2, 3, 4], None).unwrap();
    let dst = ctl.alloc_dst_entry(&alloc).unwrap();
    let xact = ctl.pool().acquire().unwrap();
    ctl.start_request(xact, src, &dst, true).expect("start");

    assert!(matches!(dst.wait(), Err(Error::DecodingError(_))));
    // Data access is refused after a failed wait
    assert!(dst.read_start().is_err());
    // A failed entry may still be recycled
    dst.free();
    assert_eq!(ctl.dst_free_count(), 1);
}

#[test]
fn test_stream_off_quiesces_in_flight_work() {
    let (device, ctl) = new_session(1);
    let alloc = MemfdAllocator::new();

    ctl.set_src_format(PixelFormat::H264Slice, 64, 64).unwrap();
    ctl.set_dst_format(RtFormat::Nv12, 64, 64).unwrap();
    ctl.create_src_pool(&alloc, 1).unwrap();
    ctl.stream_on().unwrap();

    // This picture would only complete after 30s; stream_off must not wait
    // for it but cancel and still quiesce.
    let timestamp = 5_000u64;
    device.inject_completion_delay(timestamp, Duration::from_secs(30));

    let mut src = ctl.get_src_entry().unwrap();
    src.set_params(timestamp);
    src.copy_in(&[9; 128], None).unwrap();
    let dst = ctl.alloc_dst_entry(&alloc).unwrap();
    let xact = ctl.pool().acquire().unwrap();
    ctl.start_request(xact, src, &dst, true).expect("start");

    let begin = Instant::now();
    ctl.stream_off().unwrap();
    assert!(begin.elapsed() < Duration::from_secs(10));

    // The cancelled picture completed with an error, the transaction and
    // the source entry are home again.
    assert!(dst.wait_timeout(Duration::from_secs(1)).is_err());
    assert_eq!(ctl.pool().free_count(), 1);
    wait_until("source entry recycle", Duration::from_secs(5), || {
        ctl.src_free_count() == 1
    });
    dst.free();
}

#[test]
fn test_imported_buffers_receive_decoded_data() {
    let (_device, ctl) = new_session(1);
    let alloc = MemfdAllocator::new();

    ctl.set_src_format(PixelFormat::H264Slice, 64, 64).unwrap();
    let dst_fmt = ctl.set_dst_format(RtFormat::Nv12Mplane, 64, 64).unwrap();
    assert_eq!(dst_fmt.planes.len(), 2);
    ctl.create_src_pool(&alloc, 1).unwrap();

    // External buffers, as a renderer would provide them
    let mut externals: Vec<DmaBufHandle> = dst_fmt
        .planes
        .iter()
        .map(|p| alloc.alloc(p.size).unwrap())
        .collect();

    let slots = ctl.create_dst_slots(1).unwrap();
    let dst = slots.into_iter().next().unwrap();
    for (plane, ext) in externals.iter().enumerate() {
        let fd = ext.dup_fd().unwrap();
        dst.import_fd(plane, fd, ext.size()).unwrap();
    }

    let payload = vec![0xc3u8; 300];
    let mut src = ctl.get_src_entry().unwrap();
    src.set_params(1_234);
    src.copy_in(&payload, None).unwrap();
    let xact = ctl.pool().acquire().unwrap();
    ctl.start_request(xact, src, &dst, true).expect("start");
    ctl.stream_on().unwrap();
    dst.wait().unwrap();

    // The decode landed in the externally-owned memory: read it back through
    // the original handles, not through the entry.
    for (plane, ext) in externals.iter_mut().enumerate() {
        ext.map().unwrap();
        let expected =
            SoftwareDevice::reference_plane(&payload, plane, dst_fmt.planes[plane].size);
        assert_eq!(ext.data().unwrap(), &expected[..], "plane {}", plane);
    }
    dst.free();
}

#[test]
fn test_session_teardown_with_outstanding_entries() {
    let (_device, ctl) = new_session(2);
    let alloc = MemfdAllocator::new();

    ctl.set_src_format(PixelFormat::H264Slice, 64, 64).unwrap();
    ctl.set_dst_format(RtFormat::Nv12, 64, 64).unwrap();
    ctl.create_src_pool(&alloc, 1).unwrap();
    ctl.stream_on().unwrap();

    let mut src = ctl.get_src_entry().unwrap();
    src.set_params(77);
    src.copy_in(&[4; 64], None).unwrap();
    let dst = ctl.alloc_dst_entry(&alloc).unwrap();
    let xact = ctl.pool().acquire().unwrap();
    ctl.start_request(xact, src, &dst, true).expect("start");
    dst.wait().unwrap();

    // Tear the controller down while the entry is still outstanding
    drop(ctl);

    // Freeing after teardown must delete, not touch dead pool state
    dst.free();
}
