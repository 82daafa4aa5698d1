//! Completion-notification reactor
//!
//! The request layer learns about hardware completions from descriptor
//! readiness. [`Reactor`] is the registration contract the core consumes: an
//! fd, a polling interest, and a callback invoked when the fd becomes ready.
//! [`PollReactor`] is a self-contained poll(2)-loop implementation; embedders
//! with their own event loop implement the trait instead.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::warn;

/// Readiness condition to watch for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Data readable (POLLIN)
    Readable,
    /// Exceptional condition (POLLPRI); media requests signal completion this way
    Priority,
}

/// Completion callback, invoked on the reactor's dispatch context
pub type Callback = Box<dyn FnMut() + Send>;

/// Registration contract between the request layer and an event loop
///
/// Registrations must be removable before the associated descriptor is
/// destroyed; unregistering from within a callback is legal.
pub trait Reactor: Send + Sync {
    /// Watch `fd` for `interest`, invoking `callback` on each readiness event
    fn register(&self, fd: RawFd, interest: Interest, callback: Callback) -> Result<()>;

    /// Stop watching `fd`
    fn unregister(&self, fd: RawFd) -> Result<()>;
}

struct PollEntry {
    interest: Interest,
    // Callback behind its own lock so dispatch can run without holding the
    // table lock (a callback may re-enter register/unregister).
    callback: Arc<Mutex<Callback>>,
}

struct PollShared {
    entries: Mutex<HashMap<RawFd, PollEntry>>,
    wake_fd: RawFd,
    shutdown: AtomicBool,
}

/// Poll(2)-loop reactor running on one background thread
///
/// A self-pipe wakes the loop whenever the registration table changes, so new
/// fds are picked up without waiting for unrelated traffic.
pub struct PollReactor {
    shared: Arc<PollShared>,
    wake_tx: RawFd,
    thread: Option<thread::JoinHandle<()>>,
}

impl PollReactor {
    /// Start the polling thread
    pub fn new() -> Result<Self> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } < 0 {
            return Err(Error::from_errno("pipe2"));
        }
        let (wake_rx, wake_tx) = (fds[0], fds[1]);

        let shared = Arc::new(PollShared {
            entries: Mutex::new(HashMap::new()),
            wake_fd: wake_rx,
            shutdown: AtomicBool::new(false),
        });

        let loop_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("vidreq-poll".into())
            .spawn(move || poll_loop(loop_shared))
            .map_err(|e| Error::operation(format!("spawn poll thread: {}", e)))?;

        Ok(PollReactor {
            shared,
            wake_tx,
            thread: Some(thread),
        })
    }

    fn wake(&self) {
        let buf = [1u8];
        unsafe {
            libc::write(self.wake_tx, buf.as_ptr() as *const libc::c_void, 1);
        }
    }
}

impl Reactor for PollReactor {
    fn register(&self, fd: RawFd, interest: Interest, callback: Callback) -> Result<()> {
        let mut entries = self.shared.entries.lock();
        if entries.contains_key(&fd) {
            return Err(Error::invalid_state(format!("fd {} already registered", fd)));
        }
        entries.insert(
            fd,
            PollEntry {
                interest,
                callback: Arc::new(Mutex::new(callback)),
            },
        );
        drop(entries);
        self.wake();
        Ok(())
    }

    fn unregister(&self, fd: RawFd) -> Result<()> {
        let removed = self.shared.entries.lock().remove(&fd);
        if removed.is_none() {
            return Err(Error::invalid_state(format!("fd {} not registered", fd)));
        }
        self.wake();
        Ok(())
    }
}

impl Drop for PollReactor {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.wake();
        if let Some(t) = self.thread.take() {
            // The last reference can die inside a dispatched callback, on
            // the loop thread itself; joining there would deadlock. The
            // detached loop exits on the shutdown flag.
            if t.thread().id() != thread::current().id() {
                let _ = t.join();
            }
        }
        unsafe {
            libc::close(self.wake_tx);
            libc::close(self.shared.wake_fd);
        }
    }
}

fn poll_loop(shared: Arc<PollShared>) {
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }

        // Snapshot the table into a pollfd array; slot 0 is the wake pipe.
        let mut pollfds = vec![libc::pollfd {
            fd: shared.wake_fd,
            events: libc::POLLIN,
            revents: 0,
        }];
        {
            let entries = shared.entries.lock();
            for (&fd, entry) in entries.iter() {
                let events = match entry.interest {
                    Interest::Readable => libc::POLLIN,
                    Interest::Priority => libc::POLLPRI,
                };
                pollfds.push(libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                });
            }
        }

        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            warn!("poll loop terminating: {}", err);
            return;
        }

        if pollfds[0].revents != 0 {
            drain_pipe(shared.wake_fd);
        }

        // Collect ready callbacks, then dispatch without the table lock.
        let mut ready = Vec::new();
        let mut stale = Vec::new();
        {
            let entries = shared.entries.lock();
            for pfd in &pollfds[1..] {
                if pfd.revents == 0 {
                    continue;
                }
                if pfd.revents & libc::POLLNVAL != 0 {
                    stale.push(pfd.fd);
                    continue;
                }
                if let Some(entry) = entries.get(&pfd.fd) {
                    ready.push(Arc::clone(&entry.callback));
                }
            }
        }
        if !stale.is_empty() {
            let mut entries = shared.entries.lock();
            for fd in stale {
                warn!("dropping registration for closed fd {}", fd);
                entries.remove(&fd);
            }
        }
        for callback in ready {
            let mut cb = callback.lock();
            (*cb)();
        }
    }
}

fn drain_pipe(fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn eventfd() -> RawFd {
        unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) }
    }

    fn signal(fd: RawFd) {
        let v = 1u64.to_ne_bytes();
        unsafe {
            libc::write(fd, v.as_ptr() as *const libc::c_void, 8);
        }
    }

    fn clear(fd: RawFd) {
        let mut v = [0u8; 8];
        unsafe {
            libc::read(fd, v.as_mut_ptr() as *mut libc::c_void, 8);
        }
    }

    #[test]
    fn test_callback_fires_on_readiness() {
        let reactor = PollReactor::new().unwrap();
        let fd = eventfd();
        let (tx, rx) = mpsc::channel();

        reactor
            .register(
                fd,
                Interest::Readable,
                Box::new(move || {
                    clear(fd);
                    tx.send(()).unwrap();
                }),
            )
            .unwrap();

        signal(fd);
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        reactor.unregister(fd).unwrap();
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_unregister_stops_delivery() {
        let reactor = PollReactor::new().unwrap();
        let fd = eventfd();
        let (tx, rx) = mpsc::channel();

        reactor
            .register(
                fd,
                Interest::Readable,
                Box::new(move || {
                    clear(fd);
                    tx.send(()).unwrap();
                }),
            )
            .unwrap();
        reactor.unregister(fd).unwrap();

        signal(fd);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let reactor = PollReactor::new().unwrap();
        let fd = eventfd();
        reactor
            .register(fd, Interest::Readable, Box::new(|| {}))
            .unwrap();
        assert!(reactor
            .register(fd, Interest::Readable, Box::new(|| {}))
            .is_err());
        reactor.unregister(fd).unwrap();
        unsafe { libc::close(fd) };
    }
}
