//! Single-threaded I/O multiplexer.
//!
//! The selector keeps a table of registered descriptors indexed by fd. Each entry
//! holds a [`Handler`] and the current [`Interest`]. [`Selector::select`] waits for
//! readiness (bounded by [`SelectorConfig::select_timeout`]) and invokes the
//! handler callbacks on the calling thread.
//!
//! Work that must leave the reactor thread reports back through a [`Notifier`]:
//! `notify_block(fd)` wakes the wait and the selector later delivers
//! [`Handler::handle_block`] for that fd, on the reactor thread. This is the only
//! cross-thread entry point.

mod epoll;

use epoll::{EpollPoller, Readiness, Waker};

use bitflags::bitflags;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, warn};

/// Highest descriptor number (exclusive) the selector accepts
pub const MAX_FD: usize = 65536;

bitflags! {
    /// Interest is the set of readiness kinds a descriptor wants to hear about
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Interest: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

impl Interest {
    pub const NOOP: Interest = Interest::empty();
}

/// SelectorError is returned by every fallible selector operation
#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("file descriptor {0} exceeds the selector limit of {MAX_FD}")]
    MaxFd(RawFd),

    #[error("file descriptor {0} is already registered")]
    FdInUse(RawFd),

    #[error("invalid arguments")]
    InvalidArgs,
}

impl SelectorError {
    /// raw_os_error exposes the OS error code behind an I/O failure
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            SelectorError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

/// SelectorConfig holds the settings shared by every selector instance
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Longest time a single `select` call blocks without activity
    pub select_timeout: Duration,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            select_timeout: Duration::from_secs(10),
        }
    }
}

/// Handler receives the events of a registered descriptor. Every callback
/// defaults to doing nothing.
///
/// The handler object doubles as the registration's attachment: whatever state
/// the callbacks need lives inside the implementor.
pub trait Handler {
    fn handle_read(&self, _key: &mut Key<'_>) {}
    fn handle_write(&self, _key: &mut Key<'_>) {}

    /// handle_close runs when the descriptor is unregistered. The selector entry is
    /// already gone when it is invoked.
    fn handle_close(&self, _key: &mut Key<'_>) {}

    /// handle_block runs after a [`Notifier::notify_block`] for this descriptor
    fn handle_block(&self, _key: &mut Key<'_>) {}
}

/// Key identifies the event being dispatched and gives the callback access to
/// the selector
pub struct Key<'a> {
    pub selector: &'a mut Selector,
    pub fd: RawFd,
}

impl Key<'_> {
    /// set_interest updates the interest of the descriptor this key refers to
    pub fn set_interest(&mut self, interest: Interest) -> Result<(), SelectorError> {
        self.selector.set_interest(self.fd, interest)
    }
}

/// Notifier is the thread-safe handle used by background tasks to hand results
/// back to the reactor
#[derive(Clone)]
pub struct Notifier {
    tx: UnboundedSender<RawFd>,
    waker: Arc<Waker>,
}

impl Notifier {
    /// notify_block queues a block-done event for `fd` and wakes the selector.
    /// Returns false when the selector no longer exists.
    pub fn notify_block(&self, fd: RawFd) -> bool {
        if self.tx.send(fd).is_err() {
            return false;
        }
        self.wake();
        true
    }

    /// wake interrupts the current (or next) wait without queueing an event
    pub fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!("failed to wake selector: {e}");
        }
    }
}

struct Item {
    handler: Rc<dyn Handler>,
    interest: Interest,
    // Whether the fd is currently in the kernel interest set
    armed: bool,
}

/// Selector is the reactor. It is not `Send`: registrations, callbacks and
/// interest changes all happen on the thread that owns it.
pub struct Selector {
    poller: EpollPoller,
    items: Vec<Option<Item>>,
    registered: usize,
    config: SelectorConfig,
    ready: Vec<Readiness>,
    notify_tx: UnboundedSender<RawFd>,
    notify_rx: UnboundedReceiver<RawFd>,
}

impl Selector {
    /// new creates a selector whose descriptor table starts with room for
    /// `initial_capacity` fds
    pub fn new(config: SelectorConfig, initial_capacity: usize) -> Result<Self, SelectorError> {
        let poller = EpollPoller::new()?;
        let (notify_tx, notify_rx) = unbounded_channel();

        let mut items = Vec::new();
        items.resize_with(initial_capacity.min(MAX_FD), || None);

        Ok(Self {
            poller,
            items,
            registered: 0,
            config,
            ready: Vec::new(),
            notify_tx,
            notify_rx,
        })
    }

    /// notifier returns a handle background tasks can use to reach this selector
    pub fn notifier(&self) -> Notifier {
        Notifier {
            tx: self.notify_tx.clone(),
            waker: self.poller.waker(),
        }
    }

    /// len returns the number of registered descriptors
    pub fn len(&self) -> usize {
        self.registered
    }

    pub fn is_empty(&self) -> bool {
        self.registered == 0
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.item(fd).is_some()
    }

    /// interest returns the current interest of `fd`, if registered
    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.item(fd).map(|item| item.interest)
    }

    /// register adds `fd` to the selector
    pub fn register(
        &mut self,
        fd: RawFd,
        handler: Rc<dyn Handler>,
        interest: Interest,
    ) -> Result<(), SelectorError> {
        if fd < 0 {
            return Err(SelectorError::InvalidArgs);
        }

        let idx = fd as usize;
        if idx >= MAX_FD {
            return Err(SelectorError::MaxFd(fd));
        }

        if idx >= self.items.len() {
            let new_len = (idx + 1).max(self.items.len() * 2).min(MAX_FD);
            self.items.resize_with(new_len, || None);
        }

        if self.items[idx].is_some() {
            return Err(SelectorError::FdInUse(fd));
        }

        let armed = !interest.is_empty();
        if armed {
            self.poller.add(fd, interest)?;
        }

        self.items[idx] = Some(Item {
            handler,
            interest,
            armed,
        });
        self.registered += 1;

        Ok(())
    }

    /// set_interest replaces the interest of a registered `fd`.
    ///
    /// A `NOOP` interest takes the fd out of the kernel interest set so a hung-up
    /// socket nobody is waiting on cannot make the loop spin.
    pub fn set_interest(&mut self, fd: RawFd, interest: Interest) -> Result<(), SelectorError> {
        let idx = usize::try_from(fd).map_err(|_| SelectorError::InvalidArgs)?;
        let item = self
            .items
            .get_mut(idx)
            .and_then(Option::as_mut)
            .ok_or(SelectorError::InvalidArgs)?;

        match (item.armed, interest.is_empty()) {
            (true, true) => {
                self.poller.delete(fd)?;
                item.armed = false;
            }
            (false, false) => {
                self.poller.add(fd, interest)?;
                item.armed = true;
            }
            (true, false) if item.interest != interest => self.poller.modify(fd, interest)?,
            _ => {}
        }

        item.interest = interest;
        Ok(())
    }

    /// unregister removes `fd` and then invokes its handler's `handle_close`
    pub fn unregister(&mut self, fd: RawFd) -> Result<(), SelectorError> {
        let idx = usize::try_from(fd).map_err(|_| SelectorError::InvalidArgs)?;
        let item = self
            .items
            .get_mut(idx)
            .and_then(Option::take)
            .ok_or(SelectorError::InvalidArgs)?;
        self.registered -= 1;

        if item.armed {
            if let Err(e) = self.poller.delete(fd) {
                debug!("epoll delete of fd {fd} failed: {e}");
            }
        }

        item.handler.handle_close(&mut Key { selector: self, fd });
        Ok(())
    }

    /// select waits for readiness and dispatches one round of events.
    ///
    /// For every ready descriptor the read callback runs first, then the write
    /// callback; each only if the descriptor is still registered with the
    /// matching interest at that point. Pending block notifications are
    /// delivered last.
    pub fn select(&mut self) -> Result<(), SelectorError> {
        let mut ready = std::mem::take(&mut self.ready);
        if let Err(e) = self.poller.poll(&mut ready, self.config.select_timeout) {
            self.ready = ready;
            return Err(e.into());
        }

        for event in &ready {
            if event.readable {
                if let Some(handler) = self.handler_for(event.fd, Interest::READ) {
                    handler.handle_read(&mut Key {
                        selector: self,
                        fd: event.fd,
                    });
                }
            }

            if event.writable {
                if let Some(handler) = self.handler_for(event.fd, Interest::WRITE) {
                    handler.handle_write(&mut Key {
                        selector: self,
                        fd: event.fd,
                    });
                }
            }
        }

        ready.clear();
        self.ready = ready;

        while let Ok(fd) = self.notify_rx.try_recv() {
            let handler = self.item(fd).map(|item| item.handler.clone());
            match handler {
                Some(handler) => handler.handle_block(&mut Key { selector: self, fd }),
                None => debug!("dropping block notification for unregistered fd {fd}"),
            }
        }

        Ok(())
    }

    /// close unregisters every descriptor, firing each `handle_close`.
    /// Calling it on an already closed selector does nothing.
    pub fn close(&mut self) {
        let fds: Vec<RawFd> = self
            .items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.is_some())
            .map(|(fd, _)| fd as RawFd)
            .collect();

        for fd in fds {
            // A close callback may already have unregistered a sibling fd
            if self.is_registered(fd) {
                let _ = self.unregister(fd);
            }
        }
    }

    fn item(&self, fd: RawFd) -> Option<&Item> {
        let idx = usize::try_from(fd).ok()?;
        self.items.get(idx).and_then(Option::as_ref)
    }

    fn handler_for(&self, fd: RawFd, wanted: Interest) -> Option<Rc<dyn Handler>> {
        self.item(fd)
            .filter(|item| item.interest.contains(wanted))
            .map(|item| item.handler.clone())
    }
}

/// set_non_blocking puts `fd` in non-blocking mode. Every socket must be
/// non-blocking before it is registered.
pub fn set_non_blocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[derive(Default)]
    struct Recorder {
        events: RefCell<Vec<&'static str>>,
    }

    impl Handler for Recorder {
        fn handle_read(&self, key: &mut Key<'_>) {
            self.events.borrow_mut().push("read");
            // Stop listening so the unread bytes do not fire again
            key.set_interest(Interest::NOOP).unwrap();
        }

        fn handle_write(&self, key: &mut Key<'_>) {
            self.events.borrow_mut().push("write");
            key.set_interest(Interest::NOOP).unwrap();
        }

        fn handle_close(&self, _key: &mut Key<'_>) {
            self.events.borrow_mut().push("close");
        }

        fn handle_block(&self, _key: &mut Key<'_>) {
            self.events.borrow_mut().push("block");
        }
    }

    fn selector() -> Selector {
        let config = SelectorConfig {
            select_timeout: Duration::from_millis(50),
        };
        Selector::new(config, 4).unwrap()
    }

    #[test]
    fn test_dispatches_read_readiness() {
        let mut selector = selector();
        let (a, mut b) = UnixStream::pair().unwrap();
        set_non_blocking(a.as_raw_fd()).unwrap();

        let recorder = Rc::new(Recorder::default());
        selector
            .register(a.as_raw_fd(), recorder.clone(), Interest::READ)
            .unwrap();

        b.write_all(b"ping").unwrap();
        selector.select().unwrap();

        assert_eq!(*recorder.events.borrow(), vec!["read"]);
        assert_eq!(selector.interest(a.as_raw_fd()), Some(Interest::NOOP));
    }

    #[test]
    fn test_dispatches_write_readiness() {
        let mut selector = selector();
        let (a, _b) = UnixStream::pair().unwrap();

        let recorder = Rc::new(Recorder::default());
        selector
            .register(a.as_raw_fd(), recorder.clone(), Interest::WRITE)
            .unwrap();
        selector.select().unwrap();

        assert_eq!(*recorder.events.borrow(), vec!["write"]);
    }

    #[test]
    fn test_noop_interest_is_not_dispatched() {
        let mut selector = selector();
        let (a, mut b) = UnixStream::pair().unwrap();

        let recorder = Rc::new(Recorder::default());
        selector
            .register(a.as_raw_fd(), recorder.clone(), Interest::NOOP)
            .unwrap();
        b.write_all(b"ping").unwrap();
        selector.select().unwrap();

        assert!(recorder.events.borrow().is_empty());
    }

    #[test]
    fn test_register_twice_fails_with_fd_in_use() {
        let mut selector = selector();
        let (a, _b) = UnixStream::pair().unwrap();
        let recorder = Rc::new(Recorder::default());

        selector
            .register(a.as_raw_fd(), recorder.clone(), Interest::READ)
            .unwrap();
        let err = selector
            .register(a.as_raw_fd(), recorder, Interest::READ)
            .unwrap_err();

        assert!(matches!(err, SelectorError::FdInUse(_)));
        assert_eq!(selector.len(), 1);
    }

    #[test]
    fn test_register_rejects_bad_descriptors() {
        let mut selector = selector();
        let recorder = Rc::new(Recorder::default());

        assert!(matches!(
            selector.register(-1, recorder.clone(), Interest::READ),
            Err(SelectorError::InvalidArgs)
        ));
        assert!(matches!(
            selector.register(MAX_FD as RawFd, recorder, Interest::READ),
            Err(SelectorError::MaxFd(_))
        ));
    }

    #[test]
    fn test_unregister_invokes_close() {
        let mut selector = selector();
        let (a, _b) = UnixStream::pair().unwrap();
        let recorder = Rc::new(Recorder::default());

        selector
            .register(a.as_raw_fd(), recorder.clone(), Interest::READ)
            .unwrap();
        selector.unregister(a.as_raw_fd()).unwrap();

        assert_eq!(*recorder.events.borrow(), vec!["close"]);
        assert!(!selector.is_registered(a.as_raw_fd()));
        assert!(selector.unregister(a.as_raw_fd()).is_err());
    }

    #[test]
    fn test_block_notification_from_another_thread() {
        let mut selector = selector();
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let recorder = Rc::new(Recorder::default());
        selector.register(fd, recorder.clone(), Interest::NOOP).unwrap();

        let notifier = selector.notifier();
        std::thread::spawn(move || assert!(notifier.notify_block(fd)))
            .join()
            .unwrap();
        selector.select().unwrap();

        assert_eq!(*recorder.events.borrow(), vec!["block"]);
    }

    #[test]
    fn test_select_times_out_without_activity() {
        let mut selector = selector();
        let started = std::time::Instant::now();
        selector.select().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_close_unregisters_everything() {
        let mut selector = selector();
        let (a, b) = UnixStream::pair().unwrap();
        let recorder = Rc::new(Recorder::default());

        selector
            .register(a.as_raw_fd(), recorder.clone(), Interest::READ)
            .unwrap();
        selector
            .register(b.as_raw_fd(), recorder.clone(), Interest::NOOP)
            .unwrap();

        selector.close();
        selector.close();

        assert!(selector.is_empty());
        assert_eq!(*recorder.events.borrow(), vec!["close", "close"]);
    }
}
