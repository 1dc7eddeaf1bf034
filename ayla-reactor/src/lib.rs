//! A single-threaded cooperative event loop, pairing file-descriptor
//! readiness dispatch with monotonic one-shot timers.
//!
//! The loop owns no application state: callers register callbacks for fd
//! readiness with [`Reactor::watch`] and obtain [`Timer`] handles with
//! [`Reactor::timer`], then drive everything from [`Reactor::run`] (or
//! [`Reactor::turn`] for a single iteration). All callbacks execute on the
//! thread running the loop; none are invoked re-entrantly, so a callback may
//! freely add or remove watches and timers.

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// An error raised by the reactor.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// The platform refused a new fd registration. Fatal for the affected
    /// watcher only; the loop itself keeps running.
    #[error("fd registration refused by the platform: {0}")]
    Exhausted(#[source] io::Error),
    /// A watch was requested with neither readable nor writable interest.
    #[error("empty interest mask for fd {0}")]
    EmptyInterest(RawFd),
    /// The underlying poller failed.
    #[error("poll failed: {0}")]
    Io(#[from] io::Error),
}

/// The readiness of a file descriptor, both as requested interest and as
/// reported to the watch callback.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    pub const READABLE: Readiness = Readiness {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Readiness = Readiness {
        readable: false,
        writable: true,
    };

    pub fn both() -> Readiness {
        Readiness {
            readable: true,
            writable: true,
        }
    }

    fn to_interest(self) -> Option<Interest> {
        match (self.readable, self.writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Handle to a one-shot timer owned by a [`Reactor`]. A timer is either idle
/// or scheduled exactly once; re-arming an armed timer replaces its deadline.
#[derive(Clone, Debug)]
pub struct Timer {
    id: u64,
}

struct WatchEntry {
    token: Token,
    callback: Rc<dyn Fn(Readiness)>,
}

struct TimerEntry {
    deadline: Option<Instant>,
    callback: Rc<dyn Fn()>,
}

/// The event loop. Single-threaded; not `Send`.
pub struct Reactor {
    poll: RefCell<Poll>,
    events: RefCell<Events>,
    watches: RefCell<HashMap<RawFd, WatchEntry>>,
    tokens: RefCell<HashMap<Token, RawFd>>,
    timers: RefCell<HashMap<u64, TimerEntry>>,
    next_token: Cell<usize>,
    next_timer: Cell<u64>,
    stopped: Cell<bool>,
}

impl Reactor {
    pub fn new() -> Result<Reactor, ReactorError> {
        Ok(Reactor {
            poll: RefCell::new(Poll::new()?),
            events: RefCell::new(Events::with_capacity(64)),
            watches: RefCell::new(HashMap::new()),
            tokens: RefCell::new(HashMap::new()),
            timers: RefCell::new(HashMap::new()),
            next_token: Cell::new(0),
            next_timer: Cell::new(0),
            stopped: Cell::new(false),
        })
    }

    /// Register interest in `fd`. Watching an fd that is already watched
    /// replaces its interest mask and callback.
    pub fn watch(
        &self,
        fd: RawFd,
        interest: Readiness,
        callback: impl Fn(Readiness) + 'static,
    ) -> Result<(), ReactorError> {
        let mio_interest = interest
            .to_interest()
            .ok_or(ReactorError::EmptyInterest(fd))?;
        let mut watches = self.watches.borrow_mut();
        if let Some(entry) = watches.get_mut(&fd) {
            self.poll
                .borrow()
                .registry()
                .reregister(&mut SourceFd(&fd), entry.token, mio_interest)
                .map_err(ReactorError::Exhausted)?;
            entry.callback = Rc::new(callback);
            return Ok(());
        }
        let token = Token(self.next_token.get());
        self.next_token.set(token.0.wrapping_add(1));
        self.poll
            .borrow()
            .registry()
            .register(&mut SourceFd(&fd), token, mio_interest)
            .map_err(ReactorError::Exhausted)?;
        watches.insert(
            fd,
            WatchEntry {
                token,
                callback: Rc::new(callback),
            },
        );
        self.tokens.borrow_mut().insert(token, fd);
        Ok(())
    }

    /// Stop watching `fd`. Unwatching an unknown fd is a no-op.
    pub fn unwatch(&self, fd: RawFd) {
        let entry = self.watches.borrow_mut().remove(&fd);
        if let Some(entry) = entry {
            self.tokens.borrow_mut().remove(&entry.token);
            if let Err(err) = self
                .poll
                .borrow()
                .registry()
                .deregister(&mut SourceFd(&fd))
            {
                log::debug!("deregister fd {} failed: {}", fd, err);
            }
        }
    }

    /// Create an idle timer firing `callback` each time it expires.
    pub fn timer(&self, callback: impl Fn() + 'static) -> Timer {
        let id = self.next_timer.get();
        self.next_timer.set(id + 1);
        self.timers.borrow_mut().insert(
            id,
            TimerEntry {
                deadline: None,
                callback: Rc::new(callback),
            },
        );
        Timer { id }
    }

    /// Arm `timer` to fire after `delay`. A zero delay fires on the next
    /// loop iteration. Re-arming replaces the previous deadline.
    pub fn timer_set(&self, timer: &Timer, delay: Duration) {
        if let Some(entry) = self.timers.borrow_mut().get_mut(&timer.id) {
            entry.deadline = Some(Instant::now() + delay);
        }
    }

    /// Disarm `timer`. Idempotent.
    pub fn timer_cancel(&self, timer: &Timer) {
        if let Some(entry) = self.timers.borrow_mut().get_mut(&timer.id) {
            entry.deadline = None;
        }
    }

    /// Whether `timer` is currently armed.
    pub fn timer_scheduled(&self, timer: &Timer) -> bool {
        self.timers
            .borrow()
            .get(&timer.id)
            .map_or(false, |entry| entry.deadline.is_some())
    }

    /// Drop a timer entirely, releasing its callback.
    pub fn timer_remove(&self, timer: &Timer) {
        self.timers.borrow_mut().remove(&timer.id);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers
            .borrow()
            .values()
            .filter_map(|entry| entry.deadline)
            .min()
    }

    /// One loop iteration: sleep until an fd is ready or the earliest timer
    /// deadline passes (bounded by `max_wait`), run ready-fd callbacks, then
    /// run expired timers. Readiness may change between callbacks; it is
    /// re-evaluated on the next iteration.
    pub fn turn(&self, max_wait: Option<Duration>) -> Result<(), ReactorError> {
        let now = Instant::now();
        let mut timeout = self
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now));
        if let Some(max_wait) = max_wait {
            timeout = Some(timeout.map_or(max_wait, |t| t.min(max_wait)));
        }

        let mut ready: Vec<(RawFd, Readiness)> = Vec::new();
        {
            let mut poll = self.poll.borrow_mut();
            let mut events = self.events.borrow_mut();
            match poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
                Err(err) => return Err(ReactorError::Io(err)),
            }
            let tokens = self.tokens.borrow();
            for event in events.iter() {
                if let Some(fd) = tokens.get(&event.token()) {
                    ready.push((
                        *fd,
                        Readiness {
                            readable: event.is_readable(),
                            writable: event.is_writable(),
                        },
                    ));
                }
            }
        }

        for (fd, readiness) in ready {
            let callback = self
                .watches
                .borrow()
                .get(&fd)
                .map(|entry| entry.callback.clone());
            if let Some(callback) = callback {
                callback(readiness);
            }
        }

        self.run_expired_timers();
        Ok(())
    }

    fn run_expired_timers(&self) {
        let now = Instant::now();
        let mut due: Vec<(Instant, u64)> = self
            .timers
            .borrow()
            .iter()
            .filter_map(|(id, entry)| {
                entry
                    .deadline
                    .filter(|deadline| *deadline <= now)
                    .map(|deadline| (deadline, *id))
            })
            .collect();
        due.sort();
        for (_, id) in due {
            let callback = {
                let mut timers = self.timers.borrow_mut();
                match timers.get_mut(&id) {
                    Some(entry) if entry.deadline.map_or(false, |d| d <= now) => {
                        entry.deadline = None;
                        Some(entry.callback.clone())
                    }
                    _ => None,
                }
            };
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    /// Run until [`Reactor::shutdown`] is called, then unregister all
    /// watchers and cancel all timers.
    pub fn run(&self) -> Result<(), ReactorError> {
        while !self.stopped.get() {
            self.turn(None)?;
        }
        let fds: Vec<RawFd> = self.watches.borrow().keys().copied().collect();
        for fd in fds {
            self.unwatch(fd);
        }
        for entry in self.timers.borrow_mut().values_mut() {
            entry.deadline = None;
        }
        Ok(())
    }

    /// Ask [`Reactor::run`] to return after the current iteration.
    pub fn shutdown(&self) {
        self.stopped.set(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn zero_delay_timer_fires_on_next_turn() {
        let reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        let fired2 = fired.clone();
        let timer = reactor.timer(move || fired2.set(fired2.get() + 1));
        reactor.timer_set(&timer, Duration::from_millis(0));
        reactor.turn(Some(Duration::from_millis(50))).unwrap();
        assert_eq!(fired.get(), 1);
        assert!(!reactor.timer_scheduled(&timer));

        // Idle timers do not fire again.
        reactor.turn(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn rearming_replaces_the_deadline() {
        let reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        let fired2 = fired.clone();
        let timer = reactor.timer(move || fired2.set(fired2.get() + 1));
        reactor.timer_set(&timer, Duration::from_secs(60));
        reactor.timer_set(&timer, Duration::from_millis(0));
        reactor.turn(Some(Duration::from_millis(50))).unwrap();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn cancel_is_idempotent() {
        let reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        let fired2 = fired.clone();
        let timer = reactor.timer(move || fired2.set(fired2.get() + 1));
        reactor.timer_set(&timer, Duration::from_millis(0));
        reactor.timer_cancel(&timer);
        reactor.timer_cancel(&timer);
        reactor.turn(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(fired.get(), 0);
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let reactor = Reactor::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        let o1 = order.clone();
        let t1 = reactor.timer(move || o1.borrow_mut().push(1));
        let o2 = order.clone();
        let t2 = reactor.timer(move || o2.borrow_mut().push(2));
        reactor.timer_set(&t2, Duration::from_millis(2));
        reactor.timer_set(&t1, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        reactor.turn(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(*order.borrow(), vec![1, 2]);
        let _ = (t1, t2);
    }

    #[test]
    fn fd_callbacks_run_before_timer_callbacks() {
        let reactor = Reactor::new().unwrap();
        let (mut tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        reactor
            .watch(rx.as_raw_fd(), Readiness::READABLE, move |readiness| {
                assert!(readiness.readable);
                o.borrow_mut().push("fd");
            })
            .unwrap();
        let o = order.clone();
        let timer = reactor.timer(move || o.borrow_mut().push("timer"));
        reactor.timer_set(&timer, Duration::from_millis(0));

        tx.write_all(b"x").unwrap();
        reactor.turn(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(*order.borrow(), vec!["fd", "timer"]);
    }

    #[test]
    fn rewatch_replaces_the_callback() {
        let reactor = Reactor::new().unwrap();
        let (mut tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        let hits = Rc::new(RefCell::new(Vec::new()));

        let h = hits.clone();
        reactor
            .watch(rx.as_raw_fd(), Readiness::READABLE, move |_| {
                h.borrow_mut().push("old")
            })
            .unwrap();
        let h = hits.clone();
        reactor
            .watch(rx.as_raw_fd(), Readiness::READABLE, move |_| {
                h.borrow_mut().push("new")
            })
            .unwrap();

        tx.write_all(b"x").unwrap();
        reactor.turn(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(*hits.borrow(), vec!["new"]);
    }

    #[test]
    fn unwatch_unknown_fd_is_a_noop() {
        let reactor = Reactor::new().unwrap();
        reactor.unwatch(12345);
    }

    #[test]
    fn empty_interest_is_rejected() {
        let reactor = Reactor::new().unwrap();
        let err = reactor
            .watch(0, Readiness::default(), |_| {})
            .expect_err("empty interest must be rejected");
        assert!(matches!(err, ReactorError::EmptyInterest(0)));
    }
}
