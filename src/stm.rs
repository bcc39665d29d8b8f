//! Generic connection state machine.
//!
//! A connection type implements [`StateHandler`] once, matching on the state to
//! pick the behaviour for each event. [`StateMachine`] keeps the current state and
//! fires `on_departure` / `on_arrival` whenever a callback moves it elsewhere.
//! Both the SOCKS5 and the management connections run on this engine.
//!
//! [`Connection`] glues a machine and its [`Session`] to the selector: it is the
//! registered [`Handler`] for every fd the session owns, and it tears the session
//! down once a terminal state is reached or the selector closes one of its fds.

use crate::selector::{Handler, Key};
use std::cell::{Cell, RefCell};
use std::fmt::Debug;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use tracing::error;

/// StateHandler holds the per-state callbacks of a connection. Callbacks that a
/// state does not need are no-ops that keep the machine where it is.
pub trait StateHandler {
    type State: Copy + Ord + Debug;

    /// on_arrival runs once each time `state` is entered
    fn on_arrival(&mut self, _state: Self::State, _key: &mut Key<'_>) {}

    /// on_departure runs once each time `state` is left
    fn on_departure(&mut self, _state: Self::State, _key: &mut Key<'_>) {}

    fn on_read_ready(&mut self, state: Self::State, _key: &mut Key<'_>) -> Self::State {
        state
    }

    fn on_write_ready(&mut self, state: Self::State, _key: &mut Key<'_>) -> Self::State {
        state
    }

    fn on_block_ready(&mut self, state: Self::State, _key: &mut Key<'_>) -> Self::State {
        state
    }
}

/// StateMachine tracks the current state of one connection
#[derive(Debug)]
pub struct StateMachine<S> {
    initial: S,
    max_state: S,
    current: S,
}

impl<S: Copy + Ord + Debug> StateMachine<S> {
    /// new builds a machine sitting in `initial`; states above `max_state` are
    /// rejected
    pub fn new(initial: S, max_state: S) -> Self {
        Self {
            initial,
            max_state,
            current: initial,
        }
    }

    /// start fires the arrival callback of the initial state
    pub fn start<H>(&mut self, handler: &mut H, key: &mut Key<'_>)
    where
        H: StateHandler<State = S>,
    {
        self.current = self.initial;
        handler.on_arrival(self.initial, key);
    }

    pub fn state(&self) -> S {
        self.current
    }

    pub fn handle_read<H>(&mut self, handler: &mut H, key: &mut Key<'_>) -> S
    where
        H: StateHandler<State = S>,
    {
        let next = handler.on_read_ready(self.current, key);
        self.jump(next, handler, key)
    }

    pub fn handle_write<H>(&mut self, handler: &mut H, key: &mut Key<'_>) -> S
    where
        H: StateHandler<State = S>,
    {
        let next = handler.on_write_ready(self.current, key);
        self.jump(next, handler, key)
    }

    pub fn handle_block<H>(&mut self, handler: &mut H, key: &mut Key<'_>) -> S
    where
        H: StateHandler<State = S>,
    {
        let next = handler.on_block_ready(self.current, key);
        self.jump(next, handler, key)
    }

    fn jump<H>(&mut self, next: S, handler: &mut H, key: &mut Key<'_>) -> S
    where
        H: StateHandler<State = S>,
    {
        if next > self.max_state {
            error!("state machine asked to move to invalid state {next:?}");
            return self.current;
        }

        if next != self.current {
            handler.on_departure(self.current, key);
            self.current = next;
            handler.on_arrival(next, key);
        }

        self.current
    }
}

/// Session is a [`StateHandler`] that owns descriptors and can be torn down
pub trait Session: StateHandler {
    /// is_finished reports whether the connection must be torn down after
    /// reaching `state`
    fn is_finished(&self, state: Self::State) -> bool;

    /// fds lists every descriptor the session may have registered
    fn fds(&self) -> Vec<RawFd>;

    /// release frees the session's resources. Runs once, after its descriptors
    /// were unregistered.
    fn release(&mut self);
}

/// Connection drives one session from the selector
pub struct Connection<H: Session> {
    stm: RefCell<StateMachine<H::State>>,
    session: RefCell<H>,
    closed: Cell<bool>,
}

impl<H: Session> Connection<H> {
    /// new builds the connection. `build` receives a weak handle to it, which the
    /// session can use to register further descriptors with the same handler.
    pub fn new(
        initial: H::State,
        max_state: H::State,
        build: impl FnOnce(Weak<Self>) -> H,
    ) -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            stm: RefCell::new(StateMachine::new(initial, max_state)),
            session: RefCell::new(build(me.clone())),
            closed: Cell::new(false),
        })
    }

    /// start enters the initial state. `key` must refer to an fd already
    /// registered with this connection.
    pub fn start(&self, key: &mut Key<'_>) {
        self.dispatch(key, |stm, session, key| {
            stm.start(session, key);
            stm.state()
        });
    }

    pub fn state(&self) -> Option<H::State> {
        self.stm.try_borrow().ok().map(|stm| stm.state())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    fn dispatch<F>(&self, key: &mut Key<'_>, f: F)
    where
        F: FnOnce(&mut StateMachine<H::State>, &mut H, &mut Key<'_>) -> H::State,
    {
        if self.closed.get() {
            return;
        }

        let finished = {
            let (Ok(mut stm), Ok(mut session)) =
                (self.stm.try_borrow_mut(), self.session.try_borrow_mut())
            else {
                error!("re-entrant dispatch on fd {}", key.fd);
                return;
            };

            let state = f(&mut *stm, &mut *session, key);
            session.is_finished(state)
        };

        if finished {
            self.teardown(key);
        }
    }

    fn teardown(&self, key: &mut Key<'_>) {
        if self.closed.replace(true) {
            return;
        }

        let fds = match self.session.try_borrow() {
            Ok(session) => session.fds(),
            Err(_) => return,
        };

        // Unregistering fires handle_close on this connection, which is a no-op
        // now that it is marked closed
        for fd in fds {
            if key.selector.is_registered(fd) {
                let _ = key.selector.unregister(fd);
            }
        }

        if let Ok(mut session) = self.session.try_borrow_mut() {
            session.release();
        }
    }
}

impl<H: Session> Handler for Connection<H> {
    fn handle_read(&self, key: &mut Key<'_>) {
        self.dispatch(key, |stm, session, key| stm.handle_read(session, key));
    }

    fn handle_write(&self, key: &mut Key<'_>) {
        self.dispatch(key, |stm, session, key| stm.handle_write(session, key));
    }

    fn handle_block(&self, key: &mut Key<'_>) {
        self.dispatch(key, |stm, session, key| stm.handle_block(session, key));
    }

    fn handle_close(&self, key: &mut Key<'_>) {
        self.teardown(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::{Interest, Selector, SelectorConfig};
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    enum Light {
        Red,
        Green,
        Off,
        // Never reachable: sits above the declared maximum
        Broken,
    }

    #[derive(Default)]
    struct Trace {
        log: Vec<String>,
        next_on_read: Option<Light>,
    }

    impl StateHandler for Trace {
        type State = Light;

        fn on_arrival(&mut self, state: Light, _key: &mut Key<'_>) {
            self.log.push(format!("arrive {state:?}"));
        }

        fn on_departure(&mut self, state: Light, _key: &mut Key<'_>) {
            self.log.push(format!("depart {state:?}"));
        }

        fn on_read_ready(&mut self, state: Light, _key: &mut Key<'_>) -> Light {
            match state {
                Light::Red => self.next_on_read.unwrap_or(Light::Green),
                Light::Green => Light::Off,
                Light::Off | Light::Broken => state,
            }
        }
    }

    fn with_key<F: FnOnce(&mut Key<'_>)>(f: F) {
        let mut selector = Selector::new(SelectorConfig::default(), 1).unwrap();
        let mut key = Key {
            selector: &mut selector,
            fd: 0,
        };
        f(&mut key);
    }

    #[test]
    fn test_start_fires_initial_arrival() {
        with_key(|key| {
            let mut trace = Trace::default();
            let mut stm = StateMachine::new(Light::Red, Light::Off);
            stm.start(&mut trace, key);
            assert_eq!(trace.log, vec!["arrive Red"]);
        });
    }

    #[test]
    fn test_transition_fires_departure_then_arrival() {
        with_key(|key| {
            let mut trace = Trace::default();
            let mut stm = StateMachine::new(Light::Red, Light::Off);
            stm.start(&mut trace, key);

            assert_eq!(stm.handle_read(&mut trace, key), Light::Green);
            assert_eq!(trace.log, vec!["arrive Red", "depart Red", "arrive Green"]);
        });
    }

    #[test]
    fn test_missing_callback_is_a_noop() {
        with_key(|key| {
            let mut trace = Trace::default();
            let mut stm = StateMachine::new(Light::Red, Light::Off);

            assert_eq!(stm.handle_write(&mut trace, key), Light::Red);
            assert_eq!(stm.handle_block(&mut trace, key), Light::Red);
            assert!(trace.log.is_empty());
        });
    }

    #[test]
    fn test_terminal_state_stays_put() {
        with_key(|key| {
            let mut trace = Trace::default();
            let mut stm = StateMachine::new(Light::Red, Light::Off);
            stm.handle_read(&mut trace, key);
            stm.handle_read(&mut trace, key);
            trace.log.clear();

            assert_eq!(stm.handle_read(&mut trace, key), Light::Off);
            assert!(trace.log.is_empty());
        });
    }

    #[test]
    fn test_state_above_max_is_rejected() {
        with_key(|key| {
            let mut trace = Trace {
                next_on_read: Some(Light::Broken),
                ..Default::default()
            };
            let mut stm = StateMachine::new(Light::Red, Light::Off);

            assert_eq!(stm.handle_read(&mut trace, key), Light::Red);
            assert!(trace.log.is_empty());
        });
    }

    // Echo session: reads one chunk, then finishes on the following read
    struct Once {
        fds: Vec<RawFd>,
        released: Rc<Cell<u32>>,
    }

    impl StateHandler for Once {
        type State = Light;

        fn on_arrival(&mut self, state: Light, key: &mut Key<'_>) {
            if state == Light::Red {
                key.set_interest(Interest::READ).unwrap();
            }
        }

        fn on_read_ready(&mut self, state: Light, _key: &mut Key<'_>) -> Light {
            match state {
                Light::Red => Light::Green,
                _ => Light::Off,
            }
        }
    }

    impl Session for Once {
        fn is_finished(&self, state: Light) -> bool {
            state == Light::Off
        }

        fn fds(&self) -> Vec<RawFd> {
            self.fds.clone()
        }

        fn release(&mut self) {
            self.released.set(self.released.get() + 1);
        }
    }

    fn selector() -> Selector {
        let config = SelectorConfig {
            select_timeout: std::time::Duration::from_millis(50),
        };
        Selector::new(config, 4).unwrap()
    }

    #[test]
    fn test_connection_tears_down_on_terminal_state() {
        let mut selector = selector();
        let (a, mut b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let released = Rc::new(Cell::new(0));

        let conn = Connection::new(Light::Red, Light::Off, |_| Once {
            fds: vec![fd],
            released: released.clone(),
        });
        selector.register(fd, conn.clone(), Interest::NOOP).unwrap();
        conn.start(&mut Key {
            selector: &mut selector,
            fd,
        });

        b.write_all(b"x").unwrap();
        selector.select().unwrap();
        assert_eq!(conn.state(), Some(Light::Green));

        selector.select().unwrap();
        assert!(conn.is_closed());
        assert!(!selector.is_registered(fd));
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn test_selector_close_releases_once() {
        let mut selector = selector();
        let (a, b) = UnixStream::pair().unwrap();
        let released = Rc::new(Cell::new(0));

        let fds = vec![a.as_raw_fd(), b.as_raw_fd()];
        let conn = Connection::new(Light::Red, Light::Off, |_| Once {
            fds: fds.clone(),
            released: released.clone(),
        });
        for fd in &fds {
            selector.register(*fd, conn.clone(), Interest::NOOP).unwrap();
        }

        selector.close();
        assert!(selector.is_empty());
        assert_eq!(released.get(), 1);
    }
}
