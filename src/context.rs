//! Server-wide state shared by every connection.
//!
//! The context is built once at startup and handed to connections as an
//! `Rc`. Interior mutability is `Cell`/`RefCell` only: everything here is
//! touched exclusively from the reactor thread, and the `Rc` keeps it that way.

use crate::config::Settings;
use crate::metrics::Metrics;
use crate::socks5::resolve::Resolver;
use crate::users::UserStore;
use std::cell::{Cell, RefCell};

pub struct ServerContext {
    pub users: RefCell<UserStore>,
    pub metrics: Metrics,
    pub resolver: Resolver,
    settings: Cell<Settings>,
    buffer_size: usize,
}

impl ServerContext {
    pub fn new(users: UserStore, settings: Settings, buffer_size: usize, resolver: Resolver) -> Self {
        Self {
            users: RefCell::new(users),
            metrics: Metrics::new(),
            resolver,
            settings: Cell::new(settings),
            buffer_size,
        }
    }

    pub fn settings(&self) -> Settings {
        self.settings.get()
    }

    /// update_settings applies `f` to the current runtime settings
    pub fn update_settings(&self, f: impl FnOnce(&mut Settings)) {
        let mut settings = self.settings.get();
        f(&mut settings);
        self.settings.set(settings);
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}
