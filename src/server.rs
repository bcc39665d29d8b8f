use crate::config::Config;
use crate::context::ServerContext;
use crate::selector::{Handler, Interest, Key, Notifier, Selector, SelectorConfig, set_non_blocking};
use crate::socks5::resolve::Resolver;
use crate::users::{Privilege, UserStore};
use crate::{mgmt, socks5};
use anyhow::{Context, Result, anyhow, bail};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, ToSocketAddrs};
use std::cell::Cell;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};

/// Smallest buffer that still fits every handshake reply
const MIN_BUFFER_SIZE: usize = 16;

/// Initial size of the selector's descriptor table
const INITIAL_FDS: usize = 1024;

const LISTEN_BACKLOG: i32 = 128;

/// How long a listener stays paused after accept failed for a reason other
/// than an empty queue (EMFILE and friends)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(500);

/// ProxyServer owns the reactor, both listeners and the shared context
pub struct ProxyServer {
    selector: Selector,
    ctx: Rc<ServerContext>,
    listeners: Vec<Rc<Listener>>,
    runtime: Runtime,
    socks_addr: SocketAddr,
    mgmt_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
}

/// ShutdownHandle stops a running server from any thread
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    notifier: Notifier,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notifier.wake();
    }
}

/// ProxyServer implementation block
impl ProxyServer {
    /// bind creates the reactor and binds the SOCKS5 and management listeners
    pub fn bind(config: Config) -> Result<Self> {
        if config.buffer_size < MIN_BUFFER_SIZE {
            bail!("[ERR] buffer size must be at least {MIN_BUFFER_SIZE} bytes");
        }

        // Instantiate the runtime that hosts name resolution
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("popproxy-resolver")
            .enable_all()
            .build()
            .context("[ERR] failed to start resolver runtime")?;

        let selector_config = SelectorConfig {
            select_timeout: config.select_timeout,
        };
        let mut selector =
            Selector::new(selector_config, INITIAL_FDS).context("[ERR] failed to create selector")?;

        let mut users = UserStore::new();
        for (accounts, privilege) in [
            (&config.users, Privilege::User),
            (&config.admins, Privilege::Admin),
        ] {
            for account in accounts {
                users
                    .add(&account.username, &account.password, privilege)
                    .with_context(|| format!("[ERR] cannot add user '{}'", account.username))?;
            }
        }

        let settings = config.initial_settings();
        if settings.auth_required {
            info!("Authentication enabled");
        }

        let resolver = Resolver::new(runtime.handle().clone(), selector.notifier());
        let ctx = Rc::new(ServerContext::new(
            users,
            settings,
            config.buffer_size,
            resolver,
        ));

        let (socks, socks_addr) = bind_listener(&config.listen_addr)?;
        let (mgmt, mgmt_addr) = bind_listener(&config.mgmt_addr)?;

        let mut listeners = Vec::with_capacity(2);
        for (socket, kind) in [(socks, ListenerKind::Socks), (mgmt, ListenerKind::Management)] {
            let listener = Rc::new(Listener::new(socket, kind, Rc::clone(&ctx)));
            selector
                .register(listener.fd(), listener.clone(), Interest::READ)
                .context("[ERR] failed to register listener")?;
            listeners.push(listener);
        }

        // DEBUG
        info!("SOCKS5 proxy listening on {socks_addr}");
        info!("Management listening on {mgmt_addr}");

        Ok(Self {
            selector,
            ctx,
            listeners,
            runtime,
            socks_addr,
            mgmt_addr,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// local_addr is the bound SOCKS5 address
    pub fn local_addr(&self) -> SocketAddr {
        self.socks_addr
    }

    pub fn mgmt_addr(&self) -> SocketAddr {
        self.mgmt_addr
    }

    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            notifier: self.selector.notifier(),
        }
    }

    /// shutdown_on_ctrl_c stops the server when the process receives SIGINT
    pub fn shutdown_on_ctrl_c(&self) {
        let handle = self.shutdown_handle();
        self.runtime.spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl-C, shutting down");
                    handle.shutdown();
                }
                Err(e) => error!("failed to listen for Ctrl-C: {e}"),
            }
        });
    }

    /// run drives the reactor until shutdown is requested
    pub fn run(mut self) -> Result<()> {
        while !self.shutdown.load(Ordering::SeqCst) {
            if let Err(e) = self.selector.select() {
                self.selector.close();
                return Err(anyhow!("[ERR] selector failed: {e}"));
            }

            let now = Instant::now();
            for listener in &self.listeners {
                listener.resume(&mut self.selector, now);
            }
        }

        // Fires handle_close on every connection and listener
        self.selector.close();
        self.runtime.shutdown_background();

        info!("Proxy stopped");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerKind {
    Socks,
    Management,
}

/// Listener accepts clients for one of the two front ends
struct Listener {
    socket: Socket,
    kind: ListenerKind,
    ctx: Rc<ServerContext>,
    paused_at: Cell<Option<Instant>>,
}

impl Listener {
    fn new(socket: Socket, kind: ListenerKind, ctx: Rc<ServerContext>) -> Self {
        Self {
            socket,
            kind,
            ctx,
            paused_at: Cell::new(None),
        }
    }

    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// pause stops accepting after a failure that the next readiness event
    /// would only repeat
    fn pause(&self, key: &mut Key<'_>) {
        if let Err(e) = key.set_interest(Interest::NOOP) {
            error!("failed to pause {:?} listener: {e}", self.kind);
            return;
        }
        self.paused_at.set(Some(Instant::now()));
    }

    /// resume re-arms a paused listener once its backoff has elapsed
    fn resume(&self, selector: &mut Selector, now: Instant) {
        let Some(paused_at) = self.paused_at.get() else {
            return;
        };
        if now.duration_since(paused_at) < ACCEPT_BACKOFF {
            return;
        }

        match selector.set_interest(self.fd(), Interest::READ) {
            Ok(()) => {
                debug!("{:?} listener accepting again", self.kind);
                self.paused_at.set(None);
            }
            Err(e) => error!("failed to resume {:?} listener: {e}", self.kind),
        }
    }

    fn accept_one(&self, key: &mut Key<'_>, client: Socket, peer: String) {
        if let Err(e) = set_non_blocking(client.as_raw_fd()) {
            warn!("failed to make client {peer} non-blocking: {e}");
            return;
        }

        match self.kind {
            ListenerKind::Socks => {
                // DEBUG
                info!("new client: {peer}");

                self.ctx.metrics.record_new_connection();
                if let Err(e) = socks5::connection::accept(key, Rc::clone(&self.ctx), client, peer) {
                    warn!("{e:#}");
                    self.ctx.metrics.record_disconnect();
                }
            }
            ListenerKind::Management => {
                debug!("new management client: {peer}");
                if let Err(e) = mgmt::connection::accept(key, Rc::clone(&self.ctx), client, peer) {
                    warn!("{e:#}");
                }
            }
        }
    }
}

impl Handler for Listener {
    fn handle_read(&self, key: &mut Key<'_>) {
        loop {
            match self.socket.accept() {
                Ok((client, addr)) => {
                    let peer = addr
                        .as_socket()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    self.accept_one(key, client, peer);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(
                        "accept on {:?} listener failed, pausing for {ACCEPT_BACKOFF:?}: {e}",
                        self.kind
                    );
                    self.pause(key);
                    break;
                }
            }
        }
    }
}

/// bind_listener resolves `addr` and opens a non-blocking listening socket
fn bind_listener(addr: &str) -> Result<(Socket, SocketAddr)> {
    let addr = addr
        .to_socket_addrs()
        .with_context(|| format!("[ERR] invalid listen address '{addr}'"))?
        .next()
        .ok_or_else(|| anyhow!("[ERR] listen address '{addr}' did not resolve"))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    socket
        .bind(&addr.into())
        .with_context(|| format!("[ERR] failed to bind {addr}"))?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    let local = socket
        .local_addr()?
        .as_socket()
        .ok_or_else(|| anyhow!("[ERR] listener on {addr} has no inet address"))?;

    Ok((socket, local))
}
