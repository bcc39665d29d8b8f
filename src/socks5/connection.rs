//! Per-client SOCKS5 session.
//!
//! ```text
//! HelloRead -> HelloWrite -> [UserPassRead -> UserPassWrite] -> RequestRead
//!   -> [RequestResolve] -> RequestConnecting -> RequestWrite -> Copy -> Done
//! ```
//!
//! Any state may fall into `Error`. The client fd is registered at accept time,
//! the origin fd once the outbound connect starts; both dispatch to the same
//! [`Connection`].

use crate::buffer::Buffer;
use crate::context::ServerContext;
use crate::pop3::Pop3Sniffer;
use crate::selector::{Interest, Key};
use crate::socks5::auth::AuthParser;
use crate::socks5::copy::{Pipes, Relay, is_transient};
use crate::socks5::hello::HelloParser;
use crate::socks5::protocol::{AuthMethod, AuthStatus, POP3_PORT, ReplyCode};
use crate::socks5::request::{Address, Request, RequestParser};
use crate::socks5::resolve::Resolution;
use crate::stm::{Connection, Session, StateHandler};
use crate::users::{LookupResult, Privilege};
use anyhow::{Context, Result, anyhow};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SocksState {
    HelloRead,
    HelloWrite,
    UserPassRead,
    UserPassWrite,
    RequestRead,
    RequestResolve,
    RequestConnecting,
    RequestWrite,
    Copy,
    Done,
    Error,
}

/// SocksConnection is the handler registered for a SOCKS5 client
pub type SocksConnection = Connection<SocksSession>;

/// Phase holds the protocol memory of the state the session is in
enum Phase {
    Hello(HelloParser),
    UserPass {
        parser: AuthParser,
        status: AuthStatus,
    },
    Request(RequestParser),
    Dial {
        request: Request,
        resolution: Option<Resolution>,
        reply: ReplyCode,
    },
    Copy(Relay),
    Closed,
}

pub struct SocksSession {
    ctx: Rc<ServerContext>,
    me: Weak<SocksConnection>,
    client: Option<Socket>,
    client_fd: RawFd,
    client_addr: String,
    origin: Option<Socket>,
    origin_fd: Option<RawFd>,
    read_buffer: Buffer,
    write_buffer: Buffer,
    phase: Phase,
    username: Option<String>,
    broken: bool,
}

/// accept builds the connection for a freshly accepted client, registers it
/// and starts the handshake
pub fn accept(
    key: &mut Key<'_>,
    ctx: Rc<ServerContext>,
    client: Socket,
    client_addr: String,
) -> Result<Rc<SocksConnection>> {
    let client_fd = client.as_raw_fd();
    let required = ctx.settings().required_method();
    let buffer_size = ctx.buffer_size();

    let conn = Connection::new(SocksState::HelloRead, SocksState::Error, |me| SocksSession {
        ctx,
        me,
        client: Some(client),
        client_fd,
        client_addr,
        origin: None,
        origin_fd: None,
        read_buffer: Buffer::new(buffer_size),
        write_buffer: Buffer::new(buffer_size),
        phase: Phase::Hello(HelloParser::new(required)),
        username: None,
        broken: false,
    });

    key.selector
        .register(client_fd, conn.clone(), Interest::NOOP)
        .context("[ERR] failed to register client socket")?;

    conn.start(&mut Key {
        selector: &mut *key.selector,
        fd: client_fd,
    });

    Ok(conn)
}

impl SocksSession {
    fn set_interest(&mut self, key: &mut Key<'_>, fd: RawFd, interest: Interest) {
        if let Err(e) = key.selector.set_interest(fd, interest) {
            warn!("failed to set interest on fd {fd}: {e}");
            self.broken = true;
        }
    }

    /// receive reads from the client into the read buffer. Returns false on EOF
    /// or a hard error.
    fn receive(&mut self) -> bool {
        let Some(client) = self.client.as_ref() else {
            return false;
        };

        if !self.read_buffer.can_write() {
            return true;
        }

        let mut reader: &Socket = client;
        match reader.read(self.read_buffer.write_slice()) {
            Ok(0) => false,
            Ok(n) => {
                self.read_buffer.advance_write(n);
                true
            }
            Err(e) if is_transient(&e) => true,
            Err(e) => {
                debug!("read from client {} failed: {e}", self.client_addr);
                false
            }
        }
    }

    /// flush writes pending replies to the client. Returns Ok(true) once the
    /// write buffer is empty.
    fn flush(&mut self) -> io::Result<bool> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;

        let mut writer: &Socket = client;
        match writer.write(self.write_buffer.read_slice()) {
            Ok(n) => self.write_buffer.advance_read(n),
            Err(e) if is_transient(&e) => {}
            Err(e) => return Err(e),
        }

        Ok(!self.write_buffer.can_read())
    }

    /// parse_hello feeds buffered bytes to the greeting parser and queues the
    /// method selection once it completes
    fn parse_hello(&mut self) -> SocksState {
        let Phase::Hello(parser) = &mut self.phase else {
            return SocksState::Error;
        };

        parser.consume(&mut self.read_buffer);
        if !parser.is_done() {
            return SocksState::HelloRead;
        }

        let method = if parser.has_error() {
            AuthMethod::NoAcceptable
        } else {
            parser.selected()
        };

        if !HelloParser::marshall(&mut self.write_buffer, method) {
            return SocksState::Error;
        }
        SocksState::HelloWrite
    }

    fn parse_userpass(&mut self) -> SocksState {
        let Phase::UserPass { parser, status } = &mut self.phase else {
            return SocksState::Error;
        };

        parser.consume(&mut self.read_buffer);
        if !parser.is_done() {
            return SocksState::UserPassRead;
        }

        let lookup = if parser.has_error() {
            LookupResult::UnknownUser
        } else {
            self.ctx
                .users
                .borrow()
                .lookup(parser.username(), parser.password())
        };

        let username = String::from_utf8_lossy(parser.username()).into_owned();
        if lookup.grants(Privilege::User) {
            debug!("user '{username}' authenticated from {}", self.client_addr);
            *status = AuthStatus::Success;
            self.username = Some(username);
        } else {
            warn!(
                "authentication failed for '{username}' from {}: {lookup:?}",
                self.client_addr
            );
            *status = AuthStatus::Failure;
        }

        if !AuthParser::marshall(&mut self.write_buffer, *status) {
            return SocksState::Error;
        }
        SocksState::UserPassWrite
    }

    fn parse_request(&mut self, key: &mut Key<'_>) -> SocksState {
        let Phase::Request(parser) = &mut self.phase else {
            return SocksState::Error;
        };

        parser.consume(&mut self.read_buffer);
        if !parser.is_done() {
            return SocksState::RequestRead;
        }

        if parser.has_error() {
            let code = parser.reply_code();
            debug!("malformed request from {}: {:?}", self.client_addr, parser.state());
            return self.reply(code);
        }

        let Some(request) = parser.request().cloned() else {
            return SocksState::Error;
        };

        if let Some(addr) = request.socket_addr() {
            self.phase = Phase::Dial {
                request,
                resolution: None,
                reply: ReplyCode::GeneralFailure,
            };
            return self.connect(key, addr);
        }

        let Address::DomainName(host) = &request.address else {
            return SocksState::Error;
        };

        let resolution = self
            .ctx
            .resolver
            .resolve(self.client_fd, host.clone(), request.port);
        self.phase = Phase::Dial {
            request,
            resolution: Some(resolution),
            reply: ReplyCode::GeneralFailure,
        };
        SocksState::RequestResolve
    }

    /// connect starts a non-blocking connect to `addr` and registers the origin
    fn connect(&mut self, key: &mut Key<'_>, addr: SocketAddr) -> SocksState {
        match self.open_origin(key, addr) {
            Ok(()) => SocksState::RequestConnecting,
            Err(e) => {
                debug!("connect to {addr} failed: {e:#}");
                self.reply(ReplyCode::GeneralFailure)
            }
        }
    }

    fn open_origin(&mut self, key: &mut Key<'_>, addr: SocketAddr) -> Result<()> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;

        match socket.connect(&SockAddr::from(addr)) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(e.into()),
        }

        let me = self
            .me
            .upgrade()
            .ok_or_else(|| anyhow!("[ERR] connection dropped while connecting"))?;

        let fd = socket.as_raw_fd();
        key.selector.register(fd, me, Interest::WRITE)?;

        // DEBUG
        debug!("connecting to {addr} on fd {fd}");

        self.origin = Some(socket);
        self.origin_fd = Some(fd);
        Ok(())
    }

    /// connect_outcome checks the pending outbound connect. Returns None while
    /// the handshake is still in flight, which a write event left over from an
    /// earlier owner of the origin fd can observe.
    fn connect_outcome(&self) -> Option<io::Result<()>> {
        let Some(origin) = self.origin.as_ref() else {
            return Some(Err(io::Error::from(io::ErrorKind::NotConnected)));
        };

        match origin.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => return Some(Err(e)),
        }

        match origin.peer_addr() {
            Ok(_) => Some(Ok(())),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => None,
            Err(e) => Some(Err(e)),
        }
    }

    /// reply decides the outcome of the request, logs it and queues the reply
    fn reply(&mut self, code: ReplyCode) -> SocksState {
        let destination = match &mut self.phase {
            Phase::Dial { request, reply, .. } => {
                *reply = code;
                format!("{}:{}", request.address, request.port)
            }
            _ => "-".to_string(),
        };

        info!(
            target: "access",
            "user={} client={} destination={} reply={:?}",
            self.username.as_deref().unwrap_or("-"),
            self.client_addr,
            destination,
            code,
        );

        if !RequestParser::marshall(&mut self.write_buffer, code) {
            return SocksState::Error;
        }
        SocksState::RequestWrite
    }

    fn start_relay(&mut self, key: &mut Key<'_>) {
        let (Some(origin_fd), Phase::Dial { request, .. }) = (self.origin_fd, &self.phase) else {
            self.broken = true;
            return;
        };

        let sniffer = (request.port == POP3_PORT).then(Pop3Sniffer::new);
        let destination = format!("{}:{}", request.address, request.port);
        self.phase = Phase::Copy(Relay::new(
            self.client_fd,
            origin_fd,
            sniffer,
            self.username.clone(),
            destination,
        ));

        self.update_relay_interests(key);
    }

    /// relay runs one copy step for the end `key.fd` belongs to
    fn relay(&mut self, key: &mut Key<'_>, readable: bool) -> SocksState {
        let Self {
            ctx,
            client: Some(client),
            origin: Some(origin),
            read_buffer,
            write_buffer,
            phase: Phase::Copy(relay),
            ..
        } = self
        else {
            return SocksState::Error;
        };

        let Some(idx) = relay.index_of(key.fd) else {
            return SocksState::Copy;
        };

        let mut pipes = Pipes {
            client,
            origin,
            read_buffer,
            write_buffer,
        };
        if readable {
            relay.on_readable(idx, &mut pipes, ctx);
        } else {
            relay.on_writable(idx, &mut pipes, ctx);
        }

        if relay.is_done() {
            return SocksState::Done;
        }

        self.update_relay_interests(key);
        SocksState::Copy
    }

    fn update_relay_interests(&mut self, key: &mut Key<'_>) {
        let Self {
            client: Some(client),
            origin: Some(origin),
            read_buffer,
            write_buffer,
            phase: Phase::Copy(relay),
            ..
        } = self
        else {
            return;
        };

        let mut pipes = Pipes {
            client,
            origin,
            read_buffer,
            write_buffer,
        };
        let interests = relay.interests(&mut pipes);
        let fds = [relay.copies()[0].fd, relay.copies()[1].fd];

        for (fd, interest) in fds.into_iter().zip(interests) {
            self.set_interest(key, fd, interest);
        }
    }
}

impl StateHandler for SocksSession {
    type State = SocksState;

    fn on_arrival(&mut self, state: SocksState, key: &mut Key<'_>) {
        let fd = self.client_fd;
        match state {
            SocksState::HelloRead | SocksState::UserPassRead | SocksState::RequestRead => {
                self.set_interest(key, fd, Interest::READ)
            }
            SocksState::HelloWrite | SocksState::UserPassWrite | SocksState::RequestWrite => {
                self.set_interest(key, fd, Interest::WRITE)
            }
            SocksState::RequestResolve | SocksState::RequestConnecting => {
                self.set_interest(key, fd, Interest::NOOP)
            }
            SocksState::Copy => self.start_relay(key),
            SocksState::Done | SocksState::Error => {}
        }
    }

    fn on_departure(&mut self, state: SocksState, key: &mut Key<'_>) {
        // The origin stays quiet until the relay starts
        if state == SocksState::RequestConnecting {
            if let Some(fd) = self.origin_fd {
                self.set_interest(key, fd, Interest::NOOP);
            }
        }
    }

    fn on_read_ready(&mut self, state: SocksState, key: &mut Key<'_>) -> SocksState {
        match state {
            SocksState::HelloRead | SocksState::UserPassRead | SocksState::RequestRead => {
                if !self.receive() {
                    return SocksState::Error;
                }

                match state {
                    SocksState::HelloRead => self.parse_hello(),
                    SocksState::UserPassRead => self.parse_userpass(),
                    _ => self.parse_request(key),
                }
            }
            SocksState::Copy => self.relay(key, true),
            _ => state,
        }
    }

    fn on_write_ready(&mut self, state: SocksState, key: &mut Key<'_>) -> SocksState {
        match state {
            SocksState::HelloWrite | SocksState::UserPassWrite | SocksState::RequestWrite => {
                match self.flush() {
                    Ok(true) => {}
                    Ok(false) => return state,
                    Err(e) => {
                        debug!("write to client {} failed: {e}", self.client_addr);
                        return SocksState::Error;
                    }
                }

                match (state, &self.phase) {
                    (SocksState::HelloWrite, Phase::Hello(parser)) => match parser.selected() {
                        _ if parser.has_error() => SocksState::Error,
                        AuthMethod::UserPass => {
                            self.phase = Phase::UserPass {
                                parser: AuthParser::new(),
                                status: AuthStatus::Failure,
                            };
                            self.parse_userpass()
                        }
                        AuthMethod::NoAuth => {
                            self.phase = Phase::Request(RequestParser::new());
                            self.parse_request(key)
                        }
                        AuthMethod::NoAcceptable => SocksState::Error,
                    },
                    (
                        SocksState::UserPassWrite,
                        Phase::UserPass {
                            status: AuthStatus::Success,
                            ..
                        },
                    ) => {
                        self.phase = Phase::Request(RequestParser::new());
                        self.parse_request(key)
                    }
                    (
                        SocksState::RequestWrite,
                        Phase::Dial {
                            reply: ReplyCode::Succeeded,
                            ..
                        },
                    ) => SocksState::Copy,
                    _ => SocksState::Error,
                }
            }
            SocksState::RequestConnecting => match self.connect_outcome() {
                None => state,
                Some(Ok(())) => self.reply(ReplyCode::Succeeded),
                Some(Err(e)) => {
                    debug!("origin connect failed: {e}");
                    self.reply(ReplyCode::GeneralFailure)
                }
            },
            SocksState::Copy => self.relay(key, false),
            _ => state,
        }
    }

    fn on_block_ready(&mut self, state: SocksState, key: &mut Key<'_>) -> SocksState {
        if state != SocksState::RequestResolve {
            return state;
        }

        let Phase::Dial {
            resolution: Some(slot),
            ..
        } = &self.phase
        else {
            return state;
        };

        // A notification meant for an earlier owner of this fd
        let Some(addrs) = slot.get() else {
            return state;
        };

        let first = addrs.first().copied();
        match first {
            Some(addr) => self.connect(key, addr),
            None => self.reply(ReplyCode::GeneralFailure),
        }
    }
}

impl Session for SocksSession {
    fn is_finished(&self, state: SocksState) -> bool {
        self.broken || matches!(state, SocksState::Done | SocksState::Error)
    }

    fn fds(&self) -> Vec<RawFd> {
        let mut fds = vec![self.client_fd];
        fds.extend(self.origin_fd);
        fds
    }

    fn release(&mut self) {
        self.phase = Phase::Closed;
        self.origin = None;
        self.client = None;
        self.ctx.metrics.record_disconnect();

        // DEBUG
        debug!("connection from {} closed", self.client_addr);
    }
}
