use crate::buffer::Buffer;
use crate::context::ServerContext;
use crate::mgmt::protocol::{CommandParser, MgmtRequest, MgmtStatus};
use crate::selector::{Interest, Key};
use crate::socks5::auth::AuthParser;
use crate::socks5::copy::is_transient;
use crate::socks5::protocol::AuthStatus;
use crate::stm::{Connection, Session, StateHandler};
use crate::users::{Privilege, UserStoreError};
use anyhow::{Context, Result};
use socket2::Socket;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Size of each management buffer; fits a full LIST_USERS reply
const MGMT_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MgmtState {
    AuthRead,
    AuthWrite,
    CmdRead,
    CmdWrite,
    Done,
    Error,
}

pub type MgmtConnection = Connection<MgmtSession>;

enum MgmtPhase {
    Auth {
        parser: AuthParser,
        status: AuthStatus,
    },
    Command {
        parser: CommandParser,
        close_after: bool,
    },
    Closed,
}

/// MgmtSession is one administrator connection
pub struct MgmtSession {
    ctx: Rc<ServerContext>,
    socket: Option<Socket>,
    fd: RawFd,
    peer_addr: String,
    read_buffer: Buffer,
    write_buffer: Buffer,
    phase: MgmtPhase,
    admin: String,
    broken: bool,
}

/// accept builds, registers and starts a management connection
pub fn accept(
    key: &mut Key<'_>,
    ctx: Rc<ServerContext>,
    socket: Socket,
    peer_addr: String,
) -> Result<Rc<MgmtConnection>> {
    let fd = socket.as_raw_fd();

    let conn = Connection::new(MgmtState::AuthRead, MgmtState::Error, |_| MgmtSession {
        ctx,
        socket: Some(socket),
        fd,
        peer_addr,
        read_buffer: Buffer::new(MGMT_BUFFER_SIZE),
        write_buffer: Buffer::new(MGMT_BUFFER_SIZE),
        phase: MgmtPhase::Auth {
            parser: AuthParser::new(),
            status: AuthStatus::Failure,
        },
        admin: String::new(),
        broken: false,
    });

    key.selector
        .register(fd, conn.clone(), Interest::NOOP)
        .context("[ERR] failed to register management socket")?;

    conn.start(&mut Key {
        selector: &mut *key.selector,
        fd,
    });

    Ok(conn)
}

impl MgmtSession {
    fn set_interest(&mut self, key: &mut Key<'_>, interest: Interest) {
        if let Err(e) = key.selector.set_interest(self.fd, interest) {
            warn!("failed to set interest on management fd {}: {e}", self.fd);
            self.broken = true;
        }
    }

    /// receive returns false on EOF or a hard error
    fn receive(&mut self) -> bool {
        let Some(socket) = self.socket.as_ref() else {
            return false;
        };

        if !self.read_buffer.can_write() {
            return true;
        }

        let mut reader: &Socket = socket;
        match reader.read(self.read_buffer.write_slice()) {
            Ok(0) => false,
            Ok(n) => {
                self.read_buffer.advance_write(n);
                true
            }
            Err(e) if is_transient(&e) => true,
            Err(e) => {
                debug!("management read from {} failed: {e}", self.peer_addr);
                false
            }
        }
    }

    fn flush(&mut self) -> io::Result<bool> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;

        let mut writer: &Socket = socket;
        match writer.write(self.write_buffer.read_slice()) {
            Ok(n) => self.write_buffer.advance_read(n),
            Err(e) if is_transient(&e) => {}
            Err(e) => return Err(e),
        }

        Ok(!self.write_buffer.can_read())
    }

    fn parse_login(&mut self) -> MgmtState {
        let MgmtPhase::Auth { parser, status } = &mut self.phase else {
            return MgmtState::Error;
        };

        parser.consume(&mut self.read_buffer);
        if !parser.is_done() {
            return MgmtState::AuthRead;
        }

        let granted = !parser.has_error()
            && self
                .ctx
                .users
                .borrow()
                .lookup(parser.username(), parser.password())
                .grants(Privilege::Admin);

        let username = String::from_utf8_lossy(parser.username()).into_owned();
        if granted {
            info!("admin '{username}' logged in from {}", self.peer_addr);
            *status = AuthStatus::Success;
            self.admin = username;
        } else {
            warn!("management login failed for '{username}' from {}", self.peer_addr);
            *status = AuthStatus::Failure;
        }

        if !AuthParser::marshall(&mut self.write_buffer, *status) {
            return MgmtState::Error;
        }
        MgmtState::AuthWrite
    }

    fn parse_command(&mut self) -> MgmtState {
        let MgmtPhase::Command {
            parser,
            close_after,
        } = &mut self.phase
        else {
            return MgmtState::Error;
        };

        parser.consume(&mut self.read_buffer);
        if !parser.is_done() {
            return MgmtState::CmdRead;
        }

        let (status, data) = match parser.request().cloned() {
            Some(request) => execute(&self.ctx, &self.admin, request),
            None => {
                *close_after = true;
                debug!(
                    "invalid management command from {}: {:?}",
                    self.peer_addr,
                    parser.state()
                );
                (parser.error_status(), Vec::new())
            }
        };

        if !CommandParser::marshall(&mut self.write_buffer, status, &data) {
            return MgmtState::Error;
        }
        MgmtState::CmdWrite
    }
}

/// execute applies a command and builds the reply payload
fn execute(ctx: &ServerContext, admin: &str, request: MgmtRequest) -> (MgmtStatus, Vec<u8>) {
    match request {
        MgmtRequest::Metrics => {
            let snap = ctx.metrics.snapshot();
            let data = [
                snap.historic_connections,
                snap.current_connections,
                snap.bytes_sent,
                snap.bytes_received,
                snap.credentials_captured,
            ]
            .iter()
            .flat_map(|counter| counter.to_be_bytes())
            .collect();
            (MgmtStatus::Ok, data)
        }
        MgmtRequest::ListUsers => {
            let mut data = Vec::new();
            for user in ctx.users.borrow().list() {
                // Names are at most 255 bytes, enforced by the store
                data.push(user.username.len() as u8);
                data.extend_from_slice(user.username.as_bytes());
                data.push(user.privilege as u8);
            }
            (MgmtStatus::Ok, data)
        }
        MgmtRequest::AddUser {
            username,
            password,
            privilege,
        } => {
            let status = match ctx.users.borrow_mut().add(&username, &password, privilege) {
                Ok(()) => {
                    info!("admin '{admin}' added user '{username}' ({privilege:?})");
                    MgmtStatus::Ok
                }
                Err(UserStoreError::AlreadyExists(_)) => MgmtStatus::UserExists,
                Err(UserStoreError::InvalidCredentials) => MgmtStatus::InvalidArgs,
                Err(e) => {
                    warn!("admin '{admin}' could not add user '{username}': {e}");
                    MgmtStatus::ServerError
                }
            };
            (status, Vec::new())
        }
        MgmtRequest::DelUser { username } => {
            let status = match ctx.users.borrow_mut().remove(&username) {
                Ok(_) => {
                    info!("admin '{admin}' deleted user '{username}'");
                    MgmtStatus::Ok
                }
                Err(_) => MgmtStatus::UnknownUser,
            };
            (status, Vec::new())
        }
        MgmtRequest::SetDissector(enabled) => {
            ctx.update_settings(|s| s.dissector_enabled = enabled);
            info!("admin '{admin}' set POP3 dissector enabled={enabled}");
            (MgmtStatus::Ok, Vec::new())
        }
        MgmtRequest::SetAuth(required) => {
            ctx.update_settings(|s| s.auth_required = required);
            info!("admin '{admin}' set authentication required={required}");
            (MgmtStatus::Ok, Vec::new())
        }
        MgmtRequest::Settings => {
            let settings = ctx.settings();
            let data = vec![
                settings.auth_required as u8,
                settings.dissector_enabled as u8,
            ];
            (MgmtStatus::Ok, data)
        }
    }
}

impl StateHandler for MgmtSession {
    type State = MgmtState;

    fn on_arrival(&mut self, state: MgmtState, key: &mut Key<'_>) {
        match state {
            MgmtState::AuthRead | MgmtState::CmdRead => self.set_interest(key, Interest::READ),
            MgmtState::AuthWrite | MgmtState::CmdWrite => self.set_interest(key, Interest::WRITE),
            MgmtState::Done | MgmtState::Error => {}
        }
    }

    fn on_read_ready(&mut self, state: MgmtState, _key: &mut Key<'_>) -> MgmtState {
        match state {
            MgmtState::AuthRead if !self.receive() => MgmtState::Error,
            MgmtState::AuthRead => self.parse_login(),
            MgmtState::CmdRead if !self.receive() => MgmtState::Done,
            MgmtState::CmdRead => self.parse_command(),
            _ => state,
        }
    }

    fn on_write_ready(&mut self, state: MgmtState, _key: &mut Key<'_>) -> MgmtState {
        if !matches!(state, MgmtState::AuthWrite | MgmtState::CmdWrite) {
            return state;
        }

        match self.flush() {
            Ok(true) => {}
            Ok(false) => return state,
            Err(e) => {
                debug!("management write to {} failed: {e}", self.peer_addr);
                return MgmtState::Error;
            }
        }

        match &self.phase {
            MgmtPhase::Auth {
                status: AuthStatus::Success,
                ..
            }
            | MgmtPhase::Command {
                close_after: false, ..
            } => {
                self.phase = MgmtPhase::Command {
                    parser: CommandParser::new(),
                    close_after: false,
                };
                self.parse_command()
            }
            MgmtPhase::Command {
                close_after: true, ..
            } => MgmtState::Done,
            _ => MgmtState::Error,
        }
    }
}

impl Session for MgmtSession {
    fn is_finished(&self, state: MgmtState) -> bool {
        self.broken || matches!(state, MgmtState::Done | MgmtState::Error)
    }

    fn fds(&self) -> Vec<RawFd> {
        vec![self.fd]
    }

    fn release(&mut self) {
        self.phase = MgmtPhase::Closed;
        self.socket = None;

        // DEBUG
        debug!("management connection from {} closed", self.peer_addr);
    }
}
