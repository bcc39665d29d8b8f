//! Full-duplex relay between the client and the origin.
//!
//! ```text
//!            read_buffer (client -> origin)
//!   client  ------------------------------>  origin
//!           <------------------------------
//!            write_buffer (origin -> client)
//! ```
//!
//! Each end has a [`Copy`] whose duplex mask only ever loses bits. When one end
//! stops producing, the other end's write half is shut down once everything
//! already buffered for it has been sent. The relay is finished when both masks
//! are empty.

use crate::buffer::Buffer;
use crate::context::ServerContext;
use crate::pop3::{Direction, Pop3Sniffer};
use crate::selector::Interest;
use socket2::Socket;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::RawFd;
use tracing::{debug, info};

const CLIENT: usize = 0;
const ORIGIN: usize = 1;

/// Copy is one end of the relay
#[derive(Debug)]
pub struct Copy {
    pub fd: RawFd,
    pub duplex: Interest,
}

/// Pipes are the sockets and buffers of the connection, lent to the relay for
/// one event
pub struct Pipes<'a> {
    pub client: &'a Socket,
    pub origin: &'a Socket,
    pub read_buffer: &'a mut Buffer,
    pub write_buffer: &'a mut Buffer,
}

impl<'a> Pipes<'a> {
    fn socket(&self, idx: usize) -> &'a Socket {
        if idx == CLIENT { self.client } else { self.origin }
    }

    /// inbound is the buffer end `idx` receives into
    fn inbound(&mut self, idx: usize) -> &mut Buffer {
        if idx == CLIENT {
            self.read_buffer
        } else {
            self.write_buffer
        }
    }

    /// outbound is the buffer end `idx` sends from
    fn outbound(&mut self, idx: usize) -> &mut Buffer {
        if idx == CLIENT {
            self.write_buffer
        } else {
            self.read_buffer
        }
    }
}

/// Relay holds both ends and the optional POP3 dissector
pub struct Relay {
    copies: [Copy; 2],
    sniffer: Option<Pop3Sniffer>,
    user: Option<String>,
    destination: String,
}

impl Relay {
    pub fn new(
        client_fd: RawFd,
        origin_fd: RawFd,
        sniffer: Option<Pop3Sniffer>,
        user: Option<String>,
        destination: String,
    ) -> Self {
        let both = Interest::READ | Interest::WRITE;
        Self {
            copies: [
                Copy {
                    fd: client_fd,
                    duplex: both,
                },
                Copy {
                    fd: origin_fd,
                    duplex: both,
                },
            ],
            sniffer,
            user,
            destination,
        }
    }

    pub fn copies(&self) -> &[Copy; 2] {
        &self.copies
    }

    /// index_of maps a ready fd to its end
    pub fn index_of(&self, fd: RawFd) -> Option<usize> {
        self.copies.iter().position(|copy| copy.fd == fd)
    }

    pub fn is_done(&self) -> bool {
        self.copies.iter().all(|copy| copy.duplex.is_empty())
    }

    /// on_readable receives into end `idx`'s inbound buffer
    pub fn on_readable(&mut self, idx: usize, pipes: &mut Pipes<'_>, ctx: &ServerContext) {
        let peer = 1 - idx;
        if !self.copies[idx].duplex.contains(Interest::READ) || !pipes.inbound(idx).can_write() {
            return;
        }

        let socket = pipes.socket(idx);
        let result = {
            let mut reader: &Socket = socket;
            reader.read(pipes.inbound(idx).write_slice())
        };

        let n = match result {
            Ok(n) if n > 0 => n,
            Err(e) if is_transient(&e) => return,
            result => {
                if let Err(e) = result {
                    debug!("relay read on fd {} failed: {e}", self.copies[idx].fd);
                }

                let _ = pipes.socket(idx).shutdown(Shutdown::Read);
                self.copies[idx].duplex.remove(Interest::READ);

                // Nothing left for the peer to send: close its write half now
                if !pipes.inbound(idx).can_read() {
                    self.close_write(peer, pipes);
                }
                return;
            }
        };

        let inbound = pipes.inbound(idx);
        inbound.advance_write(n);

        if ctx.settings().dissector_enabled {
            let chunk = &inbound.read_slice()[inbound.readable() - n..];
            let direction = if idx == CLIENT {
                Direction::ClientToOrigin
            } else {
                Direction::OriginToClient
            };

            if let Some(creds) = self.sniffer.as_mut().and_then(|s| s.feed(direction, chunk)) {
                info!(
                    target: "pop3",
                    "credentials captured: user={} password={} destination={} proxy_user={}",
                    creds.username,
                    creds.password,
                    self.destination,
                    self.user.as_deref().unwrap_or("-"),
                );
                ctx.metrics.record_credentials();
            }
        }
    }

    /// on_writable sends from end `idx`'s outbound buffer
    pub fn on_writable(&mut self, idx: usize, pipes: &mut Pipes<'_>, ctx: &ServerContext) {
        let peer = 1 - idx;
        if !self.copies[idx].duplex.contains(Interest::WRITE) || !pipes.outbound(idx).can_read() {
            return;
        }

        let socket = pipes.socket(idx);
        let result = {
            let mut writer: &Socket = socket;
            writer.write(pipes.outbound(idx).read_slice())
        };

        match result {
            Ok(n) => {
                pipes.outbound(idx).advance_read(n);
                if idx == ORIGIN {
                    ctx.metrics.record_bytes_transferred(n as u64, 0);
                } else {
                    ctx.metrics.record_bytes_transferred(0, n as u64);
                }

                // The peer finished producing and everything it sent is out
                if !pipes.outbound(idx).can_read()
                    && !self.copies[peer].duplex.contains(Interest::READ)
                {
                    self.close_write(idx, pipes);
                }
            }
            Err(e) if is_transient(&e) => {}
            Err(e) => {
                debug!("relay write on fd {} failed: {e}", self.copies[idx].fd);
                self.close_write(idx, pipes);

                let _ = pipes.socket(peer).shutdown(Shutdown::Read);
                self.copies[peer].duplex.remove(Interest::READ);
            }
        }
    }

    /// interests computes what each end should wait for next
    pub fn interests(&self, pipes: &mut Pipes<'_>) -> [Interest; 2] {
        [CLIENT, ORIGIN].map(|idx| {
            let duplex = self.copies[idx].duplex;
            let mut interest = Interest::NOOP;
            if duplex.contains(Interest::READ) && pipes.inbound(idx).can_write() {
                interest |= Interest::READ;
            }
            if duplex.contains(Interest::WRITE) && pipes.outbound(idx).can_read() {
                interest |= Interest::WRITE;
            }
            interest
        })
    }

    fn close_write(&mut self, idx: usize, pipes: &Pipes<'_>) {
        if self.copies[idx].duplex.contains(Interest::WRITE) {
            let _ = pipes.socket(idx).shutdown(Shutdown::Write);
            self.copies[idx].duplex.remove(Interest::WRITE);
        }
    }
}

/// is_transient reports errors that only mean "try again later"
pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
