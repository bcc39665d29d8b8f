//! Username/password subnegotiation parser (RFC 1929).
//!
//! ```text
//! +----+------+----------+------+----------+
//! |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
//! +----+------+----------+------+----------+
//! | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
//! +----+------+----------+------+----------+
//! ```
//!
//! The management protocol reuses this parser for its login step.

use crate::buffer::Buffer;
use crate::socks5::protocol::{AuthStatus, USERPASS_VERSION};
use tracing::error;

/// Maximum length of either credential field
pub const MAX_CREDENTIAL_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Version,
    ULen,
    UName,
    PLen,
    Passwd,
    Done,
    InvalidVersion,
}

/// Field is a fixed-size credential slot filled by a running counter
#[derive(Debug)]
struct Field {
    bytes: [u8; MAX_CREDENTIAL_LEN],
    len: usize,
    expected: usize,
}

impl Field {
    fn new() -> Self {
        Self {
            bytes: [0u8; MAX_CREDENTIAL_LEN],
            len: 0,
            expected: 0,
        }
    }

    fn push(&mut self, byte: u8) -> bool {
        self.bytes[self.len] = byte;
        self.len += 1;
        self.len == self.expected
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

/// AuthParser consumes a username/password request byte by byte
#[derive(Debug)]
pub struct AuthParser {
    state: AuthState,
    username: Field,
    password: Field,
}

impl Default for AuthParser {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthParser {
    pub fn new() -> Self {
        Self {
            state: AuthState::Version,
            username: Field::new(),
            password: Field::new(),
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn username(&self) -> &[u8] {
        self.username.as_bytes()
    }

    pub fn password(&self) -> &[u8] {
        self.password.as_bytes()
    }

    /// feed advances the parser by one byte
    pub fn feed(&mut self, byte: u8) -> AuthState {
        self.state = match self.state {
            AuthState::Version if byte == USERPASS_VERSION => AuthState::ULen,
            AuthState::Version => AuthState::InvalidVersion,
            AuthState::ULen => {
                self.username.expected = byte as usize;
                if byte == 0 {
                    AuthState::PLen
                } else {
                    AuthState::UName
                }
            }
            AuthState::UName => {
                if self.username.push(byte) {
                    AuthState::PLen
                } else {
                    AuthState::UName
                }
            }
            AuthState::PLen => {
                self.password.expected = byte as usize;
                if byte == 0 {
                    AuthState::Done
                } else {
                    AuthState::Passwd
                }
            }
            AuthState::Passwd => {
                if self.password.push(byte) {
                    AuthState::Done
                } else {
                    AuthState::Passwd
                }
            }
            AuthState::Done | AuthState::InvalidVersion => {
                error!("auth parser fed past its end in state {:?}", self.state);
                self.state
            }
        };

        self.state
    }

    /// consume feeds buffered bytes until the request is complete or the buffer
    /// runs dry
    pub fn consume(&mut self, buf: &mut Buffer) -> AuthState {
        while !self.is_done() {
            match buf.read_byte() {
                Some(byte) => self.feed(byte),
                None => break,
            };
        }
        self.state
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, AuthState::Done | AuthState::InvalidVersion)
    }

    pub fn has_error(&self) -> bool {
        self.state == AuthState::InvalidVersion
    }

    /// marshall writes the subnegotiation reply, returning false if `buf` lacks room
    ///
    /// ```text
    /// +----+--------+
    /// |VER | STATUS |
    /// +----+--------+
    /// | 1  |   1    |
    /// +----+--------+
    /// ```
    pub fn marshall(buf: &mut Buffer, status: AuthStatus) -> bool {
        buf.write_all(&[USERPASS_VERSION, status as u8])
    }
}
