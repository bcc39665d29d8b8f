//! Method negotiation parser.
//!
//! ```text
//! +----+----------+----------+
//! |VER | NMETHODS | METHODS  |
//! +----+----------+----------+
//! | 1  |    1     | 1 to 255 |
//! +----+----------+----------+
//! ```
//!
//! The server has a single required method; the parser records whether the
//! client offered it.

use crate::buffer::Buffer;
use crate::socks5::protocol::{AuthMethod, Version};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloState {
    Version,
    NMethods,
    Methods,
    Done,
    ErrorUnsupportedVersion,
}

/// HelloParser consumes the client greeting byte by byte
#[derive(Debug)]
pub struct HelloParser {
    state: HelloState,
    remaining: u8,
    required: AuthMethod,
    selected: AuthMethod,
}

impl HelloParser {
    /// new creates a parser that accepts only `required`
    pub fn new(required: AuthMethod) -> Self {
        Self {
            state: HelloState::Version,
            remaining: 0,
            required,
            selected: AuthMethod::NoAcceptable,
        }
    }

    pub fn state(&self) -> HelloState {
        self.state
    }

    /// selected returns the method chosen so far (NoAcceptable until offered)
    pub fn selected(&self) -> AuthMethod {
        self.selected
    }

    /// feed advances the parser by one byte
    pub fn feed(&mut self, byte: u8) -> HelloState {
        self.state = match self.state {
            HelloState::Version if byte == Version::SOCKS5 as u8 => HelloState::NMethods,
            HelloState::Version => HelloState::ErrorUnsupportedVersion,
            HelloState::NMethods if byte == 0 => HelloState::Done,
            HelloState::NMethods => {
                self.remaining = byte;
                HelloState::Methods
            }
            HelloState::Methods => {
                if AuthMethod::from_byte(byte) == self.required {
                    self.selected = self.required;
                }

                self.remaining -= 1;
                if self.remaining == 0 {
                    HelloState::Done
                } else {
                    HelloState::Methods
                }
            }
            HelloState::Done | HelloState::ErrorUnsupportedVersion => {
                error!("hello parser fed past its end in state {:?}", self.state);
                self.state
            }
        };

        self.state
    }

    /// consume feeds buffered bytes until the greeting is complete or the
    /// buffer runs dry. Bytes after the greeting stay in the buffer.
    pub fn consume(&mut self, buf: &mut Buffer) -> HelloState {
        while !self.is_done() {
            match buf.read_byte() {
                Some(byte) => self.feed(byte),
                None => break,
            };
        }
        self.state
    }

    pub fn is_done(&self) -> bool {
        matches!(
            self.state,
            HelloState::Done | HelloState::ErrorUnsupportedVersion
        )
    }

    pub fn has_error(&self) -> bool {
        self.state == HelloState::ErrorUnsupportedVersion
    }

    /// marshall writes the method selection reply, returning false if `buf`
    /// lacks room
    ///
    /// ```text
    /// +----+--------+
    /// |VER | METHOD |
    /// +----+--------+
    /// | 1  |   1    |
    /// +----+--------+
    /// ```
    pub fn marshall(buf: &mut Buffer, method: AuthMethod) -> bool {
        buf.write_all(&[Version::SOCKS5 as u8, method as u8])
    }
}
