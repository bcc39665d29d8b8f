//! Management wire format.
//!
//! After an RFC 1929 style login, every request is a command byte followed by
//! its arguments:
//!
//! ```text
//! +-----+---------------------------------------+
//! | CMD | ARGS                                  |
//! +-----+---------------------------------------+
//! | 00  | METRICS                               |
//! | 01  | LIST_USERS                            |
//! | 02  | ADD_USER  ULEN UNAME PLEN PASSWD PRIV |
//! | 03  | DEL_USER  ULEN UNAME                  |
//! | 04  | SET_DISSECTOR FLAG                    |
//! | 05  | SET_AUTH  FLAG                        |
//! | 06  | SETTINGS                              |
//! +-----+---------------------------------------+
//! ```
//!
//! and every reply is
//!
//! ```text
//! +--------+-----+----------+
//! | STATUS | LEN |   DATA   |
//! +--------+-----+----------+
//! |   1    |  2  | LEN      |
//! +--------+-----+----------+
//! ```
//!
//! with LEN in network byte order.

use crate::buffer::Buffer;
use crate::users::Privilege;
use tracing::error;

/// MgmtCommand is the CMD byte
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgmtCommand {
    Metrics = 0x00,
    ListUsers = 0x01,
    AddUser = 0x02,
    DelUser = 0x03,
    SetDissector = 0x04,
    SetAuth = 0x05,
    Settings = 0x06,
}

impl MgmtCommand {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(MgmtCommand::Metrics),
            0x01 => Some(MgmtCommand::ListUsers),
            0x02 => Some(MgmtCommand::AddUser),
            0x03 => Some(MgmtCommand::DelUser),
            0x04 => Some(MgmtCommand::SetDissector),
            0x05 => Some(MgmtCommand::SetAuth),
            0x06 => Some(MgmtCommand::Settings),
            _ => None,
        }
    }
}

/// MgmtStatus is the STATUS byte of a reply
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgmtStatus {
    Ok = 0x00,
    InvalidCommand = 0x01,
    InvalidArgs = 0x02,
    UserExists = 0x03,
    UnknownUser = 0x04,
    ServerError = 0x05,
}

/// MgmtRequest is a fully parsed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MgmtRequest {
    Metrics,
    ListUsers,
    AddUser {
        username: String,
        password: String,
        privilege: Privilege,
    },
    DelUser {
        username: String,
    },
    SetDissector(bool),
    SetAuth(bool),
    Settings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Command,
    ULen,
    UName,
    PLen,
    Passwd,
    Privilege,
    Flag,
    Done,
    ErrorInvalidCommand,
    ErrorInvalidArgs,
}

/// CommandParser consumes one command byte by byte
#[derive(Debug)]
pub struct CommandParser {
    state: CommandState,
    command: MgmtCommand,
    remaining: usize,
    username: Vec<u8>,
    password: Vec<u8>,
    request: Option<MgmtRequest>,
}

impl Default for CommandParser {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandParser {
    pub fn new() -> Self {
        Self {
            state: CommandState::Command,
            command: MgmtCommand::Metrics,
            remaining: 0,
            username: Vec::new(),
            password: Vec::new(),
            request: None,
        }
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    /// request returns the parsed command once the parser is done without error
    pub fn request(&self) -> Option<&MgmtRequest> {
        self.request.as_ref()
    }

    /// feed advances the parser by one byte
    pub fn feed(&mut self, byte: u8) -> CommandState {
        self.state = match self.state {
            CommandState::Command => match MgmtCommand::from_byte(byte) {
                Some(command) => {
                    self.command = command;
                    match command {
                        MgmtCommand::Metrics => self.finish(MgmtRequest::Metrics),
                        MgmtCommand::ListUsers => self.finish(MgmtRequest::ListUsers),
                        MgmtCommand::Settings => self.finish(MgmtRequest::Settings),
                        MgmtCommand::AddUser | MgmtCommand::DelUser => CommandState::ULen,
                        MgmtCommand::SetDissector | MgmtCommand::SetAuth => CommandState::Flag,
                    }
                }
                None => CommandState::ErrorInvalidCommand,
            },
            CommandState::ULen if byte == 0 => CommandState::ErrorInvalidArgs,
            CommandState::ULen => {
                self.remaining = byte as usize;
                CommandState::UName
            }
            CommandState::UName => {
                self.username.push(byte);
                self.remaining -= 1;
                match (self.remaining, self.command) {
                    (0, MgmtCommand::DelUser) => match String::from_utf8(self.username.clone()) {
                        Ok(username) => self.finish(MgmtRequest::DelUser { username }),
                        Err(_) => CommandState::ErrorInvalidArgs,
                    },
                    (0, _) => CommandState::PLen,
                    _ => CommandState::UName,
                }
            }
            CommandState::PLen if byte == 0 => CommandState::ErrorInvalidArgs,
            CommandState::PLen => {
                self.remaining = byte as usize;
                CommandState::Passwd
            }
            CommandState::Passwd => {
                self.password.push(byte);
                self.remaining -= 1;
                if self.remaining == 0 {
                    CommandState::Privilege
                } else {
                    CommandState::Passwd
                }
            }
            CommandState::Privilege => {
                let username = String::from_utf8(std::mem::take(&mut self.username));
                let password = String::from_utf8(std::mem::take(&mut self.password));
                match (username, password, Privilege::from_byte(byte)) {
                    (Ok(username), Ok(password), Some(privilege)) => {
                        self.finish(MgmtRequest::AddUser {
                            username,
                            password,
                            privilege,
                        })
                    }
                    _ => CommandState::ErrorInvalidArgs,
                }
            }
            CommandState::Flag => match (byte, self.command) {
                (0 | 1, MgmtCommand::SetAuth) => self.finish(MgmtRequest::SetAuth(byte == 1)),
                (0 | 1, _) => self.finish(MgmtRequest::SetDissector(byte == 1)),
                _ => CommandState::ErrorInvalidArgs,
            },
            CommandState::Done
            | CommandState::ErrorInvalidCommand
            | CommandState::ErrorInvalidArgs => {
                error!("command parser fed past its end in state {:?}", self.state);
                self.state
            }
        };

        self.state
    }

    /// consume feeds buffered bytes until the command is complete or the buffer
    /// runs dry. Bytes of the next command stay in the buffer.
    pub fn consume(&mut self, buf: &mut Buffer) -> CommandState {
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
            CommandState::Done | CommandState::ErrorInvalidCommand | CommandState::ErrorInvalidArgs
        )
    }

    pub fn has_error(&self) -> bool {
        self.is_done() && self.state != CommandState::Done
    }

    /// error_status maps a parse failure to its reply status
    pub fn error_status(&self) -> MgmtStatus {
        match self.state {
            CommandState::ErrorInvalidCommand => MgmtStatus::InvalidCommand,
            _ => MgmtStatus::InvalidArgs,
        }
    }

    /// marshall writes a reply, returning false if `buf` lacks room or `data` is
    /// too long for the LEN field
    pub fn marshall(buf: &mut Buffer, status: MgmtStatus, data: &[u8]) -> bool {
        let Ok(len) = u16::try_from(data.len()) else {
            return false;
        };

        if buf.writable() < 3 + data.len() {
            return false;
        }

        let [hi, lo] = len.to_be_bytes();
        buf.write_all(&[status as u8, hi, lo]) && buf.write_all(data)
    }

    fn finish(&mut self, request: MgmtRequest) -> CommandState {
        self.request = Some(request);
        CommandState::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &[u8]) -> (CommandParser, Buffer) {
        let mut buf = Buffer::new(1024);
        assert!(buf.write_all(input));
        let mut parser = CommandParser::new();
        parser.consume(&mut buf);
        (parser, buf)
    }

    #[test]
    fn test_argumentless_commands() {
        for (byte, expected) in [
            (0x00, MgmtRequest::Metrics),
            (0x01, MgmtRequest::ListUsers),
            (0x06, MgmtRequest::Settings),
        ] {
            let (parser, _) = parse(&[byte]);
            assert_eq!(parser.request(), Some(&expected));
        }
    }

    #[test]
    fn test_add_user() {
        let (parser, _) = parse(&[0x02, 3, b'b', b'o', b'b', 2, b'p', b'w', 0x01]);
        assert_eq!(
            parser.request(),
            Some(&MgmtRequest::AddUser {
                username: "bob".into(),
                password: "pw".into(),
                privilege: Privilege::Admin,
            })
        );
    }

    #[test]
    fn test_del_user_leaves_next_command_buffered() {
        let (parser, buf) = parse(&[0x03, 1, b'x', 0x00]);
        assert_eq!(
            parser.request(),
            Some(&MgmtRequest::DelUser {
                username: "x".into()
            })
        );
        assert_eq!(buf.read_slice(), &[0x00]);
    }

    #[test]
    fn test_flags() {
        let (parser, _) = parse(&[0x04, 0x00]);
        assert_eq!(parser.request(), Some(&MgmtRequest::SetDissector(false)));

        let (parser, _) = parse(&[0x05, 0x01]);
        assert_eq!(parser.request(), Some(&MgmtRequest::SetAuth(true)));

        let (parser, _) = parse(&[0x05, 0x02]);
        assert_eq!(parser.error_status(), MgmtStatus::InvalidArgs);
    }

    #[test]
    fn test_invalid_input() {
        let (parser, _) = parse(&[0x7F]);
        assert!(parser.has_error());
        assert_eq!(parser.error_status(), MgmtStatus::InvalidCommand);

        let (parser, _) = parse(&[0x02, 0x00]);
        assert_eq!(parser.error_status(), MgmtStatus::InvalidArgs);

        let (parser, _) = parse(&[0x02, 1, b'a', 1, b'b', 0x09]);
        assert_eq!(parser.state(), CommandState::ErrorInvalidArgs);
    }

    #[test]
    fn test_partial_command_waits() {
        let (parser, _) = parse(&[0x02, 3, b'a']);
        assert_eq!(parser.state(), CommandState::UName);
        assert!(!parser.is_done());
    }

    #[test]
    fn test_marshall_reply() {
        let mut buf = Buffer::new(8);
        assert!(CommandParser::marshall(&mut buf, MgmtStatus::Ok, &[1, 0]));
        assert_eq!(buf.read_slice(), &[0x00, 0x00, 0x02, 1, 0]);

        // 3 + 6 bytes do not fit in the remaining 3
        assert!(!CommandParser::marshall(&mut buf, MgmtStatus::Ok, &[0; 6]));
        assert_eq!(buf.readable(), 5);
    }
}
