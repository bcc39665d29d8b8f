//! POP3 credential dissector.
//!
//! The sniffer watches both directions of a relayed POP3 session. Client lines
//! are matched case-insensitively for `USER` and `PASS`; every client command
//! queues the reply it expects. Server lines are matched against that queue,
//! and a `+OK` answering a `PASS` completes the extraction.
//!
//! ```text
//! S: +OK POP3 server ready        (greeting, skipped)
//! C: USER jdoe
//! S: +OK
//! C: PASS hunter2
//! S: +OK maildrop locked          -> Pop3Credentials { jdoe, hunter2 }
//! ```

use std::collections::VecDeque;

/// Longest line kept; the rest of a longer line is dropped
const MAX_LINE: usize = 255;

/// Most client commands awaiting a reply before the sniffer gives up
const MAX_PENDING: usize = 64;

/// Direction of a relayed chunk of bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToOrigin,
    OriginToClient,
}

/// Pop3Credentials are a username/password pair the server accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pop3Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug)]
enum Expect {
    Single,
    MultiLine,
    Pass(Vec<u8>),
}

/// Pop3Sniffer holds the per-connection dissector state
#[derive(Debug, Default)]
pub struct Pop3Sniffer {
    client_line: Vec<u8>,
    server_line: Vec<u8>,
    greeted: bool,
    in_multiline: bool,
    pending: VecDeque<Expect>,
    user: Option<Vec<u8>>,
    done: bool,
}

impl Pop3Sniffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// is_done reports whether credentials were already extracted
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// feed inspects a chunk of relayed bytes. Returns the credentials once, when
    /// the server accepts a password.
    pub fn feed(&mut self, direction: Direction, bytes: &[u8]) -> Option<Pop3Credentials> {
        if self.done {
            return None;
        }

        let mut found = None;
        for &byte in bytes {
            let line = match direction {
                Direction::ClientToOrigin => &mut self.client_line,
                Direction::OriginToClient => &mut self.server_line,
            };

            if byte != b'\n' {
                if line.len() < MAX_LINE {
                    line.push(byte);
                }
                continue;
            }

            let mut line = std::mem::take(line);
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            match direction {
                Direction::ClientToOrigin => {
                    self.client_command(&line);
                    if self.done {
                        break;
                    }
                }
                Direction::OriginToClient => {
                    if let Some(creds) = self.server_reply(&line) {
                        found = Some(creds);
                        self.done = true;
                        break;
                    }
                }
            }
        }

        found
    }

    fn client_command(&mut self, line: &[u8]) {
        if line.is_empty() {
            return;
        }

        // A server that never answers: stop sniffing instead of queueing forever
        if self.pending.len() >= MAX_PENDING {
            self.pending.clear();
            self.user = None;
            self.done = true;
            return;
        }

        let (command, arg) = match line.iter().position(|&b| b == b' ') {
            Some(idx) => (&line[..idx], &line[idx + 1..]),
            None => (line, &line[line.len()..]),
        };

        let expect = if command.eq_ignore_ascii_case(b"USER") {
            self.user = Some(arg.to_vec());
            Expect::Single
        } else if command.eq_ignore_ascii_case(b"PASS") {
            Expect::Pass(arg.to_vec())
        } else if command.eq_ignore_ascii_case(b"CAPA")
            || command.eq_ignore_ascii_case(b"RETR")
            || command.eq_ignore_ascii_case(b"TOP")
            || (arg.is_empty()
                && (command.eq_ignore_ascii_case(b"LIST")
                    || command.eq_ignore_ascii_case(b"UIDL")))
        {
            Expect::MultiLine
        } else {
            Expect::Single
        };

        self.pending.push_back(expect);
    }

    fn server_reply(&mut self, line: &[u8]) -> Option<Pop3Credentials> {
        if self.in_multiline {
            if line == b"." {
                self.in_multiline = false;
            }
            return None;
        }

        if !self.greeted {
            self.greeted = true;
            return None;
        }

        let ok = line.starts_with(b"+OK");
        match self.pending.pop_front()? {
            Expect::Single => None,
            Expect::MultiLine => {
                self.in_multiline = ok;
                None
            }
            Expect::Pass(password) if ok => {
                let username = self.user.as_ref()?;
                Some(Pop3Credentials {
                    username: String::from_utf8_lossy(username).into_owned(),
                    password: String::from_utf8_lossy(&password).into_owned(),
                })
            }
            Expect::Pass(_) => None,
        }
    }
}
