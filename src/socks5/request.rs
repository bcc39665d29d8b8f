//! Connection request parser (RFC 1928 §4-5).
//!
//! ```text
//! +----+-----+-------+------+----------+----------+
//! |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
//! +----+-----+-------+------+----------+----------+
//! | 1  |  1  | X'00' |  1   | Variable |    2     |
//! +----+-----+-------+------+----------+----------+
//! ```

use crate::buffer::Buffer;
use crate::socks5::protocol::{AddressType, Command, RSV, ReplyCode, Version};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tracing::error;

/// Address represents a network address or domain to be used as the
/// SOCKS5 target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    IPv4([u8; 4]),
    DomainName(String),
    IPv6([u8; 16]),
}

impl Address {
    /// ip returns the literal IP address, or None for a domain name that still
    /// has to be resolved
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::IPv4(octets) => Some(IpAddr::V4(Ipv4Addr::from(*octets))),
            Address::IPv6(octets) => Some(IpAddr::V6(Ipv6Addr::from(*octets))),
            Address::DomainName(_) => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::IPv4(octets) => write!(f, "{}", Ipv4Addr::from(*octets)),
            Address::IPv6(octets) => write!(f, "[{}]", Ipv6Addr::from(*octets)),
            Address::DomainName(name) => f.write_str(name),
        }
    }
}

/// Request is a fully parsed CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub address: Address,
    pub port: u16,
}

impl Request {
    /// socket_addr returns the destination when it needs no resolution
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.address.ip().map(|ip| SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Version,
    Cmd,
    Rsv,
    Atyp,
    DnLength,
    DstAddr,
    DstPort,
    Done,
    ErrorUnsupportedVersion,
    ErrorUnsupportedCommand,
    ErrorUnsupportedAddressType,
    ErrorGeneral,
}

/// RequestParser consumes a client request byte by byte
#[derive(Debug)]
pub struct RequestParser {
    state: RequestState,
    atyp: AddressType,
    addr: [u8; 255],
    addr_len: usize,
    addr_expected: usize,
    port: u16,
    port_read: u8,
    request: Option<Request>,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            state: RequestState::Version,
            atyp: AddressType::IPv4,
            addr: [0u8; 255],
            addr_len: 0,
            addr_expected: 0,
            port: 0,
            port_read: 0,
            request: None,
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// request returns the parsed request once the parser is done without error
    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    /// feed advances the parser by one byte
    pub fn feed(&mut self, byte: u8) -> RequestState {
        self.state = match self.state {
            RequestState::Version if byte == Version::SOCKS5 as u8 => RequestState::Cmd,
            RequestState::Version => RequestState::ErrorUnsupportedVersion,
            RequestState::Cmd => match Command::from_byte(byte) {
                Some(Command::Connect) => RequestState::Rsv,
                _ => RequestState::ErrorUnsupportedCommand,
            },
            RequestState::Rsv if byte == RSV => RequestState::Atyp,
            RequestState::Rsv => RequestState::ErrorGeneral,
            RequestState::Atyp => match AddressType::from_byte(byte) {
                Some(atyp) => {
                    self.atyp = atyp;
                    match atyp {
                        AddressType::IPv4 => self.expect_addr(4),
                        AddressType::IPv6 => self.expect_addr(16),
                        AddressType::DomainName => RequestState::DnLength,
                    }
                }
                None => RequestState::ErrorUnsupportedAddressType,
            },
            RequestState::DnLength if byte == 0 => RequestState::ErrorGeneral,
            RequestState::DnLength => self.expect_addr(byte as usize),
            RequestState::DstAddr => {
                self.addr[self.addr_len] = byte;
                self.addr_len += 1;
                if self.addr_len == self.addr_expected {
                    RequestState::DstPort
                } else {
                    RequestState::DstAddr
                }
            }
            RequestState::DstPort => {
                // Big-endian accumulate
                self.port = (self.port << 8) | byte as u16;
                self.port_read += 1;
                if self.port_read == 2 {
                    self.finish()
                } else {
                    RequestState::DstPort
                }
            }
            RequestState::Done
            | RequestState::ErrorUnsupportedVersion
            | RequestState::ErrorUnsupportedCommand
            | RequestState::ErrorUnsupportedAddressType
            | RequestState::ErrorGeneral => {
                error!("request parser fed past its end in state {:?}", self.state);
                self.state
            }
        };

        self.state
    }

    fn expect_addr(&mut self, len: usize) -> RequestState {
        self.addr_len = 0;
        self.addr_expected = len;
        RequestState::DstAddr
    }

    fn finish(&mut self) -> RequestState {
        let bytes = &self.addr[..self.addr_len];
        let address = match self.atyp {
            AddressType::IPv4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(bytes);
                Address::IPv4(octets)
            }
            AddressType::IPv6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(bytes);
                Address::IPv6(octets)
            }
            AddressType::DomainName => match std::str::from_utf8(bytes) {
                Ok(name) => Address::DomainName(name.to_string()),
                Err(_) => return RequestState::ErrorGeneral,
            },
        };

        self.request = Some(Request {
            command: Command::Connect,
            address,
            port: self.port,
        });
        RequestState::Done
    }

    /// consume feeds buffered bytes until the request is complete or the buffer
    /// runs dry
    pub fn consume(&mut self, buf: &mut Buffer) -> RequestState {
        while !self.is_done() {
            match buf.read_byte() {
                Some(byte) => self.feed(byte),
                None => break,
            };
        }
        self.state
    }

    pub fn is_done(&self) -> bool {
        !matches!(
            self.state,
            RequestState::Version
                | RequestState::Cmd
                | RequestState::Rsv
                | RequestState::Atyp
                | RequestState::DnLength
                | RequestState::DstAddr
                | RequestState::DstPort
        )
    }

    pub fn has_error(&self) -> bool {
        self.is_done() && self.state != RequestState::Done
    }

    /// reply_code maps the parser outcome to the REP field of the reply
    pub fn reply_code(&self) -> ReplyCode {
        match self.state {
            RequestState::Done => ReplyCode::Succeeded,
            RequestState::ErrorUnsupportedCommand => ReplyCode::CommandNotSupported,
            RequestState::ErrorUnsupportedAddressType => ReplyCode::AddressTypeNotSupported,
            _ => ReplyCode::GeneralFailure,
        }
    }

    /// marshall writes the 10 byte reply. The bound address is never reported.
    ///
    /// ```text
    /// +----+-----+-------+------+----------+----------+
    /// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    /// +----+-----+-------+------+----------+----------+
    /// | 1  |  1  | X'00' |  1   | 0.0.0.0  |    0     |
    /// +----+-----+-------+------+----------+----------+
    /// ```
    pub fn marshall(buf: &mut Buffer, code: ReplyCode) -> bool {
        buf.write_all(&[
            Version::SOCKS5 as u8,
            code as u8,
            RSV,
            AddressType::IPv4 as u8,
            0,
            0,
            0,
            0,
            0,
            0,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &[u8]) -> (RequestParser, Buffer) {
        let mut buf = Buffer::new(512);
        assert!(buf.write_all(input));
        let mut parser = RequestParser::new();
        parser.consume(&mut buf);
        (parser, buf)
    }

    #[test]
    fn test_ipv4_request() {
        let (parser, _) = parse(&[0x05, 0x01, 0x00, 0x01, 0xFF, 0xFE, 0xFD, 0xFC, 0x02, 0x01]);
        assert_eq!(parser.state(), RequestState::Done);
        assert_eq!(parser.reply_code(), ReplyCode::Succeeded);

        let request = parser.request().unwrap();
        assert_eq!(request.address, Address::IPv4([0xFF, 0xFE, 0xFD, 0xFC]));
        assert_eq!(request.port, 513);
    }

    #[test]
    fn test_unsupported_command_stops_after_cmd() {
        let (parser, buf) = parse(&[0x05, 0x05, 0x00, 0x01, 0xFF, 0xFE, 0xFD, 0xFC, 0x02, 0x01]);
        assert_eq!(parser.state(), RequestState::ErrorUnsupportedCommand);
        assert_eq!(parser.reply_code(), ReplyCode::CommandNotSupported);
        assert_eq!(buf.readable(), 8);
        assert!(parser.request().is_none());
    }

    #[test]
    fn test_bind_is_not_supported() {
        let (parser, _) = parse(&[0x05, 0x02]);
        assert_eq!(parser.reply_code(), ReplyCode::CommandNotSupported);
    }

    #[test]
    fn test_domain_name_request() {
        let mut input = vec![0x05, 0x01, 0x00, 0x03, 0x0A];
        input.extend_from_slice(b"google.com");
        input.extend_from_slice(&[0x00, 0x50]);

        let (parser, _) = parse(&input);
        assert_eq!(parser.state(), RequestState::Done);

        let request = parser.request().unwrap();
        assert_eq!(request.address, Address::DomainName("google.com".to_string()));
        assert_eq!(request.port, 80);
        assert!(request.socket_addr().is_none());
    }

    #[test]
    fn test_ipv6_request() {
        let mut input = vec![0x05, 0x01, 0x00, 0x04];
        input.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        input.extend_from_slice(&[0x1F, 0x90]);

        let (parser, _) = parse(&input);
        let request = parser.request().unwrap();
        assert_eq!(
            request.socket_addr(),
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 8080))
        );
    }

    #[test]
    fn test_bad_version() {
        let (parser, buf) = parse(&[0x04, 0x01, 0x00]);
        assert_eq!(parser.state(), RequestState::ErrorUnsupportedVersion);
        assert_eq!(parser.reply_code(), ReplyCode::GeneralFailure);
        assert_eq!(buf.readable(), 2);
    }

    #[test]
    fn test_unknown_address_type() {
        let (parser, _) = parse(&[0x05, 0x01, 0x00, 0x02]);
        assert_eq!(parser.reply_code(), ReplyCode::AddressTypeNotSupported);
    }

    #[test]
    fn test_nonzero_reserved_byte() {
        let (parser, _) = parse(&[0x05, 0x01, 0x01]);
        assert_eq!(parser.state(), RequestState::ErrorGeneral);
        assert_eq!(parser.reply_code(), ReplyCode::GeneralFailure);
    }

    #[test]
    fn test_empty_domain_name() {
        let (parser, _) = parse(&[0x05, 0x01, 0x00, 0x03, 0x00]);
        assert!(parser.has_error());
    }

    #[test]
    fn test_split_input() {
        let mut parser = RequestParser::new();
        let mut buf = Buffer::new(16);

        assert!(buf.write_all(&[0x05, 0x01, 0x00, 0x01, 127]));
        assert_eq!(parser.consume(&mut buf), RequestState::DstAddr);

        assert!(buf.write_all(&[0, 0, 1, 0x00]));
        assert_eq!(parser.consume(&mut buf), RequestState::DstPort);

        assert!(buf.write_all(&[0x6E]));
        assert_eq!(parser.consume(&mut buf), RequestState::Done);
        assert_eq!(parser.request().unwrap().port, 110);
    }

    #[test]
    fn test_marshall_reply_is_ten_bytes() {
        let mut buf = Buffer::new(16);
        assert!(RequestParser::marshall(&mut buf, ReplyCode::CommandNotSupported));
        assert_eq!(buf.read_slice(), &[5, 7, 0, 1, 0, 0, 0, 0, 0, 0]);
    }
}
