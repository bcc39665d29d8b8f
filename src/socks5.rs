//! SOCKS5 front end.
//!
//! - Features:
//!     - CONNECT to IPv4, IPv6 and domain name destinations
//!     - No Authentication
//!     - Username/Password Authentication against the user store
//!     - Incremental parsers fed from fixed-size buffers
//!     - Name resolution off the reactor thread
//!     - Full-duplex relay with half-close propagation
//!     - POP3 credential sniffing on port 110
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)

pub mod auth;
pub mod connection;
pub mod copy;
pub mod hello;
pub mod protocol;
pub mod request;
pub mod resolve;

pub use connection::{SocksConnection, SocksState};
pub use protocol::{AuthMethod, Command, ReplyCode, Version};
