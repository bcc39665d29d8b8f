//! Management protocol server.
//!
//! Administrators log in with the RFC 1929 username/password exchange and then
//! issue binary commands to inspect metrics, manage users and flip runtime
//! settings. See [`protocol`] for the wire format.

pub mod connection;
pub mod protocol;

pub use connection::{MgmtConnection, MgmtState};
pub use protocol::{MgmtCommand, MgmtRequest, MgmtStatus};
