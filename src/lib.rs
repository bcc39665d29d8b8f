//! A readiness-driven SOCKS5 proxy
//!
//! ## Overview
//!
//! - Single-threaded reactor built on epoll ([`selector`])
//! - Generic per-connection state machine ([`stm`])
//! - SOCKS5 CONNECT with optional username/password authentication ([`socks5`])
//! - POP3 credential sniffing on relayed traffic ([`pop3`])
//! - Binary management protocol for users, metrics and settings ([`mgmt`])
//!
//! # Example
//! ```no_run
//! use popproxy::{Config, ProxyServer};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::new("127.0.0.1:1080").with_admin("root:toor".parse().unwrap());
//!     let server = ProxyServer::bind(config)?;
//!     server.shutdown_on_ctrl_c();
//!     server.run()
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod context;
pub mod metrics;
pub mod mgmt;
pub mod pop3;
pub mod selector;
pub mod server;
pub mod socks5;
pub mod stm;
pub mod users;

// Re-export main types at crate root for convenience
pub use config::{Config, Settings};
pub use server::{ProxyServer, ShutdownHandle};
pub use users::{Privilege, UserPass};
