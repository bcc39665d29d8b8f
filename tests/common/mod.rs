//! Shared helpers for the loopback integration tests

#![allow(dead_code)]

use popproxy::{Config, ProxyServer, ShutdownHandle};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// TestServer runs a proxy on its own thread; the server itself is not Send
pub struct TestServer {
    pub socks_addr: SocketAddr,
    pub mgmt_addr: SocketAddr,
    handle: ShutdownHandle,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start(config: Config) -> Self {
        let (tx, rx) = mpsc::channel();
        let thread = thread::spawn(move || {
            let server = ProxyServer::bind(config).unwrap();
            tx.send((
                server.local_addr(),
                server.mgmt_addr(),
                server.shutdown_handle(),
            ))
            .unwrap();
            server.run().unwrap();
        });

        let (socks_addr, mgmt_addr, handle) = rx.recv().unwrap();
        Self {
            socks_addr,
            mgmt_addr,
            handle,
            thread: Some(thread),
        }
    }

    pub fn connect(&self) -> TcpStream {
        dial(self.socks_addr)
    }

    pub fn connect_mgmt(&self) -> TcpStream {
        dial(self.mgmt_addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// loopback_config binds both listeners to ephemeral loopback ports
pub fn loopback_config() -> Config {
    Config::new("127.0.0.1:0").with_mgmt_addr("127.0.0.1:0")
}

pub fn dial(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

/// echo_server accepts one connection and echoes it back until EOF
pub fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut buf = [0u8; 1024];
            while let Ok(n) = stream.read(&mut buf) {
                if n == 0 || stream.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
        }
    });
    addr
}

/// connect_request builds a CONNECT request for an IPv4 destination
pub fn connect_request(addr: SocketAddr) -> Vec<u8> {
    let SocketAddr::V4(v4) = addr else {
        panic!("IPv4 destination expected");
    };

    let mut req = vec![0x05, 0x01, 0x00, 0x01];
    req.extend_from_slice(&v4.ip().octets());
    req.extend_from_slice(&v4.port().to_be_bytes());
    req
}

pub fn read_exact<const N: usize>(stream: &mut TcpStream) -> [u8; N] {
    let mut buf = [0u8; N];
    stream.read_exact(&mut buf).unwrap();
    buf
}

/// assert_closed checks that the peer closed the connection
pub fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "expected EOF, got {:?}", &buf[..n]);
}
