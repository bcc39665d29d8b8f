//! End-to-end SOCKS5 tests over loopback

mod common;

use common::{
    TestServer, assert_closed, connect_request, echo_server, loopback_config, read_exact,
};
use popproxy::UserPass;
use std::io::Write;
use std::net::TcpListener;
use std::time::Duration;

fn creds(s: &str) -> UserPass {
    s.parse().unwrap()
}

fn userpass_auth(user: &str, pass: &str) -> Vec<u8> {
    let mut auth = vec![0x01, user.len() as u8];
    auth.extend_from_slice(user.as_bytes());
    auth.push(pass.len() as u8);
    auth.extend_from_slice(pass.as_bytes());
    auth
}

#[test]
fn test_no_auth_connect_relays_data() {
    let server = TestServer::start(loopback_config());
    let origin = echo_server();
    let mut client = server.connect();

    client.write_all(&[0x05, 0x01, 0x00]).unwrap();
    assert_eq!(read_exact::<2>(&mut client), [0x05, 0x00]);

    client.write_all(&connect_request(origin)).unwrap();
    let reply = read_exact::<10>(&mut client);
    assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

    client.write_all(b"ping").unwrap();
    assert_eq!(&read_exact::<4>(&mut client), b"ping");
}

#[test]
fn test_pipelined_handshake() {
    let server = TestServer::start(loopback_config());
    let origin = echo_server();
    let mut client = server.connect();

    let mut burst = vec![0x05, 0x01, 0x00];
    burst.extend_from_slice(&connect_request(origin));
    burst.extend_from_slice(b"early");
    client.write_all(&burst).unwrap();

    let replies = read_exact::<12>(&mut client);
    assert_eq!(&replies[..2], &[0x05, 0x00]);
    assert_eq!(replies[3], 0x00);
    assert_eq!(&read_exact::<5>(&mut client), b"early");
}

#[test]
fn test_domain_name_destination() {
    let server = TestServer::start(loopback_config());
    let origin = echo_server();
    let mut client = server.connect();

    client.write_all(&[0x05, 0x01, 0x00]).unwrap();
    read_exact::<2>(&mut client);

    let host = b"127.0.0.1";
    let mut req = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    req.extend_from_slice(host);
    req.extend_from_slice(&origin.port().to_be_bytes());
    client.write_all(&req).unwrap();

    assert_eq!(read_exact::<10>(&mut client)[1], 0x00);
    client.write_all(b"resolved").unwrap();
    assert_eq!(&read_exact::<8>(&mut client), b"resolved");
}

#[test]
fn test_unresolvable_domain_is_general_failure() {
    let server = TestServer::start(loopback_config());
    let mut client = server.connect();
    // A lookup that has to time out against an unreachable resolver is slow
    client
        .set_read_timeout(Some(Duration::from_secs(60)))
        .unwrap();

    client.write_all(&[0x05, 0x01, 0x00]).unwrap();
    read_exact::<2>(&mut client);

    let host = b"nonexistent.invalid";
    let mut req = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    req.extend_from_slice(host);
    req.extend_from_slice(&80u16.to_be_bytes());
    client.write_all(&req).unwrap();

    assert_eq!(read_exact::<10>(&mut client)[1], 0x01);
    assert_closed(&mut client);
}

#[test]
fn test_userpass_success() {
    let config = loopback_config().with_user(creds("alice:secret"));
    let server = TestServer::start(config);
    let origin = echo_server();
    let mut client = server.connect();

    client.write_all(&[0x05, 0x02, 0x00, 0x02]).unwrap();
    assert_eq!(read_exact::<2>(&mut client), [0x05, 0x02]);

    client.write_all(&userpass_auth("alice", "secret")).unwrap();
    assert_eq!(read_exact::<2>(&mut client), [0x01, 0x00]);

    client.write_all(&connect_request(origin)).unwrap();
    assert_eq!(read_exact::<10>(&mut client)[1], 0x00);
}

#[test]
fn test_userpass_denied_closes() {
    let config = loopback_config().with_user(creds("alice:secret"));
    let server = TestServer::start(config);
    let mut client = server.connect();

    client.write_all(&[0x05, 0x01, 0x02]).unwrap();
    read_exact::<2>(&mut client);

    client.write_all(&userpass_auth("alice", "wrong")).unwrap();
    assert_eq!(read_exact::<2>(&mut client), [0x01, 0x01]);
    assert_closed(&mut client);
}

#[test]
fn test_no_acceptable_method_closes() {
    let config = loopback_config().with_user(creds("alice:secret"));
    let server = TestServer::start(config);
    let mut client = server.connect();

    // Only offers "no authentication" while credentials are required
    client.write_all(&[0x05, 0x01, 0x00]).unwrap();
    assert_eq!(read_exact::<2>(&mut client), [0x05, 0xFF]);
    assert_closed(&mut client);
}

#[test]
fn test_unsupported_command_reply() {
    let server = TestServer::start(loopback_config());
    let mut client = server.connect();

    client.write_all(&[0x05, 0x01, 0x00]).unwrap();
    read_exact::<2>(&mut client);

    // BIND
    client
        .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
        .unwrap();
    let reply = read_exact::<10>(&mut client);
    assert_eq!(reply[1], 0x07);
    assert_closed(&mut client);
}

#[test]
fn test_refused_origin_reports_general_failure() {
    let server = TestServer::start(loopback_config());

    // Grab a free port and release it so nothing listens there
    let closed = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();

    let mut client = server.connect();
    client.write_all(&[0x05, 0x01, 0x00]).unwrap();
    read_exact::<2>(&mut client);

    client.write_all(&connect_request(closed)).unwrap();
    assert_eq!(read_exact::<10>(&mut client)[1], 0x01);
    assert_closed(&mut client);
}

#[test]
fn test_half_close_delivers_pending_data() {
    let server = TestServer::start(loopback_config());
    let origin = echo_server();
    let mut client = server.connect();

    client.write_all(&[0x05, 0x01, 0x00]).unwrap();
    read_exact::<2>(&mut client);
    client.write_all(&connect_request(origin)).unwrap();
    read_exact::<10>(&mut client);

    client.write_all(b"bye").unwrap();
    client.shutdown(std::net::Shutdown::Write).unwrap();

    // The echo still comes back, then the origin's EOF
    assert_eq!(&read_exact::<3>(&mut client), b"bye");
    assert_closed(&mut client);
}
