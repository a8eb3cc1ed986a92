//! End-to-end tests running the demonstration services over loopback.

use meshwire::config::Role;
use meshwire::runtime::{decode_frame, encode_to_bytes, json_payload, Buffer, DecodeOutcome, Message, MessageRegistry, DEFAULT_MAX_FRAME_SIZE};
use meshwire::services::{register_messages, SimpleData};
use meshwire::{services, Config, Server, ShutdownHandle};
use serde::Serialize;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct Running {
    addr: SocketAddr,
    handle: ShutdownHandle,
    thread: Option<JoinHandle<meshwire::Result<()>>>,
}

impl Drop for Running {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn config(role: Role) -> Config {
    Config {
        listen: "127.0.0.1:0".to_string(),
        role,
        workers: 2,
        tick_ms: 100,
        ..Config::default()
    }
}

fn start(config: Config) -> Running {
    let mut server = Server::bind(config.clone()).unwrap();
    services::install(&mut server, &config).unwrap();
    let addr = server.local_addr();
    let handle = server.shutdown_handle();
    let thread = thread::spawn(move || server.run());
    Running {
        addr,
        handle,
        thread: Some(thread),
    }
}

fn client(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn read_frame(stream: &mut TcpStream) -> SimpleData {
    let mut messages = MessageRegistry::new();
    register_messages(&mut messages);
    let mut buf = Buffer::new();
    loop {
        match decode_frame(&mut buf, &messages, DEFAULT_MAX_FRAME_SIZE) {
            DecodeOutcome::Decoded { message, .. } => {
                return message.downcast_ref::<SimpleData>().unwrap().clone();
            }
            DecodeOutcome::Incomplete => {}
            other => panic!("unexpected reply: {other:?}"),
        }
        let mut chunk = [0u8; 256];
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed before a full frame arrived");
        buf.append(&chunk[..n]);
    }
}

fn read_until(stream: &mut TcpStream, marker: &str) -> String {
    let mut text = String::new();
    let mut chunk = [0u8; 256];
    while !text.contains(marker) {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed early, got {text:?}");
        text.push_str(&String::from_utf8_lossy(&chunk[..n]));
    }
    text
}

fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

#[derive(Debug, Serialize)]
struct Unregistered {
    value: u8,
}

impl Message for Unregistered {
    fn type_name(&self) -> &str {
        "test.unregistered"
    }

    fn encode_payload(&self, out: &mut Buffer) {
        json_payload(self, out);
    }
}

#[test]
fn test_echo_round_trip() {
    let server = start(config(Role::Echo));
    let mut stream = client(server.addr);

    stream.write_all(b"abc").unwrap();
    let mut reply = [0u8; 3];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"abc");
}

#[test]
fn test_responder_reassembles_fragmented_frame() {
    let server = start(config(Role::Responder));
    let mut stream = client(server.addr);

    let frame = encode_to_bytes(&SimpleData::new(7, "hello"));
    stream.write_all(&frame[..5]).unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(&frame[5..]).unwrap();

    let reply = read_frame(&mut stream);
    assert_eq!(reply.id, 8);
    assert!(reply.msg.starts_with("data processed by responder"));
}

#[test]
fn test_responder_answers_unknown_type() {
    let server = start(config(Role::Responder));
    let mut stream = client(server.addr);

    stream
        .write_all(&encode_to_bytes(&Unregistered { value: 1 }))
        .unwrap();
    let reply = read_frame(&mut stream);
    assert_eq!(reply.id, 0);
    assert!(reply.msg.starts_with("bad data"));

    // The connection stays usable after a bad frame
    stream
        .write_all(&encode_to_bytes(&SimpleData::new(1, "again")))
        .unwrap();
    assert_eq!(read_frame(&mut stream).id, 2);
}

#[test]
fn test_fanout_reports_timeout_and_reuse() {
    let responder = start(config(Role::Responder));
    let silent = start(config(Role::Silent));

    let mut fanout_config = config(Role::Fanout);
    fanout_config.upstreams = vec![responder.addr.to_string(), silent.addr.to_string()];
    fanout_config.fanout_timeout_ms = 600;
    let fanout = start(fanout_config);

    let mut stream = client(fanout.addr);
    let started = Instant::now();
    stream.write_all(b"go").unwrap();
    let text = read_until(&mut stream, "subconnection");
    let elapsed = started.elapsed();

    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 4, "{text:?}");
    assert!(lines[0].starts_with("43: data processed by responder"));
    assert_eq!(
        lines[1],
        format!("request to {} rejected: request timed out", silent.addr)
    );
    assert!(lines[2].starts_with("667: data processed by responder"));
    assert_eq!(lines[3], "subconnection reused");

    assert!(elapsed >= Duration::from_millis(400), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
}

#[test]
fn test_fanout_rejects_unreachable_upstream() {
    let responder = start(config(Role::Responder));
    let missing = unused_addr();

    let mut fanout_config = config(Role::Fanout);
    fanout_config.upstreams = vec![responder.addr.to_string(), missing.to_string()];
    fanout_config.fanout_timeout_ms = 2000;
    let fanout = start(fanout_config);

    let mut stream = client(fanout.addr);
    stream.write_all(b"go").unwrap();
    let text = read_until(&mut stream, "subconnection");

    assert!(text.starts_with("43: "), "{text:?}");
    assert!(
        text.contains(&format!("request to {missing} rejected")),
        "{text:?}"
    );
    assert!(text.ends_with("subconnection reused\n"), "{text:?}");
}
