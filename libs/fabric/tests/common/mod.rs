#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use meridian_core::protocol::{self, Header, MessageType, ReplyStatus, HEADER_SIZE};
use meridian_core::{BasicStream, RequestHeader};
use meridian_fabric::{Communicator, Config, ConfigBuilder, Endpoint, ObjectAdapter};

static TRACING: Once = Once::new();

/// Log to the test output, filtered by `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Defaults with short shutdown delays
pub fn config() -> ConfigBuilder {
    Config::builder()
        .connect_timeout(Duration::from_secs(2))
        .close_timeout(Duration::from_millis(500))
}

pub fn communicator(config: ConfigBuilder) -> Communicator {
    init_tracing();
    Communicator::new(config.build()).unwrap()
}

/// An active adapter on an ephemeral loopback port
pub fn adapter(communicator: &Communicator, name: &str) -> Arc<ObjectAdapter> {
    let adapter = communicator
        .create_object_adapter(name, &[Endpoint::tcp("127.0.0.1", 0)])
        .unwrap();
    adapter.activate().unwrap();
    adapter
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// A port nothing listens on
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Hand-driven server side of the protocol over a blocking socket
pub struct RawPeer {
    pub stream: TcpStream,
}

impl RawPeer {
    /// Accept one connection and validate it
    pub fn accept(listener: &TcpListener) -> Self {
        let mut peer = Self::accept_unvalidated(listener);
        peer.validate();
        peer
    }

    /// Accept one connection, leaving the client waiting for validation
    pub fn accept_unvalidated(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Self { stream }
    }

    pub fn validate(&mut self) {
        self.send(&protocol::header_only(MessageType::ValidateConnection));
    }

    pub fn send(&mut self, os: &BasicStream) {
        self.stream.write_all(os.as_bytes()).unwrap();
    }

    /// Read one frame; the returned stream is positioned after the header
    pub fn read_frame(&mut self) -> (Header, BasicStream) {
        let mut bytes = vec![0u8; HEADER_SIZE];
        self.stream.read_exact(&mut bytes).unwrap();
        let header = Header::decode(&bytes, 1024 * 1024).unwrap();
        bytes.resize(header.size, 0);
        self.stream.read_exact(&mut bytes[HEADER_SIZE..]).unwrap();
        let mut is = BasicStream::from_vec(bytes);
        is.set_pos(HEADER_SIZE);
        (header, is)
    }

    /// Read a request frame and return its id and header
    pub fn read_request(&mut self) -> (i32, RequestHeader) {
        let (header, mut is) = self.read_frame();
        assert_eq!(header.message_type, MessageType::Request);
        let request_id = is.read_i32().unwrap();
        let request = RequestHeader::read(&mut is).unwrap();
        (request_id, request)
    }

    /// Reply `Ok` with `payload`
    pub fn reply_ok(&mut self, request_id: i32, payload: &[u8]) {
        let mut os = BasicStream::new();
        Header::write(MessageType::Reply, &mut os);
        os.write_i32(request_id);
        os.write_u8(ReplyStatus::Ok as u8);
        os.write_encaps(payload).unwrap();
        protocol::finish_message(&mut os).unwrap();
        self.send(&os);
    }
}
