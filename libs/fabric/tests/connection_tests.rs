mod common;

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::RawPeer;
use meridian_core::protocol::{self, MessageType};
use meridian_core::{BasicStream, Context, Header, Identity, OperationMode, RequestHeader};
use meridian_fabric::{Current, DispatchResult, Endpoint, Error, State};
use parking_lot::Mutex;

const WAIT: Duration = Duration::from_secs(5);

fn listener() -> (TcpListener, Endpoint) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, Endpoint::tcp("127.0.0.1", port))
}

/// Servant appending every operation name to a shared log
fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&Current, &[u8]) -> DispatchResult) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let servant = move |current: &Current, _params: &[u8]| -> DispatchResult {
        log.lock().push(current.operation.clone());
        Ok(Vec::new())
    };
    (seen, servant)
}

#[test]
fn pending_requests_have_distinct_ids() {
    let (listener, endpoint) = listener();
    let (ids_tx, ids_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let server = thread::spawn(move || {
        let mut peer = RawPeer::accept(&listener);
        let ids: Vec<i32> = (0..8).map(|_| peer.read_request().0).collect();
        ids_tx.send(ids.clone()).unwrap();
        go_rx.recv().unwrap();
        // Answer out of order
        for id in ids.iter().rev() {
            peer.reply_ok(*id, &id.to_le_bytes());
        }
    });

    let client = common::communicator(common::config());
    let proxy = client.proxy(Identity::new("foo"), vec![endpoint]);
    let connection = proxy.connection().unwrap().unwrap();

    let (tx, rx) = mpsc::channel();
    for _ in 0..8 {
        let tx = tx.clone();
        proxy.invoke_async("op", OperationMode::Normal, &[], move |result| {
            let _ = tx.send(result);
        });
    }

    let ids = ids_rx.recv_timeout(WAIT).unwrap();
    let distinct: HashSet<i32> = ids.iter().copied().collect();
    assert_eq!(distinct.len(), 8);
    assert!(ids.iter().all(|id| *id > 0));
    assert_eq!(connection.pending_requests(), 8);
    go_tx.send(()).unwrap();

    // Every reply reaches the request it answers
    let mut answered = HashSet::new();
    for _ in 0..8 {
        let payload = rx.recv_timeout(WAIT).unwrap().unwrap();
        answered.insert(i32::from_le_bytes(payload.try_into().unwrap()));
    }
    assert_eq!(answered, distinct);
    assert!(common::eventually(WAIT, || connection.pending_requests() == 0));
    server.join().unwrap();
}

#[test]
fn connection_loss_after_send_is_non_repeatable() {
    let (listener, endpoint) = listener();
    let server = thread::spawn(move || {
        let mut peer = RawPeer::accept(&listener);
        let (_, request) = peer.read_request();
        assert_eq!(request.operation, "op");
        // Hang up without replying
        drop(peer);
        listener
    });

    let client = common::communicator(common::config().retry_intervals([0, 0]));
    let proxy = client.proxy(Identity::new("foo"), vec![endpoint]);
    let err = proxy.invoke("op", OperationMode::Normal, &[]).unwrap_err();
    assert!(err.is_non_repeatable(), "unexpected error: {err}");
    assert!(matches!(err.cause(), Error::ConnectionLost));

    // No second attempt was made
    let listener = server.join().unwrap();
    listener.set_nonblocking(true).unwrap();
    assert!(listener.accept().is_err());
}

#[test]
fn idempotent_call_is_retried_after_connection_loss() {
    let (listener, endpoint) = listener();
    let server = thread::spawn(move || {
        let mut first = RawPeer::accept(&listener);
        first.read_request();
        drop(first);

        let mut second = RawPeer::accept(&listener);
        let (id, request) = second.read_request();
        assert_eq!(request.mode, OperationMode::Idempotent);
        second.reply_ok(id, b"second");
        second
    });

    let client = common::communicator(common::config().retry_intervals([0]));
    let proxy = client.proxy(Identity::new("foo"), vec![endpoint]);
    let result = proxy.invoke("op", OperationMode::Idempotent, &[]).unwrap();
    assert_eq!(result, b"second");
    let _peer = server.join().unwrap();
}

#[test]
fn graceful_close_by_peer_is_retried() {
    let (listener, endpoint) = listener();
    let server = thread::spawn(move || {
        let mut first = RawPeer::accept(&listener);
        first.read_request();
        first.send(&protocol::header_only(MessageType::CloseConnection));

        let mut second = RawPeer::accept(&listener);
        let (id, _) = second.read_request();
        second.reply_ok(id, &[]);
        (first, second)
    });

    let client = common::communicator(common::config().retry_intervals([0]));
    let proxy = client.proxy(Identity::new("foo"), vec![endpoint]);
    proxy.invoke("op", OperationMode::Normal, &[]).unwrap();
    let _peers = server.join().unwrap();
}

#[test]
fn retries_stop_after_the_configured_intervals() {
    let (listener, endpoint) = listener();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    thread::spawn(move || {
        // Accept and immediately hang up, failing validation
        for stream in listener.incoming() {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });

    let client = common::communicator(common::config().retry_intervals([0, 50, 50]));
    let proxy = client.proxy(Identity::new("foo"), vec![endpoint]);
    let started = Instant::now();
    let err = proxy.invoke("op", OperationMode::Normal, &[]).unwrap_err();
    assert!(!err.is_non_repeatable());
    assert!(err.is_transient(), "unexpected error: {err}");
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[test]
fn leading_minus_one_disables_retries() {
    let (listener, endpoint) = listener();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    thread::spawn(move || {
        for stream in listener.incoming() {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });

    let client = common::communicator(common::config().retry_intervals([-1]));
    let proxy = client.proxy(Identity::new("foo"), vec![endpoint]);
    assert!(proxy.invoke("op", OperationMode::Idempotent, &[]).is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[test]
fn refused_endpoint_surfaces_after_retries() {
    let client = common::communicator(common::config().retry_intervals([0, 0]));
    let proxy = client.proxy(
        Identity::new("foo"),
        vec![Endpoint::tcp("127.0.0.1", common::closed_port())],
    );
    assert!(matches!(
        proxy.invoke("op", OperationMode::Normal, &[]),
        Err(Error::ConnectionRefused(_))
    ));

    let (tx, rx) = mpsc::channel();
    proxy.invoke_async("op", OperationMode::Normal, &[], move |result| {
        let _ = tx.send(result);
    });
    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        Err(Error::ConnectionRefused(_))
    ));
}

#[test]
fn unanswered_request_times_out() {
    let (listener, endpoint) = listener();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let server = thread::spawn(move || {
        let _peer = RawPeer::accept(&listener);
        let _ = done_rx.recv();
    });

    let client = common::communicator(common::config().timeouts_before_close(2));
    let proxy = client
        .proxy(Identity::new("foo"), vec![endpoint])
        .with_timeout(Some(Duration::from_millis(200)));
    let connection = proxy.connection().unwrap().unwrap();

    let err = proxy.invoke("op", OperationMode::Idempotent, &[]).unwrap_err();
    assert!(err.is_non_repeatable());
    assert!(matches!(err.cause(), Error::Timeout));
    assert_eq!(connection.pending_requests(), 0);
    assert!(connection.is_active_or_holding());

    // The second consecutive timeout gives up on the connection
    let (tx, rx) = mpsc::channel();
    proxy.invoke_async("op", OperationMode::Normal, &[], move |result| {
        let _ = tx.send(result);
    });
    let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
    assert!(matches!(err.cause(), Error::Timeout));
    assert!(common::eventually(WAIT, || connection.state() == State::Closed));
    assert!(matches!(connection.failure(), Some(Error::ConnectionTimeout)));

    done_tx.send(()).unwrap();
    server.join().unwrap();
}

#[test]
fn idle_connections_are_closed() {
    let server = common::communicator(common::config());
    let adapter = common::adapter(&server, "hello");
    let (_, servant) = recorder();
    adapter.add(Identity::new("foo"), Arc::new(servant)).unwrap();

    let client = common::communicator(
        common::config()
            .connection_idle_time(Duration::from_millis(200))
            .monitor_interval(Duration::from_millis(50)),
    );
    let proxy = client.proxy(Identity::new("foo"), adapter.endpoints());
    proxy.invoke("op", OperationMode::Normal, &[]).unwrap();
    let connection = proxy.connection().unwrap().unwrap();

    assert!(common::eventually(WAIT, || connection.is_finished()));
    assert!(matches!(connection.failure(), Some(Error::ConnectionTimeout)));

    // The next call opens a fresh connection
    proxy.invoke("op", OperationMode::Normal, &[]).unwrap();
    let fresh = proxy.connection().unwrap().unwrap();
    assert!(!Arc::ptr_eq(&connection, &fresh));
}

#[test]
fn silent_connections_send_heartbeats() {
    let (listener, endpoint) = listener();
    let server = thread::spawn(move || {
        let mut peer = RawPeer::accept(&listener);
        let (header, _) = peer.read_frame();
        header.message_type
    });

    let client = common::communicator(
        common::config()
            .connection_heartbeat(Duration::from_millis(100))
            .monitor_interval(Duration::from_millis(20)),
    );
    let proxy = client.proxy(Identity::new("foo"), vec![endpoint]);
    proxy.connection().unwrap().unwrap();
    assert_eq!(server.join().unwrap(), MessageType::ValidateConnection);
}

#[test]
fn batch_is_sent_as_one_frame_in_order() {
    let (listener, endpoint) = listener();
    let server = thread::spawn(move || {
        let mut peer = RawPeer::accept(&listener);
        let (header, mut is) = peer.read_frame();
        assert_eq!(header.message_type, MessageType::RequestBatch);
        let count = is.read_i32().unwrap();
        let mut operations = Vec::new();
        for _ in 0..count {
            let request = RequestHeader::read(&mut is).unwrap();
            is.read_encaps().unwrap();
            operations.push(request.operation);
        }
        assert_eq!(is.remaining(), 0);
        operations
    });

    let client = common::communicator(common::config());
    let proxy = client
        .proxy(Identity::new("foo"), vec![endpoint])
        .batch_oneway();
    for operation in ["first", "second", "third"] {
        let result = proxy.invoke(operation, OperationMode::Normal, &[]).unwrap();
        assert!(result.is_empty());
    }
    let connection = proxy.connection().unwrap().unwrap();
    assert_eq!(connection.batch_request_count(), 3);

    proxy.flush_batch_requests().unwrap();
    assert_eq!(connection.batch_request_count(), 0);
    assert_eq!(server.join().unwrap(), vec!["first", "second", "third"]);
}

#[test]
fn oversized_batch_is_flushed_automatically() {
    let (listener, endpoint) = listener();
    let server = thread::spawn(move || {
        let mut peer = RawPeer::accept(&listener);
        let mut frames = Vec::new();
        let mut operations = Vec::new();
        while operations.len() < 5 {
            let (header, mut is) = peer.read_frame();
            assert_eq!(header.message_type, MessageType::RequestBatch);
            let count = is.read_i32().unwrap();
            frames.push(count);
            for _ in 0..count {
                operations.push(RequestHeader::read(&mut is).unwrap().operation);
                is.read_encaps().unwrap();
            }
        }
        (frames, operations)
    });

    let client = common::communicator(common::config().message_size_max(256));
    let proxy = client
        .proxy(Identity::new("foo"), vec![endpoint])
        .batch_oneway();
    for operation in ["a", "b", "c", "d", "e"] {
        proxy
            .invoke(operation, OperationMode::Normal, &[0u8; 80])
            .unwrap();
    }
    proxy.flush_batch_requests().unwrap();

    let (frames, operations) = server.join().unwrap();
    assert!(frames.len() > 1, "batch was not split: {frames:?}");
    assert_eq!(frames.iter().sum::<i32>(), 5);
    assert_eq!(operations, vec!["a", "b", "c", "d", "e"]);
}

#[test]
fn communicator_flush_dispatches_batches_in_order() {
    let server = common::communicator(common::config());
    let adapter = common::adapter(&server, "hello");
    let (seen, servant) = recorder();
    adapter.add(Identity::new("foo"), Arc::new(servant)).unwrap();

    let client = common::communicator(common::config());
    let proxy = client
        .proxy(Identity::new("foo"), adapter.endpoints())
        .batch_oneway();
    for n in 0..10 {
        proxy
            .invoke(&format!("op{n}"), OperationMode::Normal, &[])
            .unwrap();
    }
    assert!(seen.lock().is_empty());
    client.flush_batch_requests();

    let expected: Vec<String> = (0..10).map(|n| format!("op{n}")).collect();
    assert!(common::eventually(WAIT, || seen.lock().len() == 10));
    assert_eq!(*seen.lock(), expected);
}

#[test]
fn datagram_invocations() {
    let server = common::communicator(common::config());
    let adapter = server
        .create_object_adapter("udp", &[Endpoint::udp("127.0.0.1", 0)])
        .unwrap();
    adapter.activate().unwrap();
    let (seen, servant) = recorder();
    adapter.add(Identity::new("foo"), Arc::new(servant)).unwrap();

    let client = common::communicator(common::config());
    let proxy = client.proxy(Identity::new("foo"), adapter.endpoints());

    // Twoway requests need a stream endpoint
    assert!(matches!(
        proxy.invoke("op", OperationMode::Normal, &[]),
        Err(Error::NoEndpoint(_))
    ));

    let datagram = proxy.datagram();
    assert!(common::eventually(WAIT, || {
        datagram.invoke("tick", OperationMode::Normal, &[]).unwrap();
        !seen.lock().is_empty()
    }));
    assert_eq!(seen.lock()[0], "tick");
    assert!(datagram.connection().unwrap().unwrap().datagram());
}

#[test]
fn deactivated_adapter_fails_new_requests() {
    let server = common::communicator(common::config());
    let adapter = common::adapter(&server, "hello");
    let (_, servant) = recorder();
    adapter.add(Identity::new("foo"), Arc::new(servant)).unwrap();

    let client = common::communicator(common::config().retry_intervals([-1]));
    let proxy = client.proxy(Identity::new("foo"), adapter.endpoints());
    proxy.invoke("op", OperationMode::Normal, &[]).unwrap();
    let connection = proxy.connection().unwrap().unwrap();

    adapter.deactivate();
    adapter.wait_for_deactivate();

    // The server closed gracefully
    assert!(common::eventually(WAIT, || connection.is_finished()));
    assert!(matches!(connection.failure(), Some(Error::CloseConnection)));
    assert!(proxy.invoke("op", OperationMode::Normal, &[]).is_err());
}

#[test]
fn async_batch_request_does_not_wait_for_validation() {
    let (listener, endpoint) = listener();
    let (validate_tx, validate_rx) = mpsc::channel::<()>();
    let server = thread::spawn(move || {
        let mut peer = RawPeer::accept_unvalidated(&listener);
        validate_rx.recv().unwrap();
        peer.validate();
        let (header, mut is) = peer.read_frame();
        assert_eq!(header.message_type, MessageType::RequestBatch);
        assert_eq!(is.read_i32().unwrap(), 1);
        RequestHeader::read(&mut is).unwrap().operation
    });

    let client = common::communicator(common::config());
    let proxy = client
        .proxy(Identity::new("foo"), vec![endpoint])
        .batch_oneway();
    let (tx, rx) = mpsc::channel();
    let started = Instant::now();
    proxy.invoke_async("op", OperationMode::Normal, &[], move |result| {
        let _ = tx.send(result);
    });
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(200), "blocked {elapsed:?}");
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    // The queued request completes once the peer validates
    validate_tx.send(()).unwrap();
    assert!(rx.recv_timeout(WAIT).unwrap().unwrap().is_empty());
    proxy.flush_batch_requests().unwrap();
    assert_eq!(server.join().unwrap(), "op");
}

#[test]
fn async_twoway_requests_queue_until_validated() {
    let (listener, endpoint) = listener();
    let (validate_tx, validate_rx) = mpsc::channel::<()>();
    let server = thread::spawn(move || {
        let mut peer = RawPeer::accept_unvalidated(&listener);
        validate_rx.recv().unwrap();
        peer.validate();
        for _ in 0..2 {
            let (id, request) = peer.read_request();
            peer.reply_ok(id, request.operation.as_bytes());
        }
        peer
    });

    let client = common::communicator(common::config());
    let proxy = client.proxy(Identity::new("foo"), vec![endpoint]);
    let (tx, rx) = mpsc::channel();
    let started = Instant::now();
    proxy.invoke_async("callback", OperationMode::Normal, &[], move |result| {
        let _ = tx.send(result);
    });
    let reply = proxy.invoke_future("future", OperationMode::Normal, &[]);
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(200), "blocked {elapsed:?}");

    validate_tx.send(()).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap(), b"callback");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let reply = runtime
        .block_on(async { tokio::time::timeout(WAIT, reply).await })
        .unwrap()
        .unwrap();
    assert_eq!(reply, b"future");
    server.join().unwrap();
}

#[test]
fn twoway_request_without_reply_target_is_rejected() {
    let (listener, endpoint) = listener();
    let server = thread::spawn(move || {
        let mut peer = RawPeer::accept(&listener);
        let (id, _) = peer.read_request();
        peer.reply_ok(id, &[]);
        id
    });

    let client = common::communicator(common::config());
    let proxy = client.proxy(Identity::new("foo"), vec![endpoint]);
    let connection = proxy.connection().unwrap().unwrap();

    let mut os = BasicStream::new();
    Header::write(MessageType::Request, &mut os);
    os.write_i32(0);
    RequestHeader::write(
        &mut os,
        &Identity::new("foo"),
        "",
        "op",
        OperationMode::Normal,
        &Context::new(),
    );
    os.write_encaps(&[]).unwrap();
    let err = connection.send_request(&mut os, None, true).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "unexpected error: {err}");
    assert_eq!(connection.pending_requests(), 0);

    // Nothing was queued and no request id was used up
    proxy.invoke("op", OperationMode::Normal, &[]).unwrap();
    assert_eq!(server.join().unwrap(), 1);
}
