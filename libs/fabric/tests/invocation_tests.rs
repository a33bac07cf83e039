mod common;

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use meridian_core::codec::{BincodeCodec, Codec};
use meridian_core::{Context, Identity, OperationMode};
use meridian_fabric::{Current, DispatchError, DispatchResult, Endpoint, Error, InvocationMode};
use parking_lot::Mutex;

const WAIT: Duration = Duration::from_secs(5);

fn hello(current: &Current, params: &[u8]) -> DispatchResult {
    match current.operation.as_str() {
        "op" => Ok(Vec::new()),
        "echo" => Ok(params.to_vec()),
        "add" => {
            let (a, b): (i32, i32) = BincodeCodec
                .decode(params)
                .map_err(|e| DispatchError::UnknownLocal(e.to_string()))?;
            BincodeCodec
                .encode(&(a + b))
                .map_err(|e| DispatchError::UnknownLocal(e.to_string()))
        }
        "user" => Ok(current.ctx.get("user").cloned().unwrap_or_default().into_bytes()),
        "remote" => Ok(vec![u8::from(current.connection.is_some())]),
        "fail" => Err(DispatchError::User(b"insufficient funds".to_vec())),
        "crash" => panic!("boom"),
        "grow" => Ok(vec![0; 4096]),
        _ => Err(DispatchError::OperationNotExist),
    }
}

#[test]
fn twoway_call_on_foo_succeeds() {
    let server = common::communicator(common::config());
    let adapter = common::adapter(&server, "hello");
    adapter.add(Identity::new("foo"), Arc::new(hello)).unwrap();

    let client = common::communicator(common::config());
    let foo = client.proxy(Identity::new("foo"), adapter.endpoints());
    let result = foo.invoke("op", OperationMode::Normal, &[]).unwrap();
    assert!(result.is_empty());

    assert_eq!(
        foo.invoke("echo", OperationMode::Normal, b"payload").unwrap(),
        b"payload"
    );
    assert_eq!(foo.invoke("remote", OperationMode::Normal, &[]).unwrap(), vec![1]);
    foo.ping().unwrap();
}

#[test]
fn missing_object_reports_its_identity() {
    let server = common::communicator(common::config());
    let adapter = common::adapter(&server, "hello");
    adapter.add(Identity::new("foo"), Arc::new(hello)).unwrap();

    let client = common::communicator(common::config());
    let bar = client.proxy(Identity::new("bar"), adapter.endpoints());
    match bar.invoke("op", OperationMode::Normal, &[]) {
        Err(Error::ObjectNotExist(failed)) => {
            assert_eq!(failed.identity, Identity::new("bar"));
            assert_eq!(failed.operation, "op");
        }
        other => panic!("expected ObjectNotExist, got {other:?}"),
    }

    let facet = client
        .proxy(Identity::new("foo"), adapter.endpoints())
        .with_facet("admin");
    match facet.invoke("op", OperationMode::Normal, &[]) {
        Err(Error::FacetNotExist(failed)) => assert_eq!(failed.facet, "admin"),
        other => panic!("expected FacetNotExist, got {other:?}"),
    }
}

#[test]
fn servant_failures_reach_the_caller() {
    let server = common::communicator(common::config().warn_dispatch(false));
    let adapter = common::adapter(&server, "hello");
    adapter.add(Identity::new("foo"), Arc::new(hello)).unwrap();

    let client = common::communicator(common::config());
    let foo = client.proxy(Identity::new("foo"), adapter.endpoints());

    assert!(matches!(
        foo.invoke("fail", OperationMode::Normal, &[]),
        Err(Error::UserException(bytes)) if bytes == b"insufficient funds"
    ));
    assert!(matches!(
        foo.invoke("frobnicate", OperationMode::Normal, &[]),
        Err(Error::OperationNotExist(failed)) if failed.operation == "frobnicate"
    ));
    assert!(matches!(
        foo.invoke("crash", OperationMode::Normal, &[]),
        Err(Error::Unknown(reason)) if reason.contains("boom")
    ));

    // The connection survives servant failures
    foo.invoke("op", OperationMode::Normal, &[]).unwrap();
    assert_eq!(client.instance().outgoing_connection_factory().connections().len(), 1);
}

#[test]
fn oversized_reply_becomes_unknown_local() {
    let server = common::communicator(common::config().message_size_max(1024).warn_dispatch(false));
    let adapter = common::adapter(&server, "hello");
    adapter.add(Identity::new("foo"), Arc::new(hello)).unwrap();

    let client = common::communicator(common::config());
    let foo = client.proxy(Identity::new("foo"), adapter.endpoints());
    match foo.invoke("grow", OperationMode::Normal, &[]) {
        Err(Error::UnknownLocal(reason)) => assert!(reason.contains("exceeds"), "{reason}"),
        other => panic!("expected an unknown local error, got {other:?}"),
    }
    foo.invoke("op", OperationMode::Normal, &[]).unwrap();
}

#[test]
fn context_travels_with_the_request() {
    let server = common::communicator(common::config());
    let adapter = common::adapter(&server, "hello");
    adapter.add(Identity::new("foo"), Arc::new(hello)).unwrap();

    let client = common::communicator(common::config());
    let mut context = Context::new();
    context.insert("user".into(), "alice".into());
    let foo = client
        .proxy(Identity::new("foo"), adapter.endpoints())
        .with_context(context);
    assert_eq!(foo.invoke("user", OperationMode::Normal, &[]).unwrap(), b"alice");

    let mut other = Context::new();
    other.insert("user".into(), "bob".into());
    let result = foo
        .invoke_with_context("user", OperationMode::Normal, &[], Some(&other))
        .unwrap();
    assert_eq!(result, b"bob");
}

#[test]
fn typed_call() {
    let server = common::communicator(common::config());
    let adapter = common::adapter(&server, "calc");
    adapter.add(Identity::new("calc"), Arc::new(hello)).unwrap();

    let client = common::communicator(common::config());
    let calc = client.proxy(Identity::new("calc"), adapter.endpoints());
    let sum: i32 = calc.call("add", OperationMode::Idempotent, &(40, 2)).unwrap();
    assert_eq!(sum, 42);
}

#[test]
fn oneway_requests_are_dispatched() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = {
        let seen = seen.clone();
        move |current: &Current, params: &[u8]| -> DispatchResult {
            seen.lock().push((current.request_id, params.to_vec()));
            Ok(Vec::new())
        }
    };

    let server = common::communicator(common::config());
    let adapter = common::adapter(&server, "sink");
    adapter.add(Identity::new("sink"), Arc::new(recorder)).unwrap();

    let client = common::communicator(common::config());
    let sink = client
        .proxy(Identity::new("sink"), adapter.endpoints())
        .oneway();
    assert_eq!(sink.reference().mode, InvocationMode::Oneway);
    let result = sink.invoke("log", OperationMode::Normal, b"one").unwrap();
    assert!(result.is_empty());

    assert!(common::eventually(WAIT, || seen.lock().len() == 1));
    assert_eq!(seen.lock()[0], (0, b"one".to_vec()));
}

#[test]
fn async_invocation_runs_callback() {
    let server = common::communicator(common::config());
    let adapter = common::adapter(&server, "hello");
    adapter.add(Identity::new("foo"), Arc::new(hello)).unwrap();

    let client = common::communicator(common::config());
    let foo = client.proxy(Identity::new("foo"), adapter.endpoints());

    let (tx, rx) = mpsc::channel();
    for n in 0u8..5 {
        let tx = tx.clone();
        foo.invoke_async("echo", OperationMode::Normal, &[n], move |result| {
            let _ = tx.send(result);
        });
    }
    let mut replies: Vec<u8> = (0..5)
        .map(|_| rx.recv_timeout(WAIT).unwrap().unwrap()[0])
        .collect();
    replies.sort_unstable();
    assert_eq!(replies, vec![0, 1, 2, 3, 4]);

    let (tx, rx) = mpsc::channel();
    client
        .proxy(Identity::new("bar"), adapter.endpoints())
        .invoke_async("op", OperationMode::Normal, &[], move |result| {
            let _ = tx.send(result);
        });
    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        Err(Error::ObjectNotExist(_))
    ));
}

#[test]
fn invocation_as_future() {
    let server = common::communicator(common::config());
    let adapter = common::adapter(&server, "hello");
    adapter.add(Identity::new("foo"), Arc::new(hello)).unwrap();

    let client = common::communicator(common::config());
    let foo = client.proxy(Identity::new("foo"), adapter.endpoints());
    let reply = foo.invoke_future("echo", OperationMode::Normal, b"later");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let reply = runtime
        .block_on(async { tokio::time::timeout(WAIT, reply).await })
        .unwrap()
        .unwrap();
    assert_eq!(reply, b"later");
}

#[test]
fn collocated_calls_skip_the_transport() {
    let communicator = common::communicator(common::config());
    let adapter = common::adapter(&communicator, "local");
    adapter.add(Identity::new("foo"), Arc::new(hello)).unwrap();

    let foo = adapter.create_proxy(Identity::new("foo")).unwrap();
    assert_eq!(foo.invoke("remote", OperationMode::Normal, &[]).unwrap(), vec![0]);
    assert!(foo.connection().unwrap().is_none());
    assert!(matches!(
        foo.invoke("fail", OperationMode::Normal, &[]),
        Err(Error::UserException(_))
    ));

    let (tx, rx) = mpsc::channel();
    foo.invoke_async("echo", OperationMode::Normal, b"async", move |result| {
        let _ = tx.send(result);
    });
    assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap(), b"async");

    // Indirect proxies find the adapter by name
    let indirect = adapter.create_indirect_proxy(Identity::new("foo")).unwrap();
    assert_eq!(
        indirect.invoke("echo", OperationMode::Normal, b"by name").unwrap(),
        b"by name"
    );

    // Turning collocation off goes through a real connection
    let remote = foo.with_collocation_optimized(false);
    assert_eq!(remote.invoke("remote", OperationMode::Normal, &[]).unwrap(), vec![1]);
    assert!(communicator
        .instance()
        .outgoing_connection_factory()
        .connections()
        .len()
        == 1);

    assert!(matches!(
        foo.batch_oneway().invoke("op", OperationMode::Normal, &[]),
        Err(Error::FeatureNotSupported(_))
    ));
}

#[test]
fn indirect_proxy_without_adapter_has_no_endpoint() {
    let communicator = common::communicator(common::config());
    let proxy = communicator.indirect_proxy(Identity::new("foo"), "nowhere");
    assert!(matches!(
        proxy.invoke("op", OperationMode::Normal, &[]),
        Err(Error::NoEndpoint(_))
    ));

    // Secure references have no usable endpoint either
    let secure = communicator
        .proxy(Identity::new("foo"), vec![Endpoint::tcp("127.0.0.1", 1)])
        .with_secure(true);
    assert!(matches!(
        secure.invoke("op", OperationMode::Normal, &[]),
        Err(Error::NoEndpoint(_))
    ));
}

#[test]
fn adapter_registrations() {
    let communicator = common::communicator(common::config());
    let adapter = common::adapter(&communicator, "registry");
    adapter.add(Identity::new("foo"), Arc::new(hello)).unwrap();
    assert!(matches!(
        adapter.add(Identity::new("foo"), Arc::new(hello)),
        Err(Error::AlreadyRegistered(_))
    ));
    adapter
        .add_facet(Identity::new("foo"), "admin", Arc::new(hello))
        .unwrap();
    assert!(adapter.remove_facet(&Identity::new("foo"), "admin").is_some());
    assert!(adapter.remove(&Identity::new("foo")).is_some());
    assert!(adapter.remove(&Identity::new("foo")).is_none());

    assert!(matches!(
        communicator.create_object_adapter("registry", &[Endpoint::tcp("127.0.0.1", 0)]),
        Err(Error::AlreadyRegistered(_))
    ));
    assert!(communicator.find_object_adapter("registry").is_some());

    adapter.deactivate();
    adapter.wait_for_deactivate();
    assert!(adapter.is_deactivated());
    assert!(communicator.find_object_adapter("registry").is_none());
    assert!(matches!(
        adapter.activate(),
        Err(Error::ObjectAdapterDeactivated(_))
    ));
}

#[test]
fn holding_adapter_delays_dispatch() {
    let server = common::communicator(common::config());
    let adapter = server
        .create_object_adapter("held", &[Endpoint::tcp("127.0.0.1", 0)])
        .unwrap();
    adapter.add(Identity::new("foo"), Arc::new(hello)).unwrap();

    let client = common::communicator(common::config());
    let foo = client.proxy(Identity::new("foo"), adapter.endpoints());
    let (tx, rx) = mpsc::channel();
    foo.invoke_async("echo", OperationMode::Normal, b"held", move |result| {
        let _ = tx.send(result);
    });

    // Nothing is read until the adapter is activated
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    adapter.activate().unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap(), b"held");
}

#[test]
fn destroyed_communicator_rejects_invocations() {
    let server = common::communicator(common::config());
    let adapter = common::adapter(&server, "hello");
    adapter.add(Identity::new("foo"), Arc::new(hello)).unwrap();

    let client = common::communicator(common::config());
    let foo = client.proxy(Identity::new("foo"), adapter.endpoints());
    foo.invoke("op", OperationMode::Normal, &[]).unwrap();
    let connection = foo.connection().unwrap().unwrap();

    client.destroy();
    assert!(client.is_destroyed());
    assert!(connection.is_finished());
    assert!(matches!(
        foo.invoke("op", OperationMode::Normal, &[]),
        Err(Error::CommunicatorDestroyed)
    ));
    assert!(matches!(
        client.create_object_adapter("late", &[]),
        Err(Error::CommunicatorDestroyed)
    ));
}

async fn explode() -> u8 {
    panic!("lost task")
}

#[test]
fn panicking_runtime_task_is_reported_as_local_failure() {
    let client = common::communicator(common::config());
    let instance = client.instance();
    assert_eq!(instance.block_on(async { 7u8 }).unwrap(), 7);

    match instance.block_on(explode()) {
        Err(Error::UnknownLocal(reason)) => assert!(reason.contains("lost task"), "{reason}"),
        other => panic!("expected an unknown local error, got {other:?}"),
    }

    // The runtime keeps serving
    assert_eq!(instance.block_on(async { 8u8 }).unwrap(), 8);
    assert!(!client.is_destroyed());
}
