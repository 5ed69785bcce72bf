use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::codec::{CborCodec, Codec, JsonCodec};
use crate::config::EndpointConfig;
use crate::endpoint::{CallOptions, Endpoint, EndpointBuilder, EndpointStats};
use crate::err::*;
use crate::protocol::*;
use crate::registry::*;
use crate::stopper::{EndpointStopper, Stopper};
use crate::transport::memory::{MemoryAddr, MemoryNetwork, MemoryTransport};
use crate::transport::udp;

const SERVER: &str = "server";
const CLIENT: &str = "client";
const RAW: &str = "raw";

const SLOW_OP_STEPS: u32 = 100;
const SLOW_OP_STEP: Duration = Duration::from_millis(10);

fn slow_op(inv: Invocation, events: &UnboundedSender<String>) -> HandlerResult {
    for _ in 0..SLOW_OP_STEPS {
        if inv.is_cancelled() {
            let _ = events.send(format!("{} cancelled", inv.method));
            return Err(HandlerError::new("Cancelled", inv.method));
        }
        std::thread::sleep(SLOW_OP_STEP);
    }
    Ok(Value::from("done"))
}

async fn boom(_: Invocation) -> HandlerResult {
    Err(HandlerError::new("ValueError", "x"))
}

async fn sleep(inv: Invocation) -> HandlerResult {
    let millis: u64 = inv.arg(0)?;
    tokio::time::sleep(Duration::from_millis(millis)).await;
    Ok(Value::from(millis))
}

fn registry(events: UnboundedSender<String>) -> Registry {
    let mut registry = Registry::new();
    registry
        .register_blocking("math.add", |inv| {
            Ok(Value::from(inv.arg::<i64>(0)? + inv.arg::<i64>(1)?))
        })
        .unwrap();
    registry.register_async("boom", boom).unwrap();
    registry.register_async("sleep", sleep).unwrap();
    registry
        .register_blocking("panic", |_| panic!("kaboom"))
        .unwrap();
    registry
        .register_blocking("slow.op", move |inv| slow_op(inv, &events))
        .unwrap();
    registry
        .register_blocking("kwargs.echo", |inv| Ok(Value::Object(inv.kwargs)))
        .unwrap();
    registry
        .register(
            "kwargs.echo_timeout",
            Handler::new_blocking(|inv| Ok(Value::Object(inv.kwargs))).accepting_timeout(),
        )
        .unwrap();
    registry
}

fn config() -> EndpointConfig {
    EndpointConfig {
        exit_on_shutdown: false,
        ..EndpointConfig::default()
    }
}

struct Fixture {
    network: MemoryNetwork,
    server: Endpoint<MemoryAddr>,
    server_stopper: EndpointStopper<MemoryAddr>,
    client: Endpoint<MemoryAddr>,
    events: UnboundedReceiver<String>,
}

fn setup_with(server_config: EndpointConfig) -> Fixture {
    let network = MemoryNetwork::new();
    let (event_sender, events) = unbounded_channel();

    let (server, server_stopper) = EndpointBuilder::new()
        .config(server_config)
        .resolver(registry(event_sender))
        .start(network.bind(SERVER).unwrap())
        .unwrap();

    let (client, _) = EndpointBuilder::new()
        .config(config())
        .start(network.bind(CLIENT).unwrap())
        .unwrap();

    Fixture {
        network,
        server,
        server_stopper,
        client,
        events,
    }
}

fn setup() -> Fixture {
    setup_with(config())
}

fn kwargs(value: Value) -> Kwargs {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {}", other),
    }
}

async fn recv_frame(raw: &mut MemoryTransport) -> (MemoryAddr, Frame) {
    let (from, datagram) = tokio::time::timeout(Duration::from_secs(2), raw.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    (from, Frame::decode(datagram).unwrap())
}

async fn recv_request(raw: &mut MemoryTransport) -> (CorrelationId, RequestPayload) {
    match recv_frame(raw).await {
        (_, Frame::Request { id, payload }) => (id, CborCodec.decode(&payload).unwrap()),
        (_, other) => panic!("expected REQUEST, got {:?}", other),
    }
}

async fn expect_silence(raw: &mut MemoryTransport, wait: Duration) {
    if let Ok(received) = tokio::time::timeout(wait, raw.next()).await {
        panic!("expected silence, got {:?}", received);
    }
}

async fn send_frame(raw: &mut MemoryTransport, frame: Frame, to: &str) {
    raw.send((frame.encode(), to.to_string())).await.unwrap();
}

async fn send_response(raw: &mut MemoryTransport, id: CorrelationId, response: ResponsePayload, to: &str) {
    let payload = Bytes::from(CborCodec.encode(&response).unwrap());
    send_frame(raw, Frame::Response { id, payload }, to).await;
}

async fn wait_for_stats(
    endpoint: &Endpoint<MemoryAddr>,
    predicate: impl Fn(&EndpointStats) -> bool,
) -> EndpointStats {
    for _ in 0..200 {
        let stats = endpoint.stats().await.unwrap();
        if predicate(&stats) {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("endpoint stats never reached the expected state");
}

#[tokio::test]
async fn test_call() {
    let f = setup();

    let result = tokio::time::timeout(
        Duration::from_secs(1),
        f.client.call(
            SERVER.into(),
            "math.add",
            vec![2.into(), 3.into()],
            Kwargs::new(),
            Duration::from_secs(1),
        ),
    )
    .await
    .unwrap();

    assert_eq!(Ok(Value::from(5)), result);
    assert_eq!(EndpointStats::default(), f.client.stats().await.unwrap());

    f.server_stopper.stop().await.unwrap();
}

#[tokio::test]
async fn test_call_as() {
    let f = setup();

    let sum: i64 = f
        .client
        .call_as(
            SERVER.into(),
            "math.add",
            vec![40.into(), 2.into()],
            Kwargs::new(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert_eq!(42, sum);

    let result = f
        .client
        .call_as::<String>(
            SERVER.into(),
            "math.add",
            vec![40.into(), 2.into()],
            Kwargs::new(),
            Duration::from_secs(1),
        )
        .await;
    assert!(matches!(result, Err(RpcError::MalformedPayload(_))));
}

#[tokio::test]
async fn test_timeout_sends_cancel() {
    let f = setup();
    let mut raw = f.network.bind(RAW).unwrap();

    let client = f.client.clone();
    let started = Instant::now();
    let call = tokio::spawn(async move {
        client
            .call(RAW.into(), "slow.op", vec![], Kwargs::new(), Duration::from_millis(100))
            .await
    });

    let (id, request) = recv_request(&mut raw).await;
    assert_eq!("slow.op", request.method);
    assert_eq!(Some(&Value::from(0.1)), request.kwargs.get(TIMEOUT_KWARG));

    assert_eq!(Err(RpcError::Timeout), call.await.unwrap());
    assert!(started.elapsed() >= Duration::from_millis(100));

    let (from, frame) = recv_frame(&mut raw).await;
    assert_eq!(CLIENT, from);
    assert_eq!(Frame::Cancel { id }, frame);

    assert_eq!(0, f.client.stats().await.unwrap().pending_calls);
}

#[tokio::test]
async fn test_timeout_cancels_remote_handler() {
    let mut f = setup();

    let result = f
        .client
        .call(SERVER.into(), "slow.op", vec![], Kwargs::new(), Duration::from_millis(100))
        .await;
    assert_eq!(Err(RpcError::Timeout), result);

    let event = tokio::time::timeout(Duration::from_secs(1), f.events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!("slow.op cancelled", event);

    wait_for_stats(&f.server, |s| s.in_flight_tasks == 0).await;
}

#[tokio::test]
async fn test_timeout_without_remote_cancel() {
    let f = setup();
    let mut raw = f.network.bind(RAW).unwrap();

    let client = f.client.clone();
    let call = tokio::spawn(async move {
        client
            .call(
                RAW.into(),
                "slow.op",
                vec![],
                Kwargs::new(),
                CallOptions::new(Duration::from_millis(50)).cancel_remote(false),
            )
            .await
    });

    recv_request(&mut raw).await;
    assert_eq!(Err(RpcError::Timeout), call.await.unwrap());
    expect_silence(&mut raw, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_remote_error() {
    let f = setup();

    let result = f
        .client
        .call(SERVER.into(), "boom", vec![], Kwargs::new(), Duration::from_secs(1))
        .await;

    match result {
        Err(RpcError::Remote(error)) => {
            assert_eq!("ValueError", error.kind());
            assert_eq!("x", error.message());
        }
        other => panic!("expected a remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_handler_not_found() {
    let f = setup();

    let result = f
        .client
        .call(SERVER.into(), "math.div", vec![], Kwargs::new(), Duration::from_secs(1))
        .await;

    assert_eq!(
        Err(RpcError::Remote(RemoteError::HandlerNotFound("math.div".into()))),
        result
    );
    assert!(f.client.ping(SERVER.into(), Duration::from_secs(1)).await.unwrap());
}

#[tokio::test]
async fn test_handler_panic_is_reported() {
    let f = setup();

    let result = f
        .client
        .call(SERVER.into(), "panic", vec![], Kwargs::new(), Duration::from_secs(1))
        .await;
    assert_eq!(
        Err(RpcError::Remote(RemoteError::Panic("kaboom".into()))),
        result
    );

    // the server survives
    let result = f
        .client
        .call(
            SERVER.into(),
            "math.add",
            vec![1.into(), 1.into()],
            Kwargs::new(),
            Duration::from_secs(1),
        )
        .await;
    assert_eq!(Ok(Value::from(2)), result);
}

#[tokio::test]
async fn test_handler_argument_error() {
    let f = setup();

    let result = f
        .client
        .call(
            SERVER.into(),
            "math.add",
            vec!["two".into()],
            Kwargs::new(),
            Duration::from_secs(1),
        )
        .await;

    match result {
        Err(RpcError::Remote(error)) => assert_eq!("TypeError", error.kind()),
        other => panic!("expected a remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_invalid_method_name() {
    let f = setup();

    let result = f
        .client
        .call(SERVER.into(), "math..add", vec![], Kwargs::new(), Duration::from_secs(1))
        .await;
    assert_eq!(Err(RpcError::InvalidMethodName("math..add".into())), result);
}

#[tokio::test]
async fn test_bad_request() {
    let f = setup();
    let mut raw = f.network.bind(RAW).unwrap();

    let id = CorrelationId::random();
    send_frame(
        &mut raw,
        Frame::Request {
            id,
            payload: Bytes::from_static(&[0xff, 0xff]),
        },
        SERVER,
    )
    .await;

    match recv_frame(&mut raw).await {
        (from, Frame::Response { id: response_id, payload }) => {
            assert_eq!(SERVER, from);
            assert_eq!(id, response_id);
            let response: ResponsePayload = CborCodec.decode(&payload).unwrap();
            assert!(matches!(response, Err(RemoteError::BadRequest(_))));
        }
        (_, other) => panic!("expected RESPONSE, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ping() {
    let f = setup();

    assert!(f.client.ping(SERVER.into(), Duration::from_secs(1)).await.unwrap());
    assert!(f.server.ping(CLIENT.into(), Duration::from_secs(1)).await.unwrap());

    let started = Instant::now();
    assert!(!f.client.ping("nobody".into(), Duration::from_millis(100)).await.unwrap());
    assert!(started.elapsed() >= Duration::from_millis(100));

    assert_eq!(0, f.client.stats().await.unwrap().pending_pings);
}

#[tokio::test]
async fn test_concurrent_pings_share_probe() {
    let f = setup();
    let mut raw = f.network.bind(RAW).unwrap();

    let pings = (0..2)
        .map(|_| {
            let client = f.client.clone();
            tokio::spawn(async move { client.ping(RAW.into(), Duration::from_secs(1)).await })
        })
        .collect::<Vec<_>>();

    assert_eq!((CLIENT.to_string(), Frame::Ping), recv_frame(&mut raw).await);
    expect_silence(&mut raw, Duration::from_millis(50)).await;
    assert_eq!(1, f.client.stats().await.unwrap().pending_pings);

    send_frame(&mut raw, Frame::Pong, CLIENT).await;

    for ping in pings {
        assert_eq!(Ok(true), ping.await.unwrap());
    }
}

#[tokio::test]
async fn test_raw_peer_gets_pong() {
    let f = setup();
    let mut raw = f.network.bind(RAW).unwrap();

    send_frame(&mut raw, Frame::Ping, SERVER).await;
    assert_eq!((SERVER.to_string(), Frame::Pong), recv_frame(&mut raw).await);

    // nobody asked
    send_frame(&mut raw, Frame::Pong, SERVER).await;
    assert!(f.client.ping(SERVER.into(), Duration::from_secs(1)).await.unwrap());
}

#[tokio::test]
async fn test_close_resolves_pending() {
    let f = setup();
    let _raw = f.network.bind(RAW).unwrap();

    let calls = (0..5)
        .map(|i| {
            let client = f.client.clone();
            tokio::spawn(async move {
                client
                    .call(
                        RAW.into(),
                        "math.add",
                        vec![i.into(), 1.into()],
                        Kwargs::new(),
                        CallOptions::wait_forever(),
                    )
                    .await
            })
        })
        .collect::<Vec<_>>();
    let ping = {
        let client = f.client.clone();
        tokio::spawn(async move { client.ping(RAW.into(), Duration::ZERO).await })
    };

    wait_for_stats(&f.client, |s| s.pending_calls == 5 && s.pending_pings == 1).await;

    f.client.close().await.unwrap();

    for call in calls {
        assert_eq!(Err(RpcError::EndpointClosed), call.await.unwrap());
    }
    assert_eq!(Err(RpcError::EndpointClosed), ping.await.unwrap());

    // idempotent
    f.client.close().await.unwrap();
    assert!(f.client.is_closed());
    assert_eq!(Err(RpcError::EndpointClosed), f.client.stats().await);
    assert_eq!(
        Err(RpcError::EndpointClosed),
        f.client
            .call(SERVER.into(), "math.add", vec![], Kwargs::new(), Duration::from_secs(1))
            .await
    );
}

#[tokio::test]
async fn test_abandoned_call_is_pruned() {
    let f = setup();
    let mut raw = f.network.bind(RAW).unwrap();

    let client = f.client.clone();
    let call = tokio::spawn(async move {
        client
            .call(RAW.into(), "slow.op", vec![], Kwargs::new(), CallOptions::wait_forever())
            .await
    });
    let (id, _) = recv_request(&mut raw).await;

    let client = f.client.clone();
    let ping = tokio::spawn(async move { client.ping(RAW.into(), Duration::ZERO).await });
    assert_eq!(Frame::Ping, recv_frame(&mut raw).await.1);
    assert_eq!(
        EndpointStats { pending_calls: 1, pending_pings: 1, in_flight_tasks: 0 },
        f.client.stats().await.unwrap()
    );

    // the callers give up without a timeout ever firing
    call.abort();
    ping.abort();
    assert!(call.await.unwrap_err().is_cancelled());
    assert!(ping.await.unwrap_err().is_cancelled());

    assert_eq!(EndpointStats::default(), f.client.stats().await.unwrap());
    let (from, frame) = recv_frame(&mut raw).await;
    assert_eq!(CLIENT, from);
    assert_eq!(Frame::Cancel { id }, frame);
}

#[tokio::test]
async fn test_close_cancels_running_tasks() {
    let mut f = setup();

    let client = f.client.clone();
    let call = tokio::spawn(async move {
        client
            .call(SERVER.into(), "slow.op", vec![], Kwargs::new(), CallOptions::wait_forever())
            .await
    });

    wait_for_stats(&f.server, |s| s.in_flight_tasks == 1).await;
    assert_eq!(1, f.client.stats().await.unwrap().pending_calls);

    f.server_stopper.stop().await.unwrap();
    assert!(f.server.is_closed());

    let event = tokio::time::timeout(Duration::from_secs(1), f.events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!("slow.op cancelled", event);

    // a cancelled task never answers, so only closing the client ends the call
    f.client.close().await.unwrap();
    assert_eq!(Err(RpcError::EndpointClosed), call.await.unwrap());
}

#[tokio::test]
async fn test_unknown_tag_is_dropped() {
    let f = setup();
    let mut raw = f.network.bind(RAW).unwrap();

    let client = f.client.clone();
    let call = tokio::spawn(async move {
        client
            .call(RAW.into(), "answer", vec![], Kwargs::new(), Duration::from_secs(1))
            .await
    });
    let (id, _) = recv_request(&mut raw).await;

    raw.send((Bytes::from_static(&[0x7f, 1, 2, 3]), CLIENT.to_string()))
        .await
        .unwrap();
    raw.send((Bytes::from_static(&[0x02, 1, 2]), CLIENT.to_string()))
        .await
        .unwrap();
    raw.send((Bytes::new(), CLIENT.to_string())).await.unwrap();
    assert_eq!(1, f.client.stats().await.unwrap().pending_calls);

    send_response(&mut raw, id, Ok(Value::from(42)), CLIENT).await;
    assert_eq!(Ok(Value::from(42)), call.await.unwrap());
}

#[tokio::test]
async fn test_unknown_cancel_is_noop() {
    let f = setup();
    let mut raw = f.network.bind(RAW).unwrap();

    send_frame(
        &mut raw,
        Frame::Cancel {
            id: CorrelationId::random(),
        },
        SERVER,
    )
    .await;

    let result = f
        .client
        .call(
            SERVER.into(),
            "math.add",
            vec![2.into(), 3.into()],
            Kwargs::new(),
            Duration::from_secs(1),
        )
        .await;
    assert_eq!(Ok(Value::from(5)), result);
    assert_eq!(0, f.server.stats().await.unwrap().in_flight_tasks);
}

#[tokio::test]
async fn test_cancelled_task_sends_no_response() {
    let f = setup();
    let mut raw = f.network.bind(RAW).unwrap();

    let request = RequestPayload {
        method: "sleep".into(),
        args: vec![200.into()],
        kwargs: Kwargs::new(),
    };
    let payload = Bytes::from(CborCodec.encode(&request).unwrap());

    // answered when left alone
    let id = CorrelationId::random();
    send_frame(&mut raw, Frame::Request { id, payload: payload.clone() }, SERVER).await;
    match recv_frame(&mut raw).await {
        (_, Frame::Response { id: response_id, .. }) => assert_eq!(id, response_id),
        (_, other) => panic!("expected RESPONSE, got {:?}", other),
    }

    // silent when cancelled
    let id = CorrelationId::random();
    send_frame(&mut raw, Frame::Request { id, payload }, SERVER).await;
    wait_for_stats(&f.server, |s| s.in_flight_tasks == 1).await;
    send_frame(&mut raw, Frame::Cancel { id }, SERVER).await;

    expect_silence(&mut raw, Duration::from_millis(400)).await;
    assert_eq!(0, f.server.stats().await.unwrap().in_flight_tasks);
}

#[tokio::test]
async fn test_cancel_from_other_peer_is_ignored() {
    let f = setup();
    let mut raw = f.network.bind(RAW).unwrap();
    let mut stranger = f.network.bind("stranger").unwrap();

    let request = RequestPayload {
        method: "sleep".into(),
        args: vec![50.into()],
        kwargs: Kwargs::new(),
    };
    let id = CorrelationId::random();
    let payload = Bytes::from(CborCodec.encode(&request).unwrap());
    send_frame(&mut raw, Frame::Request { id, payload }, SERVER).await;
    send_frame(&mut stranger, Frame::Cancel { id }, SERVER).await;

    match recv_frame(&mut raw).await {
        (_, Frame::Response { id: response_id, payload }) => {
            assert_eq!(id, response_id);
            let response: ResponsePayload = CborCodec.decode(&payload).unwrap();
            assert_eq!(Ok(Value::from(50)), response);
        }
        (_, other) => panic!("expected RESPONSE, got {:?}", other),
    }
}

#[tokio::test]
async fn test_duplicate_request_is_served_once() {
    let f = setup();
    let mut raw = f.network.bind(RAW).unwrap();

    let request = RequestPayload {
        method: "sleep".into(),
        args: vec![50.into()],
        kwargs: Kwargs::new(),
    };
    let id = CorrelationId::random();
    let payload = Bytes::from(CborCodec.encode(&request).unwrap());
    send_frame(&mut raw, Frame::Request { id, payload: payload.clone() }, SERVER).await;
    send_frame(&mut raw, Frame::Request { id, payload }, SERVER).await;

    assert!(matches!(recv_frame(&mut raw).await, (_, Frame::Response { .. })));
    expect_silence(&mut raw, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_response_and_timeout_race() {
    let f = setup();
    let mut raw = f.network.bind(RAW).unwrap();

    for delay in [0u64, 20, 45, 50, 55, 80] {
        let client = f.client.clone();
        let call = tokio::spawn(async move {
            client
                .call(
                    RAW.into(),
                    "answer",
                    vec![],
                    Kwargs::new(),
                    CallOptions::new(Duration::from_millis(50)).cancel_remote(false),
                )
                .await
        });
        let (id, _) = recv_request(&mut raw).await;

        tokio::time::sleep(Duration::from_millis(delay)).await;
        send_response(&mut raw, id, Ok(Value::from(42)), CLIENT).await;

        match call.await.unwrap() {
            Ok(value) => assert_eq!(Value::from(42), value),
            Err(e) => assert_eq!(RpcError::Timeout, e),
        }

        // a duplicate or late response finds nothing pending
        send_response(&mut raw, id, Ok(Value::from(43)), CLIENT).await;
    }

    assert_eq!(EndpointStats::default(), f.client.stats().await.unwrap());
    assert!(f.client.ping(SERVER.into(), Duration::from_secs(1)).await.unwrap());
}

#[tokio::test]
async fn test_answered_call_never_times_out() {
    let f = setup();
    let mut raw = f.network.bind(RAW).unwrap();

    let client = f.client.clone();
    let call = tokio::spawn(async move {
        client
            .call(RAW.into(), "answer", vec![], Kwargs::new(), Duration::from_millis(100))
            .await
    });
    let (id, _) = recv_request(&mut raw).await;
    send_response(&mut raw, id, Ok(Value::from(1)), CLIENT).await;
    assert_eq!(Ok(Value::from(1)), call.await.unwrap());

    // no CANCEL once the timer would have fired
    expect_silence(&mut raw, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_malformed_response() {
    let f = setup();
    let mut raw = f.network.bind(RAW).unwrap();

    let client = f.client.clone();
    let call = tokio::spawn(async move {
        client
            .call(RAW.into(), "answer", vec![], Kwargs::new(), Duration::from_secs(1))
            .await
    });
    let (id, _) = recv_request(&mut raw).await;
    send_frame(
        &mut raw,
        Frame::Response {
            id,
            payload: Bytes::from_static(&[0xff]),
        },
        CLIENT,
    )
    .await;
    assert!(matches!(
        call.await.unwrap(),
        Err(RpcError::MalformedPayload(_))
    ));
}

#[tokio::test]
async fn test_blocking_handler_does_not_stall_loop() {
    let f = setup();

    let client = f.client.clone();
    let slow = tokio::spawn(async move {
        client
            .call(SERVER.into(), "slow.op", vec![], Kwargs::new(), CallOptions::wait_forever())
            .await
    });
    wait_for_stats(&f.server, |s| s.in_flight_tasks == 1).await;

    let started = Instant::now();
    assert!(f.client.ping(SERVER.into(), Duration::from_millis(500)).await.unwrap());
    let result = f
        .client
        .call(
            SERVER.into(),
            "math.add",
            vec![2.into(), 3.into()],
            Kwargs::new(),
            Duration::from_millis(500),
        )
        .await;
    assert_eq!(Ok(Value::from(5)), result);
    assert!(started.elapsed() < Duration::from_millis(500));

    assert_eq!(Ok(Value::from("done")), slow.await.unwrap());
}

#[tokio::test]
async fn test_worker_pool_is_bounded() {
    let f = setup_with(EndpointConfig {
        max_blocking_handlers: 1,
        ..config()
    });

    let client = f.client.clone();
    let slow = tokio::spawn(async move {
        client
            .call(SERVER.into(), "slow.op", vec![], Kwargs::new(), CallOptions::wait_forever())
            .await
    });
    wait_for_stats(&f.server, |s| s.in_flight_tasks == 1).await;

    // queued behind slow.op
    let result = f
        .client
        .call(
            SERVER.into(),
            "math.add",
            vec![2.into(), 3.into()],
            Kwargs::new(),
            Duration::from_millis(200),
        )
        .await;
    assert_eq!(Err(RpcError::Timeout), result);

    // async handlers do not need the pool
    let result = f
        .client
        .call(SERVER.into(), "sleep", vec![1.into()], Kwargs::new(), Duration::from_millis(200))
        .await;
    assert_eq!(Ok(Value::from(1)), result);

    assert_eq!(Ok(Value::from("done")), slow.await.unwrap());
}

#[tokio::test]
async fn test_timeout_kwarg() {
    let f = setup();
    let call = |method: &'static str, kwargs: Kwargs, options: CallOptions| {
        let client = f.client.clone();
        async move { client.call(SERVER.into(), method, vec![], kwargs, options).await }
    };
    let one_second = CallOptions::new(Duration::from_secs(1));

    // stripped unless the handler accepts it
    assert_eq!(
        Ok(json!({ "x": 1 })),
        call("kwargs.echo", kwargs(json!({ "x": 1 })), one_second).await
    );
    assert_eq!(
        Ok(json!({})),
        call("kwargs.echo", kwargs(json!({ "timeout": 5 })), one_second).await
    );

    // forwarded from the call's own deadline
    assert_eq!(
        Ok(json!({ "x": 1, "timeout": 1.0 })),
        call("kwargs.echo_timeout", kwargs(json!({ "x": 1 })), one_second).await
    );

    // the caller's own value wins
    assert_eq!(
        Ok(json!({ "timeout": 5 })),
        call("kwargs.echo_timeout", kwargs(json!({ "timeout": 5 })), one_second).await
    );

    // nothing to forward without a deadline
    assert_eq!(
        Ok(json!({})),
        call("kwargs.echo_timeout", Kwargs::new(), CallOptions::wait_forever()).await
    );
}

#[tokio::test]
async fn test_shutdown() {
    let network = MemoryNetwork::new();
    let admin_config = EndpointConfig {
        admin_token: Some("s3cret".into()),
        ..config()
    };

    let (server, server_stopper) = EndpointBuilder::new()
        .config(admin_config.clone())
        .start(network.bind(SERVER).unwrap())
        .unwrap();
    let (intruder, _) = EndpointBuilder::new()
        .config(EndpointConfig {
            admin_token: Some("guess".into()),
            ..config()
        })
        .start(network.bind("intruder").unwrap())
        .unwrap();
    let (admin, _) = EndpointBuilder::new()
        .config(admin_config)
        .start(network.bind("admin").unwrap())
        .unwrap();

    intruder.shutdown(SERVER.into()).await.unwrap();
    assert!(admin.ping(SERVER.into(), Duration::from_secs(1)).await.unwrap());
    assert!(!server.is_closed());

    admin.shutdown(SERVER.into()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), server_stopper.join())
        .await
        .unwrap()
        .unwrap();
    assert!(server.is_closed());

    assert!(!admin.ping(SERVER.into(), Duration::from_millis(100)).await.unwrap());
}

#[tokio::test]
async fn test_shutdown_with_authorizer() {
    let network = MemoryNetwork::new();

    let (_server, server_stopper) = EndpointBuilder::new()
        .config(config())
        .authorizer(|peer: &MemoryAddr, _: &[u8]| peer.as_str() == "admin")
        .start(network.bind(SERVER).unwrap())
        .unwrap();
    let (client, _) = EndpointBuilder::new()
        .config(config())
        .start(network.bind(CLIENT).unwrap())
        .unwrap();
    let (admin, _) = EndpointBuilder::new()
        .config(config())
        .start(network.bind("admin").unwrap())
        .unwrap();

    client.shutdown(SERVER.into()).await.unwrap();
    assert!(client.ping(SERVER.into(), Duration::from_secs(1)).await.unwrap());

    admin.shutdown(SERVER.into()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), server_stopper.join())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_lost_response_times_out() {
    let f = setup();
    f.network
        .set_drop_filter(|from, _, datagram| {
            from == SERVER && datagram.first() == Some(&(Tag::Response as u8))
        })
        .unwrap();

    let result = f
        .client
        .call(
            SERVER.into(),
            "math.add",
            vec![2.into(), 3.into()],
            Kwargs::new(),
            Duration::from_millis(100),
        )
        .await;
    assert_eq!(Err(RpcError::Timeout), result);

    f.network.clear_drop_filter().unwrap();
    let result = f
        .client
        .call(
            SERVER.into(),
            "math.add",
            vec![2.into(), 3.into()],
            Kwargs::new(),
            Duration::from_millis(100),
        )
        .await;
    assert_eq!(Ok(Value::from(5)), result);
}

#[tokio::test]
async fn test_json_codec() {
    let network = MemoryNetwork::new();
    let (event_sender, _events) = unbounded_channel();

    let (_server, _server_stopper) = EndpointBuilder::new()
        .config(config())
        .codec(JsonCodec)
        .resolver(registry(event_sender))
        .start(network.bind(SERVER).unwrap())
        .unwrap();
    let (client, _) = EndpointBuilder::new()
        .config(config())
        .codec(JsonCodec)
        .start(network.bind(CLIENT).unwrap())
        .unwrap();

    let result = client
        .call(
            SERVER.into(),
            "math.add",
            vec![2.into(), 3.into()],
            Kwargs::new(),
            Duration::from_secs(1),
        )
        .await;
    assert_eq!(Ok(Value::from(5)), result);

    let result = client
        .call(SERVER.into(), "boom", vec![], Kwargs::new(), Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(RpcError::Remote(RemoteError::Handler { .. }))));
}

#[tokio::test]
async fn test_closure_resolver() {
    let network = MemoryNetwork::new();

    let (_server, _server_stopper) = EndpointBuilder::new()
        .config(config())
        .resolver(|method: &str| match method {
            "hello" => Some(Handler::new_blocking(|_| Ok(Value::from("world")))),
            _ => None,
        })
        .start(network.bind(SERVER).unwrap())
        .unwrap();
    let (client, _) = EndpointBuilder::new()
        .config(config())
        .start(network.bind(CLIENT).unwrap())
        .unwrap();

    let result = client
        .call(SERVER.into(), "hello", vec![], Kwargs::new(), Duration::from_secs(1))
        .await;
    assert_eq!(Ok(Value::from("world")), result);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let network = MemoryNetwork::new();
    let result = EndpointBuilder::new()
        .config(EndpointConfig {
            max_blocking_handlers: 0,
            ..config()
        })
        .start(network.bind(SERVER).unwrap());
    assert!(matches!(result, Err(RpcError::ConfigError(_))));
}

#[tokio::test]
async fn test_udp() {
    let (event_sender, _events) = unbounded_channel();

    let server_transport = udp::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server_transport.local_addr().unwrap();
    let (_server, server_stopper) = EndpointBuilder::new()
        .config(config())
        .resolver(registry(event_sender))
        .start(server_transport)
        .unwrap();

    let (client, client_stopper) = EndpointBuilder::new()
        .config(config())
        .start(udp::bind("127.0.0.1:0").await.unwrap())
        .unwrap();

    let result = client
        .call(
            server_addr,
            "math.add",
            vec![2.into(), 3.into()],
            Kwargs::new(),
            Duration::from_secs(1),
        )
        .await;
    assert_eq!(Ok(Value::from(5)), result);
    assert!(client.ping(server_addr, Duration::from_secs(1)).await.unwrap());

    client_stopper.stop().await.unwrap();
    server_stopper.stop().await.unwrap();
}

#[tokio::test]
async fn test_udp_failed_send_does_not_stall_endpoint() {
    let (event_sender, _events) = unbounded_channel();

    let server_transport = udp::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server_transport.local_addr().unwrap();
    let (_server, server_stopper) = EndpointBuilder::new()
        .config(config())
        .resolver(registry(event_sender))
        .start(server_transport)
        .unwrap();

    let (client, client_stopper) = EndpointBuilder::new()
        .config(config())
        .start(udp::bind("127.0.0.1:0").await.unwrap())
        .unwrap();

    // an IPv4 socket cannot send to an IPv6 address
    let unreachable: std::net::SocketAddr = "[::1]:9".parse().unwrap();
    assert!(client.ping(unreachable, Duration::from_secs(1)).await.is_err());
    let result = client
        .call(unreachable, "math.add", vec![], Kwargs::new(), Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(RpcError::IOError(_))));

    let result = client
        .call(
            server_addr,
            "math.add",
            vec![2.into(), 3.into()],
            Kwargs::new(),
            Duration::from_secs(1),
        )
        .await;
    assert_eq!(Ok(Value::from(5)), result);
    assert!(client.ping(server_addr, Duration::from_secs(1)).await.unwrap());
    assert_eq!(0, client.stats().await.unwrap().pending_calls);

    client_stopper.stop().await.unwrap();
    server_stopper.stop().await.unwrap();
}
