//! Wire-level behavior, driven by a hand-rolled peer on the far end of the transport.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::Notify;

use wirerpc::Frame;
use wirerpc::Request;
use wirerpc::Response;
use wirerun::CallError;
use wirerun::ChannelTransport;
use wirerun::Client;
use wirerun::ClientConfig;
use wirerun::CloseReason;
use wirerun::ConnectionState;
use wirerun::ServeOptions;
use wirerun::Service;
use wirerun::ServiceRegistry;
use wirerun::StreamTransport;
use wirerun::Transport;
use wirerun::Value;
use wirerun::serve_transport;
use wirerun::transport;

async fn recv_frame(peer: &ChannelTransport) -> Frame {
    let bytes = peer.recv().await.unwrap().expect("frame");
    Frame::decode(&bytes).unwrap()
}

async fn send_frame(peer: &ChannelTransport, frame: Frame) {
    peer.send(&frame.encode().unwrap()).await.unwrap();
}

fn recv_request(frame: Frame) -> Request {
    match frame {
        Frame::Request(req) => req,
        other => panic!("Expected request, got {:?}", other),
    }
}

// ============================================================================
//  CLIENT SIDE
// ============================================================================

#[tokio::test]
async fn test_ids_start_at_one_and_increase() {
    let (client_side, peer) = ChannelTransport::pair();
    let client = Client::over(client_side, &ClientConfig::default());

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.call("Service", "a", vec![]).await }
    });
    let req = recv_request(recv_frame(&peer).await);
    assert_eq!(req.id, 1);
    assert_eq!((req.service.as_str(), req.method.as_str()), ("Service", "a"));
    send_frame(&peer, Response::ok(1, "one").into()).await;
    assert_eq!(first.await.unwrap(), Ok(Value::from("one")));

    let second = tokio::spawn({
        let client = client.clone();
        async move { client.call("Service", "b", vec![Value::Int(5)]).await }
    });
    let req = recv_request(recv_frame(&peer).await);
    assert_eq!(req.id, 2);
    assert_eq!(req.params, vec![Value::Int(5)]);
    send_frame(&peer, Response::ok(2, Value::Null).into()).await;
    assert_eq!(second.await.unwrap(), Ok(Value::Null));
}

#[tokio::test]
async fn test_out_of_order_replies_are_correlated() {
    let (client_side, peer) = ChannelTransport::pair();
    let client = Client::over(client_side, &ClientConfig::default());

    let mut handles = Vec::new();
    for method in ["first", "second", "third"] {
        let client = client.clone();
        handles.push(tokio::spawn(async move { client.call("Service", method, vec![]).await }));
    }

    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(recv_request(recv_frame(&peer).await));
    }
    // answer in reverse, each reply names its own method
    for req in requests.iter().rev() {
        send_frame(&peer, Response::ok(req.id, req.method.as_str()).into()).await;
    }

    for (handle, method) in handles.into_iter().zip(["first", "second", "third"]) {
        assert_eq!(handle.await.unwrap(), Ok(Value::from(method)));
    }
}

#[tokio::test]
async fn test_unknown_reply_ids_are_ignored() {
    let (client_side, peer) = ChannelTransport::pair();
    let client = Client::over(client_side, &ClientConfig::default());

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call("Service", "getMail", vec![]).await }
    });
    let req = recv_request(recv_frame(&peer).await);

    send_frame(&peer, Response::ok(999, "stray").into()).await;
    send_frame(&peer, Response::ok(req.id, "vip.alexd@gmail.com").into()).await;

    assert_eq!(call.await.unwrap(), Ok(Value::from("vip.alexd@gmail.com")));
    assert!(client.is_open());
}

#[tokio::test]
async fn test_error_spots_map_to_call_errors() {
    let (client_side, peer) = ChannelTransport::pair();
    let client = Client::over(client_side, &ClientConfig::default());

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call("Service", "x", vec![]).await }
    });
    let req = recv_request(recv_frame(&peer).await);
    send_frame(&peer, Response::execution_failed(req.id, "disk full").into()).await;
    assert_eq!(call.await.unwrap(), Err(CallError::RemoteExecution("disk full".into())));
}

#[tokio::test]
async fn test_client_receiving_request_closes() {
    let (client_side, peer) = ChannelTransport::pair();
    let client = Client::over(client_side, &ClientConfig::default());

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call("Service", "getMail", vec![]).await }
    });
    recv_frame(&peer).await;

    send_frame(&peer, Request::new(1, "Service", "getMail", vec![]).into()).await;

    assert!(matches!(call.await.unwrap(), Err(CallError::ConnectionFailure(_))));
    client.closed().await;
    assert!(matches!(client.close_reason(), Some(CloseReason::Protocol(_))));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_client_receiving_garbage_closes() {
    let (client_side, peer) = ChannelTransport::pair();
    let client = Client::over(client_side, &ClientConfig::default());

    peer.send(&[0x01, 0xFF, 0x00]).await.unwrap();
    client.closed().await;
    assert!(matches!(client.close_reason(), Some(CloseReason::Protocol(_))));
}

// ============================================================================
//  SERVER SIDE
// ============================================================================

fn mail_registry() -> std::sync::Arc<ServiceRegistry> {
    ServiceRegistry::builder()
        .service("Service", Service::new().method("getMail", || Ok::<_, String>("vip.alexd@gmail.com")))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_server_answers_raw_request() {
    let (server_side, peer) = ChannelTransport::pair();
    let _server = serve_transport(server_side, mail_registry(), ServeOptions::default());

    send_frame(&peer, Request::new(41, "Service", "getMail", vec![]).into()).await;
    match recv_frame(&peer).await {
        Frame::Response(resp) => assert_eq!(resp, Response::ok(41, "vip.alexd@gmail.com")),
        other => panic!("Expected response, got {:?}", other),
    }
}

#[tokio::test]
async fn test_server_receiving_response_closes() {
    let (server_side, peer) = ChannelTransport::pair();
    let server = serve_transport(server_side, mail_registry(), ServeOptions::default());

    send_frame(&peer, Response::ok(1, Value::Null).into()).await;

    server.closed().await;
    assert!(matches!(server.close_reason(), Some(CloseReason::Protocol(_))));
    // the server dropped its end
    assert_eq!(peer.recv().await.unwrap(), None);
}

#[tokio::test]
async fn test_server_rejects_unknown_version() {
    let (server_side, peer) = ChannelTransport::pair();
    let server = serve_transport(server_side, mail_registry(), ServeOptions::default());

    let mut bytes = Frame::from(Request::new(1, "Service", "getMail", vec![])).encode().unwrap();
    bytes[0] = 0x7F;
    peer.send(&bytes).await.unwrap();

    server.closed().await;
    assert!(matches!(server.close_reason(), Some(CloseReason::Protocol(_))));
}

#[tokio::test]
async fn test_server_eof_closes() {
    let (server_side, peer) = ChannelTransport::pair();
    let server = serve_transport(server_side, mail_registry(), ServeOptions::default());
    assert_eq!(server.state(), ConnectionState::Open);

    peer.close().await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), server.closed()).await.unwrap();
    assert_eq!(server.close_reason(), Some(CloseReason::Eof));
}

// ============================================================================
//  WRITE FAULTS
// ============================================================================

/// Forwards the first `sends_left` frames, then fails every write.
struct BreaksAfter {
    inner: ChannelTransport,
    sends_left: AtomicUsize,
}

impl BreaksAfter {
    fn new(inner: ChannelTransport, sends: usize) -> Self {
        Self { inner, sends_left: AtomicUsize::new(sends) }
    }
}

#[async_trait::async_trait]
impl Transport for BreaksAfter {
    async fn send(&self, frame: &[u8]) -> transport::Result<()> {
        let allowed = self
            .sends_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !allowed {
            return Err(transport::Error::ConnectionLost("write side broke".into()));
        }
        self.inner.send(frame).await
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        self.inner.recv().await
    }

    async fn close(&self) -> transport::Result<()> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_write_fault_fails_every_pending_call() {
    let (client_side, peer) = ChannelTransport::pair();
    let client = Client::over(BreaksAfter::new(client_side, 1), &ClientConfig::default());

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.call("Service", "first", vec![]).await }
    });
    let req = recv_request(recv_frame(&peer).await);
    assert_eq!(req.method, "first");

    // the second write fails and takes the connection down with it
    let second = client.call("Service", "second", vec![]).await;
    assert!(matches!(second, Err(CallError::ConnectionFailure(_))));

    let first = tokio::time::timeout(Duration::from_secs(2), first).await.expect("first call resolves");
    assert!(matches!(first.unwrap(), Err(CallError::ConnectionFailure(_))));

    client.closed().await;
    assert!(matches!(client.close_reason(), Some(CloseReason::Transport(_))));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_close_while_write_is_stuck() {
    // a tiny pipe whose far end is never read
    let (near, _far) = tokio::io::duplex(64);
    let (read, write) = tokio::io::split(near);
    let client = Client::over(StreamTransport::new(read, write, 1 << 20), &ClientConfig::default());

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call("Service", "echo", vec![Value::from("x".repeat(10_000))]).await }
    });
    while client.pending_calls() == 0 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(Duration::from_secs(2), client.close()).await.expect("close finishes");
    let result = tokio::time::timeout(Duration::from_secs(2), call).await.expect("call resolves");
    assert!(matches!(result.unwrap(), Err(CallError::ConnectionFailure(_))));
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(client.close_reason(), Some(CloseReason::Local));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_worker_finishing_after_close_is_harmless() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let registry = ServiceRegistry::builder()
        .service(
            "Service",
            Service::new().method_async("slow", {
                let started = started.clone();
                let release = release.clone();
                move || {
                    let started = started.clone();
                    let release = release.clone();
                    async move {
                        started.notify_one();
                        release.notified().await;
                        Ok::<_, String>("late")
                    }
                }
            }),
        )
        .build()
        .unwrap();

    let (server_side, peer) = ChannelTransport::pair();
    let server = serve_transport(server_side, registry, ServeOptions::default());

    send_frame(&peer, Request::new(7, "Service", "slow", vec![]).into()).await;
    started.notified().await;

    server.close().await;
    assert_eq!(peer.recv().await.unwrap(), None);

    // let the worker finish and try to answer on the closed connection
    release.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(server.state(), ConnectionState::Closed);
    assert_eq!(server.close_reason(), Some(CloseReason::Local));
    assert_eq!(peer.recv().await.unwrap(), None);
}
