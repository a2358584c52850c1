//! End-to-end call behavior over in-memory transports.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use wirerun::CallError;
use wirerun::ChannelTransport;
use wirerun::Client;
use wirerun::ClientConfig;
use wirerun::CloseReason;
use wirerun::Connection;
use wirerun::ConnectionState;
use wirerun::ServeOptions;
use wirerun::Service;
use wirerun::ServiceRegistry;
use wirerun::Value;
use wirerun::serve_transport;

fn registry() -> Arc<ServiceRegistry> {
    let service = Service::new()
        .method("getMail", || Ok::<_, String>("vip.alexd@gmail.com"))
        .method("fail", || Err::<(), _>("mailbox locked"))
        .method("explode", || -> Result<(), String> { panic!("boom") })
        .method("deep", || {
            let mut val = Value::Null;
            for _ in 0..100 {
                val = Value::List(vec![val]);
            }
            Ok::<_, String>(val)
        })
        .method_async("echo", |n: i64, delay_ms: i64| async move {
            tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
            Ok::<_, String>(n)
        })
        .method_async("hang", || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, String>(())
        });

    ServiceRegistry::builder()
        .service("Service", service)
        .alias("Mail", "Service")
        .build()
        .expect("registry")
}

fn connect_with(options: ServeOptions) -> (Client, Arc<Connection>) {
    let (client_side, server_side) = ChannelTransport::pair();
    let server = serve_transport(server_side, registry(), options);
    let client = Client::over(client_side, &ClientConfig::default());
    (client, server)
}

fn connect() -> (Client, Arc<Connection>) {
    connect_with(ServeOptions::default())
}

async fn wait_for_pending(client: &Client, n: usize) {
    for _ in 0..500 {
        if client.pending_calls() == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("expected {} pending calls, found {}", n, client.pending_calls());
}

// ============================================================================
//  RESOLUTION OUTCOMES
// ============================================================================

#[tokio::test]
async fn test_mail_scenario() {
    let (client, _server) = connect();

    let mail = client.call("Service", "getMail", vec![]).await.unwrap();
    assert_eq!(mail, Value::from("vip.alexd@gmail.com"));

    let err = client.call("ServiceWrong", "getMail", vec![]).await.unwrap_err();
    assert_eq!(err, CallError::ServiceNotFound("Service not found".into()));

    let err = client.call("Service", "getMailWrong", vec![]).await.unwrap_err();
    assert_eq!(err, CallError::MethodNotFound("Method not found".into()));

    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_shape_mismatch_is_method_not_found() {
    let (client, _server) = connect();

    let err = client.call("Service", "echo", vec![Value::Int(1)]).await.unwrap_err();
    assert!(matches!(err, CallError::MethodNotFound(_)));

    let err = client
        .call("Service", "echo", vec![Value::from("one"), Value::Int(0)])
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::MethodNotFound(_)));
}

#[tokio::test]
async fn test_typed_answers() {
    let (client, _server) = connect();

    let mail: String = client.call_as("Mail", "getMail", vec![]).await.unwrap();
    assert_eq!(mail, "vip.alexd@gmail.com");

    let err = client.call_as::<i64>("Service", "getMail", vec![]).await.unwrap_err();
    assert!(matches!(err, CallError::UnexpectedAnswer(_)));
}

#[tokio::test]
async fn test_failures_keep_connection_usable() {
    let (client, _server) = connect();

    let err = client.call("Service", "fail", vec![]).await.unwrap_err();
    assert_eq!(err, CallError::RemoteExecution("mailbox locked".into()));

    let err = client.call("Service", "explode", vec![]).await.unwrap_err();
    match err {
        CallError::RemoteExecution(msg) => assert!(msg.contains("boom")),
        other => panic!("Expected RemoteExecution, got {:?}", other),
    }

    // an answer the server cannot encode still gets exactly one reply
    let err = client.call("Service", "deep", vec![]).await.unwrap_err();
    assert!(matches!(err, CallError::RemoteExecution(_)));

    assert!(client.is_open());
    let mail = client.call("Service", "getMail", vec![]).await.unwrap();
    assert_eq!(mail, Value::from("vip.alexd@gmail.com"));
}

#[tokio::test]
async fn test_unencodable_params_fail_locally() {
    let (client, _server) = connect();

    let mut deep = Value::Null;
    for _ in 0..100 {
        deep = Value::List(vec![deep]);
    }
    let err = client.call("Service", "echo", vec![deep, Value::Int(0)]).await.unwrap_err();
    assert!(matches!(err, CallError::Encode(_)));
    assert_eq!(client.pending_calls(), 0);
    assert!(client.is_open());
}

// ============================================================================
//  CONCURRENCY
// ============================================================================

#[tokio::test]
async fn test_randomized_interleaving() {
    let (client, _server) = connect();

    let mut handles = Vec::new();
    for n in 0..64i64 {
        let client = client.clone();
        let delay = rand::thread_rng().gen_range(0..30i64);
        handles.push(tokio::spawn(async move {
            let answer = client
                .call("Service", "echo", vec![Value::Int(n), Value::Int(delay)])
                .await;
            (n, answer)
        }));
    }

    for handle in handles {
        let (n, answer) = handle.await.unwrap();
        assert_eq!(answer, Ok(Value::Int(n)));
    }
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_max_in_flight_still_answers_all() {
    let (client, _server) = connect_with(ServeOptions { max_in_flight: Some(1) });

    let mut handles = Vec::new();
    for n in 0..10i64 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client.call("Service", "echo", vec![Value::Int(n), Value::Int(5)]).await
        }));
    }
    for (n, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap(), Ok(Value::Int(n as i64)));
    }
}

// ============================================================================
//  TIMEOUTS
// ============================================================================

#[tokio::test]
async fn test_timeout_then_late_reply_is_dropped() {
    let (client, _server) = connect();

    let err = client
        .call_with_timeout(
            "Service",
            "echo",
            vec![Value::Int(1), Value::Int(100)],
            Some(Duration::from_millis(10)),
        )
        .await
        .unwrap_err();
    assert_eq!(err, CallError::Timeout(Duration::from_millis(10)));
    assert_eq!(client.pending_calls(), 0);

    // let the abandoned reply arrive
    tokio::time::sleep(Duration::from_millis(150)).await;

    let answer = client.call("Service", "echo", vec![Value::Int(2), Value::Int(0)]).await;
    assert_eq!(answer, Ok(Value::Int(2)));
    assert!(client.is_open());
}

#[tokio::test]
async fn test_configured_default_timeout() {
    let (client_side, server_side) = ChannelTransport::pair();
    let _server = serve_transport(server_side, registry(), ServeOptions::default());
    let config = ClientConfig { call_timeout_ms: Some(20), ..ClientConfig::default() };
    let client = Client::over(client_side, &config);

    let err = client.call("Service", "hang", vec![]).await.unwrap_err();
    assert_eq!(err, CallError::Timeout(Duration::from_millis(20)));
}

#[tokio::test]
async fn test_dropped_call_future_cleans_up() {
    let (client, _server) = connect();

    let call = client.call("Service", "hang", vec![]);
    let _ = tokio::time::timeout(Duration::from_millis(10), call).await;
    assert_eq!(client.pending_calls(), 0);
}

// ============================================================================
//  CLOSING
// ============================================================================

#[tokio::test]
async fn test_close_fails_every_pending_call() {
    let (client, _server) = connect();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let client = client.clone();
        handles.push(tokio::spawn(async move { client.call("Service", "hang", vec![]).await }));
    }
    wait_for_pending(&client, 8).await;

    client.close().await;
    for handle in handles {
        assert!(matches!(handle.await.unwrap(), Err(CallError::ConnectionFailure(_))));
    }
    assert_eq!(client.pending_calls(), 0);
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(client.close_reason(), Some(CloseReason::Local));

    // idempotent, and closed for good
    client.close().await;
    let err = client.call("Service", "getMail", vec![]).await.unwrap_err();
    assert!(matches!(err, CallError::ConnectionFailure(_)));
}

#[tokio::test]
async fn test_server_close_reaches_client() {
    let (client, server) = connect();

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.call("Service", "hang", vec![]).await })
    };
    wait_for_pending(&client, 1).await;

    server.close().await;
    assert_eq!(server.state(), ConnectionState::Closed);

    client.closed().await;
    assert_eq!(client.close_reason(), Some(CloseReason::Eof));
    assert!(matches!(pending.await.unwrap(), Err(CallError::ConnectionFailure(_))));
}

#[tokio::test]
async fn test_client_close_reaches_server() {
    let (client, server) = connect();
    assert!(client.call("Service", "getMail", vec![]).await.is_ok());

    client.close().await;
    server.closed().await;
    assert_eq!(server.close_reason(), Some(CloseReason::Eof));
}
