//! A real listener on 127.0.0.1, a real client, the mail scenario.

use std::sync::Arc;
use std::time::Duration;

use wirerun::CallError;
use wirerun::Client;
use wirerun::ClientConfig;
use wirerun::Server;
use wirerun::ServerConfig;
use wirerun::Service;
use wirerun::ServiceRegistry;
use wirerun::Value;

async fn start(config: ServerConfig) -> (Arc<Server>, ClientConfig) {
    let registry = ServiceRegistry::builder()
        .service(
            "Service",
            Service::new()
                .method("getMail", || Ok::<_, String>("vip.alexd@gmail.com"))
                .method("sum", |items: Vec<i64>| Ok::<_, String>(items.iter().sum::<i64>())),
        )
        .aliases(config.services.clone())
        .build()
        .expect("registry");

    let server = Arc::new(Server::bind(&config, registry).await.expect("bind"));
    let addr = server.local_addr().expect("local addr");
    tokio::spawn({
        let server = server.clone();
        async move { server.run().await }
    });

    (server, ClientConfig::new(addr.to_string()))
}

fn loopback() -> ServerConfig {
    ServerConfig { bind: "127.0.0.1:0".into(), ..ServerConfig::default() }
}

#[tokio::test]
async fn test_tcp_mail_scenario() {
    let (server, config) = start(loopback()).await;
    let client = Client::connect(&config).await.expect("connect");

    let mail: String = client.call_as("Service", "getMail", vec![]).await.unwrap();
    assert_eq!(mail, "vip.alexd@gmail.com");

    let err = client.call("ServiceWrong", "getMail", vec![]).await.unwrap_err();
    assert_eq!(err, CallError::ServiceNotFound("Service not found".into()));

    let err = client.call("Service", "getMailWrong", vec![]).await.unwrap_err();
    assert_eq!(err, CallError::MethodNotFound("Method not found".into()));

    let total = client
        .call("Service", "sum", vec![Value::from(vec![1i64, 2, 3])])
        .await
        .unwrap();
    assert_eq!(total, Value::Int(6));

    client.close().await;
    server.shutdown();
}

#[tokio::test]
async fn test_tcp_many_clients() {
    let (server, config) = start(loopback()).await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            let client = Client::connect(&config).await.expect("connect");
            for n in 0..10i64 {
                let total = client.call("Service", "sum", vec![Value::from(vec![n, 1])]).await;
                assert_eq!(total, Ok(Value::Int(n + 1)));
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    server.shutdown();
}

#[tokio::test]
async fn test_tcp_aliases_from_config() {
    let mut config = loopback();
    config.services.insert("Mail".into(), "Service".into());
    let (server, client_config) = start(config).await;

    let client = Client::connect(&client_config).await.expect("connect");
    let mail = client.call("Mail", "getMail", vec![]).await.unwrap();
    assert_eq!(mail, Value::from("vip.alexd@gmail.com"));
    server.shutdown();
}

#[tokio::test]
async fn test_shutdown_closes_open_connections() {
    let (server, config) = start(loopback()).await;
    let client = Client::connect(&config).await.expect("connect");
    assert!(client.call("Service", "getMail", vec![]).await.is_ok());

    server.shutdown();
    tokio::time::timeout(Duration::from_secs(2), client.closed()).await.expect("client closed");
    assert!(matches!(
        client.call("Service", "getMail", vec![]).await,
        Err(CallError::ConnectionFailure(_))
    ));
}

#[tokio::test]
async fn test_connect_refused() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = Client::connect(&ClientConfig::new(addr.to_string())).await;
    assert!(matches!(result, Err(CallError::ConnectionFailure(_))));
}
