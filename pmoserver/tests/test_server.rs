use axum::{Router, routing::get};
use pmoserver::ServerBuilder;

#[tokio::test]
async fn test_server_serves_routes_and_stops() {
    let mut server = ServerBuilder::new("test", "127.0.0.1", 0).build();

    server
        .add_route("/api/status", || async { serde_json::json!({"status": "ok"}) })
        .await;
    server
        .add_router("/hello", Router::new().route("/{name}", get(|| async { "hi" })))
        .await;

    server.start().await.unwrap();
    let addr = server.local_addr().expect("bound address");
    assert_eq!(server.info().http_port, addr.port());

    let status: serde_json::Value = reqwest::get(format!("http://{}/api/status", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "ok");

    let body = reqwest::get(format!("http://{}/hello/world", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "hi");

    server.stop();
    tokio::time::timeout(std::time::Duration::from_secs(5), server.wait())
        .await
        .expect("server stops after stop()");
}

#[tokio::test]
async fn test_start_fails_on_taken_port() {
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();

    let mut server = ServerBuilder::new("test", "127.0.0.1", port).build();
    assert!(server.start().await.is_err());
}
