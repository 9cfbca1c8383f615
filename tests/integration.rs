//! End-to-end tests driving the relay the way a real client would: connect
//! over plain TCP, speak the SMTP wire protocol, and observe what the mocked
//! Microsoft endpoints received. No Docker, no testcontainers: the token
//! endpoint and the Graph `sendMail` endpoint are stood in by small in-process
//! `hyper` servers on loopback (§10.4), since this relay's egress is HTTPS to
//! two fixed-shape JSON endpoints rather than a single webhook POST.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use smtp_graph_relay::config::{Config, OAuth2Config, RetryConfig};
use smtp_graph_relay::smtp::Listener;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener as StdTokioListener, TcpStream};
use tokio_util::sync::CancellationToken;

fn test_oauth2() -> OAuth2Config {
    OAuth2Config {
        client_id: "client-id".to_string(),
        client_secret: "client-secret".to_string(),
        tenant_id: "contoso.onmicrosoft.com".to_string(),
        scopes: "https://graph.microsoft.com/.default".to_string(),
    }
}

fn base_config(listen_addr: String, token_base: String, graph_base: String) -> Config {
    Config {
        listen_addr,
        oauth2: test_oauth2(),
        fallback_user: None,
        fallback_pass: None,
        allow_anonymous: false,
        save_to_sent: false,
        max_message_size: 26_214_400,
        max_connections: 100,
        connection_timeout_seconds: 5,
        strict_attachments: false,
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        },
        health_check_bind_address: "127.0.0.1".to_string(),
        health_check_port: 0,
        token_endpoint_base: token_base,
        graph_api_base: graph_base,
    }
}

fn free_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

/// A loopback HTTP server returning a fixed token JSON body after an
/// optional per-request delay, counting how many requests it received.
async fn spawn_token_server(delay: Duration) -> (String, Arc<AtomicUsize>) {
    let listener = StdTokioListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = Arc::clone(&hits);

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let hits = Arc::clone(&hits_clone);
            tokio::spawn(async move {
                hits.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                let io = hyper_util::rt::TokioIo::new(stream);
                let service = hyper::service::service_fn(move |_req| async move {
                    Ok::<_, Infallible>(
                        hyper::Response::builder()
                            .status(200)
                            .body(Full::new(Bytes::from_static(
                                br#"{"access_token":"tok-e2e","expires_in":3600}"#,
                            )))
                            .unwrap(),
                    )
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    (format!("http://{addr}"), hits)
}

/// A loopback HTTP server standing in for Graph `sendMail`: returns the next
/// status in `statuses` per request (repeating the last), and records the
/// wall-clock time each request arrived plus the JSON bodies it received.
async fn spawn_graph_server(
    statuses: Vec<u16>,
) -> (String, Arc<std::sync::Mutex<Vec<Instant>>>, Arc<tokio::sync::Mutex<Vec<serde_json::Value>>>) {
    let listener = StdTokioListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let timings: Arc<std::sync::Mutex<Vec<Instant>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let bodies: Arc<tokio::sync::Mutex<Vec<serde_json::Value>>> = Arc::new(tokio::sync::Mutex::new(Vec::new()));

    let timings_clone = Arc::clone(&timings);
    let bodies_clone = Arc::clone(&bodies);

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let hits = Arc::clone(&hits);
            let statuses = statuses.clone();
            let timings = Arc::clone(&timings_clone);
            let bodies = Arc::clone(&bodies_clone);
            tokio::spawn(async move {
                let io = hyper_util::rt::TokioIo::new(stream);
                let idx = hits.fetch_add(1, Ordering::SeqCst);
                let status = statuses.get(idx).copied().unwrap_or(*statuses.last().unwrap());
                let timings = Arc::clone(&timings);
                let bodies = Arc::clone(&bodies);
                let service = hyper::service::service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                    let timings = Arc::clone(&timings);
                    let bodies = Arc::clone(&bodies);
                    async move {
                        timings.lock().unwrap().push(Instant::now());
                        let body = req.into_body().collect().await.unwrap().to_bytes();
                        if let Ok(json) = serde_json::from_slice::<serde_json::Value>(&body) {
                            bodies.lock().await.push(json);
                        }
                        Ok::<_, Infallible>(
                            hyper::Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::new()))
                                .unwrap(),
                        )
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    (format!("http://{addr}"), timings, bodies)
}

struct SmtpClient {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl SmtpClient {
    async fn connect(addr: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (r, w) = stream.into_split();
        Self {
            reader: BufReader::new(r),
            writer: w,
        }
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Authenticates with `AUTH LOGIN <user>` then reads the password prompt
    /// and replies, up through the `235` response.
    async fn auth_login(&mut self, user_b64: &str, pass_b64: &str) {
        self.send(&format!("AUTH LOGIN {user_b64}")).await;
        assert_eq!(self.read_line().await, "334 UGFzc3dvcmQ6");
        self.send(pass_b64).await;
        assert_eq!(self.read_line().await, "235 2.7.0 Authentication successful");
    }
}

async fn start_listener(config: Config) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let shutdown = CancellationToken::new();
    let listener = Listener::new(config);
    let task_shutdown = shutdown.clone();
    let handle = tokio::spawn(async move {
        let _ = listener.run(task_shutdown).await;
    });
    (shutdown, handle)
}

#[tokio::test]
async fn full_relay_accepts_and_delivers_a_plain_text_message() {
    let (token_base, _token_hits) = spawn_token_server(Duration::ZERO).await;
    let (graph_base, _timings, bodies) = spawn_graph_server(vec![202]).await;
    let listen_addr = free_addr();
    let config = base_config(listen_addr.clone(), token_base, graph_base);
    let (shutdown, handle) = start_listener(config).await;

    // Give the accept loop a moment to bind.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = SmtpClient::connect(&listen_addr).await;
    assert_eq!(client.read_line().await, "220 SMTP Relay Ready");

    client.send("EHLO sender.example.com").await;
    assert_eq!(client.read_line().await, "250-SMTP Relay");
    assert_eq!(client.read_line().await, "250 AUTH LOGIN PLAIN");

    client.auth_login("dXNlckBleC5jb20", "cGFzc3dvcmQ").await;

    client.send("MAIL FROM:<a@b.c>").await;
    assert_eq!(client.read_line().await, "250 2.0.0 Ok");
    client.send("RCPT TO:<r@x.y>").await;
    assert_eq!(client.read_line().await, "250 2.0.0 Ok");

    client.send("DATA").await;
    assert_eq!(client.read_line().await, "354 End data with <CR><LF>.<CR><LF>");
    client.send("Subject: Hi").await;
    client.send("").await;
    client.send("Hello.").await;
    client.send(".").await;
    assert_eq!(client.read_line().await, "250 2.0.0 Ok: queued as graphapi");

    client.send("QUIT").await;
    assert_eq!(client.read_line().await, "221 2.0.0 Bye");

    let received = bodies.lock().await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["message"]["subject"], "Hi");

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
}

#[tokio::test]
async fn exceeding_max_connections_gets_421_and_closes() {
    let (token_base, _) = spawn_token_server(Duration::ZERO).await;
    let (graph_base, _, _) = spawn_graph_server(vec![202]).await;
    let listen_addr = free_addr();
    let mut config = base_config(listen_addr.clone(), token_base, graph_base);
    config.max_connections = 1;
    let (shutdown, handle) = start_listener(config).await;

    tokio::time::sleep(Duration::from_millis(50)).await;

    // First connection takes the only slot and just sits there without QUIT.
    let mut first = SmtpClient::connect(&listen_addr).await;
    assert_eq!(first.read_line().await, "220 SMTP Relay Ready");

    // Second connection should be rejected outright.
    let mut second = SmtpClient::connect(&listen_addr).await;
    let line = second.read_line().await;
    assert_eq!(line, "421 4.7.0 Too many connections, try again later");

    drop(first);
    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
}

#[tokio::test]
async fn concurrent_auths_for_the_same_user_single_flight_to_one_token_request() {
    let (token_base, token_hits) = spawn_token_server(Duration::from_millis(200)).await;
    let (graph_base, _, _) = spawn_graph_server(vec![202]).await;
    let listen_addr = free_addr();
    let mut config = base_config(listen_addr.clone(), token_base, graph_base);
    config.max_connections = 20;
    let (shutdown, handle) = start_listener(config).await;

    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let addr = listen_addr.clone();
        tasks.push(tokio::spawn(async move {
            let mut client = SmtpClient::connect(&addr).await;
            client.read_line().await; // 220
            client.send("EHLO x").await;
            client.read_line().await;
            client.read_line().await;
            client.auth_login("dXNlckBleC5jb20", "cGFzc3dvcmQ").await;
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    assert_eq!(token_hits.load(Ordering::SeqCst), 1);

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
}

#[tokio::test]
async fn transient_graph_failures_are_retried_with_backoff_then_succeed() {
    let (token_base, _) = spawn_token_server(Duration::ZERO).await;
    let (graph_base, timings, _) = spawn_graph_server(vec![503, 503, 202]).await;
    let listen_addr = free_addr();
    let mut config = base_config(listen_addr.clone(), token_base, graph_base);
    config.retry = RetryConfig {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(10),
    };
    let (shutdown, handle) = start_listener(config).await;

    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = SmtpClient::connect(&listen_addr).await;
    client.read_line().await;
    client.send("EHLO x").await;
    client.read_line().await;
    client.read_line().await;
    client.auth_login("dXNlckBleC5jb20", "cGFzc3dvcmQ").await;

    client.send("MAIL FROM:<a@b.c>").await;
    client.read_line().await;
    client.send("RCPT TO:<r@x.y>").await;
    client.read_line().await;

    client.send("DATA").await;
    client.read_line().await;
    client.send("Subject: Retry").await;
    client.send("").await;
    client.send("Body.").await;
    client.send(".").await;
    assert_eq!(client.read_line().await, "250 2.0.0 Ok: queued as graphapi");

    let timings = timings.lock().unwrap();
    assert_eq!(timings.len(), 3);
    let first_gap = timings[1].duration_since(timings[0]);
    let second_gap = timings[2].duration_since(timings[1]);
    // min(100ms * 2^0, 10s) + jitter in [0, 25ms) = [100ms, 125ms)
    assert!(first_gap >= Duration::from_millis(95), "first gap too short: {first_gap:?}");
    assert!(first_gap < Duration::from_millis(200), "first gap too long: {first_gap:?}");
    // min(100ms * 2^1, 10s) + jitter in [0, 50ms) = [200ms, 250ms)
    assert!(second_gap >= Duration::from_millis(195), "second gap too short: {second_gap:?}");
    assert!(second_gap < Duration::from_millis(320), "second gap too long: {second_gap:?}");

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
}
