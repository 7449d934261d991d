use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};
use reqpool::prelude::{
    ClientConfig, HttpClient, HttpClientError, HttpClientErrorCode, ProxyRoutePlanner,
    RetryPolicy, TimeoutPhase, TransportErrorKind,
};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("reqpool=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

#[derive(Clone)]
enum Reply {
    /// Answers and keeps the connection open for the next request.
    Respond {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },
    /// Writes the bytes verbatim, then closes.
    Raw(Vec<u8>),
    /// Closes without answering.
    Hangup,
    /// Waits, then closes without answering.
    Stall(Duration),
    /// Sends one byte per `interval` for three seconds, either inside a
    /// header line or inside a declared body, then closes.
    Trickle { in_body: bool, interval: Duration },
}

impl Reply {
    fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::with_headers(200, Vec::<(String, String)>::new(), body)
    }

    fn json(body: &str) -> Self {
        Self::with_headers(200, vec![("Content-Type", "application/json")], body)
    }

    fn with_headers(
        status: u16,
        headers: Vec<(impl Into<String>, impl Into<String>)>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self::Respond {
            status,
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
            body: body.into(),
        }
    }
}

#[derive(Clone, Debug)]
struct CapturedRequest {
    method: String,
    target: String,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

type Handler = dyn Fn(usize, &CapturedRequest) -> Reply + Send + Sync;

struct MockServer {
    address: SocketAddr,
    accepted: Arc<AtomicUsize>,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl MockServer {
    fn start<F>(handler: F) -> Self
    where
        F: Fn(usize, &CapturedRequest) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let address = listener.local_addr().expect("read local address");
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let handler: Arc<Handler> = Arc::new(handler);
        let accepted = Arc::new(AtomicUsize::new(0));
        let captured = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let join = {
            let accepted = Arc::clone(&accepted);
            let captured = Arc::clone(&captured);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            accepted.fetch_add(1, Ordering::SeqCst);
                            let handler = Arc::clone(&handler);
                            let captured = Arc::clone(&captured);
                            thread::spawn(move || serve_connection(stream, &*handler, &captured));
                        }
                        Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(2));
                        }
                        Err(_) => break,
                    }
                }
            })
        };

        Self {
            address,
            accepted,
            captured,
            stop,
            join: Some(join),
        }
    }

    fn always(reply: Reply) -> Self {
        Self::start(move |_, _| reply.clone())
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.address)
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    fn requests(&self) -> Vec<CapturedRequest> {
        self.captured
            .lock()
            .expect("lock captured requests")
            .clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn serve_connection(
    mut stream: TcpStream,
    handler: &Handler,
    captured: &Mutex<Vec<CapturedRequest>>,
) {
    let _ = stream.set_nonblocking(false);
    while let Ok(request) = read_request(&mut stream) {
        let index = {
            let mut captured = captured.lock().expect("lock captured requests");
            captured.push(request.clone());
            captured.len() - 1
        };
        match handler(index, &request) {
            Reply::Respond {
                status,
                headers,
                body,
            } => {
                if write_response(&mut stream, status, &headers, &body).is_err() {
                    return;
                }
            }
            Reply::Raw(raw) => {
                let _ = stream.write_all(&raw);
                let _ = stream.flush();
                return;
            }
            Reply::Hangup => return,
            Reply::Stall(delay) => {
                thread::sleep(delay);
                return;
            }
            Reply::Trickle { in_body, interval } => {
                trickle(&mut stream, in_body, interval);
                return;
            }
        }
    }
}

fn trickle(stream: &mut TcpStream, in_body: bool, interval: Duration) {
    let head: &[u8] = if in_body {
        b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n"
    } else {
        b"HTTP/1.1 200 OK\r\nX-Slow: "
    };
    if stream.write_all(head).is_err() {
        return;
    }
    let until = Instant::now() + Duration::from_secs(3);
    while Instant::now() < until {
        thread::sleep(interval);
        if stream.write_all(b"a").and_then(|()| stream.flush()).is_err() {
            return;
        }
    }
    if !in_body {
        let _ = stream.write_all(b"\r\nContent-Length: 0\r\n\r\n");
    }
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn read_request(stream: &mut TcpStream) -> std::io::Result<CapturedRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;

    let mut raw = Vec::new();
    let mut byte = [0_u8; 1];
    while find_header_end(&raw).is_none() {
        if stream.read(&mut byte)? == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        raw.push(byte[0]);
    }

    let header_text = String::from_utf8_lossy(&raw);
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut request_line_parts = request_line.split_whitespace();
    let method = request_line_parts.next().unwrap_or_default().to_owned();
    let target = request_line_parts.next().unwrap_or_default().to_owned();

    let mut headers = BTreeMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
        }
    }

    let content_length = headers
        .get("content-length")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0_u8; content_length];
    stream.read_exact(&mut body)?;

    Ok(CapturedRequest {
        method,
        target,
        headers,
        body,
    })
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    headers: &[(String, String)],
    body: &[u8],
) -> std::io::Result<()> {
    let mut raw = format!("HTTP/1.1 {status} {}\r\n", status_text(status));
    let chunked = headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("transfer-encoding"));
    if !chunked {
        raw.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    for (name, value) in headers {
        raw.push_str(&format!("{name}: {value}\r\n"));
    }
    raw.push_str("\r\n");

    stream.write_all(raw.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

fn status_text(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        204 => "No Content",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn client_with(config: ClientConfig, retry_policy: RetryPolicy) -> HttpClient {
    HttpClient::builder()
        .config(
            config
                .with_connect_timeout(Duration::from_millis(500))
                .with_connection_request_timeout(Duration::from_millis(500)),
        )
        .retry_policy(retry_policy)
        .build()
        .expect("client builds")
}

fn client() -> HttpClient {
    client_with(ClientConfig::default(), RetryPolicy::with_limit(3))
}

#[test]
fn get_json_object_returns_parsed_body_and_sends_standard_headers() {
    let server = MockServer::always(Reply::json(r#"{"a":1,"name":"widget"}"#));
    let client = client();

    let object = client
        .get_json_object(server.url("/items?id=7"))
        .expect("json object");
    assert_eq!(object.get("a"), Some(&serde_json::json!(1)));
    assert_eq!(object.get("name"), Some(&serde_json::json!("widget")));

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].target, "/items?id=7");
    assert_eq!(
        requests[0].headers.get("host").map(String::as_str),
        Some(server.address.to_string().as_str())
    );
    assert!(
        requests[0]
            .headers
            .get("user-agent")
            .is_some_and(|agent| agent.starts_with("reqpool/"))
    );
    assert!(!requests[0].headers.contains_key("content-length"));
}

#[test]
fn keep_alive_connection_is_reused_across_requests() {
    init_tracing();
    let server = MockServer::always(Reply::ok("pong"));
    let client = client();

    for _ in 0..3 {
        assert_eq!(client.get_text(server.url("/ping")).expect("text"), "pong");
    }

    assert_eq!(server.accepted(), 1);
    assert_eq!(server.requests().len(), 3);
    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.connections_opened, 1);
    assert_eq!(metrics.connections_reused, 2);
    assert_eq!(metrics.requests_succeeded, 3);
    let stats = client.pool_stats();
    assert_eq!(stats.leased, 0);
    assert_eq!(stats.idle, 1);
}

#[test]
fn keep_alive_timeout_header_limits_idle_reuse() {
    init_tracing();
    let server = MockServer::always(Reply::with_headers(
        200,
        vec![("Keep-Alive", "timeout=1, max=100")],
        "tick",
    ));
    let client = client();

    assert_eq!(client.get_text(server.url("/")).expect("first"), "tick");
    assert_eq!(client.get_text(server.url("/")).expect("second"), "tick");
    assert_eq!(server.accepted(), 1);

    thread::sleep(Duration::from_millis(1300));
    assert_eq!(client.get_text(server.url("/")).expect("third"), "tick");
    assert_eq!(server.accepted(), 2);
    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.connections_opened, 2);
    assert_eq!(metrics.connections_reused, 1);
}

#[test]
fn switching_protocols_response_is_not_pooled() {
    let server = MockServer::always(Reply::with_headers(
        101,
        vec![("Connection", "Upgrade"), ("Upgrade", "websocket")],
        Vec::new(),
    ));
    let client = client();

    let response = client.get(server.url("/socket")).send().expect("response");
    assert_eq!(response.status().as_u16(), 101);
    drop(response);
    let stats = client.pool_stats();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.allocated(), 0);

    client.get(server.url("/socket")).send().expect("second response");
    assert_eq!(server.accepted(), 2);
}

#[test]
fn connection_close_response_is_not_pooled() {
    let server = MockServer::always(Reply::with_headers(
        200,
        vec![("Connection", "close")],
        "bye",
    ));
    let client = client();

    assert_eq!(client.get_text(server.url("/")).expect("first"), "bye");
    assert_eq!(client.get_text(server.url("/")).expect("second"), "bye");
    assert_eq!(server.accepted(), 2);
    assert_eq!(client.pool_stats().idle, 0);
}

#[test]
fn empty_responses_release_the_connection_immediately() {
    let server = MockServer::always(Reply::with_headers(
        204,
        Vec::<(String, String)>::new(),
        Vec::new(),
    ));
    let client = client();

    let response = client.delete(server.url("/items/7")).send().expect("response");
    assert_eq!(response.status().as_u16(), 204);
    assert_eq!(client.pool_stats().leased, 0);
    drop(response);

    client.get(server.url("/items/8")).send().expect("second response");
    assert_eq!(server.accepted(), 1);
}

#[test]
fn peer_hangup_is_retried_until_the_limit() {
    init_tracing();
    let server = MockServer::always(Reply::Hangup);
    let client = client_with(ClientConfig::default(), RetryPolicy::with_limit(3));

    let error = client.get_text(server.url("/")).expect_err("server hangs up");
    assert_eq!(
        error.transport_kind(),
        Some(TransportErrorKind::ConnectionClosed)
    );
    assert_eq!(server.requests().len(), 3);
    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.attempts, 3);
    assert_eq!(metrics.retries, 2);
    assert_eq!(metrics.requests_failed, 1);
}

#[test]
fn closed_connection_is_retried_even_for_requests_with_a_body() {
    init_tracing();
    let server = MockServer::start(|index, _| {
        if index == 0 {
            Reply::Hangup
        } else {
            Reply::ok("created")
        }
    });
    let client = client();

    let body = client
        .post_json_text(server.url("/items"), r#"{"name":"widget"}"#)
        .expect("second attempt succeeds");
    assert_eq!(body, "created");

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|request| request.body == br#"{"name":"widget"}"#));
}

#[test]
fn protocol_garbage_is_retried_only_without_a_body() {
    init_tracing();
    let server = MockServer::always(Reply::Raw(b"NOT-HTTP garbage\r\n\r\n".to_vec()));
    let client = client_with(ClientConfig::default(), RetryPolicy::with_limit(3));

    let error = client
        .post_json_text(server.url("/items"), "{}")
        .expect_err("garbage response");
    assert_eq!(error.code(), HttpClientErrorCode::Protocol);
    assert_eq!(server.requests().len(), 1);

    let error = client.get_text(server.url("/items")).expect_err("garbage");
    assert_eq!(error.code(), HttpClientErrorCode::Protocol);
    assert_eq!(server.requests().len(), 4);
}

#[test]
fn bodyless_post_counts_as_enclosing_an_entity() {
    let server = MockServer::always(Reply::Raw(b"garbage\r\n\r\n".to_vec()));
    let client = client_with(ClientConfig::default(), RetryPolicy::with_limit(3));

    let error = client
        .post(server.url("/trigger"))
        .send()
        .expect_err("garbage response");
    assert_eq!(error.code(), HttpClientErrorCode::Protocol);

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].headers.get("content-length").map(String::as_str),
        Some("0")
    );
}

#[test]
fn read_timeout_is_reported_and_retried() {
    init_tracing();
    let server = MockServer::always(Reply::Stall(Duration::from_millis(800)));
    let client = client_with(
        ClientConfig::default().with_socket_timeout(Duration::from_millis(150)),
        RetryPolicy::with_limit(2),
    );

    let error = client.get_text(server.url("/slow")).expect_err("stalls");
    assert_eq!(error.timeout_phase(), Some(TimeoutPhase::Read));
    assert_eq!(server.requests().len(), 2);
    assert_eq!(client.metrics_snapshot().timeout_read, 1);
}

#[test]
fn request_timeout_bounds_the_whole_call() {
    let server = MockServer::always(Reply::Stall(Duration::from_secs(2)));
    let client = client_with(
        ClientConfig::default().with_socket_timeout(Duration::from_secs(5)),
        RetryPolicy::with_limit(5),
    );

    let started = Instant::now();
    let error = client
        .get(server.url("/slow"))
        .timeout(Duration::from_millis(250))
        .send()
        .expect_err("budget spent");
    assert!(started.elapsed() < Duration::from_millis(1500));
    assert!(
        matches!(
            error.code(),
            HttpClientErrorCode::DeadlineExceeded | HttpClientErrorCode::Timeout
        ),
        "{error}"
    );
}

#[test]
fn request_timeout_bounds_a_trickling_response() {
    init_tracing();
    for in_body in [false, true] {
        let server = MockServer::always(Reply::Trickle {
            in_body,
            interval: Duration::from_millis(50),
        });
        let client = client_with(
            ClientConfig::default().with_socket_timeout(Duration::from_secs(5)),
            RetryPolicy::with_limit(1),
        );

        let started = Instant::now();
        let error = client
            .get(server.url("/drip"))
            .timeout(Duration::from_millis(300))
            .send_text()
            .expect_err("budget spent while bytes keep arriving");
        let elapsed = started.elapsed();
        assert!(
            elapsed < Duration::from_millis(1500),
            "in_body={in_body}: call took {elapsed:?}"
        );
        assert!(
            matches!(
                error.code(),
                HttpClientErrorCode::DeadlineExceeded | HttpClientErrorCode::Timeout
            ),
            "in_body={in_body}: {error}"
        );
        assert_eq!(client.pool_stats().allocated(), 0);
    }
}

#[test]
fn unresolvable_host_is_not_retried() {
    let client = client_with(ClientConfig::default(), RetryPolicy::with_limit(3));

    let error = client
        .get_text("http://reqpool-test-host.invalid/")
        .expect_err("host does not resolve");
    assert_eq!(error.transport_kind(), Some(TransportErrorKind::Dns));
    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.retries, 0);
    assert_eq!(client.pool_stats().allocated(), 0);
}

#[test]
fn held_response_exhausts_a_single_slot_route() {
    init_tracing();
    let server = MockServer::always(Reply::ok("held"));
    let client = HttpClient::from_config(
        ClientConfig::default()
            .with_max_per_route(1)
            .with_connection_request_timeout(Duration::from_millis(100)),
    )
    .expect("client builds");

    let mut held = client.get(server.url("/a")).send().expect("first response");
    assert_eq!(client.pool_stats().leased, 1);

    let error = client
        .get_text(server.url("/b"))
        .expect_err("only slot is leased");
    assert_eq!(error.code(), HttpClientErrorCode::PoolExhausted);
    assert_eq!(server.requests().len(), 1);
    assert_eq!(client.metrics_snapshot().pool_exhausted, 1);

    assert_eq!(held.text().expect("held body"), "held");
    assert_eq!(client.pool_stats().leased, 0);
    assert_eq!(client.get_text(server.url("/c")).expect("slot free"), "held");
    assert_eq!(server.accepted(), 1);
}

#[test]
fn released_response_returns_its_connection() {
    let server = MockServer::always(Reply::ok("unread body"));
    let client = client();

    let mut response = client.get(server.url("/")).send().expect("response");
    response.release();
    assert!(response.is_released());
    let error = response.bytes().expect_err("released");
    assert_eq!(error.code(), HttpClientErrorCode::ResponseReleased);

    assert_eq!(client.pool_stats().idle, 1);
    client.get_bytes(server.url("/")).expect("reuse");
    assert_eq!(server.accepted(), 1);
}

#[test]
fn dropped_unread_response_closes_its_connection() {
    let server = MockServer::always(Reply::ok("unread body"));
    let client = client();

    drop(client.get(server.url("/")).send().expect("response"));
    assert_eq!(client.pool_stats().allocated(), 0);

    client.get_bytes(server.url("/")).expect("fresh connection");
    assert_eq!(server.accepted(), 2);
}

#[test]
fn error_status_carries_the_body_and_keeps_the_connection() {
    let server = MockServer::start(|index, _| {
        if index == 0 {
            Reply::with_headers(404, Vec::<(String, String)>::new(), "missing item")
        } else {
            Reply::ok("found")
        }
    });
    let client = client();

    let error = client.get_text(server.url("/items/404")).expect_err("404");
    match error {
        HttpClientError::HttpStatus { status, body, .. } => {
            assert_eq!(status, 404);
            assert_eq!(body, "missing item");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(server.requests().len(), 1);

    assert_eq!(client.get_text(server.url("/items/1")).expect("ok"), "found");
    assert_eq!(server.accepted(), 1);
}

#[test]
fn raw_send_returns_error_statuses_without_failing() {
    let server = MockServer::always(Reply::with_headers(
        503,
        Vec::<(String, String)>::new(),
        "busy",
    ));
    let client = client();

    let mut response = client.get(server.url("/")).send().expect("response");
    assert_eq!(response.status().as_u16(), 503);
    assert_eq!(response.text().expect("body"), "busy");
    assert_eq!(server.requests().len(), 1);
    assert_eq!(client.metrics_snapshot().status_counts.get(&503), Some(&1));
}

#[test]
fn forward_proxy_receives_absolute_form_targets() {
    let proxy = MockServer::always(Reply::ok("via proxy"));
    let client = HttpClient::builder()
        .proxy_planner(
            ProxyRoutePlanner::fixed("127.0.0.1", proxy.address.port())
                .authorization(HeaderValue::from_static("Basic dXNlcjpwYXNz")),
        )
        .build()
        .expect("client builds");

    let body = client
        .get_text("http://upstream.example:8080/v1/items?x=1")
        .expect("proxied");
    assert_eq!(body, "via proxy");
    assert_eq!(
        client
            .get_text("http://other.example/health")
            .expect("same proxy"),
        "via proxy"
    );

    let requests = proxy.requests();
    assert_eq!(requests[0].target, "http://upstream.example:8080/v1/items?x=1");
    assert_eq!(
        requests[0].headers.get("host").map(String::as_str),
        Some("upstream.example:8080")
    );
    assert_eq!(
        requests[0]
            .headers
            .get("proxy-authorization")
            .map(String::as_str),
        Some("Basic dXNlcjpwYXNz")
    );
    assert_eq!(requests[1].target, "http://other.example/health");
    assert_eq!(
        requests[1].headers.get("host").map(String::as_str),
        Some("other.example")
    );
}

#[test]
fn proxy_from_config_applies_to_every_request() {
    let proxy = MockServer::always(Reply::ok("configured proxy"));
    let client = HttpClient::from_config(
        ClientConfig::default().with_proxy("127.0.0.1", proxy.address.port()),
    )
    .expect("client builds");

    assert_eq!(
        client
            .get_text("http://service.internal/status")
            .expect("proxied"),
        "configured proxy"
    );
    assert_eq!(proxy.requests()[0].target, "http://service.internal/status");
    assert!(!proxy.requests()[0].headers.contains_key("proxy-authorization"));
}

#[test]
fn charset_from_content_type_or_caller_is_honored() {
    // "你好" in GBK.
    let gbk_body = vec![0xC4, 0xE3, 0xBA, 0xC3];
    let labelled = MockServer::always(Reply::with_headers(
        200,
        vec![("Content-Type", "text/plain; charset=GBK")],
        gbk_body.clone(),
    ));
    let unlabelled = MockServer::always(Reply::ok(gbk_body));
    let client = client();

    assert_eq!(client.get_text(labelled.url("/")).expect("gbk"), "你好");
    assert_eq!(
        client
            .get_text_with_charset(unlabelled.url("/"), "gbk")
            .expect("explicit gbk"),
        "你好"
    );
    let error = client
        .get_text(unlabelled.url("/"))
        .expect_err("not utf-8");
    assert_eq!(error.code(), HttpClientErrorCode::DecodeText);
}

#[test]
fn chunked_responses_are_decoded_and_pooled() {
    let server = MockServer::always(Reply::with_headers(
        200,
        vec![("Transfer-Encoding", "chunked")],
        "4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
    ));
    let client = client();

    assert_eq!(client.get_text(server.url("/")).expect("chunked"), "Wikipedia");
    assert_eq!(client.get_text(server.url("/")).expect("chunked"), "Wikipedia");
    assert_eq!(server.accepted(), 1);
}

#[test]
fn post_helpers_send_bodies_and_headers() {
    let server = MockServer::start(|_, request| Reply::ok(request.body.clone()));
    let client = HttpClient::builder()
        .try_default_header("x-client", "reqpool-tests")
        .expect("valid header")
        .build()
        .expect("client builds");

    let echoed = client
        .post_json_text(server.url("/echo"), r#"{"a":1}"#)
        .expect("echo");
    assert_eq!(echoed, r#"{"a":1}"#);

    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("x-trace-id"),
        HeaderValue::from_static("abc"),
    );
    headers.insert(
        http::header::USER_AGENT,
        HeaderValue::from_static("custom-agent"),
    );
    let bytes = client
        .post_bytes(server.url("/raw"), vec![1_u8, 2, 3], headers)
        .expect("echo bytes");
    assert_eq!(bytes.as_ref(), &[1, 2, 3]);

    let echoed: serde_json::Value = client
        .post_json(server.url("/typed"), &serde_json::json!({ "b": [1, 2] }))
        .expect("typed echo");
    assert_eq!(echoed, serde_json::json!({ "b": [1, 2] }));

    let requests = server.requests();
    assert_eq!(requests[0].method, "POST");
    assert_eq!(
        requests[0].headers.get("content-type").map(String::as_str),
        Some("application/json; charset=utf-8")
    );
    assert_eq!(
        requests[0].headers.get("content-length").map(String::as_str),
        Some("7")
    );
    assert_eq!(
        requests[0].headers.get("x-client").map(String::as_str),
        Some("reqpool-tests")
    );
    assert_eq!(
        requests[1].headers.get("x-trace-id").map(String::as_str),
        Some("abc")
    );
    assert_eq!(
        requests[1].headers.get("user-agent").map(String::as_str),
        Some("custom-agent")
    );
    assert_eq!(
        requests[2].headers.get("content-type").map(String::as_str),
        Some("application/json")
    );
}

#[test]
fn concurrent_callers_share_a_bounded_route() {
    let server = MockServer::start(|_, _| {
        thread::sleep(Duration::from_millis(10));
        Reply::ok("ok")
    });
    let client = Arc::new(
        HttpClient::from_config(
            ClientConfig::default()
                .with_max_per_route(2)
                .with_connection_request_timeout(Duration::from_secs(5)),
        )
        .expect("client builds"),
    );

    let workers = (0..6)
        .map(|_| {
            let client = Arc::clone(&client);
            let url = server.url("/work");
            thread::spawn(move || {
                for _ in 0..4 {
                    assert_eq!(client.get_text(url.as_str()).expect("request"), "ok");
                }
            })
        })
        .collect::<Vec<_>>();
    for worker in workers {
        worker.join().expect("worker thread");
    }

    assert!(server.accepted() <= 2, "opened {}", server.accepted());
    assert_eq!(server.requests().len(), 24);
    let stats = client.pool_stats();
    assert_eq!(stats.leased, 0);
    assert!(stats.idle <= 2);
}
