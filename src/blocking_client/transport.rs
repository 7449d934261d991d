use std::io::{self, BufReader, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
#[cfg(feature = "tls-rustls-ring")]
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use http::header::{HOST, PROXY_AUTHORIZATION, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method};
use tracing::{debug, trace};

use crate::ReqpoolResult;
use crate::error::{BoxError, HttpClientError, TimeoutPhase, TransportErrorKind};
use crate::pool::Poolable;
use crate::route::Route;

use super::codec::{WireError, encode_request, read_response_head};

/// Method and redacted URI attached to every error raised for one call.
#[derive(Clone, Copy)]
pub(crate) struct ErrorContext<'a> {
    pub(crate) method: &'a Method,
    pub(crate) uri: &'a str,
}

impl ErrorContext<'_> {
    pub(crate) fn transport(
        &self,
        kind: TransportErrorKind,
        source: impl Into<BoxError>,
    ) -> HttpClientError {
        HttpClientError::Transport {
            kind,
            method: self.method.clone(),
            uri: self.uri.to_owned(),
            source: source.into(),
        }
    }

    pub(crate) fn timeout(&self, phase: TimeoutPhase, timeout: Duration) -> HttpClientError {
        HttpClientError::Timeout {
            phase,
            timeout_ms: timeout.as_millis(),
            method: self.method.clone(),
            uri: self.uri.to_owned(),
        }
    }

    pub(crate) fn protocol(&self, message: impl Into<String>) -> HttpClientError {
        HttpClientError::Protocol {
            method: self.method.clone(),
            uri: self.uri.to_owned(),
            message: message.into(),
        }
    }

    pub(crate) fn io(
        &self,
        error: io::Error,
        phase: TimeoutPhase,
        timeout: Duration,
    ) -> HttpClientError {
        if is_timeout(&error) {
            return self.timeout(phase, timeout);
        }
        let kind = match error.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => TransportErrorKind::ConnectionClosed,
            _ => match phase {
                TimeoutPhase::Connect => TransportErrorKind::Connect,
                TimeoutPhase::Write => TransportErrorKind::Write,
                TimeoutPhase::Read => TransportErrorKind::Read,
            },
        };
        self.transport(kind, error)
    }

    pub(crate) fn wire(
        &self,
        error: WireError,
        phase: TimeoutPhase,
        timeout: Duration,
        body_limit: usize,
    ) -> HttpClientError {
        match error {
            WireError::Io(error) => self.io(error, phase, timeout),
            WireError::Closed => self.transport(
                TransportErrorKind::ConnectionClosed,
                "connection closed before the message was complete",
            ),
            WireError::Malformed(message) => self.protocol(message),
            WireError::TooLarge { actual_bytes } => HttpClientError::ResponseBodyTooLarge {
                limit_bytes: body_limit,
                actual_bytes,
                method: self.method.clone(),
                uri: self.uri.to_owned(),
            },
        }
    }
}

fn is_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

/// Trust configuration for HTTPS routes.
#[derive(Clone)]
pub(crate) struct TlsConnector {
    #[cfg(feature = "tls-rustls-ring")]
    config: Arc<rustls::ClientConfig>,
}

impl TlsConnector {
    #[cfg(feature = "tls-rustls-ring")]
    pub(crate) fn webpki_roots() -> ReqpoolResult<Self> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|source| HttpClientError::TlsConfig {
                message: source.to_string(),
            })?
            .with_root_certificates(root_store)
            .with_no_client_auth();
        Ok(Self::from_rustls(Arc::new(config)))
    }

    #[cfg(feature = "tls-rustls-ring")]
    pub(crate) fn from_rustls(config: Arc<rustls::ClientConfig>) -> Self {
        Self { config }
    }

    #[cfg(not(feature = "tls-rustls-ring"))]
    pub(crate) fn webpki_roots() -> ReqpoolResult<Self> {
        Ok(Self {})
    }
}

/// TCP socket whose timeouts are re-armed before every read and write, so
/// that a peer trickling bytes cannot outlive the call deadline.
pub(crate) struct TimedSocket {
    tcp: TcpStream,
    io_timeout: Duration,
    deadline: Option<Instant>,
}

impl TimedSocket {
    fn new(tcp: TcpStream, io_timeout: Duration, deadline: Option<Instant>) -> Self {
        Self {
            tcp,
            io_timeout,
            deadline,
        }
    }

    fn set_deadline(&mut self, io_timeout: Duration, deadline: Option<Instant>) {
        self.io_timeout = io_timeout;
        self.deadline = deadline;
    }

    fn arm(&self, apply: fn(&TcpStream, Option<Duration>) -> io::Result<()>) -> io::Result<()> {
        let timeout = match self.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "call deadline reached"));
                }
                self.io_timeout.min(remaining)
            }
            None => self.io_timeout,
        };
        apply(&self.tcp, Some(timeout.max(Duration::from_millis(1))))
    }
}

impl Read for TimedSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.arm(TcpStream::set_read_timeout)?;
        self.tcp.read(buf)
    }
}

impl Write for TimedSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.arm(TcpStream::set_write_timeout)?;
        self.tcp.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.tcp.flush()
    }
}

pub(crate) enum Stream {
    Plain(TimedSocket),
    #[cfg(feature = "tls-rustls-ring")]
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TimedSocket>>),
}

impl Stream {
    fn socket(&self) -> &TimedSocket {
        match self {
            Self::Plain(socket) => socket,
            #[cfg(feature = "tls-rustls-ring")]
            Self::Tls(stream) => &stream.sock,
        }
    }

    fn socket_mut(&mut self) -> &mut TimedSocket {
        match self {
            Self::Plain(socket) => socket,
            #[cfg(feature = "tls-rustls-ring")]
            Self::Tls(stream) => &mut stream.sock,
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf),
            #[cfg(feature = "tls-rustls-ring")]
            Self::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.write(buf),
            #[cfg(feature = "tls-rustls-ring")]
            Self::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.flush(),
            #[cfg(feature = "tls-rustls-ring")]
            Self::Tls(stream) => stream.flush(),
        }
    }
}

pub(crate) struct ConnectOptions<'a> {
    pub(crate) connect_timeout: Duration,
    pub(crate) user_agent: &'a str,
    pub(crate) proxy_authorization: Option<&'a HeaderValue>,
    pub(crate) tls: &'a TlsConnector,
}

/// One HTTP/1.1 connection. Requests on it are strictly sequential.
pub struct HttpConnection {
    reader: BufReader<Stream>,
}

impl HttpConnection {
    pub(crate) fn connect(
        route: &Route,
        options: &ConnectOptions<'_>,
        context: ErrorContext<'_>,
    ) -> ReqpoolResult<Self> {
        let connect_timeout = options.connect_timeout.max(Duration::from_millis(1));
        let deadline = Instant::now().checked_add(connect_timeout);
        let tcp = open_tcp(route, connect_timeout, context)?;
        let mut socket = TimedSocket::new(tcp, connect_timeout, deadline);
        if route.is_tunnelled() {
            establish_tunnel(&mut socket, route, options, context)?;
        }
        let stream = if route.is_secure() {
            tls_handshake(socket, route, options, context)?
        } else {
            Stream::Plain(socket)
        };
        Ok(Self {
            reader: BufReader::new(stream),
        })
    }

    /// Bounds every following read and write by `io_timeout` and, when
    /// set, by the time left until `deadline`.
    pub(crate) fn set_deadline(&mut self, io_timeout: Duration, deadline: Option<Instant>) {
        self.reader
            .get_mut()
            .socket_mut()
            .set_deadline(io_timeout, deadline);
    }

    pub(crate) fn send(&mut self, request: &[u8]) -> io::Result<()> {
        let stream = self.reader.get_mut();
        stream.write_all(request)?;
        stream.flush()
    }

    pub(crate) fn reader(&mut self) -> &mut BufReader<Stream> {
        &mut self.reader
    }
}

impl Poolable for HttpConnection {
    /// Idle connections must have nothing to read. Readable EOF means the
    /// peer closed; readable bytes mean the stream is out of sync.
    fn is_stale(&self) -> bool {
        if !self.reader.buffer().is_empty() {
            return true;
        }
        let tcp = &self.reader.get_ref().socket().tcp;
        if tcp.set_nonblocking(true).is_err() {
            return true;
        }
        let mut probe = [0_u8; 1];
        let stale = match tcp.peek(&mut probe) {
            Ok(_) => true,
            Err(error) => error.kind() != io::ErrorKind::WouldBlock,
        };
        stale || tcp.set_nonblocking(false).is_err()
    }
}

fn open_tcp(
    route: &Route,
    connect_timeout: Duration,
    context: ErrorContext<'_>,
) -> ReqpoolResult<TcpStream> {
    let started_at = Instant::now();
    let (host, port) = route.connect_address();
    let addresses = resolve(host, port, connect_timeout, context)?;

    let mut last_error = None;
    for address in addresses {
        let remaining = connect_timeout.saturating_sub(started_at.elapsed());
        if remaining.is_zero() {
            return Err(context.timeout(TimeoutPhase::Connect, connect_timeout));
        }
        match TcpStream::connect_timeout(&address, remaining) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                trace!(%address, "tcp connection established");
                return Ok(stream);
            }
            Err(error) => last_error = Some(error),
        }
    }
    let error = last_error
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no address attempted"));
    Err(context.io(error, TimeoutPhase::Connect, connect_timeout))
}

fn resolve(
    host: &str,
    port: u16,
    timeout: Duration,
    context: ErrorContext<'_>,
) -> ReqpoolResult<Vec<SocketAddr>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }
    let target = (host.to_owned(), port);
    let addresses = resolve_within(
        move || {
            target
                .to_socket_addrs()
                .map(|addresses| addresses.collect::<Vec<_>>())
        },
        timeout,
        context,
    )?;
    if addresses.is_empty() {
        return Err(context.transport(
            TransportErrorKind::Dns,
            format!("{host} resolved to no addresses"),
        ));
    }
    Ok(addresses)
}

/// Runs a blocking name lookup on its own thread and waits at most
/// `timeout`. A lookup that outlives the wait finishes in the background.
fn resolve_within<F>(
    lookup: F,
    timeout: Duration,
    context: ErrorContext<'_>,
) -> ReqpoolResult<Vec<SocketAddr>>
where
    F: FnOnce() -> io::Result<Vec<SocketAddr>> + Send + 'static,
{
    let (sender, receiver) = mpsc::sync_channel(1);
    thread::Builder::new()
        .name("reqpool-resolver".to_owned())
        .spawn(move || {
            let _ = sender.send(lookup());
        })
        .map_err(|source| context.transport(TransportErrorKind::Dns, source))?;

    match receiver.recv_timeout(timeout) {
        Ok(result) => result.map_err(|source| context.transport(TransportErrorKind::Dns, source)),
        Err(RecvTimeoutError::Timeout) => {
            debug!(timeout_ms = timeout.as_millis() as u64, "name resolution timed out");
            Err(context.timeout(TimeoutPhase::Connect, timeout))
        }
        Err(RecvTimeoutError::Disconnected) => Err(context.transport(
            TransportErrorKind::Dns,
            "resolver thread exited without an answer",
        )),
    }
}

fn establish_tunnel(
    socket: &mut TimedSocket,
    route: &Route,
    options: &ConnectOptions<'_>,
    context: ErrorContext<'_>,
) -> ReqpoolResult<()> {
    let timeout = options.connect_timeout.max(Duration::from_millis(1));

    let authority = route.authority();
    let mut headers = HeaderMap::new();
    if let Ok(host) = HeaderValue::from_str(&authority) {
        headers.insert(HOST, host);
    }
    if let Ok(user_agent) = HeaderValue::from_str(options.user_agent) {
        headers.insert(USER_AGENT, user_agent);
    }
    if let Some(authorization) = options.proxy_authorization {
        headers.insert(PROXY_AUTHORIZATION, authorization.clone());
    }
    let request = encode_request(&Method::CONNECT, &authority, &headers, None);
    socket
        .write_all(&request)
        .map_err(|error| context.io(error, TimeoutPhase::Connect, timeout))?;

    let mut reader = BufReader::new(socket);
    let head = read_response_head(&mut reader)
        .map_err(|error| context.wire(error, TimeoutPhase::Connect, timeout, 0))?;
    if !head.status.is_success() {
        return Err(context.transport(
            TransportErrorKind::Connect,
            format!("proxy refused CONNECT {authority} with status {}", head.status),
        ));
    }
    if !reader.buffer().is_empty() {
        return Err(context.protocol("proxy sent data after the CONNECT response"));
    }
    trace!(%route, "proxy tunnel established");
    Ok(())
}

#[cfg(feature = "tls-rustls-ring")]
fn tls_handshake(
    socket: TimedSocket,
    route: &Route,
    options: &ConnectOptions<'_>,
    context: ErrorContext<'_>,
) -> ReqpoolResult<Stream> {
    let timeout = options.connect_timeout.max(Duration::from_millis(1));

    let server_name = rustls::pki_types::ServerName::try_from(route.host().to_owned())
        .map_err(|source| context.transport(TransportErrorKind::Tls, source))?;
    let connection = rustls::ClientConnection::new(Arc::clone(&options.tls.config), server_name)
        .map_err(|source| context.transport(TransportErrorKind::Tls, source))?;
    let mut stream = rustls::StreamOwned::new(connection, socket);
    while stream.conn.is_handshaking() {
        match stream.conn.complete_io(&mut stream.sock) {
            Ok((0, 0)) => {
                return Err(context.transport(
                    TransportErrorKind::Tls,
                    "connection closed during tls handshake",
                ));
            }
            Ok(_) => {}
            Err(error) if is_timeout(&error) => {
                return Err(context.timeout(TimeoutPhase::Connect, timeout));
            }
            Err(error) => return Err(context.transport(TransportErrorKind::Tls, error)),
        }
    }
    trace!(%route, "tls handshake complete");
    Ok(Stream::Tls(Box::new(stream)))
}

#[cfg(not(feature = "tls-rustls-ring"))]
fn tls_handshake(
    _socket: TimedSocket,
    _route: &Route,
    _options: &ConnectOptions<'_>,
    context: ErrorContext<'_>,
) -> ReqpoolResult<Stream> {
    Err(HttpClientError::TlsBackendUnavailable {
        uri: context.uri.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use std::io::{self, Read};
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::thread;
    use std::time::{Duration, Instant};

    use http::Method;

    use super::{ErrorContext, TimedSocket, resolve, resolve_within};
    use crate::error::{TimeoutPhase, TransportErrorKind};

    fn context(method: &Method) -> ErrorContext<'_> {
        ErrorContext {
            method,
            uri: "http://resolver.test/",
        }
    }

    #[test]
    fn slow_name_lookup_is_a_connect_timeout() {
        let method = Method::GET;
        let started = Instant::now();
        let error = resolve_within(
            || {
                thread::sleep(Duration::from_millis(600));
                Ok(Vec::new())
            },
            Duration::from_millis(50),
            context(&method),
        )
        .expect_err("lookup outlives its timeout");
        assert_eq!(error.timeout_phase(), Some(TimeoutPhase::Connect));
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn failed_name_lookup_is_a_dns_error() {
        let method = Method::GET;
        let error = resolve_within(
            || Err(io::Error::new(io::ErrorKind::NotFound, "no such host")),
            Duration::from_secs(1),
            context(&method),
        )
        .expect_err("lookup fails");
        assert_eq!(error.transport_kind(), Some(TransportErrorKind::Dns));
    }

    #[test]
    fn ip_literals_skip_the_resolver() {
        let method = Method::GET;
        let addresses =
            resolve("::1", 8443, Duration::from_millis(1), context(&method)).expect("literal");
        assert_eq!(addresses, vec!["[::1]:8443".parse::<SocketAddr>().expect("addr")]);
    }

    #[test]
    fn reads_fail_once_the_deadline_has_passed() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let client = TcpStream::connect(listener.local_addr().expect("address")).expect("connect");
        let (_server, _) = listener.accept().expect("accept");

        let mut socket = TimedSocket::new(client, Duration::from_secs(5), Some(Instant::now()));
        let started = Instant::now();
        let error = socket.read(&mut [0_u8; 8]).expect_err("deadline passed");
        assert_eq!(error.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_millis(100));

        socket.set_deadline(
            Duration::from_secs(5),
            Instant::now().checked_add(Duration::from_millis(80)),
        );
        let started = Instant::now();
        socket.read(&mut [0_u8; 8]).expect_err("silent peer");
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
