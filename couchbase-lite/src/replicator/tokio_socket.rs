use super::{Authenticator, EndpointUrl, ProxySettings, ProxyType, ReplicatorConfiguration, SESSION_COOKIE_NAME};
use crate::{
    database::DbInner,
    error::{CblError, CblErrorCode, Error, NetworkErrorCode, Result},
    lock,
    logging::{cbl_log, LogDomain},
    repl_transport::{PassivePeer, PROTOCOL_ERROR},
    Database,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures_util::{sink::SinkExt, stream::StreamExt};
use log::{debug, error, info, trace, warn};
use std::{
    fmt, io,
    panic::{catch_unwind, AssertUnwindSafe},
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::oneshot,
};
use tokio_tungstenite::{
    accept_hdr_async, client_async_with_config,
    tungstenite::{
        self,
        client::IntoClientRequest,
        handshake::{
            client::{Request, Response},
            server::{ErrorResponse, Request as ServerRequest, Response as ServerResponse},
        },
        http::{
            self,
            header::{HeaderName, AUTHORIZATION, COOKIE, USER_AGENT, WWW_AUTHENTICATE},
            HeaderValue, StatusCode,
        },
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};

/// No answer to request during this time means connection is dead
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_PROXY_RESPONSE_HEAD: usize = 16 * 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client side of replication websocket
pub(crate) struct WsClient {
    stream: WsStream,
}

impl WsClient {
    pub(crate) async fn connect(config: &ReplicatorConfiguration, url: &EndpointUrl) -> Result<Self> {
        let request = build_request(config, url)?;
        info!("open websocket to {}", url.url);
        let tcp = match &config.proxy {
            Some(proxy) => tunnel(proxy, url).await?,
            None => TcpStream::connect((url.host.as_str(), url.port))
                .await
                .map_err(io_err_to_cbl)?,
        };
        if let Err(err) = tcp.set_nodelay(true) {
            trace!("set_nodelay failed: {}", err);
        }
        let (stream, response) = if url.tls {
            tls_handshake(config, request, tcp).await?
        } else {
            client_async_with_config(request, MaybeTlsStream::Plain(tcp), None)
                .await
                .map_err(tungstenite_err_to_cbl)?
        };
        debug!(
            "websocket to {} opened, HTTP status {}",
            url.url,
            response.status()
        );
        Ok(Self { stream })
    }

    /// Send `msg` and wait for reply
    pub(crate) async fn round_trip(&mut self, msg: String) -> Result<String> {
        tokio::time::timeout(REQUEST_TIMEOUT, self.exchange(msg))
            .await
            .map_err(|_| Error::from(CblError::network(NetworkErrorCode::Timeout)))?
    }

    async fn exchange(&mut self, msg: String) -> Result<String> {
        self.stream
            .send(Message::Text(msg))
            .await
            .map_err(tungstenite_err_to_cbl)?;
        while let Some(message) = self.stream.next().await {
            match message.map_err(tungstenite_err_to_cbl)? {
                Message::Text(text) => return Ok(text),
                Message::Binary(data) => {
                    return String::from_utf8(data).map_err(|_| Error::InvalidUtf8)
                }
                Message::Close(close_frame) => {
                    let code = close_frame.map_or(1000, |x| i32::from(u16::from(&x.code)));
                    info!("websocket closed by peer, code {}", code);
                    // normal closure in the middle of request means peer went away
                    return Err(CblError::websocket(if code == 1000 { 1001 } else { code }).into());
                }
                Message::Ping(_) | Message::Pong(_) => trace!("ping/pong frame was received"),
                Message::Frame(_) => warn!("unsupported Message::Frame format"),
            }
        }
        Err(CblError::network(NetworkErrorCode::ConnectionReset).into())
    }

    pub(crate) async fn ping(&mut self) -> Result<()> {
        self.stream
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(tungstenite_err_to_cbl)
    }

    pub(crate) async fn close(mut self) {
        if let Err(err) = self.stream.close(None).await {
            trace!("websocket close failed: {}", err);
        }
    }
}

fn build_request(config: &ReplicatorConfiguration, url: &EndpointUrl) -> Result<Request> {
    let mut request = url
        .url
        .as_str()
        .into_client_request()
        .map_err(tungstenite_err_to_cbl)?;
    let headers = request.headers_mut();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static(concat!("couchbase-lite-rs/", env!("CARGO_PKG_VERSION"))),
    );

    let mut cookies = Vec::<String>::new();
    match &config.authenticator {
        Some(Authenticator::Basic { username, password }) => {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&http_basic_auth_header(username, password))?,
            );
        }
        Some(Authenticator::Session {
            session_id,
            cookie_name,
        }) => cookies.push(format!(
            "{}={}",
            cookie_name.as_deref().unwrap_or(SESSION_COOKIE_NAME),
            session_id
        )),
        None => {}
    }
    for (name, value) in &config.headers {
        if name.eq_ignore_ascii_case("cookie") {
            cookies.push(value.clone());
        } else {
            headers.insert(HeaderName::from_str(name)?, HeaderValue::from_str(value)?);
        }
    }
    if !cookies.is_empty() {
        headers.insert(COOKIE, HeaderValue::from_str(&cookies.join("; "))?);
    }
    Ok(request)
}

/// Open TCP connection to `url` through HTTP proxy
async fn tunnel(proxy: &ProxySettings, url: &EndpointUrl) -> Result<TcpStream> {
    if proxy.proxy_type == ProxyType::Https {
        cbl_log!(
            LogDomain::Network,
            Error,
            "TLS connection to proxy {} is not supported",
            proxy.hostname
        );
        return Err(CblErrorCode::Unsupported.into());
    }
    let mut stream = TcpStream::connect((proxy.hostname.as_str(), proxy.port))
        .await
        .map_err(io_err_to_cbl)?;
    let target = if url.host.contains(':') {
        format!("[{}]:{}", url.host, url.port)
    } else {
        format!("{}:{}", url.host, url.port)
    };
    let mut head = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let (Some(username), Some(password)) = (&proxy.username, &proxy.password) {
        head.push_str("Proxy-Authorization: ");
        head.push_str(&http_basic_auth_header(username, password));
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    stream
        .write_all(head.as_bytes())
        .await
        .map_err(io_err_to_cbl)?;

    let mut response = Vec::new();
    let mut chunk = [0u8; 1024];
    while !response.windows(4).any(|x| x == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await.map_err(io_err_to_cbl)?;
        if n == 0 {
            return Err(CblError::network(NetworkErrorCode::ConnectionReset).into());
        }
        response.extend_from_slice(&chunk[..n]);
        if response.len() > MAX_PROXY_RESPONSE_HEAD {
            return Err(CblError::websocket(PROTOCOL_ERROR).into());
        }
    }
    match proxy_status(&response) {
        Some(status) if (200..300).contains(&status) => Ok(stream),
        Some(status) => {
            cbl_log!(
                LogDomain::Network,
                Error,
                "proxy {} refused to connect to {}: {}",
                proxy.hostname,
                target,
                status
            );
            Err(CblError::websocket(i32::from(status)).into())
        }
        None => Err(CblError::websocket(PROTOCOL_ERROR).into()),
    }
}

/// Status code from HTTP response head
fn proxy_status(head: &[u8]) -> Option<u16> {
    let head = std::str::from_utf8(head).ok()?;
    let status_line = head.lines().next()?;
    let mut parts = status_line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

#[cfg(feature = "use-native-tls")]
async fn tls_handshake(
    config: &ReplicatorConfiguration,
    request: Request,
    tcp: TcpStream,
) -> Result<(WsStream, Response)> {
    let mut builder = native_tls::TlsConnector::builder();
    if let Some(cert) = &config.pinned_server_certificate {
        builder.add_root_certificate(parse_certificate(cert)?);
        builder.disable_built_in_roots(true);
    }
    for cert in &config.trusted_root_certificates {
        builder.add_root_certificate(parse_certificate(cert)?);
    }
    let connector = builder.build().map_err(|err| {
        error!("can not create TLS connector: {}", err);
        Error::from(CblError::network(NetworkErrorCode::TlsHandshakeFailed))
    })?;
    tokio_tungstenite::client_async_tls_with_config(
        request,
        tcp,
        None,
        Some(tokio_tungstenite::Connector::NativeTls(connector)),
    )
    .await
    .map_err(tungstenite_err_to_cbl)
}

#[cfg(feature = "use-native-tls")]
fn parse_certificate(data: &[u8]) -> Result<native_tls::Certificate> {
    let cert = if data.starts_with(b"-----BEGIN") {
        native_tls::Certificate::from_pem(data)
    } else {
        native_tls::Certificate::from_der(data)
    };
    cert.map_err(|err| {
        error!("invalid certificate: {}", err);
        CblErrorCode::InvalidParameter.into()
    })
}

#[cfg(not(feature = "use-native-tls"))]
async fn tls_handshake(
    _config: &ReplicatorConfiguration,
    _request: Request,
    _tcp: TcpStream,
) -> Result<(WsStream, Response)> {
    cbl_log!(
        LogDomain::Network,
        Error,
        "wss:// requires use-native-tls feature"
    );
    Err(CblErrorCode::Unsupported.into())
}

fn io_err_to_cbl(err: io::Error) -> Error {
    use io::ErrorKind as Kind;
    let code = match err.kind() {
        Kind::ConnectionRefused => NetworkErrorCode::ConnectionRefused,
        Kind::ConnectionReset => NetworkErrorCode::ConnectionReset,
        Kind::ConnectionAborted => NetworkErrorCode::ConnectionAborted,
        Kind::NotConnected => NetworkErrorCode::NotConnected,
        Kind::BrokenPipe => NetworkErrorCode::BrokenPipe,
        Kind::TimedOut => NetworkErrorCode::Timeout,
        // name resolution failures carry no errno
        _ if err.raw_os_error().is_none() => NetworkErrorCode::UnknownHost,
        _ => return err.into(),
    };
    debug!("network error: {}", err);
    CblError::network(code).into()
}

fn tungstenite_err_to_cbl(err: tungstenite::Error) -> Error {
    use tungstenite::error::Error::*;
    debug!("websocket error: {}", err);
    let err = match err {
        ConnectionClosed | AlreadyClosed => CblError::network(NetworkErrorCode::ConnectionReset),
        Io(err) => return io_err_to_cbl(err),
        Url(_) => CblError::network(NetworkErrorCode::InvalidUrl),
        Http(ref resp) => CblError::websocket(i32::from(resp.status().as_u16())),
        Utf8 => CblError::websocket(1007),
        Tls(_) => CblError::network(NetworkErrorCode::TlsHandshakeFailed),
        _ => CblError::websocket(PROTOCOL_ERROR),
    };
    err.into()
}

impl From<http::header::InvalidHeaderName> for Error {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        error!("invalid header name: {}", err);
        CblErrorCode::InvalidParameter.into()
    }
}

impl From<http::header::InvalidHeaderValue> for Error {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        error!("invalid header value: {}", err);
        CblErrorCode::InvalidParameter.into()
    }
}

fn http_basic_auth_header(user_id: &str, password: &str) -> String {
    let credentials = format!("{}:{}", user_id, password);
    let mut ret = "Basic ".to_string();
    BASE64.encode_string(credentials.as_bytes(), &mut ret);
    ret
}

/// Username and password from `Authorization` header value
fn basic_credentials(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = String::from_utf8(BASE64.decode(encoded.trim()).ok()?).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.into(), password.into()))
}

/// Checks username and password of connecting client
pub type ListenerPasswordAuthenticator = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Parameters of `UrlEndpointListener`
#[derive(Clone)]
pub struct UrlEndpointListenerConfiguration {
    db: Arc<DbInner>,
    port: u16,
    network_interface: Option<String>,
    read_only: bool,
    authenticator: Option<ListenerPasswordAuthenticator>,
}

impl fmt::Debug for UrlEndpointListenerConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlEndpointListenerConfiguration")
            .field("db", &self.db.name)
            .field("port", &self.port)
            .field("network_interface", &self.network_interface)
            .field("read_only", &self.read_only)
            .field("authenticator", &self.authenticator.is_some())
            .finish()
    }
}

impl UrlEndpointListenerConfiguration {
    pub fn new(db: &Database) -> Self {
        Self {
            db: db.inner.clone(),
            port: 0,
            network_interface: None,
            read_only: false,
            authenticator: None,
        }
    }
    /// 0 means any free port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
    /// Address to listen on, all interfaces by default
    pub fn with_network_interface(mut self, iface: &str) -> Self {
        self.network_interface = Some(iface.into());
        self
    }
    /// Peers can only pull from read only listener
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
    pub fn with_password_authenticator<F>(mut self, auth: F) -> Self
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        self.authenticator = Some(Arc::new(auth));
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Connections accepted since start
    pub connection_count: u64,
    pub active_connection_count: u64,
}

#[derive(Default)]
struct ConnectionCounter {
    total: AtomicU64,
    active: AtomicU64,
}

struct Running {
    port: u16,
    stop: oneshot::Sender<()>,
    thread: thread::JoinHandle<()>,
    counter: Arc<ConnectionCounter>,
}

/// Serves database to replicators of other devices over websocket
pub struct UrlEndpointListener {
    config: UrlEndpointListenerConfiguration,
    running: Mutex<Option<Running>>,
}

impl Drop for UrlEndpointListener {
    fn drop(&mut self) {
        self.stop();
    }
}

impl UrlEndpointListener {
    pub fn new(config: UrlEndpointListenerConfiguration) -> Self {
        Self {
            config,
            running: Mutex::new(None),
        }
    }

    #[inline]
    pub fn config(&self) -> &UrlEndpointListenerConfiguration {
        &self.config
    }

    /// Bind port and start serving, no-op if already started
    pub fn start(&self) -> Result<()> {
        let mut running = lock(&self.running);
        if running.is_some() {
            return Ok(());
        }
        let iface = self.config.network_interface.as_deref().unwrap_or("0.0.0.0");
        let listener =
            std::net::TcpListener::bind((iface, self.config.port)).map_err(io_err_to_cbl)?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        let (stop_tx, stop_rx) = oneshot::channel();
        let counter = Arc::new(ConnectionCounter::default());
        let ctx = ServeContext {
            peer: PassivePeer::new(self.config.db.clone(), self.config.read_only),
            authenticator: self.config.authenticator.clone(),
            counter: counter.clone(),
        };
        let thread = thread::Builder::new()
            .name(format!("cbl-listener-{port}"))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(err) => {
                        error!("can not create runtime for listener: {}", err);
                        return;
                    }
                };
                rt.block_on(accept_loop(listener, ctx, stop_rx));
            })?;
        cbl_log!(
            LogDomain::Listener,
            Info,
            "{}: listening on {}:{}",
            self.config.db.name,
            iface,
            port
        );
        *running = Some(Running {
            port,
            stop: stop_tx,
            thread,
            counter,
        });
        Ok(())
    }

    /// Actual port, `None` if not started
    pub fn port(&self) -> Option<u16> {
        lock(&self.running).as_ref().map(|x| x.port)
    }

    /// URLs replicators can use to reach this listener
    pub fn urls(&self) -> Vec<String> {
        let Some(port) = self.port() else {
            return Vec::new();
        };
        let host = match self.config.network_interface.as_deref() {
            None | Some("0.0.0.0") => "localhost",
            Some(iface) => iface,
        };
        vec![format!("ws://{}:{}/{}", host, port, self.config.db.name)]
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        lock(&self.running)
            .as_ref()
            .map(|x| ConnectionStatus {
                connection_count: x.counter.total.load(Ordering::Relaxed),
                active_connection_count: x.counter.active.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }

    /// Close port and all connections
    pub fn stop(&self) {
        let running = lock(&self.running).take();
        if let Some(running) = running {
            let _ = running.stop.send(());
            if running.thread.join().is_err() {
                error!("listener thread panicked");
            }
            cbl_log!(
                LogDomain::Listener,
                Info,
                "{}: listener on port {} stopped",
                self.config.db.name,
                running.port
            );
        }
    }
}

#[derive(Clone)]
struct ServeContext {
    peer: PassivePeer,
    authenticator: Option<ListenerPasswordAuthenticator>,
    counter: Arc<ConnectionCounter>,
}

async fn accept_loop(
    listener: std::net::TcpListener,
    ctx: ServeContext,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(x) => x,
        Err(err) => {
            error!("can not register listener socket: {}", err);
            return;
        }
    };
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    trace!("connection from {}", addr);
                    tokio::spawn(serve_connection(stream, ctx.clone()));
                }
                Err(err) => warn!("accept failed: {}", err),
            },
            _ = &mut stop_rx => break,
        }
    }
}

async fn serve_connection(stream: TcpStream, ctx: ServeContext) {
    ctx.counter.total.fetch_add(1, Ordering::Relaxed);
    ctx.counter.active.fetch_add(1, Ordering::Relaxed);
    if let Err(err) = serve(stream, &ctx).await {
        debug!("connection closed with error: {}", err);
    }
    ctx.counter.active.fetch_sub(1, Ordering::Relaxed);
}

async fn serve(stream: TcpStream, ctx: &ServeContext) -> Result<()> {
    let check_auth = |req: &ServerRequest,
                      resp: ServerResponse|
     -> std::result::Result<ServerResponse, ErrorResponse> {
        let Some(auth) = &ctx.authenticator else {
            return Ok(resp);
        };
        let accepted = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|x| x.to_str().ok())
            .and_then(basic_credentials)
            .map_or(false, |(username, password)| {
                catch_unwind(AssertUnwindSafe(|| auth(&username, &password))).unwrap_or(false)
            });
        if accepted {
            return Ok(resp);
        }
        cbl_log!(LogDomain::Listener, Info, "client failed to authenticate");
        let mut err = ErrorResponse::new(Some("authentication required".into()));
        *err.status_mut() = StatusCode::UNAUTHORIZED;
        err.headers_mut().insert(
            WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"couchbase-lite\""),
        );
        Err(err)
    };
    let mut ws = accept_hdr_async(stream, check_auth)
        .await
        .map_err(tungstenite_err_to_cbl)?;
    while let Some(message) = ws.next().await {
        let request = match message.map_err(tungstenite_err_to_cbl)? {
            Message::Text(text) => text,
            Message::Binary(data) => String::from_utf8(data).map_err(|_| Error::InvalidUtf8)?,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };
        let peer = ctx.peer.clone();
        let reply = tokio::task::spawn_blocking(move || peer.handle_message(&request))
            .await
            .map_err(|err| Error::LogicError(format!("request handler failed: {err}")))?;
        ws.send(Message::Text(reply))
            .await
            .map_err(tungstenite_err_to_cbl)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_auth_encode() {
        assert_eq!(
            "Basic Ym9iOnNlY3JldA==",
            http_basic_auth_header("bob", "secret")
        );
        assert_eq!(
            Some(("bob".to_string(), "secret".to_string())),
            basic_credentials("Basic Ym9iOnNlY3JldA==")
        );
        assert_eq!(None, basic_credentials("Bearer Ym9iOnNlY3JldA=="));
        assert_eq!(None, basic_credentials("Basic !!!"));
    }

    #[test]
    fn test_proxy_status() {
        assert_eq!(
            Some(200),
            proxy_status(b"HTTP/1.1 200 Connection established\r\n\r\n")
        );
        assert_eq!(
            Some(407),
            proxy_status(b"HTTP/1.0 407 Proxy Authentication Required\r\nX: y\r\n\r\n")
        );
        assert_eq!(None, proxy_status(b"SSH-2.0-OpenSSH\r\n\r\n"));
    }

    #[test]
    fn test_io_errors_mapping() {
        let refused = io_err_to_cbl(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(
            CblError::network(NetworkErrorCode::ConnectionRefused),
            refused.cbl_error()
        );
        assert!(refused.cbl_error().is_transient());
        let lookup = io_err_to_cbl(io::Error::new(io::ErrorKind::Other, "failed to lookup"));
        assert_eq!(
            CblError::network(NetworkErrorCode::UnknownHost),
            lookup.cbl_error()
        );
        assert!(!lookup.cbl_error().is_transient());
    }
}
