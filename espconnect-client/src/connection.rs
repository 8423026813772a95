//! Connection management.
//!
//! A [`Connection`] owns one WebSocket to the server. After the socket opens
//! the server sends a plain-text header block; only once it reports status
//! 200 does structured traffic flow. States move
//! `Disconnected -> Connecting -> AwaitingHandshake -> Ready` and fall back
//! to `Disconnected` on close, error or [`Connection::stop`].

use crate::delegate::ConnectionDelegate;
use crate::error::ClientError;
use crate::tls::create_client_config;
use base64::Engine as _;
use espconnect_protocol::{codec, HandshakeHeaders, HandshakeOutcome, CONNECT_PATH};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, WebSocketStream};
use url::Url;

/// Default delay before reconnecting after the socket drops.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// TLS configuration for `wss://` connections.
#[derive(Debug, Clone, Default)]
pub struct TlsClientConfig {
    /// Path to PEM-encoded CA certificate(s) for server verification.
    /// If None, the bundled webpki roots are used.
    pub ca_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client certificate (for mTLS).
    pub client_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client private key (for mTLS).
    pub client_key_path: Option<PathBuf>,
    /// Skip server certificate verification (INSECURE - development only).
    pub insecure: bool,
}

impl TlsClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self
    }

    pub fn with_insecure(mut self) -> Self {
        self.insecure = true;
        self
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    /// 0 selects 443 or 80 depending on `secure`.
    pub port: u16,
    /// Path prefix in front of the connect endpoint.
    pub path: String,
    pub secure: bool,
    /// Sent as the `access_token` query parameter.
    pub access_token: Option<String>,
    /// Incoming and outgoing server thread counts (`_threads`).
    pub threads: Option<(u32, u32)>,
    /// Full `Authorization` value sent when the server answers 401.
    pub authorization: Option<String>,
    /// Zero disables automatic reconnection.
    pub reconnect_interval: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub tls: TlsClientConfig,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            path: String::new(),
            secure: false,
            access_token: None,
            threads: None,
            authorization: None,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            tls: TlsClientConfig::default(),
        }
    }

    /// Parses a server URL. `ws`, `http` and `esp` schemes are plain,
    /// `wss`, `https` and `esps` are secure. A trailing connect endpoint in
    /// the path is tolerated, and an `access_token` query parameter is kept.
    pub fn from_url(url: &str) -> Result<Self, ClientError> {
        let parsed = Url::parse(url)
            .map_err(|e| ClientError::Config(format!("invalid url '{}': {}", url, e)))?;

        let secure = match parsed.scheme() {
            "ws" | "http" | "esp" => false,
            "wss" | "https" | "esps" => true,
            other => {
                return Err(ClientError::Config(format!(
                    "unsupported url scheme '{}'",
                    other
                )))
            }
        };

        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ClientError::Config(format!("url '{}' has no host", url)))?;

        let mut config = Self::new(host, parsed.port().unwrap_or(0));
        config.secure = secure;

        let path = parsed.path().trim_matches('/');
        let path = path.strip_suffix(CONNECT_PATH).unwrap_or(path);
        config.path = path.trim_matches('/').to_string();

        config.access_token = parsed
            .query_pairs()
            .find(|(k, _)| k == "access_token")
            .map(|(_, v)| v.into_owned());

        Ok(config)
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into().trim_matches('/').to_string();
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_threads(mut self, incoming: u32, outgoing: u32) -> Self {
        self.threads = Some((incoming, outgoing));
        self
    }

    pub fn with_bearer(mut self, token: &str) -> Self {
        self.authorization = Some(format!("Bearer {}", token));
        self
    }

    /// `credentials` is the base64 form; see [`basic_credentials`].
    pub fn with_basic(mut self, credentials: &str) -> Self {
        self.authorization = Some(format!("Basic {}", credentials));
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_tls(mut self, tls: TlsClientConfig) -> Self {
        self.tls = tls;
        self.secure = true;
        self
    }

    pub fn effective_port(&self) -> u16 {
        match (self.port, self.secure) {
            (0, true) => 443,
            (0, false) => 80,
            (port, _) => port,
        }
    }

    /// `ws(s)://host:port[/path]/eventStreamProcessing/v1/connect[?query]`.
    pub fn connect_url(&self) -> Result<Url, ClientError> {
        if self.host.is_empty() {
            return Err(ClientError::Config("no server host configured".to_string()));
        }

        let scheme = if self.secure { "wss" } else { "ws" };
        let mut text = format!("{}://{}:{}/", scheme, self.host, self.effective_port());
        if !self.path.is_empty() {
            text.push_str(&self.path);
            text.push('/');
        }
        text.push_str(CONNECT_PATH);

        let mut url = Url::parse(&text)
            .map_err(|e| ClientError::Config(format!("invalid connect url '{}': {}", text, e)))?;

        if self.access_token.is_some() || self.threads.is_some() {
            let mut query = url.query_pairs_mut();
            if let Some(ref token) = self.access_token {
                query.append_pair("access_token", token);
            }
            if let Some((incoming, outgoing)) = self.threads {
                query.append_pair("_threads", &format!("{},{}", incoming, outgoing));
            }
        }

        Ok(url)
    }
}

/// Base64 `user:password`, the form expected by [`Connection::set_basic`].
pub fn basic_credentials(user: &str, password: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, password))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingHandshake,
    Ready,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingHandshake => "awaiting-handshake",
            ConnectionState::Ready => "ready",
        };
        f.write_str(name)
    }
}

struct Inner {
    state: ConnectionState,
    headers: HandshakeHeaders,
    authorization: Option<String>,
    /// Set once the stored credential was resent for the current socket.
    credential_resent: bool,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    reader: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    /// Bumped on every start and stop; tasks of older sockets check it
    /// before touching shared state.
    generation: u64,
}

enum HandshakeStep {
    Complete(HandshakeHeaders),
    Resend(String),
    Authenticate { scheme: String, challenge: String },
    Ignored(Option<u16>),
}

/// A connection to an ESP server.
pub struct Connection {
    config: ConnectionConfig,
    delegate: Arc<dyn ConnectionDelegate>,
    inner: Mutex<Inner>,
    me: Weak<Connection>,
    reconnects: AtomicU64,
}

impl Connection {
    /// Creates a new connection (not yet started).
    pub fn new(config: ConnectionConfig, delegate: Arc<dyn ConnectionDelegate>) -> Arc<Self> {
        let authorization = config.authorization.clone();
        Arc::new_cyclic(|me| Self {
            config,
            delegate,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                headers: HandshakeHeaders::new(),
                authorization,
                credential_resent: false,
                outbound: None,
                reader: None,
                reconnect_timer: None,
                generation: 0,
            }),
            me: me.clone(),
            reconnects: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Whether a socket is open, handshake or not.
    pub fn is_connected(&self) -> bool {
        self.inner.lock().outbound.is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Number of reconnects scheduled so far.
    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Opens the socket. No-op when already ready. A scheduled reconnect is
    /// cancelled.
    pub async fn start(&self) -> Result<(), ClientError> {
        if let Some(timer) = self.inner.lock().reconnect_timer.take() {
            timer.abort();
        }
        self.open().await
    }

    /// Entry point of the reconnect timer. The timer releases its own handle
    /// instead of aborting itself.
    async fn start_from_timer(&self) -> Result<(), ClientError> {
        self.inner.lock().reconnect_timer = None;
        self.open().await
    }

    async fn open(&self) -> Result<(), ClientError> {
        let generation = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Ready {
                return Ok(());
            }
            if let Some(reader) = inner.reader.take() {
                reader.abort();
            }
            Self::clear(&mut inner);
            inner.generation += 1;
            inner.state = ConnectionState::Connecting;
            inner.generation
        };

        let url = match self.config.connect_url() {
            Ok(url) => url,
            Err(e) => {
                tracing::error!("Cannot start connection: {}", e);
                self.inner.lock().state = ConnectionState::Disconnected;
                return Err(e);
            }
        };

        tracing::debug!(
            "Connecting to {}:{}/{}",
            self.config.host,
            self.config.effective_port(),
            self.config.path
        );

        match self.open_socket(&url).await {
            Ok(ws) => {
                self.attach(ws, generation);
                Ok(())
            }
            Err(e) => {
                self.teardown(generation, Some(clone_for_report(&e)));
                Err(e)
            }
        }
    }

    async fn open_socket(
        &self,
        url: &Url,
    ) -> Result<
        WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        ClientError,
    > {
        let connector = if self.config.secure {
            Some(Connector::Rustls(create_client_config(&self.config.tls)?))
        } else {
            None
        };

        let connect =
            tokio_tungstenite::connect_async_tls_with_config(url.as_str(), None, true, connector);
        let (ws, response) = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| {
                tracing::debug!("Connection timeout");
                ClientError::Timeout
            })?
            .map_err(|e| ClientError::WebSocket(e.to_string()))?;

        tracing::debug!("WebSocket upgrade complete (HTTP {})", response.status());
        Ok(ws)
    }

    /// Takes ownership of an open socket and spawns its reader and writer.
    pub(crate) fn attach<S>(&self, ws: WebSocketStream<S>, generation: u64)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        // Ends when every sender is dropped, then closes the socket.
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    tracing::debug!("Write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let mut inner = self.inner.lock();
        if inner.generation != generation {
            tracing::debug!("Discarding socket of a superseded start");
            return;
        }

        let me = self.me.clone();
        let reader = tokio::spawn(async move {
            let error = loop {
                let next = stream.next().await;
                let Some(conn) = me.upgrade() else {
                    return;
                };
                match next {
                    Some(Ok(Message::Text(text))) => conn.handle_text(text.as_str()),
                    Some(Ok(Message::Binary(data))) => conn.handle_binary(&data),
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!("Server closed the socket: {:?}", frame);
                        break None;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Some(ClientError::WebSocket(e.to_string())),
                    None => break None,
                }
            };
            if let Some(conn) = me.upgrade() {
                conn.teardown(generation, error);
            }
        });

        inner.outbound = Some(tx);
        inner.reader = Some(reader);
        inner.state = ConnectionState::AwaitingHandshake;
        drop(inner);

        tracing::info!(
            "Connected to {}:{}, awaiting handshake",
            self.config.host,
            self.config.effective_port()
        );
        self.delegate.ready();
    }

    /// Routes a text frame to the handshake parser or, once ready, to the
    /// delegate.
    pub(crate) fn handle_text(&self, text: &str) {
        let step = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Ready {
                drop(inner);
                self.delegate.message(text);
                return;
            }
            if !inner.headers.feed(text) {
                return;
            }
            match inner.headers.outcome() {
                HandshakeOutcome::Pending => return,
                HandshakeOutcome::Complete => {
                    inner.state = ConnectionState::Ready;
                    HandshakeStep::Complete(inner.headers.clone())
                }
                HandshakeOutcome::Unauthorized { scheme, challenge } => {
                    inner.headers.rearm();
                    match inner.authorization.clone() {
                        Some(auth) if !inner.credential_resent => {
                            inner.credential_resent = true;
                            HandshakeStep::Resend(auth)
                        }
                        _ => HandshakeStep::Authenticate { scheme, challenge },
                    }
                }
                HandshakeOutcome::Other { status } => {
                    inner.headers.rearm();
                    HandshakeStep::Ignored(status)
                }
            }
        };

        match step {
            HandshakeStep::Complete(headers) => {
                tracing::info!("Handshake complete");
                self.delegate.handshake_complete(&headers);
            }
            HandshakeStep::Resend(auth) => {
                tracing::debug!("Server requested authentication, sending stored credentials");
                self.send(&auth);
            }
            HandshakeStep::Authenticate { scheme, challenge } => {
                match self.delegate.authenticator() {
                    Some(authenticator) => {
                        tracing::debug!("Requesting '{}' credentials", scheme);
                        authenticator.authenticate(self, &scheme);
                    }
                    None => self.fail(ClientError::AuthRequired { scheme, challenge }),
                }
            }
            HandshakeStep::Ignored(status) => {
                tracing::warn!("Ignoring handshake block with status {:?}", status);
            }
        }
    }

    /// Decodes a binary frame for the delegate. Frames arriving before the
    /// handshake completes are dropped.
    pub(crate) fn handle_binary(&self, data: &[u8]) {
        let state = self.state();
        if state != ConnectionState::Ready {
            tracing::debug!("Dropping binary frame received while {}", state);
            return;
        }
        match codec::decode(data) {
            Ok(value) => self.delegate.data(value),
            Err(e) => tracing::warn!("Dropping undecodable binary frame: {}", e),
        }
    }

    /// Clears socket state after the transport ended on its own.
    fn teardown(&self, generation: u64, error: Option<ClientError>) {
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            inner.reader = None;
            Self::clear(&mut inner);
        }

        let retry = !self.config.reconnect_interval.is_zero()
            && error
                .as_ref()
                .map_or(true, |e| !e.is_fatal() && !matches!(e, ClientError::TlsConfig(_)));

        match &error {
            Some(e) => {
                tracing::warn!("Connection lost: {}", e);
                self.delegate.error(e);
            }
            None => tracing::info!("Connection closed"),
        }
        self.delegate.closed();

        if retry {
            self.reconnect(self.config.reconnect_interval);
        }
    }

    /// Fatal failure: tear down without reconnecting.
    fn fail(&self, error: ClientError) {
        tracing::error!("Connection failed: {}", error);
        self.shutdown();
        self.delegate.error(&error);
        self.delegate.closed();
    }

    fn clear(inner: &mut Inner) {
        inner.outbound = None;
        inner.headers.clear();
        inner.credential_resent = false;
        inner.state = ConnectionState::Disconnected;
    }

    fn shutdown(&self) -> bool {
        let mut inner = self.inner.lock();
        if let Some(timer) = inner.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(reader) = inner.reader.take() {
            reader.abort();
        }
        inner.generation += 1;
        let live = inner.outbound.is_some();
        Self::clear(&mut inner);
        live
    }

    /// Closes the socket and cancels any scheduled reconnect. Queued frames
    /// are still flushed. Returns whether a socket was open.
    pub fn stop(&self) -> bool {
        let live = self.shutdown();
        if live {
            tracing::info!("Connection stopped");
            self.delegate.closed();
        }
        live
    }

    pub async fn restart(&self) -> Result<(), ClientError> {
        self.stop();
        self.start().await
    }

    /// Schedules one `start()` after `interval`. Returns false when a
    /// reconnect is already pending or the connection is ready.
    pub fn reconnect(&self, interval: Duration) -> bool {
        let mut inner = self.inner.lock();
        if inner.reconnect_timer.is_some() || inner.state == ConnectionState::Ready {
            return false;
        }

        self.reconnects.fetch_add(1, Ordering::SeqCst);
        tracing::info!("Reconnecting in {:?}", interval);

        let me = self.me.clone();
        inner.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(conn) = me.upgrade() {
                if let Err(e) = conn.start_from_timer().await {
                    tracing::warn!("Reconnect attempt failed: {}", e);
                }
            }
        }));
        true
    }

    pub fn is_reconnect_pending(&self) -> bool {
        self.inner.lock().reconnect_timer.is_some()
    }

    // =========================================================================
    // Credentials
    // =========================================================================

    /// Stores an `Authorization` value. While a handshake is in progress it is
    /// sent right away.
    pub fn set_authorization(&self, value: impl Into<String>) {
        let value = value.into();
        let send_now = {
            let mut inner = self.inner.lock();
            inner.authorization = Some(value.clone());
            inner.state == ConnectionState::AwaitingHandshake && inner.outbound.is_some()
        };
        if send_now {
            self.send(&value);
        }
    }

    pub fn set_bearer(&self, token: &str) {
        self.set_authorization(format!("Bearer {}", token));
    }

    /// `credentials` is the base64 form; see [`basic_credentials`].
    pub fn set_basic(&self, credentials: &str) {
        self.set_authorization(format!("Basic {}", credentials));
    }

    pub fn authorization(&self) -> Option<String> {
        self.inner.lock().authorization.clone()
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Sends a text frame. Returns false, without error, when no socket is open.
    pub fn send(&self, text: &str) -> bool {
        self.enqueue(Message::text(text.to_string()))
    }

    pub fn send_object(&self, value: &Value) -> bool {
        match serde_json::to_string(value) {
            Ok(text) => self.send(&text),
            Err(e) => {
                tracing::warn!("Cannot serialize outbound object: {}", e);
                false
            }
        }
    }

    /// Sends `value` in the binary encoding.
    pub fn send_binary(&self, value: &Value) -> bool {
        self.enqueue(Message::binary(codec::Encoder::encode_json(value)))
    }

    fn enqueue(&self, message: Message) -> bool {
        let outbound = self.inner.lock().outbound.clone();
        match outbound {
            Some(tx) => tx.send(message).is_ok(),
            None => {
                tracing::debug!("Dropping outbound frame: not connected");
                false
            }
        }
    }

    // =========================================================================
    // Handshake headers
    // =========================================================================

    pub fn headers(&self) -> Vec<(String, String)> {
        let inner = self.inner.lock();
        let mut headers: Vec<_> = inner
            .headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        headers.sort();
        headers
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.inner.lock().headers.get(name).map(str::to_string)
    }

    /// Installs a fake socket whose outbound frames land in the returned channel.
    #[cfg(test)]
    pub(crate) fn install_test_socket(&self) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        Self::clear(&mut inner);
        inner.generation += 1;
        inner.outbound = Some(tx);
        inner.state = ConnectionState::AwaitingHandshake;
        rx
    }

    #[cfg(test)]
    pub(crate) fn simulate_transport_close(&self) {
        let generation = self.inner.lock().generation;
        self.teardown(generation, None);
    }
}

/// Copy of a start failure for the delegate; the caller keeps the real error.
fn clone_for_report(error: &ClientError) -> ClientError {
    match error {
        ClientError::Timeout => ClientError::Timeout,
        ClientError::Config(m) => ClientError::Config(m.clone()),
        ClientError::TlsConfig(m) => ClientError::TlsConfig(m.clone()),
        other => ClientError::WebSocket(other.to_string()),
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(timer) = inner.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(reader) = inner.reader.take() {
            reader.abort();
        }
    }
}
