//! Request correlation and inbound dispatch.
//!
//! The engine is the [`ConnectionDelegate`] of a connection. Outbound
//! requests register a one-shot handler under their `@id` before they are
//! sent; inbound frames are classified once and routed either to that
//! handler or to the live datasource, publisher or aggregator they name.

use crate::connection::Connection;
use crate::datasource::Datasource;
use crate::delegate::{Authenticator, ConnectionDelegate, Delegates, ProjectUpdateDelegate};
use crate::error::ClientError;
use crate::pending::{PendingRequests, ResponseBody};
use crate::publisher::Publisher;
use crate::stats::{Log, Stats};
use espconnect_protocol::{
    body_id, envelope, HandshakeHeaders, Inbound, ProtocolError, ProtocolVersion, Request,
    Schema, ServerError, Tag, Verb, XmlElement, ID_KEY,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;

/// Version-specific protocol choices, fixed at handshake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolStrategy {
    version: ProtocolVersion,
}

impl ProtocolStrategy {
    pub fn for_version(version: ProtocolVersion) -> Self {
        Self { version }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// `format` requested for datasource events.
    pub fn event_format(&self, binary: bool) -> &'static str {
        match (self.version, binary) {
            (ProtocolVersion::V7, true) => "ubjson",
            (ProtocolVersion::V7, false) => "json",
            (ProtocolVersion::V6, _) => "xml",
        }
    }

    /// `format` requested for stats updates.
    pub fn stats_format(&self) -> &'static str {
        match self.version {
            ProtocolVersion::V7 => "ubjson",
            ProtocolVersion::V6 => "xml",
        }
    }

    /// Whether publish batches may use the binary encoding.
    pub fn binary_publish(&self) -> bool {
        self.version == ProtocolVersion::V7
    }
}

impl Default for ProtocolStrategy {
    fn default() -> Self {
        Self::for_version(ProtocolVersion::V7)
    }
}

/// Readiness as seen by callers waiting on the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Down,
    Ready(ProtocolVersion),
    /// A fatal error ended the connection.
    Failed(String),
}

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub request_timeout: Duration,
    /// Update interval (ms) for datasources that do not set one.
    pub default_interval: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            default_interval: 0,
        }
    }
}

pub struct ProtocolEngine {
    me: Weak<ProtocolEngine>,
    config: EngineConfig,
    connection: RwLock<Weak<Connection>>,
    pending: PendingRequests,
    datasources: RwLock<HashMap<String, Arc<dyn Datasource>>>,
    publishers: RwLock<HashMap<String, Arc<Publisher>>>,
    stats: Arc<Stats>,
    log: Arc<Log>,
    project_delegates: Delegates<dyn ProjectUpdateDelegate>,
    strategy: RwLock<ProtocolStrategy>,
    link: watch::Sender<LinkState>,
    handshakes: AtomicU64,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl ProtocolEngine {
    pub fn new(config: EngineConfig, authenticator: Option<Arc<dyn Authenticator>>) -> Arc<Self> {
        let (link, _) = watch::channel(LinkState::Down);
        Arc::new_cyclic(|me: &Weak<ProtocolEngine>| Self {
            me: me.clone(),
            config,
            connection: RwLock::new(Weak::new()),
            pending: PendingRequests::new(),
            datasources: RwLock::new(HashMap::new()),
            publishers: RwLock::new(HashMap::new()),
            stats: Arc::new(Stats::new(me.clone())),
            log: Arc::new(Log::new(me.clone())),
            project_delegates: Delegates::default(),
            strategy: RwLock::new(ProtocolStrategy::default()),
            link,
            handshakes: AtomicU64::new(0),
            authenticator,
        })
    }

    /// Points the engine at the connection it sends through.
    pub fn attach(&self, connection: &Arc<Connection>) {
        *self.connection.write() = Arc::downgrade(connection);
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.read().upgrade()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn strategy(&self) -> ProtocolStrategy {
        *self.strategy.read()
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn link_state(&self) -> LinkState {
        self.link.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.link.borrow(), LinkState::Ready(_))
    }

    /// Waits until the handshake completes or the connection fails fatally.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<ProtocolVersion, ClientError> {
        let mut rx = self.link.subscribe();
        let state = {
            let guard = tokio::time::timeout(
                timeout,
                rx.wait_for(|s| !matches!(s, LinkState::Down)),
            )
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|_| ClientError::ConnectionClosed)?;
            guard.clone()
        };
        match state {
            LinkState::Ready(version) => Ok(version),
            LinkState::Failed(message) => Err(ClientError::Fatal(message)),
            LinkState::Down => Err(ClientError::ConnectionClosed),
        }
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Sends a request as JSON. Returns false when the connection is not ready.
    pub fn send(&self, request: &Request) -> bool {
        match self.ready_connection() {
            Some(conn) => conn.send_object(&request.to_json()),
            None => {
                tracing::debug!("Not sending {}: connection not ready", request.verb());
                false
            }
        }
    }

    /// Sends a request in the binary encoding.
    pub fn send_binary(&self, request: &Request) -> bool {
        match self.ready_connection() {
            Some(conn) => conn.send_binary(&request.to_json()),
            None => {
                tracing::debug!("Not sending {}: connection not ready", request.verb());
                false
            }
        }
    }

    fn ready_connection(&self) -> Option<Arc<Connection>> {
        self.connection().filter(|c| c.is_ready())
    }

    /// Sends a request and waits for the response carrying its `@id`.
    pub async fn request(&self, request: Request) -> Result<ResponseBody, ClientError> {
        let id = request
            .id()
            .map(str::to_string)
            .ok_or(ClientError::Protocol(ProtocolError::MissingField(ID_KEY)))?;

        let rx = self.pending.register(&id);
        tracing::debug!("Sending request id={} verb={}", id, request.verb());
        if !self.send(&request) {
            self.pending.remove(&id);
            return Err(ClientError::NotConnected);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Err(_) => {
                tracing::debug!("Request id={} timed out", id);
                self.pending.remove(&id);
                Err(ClientError::Timeout)
            }
            Ok(Err(_)) => {
                tracing::debug!("Request id={} channel closed", id);
                Err(ClientError::ConnectionClosed)
            }
            Ok(Ok(result)) => {
                tracing::debug!("Request id={} got response", id);
                result
            }
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Registers a datasource and subscribes it. Resolves once the server
    /// answered with the schema.
    pub async fn open_datasource(&self, datasource: Arc<dyn Datasource>) -> Result<(), ClientError> {
        let id = datasource.id().to_string();
        self.datasources.write().insert(id.clone(), datasource.clone());

        match self.request(datasource.core().set_request(true, true)).await {
            Ok(body) if body.code() == 0 => {
                tracing::debug!("Datasource {} open on {}", id, datasource.window());
                Ok(())
            }
            Ok(body) => {
                self.datasources.write().remove(&id);
                Err(server_error(&body).into())
            }
            Err(e) => {
                self.datasources.write().remove(&id);
                Err(e)
            }
        }
    }

    pub fn datasource(&self, id: &str) -> Option<Arc<dyn Datasource>> {
        self.datasources.read().get(id).cloned()
    }

    pub fn datasources(&self) -> Vec<Arc<dyn Datasource>> {
        self.datasources.read().values().cloned().collect()
    }

    pub(crate) fn remove_datasource(&self, id: &str) -> bool {
        self.datasources.write().remove(id).is_some()
    }

    /// Registers a publisher and asks for its window schema.
    pub async fn open_publisher(&self, publisher: Arc<Publisher>) -> Result<(), ClientError> {
        let id = publisher.id().to_string();
        self.publishers.write().insert(id.clone(), publisher.clone());

        match self.request(publisher.open_request()).await {
            Ok(body) if body.code() == 0 => Ok(()),
            Ok(body) => {
                self.publishers.write().remove(&id);
                Err(server_error(&body).into())
            }
            Err(e) => {
                self.publishers.write().remove(&id);
                Err(e)
            }
        }
    }

    pub fn publisher(&self, id: &str) -> Option<Arc<Publisher>> {
        self.publishers.read().get(id).cloned()
    }

    pub(crate) fn remove_publisher(&self, id: &str) -> bool {
        self.publishers.write().remove(id).is_some()
    }

    /// Adds a project listener; the first one turns on project notifications.
    pub fn add_project_delegate(&self, delegate: Arc<dyn ProjectUpdateDelegate>) {
        if self.project_delegates.add(delegate) == Some(1) {
            self.send(&Request::new(Verb::ProjectStatus).with("on", true));
        }
    }

    pub fn remove_project_delegate(&self, delegate: &Arc<dyn ProjectUpdateDelegate>) {
        if self.project_delegates.remove(delegate) == Some(0) {
            self.send(&Request::new(Verb::ProjectStatus).with("on", false));
        }
    }

    /// Re-sends every live subscription after a reconnect. Cached rows are
    /// dropped first so the reload does not duplicate them.
    fn resubscribe(&self) {
        let datasources = self.datasources();
        tracing::info!("Restoring {} datasource subscriptions", datasources.len());
        for ds in datasources {
            ds.core().reset(ds.as_dyn());
            self.send(&ds.core().set_request(true, true));
        }

        let publishers: Vec<_> = self.publishers.read().values().cloned().collect();
        for publisher in publishers {
            self.send(&publisher.open_request());
        }

        self.stats.resubscribe();
        self.log.resubscribe();
        if !self.project_delegates.is_empty() {
            self.send(&Request::new(Verb::ProjectStatus).with("on", true));
        }
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    pub fn dispatch(&self, inbound: Inbound) {
        match inbound {
            Inbound::Json(value) | Inbound::Binary(value) => self.dispatch_json(&value),
            Inbound::Xml(root) => self.dispatch_xml(root),
        }
    }

    fn dispatch_json(&self, message: &Value) {
        let Some((tag, body)) = envelope(message) else {
            tracing::warn!("Dropping message with unknown tag");
            return;
        };
        let id = body_id(body);

        match tag {
            Tag::Events => match self.datasource_for(id.as_deref()) {
                Some(ds) => ds.core().handle_events(ds.as_dyn(), body),
                None => tracing::debug!("Events for unknown datasource {:?}", id),
            },
            Tag::Info => match self.datasource_for(id.as_deref()) {
                Some(ds) => ds.core().handle_info(ds.as_dyn(), body),
                None => tracing::debug!("Info for unknown datasource {:?}", id),
            },
            Tag::Schema => match id {
                Some(id) => {
                    self.install_schema(&id, Schema::from_json(body));
                    self.pending.resolve(&id, Ok(ResponseBody::Json(body.clone())));
                }
                None => tracing::warn!("Dropping schema without id"),
            },
            Tag::Stats => self.stats.process_json(body),
            Tag::Log => self.log.process_json(body),
            Tag::ProjectLoaded | Tag::ProjectRemoved => {
                let name = body
                    .get("name")
                    .and_then(Value::as_str)
                    .or_else(|| body.as_str())
                    .unwrap_or("");
                self.notify_project(tag == Tag::ProjectLoaded, name);
            }
            Tag::Error => {
                let error = ServerError::from_json(body);
                self.resolve_error(id, error);
            }
            tag if tag.is_response() => match id {
                Some(id) => {
                    self.pending.resolve(&id, Ok(ResponseBody::Json(body.clone())));
                }
                None => tracing::warn!("Dropping {:?} response without id", tag),
            },
            other => tracing::debug!("Unhandled message {:?}", other),
        }
    }

    fn dispatch_xml(&self, root: XmlElement) {
        let id = root.attr("id").map(str::to_string);

        match root.name.as_str() {
            "schema" => {
                let target = id.or_else(|| root.attr("publisher").map(str::to_string));
                match target {
                    Some(target) => {
                        self.install_schema(&target, Schema::from_xml(&root));
                        self.pending.resolve(&target, Ok(ResponseBody::Xml(root)));
                    }
                    None => tracing::warn!("Dropping schema without id"),
                }
            }
            "events" => match self.datasource_for(id.as_deref()) {
                Some(ds) => ds.core().handle_events_xml(ds.as_dyn(), &root),
                None => tracing::debug!("Events for unknown datasource {:?}", id),
            },
            "info" => match self.datasource_for(id.as_deref()) {
                Some(ds) => ds.core().handle_info(ds.as_dyn(), &attributes_as_json(&root)),
                None => tracing::debug!("Info for unknown datasource {:?}", id),
            },
            "stats" => self.stats.process_xml(&root),
            "log" => self.log.process_xml(&root),
            "publisher" => {
                if root.attr("complete") == Some("true") {
                    match id.as_deref().and_then(|id| self.publisher(id)) {
                        Some(publisher) => publisher.mark_complete(),
                        None => tracing::debug!("Completion for unknown publisher {:?}", id),
                    }
                }
            }
            "project-loaded" | "project-removed" => {
                let loaded = root.name == "project-loaded";
                self.notify_project(loaded, root.attr("name").unwrap_or(""));
            }
            "connection" => tracing::info!("Server connection notice: {}", root),
            "error" => self.resolve_error(id, ServerError::from_xml(&root)),
            name => match id {
                Some(id) if self.pending.contains(&id) => {
                    self.pending.resolve(&id, Ok(ResponseBody::Xml(root)));
                }
                _ => tracing::warn!("Dropping unknown XML message <{}>", name),
            },
        }
    }

    fn datasource_for(&self, id: Option<&str>) -> Option<Arc<dyn Datasource>> {
        id.and_then(|id| self.datasource(id))
    }

    fn install_schema(&self, id: &str, schema: Schema) {
        if let Some(ds) = self.datasource(id) {
            ds.core().install_schema(ds.as_dyn(), schema);
        } else if let Some(publisher) = self.publisher(id) {
            publisher.install_schema(schema);
        } else {
            tracing::debug!("Schema for unknown subscription {}", id);
        }
    }

    fn resolve_error(&self, id: Option<String>, error: ServerError) {
        match id {
            Some(id) if self.pending.contains(&id) => {
                self.pending.resolve(&id, Err(error.into()));
            }
            _ => tracing::warn!("Server error: {}", error),
        }
    }

    fn notify_project(&self, loaded: bool, name: &str) {
        tracing::debug!("Project {} {}", name, if loaded { "loaded" } else { "removed" });
        for delegate in self.project_delegates.snapshot() {
            if loaded {
                delegate.project_loaded(name);
            } else {
                delegate.project_removed(name);
            }
        }
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<ProtocolEngine>> {
        self.me.upgrade()
    }
}

impl ConnectionDelegate for ProtocolEngine {
    fn ready(&self) {
        tracing::debug!("Socket open, waiting for handshake");
    }

    fn handshake_complete(&self, headers: &HandshakeHeaders) {
        let (version, recognised) = headers.protocol_version();
        if !recognised {
            tracing::warn!(
                "Unrecognised server version '{}', assuming {}",
                headers.get("version").unwrap_or(""),
                version
            );
        }
        *self.strategy.write() = ProtocolStrategy::for_version(version);
        tracing::info!("Server ready (protocol {})", version);

        let previous = self.handshakes.fetch_add(1, Ordering::SeqCst);
        self.link.send_replace(LinkState::Ready(version));
        if previous > 0 {
            self.resubscribe();
        }
    }

    fn message(&self, text: &str) {
        match Inbound::from_text(text) {
            Ok(Some(inbound)) => self.dispatch(inbound),
            Ok(None) => tracing::debug!("Ignoring unstructured text frame"),
            Err(e) => tracing::warn!("Dropping malformed message: {}", e),
        }
    }

    fn data(&self, value: Value) {
        self.dispatch_json(&value);
    }

    fn closed(&self) {
        self.pending.fail_all(|| ClientError::ConnectionClosed);
        self.link.send_modify(|state| {
            if !matches!(state, LinkState::Failed(_)) {
                *state = LinkState::Down;
            }
        });
    }

    fn error(&self, error: &ClientError) {
        if error.is_fatal() {
            self.link.send_replace(LinkState::Failed(error.to_string()));
        } else {
            tracing::debug!("Transport error: {}", error);
        }
    }

    fn authenticator(&self) -> Option<&dyn Authenticator> {
        self.authenticator.as_deref()
    }
}

/// Builds the error carried by a non-zero response code.
pub(crate) fn server_error(body: &ResponseBody) -> ServerError {
    let mut error = match body {
        ResponseBody::Json(v) => ServerError::from_json(v),
        ResponseBody::Xml(x) => ServerError::from_xml(x),
    };
    if error.text.is_empty() {
        error.text = format!("request failed with code {}", body.code());
    }
    error
}

fn attributes_as_json(element: &XmlElement) -> Value {
    Value::Object(
        element
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}
