//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::datasource::{Datasource, DatasourceOptions};
use crate::delegate::{Authenticator, DatasourceDelegate, ProjectUpdateDelegate};
use crate::engine::{server_error, EngineConfig, ProtocolEngine};
use crate::error::ClientError;
use crate::event_collection::EventCollection;
use crate::event_stream::EventStream;
use crate::http::HttpClient;
use crate::model::Model;
use crate::options::Options;
use crate::pending::ResponseBody;
use crate::publisher::{Publisher, PublisherOptions};
use crate::stats::{Log, Stats};
use base64::Engine as _;
use espconnect_protocol::{
    new_request_id, ProtocolError, ProtocolVersion, Request, Verb, XmlElement,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Options of the `model` request.
#[derive(Debug, Clone)]
pub struct ModelOptions {
    /// Include window schemas.
    pub schema: bool,
    pub index: bool,
    pub xml: bool,
    /// Restrict to one project.
    pub name: Option<String>,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            schema: false,
            index: true,
            xml: false,
            name: None,
        }
    }
}

/// High-level client for an ESP server.
pub struct Client {
    engine: Arc<ProtocolEngine>,
    conn: Arc<Connection>,
}

impl Client {
    /// Creates a client (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        Self::build(config, None)
    }

    /// Creates a client that asks `authenticator` for credentials when the
    /// server requires them and none are configured.
    pub fn with_authenticator(config: ConnectionConfig, authenticator: Arc<dyn Authenticator>) -> Self {
        Self::build(config, Some(authenticator))
    }

    fn build(config: ConnectionConfig, authenticator: Option<Arc<dyn Authenticator>>) -> Self {
        let engine = ProtocolEngine::new(
            EngineConfig {
                request_timeout: config.request_timeout,
                ..EngineConfig::default()
            },
            authenticator,
        );
        let conn = Connection::new(config, engine.clone());
        engine.attach(&conn);
        Self { engine, conn }
    }

    /// Creates a client, opens the socket and waits for the handshake.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        let timeout = config.connect_timeout;
        let client = Self::new(config);
        client.start().await?;
        client.wait_ready(timeout).await?;
        Ok(client)
    }

    pub async fn start(&self) -> Result<(), ClientError> {
        self.conn.start().await
    }

    pub async fn wait_ready(&self, timeout: Duration) -> Result<ProtocolVersion, ClientError> {
        self.engine.wait_ready(timeout).await
    }

    /// Closes the socket and cancels reconnection.
    pub fn stop(&self) -> bool {
        self.conn.stop()
    }

    pub fn is_ready(&self) -> bool {
        self.engine.is_ready()
    }

    pub fn version(&self) -> ProtocolVersion {
        self.engine.strategy().version()
    }

    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn set_bearer(&self, token: &str) {
        self.conn.set_bearer(token);
    }

    pub fn set_basic(&self, credentials: &str) {
        self.conn.set_basic(credentials);
    }

    /// Sends `{"connection": {"action": "close"}}`; the server then drops the socket.
    pub fn close(&self) -> bool {
        self.engine
            .send(&Request::new(Verb::Connection).with_action("close"))
    }

    // =========================================================================
    // Helper methods
    // =========================================================================

    fn request_for(verb: Verb) -> Request {
        Request::new(verb).with_id(new_request_id())
    }

    /// Sends a request and turns a non-zero response code into an error.
    async fn request(&self, request: Request) -> Result<ResponseBody, ClientError> {
        let body = self.engine.request(request).await?;
        if body.code() != 0 {
            return Err(server_error(&body).into());
        }
        Ok(body)
    }

    // =========================================================================
    // Projects
    // =========================================================================

    /// Loads project XML under `name`. `options` are copied into the request.
    pub async fn load_project(
        &self,
        name: &str,
        data: &str,
        options: &Options,
    ) -> Result<(), ClientError> {
        self.load(Verb::Project, name, data, options).await
    }

    pub async fn load_router(
        &self,
        name: &str,
        data: &str,
        options: &Options,
    ) -> Result<(), ClientError> {
        self.load(Verb::Router, name, data, options).await
    }

    async fn load(
        &self,
        verb: Verb,
        name: &str,
        data: &str,
        options: &Options,
    ) -> Result<(), ClientError> {
        tracing::info!("Loading {} {} ({} bytes)", verb, name, data.len());
        let request = Self::request_for(verb)
            .with_action("load")
            .with("name", name)
            .with("data", base64::engine::general_purpose::STANDARD.encode(data))
            .with_options(options.as_map());
        self.request(request).await?;
        Ok(())
    }

    /// Fetches project XML over HTTP and loads it.
    pub async fn load_project_from(
        &self,
        name: &str,
        url: &str,
        options: &Options,
    ) -> Result<(), ClientError> {
        let data = self.http()?.fetch_text(url).await?;
        self.load_project(name, &data, options).await
    }

    pub async fn load_router_from(
        &self,
        name: &str,
        url: &str,
        options: &Options,
    ) -> Result<(), ClientError> {
        let data = self.http()?.fetch_text(url).await?;
        self.load_router(name, &data, options).await
    }

    fn http(&self) -> Result<HttpClient, ClientError> {
        HttpClient::new(self.conn.config().request_timeout)
    }

    pub async fn delete_project(&self, name: &str) -> Result<(), ClientError> {
        tracing::info!("Deleting project {}", name);
        let request = Self::request_for(Verb::Project)
            .with_action("delete")
            .with("name", name);
        self.request(request).await?;
        Ok(())
    }

    /// XML definition of one project, or of the whole server when `name` is None.
    pub async fn project_xml(
        &self,
        name: Option<&str>,
        options: &Options,
    ) -> Result<XmlElement, ClientError> {
        let mut request = Self::request_for(Verb::Xml);
        if let Some(name) = name {
            request = request.with("name", name);
        }
        match self.request(request.with_options(options.as_map())).await? {
            ResponseBody::Xml(root) => {
                let project = if name.is_some() {
                    root.find(".//project").cloned()
                } else {
                    None
                };
                Ok(project.unwrap_or(root))
            }
            ResponseBody::Json(body) => xml_member(&body),
        }
    }

    /// Project, continuous query and window graph of the server.
    pub async fn model(&self, options: &ModelOptions) -> Result<Model, ClientError> {
        let mut request = Self::request_for(Verb::Model)
            .with("schema", options.schema)
            .with("index", options.index)
            .with("xml", options.xml);
        if let Some(ref name) = options.name {
            request = request.with("name", name.as_str());
        }
        match self.request(request).await? {
            ResponseBody::Xml(root) => Ok(Model::from_xml(&root)),
            ResponseBody::Json(body) => Ok(Model::from_xml(&xml_member(&body)?)),
        }
    }

    // =========================================================================
    // Server utilities
    // =========================================================================

    /// Logging contexts and their levels.
    pub async fn loggers(&self) -> Result<ResponseBody, ClientError> {
        let body = self.request(Self::request_for(Verb::Loggers)).await?;
        Ok(contexts(body))
    }

    pub async fn set_logger(&self, context: &str, level: &str) -> Result<ResponseBody, ClientError> {
        let request = Self::request_for(Verb::Loggers)
            .with("context", context)
            .with("level", level);
        let body = self.request(request).await?;
        Ok(contexts(body))
    }

    /// Asks the server for `num` fresh identifiers.
    pub async fn guids(&self, num: Option<u32>) -> Result<Vec<String>, ClientError> {
        let mut request = Self::request_for(Verb::Guids);
        if let Some(num) = num {
            request = request.with("num", num);
        }
        let guids = match self.request(request).await? {
            ResponseBody::Xml(root) => root.find_all("./guid").iter().map(|g| g.text()).collect(),
            ResponseBody::Json(body) => match body.get("guids").or_else(|| body.get("guid")) {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                Some(Value::String(one)) => vec![one.clone()],
                _ => Vec::new(),
            },
        };
        Ok(guids)
    }

    /// Fetches `url` through the server. The payload comes back base64
    /// encoded; `decode` turns it back into text.
    pub async fn get(&self, url: &str, decode: bool) -> Result<String, ClientError> {
        let request = Self::request_for(Verb::Get)
            .with("url", url)
            .with("format", "ubjson");
        let body = self.request(request).await?;
        let data = match &body {
            ResponseBody::Json(v) => v.get("data").and_then(Value::as_str).map(str::to_string),
            ResponseBody::Xml(x) => x.child_text("data"),
        }
        .ok_or(ClientError::Protocol(ProtocolError::MissingField("data")))?;

        if !decode {
            return Ok(data);
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .map_err(|e| ProtocolError::InvalidEnvelope(format!("bad base64 data: {}", e)))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Removes every event from a window.
    pub fn clear_window(&self, window: &str) -> bool {
        self.engine
            .send(&Request::new(Verb::ClearWindow).with("window", window))
    }

    // =========================================================================
    // Server-side publishing
    // =========================================================================

    /// Has the server inject `data` (CSV by default) into a source window.
    /// Recognised options: `blocksize`, `times`, `pause`, `informat`,
    /// `dateformat`.
    pub async fn publish_data(
        &self,
        window: &str,
        data: &str,
        options: &Options,
    ) -> Result<(), ClientError> {
        let mut request = Self::request_for(Verb::DataPublisher)
            .with("window", window)
            .with("data", base64::engine::general_purpose::STANDARD.encode(data))
            .with("blocksize", options.get_i64("blocksize", 1))
            .with("times", options.get_i64("times", 1))
            .with("pause", options.get_i64("pause", 0))
            .with("informat", options.get_str("informat").unwrap_or("csv"));
        if let Some(format) = options.get_str("dateformat") {
            request = request.with("dateformat", format);
        }
        self.request(request).await?;
        Ok(())
    }

    pub async fn publish_data_from(
        &self,
        window: &str,
        url: &str,
        options: &Options,
    ) -> Result<(), ClientError> {
        let data = self.http()?.fetch_text(url).await?;
        self.publish_data(window, &data, options).await
    }

    /// Has the server read events for `window` from `url` itself.
    pub async fn publish_url(
        &self,
        window: &str,
        url: &str,
        options: &Options,
    ) -> Result<(), ClientError> {
        let mut request = Self::request_for(Verb::UrlPublisher)
            .with("window", window)
            .with("url", url)
            .with("blocksize", options.get_i64("blocksize", 1))
            .with("times", options.get_i64("times", 1));
        for name in ["informat", "dateformat"] {
            if let Some(value) = options.get_str(name) {
                request = request.with(name, value);
            }
        }
        self.request(request).await?;
        Ok(())
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Opens an event stream. The delegate is attached before the
    /// subscription so it sees the first delivery.
    pub async fn event_stream(
        &self,
        options: DatasourceOptions,
        delegate: Option<Arc<dyn DatasourceDelegate>>,
    ) -> Result<Arc<EventStream>, ClientError> {
        let stream = EventStream::new(&self.engine, options);
        if let Some(delegate) = delegate {
            stream.add_delegate(delegate);
        }
        self.engine.open_datasource(stream.clone()).await?;
        Ok(stream)
    }

    pub async fn event_collection(
        &self,
        options: DatasourceOptions,
        delegate: Option<Arc<dyn DatasourceDelegate>>,
    ) -> Result<Arc<EventCollection>, ClientError> {
        let collection = EventCollection::new(&self.engine, options);
        if let Some(delegate) = delegate {
            collection.add_delegate(delegate);
        }
        self.engine.open_datasource(collection.clone()).await?;
        Ok(collection)
    }

    /// Opens a publisher; returns once its window schema is known.
    pub async fn publisher(&self, options: PublisherOptions) -> Result<Arc<Publisher>, ClientError> {
        let publisher = Publisher::new(&self.engine, options);
        self.engine.open_publisher(publisher.clone()).await?;
        Ok(publisher)
    }

    pub fn stats(&self) -> &Arc<Stats> {
        self.engine.stats()
    }

    pub fn log(&self) -> &Arc<Log> {
        self.engine.log()
    }

    pub fn add_project_delegate(&self, delegate: Arc<dyn ProjectUpdateDelegate>) {
        self.engine.add_project_delegate(delegate);
    }

    pub fn remove_project_delegate(&self, delegate: &Arc<dyn ProjectUpdateDelegate>) {
        self.engine.remove_project_delegate(delegate);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.conn.stop();
    }
}

/// JSON answers carry XML documents as text in an `xml` member.
fn xml_member(body: &Value) -> Result<XmlElement, ClientError> {
    let text = body.get("xml").and_then(Value::as_str).ok_or_else(|| {
        ProtocolError::InvalidEnvelope("expected an XML document in the response".to_string())
    })?;
    Ok(XmlElement::parse(text)?)
}

fn contexts(body: ResponseBody) -> ResponseBody {
    match body {
        ResponseBody::Json(mut v) => match v.get_mut("contexts") {
            Some(contexts) => ResponseBody::Json(contexts.take()),
            None => ResponseBody::Json(v),
        },
        xml => xml,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    type ServerSocket = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

    /// Accepts one socket, sends the handshake and hands the socket to `script`.
    async fn serve<F, Fut>(script: F) -> ConnectionConfig
    where
        F: FnOnce(ServerSocket) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::text("status: 200\nversion: 7.1\n\n"))
                .await
                .unwrap();
            script(ws).await;
        });
        ConnectionConfig::new("127.0.0.1", port)
            .with_reconnect_interval(Duration::ZERO)
            .with_request_timeout(Duration::from_secs(5))
    }

    async fn next_request(ws: &mut ServerSocket) -> Value {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(t) => return serde_json::from_str(t.as_str()).unwrap(),
                Message::Binary(b) => return espconnect_protocol::decode(&b).unwrap(),
                _ => continue,
            }
        }
    }

    async fn reply(ws: &mut ServerSocket, value: Value) {
        ws.send(Message::text(value.to_string())).await.unwrap();
    }

    #[tokio::test]
    async fn test_load_project_end_to_end() {
        let config = serve(|mut ws| async move {
            let request = next_request(&mut ws).await;
            let body = &request["project"];
            assert_eq!(body["action"], "load");
            assert_eq!(body["name"], "trades");
            assert_eq!(body["overwrite"], true);
            let data = base64::engine::general_purpose::STANDARD
                .decode(body["data"].as_str().unwrap())
                .unwrap();
            assert_eq!(data, b"<project/>");
            reply(
                &mut ws,
                json!({"load-project": {"@id": body["@id"], "@code": 0}}),
            )
            .await;

            let request = next_request(&mut ws).await;
            let id = request["project"]["@id"].clone();
            reply(
                &mut ws,
                json!({"error": {"@id": id, "text": "no such project",
                                 "details": [{"detail": "ghost"}]}}),
            )
            .await;
            let _ = ws.next().await;
        })
        .await;

        let client = Client::connect(config).await.unwrap();
        assert!(client.is_ready());
        assert_eq!(client.version(), ProtocolVersion::V7);

        client
            .load_project("trades", "<project/>", &Options::new().with("overwrite", true))
            .await
            .unwrap();

        let err = client.delete_project("ghost").await.unwrap_err();
        assert_eq!(err.to_string(), "server error: no such project\nghost");
        assert!(client.engine().pending().is_empty());
    }

    #[tokio::test]
    async fn test_non_zero_code_is_an_error() {
        let config = serve(|mut ws| async move {
            let request = next_request(&mut ws).await;
            let id = request["router"]["@id"].clone();
            reply(
                &mut ws,
                json!({"load-router": {"@id": id, "@code": 3, "text": "bad router"}}),
            )
            .await;
            let _ = ws.next().await;
        })
        .await;

        let client = Client::connect(config).await.unwrap();
        let err = client
            .load_router("r", "<router/>", &Options::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Server { ref text, .. } if text == "bad router"));
    }

    #[tokio::test]
    async fn test_model_guids_and_get() {
        let config = serve(|mut ws| async move {
            let request = next_request(&mut ws).await;
            let id = request["model"]["@id"].as_str().unwrap().to_string();
            assert_eq!(request["model"]["index"], true);
            ws.send(Message::text(format!(
                "<model id=\"{}\"><project name=\"p\"><contquery name=\"cq\">\
                 <windows><window-source name=\"src\"/></windows></contquery></project></model>",
                id
            )))
            .await
            .unwrap();

            let request = next_request(&mut ws).await;
            let id = request["guids"]["@id"].as_str().unwrap().to_string();
            assert_eq!(request["guids"]["num"], 2);
            ws.send(Message::text(format!(
                "<guids id=\"{}\"><guid>a</guid><guid>b</guid></guids>",
                id
            )))
            .await
            .unwrap();

            let request = next_request(&mut ws).await;
            let id = request["get"]["@id"].clone();
            assert_eq!(request["get"]["url"], "file://x.csv");
            let data = base64::engine::general_purpose::STANDARD.encode("1,2\n");
            reply(&mut ws, json!({"get": {"@id": id, "data": data}})).await;
            let _ = ws.next().await;
        })
        .await;

        let client = Client::connect(config).await.unwrap();

        let model = client.model(&ModelOptions::default()).await.unwrap();
        assert!(model.window("p/cq/src").unwrap().is_source());

        assert_eq!(client.guids(Some(2)).await.unwrap(), vec!["a", "b"]);
        assert_eq!(client.get("file://x.csv", true).await.unwrap(), "1,2\n");
    }

    #[tokio::test]
    async fn test_event_stream_end_to_end() {
        let config = serve(|mut ws| async move {
            let request = next_request(&mut ws).await;
            let body = &request["event-stream"];
            assert_eq!(body["action"], "set");
            assert_eq!(body["window"], "p/cq/w");
            let id = body["@id"].clone();
            reply(
                &mut ws,
                json!({"schema": {"@id": id, "fields": [
                    {"@name": "id", "@type": "int64", "@key": "true"}
                ]}}),
            )
            .await;

            let events = json!({"events": {"@id": id, "entries": [{"id": 1}, {"id": 2}]}});
            ws.send(Message::binary(espconnect_protocol::Encoder::encode_json(&events)))
                .await
                .unwrap();
            let _ = ws.next().await;
        })
        .await;

        let client = Client::connect(config).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let delegate: Arc<dyn DatasourceDelegate> = Arc::new(
            move |_: &dyn Datasource, rows: &[crate::datasource::Row], _: bool| {
                let _ = tx.send(rows.len());
            },
        );

        let stream = client
            .event_stream(
                DatasourceOptions::new("p/cq/w").with_binary(true),
                Some(delegate),
            )
            .await
            .unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(stream.len(), 2);
        assert_eq!(stream.schema().key_field_names(), vec!["@counter"]);
    }

    #[tokio::test]
    async fn test_request_before_connect() {
        let client = Client::new(ConnectionConfig::new("127.0.0.1", 1));
        let err = client.guids(None).await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
        assert!(!client.clear_window("p/cq/w"));
    }
}
