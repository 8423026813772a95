//! Request envelopes and inbound frame classification.
//!
//! Every request is a single-member JSON object `{"<verb>": {...}}`. Requests
//! that expect an answer carry a client-generated `@id` inside the body; the
//! server echoes it so the response can be routed back.

use crate::codec::{self, WireValue};
use crate::error::ProtocolError;
use crate::xml::XmlElement;
use bytes::Bytes;
use serde_json::{Map, Value};
use std::fmt;

pub const ID_KEY: &str = "@id";

/// Outbound request verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Project,
    Router,
    Xml,
    Loggers,
    Guids,
    Model,
    Get,
    EventStream,
    EventCollection,
    Publisher,
    DataPublisher,
    UrlPublisher,
    Stats,
    Logs,
    ProjectStatus,
    ClearWindow,
    Connection,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Project => "project",
            Verb::Router => "router",
            Verb::Xml => "xml",
            Verb::Loggers => "loggers",
            Verb::Guids => "guids",
            Verb::Model => "model",
            Verb::Get => "get",
            Verb::EventStream => "event-stream",
            Verb::EventCollection => "event-collection",
            Verb::Publisher => "publisher",
            Verb::DataPublisher => "data-publisher",
            Verb::UrlPublisher => "url-publisher",
            Verb::Stats => "stats",
            Verb::Logs => "logs",
            Verb::ProjectStatus => "project-status",
            Verb::ClearWindow => "clear-window",
            Verb::Connection => "connection",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level tags of inbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Events,
    Info,
    Schema,
    LoadProject,
    LoadRouter,
    DeleteProject,
    Response,
    UrlPublisher,
    DataPublisher,
    Loggers,
    Xml,
    Guids,
    Model,
    Get,
    Stats,
    Log,
    ProjectLoaded,
    ProjectRemoved,
    Error,
}

impl Tag {
    pub fn parse(name: &str) -> Option<Tag> {
        let tag = match name {
            "events" => Tag::Events,
            "info" => Tag::Info,
            "schema" => Tag::Schema,
            "load-project" => Tag::LoadProject,
            "load-router" => Tag::LoadRouter,
            "delete-project" => Tag::DeleteProject,
            "response" => Tag::Response,
            "url-publisher" => Tag::UrlPublisher,
            "data-publisher" => Tag::DataPublisher,
            "loggers" => Tag::Loggers,
            "xml" => Tag::Xml,
            "guids" => Tag::Guids,
            "model" => Tag::Model,
            "get" => Tag::Get,
            "stats" => Tag::Stats,
            "log" | "logs" => Tag::Log,
            "project-loaded" => Tag::ProjectLoaded,
            "project-removed" => Tag::ProjectRemoved,
            "error" => Tag::Error,
            _ => return None,
        };
        Some(tag)
    }

    /// Tags whose body answers a pending request by `@id`.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Tag::Schema
                | Tag::LoadProject
                | Tag::LoadRouter
                | Tag::DeleteProject
                | Tag::Response
                | Tag::UrlPublisher
                | Tag::DataPublisher
                | Tag::Loggers
                | Tag::Xml
                | Tag::Guids
                | Tag::Model
                | Tag::Get
        )
    }
}

/// A request under construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    verb: Verb,
    body: Map<String, Value>,
}

impl Request {
    pub fn new(verb: Verb) -> Self {
        Self {
            verb,
            body: Map::new(),
        }
    }

    pub fn with_id(self, id: impl Into<String>) -> Self {
        self.with(ID_KEY, id.into())
    }

    pub fn with_action(self, action: &str) -> Self {
        self.with("action", action)
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.body.insert(key.to_string(), value.into());
        self
    }

    /// Copies caller options into the body. Keys already present win.
    pub fn with_options(mut self, options: &Map<String, Value>) -> Self {
        for (k, v) in options {
            if !self.body.contains_key(k) {
                self.body.insert(k.clone(), v.clone());
            }
        }
        self
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn id(&self) -> Option<&str> {
        self.body.get(ID_KEY).and_then(Value::as_str)
    }

    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    pub fn to_json(&self) -> Value {
        let mut outer = Map::with_capacity(1);
        outer.insert(self.verb.as_str().to_string(), Value::Object(self.body.clone()));
        Value::Object(outer)
    }

    pub fn to_json_string(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(&self.to_json())?)
    }

    /// Binary encoding of the envelope.
    pub fn to_binary(&self) -> Bytes {
        codec::Encoder::encode_json(&self.to_json())
    }

    pub fn to_wire(&self) -> WireValue {
        WireValue::from_json(&self.to_json()).unwrap_or(WireValue::Object(Vec::new()))
    }
}

/// Generates an identifier for a request or datasource.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Physical shape of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Json,
    Xml,
    Binary,
}

/// Decides how a text frame is parsed from its first significant character.
pub fn classify_text(text: &str) -> Option<FrameKind> {
    match text.trim_start().chars().next()? {
        '{' | '[' => Some(FrameKind::Json),
        '<' => Some(FrameKind::Xml),
        _ => None,
    }
}

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Json(Value),
    Xml(XmlElement),
    Binary(Value),
}

impl Inbound {
    /// Parses a text frame. `Ok(None)` means the text is neither JSON nor XML.
    pub fn from_text(text: &str) -> Result<Option<Inbound>, ProtocolError> {
        match classify_text(text) {
            Some(FrameKind::Json) => Ok(Some(Inbound::Json(serde_json::from_str(text)?))),
            Some(FrameKind::Xml) => Ok(Some(Inbound::Xml(XmlElement::parse(text)?))),
            _ => Ok(None),
        }
    }

    pub fn from_binary(data: &[u8]) -> Result<Inbound, ProtocolError> {
        Ok(Inbound::Binary(codec::decode(data)?))
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Inbound::Json(_) => FrameKind::Json,
            Inbound::Xml(_) => FrameKind::Xml,
            Inbound::Binary(_) => FrameKind::Binary,
        }
    }
}

/// Splits `{"tag": body}` into its known tag and body.
///
/// When several members are present the first recognised one is used.
pub fn envelope(value: &Value) -> Option<(Tag, &Value)> {
    value
        .as_object()?
        .iter()
        .find_map(|(k, v)| Tag::parse(k).map(|tag| (tag, v)))
}

/// The `@id` of a body, accepting numeric ids as well.
pub fn body_id(body: &Value) -> Option<String> {
    match body.get(ID_KEY)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Error reported by the server for an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    pub text: String,
    pub details: Vec<String>,
}

impl ServerError {
    /// Reads `{"text": "...", "details": [{"detail": "..."}]}`, tolerating
    /// the message under `message` and plain string details.
    pub fn from_json(body: &Value) -> Self {
        let text = body
            .get("text")
            .or_else(|| body.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let details = body
            .get("details")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|d| match d {
                        Value::String(s) => Some(s.clone()),
                        other => other.get("detail").and_then(Value::as_str).map(str::to_string),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self { text, details }
    }

    /// Reads `<message>`/`<text>` and `<details><detail>` children.
    pub fn from_xml(element: &XmlElement) -> Self {
        let text = element
            .find(".//message")
            .or_else(|| element.find(".//text"))
            .map(XmlElement::text)
            .unwrap_or_default();
        let details = element
            .find_all(".//details/detail")
            .into_iter()
            .map(XmlElement::text)
            .collect();
        Self { text, details }
    }

    /// Message text followed by one line per detail.
    pub fn message(&self) -> String {
        let mut out = self.text.clone();
        for d in &self.details {
            out.push('\n');
            out.push_str(d);
        }
        out
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}
