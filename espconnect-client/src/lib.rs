//! # espconnect-client
//!
//! Client library for event stream processing servers.
//!
//! This crate provides:
//! - A WebSocket connection with the handshake state machine and reconnects
//! - A protocol engine correlating requests with responses
//! - Event stream and event collection subscriptions, and publishers
//! - Server stats and log aggregation
//! - The project / window model, configuration and a synthetic event source

pub mod client;
pub mod config;
pub mod connection;
pub mod datasource;
pub mod delegate;
pub mod engine;
pub mod error;
pub mod event_collection;
pub mod event_stream;
pub mod eventsource;
pub mod http;
pub mod model;
pub mod options;
pub mod pending;
pub mod publisher;
pub mod stats;
pub mod tls;

pub use client::{Client, ModelOptions};
pub use config::{Config, ConfigError};
pub use connection::{Connection, ConnectionConfig, ConnectionState, TlsClientConfig};
pub use datasource::{Datasource, DatasourceKind, DatasourceOptions, Row};
pub use delegate::{
    Authenticator, ConnectionDelegate, DatasourceDelegate, LogDelegate, ProjectUpdateDelegate,
    SchemaDelegate, SchemaSource, StatsDelegate,
};
pub use engine::{LinkState, ProtocolEngine, ProtocolStrategy};
pub use error::ClientError;
pub use event_collection::EventCollection;
pub use event_stream::EventStream;
pub use eventsource::{FieldGenerator, GeneratedField, SourceOptions, SyntheticSource};
pub use http::{HttpClient, HttpResponse};
pub use model::{Model, Window, WindowClass};
pub use options::Options;
pub use pending::ResponseBody;
pub use publisher::{Publisher, PublisherOptions};
pub use stats::{Log, LogEntry, Stats, StatsOptions, StatsSnapshot};
