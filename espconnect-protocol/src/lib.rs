//! # espconnect-protocol
//!
//! Wire protocol pieces for talking to an event stream processing server.
//!
//! This crate provides:
//! - The compact tagged binary codec used for data frames
//! - Parsing of the plain-text handshake header block
//! - Request envelopes and inbound frame classification
//! - Window schemas, including CSV row conversion
//! - A small XML tree for servers that answer in XML

pub mod codec;
pub mod error;
pub mod handshake;
pub mod message;
pub mod schema;
pub mod xml;

pub use codec::{decode, encode, Decoder, Encoder, WireValue};
pub use error::{CodecError, ProtocolError};
pub use handshake::{HandshakeHeaders, HandshakeOutcome, ProtocolVersion};
pub use message::{
    body_id, classify_text, envelope, new_request_id, FrameKind, Inbound, Request, ServerError,
    Tag, Verb, ID_KEY,
};
pub use schema::{CsvOptions, Field, LogicalType, Schema};
pub use xml::{XmlElement, XmlNode};

/// Path of the connect endpoint on the server.
pub const CONNECT_PATH: &str = "eventStreamProcessing/v1/connect";

/// Default number of events an event stream retains.
pub const DEFAULT_MAX_EVENTS: usize = 50;
