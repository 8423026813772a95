//! Client-side batching of rows injected into a source window.
//!
//! Rows are buffered locally and only sent by an explicit [`Publisher::publish`].
//! The publisher still asks for the window schema on open so CSV input can
//! be converted into typed rows.

use crate::datasource::Row;
use crate::delegate::{Delegates, SchemaDelegate, SchemaSource};
use crate::engine::ProtocolEngine;
use crate::options::Options;
use espconnect_protocol::schema::OPCODE_FIELD;
use espconnect_protocol::{new_request_id, CsvOptions, Request, Schema, Verb};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PublisherOptions {
    /// Source window path, `project/contquery/window`.
    pub window: String,
    pub id: Option<String>,
    /// Publish batches in the binary encoding when the server supports it.
    pub binary: bool,
    pub dateformat: Option<String>,
    pub extra: Options,
}

impl PublisherOptions {
    pub fn new(window: impl Into<String>) -> Self {
        Self {
            window: window.into(),
            id: None,
            binary: false,
            dateformat: None,
            extra: Options::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_binary(mut self, binary: bool) -> Self {
        self.binary = binary;
        self
    }

    pub fn with_dateformat(mut self, format: impl Into<String>) -> Self {
        self.dateformat = Some(format.into());
        self
    }

    pub fn with_option(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.extra.set(name, value);
        self
    }
}

#[derive(Default)]
struct PublisherState {
    schema: Schema,
    buffer: Vec<Row>,
    /// Row under construction between `begin` and `end`.
    current: Option<Row>,
    total: u64,
    /// CSV input waiting for the schema.
    deferred_csv: Option<(String, CsvOptions)>,
}

pub struct Publisher {
    id: String,
    options: PublisherOptions,
    engine: Weak<ProtocolEngine>,
    state: Mutex<PublisherState>,
    complete: AtomicBool,
    schema_delegates: Delegates<dyn SchemaDelegate>,
    me: Weak<Publisher>,
}

impl Publisher {
    /// Creates the publisher. It is opened by [`ProtocolEngine::open_publisher`].
    pub fn new(engine: &Arc<ProtocolEngine>, options: PublisherOptions) -> Arc<Self> {
        let id = options.id.clone().unwrap_or_else(new_request_id);
        Arc::new_cyclic(|me| Self {
            id,
            options,
            engine: Arc::downgrade(engine),
            state: Mutex::new(PublisherState::default()),
            complete: AtomicBool::new(false),
            schema_delegates: Delegates::default(),
            me: me.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn window(&self) -> &str {
        &self.options.window
    }

    pub fn options(&self) -> &PublisherOptions {
        &self.options
    }

    pub fn schema(&self) -> Schema {
        self.state.lock().schema.clone()
    }

    pub(crate) fn open_request(&self) -> Request {
        let mut request = Request::new(Verb::Publisher)
            .with_id(self.id.clone())
            .with_action("set")
            .with("window", self.options.window.clone())
            .with("schema", true);
        if let Some(format) = &self.options.dateformat {
            request = request.with("dateformat", format.clone());
        }
        request.with_options(self.options.extra.as_map())
    }

    // =========================================================================
    // Buffering
    // =========================================================================

    pub fn add(&self, row: Row) {
        self.state.lock().buffer.push(row);
    }

    pub fn add_all(&self, rows: impl IntoIterator<Item = Row>) {
        self.state.lock().buffer.extend(rows);
    }

    /// Starts a row built with [`Publisher::set`] and [`Publisher::end`].
    pub fn begin(&self) {
        self.state.lock().current = Some(Row::new());
    }

    pub fn set(&self, name: &str, value: impl Into<Value>) {
        if let Some(row) = self.state.lock().current.as_mut() {
            row.insert(name.to_string(), value.into());
        }
    }

    /// Buffers the row under construction and starts a new one.
    pub fn end(&self) {
        let mut state = self.state.lock();
        if let Some(row) = state.current.replace(Row::new()) {
            state.buffer.push(row);
        }
    }

    /// Rows waiting to be published.
    pub fn len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows published so far.
    pub fn total(&self) -> u64 {
        self.state.lock().total
    }

    /// Sends the buffered rows as one `publish` action and clears the buffer.
    /// Returns the number of rows sent. Until the schema has arrived nothing
    /// is sent and the rows stay buffered.
    pub fn publish(&self) -> usize {
        let rows = {
            let mut state = self.state.lock();
            if state.schema.is_empty() {
                if !state.buffer.is_empty() {
                    tracing::debug!(
                        "Publisher {} has no schema yet, holding {} rows",
                        self.id,
                        state.buffer.len()
                    );
                }
                return 0;
            }
            std::mem::take(&mut state.buffer)
        };
        self.send_rows(rows)
    }

    fn send_rows(&self, rows: Vec<Row>) -> usize {
        if rows.is_empty() {
            return 0;
        }
        let count = rows.len();

        let Some(engine) = self.engine.upgrade() else {
            tracing::warn!("Publisher {} detached, dropped {} rows", self.id, count);
            return 0;
        };

        let request = Request::new(Verb::Publisher)
            .with_id(self.id.clone())
            .with_action("publish")
            .with("data", Value::Array(rows.into_iter().map(Value::Object).collect()));

        let sent = if self.options.binary && engine.strategy().binary_publish() {
            engine.send_binary(&request)
        } else {
            engine.send(&request)
        };

        if !sent {
            tracing::warn!("Publisher {} not connected, dropped {} rows", self.id, count);
            return 0;
        }
        tracing::debug!("Publisher {} sent {} rows", self.id, count);
        self.state.lock().total += count as u64;
        count
    }

    // =========================================================================
    // CSV
    // =========================================================================

    /// Publishes CSV text in blocks of `options.blocksize` rows, waiting
    /// `options.pause` milliseconds between blocks. Input that arrives before
    /// the schema is held and sent once the schema is known.
    /// Returns the number of rows sent now; paced blocks after the first are
    /// sent from a background task.
    pub fn publish_csv(&self, csv: &str, options: CsvOptions) -> usize {
        {
            let mut state = self.state.lock();
            if state.schema.is_empty() {
                tracing::debug!("Publisher {} has no schema yet, deferring CSV", self.id);
                state.deferred_csv = Some((csv.to_string(), options));
                return 0;
            }
        }
        self.send_csv(csv, &options)
    }

    fn send_csv(&self, csv: &str, options: &CsvOptions) -> usize {
        let rows = self.state.lock().schema.rows_from_csv(csv, options);
        let blocksize = options.blocksize.max(1);
        let mut blocks: Vec<Vec<Row>> = Vec::new();

        for mut row in rows {
            let opcode = row
                .remove(OPCODE_FIELD)
                .unwrap_or_else(|| Value::from(options.default_opcode.clone()));
            row.insert("opcode".to_string(), opcode);
            match blocks.last_mut() {
                Some(block) if block.len() < blocksize => block.push(row),
                _ => blocks.push(vec![row]),
            }
        }

        let pause = Duration::from_millis(options.pause);
        if !pause.is_zero() && blocks.len() > 1 {
            match (self.me.upgrade(), tokio::runtime::Handle::try_current()) {
                (Some(me), Ok(runtime)) => {
                    let mut blocks = blocks.into_iter();
                    let sent = blocks.next().map_or(0, |block| self.send_rows(block));
                    let close = options.close;
                    runtime.spawn(async move {
                        for block in blocks {
                            tokio::time::sleep(pause).await;
                            me.send_rows(block);
                        }
                        if close {
                            me.close();
                        }
                    });
                    return sent;
                }
                _ => tracing::warn!(
                    "Publisher {} cannot pace CSV outside a runtime, sending all blocks",
                    self.id
                ),
            }
        }

        let sent = blocks.into_iter().map(|block| self.send_rows(block)).sum();
        if options.close {
            self.close();
        }
        sent
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn install_schema(&self, schema: Schema) {
        let deferred = {
            let mut state = self.state.lock();
            state.schema = schema.clone();
            state.deferred_csv.take()
        };
        tracing::debug!("Publisher {} schema: {} fields", self.id, schema.len());

        for delegate in self.schema_delegates.snapshot() {
            delegate.schema_set(SchemaSource::Publisher(self), &schema);
        }

        if let Some((csv, options)) = deferred {
            self.send_csv(&csv, &options);
        }
    }

    pub fn add_schema_delegate(&self, delegate: Arc<dyn SchemaDelegate>) -> bool {
        self.schema_delegates.add(delegate).is_some()
    }

    /// Set when the server reports the publish stream as complete.
    pub fn mark_complete(&self) {
        tracing::debug!("Publisher {} complete", self.id);
        self.complete.store(true, Ordering::SeqCst);
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    /// Deletes the publisher on the server and forgets it locally.
    pub fn close(&self) -> bool {
        let Some(engine) = self.engine.upgrade() else {
            return false;
        };
        engine.remove_publisher(&self.id);
        engine.send(
            &Request::new(Verb::Publisher)
                .with_id(self.id.clone())
                .with_action("delete"),
        )
    }
}
