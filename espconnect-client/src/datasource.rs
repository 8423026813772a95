//! State shared by event streams and event collections.
//!
//! A datasource is a subscription to one window. The server first answers
//! with the window schema and then pushes `events` (and, for collections,
//! `info`) messages under the subscription id. [`DatasourceCore`] holds the
//! cached rows and the listener lists; the kind-specific row handling lives
//! in [`crate::event_stream`] and [`crate::event_collection`].

use crate::delegate::{DatasourceDelegate, Delegates, SchemaDelegate, SchemaSource};
use crate::engine::ProtocolEngine;
use crate::event_collection;
use crate::event_stream;
use crate::options::Options;
use espconnect_protocol::schema::{KEY_FIELD, OPCODE_FIELD, TIMESTAMP_FIELD};
use espconnect_protocol::{
    new_request_id, Request, Schema, Verb, XmlElement, DEFAULT_MAX_EVENTS,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

/// One cached event, keyed by its `@key` member.
pub type Row = Map<String, Value>;

pub const SELECTED_FIELD: &str = "@selected";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasourceKind {
    /// Append-only, bounded by `maxevents`.
    Stream,
    /// Keyed, paged and update-capable.
    Collection,
}

impl DatasourceKind {
    pub fn verb(&self) -> Verb {
        match self {
            DatasourceKind::Stream => Verb::EventStream,
            DatasourceKind::Collection => Verb::EventCollection,
        }
    }
}

/// Subscription options.
#[derive(Debug, Clone)]
pub struct DatasourceOptions {
    /// Window path, `project/contquery/window`.
    pub window: String,
    /// Subscription id; generated when not set.
    pub id: Option<String>,
    pub name: Option<String>,
    /// Update interval in milliseconds. Falls back to the engine default.
    pub interval: Option<u64>,
    pub filter: Option<String>,
    /// Stream ring buffer size.
    pub maxevents: usize,
    /// Ask for binary event delivery when the server supports it.
    pub binary: bool,
    /// Streams only: drop `delete` events instead of appending them.
    pub ignore_deletes: bool,
    /// Collections only.
    pub pagesize: Option<u32>,
    /// Extra request members passed through verbatim.
    pub extra: Options,
}

impl DatasourceOptions {
    pub fn new(window: impl Into<String>) -> Self {
        Self {
            window: window.into(),
            id: None,
            name: None,
            interval: None,
            filter: None,
            maxevents: DEFAULT_MAX_EVENTS,
            binary: false,
            ignore_deletes: false,
            pagesize: None,
            extra: Options::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_interval(mut self, millis: u64) -> Self {
        self.interval = Some(millis);
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_maxevents(mut self, maxevents: usize) -> Self {
        self.maxevents = maxevents;
        self
    }

    pub fn with_binary(mut self, binary: bool) -> Self {
        self.binary = binary;
        self
    }

    pub fn with_ignore_deletes(mut self, ignore: bool) -> Self {
        self.ignore_deletes = ignore;
        self
    }

    pub fn with_pagesize(mut self, pagesize: u32) -> Self {
        self.pagesize = Some(pagesize);
        self
    }

    pub fn with_option(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.extra.set(name, value);
        self
    }
}

/// Rows by key, in arrival order.
#[derive(Debug, Default)]
pub(crate) struct RowCache {
    rows: HashMap<String, Row>,
    order: VecDeque<String>,
}

impl RowCache {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.order.clear();
    }

    pub fn get(&self, key: &str) -> Option<&Row> {
        self.rows.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Row> {
        self.rows.get_mut(key)
    }

    /// Appends a row, or replaces it in place when the key is known.
    pub fn insert(&mut self, key: String, row: Row) {
        if self.rows.insert(key.clone(), row).is_none() {
            self.order.push_back(key);
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Row> {
        let row = self.rows.remove(key)?;
        self.order.retain(|k| k != key);
        Some(row)
    }

    pub fn pop_front(&mut self) -> Option<Row> {
        let key = self.order.pop_front()?;
        self.rows.remove(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.order.iter().filter_map(|k| self.rows.get(k))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Row> {
        self.rows.values_mut()
    }

    pub fn selected_keys(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|k| self.rows.get(*k).is_some_and(is_selected))
            .cloned()
            .collect()
    }
}

#[derive(Debug)]
pub(crate) struct DatasourceState {
    pub schema: Schema,
    pub cache: RowCache,
    pub paused: bool,
    pub filter: Option<String>,
    pub page: i64,
    pub pages: i64,
    /// Next stream counter value.
    pub counter: u64,
}

/// Id, options, cached rows and listeners of one subscription.
pub struct DatasourceCore {
    id: String,
    kind: DatasourceKind,
    options: DatasourceOptions,
    engine: Weak<ProtocolEngine>,
    state: Mutex<DatasourceState>,
    delegates: Delegates<dyn DatasourceDelegate>,
    schema_delegates: Delegates<dyn SchemaDelegate>,
}

impl DatasourceCore {
    pub(crate) fn new(
        engine: &Arc<ProtocolEngine>,
        kind: DatasourceKind,
        options: DatasourceOptions,
    ) -> Self {
        let id = options.id.clone().unwrap_or_else(new_request_id);
        let state = DatasourceState {
            schema: Schema::default(),
            cache: RowCache::default(),
            paused: false,
            filter: options.filter.clone(),
            page: 0,
            pages: 0,
            counter: 1,
        };
        Self {
            id,
            kind,
            options,
            engine: Arc::downgrade(engine),
            state: Mutex::new(state),
            delegates: Delegates::default(),
            schema_delegates: Delegates::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> DatasourceKind {
        self.kind
    }

    pub fn options(&self) -> &DatasourceOptions {
        &self.options
    }

    pub fn engine(&self) -> Option<Arc<ProtocolEngine>> {
        self.engine.upgrade()
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&DatasourceState) -> R) -> R {
        f(&self.state.lock())
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// The `set` request. `opening` adds the members only the first request
    /// of a subscription carries.
    pub fn set_request(&self, load: bool, opening: bool) -> Request {
        let (format, default_interval) = match self.engine() {
            Some(engine) => (
                engine.strategy().event_format(self.options.binary),
                engine.config().default_interval,
            ),
            None => ("json", 0),
        };
        let filter = self.state.lock().filter.clone().unwrap_or_default();

        let mut request = Request::new(self.kind.verb())
            .with_id(self.id.clone())
            .with_action("set")
            .with("window", self.options.window.clone())
            .with("load", load)
            .with("interval", self.options.interval.unwrap_or(default_interval))
            .with("filter", filter)
            .with("format", format);

        if opening {
            request = request.with("schema", true);
        }

        request = match self.kind {
            DatasourceKind::Collection => {
                let request = request.with("info", 5);
                match self.options.pagesize {
                    Some(size) => request.with("pagesize", size),
                    None => request,
                }
            }
            DatasourceKind::Stream => request.with("maxevents", self.options.maxevents),
        };

        request.with_options(self.options.extra.as_map())
    }

    pub(crate) fn action_request(&self, action: &str) -> Request {
        Request::new(self.kind.verb())
            .with_id(self.id.clone())
            .with_action(action)
    }

    pub(crate) fn send(&self, request: &Request) -> bool {
        match self.engine() {
            Some(engine) => engine.send(request),
            None => false,
        }
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    pub fn install_schema(&self, source: &dyn Datasource, schema: Schema) {
        let schema = match self.kind {
            DatasourceKind::Stream => schema.for_stream(),
            DatasourceKind::Collection => schema,
        };
        tracing::debug!("Datasource {} schema: {} fields", self.id, schema.len());
        self.state.lock().schema = schema.clone();

        for delegate in self.schema_delegates.snapshot() {
            delegate.schema_set(SchemaSource::Datasource(source), &schema);
        }
    }

    /// Handles a JSON `events` body.
    pub fn handle_events(&self, source: &dyn Datasource, body: &Value) {
        let Some(entries) = body.get("entries") else {
            return;
        };
        let schema = self.state.lock().schema.clone();
        let events: Vec<Row> = entries
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_object)
                    .filter_map(|e| self.normalise(e.clone(), &schema))
                    .collect()
            })
            .unwrap_or_default();

        let info = match self.kind {
            DatasourceKind::Collection => body.get("info"),
            DatasourceKind::Stream => None,
        };
        self.process(source, events, info.is_some());
        if let Some(info) = info {
            self.handle_info(source, info);
        }
    }

    /// Handles an XML `<events>` body.
    pub fn handle_events_xml(&self, source: &dyn Datasource, root: &XmlElement) {
        let schema = self.state.lock().schema.clone();
        let mut events = Vec::new();

        for node in root.find_all("//entries/event") {
            let mut event = Row::new();
            let opcode = node.attr("opcode").filter(|s| !s.is_empty()).unwrap_or("insert");
            event.insert(OPCODE_FIELD.to_string(), Value::from(opcode));
            if let Some(ts) = node.attr("timestamp").filter(|s| !s.is_empty()) {
                event.insert(TIMESTAMP_FIELD.to_string(), Value::from(ts));
            }
            for value in node.elements() {
                let content = value.text();
                let content = match (self.kind, value.attr("type").filter(|t| !t.is_empty())) {
                    (DatasourceKind::Collection, Some(datatype)) => {
                        format!("_data://{}:{}", datatype, content)
                    }
                    _ => content,
                };
                event.insert(value.name.clone(), Value::String(content));
            }
            if let Some(event) = self.normalise(event, &schema) {
                events.push(event);
            }
        }

        let clear = self.kind == DatasourceKind::Collection && root.has_attr("page");
        self.process(source, events, clear);
        if clear {
            let info = root
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            self.handle_info(source, &Value::Object(info));
        }
    }

    /// Opcode defaulting, delete filtering and key assignment.
    fn normalise(&self, mut event: Row, schema: &Schema) -> Option<Row> {
        match event.get(OPCODE_FIELD).and_then(Value::as_str) {
            None => {
                event.insert(OPCODE_FIELD.to_string(), Value::from("insert"));
            }
            Some("delete")
                if self.kind == DatasourceKind::Stream && self.options.ignore_deletes =>
            {
                return None;
            }
            Some(_) => {}
        }
        let key = schema.key_for(&event);
        event.insert(KEY_FIELD.to_string(), Value::String(key));
        Some(event)
    }

    /// Applies normalised events to the cache and notifies listeners.
    pub(crate) fn process(&self, source: &dyn Datasource, mut events: Vec<Row>, clear: bool) {
        {
            let mut state = self.state.lock();
            match self.kind {
                DatasourceKind::Stream => {
                    event_stream::apply(&mut state, self.options.maxevents, &mut events)
                }
                DatasourceKind::Collection => event_collection::apply(&mut state, &events, clear),
            }
        }
        for delegate in self.delegates.snapshot() {
            delegate.data_changed(source, &events, clear);
        }
    }

    /// Handles paging information (`page`, `pages`).
    pub fn handle_info(&self, source: &dyn Datasource, info: &Value) {
        if self.kind != DatasourceKind::Collection {
            tracing::debug!("Ignoring info for stream {}", self.id);
            return;
        }
        let Some(page) = info.get("page").and_then(as_integer) else {
            return;
        };
        {
            let mut state = self.state.lock();
            state.page = page;
            state.pages = info.get("pages").and_then(as_integer).unwrap_or(0);
        }
        for delegate in self.delegates.snapshot() {
            delegate.info_changed(source);
        }
    }

    /// Drops every cached row; used before a subscription is reloaded.
    pub fn reset(&self, source: &dyn Datasource) {
        self.state.lock().cache.clear();
        for delegate in self.delegates.snapshot() {
            delegate.data_changed(source, &[], true);
        }
    }

    // =========================================================================
    // Playback and filter
    // =========================================================================

    pub fn set_paused(&self, paused: bool) {
        self.send(&self.action_request(if paused { "pause" } else { "play" }));
        self.state.lock().paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn filter(&self) -> Option<String> {
        self.state.lock().filter.clone()
    }

    pub fn set_filter(&self, source: &dyn Datasource, filter: Option<String>) {
        self.state.lock().filter = filter;
        self.send(&self.set_request(true, false));
        for delegate in self.delegates.snapshot() {
            delegate.filter_changed(source);
        }
    }

    // =========================================================================
    // Selection
    // =========================================================================

    pub fn select(&self, source: &dyn Datasource, keys: &[&str], deselect_others: bool) {
        {
            let mut state = self.state.lock();
            if deselect_others {
                for row in state.cache.iter_mut() {
                    row.insert(SELECTED_FIELD.to_string(), Value::Bool(false));
                }
            }
            for key in keys {
                if let Some(row) = state.cache.get_mut(key) {
                    row.insert(SELECTED_FIELD.to_string(), Value::Bool(true));
                }
            }
        }
        self.selection_changed(source);
    }

    /// Flips one row's selection. Returns the new state, or `None` for an
    /// unknown key.
    pub fn toggle_selected(&self, source: &dyn Datasource, key: &str) -> Option<bool> {
        let selected = {
            let mut state = self.state.lock();
            let row = state.cache.get_mut(key)?;
            let selected = !is_selected(row);
            row.insert(SELECTED_FIELD.to_string(), Value::Bool(selected));
            selected
        };
        self.selection_changed(source);
        Some(selected)
    }

    pub fn deselect_all(&self, source: &dyn Datasource) {
        for row in self.state.lock().cache.iter_mut() {
            row.insert(SELECTED_FIELD.to_string(), Value::Bool(false));
        }
        self.selection_changed(source);
    }

    fn selection_changed(&self, source: &dyn Datasource) {
        for delegate in self.delegates.snapshot() {
            delegate.selection_changed(source);
        }
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    pub fn add_delegate(&self, delegate: Arc<dyn DatasourceDelegate>) -> bool {
        self.delegates.add(delegate).is_some()
    }

    pub fn remove_delegate(&self, delegate: &Arc<dyn DatasourceDelegate>) -> bool {
        self.delegates.remove(delegate).is_some()
    }

    pub fn add_schema_delegate(&self, delegate: Arc<dyn SchemaDelegate>) -> bool {
        self.schema_delegates.add(delegate).is_some()
    }

    pub fn remove_schema_delegate(&self, delegate: &Arc<dyn SchemaDelegate>) -> bool {
        self.schema_delegates.remove(delegate).is_some()
    }
}

/// A live window subscription.
///
/// Implementors only provide access to their [`DatasourceCore`]; everything
/// else has a default.
pub trait Datasource: Send + Sync {
    fn core(&self) -> &DatasourceCore;

    fn as_dyn(&self) -> &dyn Datasource;

    fn id(&self) -> &str {
        self.core().id()
    }

    fn kind(&self) -> DatasourceKind {
        self.core().kind()
    }

    fn window(&self) -> &str {
        &self.core().options().window
    }

    /// Display name, defaulting to the window path.
    fn name(&self) -> &str {
        let options = self.core().options();
        options.name.as_deref().unwrap_or(&options.window)
    }

    fn schema(&self) -> Schema {
        self.core().with_state(|s| s.schema.clone())
    }

    /// Cached rows in arrival order.
    fn rows(&self) -> Vec<Row> {
        self.core().with_state(|s| s.cache.iter().cloned().collect())
    }

    fn row(&self, key: &str) -> Option<Row> {
        self.core().with_state(|s| s.cache.get(key).cloned())
    }

    fn len(&self) -> usize {
        self.core().with_state(|s| s.cache.len())
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values of one column across the cached rows. Numeric fields yield
    /// numbers (0.0 when missing), others their value ("" when missing).
    /// `None` when the schema has no such field.
    fn values(&self, name: &str) -> Option<Vec<Value>> {
        self.core().with_state(|s| {
            let numeric = s.schema.field(name)?.is_number;
            Some(
                s.cache
                    .iter()
                    .map(|row| match (row.get(name), numeric) {
                        (Some(v), true) => Value::from(as_float(v).unwrap_or(0.0)),
                        (Some(v), false) => v.clone(),
                        (None, true) => Value::from(0.0),
                        (None, false) => Value::from(""),
                    })
                    .collect(),
            )
        })
    }

    /// Minimum and maximum of a numeric column.
    fn limits(&self, name: &str) -> Option<(f64, f64)> {
        let values: Vec<f64> = self.values(name)?.iter().filter_map(as_float).collect();
        if values.is_empty() {
            return None;
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some((min, max))
    }

    fn play(&self) {
        self.core().set_paused(false);
    }

    fn pause(&self) {
        self.core().set_paused(true);
    }

    /// Returns true when playback was resumed.
    fn toggle_play(&self) -> bool {
        let resume = self.core().is_paused();
        self.core().set_paused(!resume);
        resume
    }

    fn is_paused(&self) -> bool {
        self.core().is_paused()
    }

    fn filter(&self) -> Option<String> {
        self.core().filter()
    }

    fn set_filter(&self, filter: &str) {
        self.core().set_filter(self.as_dyn(), Some(filter.to_string()));
    }

    fn clear_filter(&self) {
        self.core().set_filter(self.as_dyn(), None);
    }

    fn select(&self, keys: &[&str], deselect_others: bool) {
        self.core().select(self.as_dyn(), keys, deselect_others);
    }

    fn toggle_selected(&self, key: &str) -> Option<bool> {
        self.core().toggle_selected(self.as_dyn(), key)
    }

    fn deselect_all(&self) {
        self.core().deselect_all(self.as_dyn());
    }

    fn selected_keys(&self) -> Vec<String> {
        self.core().with_state(|s| s.cache.selected_keys())
    }

    fn selected_rows(&self) -> Vec<Row> {
        self.core()
            .with_state(|s| s.cache.iter().filter(|r| is_selected(r)).cloned().collect())
    }

    /// Ends the subscription on the server and forgets it locally.
    fn close(&self) -> bool {
        let core = self.core();
        let sent = core.send(&core.action_request("close"));
        if let Some(engine) = core.engine() {
            engine.remove_datasource(core.id());
        }
        sent
    }

    fn add_delegate(&self, delegate: Arc<dyn DatasourceDelegate>) -> bool {
        self.core().add_delegate(delegate)
    }

    fn remove_delegate(&self, delegate: &Arc<dyn DatasourceDelegate>) -> bool {
        self.core().remove_delegate(delegate)
    }

    fn add_schema_delegate(&self, delegate: Arc<dyn SchemaDelegate>) -> bool {
        self.core().add_schema_delegate(delegate)
    }
}

pub(crate) fn is_selected(row: &Row) -> bool {
    row.get(SELECTED_FIELD).and_then(Value::as_bool).unwrap_or(false)
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(key: &str) -> Row {
        let mut row = Row::new();
        row.insert("@key".to_string(), Value::from(key));
        row
    }

    #[test]
    fn test_row_cache_order() {
        let mut cache = RowCache::default();
        cache.insert("a".to_string(), row("a"));
        cache.insert("b".to_string(), row("b"));
        cache.insert("a".to_string(), row("a"));
        assert_eq!(cache.len(), 2);

        let keys: Vec<_> = cache.iter().map(|r| r["@key"].clone()).collect();
        assert_eq!(keys, vec![Value::from("a"), Value::from("b")]);

        assert!(cache.remove("a").is_some());
        assert!(cache.remove("a").is_none());
        assert_eq!(cache.pop_front().unwrap()["@key"], "b");
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_selected_keys() {
        let mut cache = RowCache::default();
        let mut selected = row("s");
        selected.insert(SELECTED_FIELD.to_string(), Value::Bool(true));
        cache.insert("s".to_string(), selected);
        cache.insert("n".to_string(), row("n"));
        assert_eq!(cache.selected_keys(), vec!["s".to_string()]);
    }

    #[test]
    fn test_options_builders() {
        let options = DatasourceOptions::new("p/cq/w")
            .with_interval(250)
            .with_maxevents(3)
            .with_option("sort", "price");
        assert_eq!(options.maxevents, 3);
        assert_eq!(options.interval, Some(250));
        assert_eq!(options.extra.get_str("sort"), Some("price"));
        assert_eq!(DatasourceOptions::new("w").maxevents, DEFAULT_MAX_EVENTS);
    }

    #[test]
    fn test_numeric_parsing() {
        assert_eq!(as_float(&Value::from("2.5")), Some(2.5));
        assert_eq!(as_float(&Value::from(3)), Some(3.0));
        assert_eq!(as_integer(&Value::from("7")), Some(7));
        assert_eq!(as_integer(&Value::Null), None);
    }
}
