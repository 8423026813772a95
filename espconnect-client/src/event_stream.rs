//! Append-only window subscription.
//!
//! Every delivered event becomes a new row keyed by a client counter; the
//! cache keeps the newest `maxevents` rows.

use crate::datasource::{
    Datasource, DatasourceCore, DatasourceKind, DatasourceOptions, DatasourceState, Row,
    SELECTED_FIELD,
};
use crate::engine::ProtocolEngine;
use espconnect_protocol::schema::{COUNTER_FIELD, KEY_FIELD};
use serde_json::Value;
use std::sync::Arc;

pub struct EventStream {
    core: DatasourceCore,
}

impl EventStream {
    /// Creates the stream. It is subscribed by
    /// [`ProtocolEngine::open_datasource`].
    pub fn new(engine: &Arc<ProtocolEngine>, options: DatasourceOptions) -> Arc<Self> {
        Arc::new(Self {
            core: DatasourceCore::new(engine, DatasourceKind::Stream, options),
        })
    }

    pub fn maxevents(&self) -> usize {
        self.core.options().maxevents
    }

    /// Counter value the next event will get.
    pub fn next_counter(&self) -> u64 {
        self.core.with_state(|s| s.counter)
    }
}

impl Datasource for EventStream {
    fn core(&self) -> &DatasourceCore {
        &self.core
    }

    fn as_dyn(&self) -> &dyn Datasource {
        self
    }
}

/// Appends `events` to the ring buffer, stamping each with the counter and
/// key it was stored under, then trims the oldest rows past `maxevents`.
pub(crate) fn apply(state: &mut DatasourceState, maxevents: usize, events: &mut [Row]) {
    let columns: Vec<String> = state
        .schema
        .columns()
        .into_iter()
        .map(str::to_string)
        .collect();

    for event in events.iter_mut() {
        let counter = state.counter;
        state.counter += 1;
        let key = counter.to_string();

        let mut row: Row = columns
            .iter()
            .filter_map(|c| event.get(c).map(|v| (c.clone(), v.clone())))
            .collect();
        row.insert(COUNTER_FIELD.to_string(), Value::from(counter));
        row.insert(KEY_FIELD.to_string(), Value::String(key.clone()));
        row.insert(SELECTED_FIELD.to_string(), Value::Bool(false));

        event.insert(COUNTER_FIELD.to_string(), Value::from(counter));
        event.insert(KEY_FIELD.to_string(), Value::String(key.clone()));

        state.cache.insert(key, row);
    }

    while state.cache.len() > maxevents {
        state.cache.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::DatasourceDelegate;
    use crate::engine::tests::Harness;
    use parking_lot::Mutex;
    use serde_json::json;

    fn open(h: &Harness, options: DatasourceOptions) -> Arc<EventStream> {
        let stream = EventStream::new(&h.engine, options);
        stream.core().install_schema(
            stream.as_dyn(),
            espconnect_protocol::Schema::from_json(&json!({"fields": [
                {"@name": "id", "@type": "int64", "@key": "true"},
                {"@name": "price", "@type": "double"}
            ]})),
        );
        stream
    }

    #[test]
    fn test_schema_gets_stream_columns() {
        let h = Harness::new();
        let stream = open(&h, DatasourceOptions::new("p/cq/w"));
        let schema = stream.schema();
        assert_eq!(
            schema.columns(),
            vec!["@counter", "@timestamp", "@opcode", "id", "price"]
        );
        assert_eq!(schema.key_field_names(), vec!["@counter"]);
    }

    #[test]
    fn test_ring_buffer_keeps_newest() {
        let h = Harness::new();
        let stream = open(&h, DatasourceOptions::new("p/cq/w").with_maxevents(3));

        for i in 1..=5 {
            stream.core().handle_events(
                stream.as_dyn(),
                &json!({"entries": [{"id": i, "price": 1.5}]}),
            );
        }

        let rows = stream.rows();
        assert_eq!(rows.len(), 3);
        let ids: Vec<_> = rows.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(3), json!(4), json!(5)]);
        let counters: Vec<_> = rows.iter().map(|r| r["@counter"].as_u64().unwrap()).collect();
        assert_eq!(counters, vec![3, 4, 5]);
        assert_eq!(rows[0]["@opcode"], "insert");
        assert_eq!(rows[0]["@key"], "3");
        assert!(stream.row("1").is_none());
        assert_eq!(stream.next_counter(), 6);
    }

    #[test]
    fn test_events_are_stamped_for_delegates() {
        let h = Harness::new();
        let stream = open(&h, DatasourceOptions::new("p/cq/w"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let delegate: Arc<dyn DatasourceDelegate> =
            Arc::new(move |_: &dyn Datasource, rows: &[Row], cleared: bool| {
                assert!(!cleared);
                sink.lock().extend(rows.iter().cloned());
            });
        stream.add_delegate(delegate);

        stream.core().handle_events(
            stream.as_dyn(),
            &json!({"entries": [{"id": 1, "extra": "kept"}, {"id": 2, "@opcode": "update"}]}),
        );

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0]["@counter"], 1);
        assert_eq!(seen[0]["extra"], "kept");
        assert_eq!(seen[1]["@opcode"], "update");
        assert!(stream.rows()[0].get("extra").is_none());
    }

    #[test]
    fn test_ignore_deletes() {
        let h = Harness::new();
        let stream = open(
            &h,
            DatasourceOptions::new("p/cq/w").with_ignore_deletes(true),
        );
        stream.core().handle_events(
            stream.as_dyn(),
            &json!({"entries": [{"id": 1, "@opcode": "delete"}, {"id": 2}]}),
        );
        assert_eq!(stream.len(), 1);
        assert_eq!(stream.rows()[0]["id"], 2);
    }

    #[test]
    fn test_body_without_entries_is_ignored() {
        let h = Harness::new();
        let stream = open(&h, DatasourceOptions::new("p/cq/w"));
        stream.core().handle_events(stream.as_dyn(), &json!({"@id": "x"}));
        assert!(stream.is_empty());
        assert_eq!(stream.next_counter(), 1);
    }

    #[test]
    fn test_xml_events() {
        let h = Harness::new();
        let stream = open(&h, DatasourceOptions::new("p/cq/w"));
        let xml = espconnect_protocol::XmlElement::parse(
            "<events id=\"s\"><entries>\
             <event opcode=\"insert\" timestamp=\"1700000000\"><id>7</id><price type=\"double\">2.5</price></event>\
             <event><id>8</id></event>\
             </entries></events>",
        )
        .unwrap();
        stream.core().handle_events_xml(stream.as_dyn(), &xml);

        let rows = stream.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["@timestamp"], "1700000000");
        assert_eq!(rows[0]["price"], "2.5");
        assert_eq!(rows[1]["@opcode"], "insert");
    }

    #[tokio::test]
    async fn test_set_request_members() {
        let h = Harness::new();
        h.handshake(Some("7"));
        let stream = EventStream::new(
            &h.engine,
            DatasourceOptions::new("p/cq/w")
                .with_id("s9")
                .with_binary(true)
                .with_maxevents(10)
                .with_option("sort", "price"),
        );

        let request = stream.core().set_request(true, true).to_json();
        let body = &request["event-stream"];
        assert_eq!(body["@id"], "s9");
        assert_eq!(body["action"], "set");
        assert_eq!(body["window"], "p/cq/w");
        assert_eq!(body["schema"], true);
        assert_eq!(body["format"], "ubjson");
        assert_eq!(body["maxevents"], 10);
        assert_eq!(body["filter"], "");
        assert_eq!(body["interval"], 0);
        assert_eq!(body["sort"], "price");

        let reload = stream.core().set_request(false, false).to_json();
        assert!(reload["event-stream"].get("schema").is_none());
        assert_eq!(reload["event-stream"]["load"], false);
    }

    #[tokio::test]
    async fn test_play_pause_and_filter() {
        let mut h = Harness::new();
        h.handshake(Some("7"));
        let stream = open(&h, DatasourceOptions::new("p/cq/w").with_id("s2"));

        stream.pause();
        assert!(stream.is_paused());
        assert_eq!(h.next_sent().await["event-stream"]["action"], "pause");

        assert!(stream.toggle_play());
        assert!(!stream.is_paused());
        assert_eq!(h.next_sent().await["event-stream"]["action"], "play");

        stream.set_filter("price > 2");
        let sent = h.next_sent().await;
        assert_eq!(sent["event-stream"]["filter"], "price > 2");
        assert_eq!(sent["event-stream"]["load"], true);

        stream.clear_filter();
        assert_eq!(h.next_sent().await["event-stream"]["filter"], "");
        assert_eq!(stream.filter(), None);
    }

    #[tokio::test]
    async fn test_close_unregisters() {
        let mut h = Harness::new();
        h.handshake(Some("7"));
        let stream = open(&h, DatasourceOptions::new("p/cq/w").with_id("s3"));

        let engine = h.engine.clone();
        let ds = stream.clone();
        let opened = tokio::spawn(async move { engine.open_datasource(ds).await });
        h.next_sent().await;
        h.receive(json!({"schema": {"@id": "s3", "fields": []}}));
        opened.await.unwrap().unwrap();
        assert!(h.engine.datasource("s3").is_some());

        assert!(stream.close());
        assert_eq!(
            h.next_sent().await,
            json!({"event-stream": {"@id": "s3", "action": "close"}})
        );
        assert!(h.engine.datasource("s3").is_none());
    }
}
