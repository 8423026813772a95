//! Keyed, paged window subscription.

use crate::datasource::{
    Datasource, DatasourceCore, DatasourceKind, DatasourceOptions, DatasourceState, Row,
    SELECTED_FIELD,
};
use crate::engine::ProtocolEngine;
use espconnect_protocol::schema::{KEY_FIELD, OPCODE_FIELD};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

pub struct EventCollection {
    core: DatasourceCore,
}

impl EventCollection {
    pub fn new(engine: &Arc<ProtocolEngine>, options: DatasourceOptions) -> Arc<Self> {
        Arc::new(Self {
            core: DatasourceCore::new(engine, DatasourceKind::Collection, options),
        })
    }

    pub fn page(&self) -> i64 {
        self.core.with_state(|s| s.page)
    }

    pub fn pages(&self) -> i64 {
        self.core.with_state(|s| s.pages)
    }

    /// Reloads the current page.
    pub fn load(&self) -> bool {
        self.load_page(None)
    }

    pub fn first(&self) -> bool {
        self.load_page(Some("first"))
    }

    pub fn last(&self) -> bool {
        self.load_page(Some("last"))
    }

    pub fn next(&self) -> bool {
        self.load_page(Some("next"))
    }

    pub fn prev(&self) -> bool {
        self.load_page(Some("prev"))
    }

    fn load_page(&self, page: Option<&str>) -> bool {
        let mut request = self.core.action_request("load");
        if let Some(page) = page {
            request = request.with("page", page);
        }
        self.core.send(&request)
    }
}

impl Datasource for EventCollection {
    fn core(&self) -> &DatasourceCore {
        &self.core
    }

    fn as_dyn(&self) -> &dyn Datasource {
        self
    }
}

/// Applies keyed events. With `clear` the cache is rebuilt from `events`,
/// keeping the selection of rows that survive.
pub(crate) fn apply(state: &mut DatasourceState, events: &[Row], clear: bool) {
    let selected: HashSet<String> = if clear {
        let keys = state.cache.selected_keys().into_iter().collect();
        state.cache.clear();
        keys
    } else {
        HashSet::new()
    };

    let columns: Vec<String> = state
        .schema
        .columns()
        .into_iter()
        .map(str::to_string)
        .collect();

    for event in events {
        let Some(key) = event.get(KEY_FIELD).and_then(Value::as_str) else {
            continue;
        };

        if event.get(OPCODE_FIELD).and_then(Value::as_str) == Some("delete") {
            state.cache.remove(key);
            continue;
        }

        if state.cache.get(key).is_none() {
            let mut row = Row::new();
            row.insert(KEY_FIELD.to_string(), Value::from(key));
            row.insert(
                SELECTED_FIELD.to_string(),
                Value::Bool(selected.contains(key)),
            );
            state.cache.insert(key.to_string(), row);
        }
        if let Some(row) = state.cache.get_mut(key) {
            for column in &columns {
                if let Some(value) = event.get(column) {
                    row.insert(column.clone(), value.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::DatasourceDelegate;
    use crate::engine::tests::Harness;
    use parking_lot::Mutex;
    use serde_json::json;

    fn open(h: &Harness, id: &str) -> Arc<EventCollection> {
        let collection = EventCollection::new(&h.engine, DatasourceOptions::new("p/cq/w").with_id(id));
        collection.core().install_schema(
            collection.as_dyn(),
            espconnect_protocol::Schema::from_json(&json!({"fields": [
                {"@name": "sym", "@type": "utf8str", "@key": "true"},
                {"@name": "qty", "@type": "int32"}
            ]})),
        );
        collection
    }

    #[test]
    fn test_upsert_and_delete() {
        let h = Harness::new();
        let c = open(&h, "c1");

        c.core().handle_events(
            c.as_dyn(),
            &json!({"entries": [{"sym": "A", "qty": 1}, {"sym": "B", "qty": 2}]}),
        );
        c.core().handle_events(
            c.as_dyn(),
            &json!({"entries": [
                {"sym": "A", "qty": 5, "@opcode": "update"},
                {"sym": "B", "@opcode": "delete"}
            ]}),
        );

        let rows = c.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["@key"], "A");
        assert_eq!(rows[0]["qty"], 5);
        assert_eq!(rows[0]["@selected"], false);
        assert!(c.row("B").is_none());
    }

    #[test]
    fn test_info_clears_and_keeps_selection() {
        let h = Harness::new();
        let c = open(&h, "c2");
        let info_changes = Arc::new(Mutex::new(0));

        struct Counter(Arc<Mutex<usize>>);
        impl DatasourceDelegate for Counter {
            fn data_changed(&self, _: &dyn Datasource, _: &[Row], _: bool) {}
            fn info_changed(&self, _: &dyn Datasource) {
                *self.0.lock() += 1;
            }
        }
        c.add_delegate(Arc::new(Counter(info_changes.clone())));

        c.core().handle_events(
            c.as_dyn(),
            &json!({"entries": [{"sym": "A"}, {"sym": "B"}, {"sym": "C"}]}),
        );
        c.select(&["B", "C"], false);
        assert_eq!(c.selected_keys(), vec!["B", "C"]);

        c.core().handle_events(
            c.as_dyn(),
            &json!({"entries": [{"sym": "B"}, {"sym": "D"}],
                    "info": {"page": 2, "pages": 4}}),
        );

        let keys: Vec<_> = c.rows().iter().map(|r| r["@key"].clone()).collect();
        assert_eq!(keys, vec![json!("B"), json!("D")]);
        assert_eq!(c.selected_keys(), vec!["B"]);
        assert_eq!((c.page(), c.pages()), (2, 4));
        assert_eq!(*info_changes.lock(), 1);
    }

    #[test]
    fn test_xml_page_replaces_rows() {
        let h = Harness::new();
        let c = open(&h, "c3");
        c.core()
            .handle_events(c.as_dyn(), &json!({"entries": [{"sym": "OLD"}]}));

        let xml = espconnect_protocol::XmlElement::parse(
            "<events id=\"c3\" page=\"1\" pages=\"3\"><entries>\
             <event><sym>X</sym><qty type=\"int32\">4</qty></event>\
             <event opcode=\"delete\"><sym>Y</sym></event>\
             </entries></events>",
        )
        .unwrap();
        c.core().handle_events_xml(c.as_dyn(), &xml);

        let rows = c.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["sym"], "X");
        assert_eq!(rows[0]["qty"], "_data://int32:4");
        assert_eq!((c.page(), c.pages()), (1, 3));
    }

    #[test]
    fn test_toggle_selection() {
        let h = Harness::new();
        let c = open(&h, "c4");
        c.core()
            .handle_events(c.as_dyn(), &json!({"entries": [{"sym": "A"}]}));

        assert_eq!(c.toggle_selected("A"), Some(true));
        assert_eq!(c.selected_rows().len(), 1);
        assert_eq!(c.toggle_selected("missing"), None);
        c.deselect_all();
        assert!(c.selected_keys().is_empty());
    }

    #[test]
    fn test_values_and_limits() {
        let h = Harness::new();
        let c = open(&h, "c5");
        c.core().handle_events(
            c.as_dyn(),
            &json!({"entries": [{"sym": "A", "qty": 3}, {"sym": "B", "qty": "9"}, {"sym": "C"}]}),
        );
        assert_eq!(
            c.values("qty").unwrap(),
            vec![json!(3.0), json!(9.0), json!(0.0)]
        );
        assert_eq!(c.values("sym").unwrap(), vec![json!("A"), json!("B"), json!("C")]);
        assert!(c.values("nope").is_none());
        assert_eq!(c.limits("qty"), Some((0.0, 9.0)));
    }

    #[tokio::test]
    async fn test_paging_requests() {
        let mut h = Harness::new();
        h.handshake(Some("7"));
        let c = open(&h, "c6");

        assert!(c.next());
        assert_eq!(
            h.next_sent().await,
            json!({"event-collection": {"@id": "c6", "action": "load", "page": "next"}})
        );
        assert!(c.load());
        assert_eq!(
            h.next_sent().await,
            json!({"event-collection": {"@id": "c6", "action": "load"}})
        );

        let set = c.core().set_request(true, true).to_json();
        assert_eq!(set["event-collection"]["info"], 5);
        assert!(set["event-collection"].get("maxevents").is_none());
    }
}
