//! Server statistics and log capture.
//!
//! Both aggregators are singletons of the engine. They subscribe on the
//! server while at least one delegate is registered and re-broadcast every
//! update to their delegates.

use crate::delegate::{Delegates, LogDelegate, StatsDelegate};
use crate::engine::ProtocolEngine;
use espconnect_protocol::{Request, Verb, XmlElement};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// `stats set` parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsOptions {
    /// Seconds between updates.
    pub interval: u64,
    /// Windows below this CPU percentage are left out.
    pub min_cpu: u64,
    pub counts: bool,
    pub config: bool,
    pub memory: bool,
}

impl Default for StatsOptions {
    fn default() -> Self {
        Self {
            interval: 1,
            min_cpu: 5,
            counts: false,
            config: false,
            memory: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStats {
    pub project: String,
    pub contquery: String,
    pub window: String,
    pub cpu: f64,
    pub interval: f64,
    pub count: u64,
    /// `project.contquery.window`
    pub key: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub system: u64,
    pub virtual_memory: u64,
    pub resident: u64,
}

/// One stats update.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// Sorted by CPU, busiest first.
    pub windows: Vec<WindowStats>,
    pub memory: Option<MemoryStats>,
    /// Server properties; a property without a value reads `"true"`.
    pub config: BTreeMap<String, String>,
}

impl StatsSnapshot {
    pub fn from_json(body: &Value) -> Self {
        let mut windows = Vec::new();
        for project in array(body, "projects") {
            let p = str_member(project, "@name");
            for contquery in array(project, "contqueries") {
                let cq = str_member(contquery, "@name");
                for window in array(contquery, "windows") {
                    windows.push(WindowStats::new(
                        &p,
                        &cq,
                        &str_member(window, "@name"),
                        window.get("@cpu"),
                        window.get("@interval"),
                        window.get("@count"),
                    ));
                }
            }
        }
        sort_by_cpu(&mut windows);

        let memory = body.get("server-memory").map(|m| MemoryStats {
            system: m.get("system").and_then(as_u64).unwrap_or(0),
            virtual_memory: m.get("virtual").and_then(as_u64).unwrap_or(0),
            resident: m.get("resident").and_then(as_u64).unwrap_or(0),
        });

        let config = array(body, "properties")
            .filter_map(|p| {
                let name = p.get("@name")?.as_str()?.to_string();
                let value = p
                    .get("*value")
                    .or_else(|| p.get("value"))
                    .map(text_of)
                    .unwrap_or_default();
                Some((name, property_value(value)))
            })
            .collect();

        Self {
            windows,
            memory,
            config,
        }
    }

    pub fn from_xml(root: &XmlElement) -> Self {
        let mut windows = Vec::new();
        for project in root.find_all(".//project") {
            let p = project.attr("name").unwrap_or("");
            for contquery in project.find_all("./contquery") {
                let cq = contquery.attr("name").unwrap_or("");
                for window in contquery.find_all("./window") {
                    let attr = |n: &str| window.attr(n).map(|v| Value::from(v));
                    windows.push(WindowStats::new(
                        p,
                        cq,
                        window.attr("name").unwrap_or(""),
                        attr("cpu").as_ref(),
                        attr("interval").as_ref(),
                        attr("count").as_ref(),
                    ));
                }
            }
        }
        sort_by_cpu(&mut windows);

        let memory = root.find(".//server-memory").map(|m| {
            let read = |n: &str| {
                m.child_text(n)
                    .and_then(|t| t.trim().parse().ok())
                    .unwrap_or(0)
            };
            MemoryStats {
                system: read("system"),
                virtual_memory: read("virtual"),
                resident: read("resident"),
            }
        });

        let config = root
            .find_all(".//properties/property")
            .into_iter()
            .filter_map(|p| {
                let name = p.attr("name")?.to_string();
                Some((name, property_value(p.text())))
            })
            .collect();

        Self {
            windows,
            memory,
            config,
        }
    }
}

impl WindowStats {
    fn new(
        project: &str,
        contquery: &str,
        window: &str,
        cpu: Option<&Value>,
        interval: Option<&Value>,
        count: Option<&Value>,
    ) -> Self {
        Self {
            project: project.to_string(),
            contquery: contquery.to_string(),
            window: window.to_string(),
            cpu: cpu.and_then(as_f64).unwrap_or(0.0),
            interval: interval.and_then(as_f64).unwrap_or(0.0),
            count: count.and_then(as_u64).unwrap_or(0),
            key: format!("{}.{}.{}", project, contquery, window),
        }
    }
}

fn sort_by_cpu(windows: &mut [WindowStats]) {
    windows.sort_by(|a, b| b.cpu.total_cmp(&a.cpu));
}

fn property_value(value: String) -> String {
    if value.is_empty() {
        "true".to_string()
    } else {
        value
    }
}

/// Server statistics subscription.
pub struct Stats {
    engine: Weak<ProtocolEngine>,
    options: Mutex<StatsOptions>,
    latest: Mutex<StatsSnapshot>,
    delegates: Delegates<dyn StatsDelegate>,
}

impl Stats {
    pub(crate) fn new(engine: Weak<ProtocolEngine>) -> Self {
        Self {
            engine,
            options: Mutex::new(StatsOptions::default()),
            latest: Mutex::new(StatsSnapshot::default()),
            delegates: Delegates::default(),
        }
    }

    pub fn options(&self) -> StatsOptions {
        self.options.lock().clone()
    }

    /// Replaces the options, resending them when subscribed.
    pub fn set_options(&self, options: StatsOptions) {
        *self.options.lock() = options;
        if !self.delegates.is_empty() {
            self.send_set();
        }
    }

    /// Latest update.
    pub fn snapshot(&self) -> StatsSnapshot {
        self.latest.lock().clone()
    }

    /// The first delegate starts the server subscription.
    pub fn add_delegate(&self, delegate: Arc<dyn StatsDelegate>) -> bool {
        match self.delegates.add(delegate) {
            Some(1) => {
                self.send_set();
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Removing the last delegate stops the server subscription.
    pub fn remove_delegate(&self, delegate: &Arc<dyn StatsDelegate>) -> bool {
        match self.delegates.remove(delegate) {
            Some(0) => {
                self.send(Request::new(Verb::Stats).with_action("stop"));
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    pub(crate) fn resubscribe(&self) {
        if !self.delegates.is_empty() {
            self.send_set();
        }
    }

    fn send_set(&self) {
        let options = self.options();
        let format = self
            .engine
            .upgrade()
            .map(|e| e.strategy().stats_format())
            .unwrap_or("xml");
        self.send(
            Request::new(Verb::Stats)
                .with_action("set")
                .with("interval", options.interval)
                .with("minCpu", options.min_cpu)
                .with("counts", options.counts)
                .with("config", options.config)
                .with("memory", options.memory)
                .with("format", format),
        );
    }

    fn send(&self, request: Request) -> bool {
        self.engine
            .upgrade()
            .is_some_and(|engine| engine.send(&request))
    }

    pub fn process_json(&self, body: &Value) {
        self.deliver(StatsSnapshot::from_json(body));
    }

    pub fn process_xml(&self, root: &XmlElement) {
        self.deliver(StatsSnapshot::from_xml(root));
    }

    fn deliver(&self, snapshot: StatsSnapshot) {
        tracing::debug!("Stats update: {} windows", snapshot.windows.len());
        *self.latest.lock() = snapshot.clone();
        for delegate in self.delegates.snapshot() {
            delegate.handle_stats(&snapshot);
        }
    }
}

/// One captured server log line.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: Option<String>,
    pub file: Option<String>,
    pub line: Option<String>,
    pub message: String,
    /// Members of a structured (JSON) log line.
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

impl LogEntry {
    /// Parses a log line. JSON object text is kept as fields; anything else
    /// is read as `timestamp [level:file:line] [...] message`. Empty text
    /// yields `None`.
    pub fn parse(text: &str) -> Option<LogEntry> {
        let text = text.trim_end();
        if text.is_empty() {
            return None;
        }

        if text.starts_with('{') {
            return match serde_json::from_str::<Value>(text) {
                Ok(Value::Object(fields)) => Some(Self::from_fields(fields)),
                _ => {
                    tracing::debug!("Unparseable structured log line");
                    Some(Self::plain(text))
                }
            };
        }

        let mut entry = Self::plain(text);
        entry.timestamp = text.chars().take(19).collect();

        let Some(open) = text.find('[') else {
            return Some(entry);
        };
        let Some(close) = text[open..].find(']').map(|i| open + i) else {
            return Some(entry);
        };

        let location: Vec<&str> = text[open + 1..close].trim().split(':').collect();
        if let [level, file, line] = location.as_slice() {
            entry.level = Some(level.to_string());
            entry.file = Some(file.to_string());
            entry.line = Some(line.to_string());
        }

        let mut end = close;
        if let Some(open2) = text[close + 1..].find('[').map(|i| close + 1 + i) {
            if let Some(close2) = text[open2..].find(']').map(|i| open2 + i) {
                end = close2;
            }
        }
        entry.message = text[end + 1..].trim().to_string();
        Some(entry)
    }

    fn plain(text: &str) -> Self {
        Self {
            message: text.to_string(),
            ..Self::default()
        }
    }

    fn from_fields(fields: Map<String, Value>) -> Self {
        let get = |names: &[&str]| {
            names
                .iter()
                .find_map(|n| fields.get(*n))
                .map(text_of)
        };
        Self {
            timestamp: get(&["timestamp", "_timestamp"]).unwrap_or_default(),
            level: get(&["level", "logLevel"]),
            file: get(&["file", "messageFile"]),
            line: get(&["line", "messageLine"]),
            message: get(&["message", "messageContent"]).unwrap_or_default(),
            fields,
        }
    }
}

/// Server log capture.
pub struct Log {
    engine: Weak<ProtocolEngine>,
    filter: Mutex<Option<String>>,
    delegates: Delegates<dyn LogDelegate>,
}

impl Log {
    pub(crate) fn new(engine: Weak<ProtocolEngine>) -> Self {
        Self {
            engine,
            filter: Mutex::new(None),
            delegates: Delegates::default(),
        }
    }

    pub fn filter(&self) -> Option<String> {
        self.filter.lock().clone()
    }

    pub fn set_filter(&self, filter: &str) -> bool {
        *self.filter.lock() = Some(filter.to_string());
        self.send(Request::new(Verb::Logs).with("filter", filter))
    }

    pub fn add_delegate(&self, delegate: Arc<dyn LogDelegate>) -> bool {
        match self.delegates.add(delegate) {
            Some(1) => {
                self.send(Request::new(Verb::Logs).with("capture", true));
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn remove_delegate(&self, delegate: &Arc<dyn LogDelegate>) -> bool {
        match self.delegates.remove(delegate) {
            Some(0) => {
                self.send(Request::new(Verb::Logs).with("capture", false));
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    pub(crate) fn resubscribe(&self) {
        if self.delegates.is_empty() {
            return;
        }
        self.send(Request::new(Verb::Logs).with("capture", true));
        if let Some(filter) = self.filter() {
            self.send(Request::new(Verb::Logs).with("filter", filter));
        }
    }

    fn send(&self, request: Request) -> bool {
        self.engine
            .upgrade()
            .is_some_and(|engine| engine.send(&request))
    }

    /// Handles a JSON `log` body: a log line or a structured entry.
    pub fn process_json(&self, body: &Value) {
        let entry = match body {
            Value::String(text) => LogEntry::parse(text),
            Value::Object(fields) => match fields.get("message").and_then(Value::as_str) {
                Some(text) if fields.len() == 1 => LogEntry::parse(text),
                _ => Some(LogEntry::from_fields(fields.clone())),
            },
            _ => None,
        };
        if let Some(entry) = entry {
            self.deliver(&entry);
        }
    }

    pub fn process_xml(&self, root: &XmlElement) {
        if let Some(entry) = LogEntry::parse(&root.text()) {
            self.deliver(&entry);
        }
    }

    fn deliver(&self, entry: &LogEntry) {
        for delegate in self.delegates.snapshot() {
            delegate.handle_log(entry);
        }
    }
}

fn array<'a>(value: &'a Value, name: &str) -> impl Iterator<Item = &'a Value> {
    value
        .get(name)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn str_member(value: &Value, name: &str) -> String {
    value.get(name).map(text_of).unwrap_or_default()
}

fn text_of(value: &Value) -> String {
    espconnect_protocol::schema::value_text(value)
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::Harness;
    use serde_json::json;

    #[test]
    fn test_stats_from_json() {
        let snapshot = StatsSnapshot::from_json(&json!({
            "projects": [{
                "@name": "p",
                "contqueries": [{
                    "@name": "cq",
                    "windows": [
                        {"@name": "a", "@cpu": 10, "@interval": 1000},
                        {"@name": "b", "@cpu": "42.5", "@interval": "1000", "@count": 7}
                    ]
                }]
            }, {"@name": "empty"}],
            "server-memory": {"system": 100, "virtual": 50, "resident": "25"},
            "properties": [{"@name": "threads", "*value": "4"}, {"@name": "debug"}]
        }));

        assert_eq!(snapshot.windows.len(), 2);
        assert_eq!(snapshot.windows[0].key, "p.cq.b");
        assert_eq!(snapshot.windows[0].cpu, 42.5);
        assert_eq!(snapshot.windows[0].count, 7);
        assert_eq!(snapshot.windows[1].count, 0);
        assert_eq!(
            snapshot.memory,
            Some(MemoryStats {
                system: 100,
                virtual_memory: 50,
                resident: 25
            })
        );
        assert_eq!(snapshot.config["threads"], "4");
        assert_eq!(snapshot.config["debug"], "true");
    }

    #[test]
    fn test_stats_from_xml() {
        let xml = XmlElement::parse(
            "<stats><project name=\"p\"><contquery name=\"cq\">\
             <window name=\"w1\" cpu=\"3\" interval=\"500\" count=\"9\"/>\
             <window name=\"w2\" cpu=\"30\" interval=\"500\"/>\
             </contquery></project>\
             <server-memory><system>8</system><virtual>4</virtual><resident>2</resident></server-memory>\
             <properties><property name=\"mode\">fast</property></properties></stats>",
        )
        .unwrap();
        let snapshot = StatsSnapshot::from_xml(&xml);
        let keys: Vec<_> = snapshot.windows.iter().map(|w| w.key.as_str()).collect();
        assert_eq!(keys, vec!["p.cq.w2", "p.cq.w1"]);
        assert_eq!(snapshot.memory.unwrap().resident, 2);
        assert_eq!(snapshot.config["mode"], "fast");
    }

    #[test]
    fn test_log_line_parsing() {
        let entry = LogEntry::parse(
            "2024-03-01 10:20:30.123 [INFO:engine.cpp:42] [thread 7] window started",
        )
        .unwrap();
        assert_eq!(entry.timestamp, "2024-03-01 10:20:30");
        assert_eq!(entry.level.as_deref(), Some("INFO"));
        assert_eq!(entry.file.as_deref(), Some("engine.cpp"));
        assert_eq!(entry.line.as_deref(), Some("42"));
        assert_eq!(entry.message, "window started");

        let entry = LogEntry::parse("2024-03-01 10:20:30 [WARN:x.c:1] low memory").unwrap();
        assert_eq!(entry.message, "low memory");

        let entry = LogEntry::parse("{\"level\":\"ERROR\",\"message\":\"boom\"}").unwrap();
        assert_eq!(entry.level.as_deref(), Some("ERROR"));
        assert_eq!(entry.message, "boom");

        assert!(LogEntry::parse("").is_none());
        assert_eq!(LogEntry::parse("no brackets").unwrap().message, "no brackets");
    }

    #[tokio::test]
    async fn test_stats_subscription_follows_delegates() {
        let mut h = Harness::new();
        h.handshake(Some("7"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let delegate: Arc<dyn StatsDelegate> = Arc::new(move |s: &StatsSnapshot| {
            sink.lock().push(s.windows.len());
        });

        assert!(h.engine.stats().add_delegate(delegate.clone()));
        assert!(!h.engine.stats().add_delegate(delegate.clone()));
        let set = h.next_sent().await;
        assert_eq!(set["stats"]["action"], "set");
        assert_eq!(set["stats"]["format"], "ubjson");
        assert_eq!(set["stats"]["minCpu"], 5);

        h.receive(json!({"stats": {"projects": [{"@name": "p", "contqueries": [
            {"@name": "cq", "windows": [{"@name": "w", "@cpu": 1}]}
        ]}]}}));
        assert_eq!(*seen.lock(), vec![1]);
        assert_eq!(h.engine.stats().snapshot().windows[0].window, "w");

        assert!(h.engine.stats().remove_delegate(&delegate));
        assert_eq!(h.next_sent().await, json!({"stats": {"action": "stop"}}));
    }

    #[tokio::test]
    async fn test_log_capture() {
        let mut h = Harness::new();
        h.handshake(Some("7"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let delegate: Arc<dyn LogDelegate> = Arc::new(move |e: &LogEntry| {
            sink.lock().push(e.message.clone());
        });

        h.engine.log().add_delegate(delegate.clone());
        assert_eq!(h.next_sent().await, json!({"logs": {"capture": true}}));

        h.engine.log().set_filter("ERROR");
        assert_eq!(h.next_sent().await, json!({"logs": {"filter": "ERROR"}}));

        h.receive(json!({"log": "2024-03-01 10:20:30 [INFO:a.c:1] hello"}));
        h.conn
            .handle_text("<log>2024-03-01 10:20:31 [INFO:a.c:2] world</log>");
        assert_eq!(*seen.lock(), vec!["hello", "world"]);

        h.engine.log().remove_delegate(&delegate);
        assert_eq!(h.next_sent().await, json!({"logs": {"capture": false}}));
    }
}
