//! Synthetic event source.
//!
//! Generates rows from a list of field generators and feeds them to a
//! [`Publisher`] on a fixed tick, for demos and load tests.

use crate::datasource::Row;
use crate::publisher::Publisher;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// How a field's value is produced for each row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldGenerator {
    /// Increments by one per row.
    Sequence {
        #[serde(default = "default_start")]
        start: i64,
    },
    IntRange {
        min: i64,
        max: i64,
    },
    FloatRange {
        min: f64,
        max: f64,
    },
    Choice {
        values: Vec<String>,
    },
    /// Current UTC time, formatted with `format` (chrono syntax).
    Timestamp {
        #[serde(default = "default_timestamp_format")]
        format: String,
    },
}

fn default_start() -> i64 {
    1
}

fn default_timestamp_format() -> String {
    "%Y-%m-%d %H:%M:%S%.6f".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedField {
    pub name: String,
    #[serde(flatten)]
    pub generator: FieldGenerator,
}

impl GeneratedField {
    pub fn new(name: impl Into<String>, generator: FieldGenerator) -> Self {
        Self {
            name: name.into(),
            generator,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceOptions {
    pub fields: Vec<GeneratedField>,
    /// Rows generated per tick.
    pub batch: usize,
    /// Milliseconds between ticks.
    pub rate_ms: u64,
    /// Stop after this many rows; 0 runs until shutdown.
    pub limit: u64,
    /// Value of the `opcode` member of every row.
    pub opcode: String,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            fields: Vec::new(),
            batch: 1,
            rate_ms: 1000,
            limit: 0,
            opcode: "upsert".to_string(),
        }
    }
}

impl SourceOptions {
    pub fn rate(&self) -> Duration {
        Duration::from_millis(self.rate_ms.max(1))
    }
}

pub struct SyntheticSource {
    publisher: Arc<Publisher>,
    options: SourceOptions,
    sequences: Mutex<Vec<i64>>,
    generated: AtomicU64,
    paused: AtomicBool,
    shutdown: AtomicBool,
    notify: Notify,
}

impl SyntheticSource {
    pub fn new(publisher: Arc<Publisher>, options: SourceOptions) -> Self {
        let sequences = options
            .fields
            .iter()
            .map(|f| match f.generator {
                FieldGenerator::Sequence { start } => start,
                _ => 0,
            })
            .collect();
        Self {
            publisher,
            options,
            sequences: Mutex::new(sequences),
            generated: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn options(&self) -> &SourceOptions {
        &self.options
    }

    /// Rows generated so far.
    pub fn generated(&self) -> u64 {
        self.generated.load(Ordering::Relaxed)
    }

    pub fn is_done(&self) -> bool {
        self.options.limit > 0 && self.generated() >= self.options.limit
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Produces one row.
    pub fn generate(&self) -> Row {
        let mut rng = rand::rng();
        let mut sequences = self.sequences.lock();
        let mut row = Row::new();

        for (i, field) in self.options.fields.iter().enumerate() {
            let value = match &field.generator {
                FieldGenerator::Sequence { .. } => {
                    let v = sequences[i];
                    sequences[i] += 1;
                    Value::from(v)
                }
                FieldGenerator::IntRange { min, max } => {
                    let (lo, hi) = ordered(*min, *max);
                    Value::from(rng.random_range(lo..=hi))
                }
                FieldGenerator::FloatRange { min, max } => {
                    let (lo, hi) = ordered(*min, *max);
                    let v = if lo < hi { rng.random_range(lo..hi) } else { lo };
                    Value::from(v)
                }
                FieldGenerator::Choice { values } => {
                    if values.is_empty() {
                        Value::Null
                    } else {
                        Value::from(values[rng.random_range(0..values.len())].clone())
                    }
                }
                FieldGenerator::Timestamp { format } => {
                    Value::from(chrono::Utc::now().format(format).to_string())
                }
            };
            row.insert(field.name.clone(), value);
        }

        row.insert("opcode".to_string(), Value::from(self.options.opcode.clone()));
        row
    }

    /// Generates one batch, capped by the limit, and publishes it.
    /// Returns the number of rows published.
    pub fn tick(&self) -> usize {
        if self.is_paused() {
            return 0;
        }
        let mut count = self.options.batch as u64;
        if self.options.limit > 0 {
            count = count.min(self.options.limit.saturating_sub(self.generated()));
        }
        if count == 0 {
            return 0;
        }

        let rows: Vec<Row> = (0..count).map(|_| self.generate()).collect();
        self.generated.fetch_add(count, Ordering::Relaxed);
        self.publisher.add_all(rows);
        self.publisher.publish()
    }

    /// Ticks at the configured rate until the limit is reached or
    /// [`SyntheticSource::shutdown`] is called.
    pub async fn run(&self) {
        tracing::info!(
            "Event source for {} started (batch={}, rate={}ms, limit={})",
            self.publisher.window(),
            self.options.batch,
            self.options.rate_ms,
            self.options.limit
        );

        let mut interval = tokio::time::interval(self.options.rate());
        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = interval.tick() => {}
            }
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let sent = self.tick();
            if sent > 0 {
                tracing::debug!("Event source published {} rows", sent);
            }
            if self.is_done() {
                break;
            }
        }

        tracing::info!(
            "Event source for {} stopped after {} rows",
            self.publisher.window(),
            self.generated()
        );
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }
}

fn ordered<T: PartialOrd>(a: T, b: T) -> (T, T) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::Harness;
    use crate::publisher::PublisherOptions;
    use espconnect_protocol::{Field, Schema};

    fn options() -> SourceOptions {
        SourceOptions {
            fields: vec![
                GeneratedField::new("id", FieldGenerator::Sequence { start: 10 }),
                GeneratedField::new("qty", FieldGenerator::IntRange { min: 5, max: 1 }),
                GeneratedField::new("price", FieldGenerator::FloatRange { min: 2.0, max: 2.0 }),
                GeneratedField::new(
                    "sym",
                    FieldGenerator::Choice {
                        values: vec!["A".to_string(), "B".to_string()],
                    },
                ),
                GeneratedField::new(
                    "ts",
                    FieldGenerator::Timestamp {
                        format: "%Y".to_string(),
                    },
                ),
            ],
            batch: 2,
            rate_ms: 10,
            limit: 5,
            opcode: "insert".to_string(),
        }
    }

    #[test]
    fn test_generate_row() {
        let h = Harness::new();
        let source = SyntheticSource::new(
            Publisher::new(&h.engine, PublisherOptions::new("p/cq/src")),
            options(),
        );

        let first = source.generate();
        let second = source.generate();
        assert_eq!(first["id"], 10);
        assert_eq!(second["id"], 11);

        let qty = first["qty"].as_i64().unwrap();
        assert!((1..=5).contains(&qty));
        assert_eq!(first["price"], 2.0);
        assert!(["A", "B"].contains(&first["sym"].as_str().unwrap()));
        assert_eq!(first["ts"].as_str().unwrap().len(), 4);
        assert_eq!(first["opcode"], "insert");
    }

    #[test]
    fn test_options_from_yaml() {
        let yaml = r#"
fields:
  - name: id
    kind: sequence
  - name: sym
    kind: choice
    values: [IBM, SAS]
batch: 3
"#;
        let options: SourceOptions = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(options.batch, 3);
        assert_eq!(options.rate_ms, 1000);
        assert_eq!(options.opcode, "upsert");
        assert_eq!(
            options.fields[0].generator,
            FieldGenerator::Sequence { start: 1 }
        );
    }

    #[tokio::test]
    async fn test_run_publishes_until_limit() {
        let mut h = Harness::new();
        h.handshake(Some("7"));
        let publisher = Publisher::new(&h.engine, PublisherOptions::new("p/cq/src").with_id("pub1"));
        publisher.install_schema(Schema::new(vec![Field::new("id", "int64", true)]));
        let source = SyntheticSource::new(publisher.clone(), options());

        source.run().await;

        assert_eq!(source.generated(), 5);
        assert_eq!(publisher.total(), 5);
        let mut sizes = Vec::new();
        while let Some(sent) = h.try_next_sent() {
            assert_eq!(sent["publisher"]["action"], "publish");
            sizes.push(sent["publisher"]["data"].as_array().unwrap().len());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_shutdown_and_pause() {
        let h = Harness::new();
        let source = Arc::new(SyntheticSource::new(
            Publisher::new(&h.engine, PublisherOptions::new("p/cq/src")),
            SourceOptions {
                limit: 0,
                ..options()
            },
        ));

        source.set_paused(true);
        assert_eq!(source.tick(), 0);
        assert_eq!(source.generated(), 0);

        let runner = source.clone();
        let task = tokio::spawn(async move { runner.run().await });
        source.shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
