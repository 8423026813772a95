//! Callback interfaces for connection owners and subscribers.
//!
//! Every method except the primary one has an empty default, so an
//! implementor only writes the capabilities it has.

use crate::connection::Connection;
use crate::datasource::{Datasource, Row};
use crate::error::ClientError;
use crate::publisher::Publisher;
use crate::stats::{LogEntry, StatsSnapshot};
use espconnect_protocol::{HandshakeHeaders, Schema};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;

/// Receives transport events from a [`Connection`].
pub trait ConnectionDelegate: Send + Sync {
    /// The socket opened; the handshake has not run yet.
    fn ready(&self) {}

    fn handshake_complete(&self, _headers: &HandshakeHeaders) {}

    /// A text frame received after the handshake.
    fn message(&self, _text: &str) {}

    /// A decoded binary frame.
    fn data(&self, _value: Value) {}

    fn closed(&self) {}

    fn error(&self, _error: &ClientError) {}

    /// Capability used when the server asks for credentials and none are set.
    fn authenticator(&self) -> Option<&dyn Authenticator> {
        None
    }
}

/// Supplies credentials on a 401 challenge, typically by calling
/// [`Connection::set_bearer`] or [`Connection::set_basic`].
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, connection: &Connection, scheme: &str);
}

pub trait DatasourceDelegate: Send + Sync {
    /// `rows` are the entries of the last delivery; `cleared` is true when the
    /// cached data was replaced rather than updated.
    fn data_changed(&self, source: &dyn Datasource, rows: &[Row], cleared: bool);

    fn info_changed(&self, _source: &dyn Datasource) {}

    fn filter_changed(&self, _source: &dyn Datasource) {}

    fn selection_changed(&self, _source: &dyn Datasource) {}
}

impl<F> DatasourceDelegate for F
where
    F: Fn(&dyn Datasource, &[Row], bool) + Send + Sync,
{
    fn data_changed(&self, source: &dyn Datasource, rows: &[Row], cleared: bool) {
        self(source, rows, cleared)
    }
}

/// Object a schema was installed on.
#[derive(Clone, Copy)]
pub enum SchemaSource<'a> {
    Datasource(&'a dyn Datasource),
    Publisher(&'a Publisher),
}

impl SchemaSource<'_> {
    pub fn id(&self) -> &str {
        match self {
            SchemaSource::Datasource(d) => d.id(),
            SchemaSource::Publisher(p) => p.id(),
        }
    }
}

pub trait SchemaDelegate: Send + Sync {
    fn schema_set(&self, source: SchemaSource<'_>, schema: &Schema);
}

pub trait StatsDelegate: Send + Sync {
    fn handle_stats(&self, stats: &StatsSnapshot);
}

impl<F> StatsDelegate for F
where
    F: Fn(&StatsSnapshot) + Send + Sync,
{
    fn handle_stats(&self, stats: &StatsSnapshot) {
        self(stats)
    }
}

pub trait LogDelegate: Send + Sync {
    fn handle_log(&self, entry: &LogEntry);
}

impl<F> LogDelegate for F
where
    F: Fn(&LogEntry) + Send + Sync,
{
    fn handle_log(&self, entry: &LogEntry) {
        self(entry)
    }
}

/// Notified when projects are loaded or removed on the server.
pub trait ProjectUpdateDelegate: Send + Sync {
    fn project_loaded(&self, _name: &str) {}
    fn project_removed(&self, _name: &str) {}
}

/// Ordered listener list. Callbacks run on a snapshot so listeners may add
/// or remove themselves while being notified.
pub(crate) struct Delegates<T: ?Sized> {
    list: RwLock<Vec<Arc<T>>>,
}

impl<T: ?Sized> Default for Delegates<T> {
    fn default() -> Self {
        Self {
            list: RwLock::new(Vec::new()),
        }
    }
}

impl<T: ?Sized> Delegates<T> {
    /// Adds a listener once. Returns the new count, or `None` if it was
    /// already registered.
    pub fn add(&self, delegate: Arc<T>) -> Option<usize> {
        let mut list = self.list.write();
        if list.iter().any(|d| same(d, &delegate)) {
            return None;
        }
        list.push(delegate);
        Some(list.len())
    }

    /// Removes a listener. Returns the remaining count, or `None` if it was
    /// not registered.
    pub fn remove(&self, delegate: &Arc<T>) -> Option<usize> {
        let mut list = self.list.write();
        let pos = list.iter().position(|d| same(d, delegate))?;
        list.remove(pos);
        Some(list.len())
    }

    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.list.read().clone()
    }

    pub fn len(&self) -> usize {
        self.list.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.read().is_empty()
    }
}

fn same<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Named: Send + Sync {
        fn name(&self) -> &str;
    }

    struct N(&'static str);

    impl Named for N {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn test_add_is_idempotent() {
        let delegates: Delegates<dyn Named> = Delegates::default();
        let a: Arc<dyn Named> = Arc::new(N("a"));
        let b: Arc<dyn Named> = Arc::new(N("b"));

        assert_eq!(delegates.add(a.clone()), Some(1));
        assert_eq!(delegates.add(a.clone()), None);
        assert_eq!(delegates.add(b.clone()), Some(2));

        let names: Vec<_> = delegates
            .snapshot()
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_remove() {
        let delegates: Delegates<dyn Named> = Delegates::default();
        let a: Arc<dyn Named> = Arc::new(N("a"));
        let stranger: Arc<dyn Named> = Arc::new(N("a"));

        delegates.add(a.clone());
        assert_eq!(delegates.remove(&stranger), None);
        assert_eq!(delegates.remove(&a), Some(0));
        assert!(delegates.is_empty());
        assert_eq!(delegates.remove(&a), None);
    }
}
