//! Table of requests waiting for a correlated response.

use crate::error::ClientError;
use espconnect_protocol::XmlElement;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Body of a correlated response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    Xml(XmlElement),
}

impl ResponseBody {
    /// The `@code` member (JSON) or `code` attribute (XML); absent means 0.
    pub fn code(&self) -> i64 {
        let raw = match self {
            ResponseBody::Json(v) => v.get("@code").or_else(|| v.get("code")).cloned(),
            ResponseBody::Xml(x) => x.attr("code").map(|c| Value::String(c.to_string())),
        };
        match raw {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(v) => Some(v),
            ResponseBody::Xml(_) => None,
        }
    }

    pub fn as_xml(&self) -> Option<&XmlElement> {
        match self {
            ResponseBody::Xml(x) => Some(x),
            ResponseBody::Json(_) => None,
        }
    }
}

pub type ResponseResult = Result<ResponseBody, ClientError>;

/// One-shot handlers keyed by correlation id.
///
/// A handler is removed from the table before it is resolved, so it fires at
/// most once whichever path resolves it.
#[derive(Default)]
pub struct PendingRequests {
    handlers: Mutex<HashMap<String, oneshot::Sender<ResponseResult>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id` and returns the receiving end. A previous handler under
    /// the same id is dropped, which fails its waiter with `ConnectionClosed`.
    pub fn register(&self, id: &str) -> oneshot::Receiver<ResponseResult> {
        let (tx, rx) = oneshot::channel();
        if self.handlers.lock().insert(id.to_string(), tx).is_some() {
            tracing::warn!("Replacing pending handler for id={}", id);
        }
        rx
    }

    /// Delivers a result. Returns false when no handler was waiting.
    pub fn resolve(&self, id: &str, result: ResponseResult) -> bool {
        let handler = self.handlers.lock().remove(id);
        match handler {
            Some(tx) => {
                if tx.send(result).is_err() {
                    tracing::debug!("Waiter for id={} went away", id);
                }
                true
            }
            None => {
                tracing::debug!("No pending request for id={}", id);
                false
            }
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        self.handlers.lock().remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.handlers.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }

    /// Fails every waiter, leaving the table empty. Returns how many were failed.
    pub fn fail_all(&self, error: impl Fn() -> ClientError) -> usize {
        let drained: Vec<_> = self.handlers.lock().drain().collect();
        let count = drained.len();
        if count > 0 {
            tracing::debug!("Failing {} pending requests", count);
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(error()));
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_fires_once() {
        let pending = PendingRequests::new();
        let rx = pending.register("r1");
        assert!(pending.contains("r1"));

        assert!(pending.resolve("r1", Ok(ResponseBody::Json(json!({"@code": 0})))));
        assert!(!pending.contains("r1"));
        assert!(!pending.resolve("r1", Ok(ResponseBody::Json(json!({})))));

        let body = rx.await.unwrap().unwrap();
        assert_eq!(body.code(), 0);
    }

    #[tokio::test]
    async fn test_error_path_removes_handler() {
        let pending = PendingRequests::new();
        let rx = pending.register("r2");
        pending.resolve(
            "r2",
            Err(ClientError::Server {
                text: "bad".to_string(),
                details: vec![],
            }),
        );
        assert!(pending.is_empty());
        assert!(matches!(rx.await.unwrap(), Err(ClientError::Server { .. })));
    }

    #[test]
    fn test_unknown_id_is_ignored() {
        let pending = PendingRequests::new();
        assert!(!pending.resolve("ghost", Ok(ResponseBody::Json(json!({})))));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_fail_all() {
        let pending = PendingRequests::new();
        let a = pending.register("a");
        let b = pending.register("b");
        assert_eq!(pending.fail_all(|| ClientError::ConnectionClosed), 2);
        assert!(pending.is_empty());
        assert!(matches!(a.await.unwrap(), Err(ClientError::ConnectionClosed)));
        assert!(matches!(b.await.unwrap(), Err(ClientError::ConnectionClosed)));
    }

    #[test]
    fn test_response_codes() {
        assert_eq!(ResponseBody::Json(json!({"@code": "1"})).code(), 1);
        assert_eq!(ResponseBody::Json(json!({})).code(), 0);
        let xml = XmlElement::new("response").with_attr("code", "2");
        assert_eq!(ResponseBody::Xml(xml).code(), 2);
    }
}
