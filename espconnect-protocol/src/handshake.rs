//! Plain-text header block exchanged before a connection is ready.
//!
//! The server sends `name: value` lines terminated by a blank line. The block
//! may be split over several text frames; an unterminated trailing line is
//! carried over to the next frame.

use std::collections::HashMap;
use std::fmt;

pub const STATUS_OK: u16 = 200;
pub const STATUS_UNAUTHORIZED: u16 = 401;

/// Protocol generation advertised by the server during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    V6,
    V7,
}

impl ProtocolVersion {
    /// Picks the strategy for a `version` header value.
    ///
    /// The second element is false when the value was present but not
    /// understood; such servers are treated as V7.
    pub fn from_header(value: Option<&str>) -> (ProtocolVersion, bool) {
        let Some(raw) = value else {
            return (ProtocolVersion::V6, true);
        };
        let major = raw
            .trim()
            .split(|c: char| !c.is_ascii_digit())
            .find(|part| !part.is_empty())
            .and_then(|digits| digits.parse::<u32>().ok());
        match major {
            Some(m) if m >= 7 => (ProtocolVersion::V7, true),
            Some(_) => (ProtocolVersion::V6, true),
            None => (ProtocolVersion::V7, false),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::V6 => write!(f, "v6"),
            ProtocolVersion::V7 => write!(f, "v7"),
        }
    }
}

/// Result of inspecting a terminated header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// No blank line seen yet.
    Pending,
    /// Status 200.
    Complete,
    /// Status 401 with the challenge scheme (lowercased) and raw challenge.
    Unauthorized { scheme: String, challenge: String },
    /// Any other status, or none at all.
    Other { status: Option<u16> },
}

/// Accumulated handshake headers. Names are stored lowercased.
#[derive(Debug, Clone, Default)]
pub struct HandshakeHeaders {
    headers: HashMap<String, String>,
    partial: String,
    terminated: bool,
}

impl HandshakeHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one text frame. Returns true once the terminating blank line
    /// has been seen; anything after it in the frame is ignored.
    pub fn feed(&mut self, text: &str) -> bool {
        if self.terminated {
            return true;
        }

        let mut pending = std::mem::take(&mut self.partial);
        pending.push_str(text);

        let mut rest = pending.as_str();
        while let Some(idx) = rest.find('\n') {
            let line = rest[..idx].trim_end_matches('\r');
            rest = &rest[idx + 1..];

            if line.trim().is_empty() {
                self.terminated = true;
                return true;
            }
            self.insert_line(line);
        }

        self.partial = rest.to_string();
        false
    }

    fn insert_line(&mut self, line: &str) {
        let (name, value) = match line.split_once(':') {
            Some((n, v)) => (n, v),
            None => (line, ""),
        };
        let name = name.trim().to_ascii_lowercase();
        if !name.is_empty() {
            self.headers.insert(name, value.trim().to_string());
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn status(&self) -> Option<u16> {
        self.get("status").and_then(|s| s.parse().ok())
    }

    /// The raw `www-authenticate` challenge.
    pub fn challenge(&self) -> &str {
        self.get("www-authenticate").unwrap_or("")
    }

    /// First token of the challenge, lowercased.
    pub fn auth_scheme(&self) -> String {
        self.challenge()
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_lowercase()
    }

    pub fn protocol_version(&self) -> (ProtocolVersion, bool) {
        ProtocolVersion::from_header(self.get("version"))
    }

    pub fn outcome(&self) -> HandshakeOutcome {
        if !self.terminated {
            return HandshakeOutcome::Pending;
        }
        match self.status() {
            Some(STATUS_OK) => HandshakeOutcome::Complete,
            Some(STATUS_UNAUTHORIZED) => HandshakeOutcome::Unauthorized {
                scheme: self.auth_scheme(),
                challenge: self.challenge().to_string(),
            },
            status => HandshakeOutcome::Other { status },
        }
    }

    /// Forgets everything, ready for a fresh block.
    pub fn clear(&mut self) {
        self.headers.clear();
        self.partial.clear();
        self.terminated = false;
    }

    /// Resets termination so a follow-up block (after an auth retry) can be
    /// read. Existing headers are kept and overwritten line by line.
    pub fn rearm(&mut self) {
        self.partial.clear();
        self.terminated = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_ok_block() {
        let mut h = HandshakeHeaders::new();
        assert!(h.feed("status: 200\n\n"));
        assert_eq!(h.status(), Some(200));
        assert_eq!(h.outcome(), HandshakeOutcome::Complete);
    }

    #[test]
    fn test_crlf_and_case() {
        let mut h = HandshakeHeaders::new();
        assert!(h.feed("Status: 200\r\nVersion:  7.1 \r\n\r\n"));
        assert_eq!(h.get("version"), Some("7.1"));
        assert_eq!(h.get("VERSION"), Some("7.1"));
        assert_eq!(h.protocol_version(), (ProtocolVersion::V7, true));
    }

    #[test]
    fn test_block_split_across_frames() {
        let mut h = HandshakeHeaders::new();
        assert!(!h.feed("status: 4"));
        assert_eq!(h.outcome(), HandshakeOutcome::Pending);
        assert!(!h.feed("01\nwww-authenticate: Bearer realm=\"esp\"\n"));
        assert!(h.feed("\n"));
        assert_eq!(
            h.outcome(),
            HandshakeOutcome::Unauthorized {
                scheme: "bearer".to_string(),
                challenge: "Bearer realm=\"esp\"".to_string(),
            }
        );
    }

    #[test]
    fn test_line_without_colon() {
        let mut h = HandshakeHeaders::new();
        h.feed("flag\nstatus: 200\n\n");
        assert_eq!(h.get("flag"), Some(""));
    }

    #[test]
    fn test_value_keeps_inner_colons() {
        let mut h = HandshakeHeaders::new();
        h.feed("location: http://host:8080/x\n\n");
        assert_eq!(h.get("location"), Some("http://host:8080/x"));
    }

    #[test]
    fn test_other_status() {
        let mut h = HandshakeHeaders::new();
        h.feed("status: 500\n\n");
        assert_eq!(h.outcome(), HandshakeOutcome::Other { status: Some(500) });

        let mut h = HandshakeHeaders::new();
        h.feed("server: esp\n\n");
        assert_eq!(h.outcome(), HandshakeOutcome::Other { status: None });
    }

    #[test]
    fn test_rearm_and_clear() {
        let mut h = HandshakeHeaders::new();
        h.feed("status: 401\nwww-authenticate: basic\n\n");
        h.rearm();
        assert!(!h.is_terminated());
        h.feed("status: 200\n\n");
        assert_eq!(h.outcome(), HandshakeOutcome::Complete);
        assert_eq!(h.get("www-authenticate"), Some("basic"));

        h.clear();
        assert!(h.is_empty());
        assert_eq!(h.outcome(), HandshakeOutcome::Pending);
    }

    #[test]
    fn test_version_detection() {
        assert_eq!(ProtocolVersion::from_header(None), (ProtocolVersion::V6, true));
        assert_eq!(
            ProtocolVersion::from_header(Some("7.0")),
            (ProtocolVersion::V7, true)
        );
        assert_eq!(
            ProtocolVersion::from_header(Some("v8")),
            (ProtocolVersion::V7, true)
        );
        assert_eq!(
            ProtocolVersion::from_header(Some("6.2")),
            (ProtocolVersion::V6, true)
        );
        assert_eq!(
            ProtocolVersion::from_header(Some("unknown")),
            (ProtocolVersion::V7, false)
        );
    }
}
